//! BER-TLV decoding per ISO 7816-4.
//!
//! The card's GET DATA responses are BER-TLV encoded: a tag (one or two
//! bytes), a length (short form, or long form with a length-of-length
//! prefix) and a value which itself contains nested TLV elements when the
//! tag's constructed bit is set.

use crate::error::{Error, Result};
use nom::{bytes::complete::take, number::complete::u8 as byte, IResult};

/// A BER-TLV tag.
///
/// Two-byte encoding is used when the low five bits of the first byte are
/// all ones; the constructed flag is bit 0x20 of the first byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tag(u16);

impl Tag {
    /// Numeric tag value (`0xC5`, `0x5F50`, ...).
    pub fn value(self) -> u16 {
        self.0
    }

    /// Does this tag mark a constructed element (value is nested TLVs)?
    pub fn is_constructed(self) -> bool {
        self.first_byte() & 0x20 != 0
    }

    fn first_byte(self) -> u8 {
        if self.0 > 0xff {
            (self.0 >> 8) as u8
        } else {
            self.0 as u8
        }
    }

    fn write(self, out: &mut Vec<u8>) {
        if self.0 > 0xff {
            out.push((self.0 >> 8) as u8);
        }
        out.push(self.0 as u8);
    }
}

impl From<u16> for Tag {
    fn from(value: u16) -> Self {
        Tag(value)
    }
}

/// The value of a TLV element.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    /// Raw bytes of a primitive element.
    Primitive(Vec<u8>),

    /// Child elements of a constructed element.
    Constructed(Vec<Tlv>),
}

/// One decoded BER-TLV element, possibly with nested children.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tlv {
    tag: Tag,
    value: Value,
}

impl Tlv {
    /// Decode a single top-level element from `input`.
    ///
    /// Returns the element and the unconsumed remainder of the buffer.
    /// Constructed elements are decoded recursively. With
    /// `recurse_primitive` set, primitive values that themselves parse
    /// cleanly as a TLV sequence are also decoded into children; some card
    /// firmwares nest data objects without setting the constructed bit.
    /// The heuristic cannot tell such nesting apart from opaque binary
    /// that coincidentally parses, so leave it off for data objects
    /// carrying arbitrary bytes (fingerprints, login data).
    ///
    /// Fails with [`Error::MalformedTlv`] when a declared length exceeds
    /// the remaining buffer or the tag/length encoding is truncated.
    pub fn parse_single(input: &[u8], recurse_primitive: bool) -> Result<(Self, &[u8])> {
        match node(input, recurse_primitive) {
            Ok((rest, tlv)) => Ok((tlv, rest)),
            Err(nom::Err::Incomplete(_)) => {
                Err(Error::MalformedTlv("declared length exceeds buffer"))
            }
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                Err(Error::MalformedTlv(match e.code {
                    nom::error::ErrorKind::Eof => "declared length exceeds buffer",
                    _ => "truncated or invalid element",
                }))
            }
        }
    }

    /// This element's tag.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// This element's value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Primitive contents of this element, if it has any.
    pub fn contents(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Primitive(bytes) => Some(bytes),
            Value::Constructed(_) => None,
        }
    }

    /// Child elements, empty for primitives.
    pub fn children(&self) -> &[Tlv] {
        match &self.value {
            Value::Primitive(_) => &[],
            Value::Constructed(children) => children,
        }
    }

    /// Depth-first search for `tag` over this element and all descendants.
    ///
    /// Returns the first match, or `None` when the tag is absent anywhere
    /// in the tree. Absence is not an error: callers distinguish a missing
    /// data object from one that is present but empty.
    pub fn find(&self, tag: impl Into<Tag>) -> Option<&Tlv> {
        let tag = tag.into();
        if self.tag == tag {
            return Some(self);
        }

        self.children().iter().find_map(|child| child.find(tag))
    }

    /// Re-encode this element with shortest-form lengths, reproducing the
    /// original bytes for any element the card encoded canonically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.tag.write(out);

        let value = match &self.value {
            Value::Primitive(bytes) => bytes.clone(),
            Value::Constructed(children) => {
                let mut nested = Vec::new();
                for child in children {
                    child.encode(&mut nested);
                }
                nested
            }
        };

        write_length(out, value.len());
        out.extend_from_slice(&value);
    }
}

/// Shortest-form BER length encoding.
fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x100 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

fn tag(input: &[u8]) -> IResult<&[u8], Tag> {
    let (input, first) = byte(input)?;

    if first & 0x1f == 0x1f {
        let (input, second) = byte(input)?;
        Ok((input, Tag(((first as u16) << 8) | second as u16)))
    } else {
        Ok((input, Tag(first as u16)))
    }
}

fn length(input: &[u8]) -> IResult<&[u8], usize> {
    let (input, first) = byte(input)?;

    if first < 0x80 {
        return Ok((input, first as usize));
    }

    match first & 0x7f {
        1 => {
            let (input, len) = byte(input)?;
            Ok((input, len as usize))
        }
        2 => {
            let (input, hi) = byte(input)?;
            let (input, lo) = byte(input)?;
            Ok((input, ((hi as usize) << 8) | lo as usize))
        }
        // 0x80 (indefinite) and longer forms never appear in card responses
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        ))),
    }
}

fn node(input: &[u8], recurse_primitive: bool) -> IResult<&[u8], Tlv> {
    let (input, tag) = tag(input)?;
    let (input, len) = length(input)?;
    let (input, contents) = take(len)(input)?;

    let value = if tag.is_constructed() {
        match node_list(contents, recurse_primitive) {
            Ok(children) => Value::Constructed(children),
            Err(()) => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Many0,
                )))
            }
        }
    } else if recurse_primitive {
        // Best effort: fall back to a primitive value unless the contents
        // parse exactly as a TLV sequence.
        match node_list(contents, recurse_primitive) {
            Ok(children) if !children.is_empty() => Value::Constructed(children),
            _ => Value::Primitive(contents.to_vec()),
        }
    } else {
        Value::Primitive(contents.to_vec())
    };

    Ok((input, Tlv { tag, value }))
}

/// Parse a buffer as a sequence of elements consuming it entirely.
fn node_list(mut input: &[u8], recurse_primitive: bool) -> std::result::Result<Vec<Tlv>, ()> {
    let mut children = Vec::new();

    while !input.is_empty() {
        match node(input, recurse_primitive) {
            Ok((rest, child)) => {
                children.push(child);
                input = rest;
            }
            Err(_) => return Err(()),
        }
    }

    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::{Tag, Tlv, Value};
    use crate::error::Error;

    /// Application related data layout as returned by a card: 0x6E wrapping
    /// 0x73 (discretionary data objects) wrapping 0xC5 (fingerprints).
    fn fingerprint_container(fingerprints: &[u8; 60]) -> Vec<u8> {
        let mut inner = vec![0xc5, 60];
        inner.extend_from_slice(fingerprints);

        let mut discretionary = vec![0x73, inner.len() as u8];
        discretionary.extend_from_slice(&inner);

        let mut outer = vec![0x6e, discretionary.len() as u8];
        outer.extend_from_slice(&discretionary);
        outer
    }

    #[test]
    fn parses_nested_constructed_elements() {
        let buf = fingerprint_container(&[0xab; 60]);
        let (tlv, rest) = Tlv::parse_single(&buf, false).unwrap();

        assert!(rest.is_empty());
        assert_eq!(tlv.tag().value(), 0x6e);
        assert!(tlv.tag().is_constructed());
        assert_eq!(tlv.children().len(), 1);
        assert_eq!(tlv.children()[0].tag().value(), 0x73);
    }

    #[test]
    fn find_locates_tag_at_depth_two() {
        let buf = fingerprint_container(&[0x11; 60]);
        let (tlv, _) = Tlv::parse_single(&buf, false).unwrap();

        let fprs = tlv.find(0xc5).expect("fingerprint DO present");
        assert_eq!(fprs.contents().unwrap(), &[0x11; 60][..]);
    }

    #[test]
    fn find_absent_tag_returns_none() {
        let buf = fingerprint_container(&[0x11; 60]);
        let (tlv, _) = Tlv::parse_single(&buf, false).unwrap();

        assert!(tlv.find(0xc4).is_none());
    }

    #[test]
    fn round_trips_original_bytes() {
        let cases: Vec<Vec<u8>> = vec![
            fingerprint_container(&[0x42; 60]),
            // primitive with long-form (0x81) length
            {
                let mut buf = vec![0x5e, 0x81, 0x80];
                buf.extend_from_slice(&[0x07; 0x80]);
                buf
            },
            // two-byte tag (0x5F50, public key URL)
            vec![0x5f, 0x50, 0x03, b'a', b'b', b'c'],
            // empty value
            vec![0xc5, 0x00],
        ];

        for case in cases {
            let (tlv, rest) = Tlv::parse_single(&case, false).unwrap();
            assert!(rest.is_empty());
            assert_eq!(tlv.to_bytes(), case);
        }
    }

    #[test]
    fn declared_length_exceeding_buffer_is_malformed() {
        let buf = [0xc5, 0x40, 0xaa, 0xbb];
        assert_eq!(
            Tlv::parse_single(&buf, false),
            Err(Error::MalformedTlv("declared length exceeds buffer"))
        );
    }

    #[test]
    fn truncated_length_is_malformed() {
        assert!(Tlv::parse_single(&[0xc5], false).is_err());
        assert!(Tlv::parse_single(&[0x5f], false).is_err());
        assert!(Tlv::parse_single(&[0xc5, 0x81], false).is_err());
    }

    #[test]
    fn recurse_primitive_keeps_unparseable_values_primitive() {
        // Value is not a TLV sequence; must stay primitive even when
        // recursion into primitives is requested.
        let buf = [0x5e, 0x03, b'f', b'o', b'o'];
        let (tlv, _) = Tlv::parse_single(&buf, true).unwrap();
        assert_eq!(tlv.value(), &Value::Primitive(b"foo".to_vec()));
    }

    #[test]
    fn two_byte_tag_constructed_bit() {
        assert!(Tag::from(0x6eu16).is_constructed());
        assert!(!Tag::from(0xc5u16).is_constructed());
        assert!(!Tag::from(0x5f50u16).is_constructed());
        assert!(Tag::from(0x7f49u16).is_constructed());
    }
}
