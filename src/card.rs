//! OpenPGP card command protocol.
//!
//! [`Card`] encodes the fixed catalogue of card operations as APDU
//! command/response pairs over a [`CardTransport`], including command
//! chaining for long payloads and response reassembly via GET RESPONSE.
//! There is no hidden state beyond the transport and the selection flag.

use crate::{
    apdu::{Apdu, Ins, Response, StatusWords},
    consts::*,
    error::{Error, Result},
    tlv::Tlv,
    transport::CardTransport,
    Buffer,
};
use log::{debug, error, warn};
use std::fmt;
use subtle::ConstantTimeEq;

/// Key slots of the OpenPGP card application.
///
/// One key per slot; the fingerprint data object packs all three in this
/// fixed positional order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeySlot {
    /// Signature key (PSO:COMPUTE DIGITAL SIGNATURE)
    Signature,

    /// Decryption key (PSO:DECIPHER)
    Encryption,

    /// Authentication key (INTERNAL AUTHENTICATE)
    Authentication,
}

impl KeySlot {
    /// All slots in the positional order of the fingerprint data object.
    pub const ALL: [KeySlot; 3] = [
        KeySlot::Signature,
        KeySlot::Encryption,
        KeySlot::Authentication,
    ];

    /// Data object tag carrying this slot's fingerprint on PUT DATA.
    pub fn fingerprint_tag(self) -> u16 {
        match self {
            KeySlot::Signature => TAG_FINGERPRINT_SIG,
            KeySlot::Encryption => TAG_FINGERPRINT_DEC,
            KeySlot::Authentication => TAG_FINGERPRINT_AUT,
        }
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeySlot::Signature => "signature",
            KeySlot::Encryption => "encryption",
            KeySlot::Authentication => "authentication",
        })
    }
}

/// PIN slots addressed by VERIFY (P2 selects the slot).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pw {
    /// PW1 in signature mode (0x81)
    Sign,

    /// PW1 for decryption and other user operations (0x82)
    Other,

    /// PW3, the admin PIN (0x83)
    Admin,
}

impl Pw {
    /// P2 value selecting this PIN slot on VERIFY.
    pub fn p2(self) -> u8 {
        match self {
            Pw::Sign => 0x81,
            Pw::Other => 0x82,
            Pw::Admin => 0x83,
        }
    }

    /// P2 value for CHANGE REFERENCE DATA: PW1 (0x81) or PW3 (0x83).
    pub fn change_p2(self) -> u8 {
        match self {
            Pw::Admin => 0x83,
            _ => 0x81,
        }
    }
}

/// OpenPGP hash algorithm identifiers accepted for signing (RFC 4880 §9.4).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum HashAlgorithm {
    Sha1,
    Ripemd160,
    Sha256,
    Sha384,
    Sha512,
    Sha224,
}

impl HashAlgorithm {
    /// RFC 4880 algorithm id.
    pub fn id(self) -> u8 {
        match self {
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Ripemd160 => 3,
            HashAlgorithm::Sha256 => 8,
            HashAlgorithm::Sha384 => 9,
            HashAlgorithm::Sha512 => 10,
            HashAlgorithm::Sha224 => 11,
        }
    }

    /// Digest length in bytes this algorithm produces.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 | HashAlgorithm::Ripemd160 => 20,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

/// A 20-byte OpenPGP v4 key fingerprint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes.
    pub fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(bytes)
    }

    /// Fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Constant-time comparison against an expected fingerprint.
    pub fn matches(&self, other: &[u8; FINGERPRINT_LEN]) -> bool {
        self.0.ct_eq(other).unwrap_u8() == 1
    }

    /// An all-zero run in the fingerprint data object means "no key
    /// installed in that slot", not a fingerprint.
    fn from_slot_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; FINGERPRINT_LEN] = bytes.try_into().ok()?;
        if bytes.iter().all(|&b| b == 0) {
            None
        } else {
            Some(Fingerprint(bytes))
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::upper::encode_string(&self.0))
    }
}

/// Identity data read fresh from the card on each connection.
///
/// Never cached beyond a single operation session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CardIdentity {
    /// Full application identifier (16 bytes).
    pub aid: Vec<u8>,

    /// Key fingerprints in slot order; `None` marks an empty slot.
    pub fingerprints: [Option<Fingerprint>; 3],

    /// Cardholder name, `<` fillers already unescaped to spaces.
    pub cardholder_name: Option<String>,

    /// Login data (typically an e-mail address), raw bytes.
    pub login: Option<Vec<u8>>,
}

impl CardIdentity {
    /// Fingerprint of the key in `slot`, if one is installed.
    pub fn fingerprint(&self, slot: KeySlot) -> Option<&Fingerprint> {
        let idx = match slot {
            KeySlot::Signature => 0,
            KeySlot::Encryption => 1,
            KeySlot::Authentication => 2,
        };
        self.fingerprints[idx].as_ref()
    }
}

/// A session with the OpenPGP application on a connected card.
///
/// Exclusively owns the transport for the duration of the session. SELECT
/// must succeed before any other command; after a failed SELECT the session
/// is unusable and every command fails fast.
pub struct Card<T: CardTransport> {
    transport: T,
    selected: bool,
}

impl<T: CardTransport> Card<T> {
    /// Wrap a connected transport. No card traffic happens until
    /// [`Card::select_applet`].
    pub fn new(transport: T) -> Self {
        Card {
            transport,
            selected: false,
        }
    }

    /// Release the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Access the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Has the OpenPGP application been selected on this session?
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// SELECT the OpenPGP application by AID prefix.
    ///
    /// Must return `9000` or the session is unusable; all subsequent
    /// operations then fail fast without touching the card.
    pub fn select_applet(&mut self) -> Result<()> {
        let response = self.send(Apdu::new(Ins::Select).p1(0x04).data(AID_PREFIX))?;

        if !response.is_success() {
            error!("failed selecting OpenPGP application: {:04x}", response.code());
            return Err(Error::CardOperation {
                sw: response.code(),
            });
        }

        self.selected = true;
        Ok(())
    }

    /// Transmit a single already-built APDU.
    fn send(&mut self, apdu: &Apdu) -> Result<Response> {
        if !self.selected && apdu.ins() != Ins::Select {
            return Err(Error::Connection(
                "OpenPGP application not selected".into(),
            ));
        }

        Ok(Response::from(self.transport.transceive(&apdu.to_bytes())?))
    }

    /// Exchange a command with the card, chaining long payloads into
    /// CLA 0x10 continuation frames and reassembling long responses via
    /// GET RESPONSE while the card reports `61xx`.
    fn transfer(&mut self, ins: Ins, p1: u8, p2: u8, data: &[u8]) -> Result<Response> {
        let mut out_data = vec![];
        let mut offset = 0;

        let mut response = loop {
            let chunk = (data.len() - offset).min(APDU_DATA_MAX);
            let last = offset + chunk == data.len();

            let mut apdu = Apdu::new(ins);
            apdu.cla(if last { 0x00 } else { 0x10 }).params(p1, p2);
            if chunk > 0 {
                apdu.data(&data[offset..offset + chunk]);
            }

            let response = self.send(&apdu)?;
            offset += chunk;

            if last {
                break response;
            }

            // Continuation frames must each be accepted before the next
            if !response.is_success() {
                return Ok(response);
            }
        };

        out_data.extend_from_slice(response.data());

        while let StatusWords::BytesRemaining { len } = response.status_words() {
            debug!("card indicates {} more byte(s), fetching", len);
            response = self.send(&Apdu::new(Ins::GetResponse))?;

            if !response.is_success()
                && !matches!(response.status_words(), StatusWords::BytesRemaining { .. })
            {
                return Ok(Response::new(response.status_words(), vec![]));
            }

            out_data.extend_from_slice(response.data());
        }

        Ok(Response::new(response.status_words(), out_data))
    }

    /// VERIFY a PIN against the given slot.
    ///
    /// Any non-success status word is a PIN error; this layer never retries
    /// automatically, the caller must surface it for re-entry. After three
    /// consecutive failures the card blocks the slot (ISO 7816 VERIFY
    /// semantics).
    pub fn verify_pin(&mut self, pw: Pw, pin: &[u8]) -> Result<()> {
        let response = self.send(Apdu::new(Ins::Verify).p2(pw.p2()).data(pin))?;

        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::VerifyFail { tries } => Err(Error::Pin { tries: Some(tries) }),
            StatusWords::AuthMethodBlocked => Err(Error::Pin { tries: Some(0) }),
            _ => Err(Error::Pin { tries: None }),
        }
    }

    /// GET DATA for a single data object tag.
    pub fn get_data(&mut self, tag: u16) -> Result<Vec<u8>> {
        let response = self.transfer(Ins::GetData, (tag >> 8) as u8, tag as u8, &[])?;
        self.check(response).map(|r| r.data().to_vec())
    }

    /// Read the card's identity: AID, key fingerprints and cardholder data.
    pub fn read_identity(&mut self) -> Result<CardIdentity> {
        let aid = self.get_data(TAG_AID)?;
        if aid.len() != AID_LEN {
            warn!("unexpected AID length {} (expected {})", aid.len(), AID_LEN);
        }

        // The containers (0x6E, 0x73, 0x65) carry real constructed bits, and
        // fingerprints are arbitrary bytes: never recurse into primitives
        // here, or a block that coincidentally parses as TLV gets swallowed
        let app_data = self.get_data(TAG_APPLICATION_RELATED_DATA)?;
        let (app_tlv, _) = Tlv::parse_single(&app_data, false)?;

        let fingerprints = match app_tlv.find(TAG_FINGERPRINTS).and_then(Tlv::contents) {
            Some(block) => parse_fingerprints(block)?,
            None => {
                warn!("card reports no fingerprint data object");
                [None, None, None]
            }
        };

        let cardholder = self.get_data(TAG_CARDHOLDER_RELATED_DATA)?;
        let cardholder_name = match Tlv::parse_single(&cardholder, false) {
            Ok((tlv, _)) => tlv
                .find(TAG_CARDHOLDER_NAME)
                .and_then(Tlv::contents)
                .filter(|name| !name.is_empty())
                .map(decode_cardholder_name),
            Err(err) => {
                warn!("skipping unparseable cardholder data: {}", err);
                None
            }
        };

        let login = self.get_data(TAG_LOGIN_DATA)?;
        let login = if login.is_empty() { None } else { Some(login) };

        Ok(CardIdentity {
            aid,
            fingerprints,
            cardholder_name,
            login,
        })
    }

    /// PSO:DECIPHER — unwrap an encrypted session key.
    ///
    /// Returns the decrypted session key with the status word stripped.
    /// Requires PW1 (mode 82) to be verified in-session.
    pub fn decipher(&mut self, ciphertext: &[u8]) -> Result<Buffer> {
        // 0x00 = RSA padding indicator byte
        let mut payload = Vec::with_capacity(1 + ciphertext.len());
        payload.push(0x00);
        payload.extend_from_slice(ciphertext);

        let response = self.transfer(Ins::PerformSecurityOperation, 0x80, 0x86, &payload)?;
        self.check(response).map(Response::into_buffer)
    }

    /// PSO:COMPUTE DIGITAL SIGNATURE — sign one digest.
    ///
    /// The digest length must match what `algorithm` produces. Requires PW1
    /// (mode 81) to be verified in-session.
    pub fn compute_signature(&mut self, digest: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>> {
        if digest.len() != algorithm.digest_len() {
            return Err(Error::WrongDigestLength {
                expected: algorithm.digest_len(),
                actual: digest.len(),
            });
        }

        let response = self.transfer(Ins::PerformSecurityOperation, 0x9e, 0x9a, digest)?;
        self.check(response).map(|r| r.data().to_vec())
    }

    /// CHANGE REFERENCE DATA — replace a PIN, presenting the old one.
    pub fn change_reference_data(&mut self, pw: Pw, old: &[u8], new: &[u8]) -> Result<()> {
        let mut data = Buffer::default();
        data.extend_from_slice(old);
        data.extend_from_slice(new);

        let response = self.send(
            Apdu::new(Ins::ChangeReferenceData)
                .p2(pw.change_p2())
                .data(&data),
        )?;

        match response.status_words() {
            StatusWords::Success => Ok(()),
            StatusWords::VerifyFail { tries } => Err(Error::Pin { tries: Some(tries) }),
            StatusWords::AuthMethodBlocked => Err(Error::Pin { tries: Some(0) }),
            sw => Err(Error::CardOperation { sw: sw.code() }),
        }
    }

    /// PUT DATA (odd INS) — load a private key template into the card.
    ///
    /// `template` is the extended header list (tag 0x4D) payload built by
    /// the external OpenPGP engine. Requires PW3 to be verified in-session.
    pub fn put_key(&mut self, template: &[u8]) -> Result<()> {
        let response = self.transfer(Ins::PutDataOdd, 0x3f, 0xff, template)?;
        self.check(response).map(|_| ())
    }

    /// PUT DATA — store a key fingerprint data object for a slot.
    pub fn put_fingerprint(&mut self, slot: KeySlot, fingerprint: &Fingerprint) -> Result<()> {
        let tag = slot.fingerprint_tag();
        let response = self.transfer(
            Ins::PutData,
            (tag >> 8) as u8,
            tag as u8,
            fingerprint.as_bytes(),
        )?;
        self.check(response).map(|_| ())
    }

    /// TERMINATE DF then ACTIVATE FILE — wipe the card's keys and PINs and
    /// reinitialize it to factory state.
    ///
    /// Irreversible. Confirmation is the caller's responsibility; this
    /// layer performs none. Cards refuse TERMINATE DF until the PIN retry
    /// counters are exhausted, so those are deliberately blocked first when
    /// needed.
    pub fn reset(&mut self) -> Result<()> {
        match self.terminate() {
            Ok(()) => {}
            Err(Error::CardOperation { sw: 0x6982 }) | Err(Error::CardOperation { sw: 0x6985 }) => {
                self.block_retry_counters()?;
                self.terminate()?;
            }
            Err(err) => return Err(err),
        }

        self.activate()
    }

    fn terminate(&mut self) -> Result<()> {
        let response = self.send(&Apdu::new(Ins::TerminateDf))?;
        self.check(response).map(|_| ())
    }

    fn activate(&mut self) -> Result<()> {
        let response = self.send(&Apdu::new(Ins::ActivateFile))?;
        self.check(response).map(|_| ())
    }

    /// Exhaust the PW1 and PW3 retry counters with deliberately failing
    /// VERIFY commands so a reset can proceed.
    fn block_retry_counters(&mut self) -> Result<()> {
        // 0xFF bytes can never collide with a real PIN (PINs are printable)
        let wrong_pin = [0xffu8; 8];

        for pw in [Pw::Other, Pw::Admin] {
            for _ in 0..RETRY_COUNTER_ATTEMPTS {
                match self.verify_pin(pw, &wrong_pin) {
                    Err(Error::Pin { .. }) => continue,
                    Err(err) => return Err(err),
                    Ok(()) => {
                        // A card accepting this PIN is misbehaving badly
                        return Err(Error::CardOperation { sw: 0x6f00 });
                    }
                }
            }
        }

        Ok(())
    }

    /// Map a non-success status word to [`Error::CardOperation`].
    fn check(&self, response: Response) -> Result<Response> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(Error::CardOperation {
                sw: response.code(),
            })
        }
    }
}

/// Split the 60-byte fingerprint block into per-slot fingerprints.
///
/// Slot assignment is positional (sign, encrypt, authenticate), not
/// self-describing; the fixed order must be preserved exactly.
pub fn parse_fingerprints(block: &[u8]) -> Result<[Option<Fingerprint>; 3]> {
    if block.len() != FINGERPRINT_LEN * 3 {
        return Err(Error::MalformedTlv("fingerprint block is not 60 bytes"));
    }

    let mut slots = [None, None, None];
    for (i, chunk) in block.chunks_exact(FINGERPRINT_LEN).enumerate() {
        slots[i] = Fingerprint::from_slot_bytes(chunk);
    }

    Ok(slots)
}

/// Cardholder names use `<` as the space filler per the card specification.
fn decode_cardholder_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace('<', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Transport fed from a script of canned responses, recording every
    /// command sent.
    pub(crate) struct ScriptedTransport {
        pub sent: Vec<Vec<u8>>,
        pub responses: VecDeque<Vec<u8>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: &[&[u8]]) -> Self {
            ScriptedTransport {
                sent: vec![],
                responses: responses.iter().map(|r| r.to_vec()).collect(),
            }
        }
    }

    impl CardTransport for ScriptedTransport {
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
            self.sent.push(command.to_vec());
            self.responses
                .pop_front()
                .ok_or_else(|| Error::Connection("script exhausted".into()))
        }

        fn is_card_present(&mut self) -> Result<bool> {
            Ok(true)
        }
    }

    fn selected_card(responses: &[&[u8]]) -> Card<ScriptedTransport> {
        let mut script = vec![vec![0x90, 0x00]];
        script.extend(responses.iter().map(|r| r.to_vec()));
        let refs: Vec<&[u8]> = script.iter().map(|r| r.as_slice()).collect();
        let mut card = Card::new(ScriptedTransport::new(&refs));
        card.select_applet().unwrap();
        card
    }

    #[test]
    fn select_failure_makes_session_unusable() {
        // 6A82: application not found
        let mut card = Card::new(ScriptedTransport::new(&[&[0x6a, 0x82]]));

        assert_eq!(
            card.select_applet(),
            Err(Error::CardOperation { sw: 0x6a82 })
        );

        // No further traffic: fails before touching the transport
        let err = card.verify_pin(Pw::Other, b"123456").unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(card.transport_mut().sent.len(), 1);
    }

    #[test]
    fn verify_pin_maps_status_words() {
        let mut card = selected_card(&[&[0x63, 0xc2], &[0x69, 0x83], &[0x90, 0x00]]);

        assert_eq!(
            card.verify_pin(Pw::Other, b"111111"),
            Err(Error::Pin { tries: Some(2) })
        );
        assert_eq!(
            card.verify_pin(Pw::Other, b"111111"),
            Err(Error::Pin { tries: Some(0) })
        );
        assert_eq!(card.verify_pin(Pw::Other, b"123456"), Ok(()));
    }

    #[test]
    fn long_payloads_are_chained() {
        let template = vec![0x42u8; 600];
        let mut card = selected_card(&[&[0x90, 0x00], &[0x90, 0x00], &[0x90, 0x00]]);

        card.put_key(&template).unwrap();

        // select + 3 frames
        let sent = &card.transport_mut().sent;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1][0], 0x10);
        assert_eq!(sent[1][4], 254);
        assert_eq!(sent[2][0], 0x10);
        assert_eq!(sent[3][0], 0x00);
        assert_eq!(sent[3][4], (600 - 2 * 254) as u8);
    }

    #[test]
    fn long_responses_are_reassembled() {
        // First response carries data + 61xx, remainder arrives via GET RESPONSE
        let mut first = vec![0xaa; 100];
        first.extend_from_slice(&[0x61, 0x20]);
        let mut second = vec![0xbb; 0x20];
        second.extend_from_slice(&[0x90, 0x00]);

        let mut card = selected_card(&[&first, &second]);
        let data = card.get_data(0x5e).unwrap();

        assert_eq!(data.len(), 100 + 0x20);
        assert_eq!(&data[..100], &[0xaa; 100][..]);
        assert_eq!(&data[100..], &[0xbb; 0x20][..]);

        // The follow-up command was GET RESPONSE
        let sent = &card.transport_mut().sent;
        assert_eq!(sent[2][1], 0xc0);
    }

    #[test]
    fn fingerprint_block_decodes_positionally() {
        let mut block = vec![0x11; 20];
        block.extend_from_slice(&[0x00; 20]);
        block.extend_from_slice(&[0x33; 20]);

        let slots = parse_fingerprints(&block).unwrap();
        assert_eq!(slots[0], Some(Fingerprint::new([0x11; 20])));
        assert_eq!(slots[1], None, "all-zero run means empty slot");
        assert_eq!(slots[2], Some(Fingerprint::new([0x33; 20])));
    }

    #[test]
    fn arbitrary_fingerprint_bytes_survive_identity_decoding() {
        // A fingerprint can begin with bytes that coincidentally form a
        // valid TLV sequence; identity decoding must keep the 0xC5 block
        // opaque or a matching card would look empty.
        let mut fpr = [0xcc; 20];
        fpr[0] = 0x01;
        fpr[1] = 0x3a; // reads as tag 0x01, length 58: covers the block

        let mut block = fpr.to_vec();
        block.extend_from_slice(&[0x00; 40]);

        let mut inner = vec![0xc5, 60];
        inner.extend_from_slice(&block);
        let mut discretionary = vec![0x73, inner.len() as u8];
        discretionary.extend_from_slice(&inner);
        let mut app_data = vec![0x6e, discretionary.len() as u8];
        app_data.extend_from_slice(&discretionary);
        app_data.extend_from_slice(&[0x90, 0x00]);

        let mut aid = vec![0x42; 16];
        aid.extend_from_slice(&[0x90, 0x00]);

        let mut cardholder = vec![0x65, 0x0a, 0x5b, 0x08];
        cardholder.extend_from_slice(b"Jane<Doe");
        cardholder.extend_from_slice(&[0x90, 0x00]);

        let mut card = selected_card(&[&aid, &app_data, &cardholder, &[0x90, 0x00]]);
        let identity = card.read_identity().unwrap();

        assert_eq!(
            identity.fingerprint(KeySlot::Signature),
            Some(&Fingerprint::new(fpr))
        );
        assert_eq!(identity.fingerprint(KeySlot::Encryption), None);
        assert_eq!(identity.cardholder_name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn fingerprint_block_of_wrong_size_is_malformed() {
        assert!(parse_fingerprints(&[0u8; 40]).is_err());
    }

    #[test]
    fn cardholder_name_unescapes_fillers() {
        assert_eq!(decode_cardholder_name(b"Heinrich<Heine"), "Heinrich Heine");
    }

    #[test]
    fn wrong_digest_length_is_rejected_before_any_traffic() {
        let mut card = selected_card(&[]);
        let err = card
            .compute_signature(&[0u8; 20], HashAlgorithm::Sha256)
            .unwrap_err();
        assert_eq!(
            err,
            Error::WrongDigestLength {
                expected: 32,
                actual: 20
            }
        );
    }
}
