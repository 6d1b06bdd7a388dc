//! Application Protocol Data Unit (APDU) encoding.

use crate::{consts::APDU_DATA_MAX, Buffer};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Application Protocol Data Unit (APDU).
///
/// The command half of every exchange with the card. Immutable once built;
/// one is constructed per card operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Apdu {
    /// Instruction class; 0x10 marks a command-chaining continuation frame
    cla: u8,

    /// Instruction code
    ins: Ins,

    /// Instruction parameter 1
    p1: u8,

    /// Instruction parameter 2
    p2: u8,

    /// Command data (`Lc` is always computed as `data.len()`)
    data: Vec<u8>,
}

impl Apdu {
    /// Create a new APDU with the given instruction code.
    pub fn new(ins: impl Into<Ins>) -> Self {
        Self {
            cla: 0,
            ins: ins.into(),
            p1: 0,
            p2: 0,
            data: vec![],
        }
    }

    /// Set this APDU's class.
    pub fn cla(&mut self, value: u8) -> &mut Self {
        self.cla = value;
        self
    }

    /// Set this APDU's first parameter only.
    pub fn p1(&mut self, value: u8) -> &mut Self {
        self.p1 = value;
        self
    }

    /// Set this APDU's second parameter only.
    pub fn p2(&mut self, value: u8) -> &mut Self {
        self.p2 = value;
        self
    }

    /// Set both parameters for this APDU.
    pub fn params(&mut self, p1: u8, p2: u8) -> &mut Self {
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    /// Set the command data for this APDU.
    ///
    /// Panics if the data was already set or exceeds one frame; payloads
    /// longer than [`APDU_DATA_MAX`] are split by [`Card::transfer`].
    ///
    /// [`Card::transfer`]: crate::card::Card
    pub fn data(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        assert!(self.data.is_empty(), "APDU data already set!");

        let bytes = bytes.as_ref();

        assert!(
            bytes.len() <= APDU_DATA_MAX,
            "APDU data too long: {} (max: {})",
            bytes.len(),
            APDU_DATA_MAX
        );

        self.data.extend_from_slice(bytes);
        self
    }

    /// Instruction code of this APDU.
    pub fn ins(&self) -> Ins {
        self.ins
    }

    /// Serialize this APDU as a self-zeroizing byte buffer.
    pub fn to_bytes(&self) -> Buffer {
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins.code());
        bytes.push(self.p1);
        bytes.push(self.p2);

        // With no command data the trailing zero doubles as Le, asking the
        // card to return everything it has (case-2 commands like GET DATA)
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(self.data.as_ref());

        Zeroizing::new(bytes)
    }
}

impl Drop for Apdu {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl Zeroize for Apdu {
    fn zeroize(&mut self) {
        // Only `data` may contain secrets
        self.data.zeroize();
    }
}

/// OpenPGP card APDU instruction codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ins {
    /// SELECT (application selection by AID)
    Select,

    /// VERIFY (PIN presentation)
    Verify,

    /// CHANGE REFERENCE DATA (PIN change)
    ChangeReferenceData,

    /// RESET RETRY COUNTER (PIN unblock via resetting code)
    ResetRetryCounter,

    /// GET DATA
    GetData,

    /// PUT DATA (even instruction)
    PutData,

    /// PUT DATA (odd instruction, extended header list for key import)
    PutDataOdd,

    /// PERFORM SECURITY OPERATION (decipher / compute digital signature)
    PerformSecurityOperation,

    /// INTERNAL AUTHENTICATE
    InternalAuthenticate,

    /// GENERATE ASYMMETRIC KEY PAIR
    GenerateAsymmetric,

    /// GET RESPONSE (fetch remaining response data)
    GetResponse,

    /// TERMINATE DF (begin card wipe)
    TerminateDf,

    /// ACTIVATE FILE (complete card wipe, reinitialize)
    ActivateFile,

    /// Other/unrecognized instruction codes
    Other(u8),
}

impl Ins {
    /// Get the code that corresponds to this instruction.
    pub fn code(self) -> u8 {
        match self {
            Ins::Select => 0xa4,
            Ins::Verify => 0x20,
            Ins::ChangeReferenceData => 0x24,
            Ins::ResetRetryCounter => 0x2c,
            Ins::GetData => 0xca,
            Ins::PutData => 0xda,
            Ins::PutDataOdd => 0xdb,
            Ins::PerformSecurityOperation => 0x2a,
            Ins::InternalAuthenticate => 0x88,
            Ins::GenerateAsymmetric => 0x47,
            Ins::GetResponse => 0xc0,
            Ins::TerminateDf => 0xe6,
            Ins::ActivateFile => 0x44,
            Ins::Other(code) => code,
        }
    }
}

impl From<u8> for Ins {
    fn from(code: u8) -> Self {
        match code {
            0xa4 => Ins::Select,
            0x20 => Ins::Verify,
            0x24 => Ins::ChangeReferenceData,
            0x2c => Ins::ResetRetryCounter,
            0xca => Ins::GetData,
            0xda => Ins::PutData,
            0xdb => Ins::PutDataOdd,
            0x2a => Ins::PerformSecurityOperation,
            0x88 => Ins::InternalAuthenticate,
            0x47 => Ins::GenerateAsymmetric,
            0xc0 => Ins::GetResponse,
            0xe6 => Ins::TerminateDf,
            0x44 => Ins::ActivateFile,
            code => Ins::Other(code),
        }
    }
}

impl From<Ins> for u8 {
    fn from(ins: Ins) -> u8 {
        ins.code()
    }
}

/// Parsed card response: payload plus trailing status word.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    /// Status words
    status_words: StatusWords,

    /// Response payload, status word stripped
    data: Vec<u8>,
}

impl Response {
    /// Create a new response from the given status words and payload.
    pub fn new(status_words: StatusWords, data: Vec<u8>) -> Response {
        Response { status_words, data }
    }

    /// Get the [`StatusWords`] for this response.
    pub fn status_words(&self) -> StatusWords {
        self.status_words
    }

    /// Get the raw status word code for this response.
    pub fn code(&self) -> u16 {
        self.status_words.code()
    }

    /// Do the status words for this response indicate success?
    pub fn is_success(&self) -> bool {
        self.status_words.is_success()
    }

    /// Borrow the response payload.
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Consume this response, returning its payload as a zeroizing buffer.
    pub fn into_buffer(mut self) -> Buffer {
        Zeroizing::new(std::mem::take(&mut self.data))
    }
}

impl AsRef<[u8]> for Response {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl From<Vec<u8>> for Response {
    fn from(mut bytes: Vec<u8>) -> Self {
        if bytes.len() < 2 {
            return Response {
                status_words: StatusWords::None,
                data: bytes,
            };
        }

        let sw = StatusWords::from(
            ((bytes[bytes.len() - 2] as u16) << 8) | (bytes[bytes.len() - 1] as u16),
        );

        let len = bytes.len() - 2;
        bytes.truncate(len);

        Response {
            status_words: sw,
            data: bytes,
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl Zeroize for Response {
    fn zeroize(&mut self) {
        // Only `data` may contain secrets
        self.data.zeroize();
    }
}

/// Status Words (SW) are 2-byte values terminating every card response.
///
/// The first byte of a status word is referred to as SW1 and the second byte
/// as SW2. `9000` signals success; everything else is a card-reported error
/// or state. See ISO 7816-4 and the OpenPGP card specification, section 7.1.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatusWords {
    /// No status words present in response
    None,

    /// Successful execution
    Success,

    /// More response data is available via GET RESPONSE
    BytesRemaining {
        /// Number of bytes remaining, as indicated in the response
        len: u8,
    },

    /// Card is in termination state (wiped, awaiting ACTIVATE FILE)
    TerminationState,

    /// PIN verification failed
    VerifyFail {
        /// Remaining verification attempts
        tries: u8,
    },

    /// Wrong length (Lc inconsistent with the data field)
    WrongLength,

    /// Security status not satisfied (PIN not verified for this command)
    SecurityStatusNotSatisfied,

    /// Authentication method blocked (PIN retry counter exhausted)
    AuthMethodBlocked,

    /// Referenced data invalidated
    DataInvalid,

    /// Conditions of use not satisfied
    ConditionsNotSatisfied,

    /// Command not allowed
    CommandNotAllowed,

    /// Incorrect parameters in the command data field
    IncorrectData,

    /// File or application not found
    NotFound,

    /// Not enough memory space on the card
    NoSpace,

    /// Referenced data (e.g. PIN slot) not found
    ReferenceDataNotFound,

    /// Wrong parameters P1-P2
    WrongParameters,

    /// Instruction code not supported or invalid
    InsNotSupported,

    /// Class not supported
    ClaNotSupported,

    /// No precise diagnosis
    NoPreciseDiagnosis,

    /// Other/unrecognized status words
    Other(u16),
}

impl StatusWords {
    /// Get the numerical response code for these status words.
    pub fn code(self) -> u16 {
        match self {
            StatusWords::None => 0,
            StatusWords::BytesRemaining { len } => 0x6100 | len as u16,
            StatusWords::TerminationState => 0x6285,
            StatusWords::VerifyFail { tries } => 0x63c0 | tries as u16,
            StatusWords::WrongLength => 0x6700,
            StatusWords::SecurityStatusNotSatisfied => 0x6982,
            StatusWords::AuthMethodBlocked => 0x6983,
            StatusWords::DataInvalid => 0x6984,
            StatusWords::ConditionsNotSatisfied => 0x6985,
            StatusWords::CommandNotAllowed => 0x6986,
            StatusWords::IncorrectData => 0x6a80,
            StatusWords::NotFound => 0x6a82,
            StatusWords::NoSpace => 0x6a84,
            StatusWords::ReferenceDataNotFound => 0x6a88,
            StatusWords::WrongParameters => 0x6b00,
            StatusWords::InsNotSupported => 0x6d00,
            StatusWords::ClaNotSupported => 0x6e00,
            StatusWords::NoPreciseDiagnosis => 0x6f00,
            StatusWords::Success => 0x9000,
            StatusWords::Other(n) => n,
        }
    }

    /// Do these status words indicate success?
    pub fn is_success(self) -> bool {
        self == StatusWords::Success
    }
}

impl From<u16> for StatusWords {
    fn from(sw: u16) -> Self {
        match sw {
            0x0000 => StatusWords::None,
            sw if sw & 0xff00 == 0x6100 => StatusWords::BytesRemaining {
                len: (sw & 0x00ff) as u8,
            },
            0x6285 => StatusWords::TerminationState,
            sw if sw & 0xfff0 == 0x63c0 => StatusWords::VerifyFail {
                tries: (sw & 0x000f) as u8,
            },
            0x6700 => StatusWords::WrongLength,
            0x6982 => StatusWords::SecurityStatusNotSatisfied,
            0x6983 => StatusWords::AuthMethodBlocked,
            0x6984 => StatusWords::DataInvalid,
            0x6985 => StatusWords::ConditionsNotSatisfied,
            0x6986 => StatusWords::CommandNotAllowed,
            0x6a80 => StatusWords::IncorrectData,
            0x6a82 => StatusWords::NotFound,
            0x6a84 => StatusWords::NoSpace,
            0x6a88 => StatusWords::ReferenceDataNotFound,
            0x6b00 => StatusWords::WrongParameters,
            0x6d00 => StatusWords::InsNotSupported,
            0x6e00 => StatusWords::ClaNotSupported,
            0x6f00 => StatusWords::NoPreciseDiagnosis,
            0x9000 => StatusWords::Success,
            _ => StatusWords::Other(sw),
        }
    }
}

impl From<StatusWords> for u16 {
    fn from(sw: StatusWords) -> u16 {
        sw.code()
    }
}

impl fmt::Display for StatusWords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusWords::None => f.write_str("no status word"),
            StatusWords::Success => f.write_str("success"),
            StatusWords::BytesRemaining { len } => {
                write!(f, "{} response byte(s) remaining", len)
            }
            StatusWords::TerminationState => f.write_str("card is in termination state"),
            StatusWords::VerifyFail { tries } => {
                write!(f, "verification failed, {} attempt(s) remaining", tries)
            }
            StatusWords::WrongLength => f.write_str("wrong length"),
            StatusWords::SecurityStatusNotSatisfied => {
                f.write_str("security status not satisfied")
            }
            StatusWords::AuthMethodBlocked => f.write_str("authentication method blocked"),
            StatusWords::DataInvalid => f.write_str("referenced data invalidated"),
            StatusWords::ConditionsNotSatisfied => {
                f.write_str("conditions of use not satisfied")
            }
            StatusWords::CommandNotAllowed => f.write_str("command not allowed"),
            StatusWords::IncorrectData => f.write_str("incorrect command data"),
            StatusWords::NotFound => f.write_str("file or application not found"),
            StatusWords::NoSpace => f.write_str("not enough memory space"),
            StatusWords::ReferenceDataNotFound => f.write_str("referenced data not found"),
            StatusWords::WrongParameters => f.write_str("wrong parameters P1-P2"),
            StatusWords::InsNotSupported => f.write_str("instruction not supported"),
            StatusWords::ClaNotSupported => f.write_str("class not supported"),
            StatusWords::NoPreciseDiagnosis => f.write_str("no precise diagnosis"),
            StatusWords::Other(sw) => write!(f, "unknown status {:04x}", sw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Apdu, Ins, Response, StatusWords};

    #[test]
    fn status_words_round_trip() {
        let round_trip = |sw: StatusWords| {
            assert_eq!(StatusWords::from(sw.code()), sw);
        };

        round_trip(StatusWords::None);
        round_trip(StatusWords::Success);
        round_trip(StatusWords::BytesRemaining { len: 1 });
        round_trip(StatusWords::BytesRemaining { len: 0xFF });
        round_trip(StatusWords::TerminationState);
        round_trip(StatusWords::VerifyFail { tries: 3 });
        round_trip(StatusWords::VerifyFail { tries: 0 });
        round_trip(StatusWords::WrongLength);
        round_trip(StatusWords::SecurityStatusNotSatisfied);
        round_trip(StatusWords::AuthMethodBlocked);
        round_trip(StatusWords::DataInvalid);
        round_trip(StatusWords::ConditionsNotSatisfied);
        round_trip(StatusWords::CommandNotAllowed);
        round_trip(StatusWords::IncorrectData);
        round_trip(StatusWords::NotFound);
        round_trip(StatusWords::NoSpace);
        round_trip(StatusWords::ReferenceDataNotFound);
        round_trip(StatusWords::WrongParameters);
        round_trip(StatusWords::InsNotSupported);
        round_trip(StatusWords::ClaNotSupported);
        round_trip(StatusWords::NoPreciseDiagnosis);
        round_trip(StatusWords::Other(0x1337));
    }

    #[test]
    fn apdu_serialization_emits_trailing_le_for_empty_data() {
        let empty = Apdu::new(Ins::GetData).params(0x00, 0x6e).to_bytes();
        assert_eq!(empty.as_slice(), &[0x00, 0xca, 0x00, 0x6e, 0x00]);

        let with_data = Apdu::new(Ins::Verify)
            .params(0x00, 0x82)
            .data(b"123456")
            .to_bytes();
        assert_eq!(
            with_data.as_slice(),
            &[0x00, 0x20, 0x00, 0x82, 0x06, b'1', b'2', b'3', b'4', b'5', b'6']
        );
    }

    #[test]
    fn response_splits_trailing_status_word() {
        let response = Response::from(vec![0xde, 0xad, 0x90, 0x00]);
        assert!(response.is_success());
        assert_eq!(response.data(), &[0xde, 0xad]);

        let short = Response::from(vec![0x61]);
        assert_eq!(short.status_words(), StatusWords::None);
    }
}
