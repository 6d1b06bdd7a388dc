//! Host-side driver for OpenPGP-card compliant security tokens.
//!
//! This crate speaks the ISO 7816 APDU command protocol to an OpenPGP card
//! application running on a smart card or NFC security token. It provides:
//!
//! - a transport abstraction ([`transport::CardTransport`]) with a PC/SC
//!   implementation, so the same protocol core runs over a card reader, an
//!   ISO-DEP NFC channel or a scripted mock;
//! - a BER-TLV decoder ([`tlv::Tlv`]) for the data objects the card returns;
//! - the fixed catalogue of card commands ([`card::Card`]): SELECT, VERIFY,
//!   GET DATA, PSO:DECIPHER, PSO:COMPUTE DIGITAL SIGNATURE, CHANGE REFERENCE
//!   DATA, PUT DATA and card termination/activation;
//! - an operation state machine ([`ops::Operation`]) that drives a complete
//!   required-input execution (decrypt, sign, move-key-to-card, reset) with
//!   PIN-cache integration and progress hooks, accumulating results for an
//!   external OpenPGP engine.
//!
//! All card transactions are synchronous, blocking calls; run them off any
//! interactive thread and deliver the [`ops::Outcome`] back over a channel
//! of your choosing. One operation exclusively owns the card channel for its
//! whole duration.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications
)]

pub mod apdu;
pub mod card;
pub mod consts;
pub mod error;
pub mod ops;
pub mod tlv;
pub mod transport;

pub use crate::{
    apdu::StatusWords,
    card::{Card, CardIdentity, Fingerprint, HashAlgorithm, KeySlot, Pw},
    error::{Error, Result},
    ops::{
        CryptoAccumulator, KeyId, NoHooks, Operation, Outcome, PassphraseCache, ProgressHooks,
        RequiredInput, Stage, SubkeyImport,
    },
    tlv::Tlv,
    transport::{CardTransport, PcscTransport},
};

use zeroize::Zeroizing;

/// A self-zeroizing byte buffer: cleared when dropped.
///
/// Used for everything that may hold secrets: PINs, key material templates
/// and decrypted session keys.
pub type Buffer = Zeroizing<Vec<u8>>;
