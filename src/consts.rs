//! Protocol constants for the OpenPGP card application.

use std::time::Duration;

/// OpenPGP application identifier prefix used by SELECT.
///
/// The full AID is 16 bytes (RID + application + version + manufacturer +
/// serial); selection matches on this 6-byte prefix.
pub const AID_PREFIX: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// Length of the full AID data object (tag 0x4F).
pub const AID_LEN: usize = 16;

/// Length of one OpenPGP v4 key fingerprint.
pub const FINGERPRINT_LEN: usize = 20;

/// Application related data container (constructed).
pub const TAG_APPLICATION_RELATED_DATA: u16 = 0x6E;

/// Fingerprints data object: three consecutive 20-byte fingerprints
/// (signature, encryption, authentication — fixed positional order).
pub const TAG_FINGERPRINTS: u16 = 0xC5;

/// Cardholder related data container (constructed).
pub const TAG_CARDHOLDER_RELATED_DATA: u16 = 0x65;

/// Cardholder name inside the cardholder related data container.
pub const TAG_CARDHOLDER_NAME: u16 = 0x5B;

/// Login data object, fetched standalone.
pub const TAG_LOGIN_DATA: u16 = 0x5E;

/// Full application identifier data object.
pub const TAG_AID: u16 = 0x4F;

/// Extended header list used by key import (PUT DATA, odd INS).
pub const TAG_EXTENDED_HEADER_LIST: u16 = 0x4D;

/// Fingerprint data objects written after key import, by slot.
pub const TAG_FINGERPRINT_SIG: u16 = 0xC7;
/// Encryption slot fingerprint data object.
pub const TAG_FINGERPRINT_DEC: u16 = 0xC8;
/// Authentication slot fingerprint data object.
pub const TAG_FINGERPRINT_AUT: u16 = 0xC9;

/// Maximum command data per APDU frame; longer payloads are chained.
pub const APDU_DATA_MAX: usize = 254;

/// Factory default user PIN (PW1).
///
/// Provisional: cards leave the factory with this PIN and the move-key flow
/// replaces it with a caller-supplied value as its final step. Never assume
/// a deployed card still uses it.
pub const DEFAULT_USER_PIN: &[u8] = b"123456";

/// Factory default admin PIN (PW3). Same caveats as [`DEFAULT_USER_PIN`].
pub const DEFAULT_ADMIN_PIN: &[u8] = b"12345678";

/// Minimum user PIN length accepted by the card.
pub const MIN_USER_PIN_LEN: usize = 6;

/// Minimum admin PIN length accepted by the card.
pub const MIN_ADMIN_PIN_LEN: usize = 8;

/// How long to wait for a card to appear on the channel.
///
/// Generous because on-card RSA key operations on slow tokens can stall the
/// channel for tens of seconds.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(100);

/// Polling interval while waiting for physical card removal after an
/// operation completes on transports without persistent connections.
pub const REMOVAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// VERIFY attempts issued against each PIN when deliberately exhausting the
/// retry counters ahead of a card reset.
pub const RETRY_COUNTER_ATTEMPTS: usize = 4;
