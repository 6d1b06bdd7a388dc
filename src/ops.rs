//! Operation state machine.
//!
//! Given a [`RequiredInput`] and a live card session, [`Operation`] drives
//! the appropriate sequence of card commands and accumulates results for
//! the external OpenPGP engine. The machine owns the card channel for the
//! whole execution; all calls are blocking and strictly sequential, since
//! the physical card has no meaningful concurrency.
//!
//! The only suspension point is `AwaitingPin`: when no cached passphrase
//! exists for the key, [`Operation::run`] hands back
//! [`Outcome::PinRequired`] and the caller obtains one out-of-band, then
//! resumes via [`Operation::resume_with_pin`]. Dropping a suspended
//! operation is cancellation; cancellation while executing is not
//! supported because an APDU exchange cannot be interrupted mid-flight.

use crate::{
    card::{Card, Fingerprint, HashAlgorithm, KeySlot, Pw},
    consts::{FINGERPRINT_LEN, REMOVAL_POLL_INTERVAL},
    error::{Error, Result},
    transport::CardTransport,
    Buffer,
};
use log::{debug, info};
use std::{thread, time::SystemTime};

/// Identifies the OpenPGP key an operation concerns, and keys the
/// passphrase cache.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KeyId {
    /// Master key id of the OpenPGP key.
    pub master_key_id: u64,

    /// Subkey id the card operation addresses.
    pub sub_key_id: u64,
}

/// One subkey to provision onto the card.
#[derive(Clone, Debug)]
pub struct SubkeyImport {
    /// Card slot receiving the key.
    pub slot: KeySlot,

    /// Fingerprint of the subkey; written to the card's fingerprint data
    /// object and verified against the card after import.
    pub fingerprint: [u8; FINGERPRINT_LEN],

    /// Extended header list payload (tag 0x4D) holding the key material,
    /// built by the external OpenPGP engine.
    pub template: Buffer,
}

/// What the card operation must accomplish.
///
/// A closed set of variants dispatched exhaustively; each carries the key
/// it concerns and the operation-specific payload.
#[derive(Clone, Debug)]
pub enum RequiredInput {
    /// Unwrap encrypted session keys with the card's decryption key.
    Decrypt {
        /// Key the ciphertexts were encrypted to.
        key: KeyId,

        /// Fingerprint the card's encryption slot must hold; checked
        /// before any ciphertext is sent.
        expected_fingerprint: Option<[u8; FINGERPRINT_LEN]>,

        /// Encrypted session keys, processed sequentially.
        ciphertexts: Vec<Vec<u8>>,
    },

    /// Sign a batch of digests with the card's signature key.
    Sign {
        /// Key expected to produce the signatures.
        key: KeyId,

        /// Fingerprint the card's signature slot must hold.
        expected_fingerprint: Option<[u8; FINGERPRINT_LEN]>,

        /// (digest, algorithm) pairs; the card does not support batching,
        /// so each is a separate PSO:COMPUTE DIGITAL SIGNATURE exchange.
        digests: Vec<(Vec<u8>, HashAlgorithm)>,
    },

    /// Provision existing secret key material onto the card.
    MoveKeyToCard {
        /// Master key the subkeys belong to.
        key: KeyId,

        /// PW1 currently set on the card (the provisioning default
        /// [`crate::consts::DEFAULT_USER_PIN`] on a fresh card).
        current_user_pin: Buffer,

        /// PW3 currently set on the card (default
        /// [`crate::consts::DEFAULT_ADMIN_PIN`] on a fresh card).
        current_admin_pin: Buffer,

        /// PW1 to set once all subkeys are on the card.
        new_user_pin: Buffer,

        /// PW3 to set once all subkeys are on the card.
        new_admin_pin: Buffer,

        /// Subkeys to import, in order.
        subkeys: Vec<SubkeyImport>,
    },

    /// Wipe the card's keys and PINs and reactivate it. Irreversible; the
    /// surrounding caller must obtain explicit user confirmation first.
    ResetCard,
}

impl RequiredInput {
    fn key(&self) -> Option<KeyId> {
        match self {
            RequiredInput::Decrypt { key, .. }
            | RequiredInput::Sign { key, .. }
            | RequiredInput::MoveKeyToCard { key, .. } => Some(*key),
            RequiredInput::ResetCard => None,
        }
    }

    /// Does this operation take its PIN from the passphrase cache?
    fn uses_cached_pin(&self) -> bool {
        matches!(
            self,
            RequiredInput::Decrypt { .. } | RequiredInput::Sign { .. }
        )
    }
}

/// Append-only (input, output) accumulator handed to the external crypto
/// engine after a completed operation.
#[derive(Debug, Default)]
pub struct CryptoAccumulator {
    pairs: Vec<(Vec<u8>, Buffer)>,
    signature_time: Option<SystemTime>,
}

impl CryptoAccumulator {
    /// Record one completed card exchange.
    pub fn append(&mut self, input: Vec<u8>, output: Buffer) {
        self.pairs.push((input, output));
    }

    /// All accumulated (input, output) pairs, in execution order.
    pub fn pairs(&self) -> &[(Vec<u8>, Buffer)] {
        &self.pairs
    }

    /// Number of accumulated pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Is the accumulator empty?
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Timestamp stamped when a signing batch started, if this was a
    /// signing operation.
    pub fn signature_time(&self) -> Option<SystemTime> {
        self.signature_time
    }
}

/// External passphrase cache keyed by [`KeyId`].
///
/// Consumed via lookup; mutated via clear when a cached PIN is proven
/// wrong, so the next attempt re-prompts instead of replaying it.
pub trait PassphraseCache {
    /// Cached PIN for the key, if any.
    fn lookup(&mut self, key: &KeyId) -> Option<Buffer>;

    /// Drop the cached PIN for the key.
    fn clear(&mut self, key: &KeyId);
}

/// UI feedback hooks called by the state machine.
///
/// Implemented by the embedding layer; every method defaults to a no-op.
/// `on_error` is the sole channel by which failures reach the user, and
/// the embedder keeps full control over retry affordances: this layer
/// never retries on its own.
pub trait ProgressHooks {
    /// Execution is about to start (PIN available, card about to be used).
    fn on_pre_execute(&mut self) {}

    /// Execution finished successfully.
    fn on_post_execute(&mut self) {}

    /// Execution failed with a human-readable message.
    fn on_error(&mut self, _message: &str) {}
}

/// No-op hooks for embedders without progress UI.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl ProgressHooks for NoHooks {}

/// States of one required-input execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Waiting for a PIN (cache lookup or out-of-band entry).
    AwaitingPin,

    /// Presenting PINs to the card.
    Verifying,

    /// Driving the operation-specific command sequence.
    Executing,

    /// Finished; results handed back.
    Completed,

    /// Aborted; a failure was reported through `on_error`.
    Failed,
}

/// What a [`Operation::run`] call produced.
#[derive(Debug)]
pub enum Outcome {
    /// No cached PIN exists for the key: obtain one from the user and call
    /// [`Operation::resume_with_pin`], or drop the operation to cancel.
    PinRequired(KeyId),

    /// The operation completed; results for the crypto engine.
    Complete(CryptoAccumulator),
}

/// One required-input execution against a live card session.
pub struct Operation<'a, T, C, H>
where
    T: CardTransport,
    C: PassphraseCache,
    H: ProgressHooks,
{
    card: &'a mut Card<T>,
    cache: &'a mut C,
    hooks: &'a mut H,
    input: RequiredInput,
    pin: Option<Buffer>,
    stage: Stage,
}

impl<'a, T, C, H> Operation<'a, T, C, H>
where
    T: CardTransport,
    C: PassphraseCache,
    H: ProgressHooks,
{
    /// Set up an execution. No card traffic happens until [`Operation::run`].
    pub fn new(
        card: &'a mut Card<T>,
        input: RequiredInput,
        cache: &'a mut C,
        hooks: &'a mut H,
    ) -> Self {
        Operation {
            card,
            cache,
            hooks,
            input,
            pin: None,
            stage: Stage::AwaitingPin,
        }
    }

    /// Current state of the machine.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Seed the PIN obtained out-of-band after a
    /// [`Outcome::PinRequired`] suspension, then call [`Operation::run`]
    /// again to resume.
    pub fn resume_with_pin(&mut self, pin: Buffer) {
        self.pin = Some(pin);
    }

    /// Drive the operation as far as it can go.
    ///
    /// Returns [`Outcome::PinRequired`] when suspended for PIN entry,
    /// [`Outcome::Complete`] when done. On failure the stage is `Failed`,
    /// `on_error` has been called with a human-readable message and, for a
    /// PIN failure, the cache entry for the key has been cleared. Errors
    /// are never retried by this layer; retry is a fresh user-initiated
    /// pass through `AwaitingPin`.
    pub fn run(&mut self) -> Result<Outcome> {
        match self.stage {
            Stage::AwaitingPin => {}
            Stage::Completed | Stage::Failed => {
                return Err(Error::Connection("operation already finished".into()))
            }
            // run() is re-entered only from AwaitingPin
            Stage::Verifying | Stage::Executing => {
                return Err(Error::Connection("operation already running".into()))
            }
        }

        match self.advance() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.stage = Stage::Failed;

                if matches!(err, Error::Pin { .. }) && self.input.uses_cached_pin() {
                    if let Some(key) = self.input.key() {
                        debug!("clearing cached passphrase proven wrong");
                        self.cache.clear(&key);
                    }
                }

                self.hooks.on_error(&err.to_string());
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Outcome> {
        // AwaitingPin: decrypt and sign need a passphrase before any card
        // traffic; suspend when the cache has none.
        if self.input.uses_cached_pin() && self.pin.is_none() {
            if let Some(key) = self.input.key() {
                match self.cache.lookup(&key) {
                    Some(pin) => self.pin = Some(pin),
                    None => {
                        debug!("no cached passphrase, suspending for out-of-band entry");
                        return Ok(Outcome::PinRequired(key));
                    }
                }
            }
        }

        self.hooks.on_pre_execute();

        if !self.card.is_selected() {
            self.card.select_applet()?;
        }

        self.stage = Stage::Verifying;
        self.verify()?;

        self.stage = Stage::Executing;
        let accumulator = self.execute()?;

        self.stage = Stage::Completed;
        self.hooks.on_post_execute();
        self.wait_for_card_removal()?;

        Ok(Outcome::Complete(accumulator))
    }

    fn verify(&mut self) -> Result<()> {
        match &self.input {
            // The pin is always present past AwaitingPin; an empty PIN is
            // rejected by the card either way
            RequiredInput::Decrypt { .. } => {
                let pin = self.pin.clone().unwrap_or_default();
                self.card.verify_pin(Pw::Other, &pin)
            }
            RequiredInput::Sign { .. } => {
                let pin = self.pin.clone().unwrap_or_default();
                self.card.verify_pin(Pw::Sign, &pin)
            }
            RequiredInput::MoveKeyToCard {
                current_user_pin,
                current_admin_pin,
                ..
            } => {
                let user = current_user_pin.clone();
                let admin = current_admin_pin.clone();
                self.card.verify_pin(Pw::Other, &user)?;
                self.card.verify_pin(Pw::Admin, &admin)
            }
            RequiredInput::ResetCard => Ok(()),
        }
    }

    fn execute(&mut self) -> Result<CryptoAccumulator> {
        let mut accumulator = CryptoAccumulator::default();

        match &self.input {
            RequiredInput::Sign {
                expected_fingerprint,
                digests,
                ..
            } => {
                let expected = *expected_fingerprint;
                let digests = digests.clone();

                self.check_slot_fingerprint(KeySlot::Signature, expected)?;

                // One timestamp for the whole batch
                accumulator.signature_time = Some(SystemTime::now());

                // Fails atomically at the first card error: the partially
                // filled accumulator is dropped with this frame
                for (digest, algorithm) in digests {
                    let signature = self.card.compute_signature(&digest, algorithm)?;
                    accumulator.append(digest, Buffer::new(signature));
                }
            }

            RequiredInput::Decrypt {
                expected_fingerprint,
                ciphertexts,
                ..
            } => {
                let expected = *expected_fingerprint;
                let ciphertexts = ciphertexts.clone();

                self.check_slot_fingerprint(KeySlot::Encryption, expected)?;

                for ciphertext in ciphertexts {
                    let session_key = self.card.decipher(&ciphertext)?;
                    accumulator.append(ciphertext, session_key);
                }
            }

            RequiredInput::MoveKeyToCard {
                current_user_pin,
                current_admin_pin,
                new_user_pin,
                new_admin_pin,
                subkeys,
                ..
            } => {
                let current_user_pin = current_user_pin.clone();
                let current_admin_pin = current_admin_pin.clone();
                let new_user_pin = new_user_pin.clone();
                let new_admin_pin = new_admin_pin.clone();
                let subkeys = subkeys.clone();

                // Not transactional: the card offers no rollback, so a
                // failure from here on leaves it partially provisioned and
                // only a manual reset recovers it.
                for subkey in &subkeys {
                    info!("loading {} key onto card", subkey.slot);
                    self.card.put_key(&subkey.template)?;
                    self.card
                        .put_fingerprint(subkey.slot, &Fingerprint::new(subkey.fingerprint))?;
                }

                // Read back what the card now reports before touching PINs
                let identity = self.card.read_identity()?;
                for subkey in &subkeys {
                    match identity.fingerprint(subkey.slot) {
                        Some(fpr) if fpr.matches(&subkey.fingerprint) => {}
                        _ => return Err(Error::FingerprintMismatch { slot: subkey.slot }),
                    }
                }

                self.card
                    .change_reference_data(Pw::Other, &current_user_pin, &new_user_pin)?;
                self.card
                    .change_reference_data(Pw::Admin, &current_admin_pin, &new_admin_pin)?;
            }

            RequiredInput::ResetCard => {
                self.card.reset()?;
            }
        }

        Ok(accumulator)
    }

    /// Abort before signing or decrypting with the wrong physical key.
    fn check_slot_fingerprint(
        &mut self,
        slot: KeySlot,
        expected: Option<[u8; FINGERPRINT_LEN]>,
    ) -> Result<()> {
        let expected = match expected {
            Some(expected) => expected,
            None => return Ok(()),
        };

        let identity = self.card.read_identity()?;
        match identity.fingerprint(slot) {
            Some(fpr) if fpr.matches(&expected) => Ok(()),
            _ => Err(Error::FingerprintMismatch { slot }),
        }
    }

    /// On transports that lose the channel once the tag moves, wait for
    /// physical removal so a lingering tag cannot re-trigger a dispatch.
    fn wait_for_card_removal(&mut self) -> Result<()> {
        if self.card.transport_mut().supports_persistent_connection() {
            return Ok(());
        }

        info!("waiting for card removal");
        while self.card.transport_mut().is_card_present()? {
            thread::sleep(REMOVAL_POLL_INTERVAL);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CryptoAccumulator;
    use crate::Buffer;

    #[test]
    fn accumulator_preserves_execution_order() {
        let mut acc = CryptoAccumulator::default();
        assert!(acc.is_empty());

        acc.append(vec![1], Buffer::new(vec![10]));
        acc.append(vec![2], Buffer::new(vec![20]));

        assert_eq!(acc.len(), 2);
        assert_eq!(acc.pairs()[0].0, vec![1]);
        assert_eq!(acc.pairs()[1].1.as_slice(), &[20]);
        assert!(acc.signature_time().is_none());
    }
}
