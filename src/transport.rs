//! Card transports.
//!
//! The protocol core is transport-agnostic: anything that can shuttle raw
//! APDU frames to an ISO 7816 / ISO-DEP card satisfies [`CardTransport`].
//! A PC/SC implementation is provided; NFC stacks and test mocks implement
//! the same trait.

use crate::{
    consts::CONNECT_TIMEOUT,
    error::{Error, Result},
};
use log::{info, trace, warn};
use std::{
    ffi::{CStr, CString},
    time::Instant,
};

/// A connected, exclusive channel to a physical card.
///
/// The channel is the one shared mutable resource in this crate: it is
/// acquired for the duration of a single operation and released on every
/// exit path (implementors release in `Drop`).
pub trait CardTransport {
    /// Send one raw APDU frame and block until the card responds.
    ///
    /// The returned bytes end in the 2-byte status word; the prefix is the
    /// response payload (possibly empty). Fails with a connection error on
    /// channel loss or timeout. Not interruptible mid-flight.
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>>;

    /// Is the physical card still within reach of the channel?
    fn is_card_present(&mut self) -> Result<bool>;

    /// Whether the channel stays usable across host-side context switches.
    ///
    /// PC/SC readers hold the card and return `true`. NFC channels lose the
    /// tag as soon as it moves and return `false`, which makes the state
    /// machine wait for physical removal after an operation completes so a
    /// lingering tag cannot re-trigger a dispatch.
    fn supports_persistent_connection(&self) -> bool {
        true
    }
}

/// PC/SC backed transport.
pub struct PcscTransport {
    context: pcsc::Context,
    reader: CString,
    card: pcsc::Card,
}

impl PcscTransport {
    /// Connect to the first available reader with a card present, waiting
    /// up to [`CONNECT_TIMEOUT`] for one to appear.
    pub fn open() -> Result<Self> {
        Self::open_reader(None)
    }

    /// Connect to a reader by name (needed when several are attached).
    pub fn open_reader(name: Option<&[u8]>) -> Result<Self> {
        let context = pcsc::Context::establish(pcsc::Scope::System)?;
        context.is_valid()?;

        let buffer_len = context.list_readers_len()?;
        let mut buffer = vec![0u8; buffer_len];

        for reader in context.list_readers(&mut buffer)? {
            if let Some(wanted) = name {
                if reader.to_bytes() != wanted {
                    warn!(
                        "skipping reader '{}' since it doesn't match '{}'",
                        reader.to_string_lossy(),
                        String::from_utf8_lossy(wanted)
                    );
                    continue;
                }
            }

            info!("trying to connect to reader '{}'", reader.to_string_lossy());

            wait_for_card(&context, reader)?;

            let card = context.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::T1)?;

            return Ok(PcscTransport {
                reader: reader.into(),
                card,
                context,
            });
        }

        Err(Error::Connection("no usable reader found".into()))
    }

    /// Release the channel explicitly, resetting the card.
    ///
    /// Dropping the transport also releases it; this form surfaces the
    /// disconnect error instead of swallowing it.
    pub fn close(self) -> Result<()> {
        self.card
            .disconnect(pcsc::Disposition::ResetCard)
            .map_err(|(_, err)| Error::Pcsc(err))
    }
}

impl CardTransport for PcscTransport {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        trace!(">>> {} bytes", command.len());

        let mut recv_buffer = vec![0u8; pcsc::MAX_BUFFER_SIZE];
        let len = self.card.transmit(command, &mut recv_buffer)?.len();
        recv_buffer.truncate(len);

        trace!("<<< {} bytes", recv_buffer.len());
        Ok(recv_buffer)
    }

    fn is_card_present(&mut self) -> Result<bool> {
        let mut states = [pcsc::ReaderState::new(
            self.reader.clone(),
            pcsc::State::UNAWARE,
        )];

        self.context
            .get_status_change(std::time::Duration::from_millis(1), &mut states)?;

        Ok(states[0].event_state().contains(pcsc::State::PRESENT))
    }
}

/// Block until the reader reports a card, bounded by [`CONNECT_TIMEOUT`].
fn wait_for_card(context: &pcsc::Context, reader: &CStr) -> Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut states = [pcsc::ReaderState::new(reader, pcsc::State::UNAWARE)];

    loop {
        context.get_status_change(std::time::Duration::from_millis(500), &mut states)?;

        if states[0].event_state().contains(pcsc::State::PRESENT) {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(Error::Connection("timed out waiting for a card".into()));
        }

        states[0].sync_current_state();
    }
}
