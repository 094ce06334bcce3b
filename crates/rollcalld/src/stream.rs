//! Hand-off between a session thread and whoever consumes its units.

use crate::session::{SessionError, SessionHandle};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Units buffered between the session and a slow consumer.
const STREAM_CAPACITY: usize = 2;

#[derive(Debug, thiserror::Error)]
#[error("stream consumer disconnected")]
pub struct Disconnected;

/// Where a session delivers encoded units.
pub trait OutputSink: Send {
    /// Hand over one unit without blocking. A unit the consumer has no
    /// room for may be dropped; only a gone consumer is an error.
    fn send(&mut self, unit: Vec<u8>) -> Result<(), Disconnected>;

    /// Called once when the session ends, with its terminal error if any.
    fn finish(&mut self, error: Option<SessionError>);
}

type TerminalSlot = Arc<Mutex<Option<SessionError>>>;

pub struct ChannelSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    terminal: TerminalSlot,
    dropped: u64,
}

impl OutputSink for ChannelSink {
    fn send(&mut self, unit: Vec<u8>) -> Result<(), Disconnected> {
        let Some(tx) = &self.tx else {
            return Err(Disconnected);
        };
        match tx.try_send(unit) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::trace!(dropped = self.dropped, "consumer behind, unit dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Disconnected),
        }
    }

    fn finish(&mut self, error: Option<SessionError>) {
        if let Some(error) = error {
            *self.terminal.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
        }
        if self.dropped > 0 {
            tracing::debug!(dropped = self.dropped, "units dropped for a slow consumer");
        }
        // Closing the channel after the error is stored lets the consumer
        // see both in order.
        self.tx = None;
    }
}

/// Consumer end of a streaming session. Dropping it stops the session.
pub struct FrameStream {
    rx: mpsc::Receiver<Vec<u8>>,
    terminal: TerminalSlot,
    handle: SessionHandle,
}

impl FrameStream {
    /// Next unit, or `None` once the session has ended.
    pub async fn next_unit(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Blocking variant of [`next_unit`](Self::next_unit). Must not be
    /// called from inside an async runtime.
    pub fn blocking_next_unit(&mut self) -> Option<Vec<u8>> {
        self.rx.blocking_recv()
    }

    /// The session's terminal error. Yields it at most once.
    pub fn take_error(&self) -> Option<SessionError> {
        self.terminal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

/// A connected sink/stream pair for the session behind `handle`.
pub fn channel(handle: SessionHandle) -> (ChannelSink, FrameStream) {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
    let terminal = TerminalSlot::default();
    (
        ChannelSink {
            tx: Some(tx),
            terminal: Arc::clone(&terminal),
            dropped: 0,
        },
        FrameStream { rx, terminal, handle },
    )
}
