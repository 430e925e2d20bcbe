//! Output Streams
//!
//! Each search session output (entries, progress, stats, overview, zoom) is
//! an [`OutputStream`]: an ordered sequence of values with an explicit
//! terminal state. Streams are backed by tokio broadcast channels, so any
//! number of observers may subscribe independently.
//!
//! ## Termination
//!
//! `recv` yields `Ok(Some(item))` for each emission, `Ok(None)` exactly once
//! the stream completes (search finished or session disposed), and `Err` when
//! the session failed. The terminal state is latched: every call after
//! completion returns `Ok(None)`, and every call after a failure returns the
//! same error.
//!
//! ## Late subscribers
//!
//! Subscribers attached after an emission never see it — streams replay
//! nothing, only future emissions are delivered.

use tokio::sync::broadcast;

use super::error::SearchError;

/// Internal event carried on the broadcast channel
#[derive(Debug, Clone)]
pub(crate) enum StreamEvent<T> {
    Item(T),
    Complete,
    Failed(SearchError),
}

/// Sender side, owned by the session driver
#[derive(Debug)]
pub(crate) struct OutputChannel<T> {
    tx: broadcast::Sender<StreamEvent<T>>,
}

impl<T: Clone> OutputChannel<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> OutputStream<T> {
        OutputStream {
            rx: self.tx.subscribe(),
            terminal: None,
        }
    }

    /// Emit an item to all current subscribers. Emissions with no
    /// subscribers are dropped, matching the no-replay contract.
    pub(crate) fn emit(&self, item: T) {
        let _ = self.tx.send(StreamEvent::Item(item));
    }

    pub(crate) fn complete(&self) {
        let _ = self.tx.send(StreamEvent::Complete);
    }

    pub(crate) fn fail(&self, err: SearchError) {
        let _ = self.tx.send(StreamEvent::Failed(err));
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    Complete,
    Failed(SearchError),
}

/// An ordered, completion-aware stream of session output values
#[derive(Debug)]
pub struct OutputStream<T> {
    rx: broadcast::Receiver<StreamEvent<T>>,
    terminal: Option<Terminal>,
}

impl<T: Clone> OutputStream<T> {
    /// Receive the next value.
    ///
    /// Returns `Ok(Some(item))` for an emission, `Ok(None)` once the stream
    /// has completed, or the session's terminal error.
    pub async fn recv(&mut self) -> Result<Option<T>, SearchError> {
        if let Some(terminal) = &self.terminal {
            return match terminal {
                Terminal::Complete => Ok(None),
                Terminal::Failed(err) => Err(err.clone()),
            };
        }

        loop {
            match self.rx.recv().await {
                Ok(StreamEvent::Item(item)) => return Ok(Some(item)),
                Ok(StreamEvent::Complete) => {
                    self.terminal = Some(Terminal::Complete);
                    return Ok(None);
                }
                Ok(StreamEvent::Failed(err)) => {
                    self.terminal = Some(Terminal::Failed(err.clone()));
                    return Err(err);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output stream lagged, emissions dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.terminal = Some(Terminal::Complete);
                    return Ok(None);
                }
            }
        }
    }

    /// Drain the stream to completion, collecting every remaining item
    pub async fn collect(&mut self) -> Result<Vec<T>, SearchError> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await? {
            items.push(item);
        }
        Ok(items)
    }
}
