//! Entry Stream Demultiplexing
//!
//! Buffers nothing and reorders nothing: entry batches are republished in
//! backend-delivery order (the backend documents descending-time order for
//! the raw renderer, and this layer must not second-guess it). The demux
//! only tracks whether the batch closing the currently active entry page
//! has arrived; a later filter change to `entries_offset` reopens delivery.

use super::frames::SearchEntry;

/// A batch of entries as delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub struct EntryBatch {
    /// Entries in backend-delivery order
    pub entries: Vec<SearchEntry>,
    /// True when this batch closes delivery for the active entry page
    pub finished: bool,
}

/// Tracks delivery state for the active `entries_offset`
#[derive(Debug, Default)]
pub(crate) struct EntryDemux {
    finished: bool,
}

impl EntryDemux {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fold in a batch; returns it unchanged for republication
    pub(crate) fn ingest(&mut self, entries: Vec<SearchEntry>, finished: bool) -> EntryBatch {
        if finished {
            self.finished = true;
        }
        EntryBatch { entries, finished }
    }

    /// True once the finished batch for the active page has been seen
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Restart delivery after an `entries_offset` change. The sequence is
    /// conceptually restarted, not resumed.
    pub(crate) fn reopen(&mut self) {
        self.finished = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: &str) -> SearchEntry {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        SearchEntry::Raw {
            data: STANDARD.encode(payload),
        }
    }

    #[test]
    fn test_batches_pass_through_in_order() {
        let mut demux = EntryDemux::new();

        let first = demux.ingest(vec![entry("a"), entry("b")], false);
        let second = demux.ingest(vec![entry("c")], false);

        assert_eq!(first.entries.len(), 2);
        assert_eq!(second.entries.len(), 1);
        assert!(!demux.is_finished());
    }

    #[test]
    fn test_finished_batch_latches() {
        let mut demux = EntryDemux::new();

        demux.ingest(vec![entry("a")], false);
        let batch = demux.ingest(vec![entry("b")], true);

        assert!(batch.finished);
        assert!(demux.is_finished());
    }

    #[test]
    fn test_reopen_restarts_delivery() {
        let mut demux = EntryDemux::new();

        demux.ingest(vec![entry("a")], true);
        assert!(demux.is_finished());

        demux.reopen();
        assert!(!demux.is_finished());

        demux.ingest(vec![entry("b")], true);
        assert!(demux.is_finished());
    }
}
