//! Stats Aggregation
//!
//! Consumes raw statistics/frequency frames and derives the three stats
//! views: running pipeline stats (per update), a fixed-range overview
//! histogram, and a filter-scoped zoom histogram.
//!
//! Frequency samples are stored keyed by timestamp; a re-delivered sample
//! replaces the stored one, so re-streamed scoped stats after a refilter
//! never double-count. Histograms are pure functions of the sample store,
//! a window, and a granularity, which keeps the two histograms fully
//! independent: re-bucketing one never perturbs the other.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

use super::filter::{SearchFilter, TimeRange};
use super::frames::{FrequencySample, ModuleStats};

/// Running statistics for an active search, one emission per stats frame
#[derive(Debug, Clone, PartialEq)]
pub struct SearchStats {
    /// Per-module statistics for the compiled pipeline, in execution order
    pub pipeline: Vec<ModuleStats>,
    /// Literal user query
    pub query: String,
    /// Query after server-side macro expansion
    pub effective_query: String,
    /// Caller-supplied metadata, echoed unchanged
    pub metadata: serde_json::Value,
    /// Smallest zoom window (seconds) the query's aggregation supports;
    /// fixed per query, unaffected by filter changes
    pub min_zoom_window: i64,
    /// True on the final stats emission for the search
    pub finished: bool,
    /// Filter in effect when this update was folded in
    pub filter: SearchFilter,
}

/// One histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyBucket {
    /// Start instant of the bucket
    pub timestamp: DateTime<Utc>,
    /// Entries whose timestamp falls inside the bucket
    pub count: u64,
}

/// An ordered sequence of equal-width buckets spanning a window
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyHistogram {
    /// The bucketed window
    pub range: TimeRange,
    /// Exactly `granularity` buckets; empty buckets report count 0
    pub buckets: Vec<FrequencyBucket>,
    /// For zoom histograms, the filter that scoped the window
    pub filter: Option<SearchFilter>,
}

impl FrequencyHistogram {
    /// Sum of all bucket counts
    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}

/// Sample store and bucketing engine for one search session
#[derive(Debug)]
pub(crate) struct StatsAggregator {
    session_range: TimeRange,
    /// Frequency samples keyed by millisecond timestamp; insert replaces
    samples: BTreeMap<i64, u64>,
}

impl StatsAggregator {
    pub(crate) fn new(session_range: TimeRange) -> Self {
        Self {
            session_range,
            samples: BTreeMap::new(),
        }
    }

    /// Fold a frame's frequency samples into the store
    pub(crate) fn ingest_samples(&mut self, samples: &[FrequencySample]) {
        for sample in samples {
            self.samples
                .insert(sample.timestamp.timestamp_millis(), sample.count);
        }
    }

    /// Overview histogram: always buckets the full session range
    pub(crate) fn overview(&self, granularity: u32) -> FrequencyHistogram {
        FrequencyHistogram {
            range: self.session_range,
            buckets: self.bucketize(self.session_range, granularity),
            filter: None,
        }
    }

    /// Zoom histogram: buckets the filter's date range at the filter's
    /// zoom granularity
    pub(crate) fn zoom(&self, filter: &SearchFilter) -> FrequencyHistogram {
        FrequencyHistogram {
            range: filter.date_range,
            buckets: self.bucketize(filter.date_range, filter.zoom_granularity),
            filter: Some(*filter),
        }
    }

    /// Partition `window` into `granularity` equal-width buckets and count
    /// the stored samples falling in each. The window is inclusive on both
    /// ends; every stored sample inside it lands in exactly one bucket.
    fn bucketize(&self, window: TimeRange, granularity: u32) -> Vec<FrequencyBucket> {
        let start_ms = window.start.timestamp_millis();
        let end_ms = window.end.timestamp_millis();
        // Inclusive span, so the final instant maps into the last bucket
        let span = end_ms - start_ms + 1;
        let granularity = i64::from(granularity.max(1));

        let mut counts = vec![0u64; granularity as usize];
        for (&ts, &count) in self.samples.range(start_ms..=end_ms) {
            let index = ((ts - start_ms) * granularity / span) as usize;
            counts[index] += count;
        }

        counts
            .into_iter()
            .enumerate()
            .map(|(i, count)| FrequencyBucket {
                timestamp: Utc
                    .timestamp_millis_opt(start_ms + (i as i64) * span / granularity)
                    .single()
                    .unwrap_or(window.start),
                count,
            })
            .collect()
    }
}
