//! Search Filter
//!
//! The mutable, partially-specified query filter and its controller. A
//! filter update is always a merge into the existing filter, never a
//! replace, and the controller reports exactly which fields changed so the
//! session can decide which backend paths to re-issue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{SearchError, SearchResult};

/// Default bucket count for both histograms
pub const DEFAULT_GRANULARITY: u32 = 90;

/// Default entry page size
pub const DEFAULT_ENTRY_COUNT: u64 = 100;

/// Inclusive time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start instant (inclusive)
    pub start: DateTime<Utc>,
    /// End instant (inclusive)
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a new time range. Fails if `start` is after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> SearchResult<Self> {
        if start > end {
            return Err(SearchError::filter_rejected(
                "time range start is after end",
            ));
        }
        Ok(Self { start, end })
    }

    /// Check if an instant falls within this range
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }

    /// Duration in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.end.timestamp_millis() - self.start.timestamp_millis()
    }

    /// Intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }
}

/// Entry pagination window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntriesOffset {
    /// Index of the first entry to deliver
    pub index: u64,
    /// Number of entries to deliver
    pub count: u64,
}

impl Default for EntriesOffset {
    fn default() -> Self {
        Self {
            index: 0,
            count: DEFAULT_ENTRY_COUNT,
        }
    }
}

/// Fully-specified search filter, as sent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Zoom window: sub-range of the session's time range
    pub date_range: TimeRange,
    /// Entry pagination
    pub entries_offset: EntriesOffset,
    /// Bucket count for the zoom histogram
    pub zoom_granularity: u32,
    /// Bucket count for the overview histogram
    pub overview_granularity: u32,
}

/// Partial filter: unspecified fields keep their prior values on apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries_offset: Option<EntriesOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_granularity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview_granularity: Option<u32>,
}

impl FilterUpdate {
    /// Narrow the zoom window
    pub fn date_range(mut self, range: TimeRange) -> Self {
        self.date_range = Some(range);
        self
    }

    /// Change the entry page
    pub fn entries_offset(mut self, index: u64, count: u64) -> Self {
        self.entries_offset = Some(EntriesOffset { index, count });
        self
    }

    /// Change the zoom histogram bucket count
    pub fn zoom_granularity(mut self, granularity: u32) -> Self {
        self.zoom_granularity = Some(granularity);
        self
    }

    /// Change the overview histogram bucket count
    pub fn overview_granularity(mut self, granularity: u32) -> Self {
        self.overview_granularity = Some(granularity);
        self
    }
}

/// Which filter fields actually changed in an apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterDiff {
    pub date_range: bool,
    pub entries_offset: bool,
    pub zoom_granularity: bool,
    pub overview_granularity: bool,
}

impl FilterDiff {
    /// True if any field changed
    pub fn any(&self) -> bool {
        self.date_range || self.entries_offset || self.zoom_granularity || self.overview_granularity
    }

    /// True if the change requires a backend refilter request. Granularity
    /// changes re-bucket locally and never leave the client.
    pub fn needs_refilter(&self) -> bool {
        self.date_range || self.entries_offset
    }
}

/// Holds the current filter and performs validated merges
#[derive(Debug, Clone)]
pub struct FilterController {
    session_range: TimeRange,
    current: SearchFilter,
}

impl FilterController {
    /// Build the initial filter from an optional partial update, applying
    /// defaults for missing fields
    pub fn new(session_range: TimeRange, initial: Option<FilterUpdate>) -> SearchResult<Self> {
        let defaults = SearchFilter {
            date_range: session_range,
            entries_offset: EntriesOffset::default(),
            zoom_granularity: DEFAULT_GRANULARITY,
            overview_granularity: DEFAULT_GRANULARITY,
        };

        let mut controller = Self {
            session_range,
            current: defaults,
        };

        if let Some(update) = initial {
            controller.apply(&update)?;
        }

        Ok(controller)
    }

    /// The filter currently in effect
    pub fn current(&self) -> &SearchFilter {
        &self.current
    }

    /// The session's full (overview) time range
    pub fn session_range(&self) -> TimeRange {
        self.session_range
    }

    /// Merge a partial update into the current filter.
    ///
    /// Validation failures leave the current filter untouched. On success
    /// the merged filter is committed and returned along with a diff of the
    /// fields that actually changed.
    pub fn apply(&mut self, update: &FilterUpdate) -> SearchResult<(SearchFilter, FilterDiff)> {
        let (merged, diff) = self.preview(update)?;
        self.current = merged;
        Ok((merged, diff))
    }

    /// Compute the merge without committing it. Used when the change must
    /// be acknowledged by the backend before it takes effect.
    pub fn preview(&self, update: &FilterUpdate) -> SearchResult<(SearchFilter, FilterDiff)> {
        let mut candidate = self.current;

        if let Some(range) = update.date_range {
            // Clamp to the session range; a disjoint window is an error
            candidate.date_range = range.intersection(&self.session_range).ok_or_else(|| {
                SearchError::filter_rejected("date range is outside the search time range")
            })?;
        }
        if let Some(offset) = update.entries_offset {
            if offset.count == 0 {
                return Err(SearchError::filter_rejected("entry count must be nonzero"));
            }
            candidate.entries_offset = offset;
        }
        if let Some(granularity) = update.zoom_granularity {
            if granularity == 0 {
                return Err(SearchError::filter_rejected(
                    "zoom granularity must be nonzero",
                ));
            }
            candidate.zoom_granularity = granularity;
        }
        if let Some(granularity) = update.overview_granularity {
            if granularity == 0 {
                return Err(SearchError::filter_rejected(
                    "overview granularity must be nonzero",
                ));
            }
            candidate.overview_granularity = granularity;
        }

        let diff = FilterDiff {
            date_range: candidate.date_range != self.current.date_range,
            entries_offset: candidate.entries_offset != self.current.entries_offset,
            zoom_granularity: candidate.zoom_granularity != self.current.zoom_granularity,
            overview_granularity: candidate.overview_granularity
                != self.current.overview_granularity,
        };

        Ok((candidate, diff))
    }

    /// Commit a previously previewed merge
    pub(crate) fn commit(&mut self, filter: SearchFilter) {
        self.current = filter;
    }
}
