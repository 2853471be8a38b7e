//! # Watermarks
//!
//! A watermark records the window of the last complete import run of a
//! source: `start` is when that run began, `finish` when its last page
//! landed. The next incremental run asks the provider for everything
//! modified since `start`.
//!
//! A watermark only ever moves as a whole, after the final page of a run.
//! A run that dies halfway leaves it untouched, so the next run covers the
//! same window again.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::source::SourceId;

/// Lower bound used when a source has never completed a run, and for full
/// resyncs.
pub fn default_start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub source_id: SourceId,
    /// Operation the watermark belongs to, e.g. "Boundless Import"
    pub service: String,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
}

impl Watermark {
    /// A watermark for a source that has never finished a run.
    pub fn new(source_id: SourceId, service: impl Into<String>) -> Self {
        Self {
            source_id,
            service: service.into(),
            start: None,
            finish: None,
        }
    }

    /// Lower bound of the next run's window.
    ///
    /// A full resync, or a source that never completed, starts at the epoch.
    pub fn modified_since(&self, import_all: bool) -> DateTime<Utc> {
        match (import_all, self.start) {
            (false, Some(start)) => start,
            _ => default_start_time(),
        }
    }

    pub fn is_initial(&self) -> bool {
        self.start.is_none() && self.finish.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_since_uses_start() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut watermark = Watermark::new(SourceId::new(1), "Boundless Import");
        assert!(watermark.is_initial());
        assert_eq!(watermark.modified_since(false), default_start_time());

        watermark.start = Some(start);
        watermark.finish = Some(start + chrono::Duration::minutes(5));
        assert_eq!(watermark.modified_since(false), start);
        assert_eq!(watermark.modified_since(true), default_start_time());
    }

    #[test]
    fn test_default_start_is_epoch() {
        assert_eq!(default_start_time().timestamp(), 0);
    }
}
