use crate::{EventTime, Record, Result};

/// Derives the logical timestamp of a record.
///
/// `partition_time` is the current watermark of the partition the record was
/// routed to, or `None` before the partition has observed anything.
pub trait TimestampExtractor: Send + Sync {
    fn extract(&self, record: &Record, partition_time: Option<EventTime>) -> Result<EventTime>;
}

impl<F> TimestampExtractor for F
where
    F: Fn(&Record, Option<EventTime>) -> Result<EventTime> + Send + Sync,
{
    fn extract(&self, record: &Record, partition_time: Option<EventTime>) -> Result<EventTime> {
        (self)(record, partition_time)
    }
}

/// Keeps the timestamp the ingestion collaborator attached to the record.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionTime;

impl TimestampExtractor for IngestionTime {
    fn extract(&self, record: &Record, _partition_time: Option<EventTime>) -> Result<EventTime> {
        Ok(record.event_time)
    }
}

/// Per-partition watermark: the maximum event time observed so far.
///
/// Out-of-order observations never move it backwards.
#[derive(Debug, Clone, Default)]
pub struct WatermarkClock {
    max_observed: Option<EventTime>,
}

impl WatermarkClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the watermark advanced.
    pub fn observe(&mut self, ts: EventTime) -> bool {
        match self.max_observed {
            Some(max) if ts <= max => false,
            _ => {
                self.max_observed = Some(ts);
                true
            }
        }
    }

    pub fn watermark(&self) -> Option<EventTime> {
        self.max_observed
    }
}
