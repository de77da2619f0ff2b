use chrono::DateTime;
use sluice_core::{Error, EventTime, Record, Result, TimestampExtractor};

/// What to do when a record carries no parseable event time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampPolicy {
    /// Use the partition's current watermark, or the ingestion hint before it has one.
    #[default]
    FallbackToPartitionTime,
    /// Reject the record; the executor drops and counts it.
    Fail,
}

impl TimestampPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fallback" => Ok(Self::FallbackToPartitionTime),
            "fail" => Ok(Self::Fail),
            other => Err(Error::Config(format!("unknown timestamp policy: {other}"))),
        }
    }
}

/// Reads event time from a JSON field: an RFC3339 string or an epoch-ms number.
///
/// `field` is a top-level name, or a JSON pointer when it starts with `/`.
#[derive(Debug, Clone)]
pub struct FieldTimestampExtractor {
    field: String,
    policy: TimestampPolicy,
}

impl FieldTimestampExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            policy: TimestampPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TimestampPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn embedded(&self, record: &Record) -> Option<EventTime> {
        let raw = if self.field.starts_with('/') {
            record.value.pointer(&self.field)
        } else {
            record.value.get(&self.field)
        }?;
        match raw {
            serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| EventTime(dt.timestamp_millis())),
            serde_json::Value::Number(n) => n.as_i64().map(EventTime),
            _ => None,
        }
    }
}

impl TimestampExtractor for FieldTimestampExtractor {
    fn extract(&self, record: &Record, partition_time: Option<EventTime>) -> Result<EventTime> {
        if let Some(ts) = self.embedded(record) {
            return Ok(ts);
        }
        match self.policy {
            TimestampPolicy::FallbackToPartitionTime => Ok(partition_time.unwrap_or(record.event_time)),
            TimestampPolicy::Fail => Err(Error::Extraction(format!(
                "field {:?} missing or unparseable for key {}",
                self.field,
                record.key_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vital(value: serde_json::Value) -> Record {
        Record::new("body-temp-events", "patient-1", value, EventTime(99))
    }

    #[test]
    fn parses_rfc3339_and_epoch_millis() {
        let ex = FieldTimestampExtractor::new("timestamp");
        let r = vital(serde_json::json!({"timestamp": "2023-11-14T22:13:20.000Z", "temperature": 101.2}));
        assert_eq!(ex.extract(&r, None).unwrap(), EventTime(1_700_000_000_000));
        let r = vital(serde_json::json!({"timestamp": 1_700_000_000_500i64}));
        assert_eq!(ex.extract(&r, None).unwrap(), EventTime(1_700_000_000_500));
    }

    #[test]
    fn nested_pointer_field() {
        let ex = FieldTimestampExtractor::new("/reported/timestamp");
        let r = vital(serde_json::json!({"reported": {"timestamp": 5}}));
        assert_eq!(ex.extract(&r, None).unwrap(), EventTime(5));
    }

    #[test]
    fn falls_back_to_partition_time_then_hint() {
        let ex = FieldTimestampExtractor::new("timestamp");
        let r = vital(serde_json::json!({"timestamp": "yesterday-ish"}));
        assert_eq!(ex.extract(&r, Some(EventTime(42))).unwrap(), EventTime(42));
        assert_eq!(ex.extract(&r, None).unwrap(), EventTime(99));
    }

    #[test]
    fn fail_policy_rejects_the_record() {
        let ex = FieldTimestampExtractor::new("timestamp").with_policy(TimestampPolicy::Fail);
        let r = vital(serde_json::json!({}));
        assert!(matches!(ex.extract(&r, Some(EventTime(42))), Err(Error::Extraction(_))));
        assert_eq!(TimestampPolicy::parse("fail").unwrap(), TimestampPolicy::Fail);
        assert!(TimestampPolicy::parse("skip").is_err());
    }
}
