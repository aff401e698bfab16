use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assist::AssistTimers;

/// Persisted anti-short-cycle state of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerRecord {
    pub on_condition_timer_ms: u64,
    pub off_condition_timer_ms: u64,
    pub last_transition_ms: Option<u64>,
}

impl From<&AssistTimers> for TimerRecord {
    fn from(timers: &AssistTimers) -> Self {
        Self {
            on_condition_timer_ms: timers.on_condition_ms,
            off_condition_timer_ms: timers.off_condition_ms,
            last_transition_ms: timers.last_transition_ms,
        }
    }
}

impl From<TimerRecord> for AssistTimers {
    fn from(record: TimerRecord) -> Self {
        // A record with both timers set cannot come from this engine; keep
        // only the dwell timestamp rather than guess which one is current.
        let (on, off) = if record.on_condition_timer_ms > 0 && record.off_condition_timer_ms > 0 {
            (0, 0)
        } else {
            (record.on_condition_timer_ms, record.off_condition_timer_ms)
        };
        Self {
            on_condition_ms: on,
            off_condition_ms: off,
            last_transition_ms: record.last_transition_ms,
            active_condition: None,
        }
    }
}

pub type TimerRecords = BTreeMap<String, TimerRecord>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timer store is unavailable: {0}")]
    Unavailable(String),
    #[error("timer store data is corrupt: {0}")]
    Corrupt(String),
    #[error("timer store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed persistence of per-device timers. A missing key is not an error.
pub trait TimerStore: Send {
    fn load(&mut self) -> Result<TimerRecords, StoreError>;

    fn save(&mut self, device_id: &str, record: &TimerRecord) -> Result<(), StoreError>;

    fn remove(&mut self, device_id: &str) -> Result<(), StoreError>;

    /// Reports a failure that surfaced after `save` returned, such as a
    /// background write that did not reach the disk.
    fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTimerStore {
    pub records: TimerRecords,
    /// When set, every call fails; lets tests exercise degraded persistence.
    pub fail: bool,
    /// When set, saves are accepted but `health` reports a failed write, the
    /// way a store with a background writer would.
    pub write_failed: bool,
    pub saves: usize,
}

impl MemoryTimerStore {
    pub fn with_records(records: TimerRecords) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail {
            Err(StoreError::Unavailable("memory store set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

impl TimerStore for MemoryTimerStore {
    fn load(&mut self) -> Result<TimerRecords, StoreError> {
        self.check()?;
        Ok(self.records.clone())
    }

    fn save(&mut self, device_id: &str, record: &TimerRecord) -> Result<(), StoreError> {
        self.check()?;
        self.records.insert(device_id.to_string(), *record);
        self.saves += 1;
        Ok(())
    }

    fn remove(&mut self, device_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.records.remove(device_id);
        Ok(())
    }

    fn health(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.write_failed {
            return Err(StoreError::Unavailable("background write failed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_timer_state() {
        let timers = AssistTimers {
            on_condition_ms: 120_000,
            off_condition_ms: 0,
            last_transition_ms: Some(42),
            active_condition: None,
        };
        let restored = AssistTimers::from(TimerRecord::from(&timers));
        assert_eq!(restored, timers);
    }

    #[test]
    fn contradictory_record_keeps_only_dwell_timestamp() {
        let record = TimerRecord {
            on_condition_timer_ms: 10,
            off_condition_timer_ms: 20,
            last_transition_ms: Some(5),
        };
        let timers = AssistTimers::from(record);
        assert_eq!(timers.on_condition_ms, 0);
        assert_eq!(timers.off_condition_ms, 0);
        assert_eq!(timers.last_transition_ms, Some(5));
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let record: TimerRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(record, TimerRecord::default());
    }
}
