//! Suspension descriptors.
//!
//! A step that cannot make progress registers a [`ResumeEntry`] on the
//! instance and hands a copy back to the driver as its suspension token.
//! Entries are keyed by a resume id derived from the step id and a
//! caller-chosen key, so re-entering a step finds the entry it registered
//! the first time instead of adding a duplicate.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Build the resume id for `key` registered from `step`.
///
/// ```
/// assert_eq!(flowstate::suspend::resume_id("wait", "delay"), "wait:delay");
/// ```
pub fn resume_id(step: &str, key: &str) -> String {
    format!("{step}:{key}")
}

/// A reason the instance is parked, as stored in `pendingResumeEntries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResumeEntry {
    /// Resume no earlier than `resume_after` (unix millis).
    #[serde(rename_all = "camelCase")]
    Timer {
        resume_id: String,
        resume_after: i64,
        /// Set once the deadline passed and a wait call or resume observed it.
        #[serde(default, skip_serializing_if = "is_false")]
        fired: bool,
    },
    /// Resume when an external event matching `filter_criteria` is delivered.
    #[serde(rename_all = "camelCase")]
    Event {
        resume_id: String,
        filter_criteria: Value,
        /// The delivered payload; `Some(Value::Null)` for an empty delivery.
        #[serde(
            default,
            deserialize_with = "deserialize_some",
            skip_serializing_if = "Option::is_none"
        )]
        resumed_value: Option<Value>,
    },
}

impl ResumeEntry {
    pub(crate) fn timer(resume_id: String, resume_after: i64) -> Self {
        ResumeEntry::Timer {
            resume_id,
            resume_after,
            fired: false,
        }
    }

    pub(crate) fn event(resume_id: String, filter_criteria: Value) -> Self {
        ResumeEntry::Event {
            resume_id,
            filter_criteria,
            resumed_value: None,
        }
    }

    /// The resume id callers pass back to `resume`.
    pub fn resume_id(&self) -> &str {
        match self {
            ResumeEntry::Timer { resume_id, .. } | ResumeEntry::Event { resume_id, .. } => resume_id,
        }
    }

    /// Deadline in unix millis, for timers.
    pub fn resume_after(&self) -> Option<i64> {
        match self {
            ResumeEntry::Timer { resume_after, .. } => Some(*resume_after),
            ResumeEntry::Event { .. } => None,
        }
    }

    /// Filter criteria, for events.
    pub fn filter_criteria(&self) -> Option<&Value> {
        match self {
            ResumeEntry::Event {
                filter_criteria, ..
            } => Some(filter_criteria),
            ResumeEntry::Timer { .. } => None,
        }
    }

    /// Whether the entry no longer blocks its step.
    pub fn is_resolved(&self) -> bool {
        match self {
            ResumeEntry::Timer { fired, .. } => *fired,
            ResumeEntry::Event { resumed_value, .. } => resumed_value.is_some(),
        }
    }

    pub fn is_timer(&self) -> bool {
        matches!(self, ResumeEntry::Timer { .. })
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ResumeEntry::Event { .. })
    }

    /// Whether this entry was registered by `step`.
    pub(crate) fn belongs_to(&self, step: &str) -> bool {
        self.resume_id()
            .strip_prefix(step)
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

/// Handle returned by `wait_for_event`.
///
/// A handler polls [`value`](Self::value) to see whether the event arrived and
/// yields [`suspension`](Self::suspension) when it has not.
#[derive(Debug, Clone)]
pub struct EventWait {
    entry: ResumeEntry,
}

impl EventWait {
    pub(crate) fn new(entry: ResumeEntry) -> Self {
        Self { entry }
    }

    pub fn resume_id(&self) -> &str {
        self.entry.resume_id()
    }

    /// The delivered payload, if the event has been resumed.
    pub fn value(&self) -> Option<&Value> {
        match &self.entry {
            ResumeEntry::Event { resumed_value, .. } => resumed_value.as_ref(),
            ResumeEntry::Timer { .. } => None,
        }
    }

    /// The token to suspend on while the event is outstanding.
    pub fn suspension(&self) -> Option<ResumeEntry> {
        (!self.entry.is_resolved()).then(|| self.entry.clone())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Distinguishes an explicit `null` from an absent field.
pub(crate) fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
