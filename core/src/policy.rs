//! Automatic extension decisions.
//!
//! Pure functions over point-in-time snapshots: nothing here reads a clock,
//! takes a lock, or touches the scheduler. The operation loop gathers the
//! inputs, this module answers, and the extension gate applies the result.

use std::fmt;
use std::time::Duration;

/// Fraction of the effective budget that must be spent before an automatic
/// extension is considered, kept as a ratio so the comparison stays in
/// integer math.
const TRIGGER_NUM: u128 = 7;
const TRIGGER_DEN: u128 = 10;

/// Inputs to one automatic extension decision.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs {
    pub elapsed: Duration,
    pub original_duration: Duration,
    pub total_extension: Duration,
    /// Time since the last event observed on the assistant stream.
    pub last_event_age: Duration,
    pub activity_window: Duration,
    pub max_total_duration: Duration,
    pub extension_step: Duration,
    pub is_busy: bool,
    pub is_finished: bool,
    pub is_cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionVerdict {
    Extend,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotBusy,
    Finished,
    Cancelled,
    BelowThreshold,
    NoRecentActivity,
    CeilingReached,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::NotBusy => "not_busy",
            SkipReason::Finished => "finished",
            SkipReason::Cancelled => "cancelled",
            SkipReason::BelowThreshold => "below_threshold",
            SkipReason::NoRecentActivity => "no_recent_activity",
            SkipReason::CeilingReached => "ceiling_reached",
        };
        f.write_str(label)
    }
}

/// Decides whether the budget should grow by one step. Extends only when
/// every gate passes; the first failing gate names the skip reason.
///
/// The 70% threshold is recomputed against the current effective duration
/// (original plus extensions already granted), so repeated extensions keep
/// triggering at 70% of each new total.
pub fn evaluate(inputs: PolicyInputs) -> ExtensionVerdict {
    if !inputs.is_busy {
        return ExtensionVerdict::Skip(SkipReason::NotBusy);
    }
    if inputs.is_finished {
        return ExtensionVerdict::Skip(SkipReason::Finished);
    }
    if inputs.is_cancelled {
        return ExtensionVerdict::Skip(SkipReason::Cancelled);
    }

    let effective = inputs.original_duration + inputs.total_extension;
    if inputs.elapsed.as_millis() * TRIGGER_DEN < effective.as_millis() * TRIGGER_NUM {
        return ExtensionVerdict::Skip(SkipReason::BelowThreshold);
    }
    if inputs.last_event_age >= inputs.activity_window {
        return ExtensionVerdict::Skip(SkipReason::NoRecentActivity);
    }
    if inputs.elapsed + inputs.extension_step > inputs.max_total_duration {
        return ExtensionVerdict::Skip(SkipReason::CeilingReached);
    }
    ExtensionVerdict::Extend
}
