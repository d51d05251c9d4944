use serde::{Deserialize, Serialize};

use crate::magnitude::ScalableFloat;

/// How long an effect lives once applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DurationPolicy {
    /// Executed once against base values and never instantiated.
    Instant,
    /// Lives until explicitly removed.
    Infinite,
    /// Lives for a level-evaluated number of seconds.
    HasDuration(ScalableFloat),
}

impl DurationPolicy {
    pub fn for_seconds(duration: impl Into<ScalableFloat>) -> Self {
        Self::HasDuration(duration.into())
    }

    pub fn is_instant(&self) -> bool {
        matches!(self, Self::Instant)
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    pub fn has_duration(&self) -> bool {
        matches!(self, Self::HasDuration(_))
    }
}

/// What happens to a paused periodic clock when inhibition clears.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InhibitionRemovedPolicy {
    /// Resume toward the tick that was pending when inhibition began.
    #[default]
    NeverReset,
    /// Restart the period from the moment inhibition cleared.
    ResetPeriod,
    /// Run one execution immediately, then restart the period.
    ExecuteAndResetPeriod,
}

/// Periodic execution settings for a non-instant effect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodicData {
    pub period: ScalableFloat,
    /// Run one execution at the moment of first application.
    pub execute_on_application: bool,
    pub inhibition_removed_policy: InhibitionRemovedPolicy,
}

impl PeriodicData {
    pub fn every_seconds(period: impl Into<ScalableFloat>) -> Self {
        Self {
            period: period.into(),
            execute_on_application: false,
            inhibition_removed_policy: InhibitionRemovedPolicy::default(),
        }
    }

    pub fn execute_on_application(mut self) -> Self {
        self.execute_on_application = true;
        self
    }

    pub fn on_inhibition_removed(mut self, policy: InhibitionRemovedPolicy) -> Self {
        self.inhibition_removed_policy = policy;
        self
    }
}
