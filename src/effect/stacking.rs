use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::magnitude::ScalableInt;

bitflags! {
    /// Level relations a stacking gate reacts to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct LevelComparison: u8 {
        const EQUAL = 1;
        const HIGHER = 1 << 1;
        const LOWER = 1 << 2;
    }
}

impl Default for LevelComparison {
    fn default() -> Self {
        Self::empty()
    }
}

impl Serialize for LevelComparison {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LevelComparison {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

impl LevelComparison {
    /// The relation of `incoming` to `current`.
    pub(crate) fn relate(incoming: i32, current: i32) -> Self {
        match incoming.cmp(&current) {
            std::cmp::Ordering::Greater => Self::HIGHER,
            std::cmp::Ordering::Less => Self::LOWER,
            std::cmp::Ordering::Equal => Self::EQUAL,
        }
    }
}

/// Which applications are allowed to merge into an existing stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackPolicy {
    /// Applications merge only when they share an owner.
    AggregateBySource,
    /// Every application against the target merges.
    AggregateByTarget,
}

/// Whether applications of different levels share one stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackLevelPolicy {
    AggregateLevels,
    SegregateLevels,
}

/// Whether modifier magnitudes multiply by the stack count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackMagnitudePolicy {
    DontStack,
    Sum,
}

/// What happens to an application landing on a full stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackOverflowPolicy {
    /// The application succeeds without raising the count; refresh, period
    /// reset and execute-on-apply still run.
    AllowApplication,
    DenyApplication,
}

/// What expiry does to a multi-stack effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackExpirationPolicy {
    ClearEntireStack,
    RemoveSingleStackAndRefreshDuration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerDenialPolicy {
    AlwaysAllow,
    DenyIfDifferent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerOverridePolicy {
    KeepCurrent,
    Override,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackCountOverridePolicy {
    IncreaseStacks,
    ResetStacks,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationRefreshPolicy {
    NeverRefresh,
    RefreshOnSuccessfulApplication,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationResetPeriodPolicy {
    NeverReset,
    ResetOnSuccessfulApplication,
}

/// The full multi-axis stacking configuration.
///
/// The owner gates are mandatory under [`StackPolicy::AggregateByTarget`]
/// (cross-owner merges must say what happens to ownership) and the level
/// gates are mandatory under [`StackLevelPolicy::AggregateLevels`];
/// validation enforces both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StackingData {
    pub stack_limit: ScalableInt,
    pub initial_stack: ScalableInt,
    pub stack_policy: StackPolicy,
    pub stack_level_policy: StackLevelPolicy,
    pub magnitude_policy: StackMagnitudePolicy,
    pub overflow_policy: StackOverflowPolicy,
    pub expiration_policy: StackExpirationPolicy,
    pub owner_denial_policy: Option<OwnerDenialPolicy>,
    pub owner_override_policy: Option<OwnerOverridePolicy>,
    pub owner_override_stack_count_policy: Option<StackCountOverridePolicy>,
    pub level_denial_policy: Option<LevelComparison>,
    pub level_override_policy: Option<LevelComparison>,
    pub level_override_stack_count_policy: Option<StackCountOverridePolicy>,
    pub application_refresh_policy: ApplicationRefreshPolicy,
    pub application_reset_period_policy: ApplicationResetPeriodPolicy,
    pub execute_on_successful_application: bool,
}

impl StackingData {
    pub fn new(stack_limit: impl Into<ScalableInt>, stack_policy: StackPolicy) -> Self {
        Self {
            stack_limit: stack_limit.into(),
            initial_stack: ScalableInt::new(1),
            stack_policy,
            stack_level_policy: StackLevelPolicy::SegregateLevels,
            magnitude_policy: StackMagnitudePolicy::DontStack,
            overflow_policy: StackOverflowPolicy::AllowApplication,
            expiration_policy: StackExpirationPolicy::ClearEntireStack,
            owner_denial_policy: None,
            owner_override_policy: None,
            owner_override_stack_count_policy: None,
            level_denial_policy: None,
            level_override_policy: None,
            level_override_stack_count_policy: None,
            application_refresh_policy: ApplicationRefreshPolicy::NeverRefresh,
            application_reset_period_policy: ApplicationResetPeriodPolicy::NeverReset,
            execute_on_successful_application: false,
        }
    }

    pub fn initial_stack(mut self, initial: impl Into<ScalableInt>) -> Self {
        self.initial_stack = initial.into();
        self
    }

    pub fn magnitude_policy(mut self, policy: StackMagnitudePolicy) -> Self {
        self.magnitude_policy = policy;
        self
    }

    pub fn overflow_policy(mut self, policy: StackOverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn expiration_policy(mut self, policy: StackExpirationPolicy) -> Self {
        self.expiration_policy = policy;
        self
    }

    pub fn owner_policies(
        mut self,
        denial: OwnerDenialPolicy,
        overriding: OwnerOverridePolicy,
        stack_count: StackCountOverridePolicy,
    ) -> Self {
        self.owner_denial_policy = Some(denial);
        self.owner_override_policy = Some(overriding);
        self.owner_override_stack_count_policy = Some(stack_count);
        self
    }

    pub fn level_policies(
        mut self,
        denial: LevelComparison,
        overriding: LevelComparison,
        stack_count: StackCountOverridePolicy,
    ) -> Self {
        self.stack_level_policy = StackLevelPolicy::AggregateLevels;
        self.level_denial_policy = Some(denial);
        self.level_override_policy = Some(overriding);
        self.level_override_stack_count_policy = Some(stack_count);
        self
    }

    pub fn refresh_duration_on_application(mut self) -> Self {
        self.application_refresh_policy = ApplicationRefreshPolicy::RefreshOnSuccessfulApplication;
        self
    }

    pub fn reset_period_on_application(mut self) -> Self {
        self.application_reset_period_policy =
            ApplicationResetPeriodPolicy::ResetOnSuccessfulApplication;
        self
    }

    pub fn execute_on_application(mut self) -> Self {
        self.execute_on_successful_application = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_relation() {
        assert_eq!(LevelComparison::relate(3, 1), LevelComparison::HIGHER);
        assert_eq!(LevelComparison::relate(1, 3), LevelComparison::LOWER);
        assert_eq!(LevelComparison::relate(2, 2), LevelComparison::EQUAL);
    }

    #[test]
    fn builder_wires_level_aggregation() {
        let stacking = StackingData::new(5, StackPolicy::AggregateBySource).level_policies(
            LevelComparison::LOWER,
            LevelComparison::HIGHER,
            StackCountOverridePolicy::ResetStacks,
        );
        assert_eq!(stacking.stack_level_policy, StackLevelPolicy::AggregateLevels);
        assert_eq!(stacking.level_denial_policy, Some(LevelComparison::LOWER));
    }
}
