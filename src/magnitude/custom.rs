use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use crate::attribute::AttributeKey;
use crate::effect::ModOp;
use crate::magnitude::capture::{EvalSides, Who};
use crate::tag::Tag;

/// Read-only view handed to custom calculators and executions.
///
/// Exposes the attributes of both sides plus the effect's level, stack count
/// and caller-set magnitudes. Values are read from the evaluation snapshot
/// the engine took at the start of the operation.
pub struct CalculationContext<'a> {
    pub(crate) sides: &'a EvalSides<'a>,
    pub(crate) level: i32,
    pub(crate) stack_count: i32,
    pub(crate) caller_magnitudes: &'a HashMap<Tag, f32>,
}

impl CalculationContext<'_> {
    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn stack_count(&self) -> i32 {
        self.stack_count
    }

    pub fn target_value(&self, key: &AttributeKey) -> Option<i32> {
        self.value(Who::Target, key)
    }

    pub fn source_value(&self, key: &AttributeKey) -> Option<i32> {
        self.value(Who::Source, key)
    }

    pub fn target_base_value(&self, key: &AttributeKey) -> Option<i32> {
        self.base_value(Who::Target, key)
    }

    pub fn source_base_value(&self, key: &AttributeKey) -> Option<i32> {
        self.base_value(Who::Source, key)
    }

    pub fn caller_magnitude(&self, tag: &Tag) -> Option<f32> {
        self.caller_magnitudes.get(tag).copied()
    }

    fn value(&self, who: Who, key: &AttributeKey) -> Option<i32> {
        self.sides
            .attributes(who)
            .and_then(|map| map.get(key))
            .map(|attribute| attribute.current_value())
    }

    fn base_value(&self, who: Who, key: &AttributeKey) -> Option<i32> {
        self.sides
            .attributes(who)
            .and_then(|map| map.get(key))
            .map(|attribute| attribute.base_value())
    }
}

/// Computes the base scalar for a [`Magnitude::CustomCalculated`] modifier.
///
/// [`Magnitude::CustomCalculated`]: crate::magnitude::Magnitude::CustomCalculated
pub trait CustomCalculator {
    fn calculate_base_magnitude(&self, context: &CalculationContext<'_>) -> f32;
}

/// One base-value mutation requested by a custom execution.
pub(crate) struct RequestedMutation {
    pub attribute: AttributeKey,
    pub operation: ModOp,
    pub magnitude: f32,
}

/// Context handed to custom executions during instant application and
/// periodic ticks.
///
/// Executions read through the inherited [`CalculationContext`] and queue
/// base-value mutations; the engine applies the queue after the execution
/// returns, so every read observes pre-execution state.
pub struct ExecutionContext<'a> {
    pub(crate) calculation: CalculationContext<'a>,
    pub(crate) mutations: Vec<RequestedMutation>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(calculation: CalculationContext<'a>) -> Self {
        Self {
            calculation,
            mutations: Vec::new(),
        }
    }

    pub fn execute_flat(&mut self, attribute: impl Into<AttributeKey>, magnitude: f32) {
        self.mutations.push(RequestedMutation {
            attribute: attribute.into(),
            operation: ModOp::FlatBonus,
            magnitude,
        });
    }

    pub fn execute_percent(&mut self, attribute: impl Into<AttributeKey>, percent: f32) {
        self.mutations.push(RequestedMutation {
            attribute: attribute.into(),
            operation: ModOp::PercentBonus,
            magnitude: percent,
        });
    }

    pub fn execute_override(&mut self, attribute: impl Into<AttributeKey>, value: f32) {
        self.mutations.push(RequestedMutation {
            attribute: attribute.into(),
            operation: ModOp::Override,
            magnitude: value,
        });
    }
}

impl<'a> Deref for ExecutionContext<'a> {
    type Target = CalculationContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.calculation
    }
}

impl DerefMut for ExecutionContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.calculation
    }
}

/// A custom effect execution, run on instant application and on every
/// periodic tick.
pub trait CustomExecution {
    fn execute(&self, context: &mut ExecutionContext<'_>);
}
