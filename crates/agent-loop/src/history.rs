//! Bounded, append-only step history.

use serde::{Deserialize, Serialize};

use webpilot_core_types::{Action, ActionResult, HistoryItem};

use crate::errors::EngineError;

/// Ordered record of executed steps, oldest first.
///
/// Capacity is the run's step budget. Once full, the next `record` fails
/// with [`EngineError::StepBudgetExhausted`]; nothing is ever evicted, so
/// "ran out of budget" is always distinguishable from "task completed".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepHistory {
    max_steps: u32,
    items: Vec<HistoryItem>,
}

impl StepHistory {
    pub fn new(max_steps: u32) -> Self {
        Self {
            max_steps,
            items: Vec::new(),
        }
    }

    /// Append one step record, enforcing the budget.
    pub fn record(
        &mut self,
        step: u32,
        action: Action,
        result: &ActionResult,
    ) -> Result<HistoryItem, EngineError> {
        if self.items.len() as u32 >= self.max_steps {
            return Err(EngineError::StepBudgetExhausted {
                max_steps: self.max_steps,
            });
        }
        let item = HistoryItem::new(step, action, result);
        self.items.push(item.clone());
        Ok(item)
    }

    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn remaining(&self) -> u32 {
        self.max_steps.saturating_sub(self.items.len() as u32)
    }

    /// Render the most recent steps for the decision policy.
    pub fn describe_recent(&self, count: usize) -> String {
        if self.items.is_empty() {
            return "No previous actions yet".to_string();
        }
        let start = self.items.len().saturating_sub(count);
        self.items[start..]
            .iter()
            .map(HistoryItem::describe)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
