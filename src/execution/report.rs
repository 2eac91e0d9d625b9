use chrono::{DateTime, Utc};
use serde::Serialize;

use super::position::ManagedPosition;
use crate::Result;

/// Outcome of a best-effort side effect
///
/// Exchange and storage calls made by the order manager never fail the
/// surrounding operation; they end up here instead so callers can still
/// see what was tried.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Attempt<T> {
    Succeeded(T),
    Failed(String),
    /// Nothing to do (no order to cancel, no recorder configured, ...)
    Skipped,
}

impl<T> Attempt<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Attempt::Succeeded(value),
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Attempt::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Attempt::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Attempt::Skipped)
    }

    pub fn succeeded(&self) -> Option<&T> {
        match self {
            Attempt::Succeeded(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOrderKind {
    StopLimit,
    /// Fallback after a rejected stop-limit
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopLossPlacement {
    pub order_id: i64,
    pub kind: StopOrderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    /// State as stored after registration
    pub position: ManagedPosition,
    /// True when an earlier position for the symbol was overwritten
    pub replaced_existing: bool,
    /// Live order ids of the overwritten position, no longer tracked
    pub orphaned_order_ids: Vec<i64>,
    /// Trailing state carried over from the trade recorder
    pub restored_trailing: bool,
    pub take_profit: Attempt<i64>,
    pub stop_loss: Attempt<StopLossPlacement>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unregistration {
    pub symbol: String,
    /// None when the symbol was not managed
    pub removed: Option<ManagedPosition>,
    pub take_profit_cancel: Attempt<()>,
    pub stop_loss_cancel: Attempt<()>,
    pub close_record: Attempt<()>,
}

impl Unregistration {
    pub(crate) fn not_managed(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            removed: None,
            take_profit_cancel: Attempt::Skipped,
            stop_loss_cancel: Attempt::Skipped,
            close_record: Attempt::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopLossMove {
    pub previous_stop: f64,
    pub new_stop: f64,
    pub cancel_previous: Attempt<()>,
    pub placement: Attempt<StopLossPlacement>,
}

/// What one sweep did to one position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionTick {
    pub symbol: String,
    pub trade_id: i64,
    pub price: Attempt<f64>,
    pub trailing_activated: bool,
    pub stop_loss_move: Option<StopLossMove>,
    pub persistence: Attempt<()>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ticks: Vec<PositionTick>,
    /// Stopped early because the scheduler was cancelled
    pub cancelled: bool,
}

impl SweepReport {
    pub fn tick(&self, symbol: &str) -> Option<&PositionTick> {
        self.ticks.iter().find(|t| t.symbol == symbol)
    }

    pub fn stop_loss_moves(&self) -> usize {
        self.ticks
            .iter()
            .filter(|t| t.stop_loss_move.is_some())
            .count()
    }
}
