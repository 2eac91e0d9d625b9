// Protective order management for open positions
pub mod order_manager;
pub mod position;
pub mod report;

pub use order_manager::OrderManager;
pub use position::{ManagedPosition, OrderManagerConfig};
pub use report::{
    Attempt, PositionTick, Registration, StopLossMove, StopLossPlacement, StopOrderKind,
    SweepReport, Unregistration,
};
