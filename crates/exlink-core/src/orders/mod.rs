/*
[INPUT]:  Order intents, gateway acks, execution reports
[OUTPUT]: Order lifecycle manager and tracked order state types
[POS]:    Execution layer - module wiring
[UPDATE]: When adding order-side components or exports
*/

pub mod manager;
pub mod order_state;

pub use manager::{OrderHealth, OrderLifecycleManager, OrderManagerConfig, ReconcileSummary};
pub use order_state::{
    Execution, OrderState, OrderStatus, OrderTracker, OrderTrackerError, Registration,
    ReportOutcome,
};
