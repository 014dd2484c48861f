pub mod health;
pub mod routing;
pub mod validation;

pub use health::{HealthStatus, HealthTracker, SourceHealth, SourceKind};
pub use routing::{ConnectivityRouter, RouterConfig, RouterHealth, ServedCounters};
pub use validation::{BalanceValidator, ValidationCounters, ValidationIssue};
