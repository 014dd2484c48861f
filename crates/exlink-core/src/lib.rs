/*
[INPUT]:  Public API exports for exlink-core crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod balance;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod orders;
pub mod router;

// Re-export main types for convenience
pub use balance::{BalanceChange, ChangeKind, ChannelState, QuoteAliases, RealtimeBalanceChannel};
pub use config::CoreConfig;
pub use connectivity::{ConnectivityCore, CoreHealth};
pub use error::{CoreError, Result};
pub use orders::{OrderLifecycleManager, OrderManagerConfig, OrderState, OrderStatus};
pub use router::{ConnectivityRouter, HealthStatus, RouterConfig, SourceKind};
