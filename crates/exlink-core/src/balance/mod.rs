/*
[INPUT]:  Private WebSocket session events
[OUTPUT]: Push-side balance cache, change annotations, execution fan-out
[POS]:    Data layer - realtime balance channel
[UPDATE]: When adding channel outputs or alias rules
*/

pub mod aliases;
pub mod channel;

pub use aliases::QuoteAliases;
pub use channel::{BalanceChange, ChangeKind, ChannelConfig, ChannelState, RealtimeBalanceChannel};
