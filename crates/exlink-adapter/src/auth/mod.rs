/*
[INPUT]:  API key id, token source, persisted nonce/token state
[OUTPUT]: Nonces, session tokens, and auth-error recovery decisions
[POS]:    Auth layer - nonce and session token lifecycle
[UPDATE]: When auth flow or persistence format changes
*/

pub mod manager;
pub mod nonce;
pub mod token;

mod store;

pub use manager::{AuthRecovery, TokenConfig, TokenLifecycleManager, TokenState, TokenStatus};
pub use nonce::{NonceAuthority, NonceClock, NonceConfig};
pub use token::{AuthToken, TokenGrant, TokenSource, TokenStore};
