/*
[INPUT]:  HTTP client configuration and private API methods
[OUTPUT]: HTTP responses and typed API results
[POS]:    HTTP layer - REST API communication
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod client;
pub mod error;
pub mod private;
pub mod signature;

pub use error::{AuthErrorKind, ExchangeError, Result};
pub use signature::{CommandSigner, MockRequestSigner, RequestSigner, SignerCommandConfig};

pub use client::{ClientConfig, Credentials, ExchangeClient};
