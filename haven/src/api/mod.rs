//! Owner control surfaces
//!
//! Two transports with identical semantics: a loopback HTTP API and a
//! local UNIX-socket command channel. Both authenticate with HMAC-backed
//! tokens keyed from the vault's api-token sub-key.

pub mod control;
pub mod http;
pub mod tokens;

pub use http::{serve_http, ApiContext};
pub use tokens::{LoginLimiter, TokenKind, TokenService};
