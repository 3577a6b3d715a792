//! Haven trust-and-transport core
//!
//! The layering follows the wire path: `transport` moves opaque frames,
//! `channel` gives each peer link an AEAD context with anti-replay,
//! `envelope` signs and canonically encodes messages, `router` forwards
//! them across hops, and `dispatch` turns accepted envelopes into typed
//! protocol handling.

pub mod channel;
pub mod dedup;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod router;
pub mod transport;

pub use channel::{ChannelManager, ChannelState, SecureChannel};
pub use dedup::NonceWindow;
pub use dispatch::{Dispatcher, DispatchEvent, ProtocolMessage};
pub use envelope::{Envelope, MessageSigner};
pub use error::NetworkError;
pub use router::{DeliveryReceipt, HopSignature, Route, RoutedMessage, Router};
pub use transport::{Transport, TransportEvent};

pub type Result<T> = std::result::Result<T, NetworkError>;
