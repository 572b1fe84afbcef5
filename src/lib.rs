//! JDWP-over-WebSocket tunnel library.
//!
//! Carries a debugger's wire protocol across an untrusted network. The
//! initiator accepts plain TCP from the debugger and opens one authenticated
//! WebSocket per connection; the acceptor verifies the freshness token,
//! dials the allow-listed debuggee port and relays bytes both ways.

pub mod acceptor;
pub mod auth;
pub mod config;
pub mod error;
pub mod initiator;
pub mod keys;
pub mod relay;
pub mod supervisor;

pub use acceptor::Acceptor;
pub use auth::{generate_token, verify_token};
pub use error::TunnelError;
pub use initiator::Initiator;
pub use keys::{init_key_pair, read_public_key};
pub use relay::RelaySession;
pub use supervisor::{supervise, RestartPolicy};
