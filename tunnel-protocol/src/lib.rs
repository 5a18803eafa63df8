//! Wire protocol and resiliency primitives shared between the
//! Fluidity agent and server. See the crate's individual modules for
//! the pieces of the core described in the system specification:
//!
//! - [`envelope`] / [`codec`] — the framed envelope protocol (§3, §6).
//! - [`session`] — the symmetric Tunnel component (§4.2) and its
//!   concurrency discipline (§5).
//! - [`error`] — the wire error taxonomy (§7).
//! - [`retry`] / [`breaker`] — the shared resiliency kit (§4.5).
//! - [`config`] — default timeouts and capacities (§5, §6).

pub mod breaker;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod retry;
pub mod session;

pub use envelope::{Envelope, HeaderMap, RequestId};
pub use error::{ErrorCode, TunnelError};
