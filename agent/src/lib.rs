//! Library surface for the Fluidity agent.
//!
//! The binary target (`src/main.rs`) is a thin wrapper over this crate;
//! splitting it out lets `server`'s end-to-end tests drive a real agent
//! process in-test rather than reimplementing its wiring.

pub mod config;
pub mod control;
pub mod lifecycle;
pub mod persist;
pub mod proxy;
pub mod tls;
