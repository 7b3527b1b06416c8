//! # drawlink-bridge: Remote Display Bridge
//!
//! Streams rendered frames to a remote draw device over TCP using the
//! `drawlink-core` engine.
//!
//! ## Modes
//!
//! - **Bridge** (default): render frames locally and keep the remote
//!   window up to date.
//! - **Sink** (`--sink`): act as a loopback draw device that checks and
//!   acknowledges every command, for running the bridge without hardware.

pub mod config;
pub mod producer;
pub mod service;
pub mod sink;
pub mod tcp;
