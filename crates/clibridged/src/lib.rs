//! clibridge daemon - remote access to interactive AI command-line tools
//!
//! This crate provides the daemon's building blocks:
//! - `certs` - TLS certificate lifecycle (self-signed, external, hot reload)
//! - `supervisor` - Child process spawning, output capture and termination
//! - `registry` - Session registry actor, per-session event logs and leases
//! - `gateway` - Authenticated HTTPS routes and Server-Sent Event streams
//! - `config` - Environment-driven configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      clibridged daemon                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  GatewayServer  │────▶│       RegistryActor         │   │
//! │  │  (HTTPS + SSE)  │     │   (session state owner)     │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ TLS config                  │ spawn / signal    │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ Certificate     │     │   ProcessSupervisor         │   │
//! │  │ Manager         │     │   + OutputPump → EventLog   │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//!   outside of tests
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod certs;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod supervisor;
