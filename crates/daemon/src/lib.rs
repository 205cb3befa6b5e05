//! # Termexec Daemon Library
//!
//! This crate provides the Termexec server: remote shell execution over
//! HTTP with streamed output.
//!
//! ## Overview
//!
//! - **One-shot execution**: run a command in a fresh process and return its
//!   collected output
//! - **Terminal sessions**: commands submitted for the same terminal id are
//!   typed into the process already running there, and its output is
//!   streamed as `data: <json>` events
//! - **Input injection**: raw keystrokes written to a running process by pid
//! - **PTY bridge**: a raw WebSocket byte pipe to a shell under a
//!   pseudo-terminal
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      HTTP Server (axum)                   │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │                    ExecService                      │  │
//! │  │  ┌──────────────┐ ┌───────────────┐ ┌────────────┐  │  │
//! │  │  │   Process    │ │    Session    │ │  Process   │  │  │
//! │  │  │   Spawner    │ │   Registry    │ │  Registry  │  │  │
//! │  │  └──────────────┘ └───────────────┘ └────────────┘  │  │
//! │  │  ┌───────────────────────────────────────────────┐  │  │
//! │  │  │              Stream Multiplexer               │  │  │
//! │  │  └───────────────────────────────────────────────┘  │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │              PTY Bridge (WebSocket)                 │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, ExecServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let server = ExecServer::bind(&config).await?;
//!     println!("listening on {}", server.local_addr());
//!
//!     server
//!         .serve(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Spawning, registries, stream multiplexing and the PTY bridge
//! - [`service`]: The exec service that ties the session engine together
//! - [`server`]: HTTP routes, error mapping and the listener

pub mod config;
pub mod server;
pub mod service;
pub mod session;

pub use config::{Config, ConfigError, ExecConfig, PtyConfig, ServerConfig};
pub use server::{create_router, ApiError, AppState, ExecServer, ServerError};
pub use service::ExecService;
pub use session::{SessionError, SpawnError};
