//! # Rust-engineio-v3
//!
//! The transport core of an `engine.io` client, speaking revision 3 of the
//! protocol. An [`Engine`] establishes, maintains and terminates one logical
//! connection to a server: it starts on HTTP long-polling, probes a
//! websocket, switches over atomically when the probe succeeds, frames and
//! defragments packets on both transports, and keeps the connection alive
//! with a ping/pong heartbeat.
//!
//! Decoded traffic is surfaced through the [`EngineClient`] trait, which the
//! layer above (usually a `socket.io` packet parser) implements.
//!
//! ## Example usage
//!
//! ``` no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use rust_engineio_v3::{EngineBuilder, EngineClient};
//! use url::Url;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EngineClient for Printer {
//!     async fn parse_engine_message(&self, msg: String) {
//!         println!("message: {msg}");
//!     }
//!     async fn parse_engine_binary_data(&self, data: Bytes) {
//!         println!("binary: {data:?}");
//!     }
//!     async fn engine_did_open(&self, reason: String) {
//!         println!("open: {reason}");
//!     }
//!     async fn engine_did_close(&self, reason: String) {
//!         println!("close: {reason}");
//!     }
//!     async fn engine_did_error(&self, reason: String) {
//!         println!("error: {reason}");
//!     }
//! }
//!
//! # async fn run() {
//! let engine = EngineBuilder::new(Url::parse("http://localhost:4201").unwrap())
//!     .build(Arc::new(Printer));
//!
//! engine.connect().expect("worker is alive");
//! engine.send("Hello World".to_owned(), vec![]).expect("worker is alive");
//! engine.disconnect("Disconnect").expect("worker is alive");
//! # }
//! ```
//!
//! ## Transports
//!
//! * `polling`: HTTP long-polling with base64-encoded binary (`b64=1`).
//! * `websocket`: upgraded to after a successful `probe` round trip, unless
//!   the builder forces one of the two transports.
//!
//! Writes submitted while the probe is in flight are buffered and replayed
//! in order once the switch settles, in either direction.
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![warn(clippy::perf)]
#![warn(clippy::correctness)]

pub mod client;
pub mod config;
mod engine;
/// Generic header map
pub mod header;
pub mod packet;
pub mod transports;

/// The protocol revision this crate implements, sent as `EIO=` on every
/// request.
pub const ENGINE_IO_VERSION: i32 = 3;

/// Contains the error type which will be returned with every result in this
/// crate. Handles all kinds of errors.
pub mod error;

pub use client::EngineClient;
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::Error;
pub use header::HeaderMap;
pub use packet::{Packet, PacketData, PacketId};
