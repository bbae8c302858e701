//! # FerroDB
//!
//! An embedded, single-node database server exposing two storage engines —
//! a key-value store and an approximate-nearest-neighbor vector store —
//! over a line-delimited TCP protocol with authenticated sessions and
//! per-space authorization.
//!
//! ## Architecture
//!
//! ```text
//! TCP sessions ──► Capacity Governor ──► Query Engine
//!                                            │
//!                       ┌────────────────────┼──────────────┐
//!                       ▼                    ▼              ▼
//!                 Space Manager        Auth Manager    Management
//!                       │                (bcrypt)      HTTP plane
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!      KvEngine               VectorEngine
//!      ├── WAL                ├── WAL (optional)
//!      ├── KeyIndex (mmap)    ├── ANN index (ID-mapped)
//!      └── data file          └── append-only vector file
//! ```
//!
//! Durability rests on per-engine write-ahead logs replayed on open, and
//! periodic checkpoints that persist index state and truncate the logs.

pub mod auth;
pub mod client;
pub mod config;
pub mod defaults;
pub mod error;
pub mod index;
pub mod kv;
pub mod query;
pub mod server;
pub mod spaces;
pub mod vector;
pub mod wal;

pub use config::Config;
pub use error::{DbError, Result};
pub use server::{RunningServer, Server};

/// Current version of FerroDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
