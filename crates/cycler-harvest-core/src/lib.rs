//! # cycler-harvest core
//!
//! Side-effect-free logic shared by the harvester agent and the ingestion
//! server: data models, wire types, the file lifecycle state machine, the
//! standard unit/column catalogue, size-bounded chunk building, the report
//! handler and the store abstraction.
//!
//! This crate does no filesystem or network I/O. The SQLite store, HTTP
//! server and client, and the format readers live in the `cycler-harvest`
//! crate.

pub mod catalogue;
pub mod chunk;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod models;
pub mod store;
pub mod wire;
