//! # Cycler Harvest
//!
//! Collects battery-cycler data files from instrument PCs and ingests them
//! into a central store.
//!
//! A **harvester** runs next to the cyclers. It watches monitored
//! directories, reports each file's size to the **server**, and once the
//! server declares a file stable, parses it and uploads its rows in
//! size-bounded chunks. The server owns every file's lifecycle state and
//! stores columns as typed time series.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────── harvester ──────────────────────────┐
//! │ scanner ─▶ readers ─▶ resolver ─▶ completion ─▶ uploader ─┐  │
//! └────────────────────────────────────────────────────────────┼──┘
//!                                                  client (HTTP)│
//! ┌─────────────────────────── server ─────────────────────────▼──┐
//! │ server (axum) ─▶ handler (core) ─▶ SqliteStore (sqlx/SQLite)  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                                   # create database
//! harvest serve                                  # start the server
//! harvest setup --server http://host:8730 --name lab-pc-1
//! harvest paths add --harvester 1 /data/cycler --pattern '**/*.mpr'
//! harvest run                                    # on the lab PC
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Server config and harvester settings (TOML) |
//! | [`db`] | SQLite pool |
//! | [`migrate`] | Schema and standard catalogue |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` |
//! | [`server`] | HTTP API |
//! | [`client`] | HTTP transport for harvesters |
//! | [`scanner`] | Monitored directory walk |
//! | [`readers`] | Instrument file formats |
//! | [`resolver`] | Column selection and identity |
//! | [`completion`] | Unit conversion and derived columns |
//! | [`uploader`] | Chunked upload of one file |
//! | [`harvester`] | Observation loop and registration |
//! | [`files`] | Operator commands |
//! | [`inspect`] | Local file inspection |

pub mod client;
pub mod completion;
pub mod config;
pub mod db;
pub mod files;
pub mod harvester;
pub mod inspect;
pub mod migrate;
pub mod readers;
pub mod resolver;
pub mod scanner;
pub mod server;
pub mod sqlite_store;
pub mod uploader;
