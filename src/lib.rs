//! Persistent store for periodic topic research.
//!
//! Topics are researched in runs; each run hands over candidate findings
//! which are deduplicated by URL into one corpus with a full-text index.
//! The store is a single SQLite file in WAL mode, safe to share between a
//! scheduled job and an interactive session.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod watchlist;

pub use config::Config;
pub use db::Repository;
pub use error::{AppError, Result};
