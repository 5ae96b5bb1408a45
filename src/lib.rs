//! Chartist Library
//!
//! Perpetual-futures market scanner with staged take-profit trade
//! management

pub mod api;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod indicators;
pub mod ingest;
pub mod lifecycle;
pub mod notify;
pub mod persistence;
pub mod scoring;
pub mod store;
pub mod types;
pub mod universe;
