//! Stockflow Backend Library
//!
//! Market-data ingestion core: broker session management, realtime
//! minute-bar aggregation, daily OHLCV backfill, and the persistence
//! pipeline (TimescaleDB + shared-memory mirror).
//!
//! Exposed as a library so binaries and integration tests share the
//! same modules.

pub mod broker;
pub mod calendar;
pub mod config;
pub mod daily;
pub mod depth;
pub mod features;
pub mod indicators;
pub mod models;
pub mod persist;
pub mod realtime;
pub mod supervisor;
