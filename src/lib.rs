//! # Sitelink Library
//!
//! This library provides the core functionality for the sitelink service:
//! bank connection lifecycle management with consent flows, data refresh
//! orchestration and the HTTP API in front of them.

pub mod auth;
pub mod clock;
pub mod config;
pub mod consent;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod refresh;
pub mod repositories;
pub mod seeds;
pub mod server;
pub mod telemetry;
pub use migration;
