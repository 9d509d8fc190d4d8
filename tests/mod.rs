//! Aggregates the sqlite-backed suites so `cargo test --test mod` runs the
//! whole in-memory battery in one binary. Suites that mutate the process
//! environment or spawn child processes keep their own targets.

#[allow(clippy::duplicate_mod)]
pub mod http_api_tests;

pub mod integration;
