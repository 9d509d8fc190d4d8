//! Tests that exercise real external dependencies, currently Postgres via
//! testcontainers. Each test gates itself on `SITELINK_TEST_WITH_DOCKER`.

pub mod db_tests;
