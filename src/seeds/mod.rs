//! Database seeding functionality
//!
//! This module provides functionality to seed the database with initial data.
//! Currently that is the site registry, populated when the application starts.

pub mod site;

pub use site::seed_sites;
