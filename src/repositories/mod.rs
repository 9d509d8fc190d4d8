//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM
//! operations for database entities, providing a clean API for data access.

pub mod consent_session;
pub mod site;
pub mod user_site;
pub mod user_site_lock;

pub use consent_session::{ConsentSessionRepository, NewConsentSession};
pub use site::SiteRepository;
pub use user_site::{NewUserSite, UserSiteRepository};
pub use user_site_lock::UserSiteLockRepository;
