//! service-core: Shared infrastructure for the credential workspace.
pub mod config;
pub mod error;
pub mod observability;
