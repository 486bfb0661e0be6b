//! Credential Service - QR credential issuance, lifecycle and checkpoint validation.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
