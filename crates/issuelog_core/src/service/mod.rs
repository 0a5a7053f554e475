//! Use-case services.
//!
//! # Responsibility
//! - Combine repository calls with topic notifications into use-case APIs.

pub mod status_update_service;
