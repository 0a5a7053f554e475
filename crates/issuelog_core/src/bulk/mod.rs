//! Bulk ingestion and key-value style reads.
//!
//! # Responsibility
//! - Load many rows quickly without a surrounding transaction.
//! - Read whole tables or key lists without going through repository logic.
//!
//! # Invariants
//! - Nothing on this path maintains `links_count` or link edges; keeping them
//!   consistent is the caller's responsibility.

pub mod key_value_repo;
