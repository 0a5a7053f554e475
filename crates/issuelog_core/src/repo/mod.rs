//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQL details from service orchestration.
//!
//! # Invariants
//! - Every mutation runs in one serializable transaction; every read runs
//!   against a read-only snapshot.
//! - Repository APIs return semantic errors (`NotFound`,
//!   `IntegrityViolation`) next to transport errors.

pub mod issue_repo;
mod schema;
