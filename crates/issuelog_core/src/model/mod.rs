//! Domain model for the issue store.
//!
//! # Responsibility
//! - Define the canonical issue record and its read projections.
//! - Keep the row-to-struct mapping explicit per type (`FromRow`).
//!
//! # Invariants
//! - Every issue is identified by a stable `IssueId` generated client-side.
//! - Links are symmetric: every `(a, b)` edge has a mirrored `(b, a)` edge.

pub mod issue;
