//! Persistence adapters.
//!
//! `postgres` holds the production repositories; `in_memory` holds
//! test-only implementations of the same ports.

pub mod in_memory;
pub mod postgres;
