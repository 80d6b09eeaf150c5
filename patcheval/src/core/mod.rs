//! Deterministic, pure logic shared by the classification engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod eta;
pub mod fold;
pub mod streak;
pub mod types;
