//! Cross-crate integration tests for the Trellis workspace live in
//! `tests/`. This crate intentionally exports nothing.
