//! Test harness for the `asyncbridge` binary.
//!
//! Fixtures shared by the regression tests live in `tests/fixtures/` at the
//! workspace root.

#[cfg(test)]
pub mod cli;
