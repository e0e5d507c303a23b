//! Shared fixtures for the Tern integration tests.

pub mod test_helpers;
