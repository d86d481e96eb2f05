//! Cross-service integration tests (unit tests live next to their
//! modules).

pub mod common;

mod deep_analysis_test;
