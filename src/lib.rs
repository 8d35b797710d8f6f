//! Queue client library
//!
//! Location acquisition and queue session lifecycle, exposed for the CLI,
//! the mock API server and integration tests.

pub mod domain;
pub mod error;
pub mod infra;
pub mod io;
pub mod services;
