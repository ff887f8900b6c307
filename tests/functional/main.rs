// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the ats-ingress pipeline.
//!
//! These tests drive the validator, compiler, reconcile loop and file
//! applier WITHOUT a Kubernetes cluster or a running Traffic Server. The
//! proxy and the applier are replaced by in-memory fakes, and loop timing
//! runs on paused tokio time.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_burst_is_applied_once
//! ```
//!
//! ## Test Categories
//!
//! - **Compile scenarios**: objects in, rendered Traffic Server files out
//! - **Reconcile loop**: debounce, retry, supersede, halt and shutdown
//! - **File applier**: atomic writes, rollback and idempotence on a temp dir

#[path = "../common/fixtures.rs"]
mod fixtures;

mod compile_tests;
mod fakes;
mod reconcile_tests;
