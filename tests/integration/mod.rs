#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the workspace network daemon
//!
//! Each test runs a full daemon on a direct network inside a temporary
//! root directory and talks to it over its rendezvous socket or overlay
//! listeners.

mod credentials_test;
mod heartbeat_test;
mod lifecycle_test;
mod mux_test;
mod port_forward_test;
