//! Device connection handling: accept, route, heartbeat, teardown.

pub mod handler;
