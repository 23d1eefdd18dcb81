//! Integration tests for diagramsync
//!
//! These tests drive client sessions against an in-process authority without
//! network I/O.

mod harness;
mod test_config;
mod test_locks;
mod test_registry;
mod test_scenarios;
