//! potlib-test-harness: Test utilities and mock transports for potlib.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the protocol engine without requiring a real instrument on a serial
//! port.

pub mod mock_serial;

pub use mock_serial::MockTransport;
