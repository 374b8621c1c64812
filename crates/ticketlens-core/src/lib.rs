//! TicketLens Core - error and logging facilities
//!
//! This crate provides the ambient facilities shared by every TicketLens crate:
//! - Canonical structured error type (`ExError`) with stable error codes
//! - Structured logging facility with operation boundary macros
//! - Test capture mode for asserting on emitted log events

pub mod errors;
pub mod logging_facility;

// Re-export commonly used types
pub use errors::{ExError, ExErrorKind, Result};
pub use ticketlens_core_types::schema;
