//! Roster subsystems built on `core`.
//!
//! - `roles`: rank hierarchy rules shared by registration and scanning
//! - `registration`: validation, registration, manual registration, deregistration
//! - `queue`: retry queue processor for registrations awaiting guild membership
//! - `scan`: four-phase membership reconciliation

pub mod queue;
pub mod registration;
pub mod roles;
pub mod scan;
