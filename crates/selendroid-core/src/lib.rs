//! Core types and logic for selendroid-driver.
//!
//! This crate holds the pieces of the driver that never touch a device or
//! the network, so they can be tested in isolation and shared by the host
//! and the session orchestrator.
//!
//! # Modules
//!
//! - [`error`]: API error types with actionable suggestions
//! - [`protocol`]: JSON wire protocol request/response shapes
//! - [`caps`]: desired capabilities and their validation table
//! - [`input`]: unicode keyboard text encoding (IMAP modified UTF-7)
//! - [`routes`]: locally handled commands and the proxy exclusion list
//!
//! # Dispatch
//!
//! Once a session is active, a request under `/session/{id}/` is handled as:
//!
//! | Check | Outcome |
//! |-------|---------|
//! | Not in the exclusion list | forwarded to the Selendroid server |
//! | Matches a local route | handled by the driver's command table |
//! | Neither | `UNKNOWN_COMMAND` |

pub mod caps;
pub mod error;
pub mod input;
pub mod protocol;
pub mod routes;
