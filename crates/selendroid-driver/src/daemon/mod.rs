//! HTTP host process: endpoint routing, the session registry and
//! directory resolution.

pub mod paths;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use server::{HostConfig, HostServer};
pub use session::{DriverFactory, SessionRegistry};
