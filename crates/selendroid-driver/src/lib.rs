//! Appium-style WebDriver driver that automates Android apps through a
//! Selendroid instrumentation server.
//!
//! - [`driver`]: device control, the instrumentation server manager, the
//!   command proxy and the session orchestrator.
//! - [`daemon`]: the HTTP host that clients talk to.

pub mod daemon;
pub mod driver;
