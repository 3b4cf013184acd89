//! Telemetry for the integration module.
//!
//! Structured logging plus a security audit trail for identity decisions.

mod logging;
pub mod security_log;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use security_log::{log_security_event, SecurityEvent, SecuritySeverity};
