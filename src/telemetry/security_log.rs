//! Security audit logging for the integration module.
//!
//! SECURITY: every decision that hinges on a caller's identity is recorded
//! here, so that forged or missing identities can be traced after the fact.

use chrono::Utc;

/// Security event types for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    /// Peer credential of an accepted IPC connection was established.
    CredentialAccepted,
    /// Kernel peer credential could not be read; connection closed.
    CredentialUnavailable,
    /// IPC call arrived without a verified credential.
    ForbiddenCall,
    /// Caller attempted an operator-only operation.
    OperatorCallDenied,
    /// Request body was rejected before reaching a handler.
    MalformedRequest,
    /// IPC connection refused because the connection limit was reached.
    ConnectionLimited,
    /// Process refused to start under an unsafe identity.
    RoleRefused,
    /// User role started without its shared secret.
    MissingSecret,
    /// HTTP request to a user instance without the matching secret.
    SecretRejected,
    /// Module implementation was replaced.
    ModuleReloaded,
    /// Module build, load or start failed during reload.
    ModuleReloadFailed,
}

impl SecurityEvent {
    /// Get the severity level for this event.
    pub fn severity(&self) -> SecuritySeverity {
        match self {
            Self::CredentialAccepted => SecuritySeverity::Debug,
            Self::CredentialUnavailable => SecuritySeverity::Warning,
            Self::ForbiddenCall => SecuritySeverity::Warning,
            Self::OperatorCallDenied => SecuritySeverity::Warning,
            Self::MalformedRequest => SecuritySeverity::Info,
            Self::ConnectionLimited => SecuritySeverity::Warning,
            Self::RoleRefused => SecuritySeverity::Critical,
            Self::MissingSecret => SecuritySeverity::Critical,
            Self::SecretRejected => SecuritySeverity::Warning,
            Self::ModuleReloaded => SecuritySeverity::Info,
            Self::ModuleReloadFailed => SecuritySeverity::Error,
        }
    }

    /// Get a string representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialAccepted => "credential_accepted",
            Self::CredentialUnavailable => "credential_unavailable",
            Self::ForbiddenCall => "forbidden_call",
            Self::OperatorCallDenied => "operator_call_denied",
            Self::MalformedRequest => "malformed_request",
            Self::ConnectionLimited => "connection_limited",
            Self::RoleRefused => "role_refused",
            Self::MissingSecret => "missing_secret",
            Self::SecretRejected => "secret_rejected",
            Self::ModuleReloaded => "module_reloaded",
            Self::ModuleReloadFailed => "module_reload_failed",
        }
    }
}

/// Severity levels for security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecuritySeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl SecuritySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Render the audit line for an event.
///
/// Details are appended as `key=value` pairs in the order given.
pub fn format_security_event(
    event: SecurityEvent,
    message: &str,
    details: &[(&str, &str)],
) -> String {
    let details_str = details
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");

    let head = format!(
        "[{}] SECURITY {} {}: {}",
        Utc::now().timestamp(),
        event.severity().as_str(),
        event.as_str(),
        message
    );

    if details_str.is_empty() {
        head
    } else {
        format!("{} | {}", head, details_str)
    }
}

/// Log a security event with structured data.
///
/// # Example
/// ```
/// use im_core::telemetry::{log_security_event, SecurityEvent};
///
/// log_security_event(
///     SecurityEvent::ForbiddenCall,
///     "call without verified peer credential",
///     &[("call", "connection.whoami")],
/// );
/// ```
pub fn log_security_event(event: SecurityEvent, message: &str, details: &[(&str, &str)]) {
    let line = format_security_event(event, message, details);
    let kind = event.as_str();

    match event.severity() {
        SecuritySeverity::Debug => tracing::debug!(target: "im_core::security", event = kind, "{}", line),
        SecuritySeverity::Info => tracing::info!(target: "im_core::security", event = kind, "{}", line),
        SecuritySeverity::Warning => tracing::warn!(target: "im_core::security", event = kind, "{}", line),
        SecuritySeverity::Error | SecuritySeverity::Critical => {
            tracing::error!(target: "im_core::security", event = kind, "{}", line)
        }
    }
}
