//! Error types for configuration validation.
//!
//! Terminal-transition APIs on the manager are deliberately infallible:
//! duplicate or late completion/failure/cancellation reports are silent
//! no-ops, so the only synchronous error surface is configuration.

use thiserror::Error;

/// Errors raised while mutating escalation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The merged global configuration violates the threshold ordering
    /// `inline < overlay < modal`.
    #[error(
        "Invalid escalation thresholds: inline ({inline}ms) must be < overlay ({overlay}ms) must be < modal ({modal}ms)"
    )]
    InvalidThresholds { inline: u64, overlay: u64, modal: u64 },
}
