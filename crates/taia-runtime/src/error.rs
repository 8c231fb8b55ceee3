//! Typed rejections raised by the bridge.

use thiserror::Error;

/// A verification or execution failure at the bridge.
///
/// Each variant blocks the one operation it was raised for; nothing is ever
/// reported as a silent no-op.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A destructive action targeted a protected zone.
    #[error("Blocked: '{action}' on protected path '{path}'")]
    ProtectedZone { action: String, path: String },
    /// The target of an action does not exist.
    #[error("Verification failed: target '{0}' does not exist")]
    TargetMissing(String),
    /// A destructive tool call named no target that could be verified.
    #[error("Verification failed: '{0}' names no target to verify")]
    TargetUnresolved(String),
    /// A shell command matched the destructive blacklist.
    #[error("Command rejected (matches '{pattern}'): {command}")]
    CommandBlacklisted { command: String, pattern: String },
    /// The mutation lane was closed during shutdown.
    #[error("Mutation lane is closed")]
    LaneClosed,
    /// The wrapped tool returned an error.
    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
