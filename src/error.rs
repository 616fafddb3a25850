//! Error handling module
//!
//! Defines the error taxonomy for Rigsync. Only definition errors and
//! infrastructure failures travel as `Err`; runtime state errors on a
//! tracker are reported through `bool`/`Option` return values instead.

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Main error type for Rigsync
#[derive(Error, Debug)]
pub enum RigError {
    /// Model definition errors (rejected at import time)
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Viewer connection errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Reload pool errors
    #[error("Reload error: {0}")]
    Reload(#[from] ReloadError),

    /// Skin profile lookup errors
    #[error("Skin error: {0}")]
    Skin(#[from] SkinError),

    /// Bundle lifecycle misuse
    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Definition file decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors in a skeleton or animation definition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model has no name")]
    MissingName,

    #[error("Duplicate bone '{0}'")]
    DuplicateBone(String),

    #[error("Bone '{bone}' references unknown parent '{parent}'")]
    UnknownParent { bone: String, parent: String },

    #[error("Clip '{clip}' animates unknown bone '{bone}'")]
    UnknownBone { clip: String, bone: String },

    #[error("Bone '{0}' is part of a parent cycle")]
    CyclicHierarchy(String),

    #[error("Duplicate clip '{0}'")]
    DuplicateClip(String),

    #[error("Invalid keyframe in '{clip}/{bone}' at {time}: {reason}")]
    InvalidKeyframe {
        clip: String,
        bone: String,
        time: f32,
        reason: String,
    },

    #[error("Duplicate keyframe timestamp {time} in '{clip}/{bone}'")]
    DuplicateKeyframe { clip: String, bone: String, time: f32 },

    #[error("Too many bones: {count} (max: {max})")]
    TooManyBones { count: usize, max: usize },

    #[error("Unknown model '{0}'")]
    UnknownModel(String),
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unsupported protocol revision: {0}")]
    UnsupportedRevision(u32),

    #[error("Unknown packet id: {0:#04x}")]
    UnknownPacket(i32),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("VarInt too long")]
    VarIntTooLong,

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },
}

/// Viewer connection errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Viewer not found: {0}")]
    ViewerNotFound(Uuid),

    #[error("Viewer already connected: {0}")]
    AlreadyConnected(Uuid),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write buffer full")]
    WriteBufferFull,
}

/// Parallel reload errors
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("Reload worker pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Reload subsystem disabled")]
    Disabled,

    #[error("Model directory not readable: {0}")]
    Directory(String),
}

/// Skin profile lookup errors
#[derive(Error, Debug, Clone)]
pub enum SkinError {
    #[error("Profile lookup timed out")]
    Timeout,

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Profile lookup failed: {0}")]
    Lookup(String),
}

/// Misuse of a packet bundle's lifecycle
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleError {
    #[error("Packet added to a bundle that was already sent")]
    AlreadySent,

    #[error("Bundle was already flushed")]
    AlreadyFlushed,
}

/// Result type alias for Rigsync operations
pub type Result<T> = std::result::Result<T, RigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::UnknownParent {
            bone: "arm".to_string(),
            parent: "torso".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Bone 'arm' references unknown parent 'torso'"
        );

        let err = ProtocolError::UnknownPacket(0x5d);
        assert_eq!(err.to_string(), "Unknown packet id: 0x5d");

        let err = BundleError::AlreadySent;
        assert_eq!(
            err.to_string(),
            "Packet added to a bundle that was already sent"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: RigError = ModelError::DuplicateBone("head".to_string()).into();
        assert!(matches!(err, RigError::Model(ModelError::DuplicateBone(_))));
        assert_eq!(err.to_string(), "Model error: Duplicate bone 'head'");

        let err: RigError = ReloadError::Disabled.into();
        assert!(matches!(err, RigError::Reload(_)));
    }
}
