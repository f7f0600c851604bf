//! Error types for the engine core and its NA plugins.
//!
//! Every failure surfaced by the core is unrecoverable at this level: the
//! caller abandons the run and reports. The one benign condition, a
//! progress/trigger call finding no work, is not an error and never shows
//! up here.

use thiserror::Error;

/// Coarse classification of an [`EngineError`], handy for matching in tests
/// and for choosing an exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Init,
    Context,
    Address,
    Consistency,
    Loop,
    Busy,
    Config,
}

/// Errors returned by engine, context, address and progress operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine creation failed: bad transport spec, missing plugin, or
    /// resource allocation failure while bringing the plugin up.
    #[error("engine init failed for '{spec}': {reason}")]
    Init { spec: String, reason: String },

    /// Context creation failed.
    #[error("context creation failed: {0}")]
    Context(String),

    /// Self-address lookup, text rendering, or release failed.
    #[error("address operation failed: {0}")]
    Address(String),

    /// An internal invariant was violated (resolver or memory bug).
    #[error("internal consistency violation: {0}")]
    Consistency(String),

    /// Trigger or progress reported an abnormal status.
    #[error("progress loop failed: {0}")]
    Loop(String),

    /// Teardown was attempted while handles derived from the engine or
    /// context are still live.
    #[error("busy: {contexts} context(s), {addresses} address(es), {pending} pending completion(s) still live")]
    Busy {
        contexts: usize,
        addresses: usize,
        pending: usize,
    },

    /// Option file could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Init { .. } => ErrorKind::Init,
            EngineError::Context(_) => ErrorKind::Context,
            EngineError::Address(_) => ErrorKind::Address,
            EngineError::Consistency(_) => ErrorKind::Consistency,
            EngineError::Loop(_) => ErrorKind::Loop,
            EngineError::Busy { .. } => ErrorKind::Busy,
            EngineError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn init(spec: &str, reason: impl ToString) -> Self {
        EngineError::Init {
            spec: spec.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors reported by NA plugin implementations.
#[derive(Debug, Error)]
pub enum NaError {
    #[error("invalid transport spec: {0}")]
    InvalidSpec(String),

    #[error("protocol '{protocol}' not supported by plugin '{plugin}'")]
    ProtocolNotSupported { plugin: String, protocol: String },

    #[error("address not available: {0}")]
    AddrNotAvailable(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin fault: {0}")]
    Fault(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::init("x", "bad").kind(), ErrorKind::Init);
        assert_eq!(EngineError::Loop("boom".into()).kind(), ErrorKind::Loop);
        let busy = EngineError::Busy {
            contexts: 1,
            addresses: 0,
            pending: 0,
        };
        assert_eq!(busy.kind(), ErrorKind::Busy);
    }

    #[test]
    fn test_display_carries_spec() {
        let err = EngineError::init("bogus+proto", "plugin 'bogus' is not available");
        let msg = err.to_string();
        assert!(msg.contains("bogus+proto"));
        assert!(msg.contains("not available"));
    }

    #[test]
    fn test_na_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: NaError = io.into();
        assert!(matches!(err, NaError::Io(_)));
    }
}
