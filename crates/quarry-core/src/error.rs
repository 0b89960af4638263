use std::any::Any;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the resource cache and accessor layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource is still in use ({refs} outstanding references)")]
    InUse { refs: usize },

    #[error("unknown accessor: {0}")]
    UnknownAccessor(String),

    #[error("malformed {format} container: {reason}")]
    Malformed {
        format: &'static str,
        reason: String,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{format} parser panicked: {message}")]
    ParserPanic {
        format: &'static str,
        message: String,
    },

    #[error("resource has been closed")]
    Closed,

    #[error("scope has ended")]
    ScopeClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn malformed(format: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            format,
            reason: reason.into(),
        }
    }

    /// Whether this is a plain "no such entry" error (as opposed to an I/O or
    /// parse failure). Callers use this to distinguish lookup misses from real
    /// failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(err) => err,
            CacheError::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, err),
            CacheError::Unsupported(_) => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, err)
            }
            other => std::io::Error::other(other),
        }
    }
}

/// Runs a third-party parser call, converting a panic into a regular
/// [`CacheError::ParserPanic`].
///
/// Format parsers are untrusted with respect to malformed input; a panic in
/// one of them must abort only the plugin invocation that asked for the
/// resource, never the whole query.
pub fn guard_parser<T>(format: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_payload_to_str(payload.as_ref());
            tracing::warn!(
                target = "quarry.core",
                format,
                message,
                "parser panicked; converting to error"
            );
            Err(CacheError::ParserPanic {
                format,
                message: message.to_owned(),
            })
        }
    }
}

/// Best-effort extraction of the human-readable message from a panic payload.
pub fn panic_payload_to_str(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_parser_passes_through_results() {
        let ok = guard_parser("zip", || Ok(7));
        assert_eq!(ok.unwrap(), 7);

        let err = guard_parser::<()>("zip", || Err(CacheError::not_found("x")));
        assert!(err.unwrap_err().is_not_found());
    }

    #[test]
    fn guard_parser_converts_panics() {
        let err = guard_parser::<()>("ntfs", || panic!("bad mft record")).unwrap_err();
        match err {
            CacheError::ParserPanic { format, message } => {
                assert_eq!(format, "ntfs");
                assert!(message.contains("bad mft record"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
