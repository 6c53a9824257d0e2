use thiserror::Error;

/// Errors reported by the lung and its collaborators.
///
/// Image persistence keeps using `std::io::Error` (see `storage`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LungError {
    /// Construction parameters cannot produce a usable engine.
    #[error("invalid configuration: {field} {reason}")]
    Configuration {
        field: &'static str,
        reason: &'static str,
    },

    /// An operation was called before the state it depends on exists.
    #[error("precondition not met: {0}")]
    PrecondNotMet(&'static str),

    /// Image encoding or decoding failed while composing a larger operation.
    #[error("image i/o failed: {0}")]
    Image(std::io::ErrorKind),
}

impl From<std::io::Error> for LungError {
    fn from(e: std::io::Error) -> Self {
        LungError::Image(e.kind())
    }
}

impl LungError {
    pub(crate) fn config(field: &'static str, reason: &'static str) -> Self {
        LungError::Configuration { field, reason }
    }
}

pub type Result<T> = core::result::Result<T, LungError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let e: LungError = std::io::Error::new(std::io::ErrorKind::WriteZero, "full").into();
        assert_eq!(e, LungError::Image(std::io::ErrorKind::WriteZero));
        assert!(e.to_string().starts_with("image i/o failed"));
    }
}
