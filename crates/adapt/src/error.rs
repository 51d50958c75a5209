/// Errors surfaced by the adaptation core.
///
/// Everything except the empty-class case in clustering (handled locally)
/// aborts the current round or step.
#[derive(Debug, thiserror::Error)]
pub enum AdaptError {
    /// Two tensors, buffers or index lists disagree on a dimension.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A global sample index does not address a bank row.
    #[error("sample index {index} out of range for bank of {len} rows")]
    IndexOutOfRange { index: usize, len: usize },
    /// The same global index appeared twice where rows are placed by index.
    #[error("sample index {0} appears more than once in the pool")]
    DuplicateIndex(usize),
    /// Thresholds were requested over an empty energy distribution.
    #[error("cannot compute energy thresholds over an empty selection pool")]
    EmptySelectionPool,
    /// A configuration value is outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Writing to the round log sink failed.
    #[error("log sink error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AdaptError>;

/// Return a `ShapeMismatch` unless `actual == expected`.
pub(crate) fn ensure_len(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(AdaptError::ShapeMismatch {
            context,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_len() {
        assert!(ensure_len("rows", 3, 3).is_ok());
        let err = ensure_len("rows", 3, 2).unwrap_err();
        assert!(matches!(
            err,
            AdaptError::ShapeMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
        assert_eq!(err.to_string(), "shape mismatch in rows: expected 3, got 2");
    }
}
