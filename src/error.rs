use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FingerprintError>;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("test case name collision: '{name}' is derived by more than one axis combination")]
    TestCaseCollision { name: String },

    #[error("invalid query axes: {0}")]
    InvalidAxes(String),

    #[error("invalid query name '{name}': {reason}")]
    InvalidQueryName { name: String, reason: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("model schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("classifier failure: {0}")]
    Classifier(String),

    #[error("corpus line {line}: {reason}")]
    Corpus { line: usize, reason: String },

    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    #[error("file operation failed: {path}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FingerprintError {
    /// Structural errors corrupt every downstream prediction and must stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FingerprintError::TestCaseCollision { .. }
                | FingerprintError::InvalidAxes(_)
                | FingerprintError::SchemaMismatch(_)
                | FingerprintError::EmptyDataset(_)
                | FingerprintError::Classifier(_)
        )
    }

    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FingerprintError::File {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_errors_are_fatal() {
        let collision = FingerprintError::TestCaseCollision {
            name: "baseline_A_IN_QUERY".to_string(),
        };
        assert!(collision.is_fatal());
        assert!(FingerprintError::SchemaMismatch("x".to_string()).is_fatal());
        assert!(!FingerprintError::MalformedResponse("short".to_string()).is_fatal());
        assert!(!FingerprintError::InvalidTarget("nope".to_string()).is_fatal());
    }

    #[test]
    fn test_collision_message_names_the_case() {
        let err = FingerprintError::TestCaseCollision {
            name: "baseline_A".to_string(),
        };
        assert!(err.to_string().contains("baseline_A"));
    }
}
