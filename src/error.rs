use thiserror::Error;

/// Convenience type alias for Results with ForgeError
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Retry/failure classification shared by every component.
///
/// This is the closed set of categories the workflows dispatch on:
/// `Transient` errors are retried within the caller's budget, `Conflict`
/// means another worker advanced the row, `Integrity` means an artifact
/// exists but the status transition could not be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    NotFound,
    Conflict,
    InputInvalid,
    PlanInvalid,
    BadDatasetLayout,
    NoCandidate,
    ResourceExhausted,
    Timeout,
    Dependency,
    Integrity,
    Permanent,
}

impl ErrorKind {
    /// Stable identifier used in `metadata.error.kind` and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::PlanInvalid => "plan_invalid",
            ErrorKind::BadDatasetLayout => "bad_dataset_layout",
            ErrorKind::NoCandidate => "no_candidate",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for ModelForge
///
/// Every fallible operation in the system surfaces one of these variants;
/// `kind()` maps each variant onto the retry taxonomy the workflows use.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid object URI: {0}")]
    InvalidObjectUri(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("training backend error: {0}")]
    Training(#[from] candle_core::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("empty input")]
    InputEmpty,

    #[error("plan validation failed: {detail}")]
    PlanInvalid { detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("status conflict: {0}")]
    Conflict(String),

    #[error("no dataset candidate: {detail}")]
    NoCandidate { detail: String },

    #[error("unrecognized dataset layout: {detail}")]
    BadDatasetLayout { detail: String },

    #[error("resource exhausted: {detail}")]
    ResourceExhausted { detail: String },

    #[error("deadline exceeded in {step}")]
    Timeout { step: String },

    #[error("{service} unavailable: {detail}")]
    Dependency { service: String, detail: String },

    #[error("artifact recorded but status update failed: {detail}")]
    Integrity { detail: String },

    #[error("transient failure: {detail}")]
    Transient { detail: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ForgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForgeError::Database(e) => classify_sqlx(e),
            ForgeError::ObjectStore(e) => classify_object_store(e),
            ForgeError::InvalidObjectUri(_) => ErrorKind::InputInvalid,
            ForgeError::Http(e) => {
                if e.is_timeout() {
                    ErrorKind::Timeout
                } else if e.is_connect() || e.is_request() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Dependency
                }
            }
            ForgeError::Serialization(_) => ErrorKind::Permanent,
            ForgeError::Io(_) => ErrorKind::Transient,
            ForgeError::Zip(_) => ErrorKind::BadDatasetLayout,
            ForgeError::Training(_) => ErrorKind::Permanent,
            ForgeError::Image(_) => ErrorKind::BadDatasetLayout,
            ForgeError::Configuration(_) => ErrorKind::Permanent,
            ForgeError::InputInvalid(_) | ForgeError::InputEmpty => ErrorKind::InputInvalid,
            ForgeError::PlanInvalid { .. } => ErrorKind::PlanInvalid,
            ForgeError::NotFound(_) => ErrorKind::NotFound,
            ForgeError::Conflict(_) => ErrorKind::Conflict,
            ForgeError::NoCandidate { .. } => ErrorKind::NoCandidate,
            ForgeError::BadDatasetLayout { .. } => ErrorKind::BadDatasetLayout,
            ForgeError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            ForgeError::Timeout { .. } => ErrorKind::Timeout,
            ForgeError::Dependency { .. } => ErrorKind::Dependency,
            ForgeError::Integrity { .. } => ErrorKind::Integrity,
            ForgeError::Transient { .. } => ErrorKind::Transient,
            ForgeError::Internal(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Error code surfaced in API responses. Matches `kind()` except for the
    /// more specific `input_empty`.
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::InputEmpty => "input_empty",
            other => other.kind().as_str(),
        }
    }
}

fn classify_sqlx(e: &sqlx::Error) -> ErrorKind {
    match e {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db) => {
            // 23xxx: integrity constraint violations (duplicate key etc.)
            match db.code() {
                Some(code) if code.starts_with("23") => ErrorKind::Conflict,
                _ => ErrorKind::Permanent,
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ErrorKind::Transient
        }
        _ => ErrorKind::Permanent,
    }
}

fn classify_object_store(e: &object_store::Error) -> ErrorKind {
    match e {
        object_store::Error::NotFound { .. } => ErrorKind::NotFound,
        object_store::Error::AlreadyExists { .. } => ErrorKind::Conflict,
        object_store::Error::Precondition { .. } => ErrorKind::Conflict,
        _ => ErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::NoCandidate.as_str(), "no_candidate");
        assert_eq!(ErrorKind::BadDatasetLayout.as_str(), "bad_dataset_layout");
        assert_eq!(ErrorKind::Integrity.as_str(), "integrity");
    }

    #[test]
    fn conflict_is_never_transient() {
        let err = ForgeError::Conflict("another worker advanced the row".into());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_transient());
    }

    #[test]
    fn timeout_maps_to_timeout_kind() {
        let err = ForgeError::Timeout {
            step: "download_archive".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
