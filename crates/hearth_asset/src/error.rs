use thiserror::Error;

/// Asset pipeline failures. Everything here is startup-fatal: the server
/// refuses to bind over a broken asset set.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("invalid asset id '{0}': expected 'namespace:path' in lowercase")]
    InvalidIdent(String),

    #[error("duplicate key '{key}' in {kind} assets")]
    DuplicateKey { kind: String, key: String },

    #[error("asset kind '{0}' is already registered")]
    DuplicateKind(&'static str),

    #[error("asset kind '{0}' is not registered")]
    UnknownKind(&'static str),

    #[error("{kind} asset '{key}' is missing required field '{field}'")]
    MissingField {
        kind: String,
        key: String,
        field: &'static str,
    },

    #[error("field '{field}' of {kind} asset '{key}': expected {expected}")]
    TypeMismatch {
        kind: String,
        key: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("field '{field}' of {kind} asset '{key}': {reason}")]
    Validation {
        kind: String,
        key: String,
        field: &'static str,
        reason: String,
    },

    #[error("cyclic inheritance among {kind} assets involving '{key}'")]
    CyclicInheritance { kind: String, key: String },

    #[error("{kind} asset '{key}' inherits from unknown parent '{parent}'")]
    UnknownParent {
        kind: String,
        key: String,
        parent: String,
    },

    #[error("failed to decode {kind} asset '{key}'")]
    Decode {
        kind: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read {kind} assets")]
    Source {
        kind: String,
        #[source]
        source: anyhow::Error,
    },
}
