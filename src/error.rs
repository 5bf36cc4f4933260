use crate::store::StoreError;
use std::fmt;
use std::num::ParseIntError;
use thiserror::Error;

/// Where in a pass an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Workload,
    NetworkEndpoint,
    Routing,
    ConfigSecret,
    ConfigBinding,
    Revision,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Workload => "workload",
            Stage::NetworkEndpoint => "network-endpoint",
            Stage::Routing => "routing",
            Stage::ConfigSecret => "config-secret",
            Stage::ConfigBinding => "config-binding",
            Stage::Revision => "revision",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    Malformed,
    Serialization,
    Api,
    MissingObjectKey,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Raised while reading an object's identity, before there is a `ns/name` or stage to
    /// report; the payload names the missing field.
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("{stage}: request on {kind} {key} failed: {source}")]
    Store {
        stage: Stage,
        kind: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("{stage}: Application {key} has malformed revision number {value:?}: {source}")]
    MalformedRevisionNumber {
        stage: Stage,
        key: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("{stage}: Application {key} has exhausted its revision numbers at {value}")]
    RevisionNumberExhausted { stage: Stage, key: String, value: u64 },

    #[error("{stage}: failed to serialize {kind} {key}: {source}")]
    Serialization {
        stage: Stage,
        kind: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn store(stage: Stage, kind: impl Into<String>, key: impl Into<String>, source: StoreError) -> Self {
        Error::Store {
            stage,
            kind: kind.into(),
            key: key.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingObjectKey(_) => ErrorKind::MissingObjectKey,
            Error::Store { source, .. } => match source {
                StoreError::NotFound => ErrorKind::NotFound,
                StoreError::AlreadyExists => ErrorKind::AlreadyExists,
                StoreError::Conflict(_) => ErrorKind::Conflict,
                StoreError::Decode(_) => ErrorKind::Serialization,
                StoreError::Api(_) => ErrorKind::Api,
            },
            Error::MalformedRevisionNumber { .. } | Error::RevisionNumberExhausted { .. } => {
                ErrorKind::Malformed
            }
            Error::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::MissingObjectKey(_) => None,
            Error::Store { stage, .. }
            | Error::MalformedRevisionNumber { stage, .. }
            | Error::RevisionNumberExhausted { stage, .. }
            | Error::Serialization { stage, .. } => Some(*stage),
        }
    }
}
