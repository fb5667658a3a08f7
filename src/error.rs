use std::{io, path::StripPrefixError, sync::mpsc::SendError};

use http::status::StatusCode;
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

#[cfg(feature = "service")]
use sqlx::Error as SqlxError;

use crate::{codec::diagnostic::ParseError, event::Event};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum NotebaseError {
    #[error("Invalid Command: {0}")]
    Command(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Identity ambiguity: {0}")]
    IdentityAmbiguity(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Operation cancelled")]
    OperationCancelled,
    #[error(transparent)]
    Parse(ParseError),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Index store error: {0}")]
    Persistence(String),
    #[error("Permalink '{permalink}' already held by '{holder}', assigned '{assigned}' to '{path}'")]
    ResolutionConflict {
        permalink: String,
        holder: String,
        path: String,
        assigned: String,
    },
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Watcher error: {0}")]
    Watch(String),
}

impl NotebaseError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotebaseError::Command(_) => StatusCode::BAD_REQUEST,
            NotebaseError::Custom(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NotebaseError::IdentityAmbiguity(_) => StatusCode::CONFLICT,
            NotebaseError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NotebaseError::NotFound(_) => StatusCode::NOT_FOUND,
            NotebaseError::OperationCancelled => StatusCode::NO_CONTENT,
            NotebaseError::Parse(_) => StatusCode::UNPROCESSABLE_ENTITY,
            NotebaseError::PermissionDenied => StatusCode::FORBIDDEN,
            NotebaseError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NotebaseError::ResolutionConflict { .. } => StatusCode::CONFLICT,
            NotebaseError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NotebaseError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            NotebaseError::Watch(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Errors worth retrying later: the index or file system may recover, the content won't.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NotebaseError::Io(_)
                | NotebaseError::Persistence(_)
                | NotebaseError::Timeout(_)
                | NotebaseError::PermissionDenied
        )
    }
}

impl From<ParseError> for NotebaseError {
    fn from(src: ParseError) -> NotebaseError {
        NotebaseError::Parse(src)
    }
}

impl From<StripPrefixError> for NotebaseError {
    fn from(src: StripPrefixError) -> NotebaseError {
        NotebaseError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for NotebaseError {
    fn from(src: toml::de::Error) -> NotebaseError {
        NotebaseError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for NotebaseError {
    fn from(src: toml::ser::Error) -> NotebaseError {
        NotebaseError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for NotebaseError {
    fn from(src: JsonError) -> NotebaseError {
        NotebaseError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for NotebaseError {
    fn from(src: serde_yaml::Error) -> NotebaseError {
        NotebaseError::Serialization(format!("YAML (de)serialization error: {src}"))
    }
}

impl From<io::Error> for NotebaseError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => NotebaseError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => NotebaseError::PermissionDenied,
            _ => NotebaseError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<walkdir::Error> for NotebaseError {
    fn from(x: walkdir::Error) -> Self {
        match x.into_io_error() {
            Some(io_error) => io_error.into(),
            None => NotebaseError::Io("directory walk hit a symlink loop".to_string()),
        }
    }
}

impl From<RegexError> for NotebaseError {
    fn from(x: RegexError) -> Self {
        NotebaseError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<tokio::time::error::Elapsed> for NotebaseError {
    fn from(x: tokio::time::error::Elapsed) -> Self {
        NotebaseError::Timeout(format!("{x}"))
    }
}

impl From<tokio::task::JoinError> for NotebaseError {
    fn from(x: tokio::task::JoinError) -> Self {
        if x.is_cancelled() {
            NotebaseError::OperationCancelled
        } else {
            NotebaseError::Custom(format!("worker task panicked: {x}"))
        }
    }
}

impl From<SendError<Event>> for NotebaseError {
    fn from(x: SendError<Event>) -> Self {
        NotebaseError::Io(format!(
            "Channel update send Error, could not transmit state update event {:?}",
            x.0
        ))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for NotebaseError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        NotebaseError::Io("Channel send Error, the receiving loop has shut down".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for NotebaseError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        NotebaseError::OperationCancelled
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for NotebaseError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => NotebaseError::Watch(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => NotebaseError::Watch(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => NotebaseError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => NotebaseError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                NotebaseError::Watch("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                NotebaseError::Watch("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for NotebaseError {
    fn from(db_error: SqlxError) -> Self {
        match db_error {
            SqlxError::RowNotFound => NotebaseError::NotFound("no matching row".to_string()),
            other => NotebaseError::Persistence(format!("database error: {other:?}")),
        }
    }
}

#[cfg(feature = "service")]
impl From<sqlx::migrate::MigrateError> for NotebaseError {
    fn from(db_error: sqlx::migrate::MigrateError) -> Self {
        NotebaseError::Persistence(format!("migration error: {db_error}"))
    }
}
