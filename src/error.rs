//! Error types for windowsad.
//!
//! Layer-specific errors ([`ConnectionError`], [`DecodeError`]) are folded into
//! the crate-level [`Error`] at the directory boundary. Remote failures are
//! classified once into an [`ErrorKind`] so callers can branch on absence
//! without matching message text themselves.

use std::fmt;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::powershell::decode::DecodeError;

/// Result type alias for windowsad operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Exception markers the directory and group-policy cmdlets emit for absent
/// objects, paired with the kind each one maps to. Checked in order.
const NOT_FOUND_MARKERS: &[(&str, ErrorKind)] = &[
    ("ADIdentityNotFoundException", ErrorKind::IdentityNotFound),
    ("GpoWithIdNotFound", ErrorKind::GpoNotFound),
    ("GpoWithNameNotFound", ErrorKind::GpoNotFound),
    ("ObjectNotFound", ErrorKind::ObjectNotFound),
    ("did not find", ErrorKind::LinkNotFound),
];

/// Classification of a failure reported by the remote scripting host.
///
/// The kind follows the exception marker in the error text, not the cmdlet
/// that ran. Every `Get-AD*` cmdlet reports a missing `-Identity` with
/// `ADIdentityNotFoundException`, so an absent computer or OU is
/// [`ErrorKind::IdentityNotFound`] just like an absent user. Callers that
/// only care about absence should use [`ErrorKind::is_not_found`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An `-Identity` lookup found nothing (`ADIdentityNotFoundException`),
    /// whatever the object class.
    IdentityNotFound,
    /// `ObjectNotFound` without the identity exception, or a computer or OU
    /// lookup that returned no object.
    ObjectNotFound,
    /// A group policy object does not exist.
    GpoNotFound,
    /// A group policy link is not present on the target container.
    LinkNotFound,
    /// Any other remote failure.
    Other,
}

impl ErrorKind {
    /// Classify decoded error text by the exception markers it carries.
    pub fn classify(text: &str) -> Self {
        NOT_FOUND_MARKERS
            .iter()
            .find(|(marker, _)| text.contains(marker))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Other)
    }

    /// Returns true for every absence kind.
    pub fn is_not_found(&self) -> bool {
        !matches!(self, ErrorKind::Other)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::IdentityNotFound => "identity not found",
            ErrorKind::ObjectNotFound => "object not found",
            ErrorKind::GpoNotFound => "group policy object not found",
            ErrorKind::LinkNotFound => "group policy link not found",
            ErrorKind::Other => "remote execution failure",
        };
        f.write_str(name)
    }
}

/// The main error type for windowsad.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Settings are incomplete or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport construction, handshake, or connectivity failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    // ========================================================================
    // Remote Execution Errors
    // ========================================================================
    /// The script ran but reported failure.
    #[error("Command exited with code {exit_code}: {message}")]
    Execution {
        /// Exit code reported by the host
        exit_code: i32,
        /// Decoded error stream text, verbatim
        message: String,
        /// Classification of the failure
        kind: ErrorKind,
    },

    /// The requested directory object is absent.
    #[error("{kind}: {message}")]
    NotFound {
        /// Which kind of object is missing
        kind: ErrorKind,
        /// Decoded error stream text, verbatim
        message: String,
    },

    // ========================================================================
    // Decode Errors
    // ========================================================================
    /// Standard output could not be decoded into records.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    /// Build the error for a failed script run, classifying the message.
    ///
    /// Absence markers produce [`Error::NotFound`]; everything else becomes
    /// [`Error::Execution`].
    pub fn from_remote(exit_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorKind::classify(&message) {
            ErrorKind::Other => Error::Execution {
                exit_code,
                message,
                kind: ErrorKind::Other,
            },
            kind => Error::NotFound { kind, message },
        }
    }

    /// Returns the classification, if this error came from the remote host.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Execution { kind, .. } | Error::NotFound { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true if the error reports a missing directory object.
    pub fn is_not_found(&self) -> bool {
        self.kind().map(|k| k.is_not_found()).unwrap_or(false)
    }

    /// Returns the remote message text, if any.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Error::Execution { message, .. } | Error::NotFound { message, .. } => Some(message),
            _ => None,
        }
    }
}
