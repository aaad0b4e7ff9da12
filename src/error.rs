//! Error types for board operations.
//!
//! Every fallible board operation returns [`BoardResult`]. The variants map onto the
//! failure classes a caller has to tell apart:
//!
//! - **`Validation`**: a descriptor has the wrong shape or names a dependency that
//!   is not configured. Carries the path of the offending field so the caller can
//!   point at the right list entry (e.g. `board.analogs.1.pin`).
//! - **`Unsupported`**: the board model cannot expose the requested kind of resource.
//! - **`Closed`**: the resource, or the whole board, has already been torn down.
//! - **`InvalidPin`** / **`PinNotFound`**: pin resolution failed either at the board's
//!   numbering map or at the platform's global line namespace.
//! - **`Hardware`**: a bus or line operation failed at the platform layer. Inside the
//!   software PWM loop these are logged and never returned.

use thiserror::Error;

/// Result type alias for board operations.
pub type BoardResult<T> = std::result::Result<T, BoardError>;

/// Errors that can occur while configuring or using a board.
#[derive(Error, Debug)]
pub enum BoardError {
    /// Descriptor shape or dependency error, qualified by config path
    #[error("{path}: {message}")]
    Validation {
        /// Dotted path of the offending field
        path: String,
        /// What is wrong with it
        message: String,
    },

    /// Resource kind not available on this board model
    #[error("{0} not supported on this board")]
    Unsupported(String),

    /// Resource used after teardown
    #[error("{0} is closed")]
    Closed(String),

    /// Pin identifier cannot be mapped by this board
    #[error("invalid pin \"{0}\"")]
    InvalidPin(String),

    /// Mapped pin has no backing hardware line
    #[error("no global pin found for \"{0}\"")]
    PinNotFound(String),

    /// Platform-level bus or line failure
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Configuration could not be loaded
    #[error("config error: {0}")]
    Config(String),

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BoardError {
    /// Build a validation error for `path`.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a hardware error from any displayable cause.
    pub fn hardware(cause: impl std::fmt::Display) -> Self {
        Self::Hardware(cause.to_string())
    }

    /// Whether this error means the resource was already torn down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl From<figment::Error> for BoardError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
