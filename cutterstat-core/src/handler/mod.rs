//! Run orchestration
//!
//! Each handler drives one run (import, statistic or export) through the
//! core components, reports progress to a [`ProgressObserver`] and hands
//! row-level errors to an [`ErrorInfoSink`](crate::store::ErrorInfoSink).
//! Every run leaves the observer idle, whichever way it ends.
//!
//! [`ProgressObserver`]: crate::progress::ProgressObserver

mod export;
mod import;
mod statistic;

pub use export::{ExportHandler, ExportSummary};
pub use import::{ImportHandler, ImportSummary};
pub use statistic::StatisticHandler;

use crate::error::Error;
use std::path::PathBuf;
use thiserror::Error as ThisError;

/// Failure that aborts a whole run
#[derive(Debug, ThisError)]
pub enum HandlerError {
    /// The password is wrong, missing, or given for a plain document
    #[error("wrong password")]
    WrongPassword,

    #[error("failed to load export template {}: {source}", .path.display())]
    TemplateLoadFailed {
        path: PathBuf,
        #[source]
        source: Error,
    },

    #[error("unsupported document kind: {0}")]
    UnsupportedKind(String),

    #[error("run failed: {0}")]
    Failed(#[source] Error),
}

impl From<Error> for HandlerError {
    fn from(error: Error) -> Self {
        match error {
            e if e.is_password_problem() => HandlerError::WrongPassword,
            Error::UnsupportedKind(kind) => HandlerError::UnsupportedKind(kind),
            other => HandlerError::Failed(other),
        }
    }
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// An empty password means no password
fn effective_password(password: Option<&str>) -> Option<&str> {
    password.filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_errors_fold_into_one_kind() {
        assert!(matches!(
            HandlerError::from(Error::PasswordRequired),
            HandlerError::WrongPassword
        ));
        assert!(matches!(
            HandlerError::from(Error::WrongPassword),
            HandlerError::WrongPassword
        ));
        assert!(matches!(
            HandlerError::from(Error::malformed("bad")),
            HandlerError::Failed(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_password_is_no_password() {
        assert_eq!(effective_password(Some("")), None);
        assert_eq!(effective_password(Some("pw")), Some("pw"));
        assert_eq!(effective_password(None), None);
    }
}
