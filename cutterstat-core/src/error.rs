//! Library error type

use thiserror::Error;

/// Errors raised by the codec, reader and writer layers
#[derive(Debug, Error)]
pub enum Error {
    #[error("wrong password")]
    WrongPassword,

    #[error("document is encrypted and no password was supplied")]
    PasswordRequired,

    #[error("unsupported document kind: {0}")]
    UnsupportedKind(String),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("encrypted package failed its integrity check")]
    IntegrityCheckFailed,

    #[error("cell ({row}, {col}) is outside the writable area of the sheet")]
    CellOutOfBounds { row: u32, col: u32 },

    #[error("sheet index {0} does not exist in the template")]
    SheetNotFound(usize),

    #[error("{0} total overflowed")]
    Overflow(&'static str),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Spreadsheet(#[from] calamine::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),
}

impl Error {
    /// Shorthand for [`Error::Malformed`]
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::Malformed(message.into())
    }

    /// True for every variant a caller should answer by asking for a password
    pub fn is_password_problem(&self) -> bool {
        matches!(self, Error::WrongPassword | Error::PasswordRequired)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
