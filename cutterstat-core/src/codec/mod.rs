//! Document Codec: container detection, decryption on open and encryption on save
//!
//! Two document kinds are handled. xlsx is a zip package, optionally wrapped
//! in a compound file (`EncryptionInfo` + `EncryptedPackage`) when password
//! protected. xls is a compound file whose `Workbook` stream may carry an RC4
//! FILEPASS record.
//!
//! Passwords are explicit arguments. Key material lives in zeroizing buffers
//! inside the scheme modules and never outlives a call.

mod agile;
pub(crate) mod biff;
mod biff_rc4;
mod crypto;
mod standard;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CFB_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

const ENCRYPTION_INFO: &str = "EncryptionInfo";
const ENCRYPTED_PACKAGE: &str = "EncryptedPackage";
const WORKBOOK_STREAMS: [&str; 2] = ["Workbook", "Book"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Xls,
    Xlsx,
}

impl DocumentKind {
    pub fn from_extension(extension: &str) -> Result<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "xls" => Ok(DocumentKind::Xls),
            "xlsx" => Ok(DocumentKind::Xlsx),
            other => Err(Error::UnsupportedKind(format!("file extension '{}'", other))),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| Error::UnsupportedKind(format!("{} has no extension", path.display())))?;
        Self::from_extension(extension)
    }

    pub fn extension(self) -> &'static str {
        match self {
            DocumentKind::Xls => "xls",
            DocumentKind::Xlsx => "xlsx",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A document with any encryption removed, ready for the reader or writer
#[derive(Debug, Clone)]
pub struct OpenedDocument {
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

/// Outer shape of a document, before any decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Package,
    EncryptedPackage,
    Workbook(&'static str),
}

impl Container {
    fn classify(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(ZIP_MAGIC) {
            return Ok(Container::Package);
        }
        if !bytes.starts_with(CFB_MAGIC) {
            return Err(Error::UnsupportedKind("unrecognized container".to_string()));
        }
        let compound = cfb::CompoundFile::open(Cursor::new(bytes))?;
        if compound.is_stream(ENCRYPTION_INFO) {
            return Ok(Container::EncryptedPackage);
        }
        workbook_stream_name(&compound)
            .map(Container::Workbook)
            .ok_or_else(|| {
                Error::UnsupportedKind(
                    "compound file holds neither a workbook nor an encrypted package".to_string(),
                )
            })
    }
}

/// Open a document, decrypting it when `password` is given.
///
/// A password for a plain document, an incorrect password, and a missing
/// password for an encrypted document are all password errors.
pub fn open(bytes: Vec<u8>, password: Option<&str>) -> Result<OpenedDocument> {
    let name = match Container::classify(&bytes)? {
        Container::Package => {
            log::debug!("detected plain xlsx package");
            if password.is_some() {
                return Err(Error::WrongPassword);
            }
            return Ok(OpenedDocument {
                kind: DocumentKind::Xlsx,
                bytes,
            });
        }
        Container::EncryptedPackage => {
            let password = password.ok_or(Error::PasswordRequired)?;
            let mut compound = cfb::CompoundFile::open(Cursor::new(&bytes[..]))?;
            let info = read_stream(&mut compound, ENCRYPTION_INFO)?;
            let package = read_stream(&mut compound, ENCRYPTED_PACKAGE)?;
            let plain = decrypt_package(&info, &package, password)?;
            if !plain.starts_with(ZIP_MAGIC) {
                return Err(Error::malformed("decrypted package is not a zip archive"));
            }
            return Ok(OpenedDocument {
                kind: DocumentKind::Xlsx,
                bytes: plain,
            });
        }
        Container::Workbook(name) => name,
    };

    let mut compound = cfb::CompoundFile::open(Cursor::new(&bytes[..]))?;
    let stream = read_stream(&mut compound, name)?;
    drop(compound);

    match (biff_rc4::FilePass::find(&stream)?, password) {
        (None, None) => {
            log::debug!("detected plain xls workbook");
            Ok(OpenedDocument {
                kind: DocumentKind::Xls,
                bytes,
            })
        }
        (None, Some(_)) => Err(Error::WrongPassword),
        (Some(_), None) => Err(Error::PasswordRequired),
        (Some(pass), Some(password)) => {
            log::debug!("detected RC4 encrypted xls workbook");
            let plain = biff_rc4::decrypt(&stream, &pass, password)?;
            Ok(OpenedDocument {
                kind: DocumentKind::Xls,
                bytes: replace_stream(&bytes, name, &plain)?,
            })
        }
    }
}

/// Produce the bytes to persist, encrypting when `password` is given
pub fn seal(kind: DocumentKind, bytes: Vec<u8>, password: Option<&str>) -> Result<Vec<u8>> {
    match kind {
        DocumentKind::Xlsx => match password {
            None => Ok(bytes),
            Some(password) => {
                log::debug!("encrypting xlsx package with Agile encryption");
                let (info, package) = agile::encrypt(&bytes, password)?;
                let mut compound = cfb::CompoundFile::create(Cursor::new(Vec::new()))?;
                compound.create_stream(ENCRYPTION_INFO)?.write_all(&info)?;
                compound.create_stream(ENCRYPTED_PACKAGE)?.write_all(&package)?;
                compound.flush()?;
                Ok(compound.into_inner().into_inner())
            }
        },
        DocumentKind::Xls => {
            let mut compound = cfb::CompoundFile::open(Cursor::new(&bytes[..]))?;
            let name = workbook_stream_name(&compound)
                .ok_or_else(|| Error::malformed("xls container has no Workbook stream"))?;
            let stream = read_stream(&mut compound, name)?;
            drop(compound);

            let plain = biff_rc4::strip_mask(&stream)?;
            let sealed = match password {
                Some(password) => {
                    log::debug!("encrypting xls workbook stream with RC4");
                    biff_rc4::encrypt(&plain, password)?
                }
                None => plain,
            };
            if sealed == stream {
                return Ok(bytes);
            }
            replace_stream(&bytes, name, &sealed)
        }
    }
}

fn decrypt_package(info: &[u8], package: &[u8], password: &str) -> Result<Vec<u8>> {
    let version = |at: usize| info.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
    match (version(0), version(2)) {
        (Some(4), Some(4)) => {
            log::debug!("detected Agile encrypted xlsx package");
            agile::decrypt(info, package, password)
        }
        (Some(2..=4), Some(2)) => {
            log::debug!("detected Standard encrypted xlsx package");
            standard::decrypt(info, package, password)
        }
        (Some(major), Some(minor)) => Err(Error::UnsupportedKind(format!(
            "EncryptionInfo version {}.{}",
            major, minor
        ))),
        _ => Err(Error::malformed("EncryptionInfo stream is truncated")),
    }
}

pub(crate) fn workbook_stream_name<F: Read + Seek>(
    compound: &cfb::CompoundFile<F>,
) -> Option<&'static str> {
    WORKBOOK_STREAMS
        .into_iter()
        .find(|name| compound.is_stream(name))
}

pub(crate) fn read_stream<F: Read + Seek>(
    compound: &mut cfb::CompoundFile<F>,
    name: &str,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    compound.open_stream(name)?.read_to_end(&mut data)?;
    Ok(data)
}

/// Rewrite one stream of a compound file, keeping every other entry
pub(crate) fn replace_stream(container: &[u8], name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut compound = cfb::CompoundFile::open(Cursor::new(container.to_vec()))?;
    {
        let mut stream = compound.create_stream(name)?;
        stream.write_all(data)?;
        stream.flush()?;
    }
    compound.flush()?;
    Ok(compound.into_inner().into_inner())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Compound file with a single `Workbook` stream
    pub fn xls_container(stream: &[u8]) -> Vec<u8> {
        let mut compound = cfb::CompoundFile::create(Cursor::new(Vec::new())).unwrap();
        compound
            .create_stream("Workbook")
            .unwrap()
            .write_all(stream)
            .unwrap();
        compound.flush().unwrap();
        compound.into_inner().into_inner()
    }

    pub fn workbook_stream(container: &[u8]) -> Vec<u8> {
        let mut compound = cfb::CompoundFile::open(Cursor::new(container)).unwrap();
        read_stream(&mut compound, "Workbook").unwrap()
    }
}
