//! RC4 encryption of BIFF8 workbook streams (FILEPASS)
//!
//! Two RC4 variants share the record layout. The legacy variant (version 1.1)
//! derives block keys with MD5 from a 40-bit base. The CryptoAPI variant
//! (versions 2.2 to 4.2) derives them with SHA-1 and announces its key size
//! in an EncryptionHeader.
//!
//! Every record after FILEPASS is encrypted in place, except for the few
//! records that must stay readable (BOF, FILEPASS, INTERFACEHDR and the
//! shared workbook locks) and the stream position at the start of each
//! BOUNDSHEET. The keystream is indexed by absolute stream offset and is
//! rekeyed every 1024 bytes, so headers consume keystream without being
//! encrypted.

use super::biff::{
    self, BOF, BOUNDSHEET, EOF, FILEPASS, INTERFACEHDR, MASKED, Record, WorkbookStream,
};
use super::crypto::{HashAlgorithm, ct_eq, iterated_hash, password_utf16le, random_bytes};
use crate::error::{Error, Result};
use cipher::consts::U16;
use cipher::{KeyInit, StreamCipher};
use md5::{Digest, Md5};
use rc4::Rc4;
use zeroize::Zeroizing;

const BLOCK_LEN: usize = 1024;
const SALT_LEN: usize = 16;
const RC4_KEY_LEN: usize = 16;

const BOF_BIFF5: u16 = 0x0009;
const USR_EXCL: u16 = 0x0194;
const FILE_LOCK: u16 = 0x0195;
const RRD_INFO: u16 = 0x0196;
const RRD_HEAD: u16 = 0x0138;

const FLAG_CRYPTOAPI: u32 = 0x04;
const CALG_RC4: u32 = 0x6801;
const CALG_SHA1: u32 = 0x8004;
const PROV_RSA_FULL: u32 = 1;
const SHA1_LEN: usize = 20;
const CSP_NAME: &str = "Microsoft Enhanced Cryptographic Provider v1.0";
/// Offset of the EncryptionHeader inside a CryptoAPI FILEPASS payload
const CRYPTOAPI_HEADER: usize = 14;

/// RC4 variant announced by FILEPASS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Legacy,
    /// `key_bits` is 40 or 128
    CryptoApi { key_bits: u32 },
}

/// Parsed FILEPASS record of an RC4 protected workbook
#[derive(Debug, Clone)]
pub struct FilePass {
    scheme: Scheme,
    salt: [u8; SALT_LEN],
    encrypted_verifier: [u8; SALT_LEN],
    encrypted_verifier_hash: Vec<u8>,
    /// Stream offset of the first record after FILEPASS
    end: usize,
}

impl FilePass {
    /// Locate and parse FILEPASS in the globals substream, if any
    pub fn find(stream: &[u8]) -> Result<Option<Self>> {
        for (offset, id, len) in biff::record_headers(stream)? {
            match id {
                FILEPASS => {
                    let data = &stream[offset + 4..offset + 4 + len];
                    return Self::parse(data, offset + 4 + len).map(Some);
                }
                EOF => break,
                _ => {}
            }
        }
        Ok(None)
    }

    fn parse(data: &[u8], end: usize) -> Result<Self> {
        let field = |at: usize| data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
        match field(0) {
            Some(1) => {}
            Some(0) => return Err(Error::UnsupportedKind("XOR obfuscated xls".to_string())),
            _ => return Err(Error::malformed("FILEPASS record has an unknown encryption type")),
        }
        match (field(2), field(4)) {
            (Some(1), _) => Self::parse_legacy(data, end),
            (Some(2..=4), Some(2)) => Self::parse_cryptoapi(data, end),
            (Some(major), Some(minor)) => Err(Error::UnsupportedKind(format!(
                "RC4 encryption version {}.{}",
                major, minor
            ))),
            _ => Err(Error::malformed("FILEPASS record is truncated")),
        }
    }

    fn parse_legacy(data: &[u8], end: usize) -> Result<Self> {
        if data.len() < 6 + 3 * SALT_LEN {
            return Err(Error::malformed("FILEPASS record is truncated"));
        }
        let mut pass = Self {
            scheme: Scheme::Legacy,
            salt: [0; SALT_LEN],
            encrypted_verifier: [0; SALT_LEN],
            encrypted_verifier_hash: data[38..54].to_vec(),
            end,
        };
        pass.salt.copy_from_slice(&data[6..22]);
        pass.encrypted_verifier.copy_from_slice(&data[22..38]);
        Ok(pass)
    }

    fn parse_cryptoapi(data: &[u8], end: usize) -> Result<Self> {
        let truncated = || Error::malformed("CryptoAPI FILEPASS record is truncated");
        let u32_at = |at: usize| {
            data.get(at..at + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(truncated)
        };
        let bytes_at = |at: usize, len: usize| data.get(at..at + len).ok_or_else(truncated);

        let header_size = u32_at(10)? as usize;
        let alg_id = u32_at(CRYPTOAPI_HEADER + 8)?;
        let alg_id_hash = u32_at(CRYPTOAPI_HEADER + 12)?;
        if !matches!(alg_id, 0 | CALG_RC4) || !matches!(alg_id_hash, 0 | CALG_SHA1) {
            return Err(Error::UnsupportedKind(format!(
                "CryptoAPI algorithm 0x{:04X} with hash 0x{:04X}",
                alg_id, alg_id_hash
            )));
        }
        let key_bits = match u32_at(CRYPTOAPI_HEADER + 16)? {
            0 | 40 => 40,
            128 => 128,
            other => {
                return Err(Error::UnsupportedKind(format!("{}-bit CryptoAPI RC4 key", other)));
            }
        };

        let verifier = CRYPTOAPI_HEADER
            .checked_add(header_size)
            .ok_or_else(truncated)?;
        if u32_at(verifier)? as usize != SALT_LEN {
            return Err(Error::malformed("CryptoAPI salt must be 16 bytes"));
        }
        let hash_len = u32_at(verifier + 4 + 2 * SALT_LEN)? as usize;
        if hash_len != SHA1_LEN {
            return Err(Error::malformed("CryptoAPI verifier hash must be 20 bytes"));
        }

        let mut pass = Self {
            scheme: Scheme::CryptoApi { key_bits },
            salt: [0; SALT_LEN],
            encrypted_verifier: [0; SALT_LEN],
            encrypted_verifier_hash: bytes_at(verifier + 8 + 2 * SALT_LEN, hash_len)?.to_vec(),
            end,
        };
        pass.salt.copy_from_slice(bytes_at(verifier + 4, SALT_LEN)?);
        pass.encrypted_verifier
            .copy_from_slice(bytes_at(verifier + 4 + SALT_LEN, SALT_LEN)?);
        Ok(pass)
    }

    /// Fresh salt and verifier for `password`, with the schedule that encrypts under them
    fn seal(scheme: Scheme, password: &str) -> Result<(Self, KeySchedule)> {
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&random_bytes(SALT_LEN));
        let schedule = KeySchedule::derive(scheme, password, &salt);

        let verifier = Zeroizing::new(random_bytes(SALT_LEN));
        let mut buf = Zeroizing::new(verifier.to_vec());
        buf.extend(schedule.verifier_digest(&verifier));
        schedule.cipher_for_block(0)?.apply_keystream(&mut buf);

        let mut encrypted_verifier = [0u8; SALT_LEN];
        encrypted_verifier.copy_from_slice(&buf[..SALT_LEN]);
        let pass = Self {
            scheme,
            salt,
            encrypted_verifier,
            encrypted_verifier_hash: buf[SALT_LEN..].to_vec(),
            end: 0,
        };
        Ok((pass, schedule))
    }

    fn to_record(&self) -> Record {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_le_bytes());
        match self.scheme {
            Scheme::Legacy => {
                for field in [1u16, 1] {
                    data.extend_from_slice(&field.to_le_bytes());
                }
                data.extend_from_slice(&self.salt);
                data.extend_from_slice(&self.encrypted_verifier);
                data.extend_from_slice(&self.encrypted_verifier_hash);
            }
            Scheme::CryptoApi { key_bits } => {
                for field in [4u16, 2] {
                    data.extend_from_slice(&field.to_le_bytes());
                }
                let csp: Vec<u8> = CSP_NAME
                    .encode_utf16()
                    .chain([0])
                    .flat_map(u16::to_le_bytes)
                    .collect();
                let header = [
                    FLAG_CRYPTOAPI,
                    0,
                    CALG_RC4,
                    CALG_SHA1,
                    key_bits,
                    PROV_RSA_FULL,
                    0,
                    0,
                ];
                let header_size = (header.len() * 4 + csp.len()) as u32;
                for field in [FLAG_CRYPTOAPI, header_size].into_iter().chain(header) {
                    data.extend_from_slice(&field.to_le_bytes());
                }
                data.extend_from_slice(&csp);

                data.extend_from_slice(&(SALT_LEN as u32).to_le_bytes());
                data.extend_from_slice(&self.salt);
                data.extend_from_slice(&self.encrypted_verifier);
                data.extend_from_slice(&(self.encrypted_verifier_hash.len() as u32).to_le_bytes());
                data.extend_from_slice(&self.encrypted_verifier_hash);
            }
        }
        Record::new(FILEPASS, data)
    }

    /// Derive the key schedule, failing with `WrongPassword` on a verifier mismatch
    fn unlock(&self, password: &str) -> Result<KeySchedule> {
        let schedule = KeySchedule::derive(self.scheme, password, &self.salt);
        let mut buf = Zeroizing::new(self.encrypted_verifier.to_vec());
        buf.extend_from_slice(&self.encrypted_verifier_hash);
        schedule.cipher_for_block(0)?.apply_keystream(&mut buf);

        let computed = schedule.verifier_digest(&buf[..SALT_LEN]);
        if ct_eq(&computed, &buf[SALT_LEN..]) {
            Ok(schedule)
        } else {
            Err(Error::WrongPassword)
        }
    }
}

/// Truncated MD5 key mixed with the salt, shared by all legacy blocks
fn legacy_base_key(password: &str, salt: &[u8]) -> Zeroizing<Vec<u8>> {
    let h0 = Zeroizing::new(Md5::digest(&password_utf16le(password)[..]).to_vec());
    let mut hasher = Md5::new();
    for _ in 0..16 {
        hasher.update(&h0[..5]);
        hasher.update(salt);
    }
    let h1 = Zeroizing::new(hasher.finalize().to_vec());
    Zeroizing::new(h1[..5].to_vec())
}

/// Password-derived base key and the rule turning it into per-block RC4 keys
enum KeySchedule {
    /// `MD5(base || block)`
    Legacy(Zeroizing<Vec<u8>>),
    /// `SHA1(base || block)` cut to `key_len` bytes; a 40-bit key is zero padded to 128 bits
    CryptoApi {
        base: Zeroizing<Vec<u8>>,
        key_len: usize,
    },
}

impl KeySchedule {
    fn derive(scheme: Scheme, password: &str, salt: &[u8]) -> Self {
        match scheme {
            Scheme::Legacy => KeySchedule::Legacy(legacy_base_key(password, salt)),
            Scheme::CryptoApi { key_bits } => KeySchedule::CryptoApi {
                base: iterated_hash(HashAlgorithm::Sha1, salt, password, 0),
                key_len: key_bits as usize / 8,
            },
        }
    }

    fn cipher_for_block(&self, block: u32) -> Result<Rc4<U16>> {
        let block = block.to_le_bytes();
        let key = match self {
            KeySchedule::Legacy(base) => {
                let mut hasher = Md5::new();
                hasher.update(&base[..]);
                hasher.update(block);
                Zeroizing::new(hasher.finalize().to_vec())
            }
            KeySchedule::CryptoApi { base, key_len } => {
                let mut key =
                    Zeroizing::new(HashAlgorithm::Sha1.digest(&[&base[..], &block[..]]));
                key.truncate(*key_len);
                key.resize(RC4_KEY_LEN, 0);
                key
            }
        };
        Rc4::<U16>::new_from_slice(&key).map_err(|_| Error::malformed("invalid RC4 key length"))
    }

    fn verifier_digest(&self, verifier: &[u8]) -> Vec<u8> {
        match self {
            KeySchedule::Legacy(_) => Md5::digest(verifier).to_vec(),
            KeySchedule::CryptoApi { .. } => HashAlgorithm::Sha1.digest(&[verifier]),
        }
    }
}

/// RC4 keystream addressed by absolute stream offset
struct Keystream<'a> {
    schedule: &'a KeySchedule,
    block: u32,
    cipher: Rc4<U16>,
    position: usize,
}

impl<'a> Keystream<'a> {
    fn new(schedule: &'a KeySchedule) -> Result<Self> {
        Ok(Self {
            schedule,
            block: 0,
            cipher: schedule.cipher_for_block(0)?,
            position: 0,
        })
    }

    fn rekey(&mut self, block: u32) -> Result<()> {
        self.cipher = self.schedule.cipher_for_block(block)?;
        self.block = block;
        self.position = block as usize * BLOCK_LEN;
        Ok(())
    }

    fn seek(&mut self, offset: usize) -> Result<()> {
        let block = (offset / BLOCK_LEN) as u32;
        if block != self.block || offset < self.position {
            self.rekey(block)?;
        }
        let mut scratch = [0u8; BLOCK_LEN];
        let skip = offset - self.position;
        self.cipher.apply_keystream(&mut scratch[..skip]);
        self.position = offset;
        Ok(())
    }

    fn apply(&mut self, offset: usize, data: &mut [u8]) -> Result<()> {
        self.seek(offset)?;
        let mut done = 0;
        while done < data.len() {
            let block_end = (self.block as usize + 1) * BLOCK_LEN;
            if self.position == block_end {
                self.rekey(self.block + 1)?;
                continue;
            }
            let take = (data.len() - done).min(block_end - self.position);
            self.cipher.apply_keystream(&mut data[done..done + take]);
            self.position += take;
            done += take;
        }
        Ok(())
    }
}

fn stays_plain(id: u16) -> bool {
    matches!(
        id,
        BOF | BOF_BIFF5 | FILEPASS | INTERFACEHDR | USR_EXCL | FILE_LOCK | RRD_INFO | RRD_HEAD
    )
}

/// XOR the keystream into every encrypted record payload from `start` on
fn apply_to_records(stream: &mut [u8], start: usize, schedule: &KeySchedule) -> Result<()> {
    let mut keystream = Keystream::new(schedule)?;
    for (offset, id, len) in biff::record_headers(stream)? {
        if offset < start || stays_plain(id) {
            continue;
        }
        let plain_prefix = if id == BOUNDSHEET { len.min(4) } else { 0 };
        let from = offset + 4 + plain_prefix;
        let to = offset + 4 + len;
        if from < to {
            keystream.apply(from, &mut stream[from..to])?;
        }
    }
    Ok(())
}

/// Decrypt a protected workbook stream.
///
/// The FILEPASS record id is replaced by a placeholder so that readers
/// treat the result as a plain workbook while stream offsets stay valid.
pub fn decrypt(stream: &[u8], pass: &FilePass, password: &str) -> Result<Vec<u8>> {
    let schedule = pass.unlock(password)?;
    log::debug!("decrypting {:?} RC4 workbook stream", pass.scheme);
    let mut plain = stream.to_vec();
    apply_to_records(&mut plain, pass.end, &schedule)?;

    for (offset, id, _) in biff::record_headers(&plain)? {
        if id == FILEPASS {
            plain[offset..offset + 2].copy_from_slice(&MASKED.to_le_bytes());
            break;
        }
    }
    Ok(plain)
}

/// Encrypt a plain workbook stream with a fresh salt and verifier
pub fn encrypt(stream: &[u8], password: &str) -> Result<Vec<u8>> {
    encrypt_with(stream, Scheme::Legacy, password)
}

fn encrypt_with(stream: &[u8], scheme: Scheme, password: &str) -> Result<Vec<u8>> {
    let mut workbook = WorkbookStream::parse(stream)?;
    if workbook.globals.iter().any(|r| r.id == FILEPASS) {
        return Err(Error::malformed("workbook stream is already encrypted"));
    }
    let removed = remove_masks(&mut workbook.globals);

    let (pass, schedule) = FilePass::seal(scheme, password)?;
    let record = pass.to_record();
    let delta = record.size() as i64 - removed as i64;
    workbook.globals.insert(1, record);
    biff::shift_extsst(&mut workbook.globals, delta);

    let mut bytes = workbook.to_bytes();
    let start = FilePass::find(&bytes)?
        .map(|p| p.end)
        .ok_or_else(|| Error::malformed("FILEPASS record was not written"))?;
    apply_to_records(&mut bytes, start, &schedule)?;
    Ok(bytes)
}

/// Drop the placeholder left behind by [`decrypt`]
pub fn strip_mask(stream: &[u8]) -> Result<Vec<u8>> {
    let mut workbook = WorkbookStream::parse(stream)?;
    let removed = remove_masks(&mut workbook.globals);
    if removed == 0 {
        return Ok(stream.to_vec());
    }
    biff::shift_extsst(&mut workbook.globals, -(removed as i64));
    Ok(workbook.to_bytes())
}

fn remove_masks(globals: &mut Vec<Record>) -> usize {
    let removed = globals
        .iter()
        .filter(|r| r.id == MASKED)
        .map(Record::size)
        .sum();
    globals.retain(|r| r.id != MASKED);
    removed
}
