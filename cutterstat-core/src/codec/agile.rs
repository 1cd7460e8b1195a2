//! ECMA-376 Agile encryption of OOXML packages
//!
//! The package is encrypted with a random secret key in 4096 byte segments
//! (AES-CBC, per-segment IV). The secret key is wrapped with a key derived
//! from the password, and an HMAC over the encrypted stream guards integrity.

use super::crypto::{
    self, HashAlgorithm, aes_cbc_decrypt, aes_cbc_encrypt, ct_eq, fit_to_len, iterated_hash,
};
use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use zeroize::Zeroizing;

const BLOCK_VERIFIER_INPUT: [u8; 8] = [0xfe, 0xa7, 0xd2, 0x76, 0x3b, 0x4b, 0x9e, 0x79];
const BLOCK_VERIFIER_VALUE: [u8; 8] = [0xd7, 0xaa, 0x0f, 0x6d, 0x30, 0x61, 0x34, 0x4e];
const BLOCK_KEY_VALUE: [u8; 8] = [0x14, 0x6e, 0x0b, 0xe7, 0xab, 0xac, 0xd0, 0xd6];
const BLOCK_INTEGRITY_KEY: [u8; 8] = [0x5f, 0xb2, 0xad, 0x01, 0x0c, 0xb9, 0xe1, 0xf6];
const BLOCK_INTEGRITY_VALUE: [u8; 8] = [0xa0, 0x67, 0x7f, 0x02, 0xb2, 0x2c, 0x84, 0x33];

const SEGMENT_LEN: usize = 4096;
const SALT_LEN: usize = 16;
const KEY_BITS: usize = 256;
const WRITE_HASH: HashAlgorithm = HashAlgorithm::Sha512;

pub const DEFAULT_SPIN_COUNT: u32 = 100_000;

/// Parameters of the `keyData` element
#[derive(Debug, Clone)]
struct KeyData {
    salt: Vec<u8>,
    hash: HashAlgorithm,
    key_bits: usize,
    block_size: usize,
}

impl KeyData {
    /// IV for a package segment or an integrity block
    fn iv(&self, block: &[u8]) -> Vec<u8> {
        fit_to_len(self.hash.digest(&[&self.salt[..], block]), self.block_size, 0x36)
    }
}

/// Parameters of the password `encryptedKey` element
#[derive(Debug, Clone)]
struct PasswordKey {
    salt: Vec<u8>,
    hash: HashAlgorithm,
    key_bits: usize,
    spin_count: u32,
    verifier_hash_input: Vec<u8>,
    verifier_hash_value: Vec<u8>,
    key_value: Vec<u8>,
}

impl PasswordKey {
    fn derive(&self, h: &[u8], block: &[u8]) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(fit_to_len(
            self.hash.digest(&[h, block]),
            self.key_bits / 8,
            0x36,
        ))
    }
}

#[derive(Debug, Clone)]
struct AgileInfo {
    key_data: KeyData,
    password_key: PasswordKey,
    /// encryptedHmacKey and encryptedHmacValue
    integrity: Option<(Vec<u8>, Vec<u8>)>,
}

/// Decrypt an `EncryptedPackage` stream described by an Agile `EncryptionInfo` stream
pub fn decrypt(encryption_info: &[u8], package: &[u8], password: &str) -> Result<Vec<u8>> {
    let info = parse_encryption_info(encryption_info)?;
    let secret_key = unwrap_secret_key(&info.password_key, password)?;

    if let Some((hmac_key, hmac_value)) = &info.integrity {
        verify_integrity(&info.key_data, &secret_key, hmac_key, hmac_value, package)?;
    }

    decrypt_package(&info.key_data, &secret_key, package)
}

/// Encrypt a zip package; returns the `EncryptionInfo` and `EncryptedPackage` streams
pub fn encrypt(package: &[u8], password: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    encrypt_with_spin_count(package, password, DEFAULT_SPIN_COUNT)
}

pub(crate) fn encrypt_with_spin_count(
    package: &[u8],
    password: &str,
    spin_count: u32,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_data = KeyData {
        salt: crypto::random_bytes(SALT_LEN),
        hash: WRITE_HASH,
        key_bits: KEY_BITS,
        block_size: crypto::AES_BLOCK_SIZE,
    };
    let secret_key = Zeroizing::new(crypto::random_bytes(KEY_BITS / 8));

    // 1. Package segments
    let mut encrypted = Vec::with_capacity(package.len() + 8 + crypto::AES_BLOCK_SIZE);
    encrypted.extend_from_slice(&(package.len() as u64).to_le_bytes());
    for (index, segment) in package.chunks(SEGMENT_LEN).enumerate() {
        let iv = key_data.iv(&(index as u32).to_le_bytes());
        encrypted.extend(aes_cbc_encrypt(&secret_key, &iv, segment)?);
    }

    // 2. Password key encryptor
    let mut password_key = PasswordKey {
        salt: crypto::random_bytes(SALT_LEN),
        hash: WRITE_HASH,
        key_bits: KEY_BITS,
        spin_count,
        verifier_hash_input: Vec::new(),
        verifier_hash_value: Vec::new(),
        key_value: Vec::new(),
    };
    let h = iterated_hash(WRITE_HASH, &password_key.salt, password, spin_count);
    let verifier = crypto::random_bytes(SALT_LEN);
    let verifier_hash = WRITE_HASH.digest(&[&verifier[..]]);
    let iv = password_key.salt.clone();

    password_key.verifier_hash_input = aes_cbc_encrypt(
        &password_key.derive(&h, &BLOCK_VERIFIER_INPUT),
        &iv,
        &verifier,
    )?;
    password_key.verifier_hash_value = aes_cbc_encrypt(
        &password_key.derive(&h, &BLOCK_VERIFIER_VALUE),
        &iv,
        &verifier_hash,
    )?;
    password_key.key_value =
        aes_cbc_encrypt(&password_key.derive(&h, &BLOCK_KEY_VALUE), &iv, &secret_key)?;

    // 3. Data integrity
    let hmac_key = Zeroizing::new(crypto::random_bytes(WRITE_HASH.output_len()));
    let hmac_value = WRITE_HASH.hmac(&hmac_key, &encrypted)?;
    let encrypted_hmac_key =
        aes_cbc_encrypt(&secret_key, &key_data.iv(&BLOCK_INTEGRITY_KEY), &hmac_key)?;
    let encrypted_hmac_value =
        aes_cbc_encrypt(&secret_key, &key_data.iv(&BLOCK_INTEGRITY_VALUE), &hmac_value)?;

    let xml = encryption_xml(
        &key_data,
        &password_key,
        &encrypted_hmac_key,
        &encrypted_hmac_value,
    );
    let mut info = Vec::with_capacity(8 + xml.len());
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&4u16.to_le_bytes());
    info.extend_from_slice(&0x40u32.to_le_bytes());
    info.extend_from_slice(xml.as_bytes());

    Ok((info, encrypted))
}

fn unwrap_secret_key(key: &PasswordKey, password: &str) -> Result<Zeroizing<Vec<u8>>> {
    let h = iterated_hash(key.hash, &key.salt, password, key.spin_count);

    let verifier = aes_cbc_decrypt(
        &key.derive(&h, &BLOCK_VERIFIER_INPUT),
        &key.salt,
        &key.verifier_hash_input,
    )?;
    let verifier_hash = aes_cbc_decrypt(
        &key.derive(&h, &BLOCK_VERIFIER_VALUE),
        &key.salt,
        &key.verifier_hash_value,
    )?;

    let verifier = verifier
        .get(..SALT_LEN)
        .ok_or_else(|| Error::malformed("verifier hash input is truncated"))?;
    let computed = key.hash.digest(&[verifier]);
    let expected = verifier_hash
        .get(..computed.len())
        .ok_or_else(|| Error::malformed("verifier hash value is truncated"))?;
    if !ct_eq(&computed, expected) {
        return Err(Error::WrongPassword);
    }

    let key_len = key.key_bits / 8;
    let secret = Zeroizing::new(aes_cbc_decrypt(
        &key.derive(&h, &BLOCK_KEY_VALUE),
        &key.salt,
        &key.key_value,
    )?);
    let secret = secret
        .get(..key_len)
        .ok_or_else(|| Error::malformed("encrypted key value is truncated"))?;
    Ok(Zeroizing::new(secret.to_vec()))
}

fn verify_integrity(
    key_data: &KeyData,
    secret_key: &[u8],
    encrypted_hmac_key: &[u8],
    encrypted_hmac_value: &[u8],
    package: &[u8],
) -> Result<()> {
    let hash_len = key_data.hash.output_len();
    let hmac_key = Zeroizing::new(aes_cbc_decrypt(
        secret_key,
        &key_data.iv(&BLOCK_INTEGRITY_KEY),
        encrypted_hmac_key,
    )?);
    let hmac_value = aes_cbc_decrypt(
        secret_key,
        &key_data.iv(&BLOCK_INTEGRITY_VALUE),
        encrypted_hmac_value,
    )?;

    let hmac_key = hmac_key
        .get(..hash_len)
        .ok_or_else(|| Error::malformed("HMAC key is truncated"))?;
    let expected = hmac_value
        .get(..hash_len)
        .ok_or_else(|| Error::malformed("HMAC value is truncated"))?;
    let computed = key_data.hash.hmac(hmac_key, package)?;

    if !ct_eq(&computed, expected) {
        return Err(Error::IntegrityCheckFailed);
    }
    Ok(())
}

fn decrypt_package(key_data: &KeyData, secret_key: &[u8], package: &[u8]) -> Result<Vec<u8>> {
    if package.len() < 8 {
        return Err(Error::malformed("encrypted package is truncated"));
    }
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&package[..8]);
    let size = u64::from_le_bytes(size_bytes) as usize;

    let mut plain = Vec::with_capacity(package.len());
    for (index, segment) in package[8..].chunks(SEGMENT_LEN).enumerate() {
        let iv = key_data.iv(&(index as u32).to_le_bytes());
        plain.extend(aes_cbc_decrypt(secret_key, &iv, segment)?);
    }

    if plain.len() < size {
        return Err(Error::malformed("encrypted package is shorter than its declared size"));
    }
    plain.truncate(size);
    Ok(plain)
}

fn parse_encryption_info(bytes: &[u8]) -> Result<AgileInfo> {
    if bytes.len() < 8 || bytes[0..4] != [4, 0, 4, 0] {
        return Err(Error::malformed("not an Agile EncryptionInfo stream"));
    }
    let xml = bytes[8..].strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes[8..]);
    let xml = std::str::from_utf8(xml)
        .map_err(|_| Error::malformed("EncryptionInfo XML is not UTF-8"))?;

    let mut reader = Reader::from_str(xml);
    let mut key_data = None;
    let mut password_key = None;
    let mut integrity = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"keyData" => {
                    let attrs = attributes(&e)?;
                    key_data = Some(KeyData {
                        salt: decode_attr(&attrs, "saltValue")?,
                        hash: HashAlgorithm::from_name(attr(&attrs, "hashAlgorithm")?)?,
                        key_bits: number_attr(&attrs, "keyBits")?,
                        block_size: number_attr(&attrs, "blockSize")?,
                    });
                }
                b"dataIntegrity" => {
                    let attrs = attributes(&e)?;
                    integrity = Some((
                        decode_attr(&attrs, "encryptedHmacKey")?,
                        decode_attr(&attrs, "encryptedHmacValue")?,
                    ));
                }
                // certificate encryptors share the element name but carry no spin count
                b"encryptedKey" => {
                    let attrs = attributes(&e)?;
                    if attrs.contains_key("spinCount") {
                        password_key = Some(PasswordKey {
                            salt: decode_attr(&attrs, "saltValue")?,
                            hash: HashAlgorithm::from_name(attr(&attrs, "hashAlgorithm")?)?,
                            key_bits: number_attr(&attrs, "keyBits")?,
                            spin_count: number_attr(&attrs, "spinCount")?,
                            verifier_hash_input: decode_attr(
                                &attrs,
                                "encryptedVerifierHashInput",
                            )?,
                            verifier_hash_value: decode_attr(
                                &attrs,
                                "encryptedVerifierHashValue",
                            )?,
                            key_value: decode_attr(&attrs, "encryptedKeyValue")?,
                        });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(AgileInfo {
        key_data: key_data.ok_or_else(|| Error::malformed("EncryptionInfo has no keyData"))?,
        password_key: password_key
            .ok_or_else(|| Error::malformed("EncryptionInfo has no password key encryptor"))?,
        integrity,
    })
}

fn attributes(e: &BytesStart) -> Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        attrs.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(attrs)
}

fn attr<'a>(attrs: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    attrs
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::malformed(format!("EncryptionInfo is missing {}", name)))
}

fn decode_attr(attrs: &HashMap<String, String>, name: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(attr(attrs, name)?)
        .map_err(|_| Error::malformed(format!("EncryptionInfo {} is not base64", name)))
}

fn number_attr<T: std::str::FromStr>(attrs: &HashMap<String, String>, name: &str) -> Result<T> {
    attr(attrs, name)?
        .parse()
        .map_err(|_| Error::malformed(format!("EncryptionInfo {} is not a number", name)))
}

fn encryption_xml(
    key_data: &KeyData,
    password_key: &PasswordKey,
    encrypted_hmac_key: &[u8],
    encrypted_hmac_value: &[u8],
) -> String {
    let hash_size = key_data.hash.output_len();
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            "\r\n",
            r#"<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption" "#,
            r#"xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password" "#,
            r#"xmlns:c="http://schemas.microsoft.com/office/2006/keyEncryptor/certificate">"#,
            r#"<keyData saltSize="{salt_size}" blockSize="{block_size}" keyBits="{key_bits}" "#,
            r#"hashSize="{hash_size}" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" "#,
            r#"hashAlgorithm="{hash}" saltValue="{key_salt}"/>"#,
            r#"<dataIntegrity encryptedHmacKey="{hmac_key}" encryptedHmacValue="{hmac_value}"/>"#,
            r#"<keyEncryptors><keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">"#,
            r#"<p:encryptedKey spinCount="{spin_count}" saltSize="{salt_size}" blockSize="{block_size}" "#,
            r#"keyBits="{key_bits}" hashSize="{hash_size}" cipherAlgorithm="AES" "#,
            r#"cipherChaining="ChainingModeCBC" hashAlgorithm="{hash}" saltValue="{password_salt}" "#,
            r#"encryptedVerifierHashInput="{verifier_input}" "#,
            r#"encryptedVerifierHashValue="{verifier_value}" encryptedKeyValue="{key_value}"/>"#,
            r#"</keyEncryptor></keyEncryptors></encryption>"#,
        ),
        salt_size = key_data.salt.len(),
        block_size = key_data.block_size,
        key_bits = key_data.key_bits,
        hash_size = hash_size,
        hash = key_data.hash.name(),
        key_salt = BASE64.encode(&key_data.salt),
        hmac_key = BASE64.encode(encrypted_hmac_key),
        hmac_value = BASE64.encode(encrypted_hmac_value),
        spin_count = password_key.spin_count,
        password_salt = BASE64.encode(&password_key.salt),
        verifier_input = BASE64.encode(&password_key.verifier_hash_input),
        verifier_value = BASE64.encode(&password_key.verifier_hash_value),
        key_value = BASE64.encode(&password_key.key_value),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(len: usize) -> Vec<u8> {
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend((0..len).map(|i| (i % 251) as u8));
        bytes
    }

    #[test]
    fn test_roundtrip_across_segments() {
        let plain = package(SEGMENT_LEN * 2 + 100);
        let (info, encrypted) = encrypt_with_spin_count(&plain, "secret", 10).unwrap();

        assert_eq!(&info[..4], &[4, 0, 4, 0]);
        assert_eq!(&encrypted[..8], &(plain.len() as u64).to_le_bytes());
        assert_eq!(decrypt(&info, &encrypted, "secret").unwrap(), plain);
    }

    #[test]
    fn test_wrong_password_is_detected() {
        let plain = package(64);
        let (info, encrypted) = encrypt_with_spin_count(&plain, "secret", 10).unwrap();
        assert!(matches!(
            decrypt(&info, &encrypted, "Secret"),
            Err(Error::WrongPassword)
        ));
    }

    #[test]
    fn test_tampered_package_fails_integrity() {
        let plain = package(64);
        let (info, mut encrypted) = encrypt_with_spin_count(&plain, "secret", 10).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;
        assert!(matches!(
            decrypt(&info, &encrypted, "secret"),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_info_declares_default_parameters() {
        let (info, _) = encrypt(&package(16), "pw").unwrap();
        let xml = String::from_utf8(info[8..].to_vec()).unwrap();
        assert!(xml.contains(r#"spinCount="100000""#));
        assert!(xml.contains(r#"hashAlgorithm="SHA512""#));
        assert!(xml.contains(r#"keyBits="256""#));
    }
}
