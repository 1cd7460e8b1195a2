//! Hash, HMAC and AES primitives shared by the OOXML encryption schemes

use crate::error::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(Error::UnsupportedKind(format!("hash algorithm {}", name))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hash the concatenation of `parts`
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            HashAlgorithm::Sha1 => run::<Sha1>(parts),
            HashAlgorithm::Sha256 => run::<Sha256>(parts),
            HashAlgorithm::Sha384 => run::<Sha384>(parts),
            HashAlgorithm::Sha512 => run::<Sha512>(parts),
        }
    }

    pub fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        macro_rules! mac {
            ($hash:ty) => {{
                let mut mac = <Hmac<$hash> as Mac>::new_from_slice(key)
                    .map_err(|_| Error::malformed("invalid HMAC key"))?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }};
        }

        Ok(match self {
            HashAlgorithm::Sha1 => mac!(Sha1),
            HashAlgorithm::Sha256 => mac!(Sha256),
            HashAlgorithm::Sha384 => mac!(Sha384),
            HashAlgorithm::Sha512 => mac!(Sha512),
        })
    }
}

pub fn password_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(
        password
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
    )
}

/// `H = Hash(salt || password)`, then `H = Hash(LE32(i) || H)` for each spin
pub fn iterated_hash(
    hash: HashAlgorithm,
    salt: &[u8],
    password: &str,
    spin_count: u32,
) -> Zeroizing<Vec<u8>> {
    let password = password_utf16le(password);
    let mut h = Zeroizing::new(hash.digest(&[salt, &password[..]]));
    for i in 0..spin_count {
        h = Zeroizing::new(hash.digest(&[&i.to_le_bytes()[..], &h[..]]));
    }
    h
}

/// Truncate or pad a derived key to `len` bytes
pub fn fit_to_len(mut bytes: Vec<u8>, len: usize, pad: u8) -> Vec<u8> {
    bytes.resize(len, pad);
    bytes
}

pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Zero-pad to a whole number of AES blocks
pub fn pad_to_block(mut bytes: Vec<u8>) -> Vec<u8> {
    let rem = bytes.len() % AES_BLOCK_SIZE;
    if rem != 0 {
        bytes.resize(bytes.len() + AES_BLOCK_SIZE - rem, 0);
    }
    bytes
}

fn invalid_key() -> Error {
    Error::malformed("invalid AES key or IV length")
}

pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::malformed("ciphertext is not block aligned"));
    }
    let mut buf = data.to_vec();
    let unpad = |_| Error::malformed("ciphertext is not block aligned");
    match key.len() {
        16 => {
            cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| invalid_key())?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(unpad)?;
        }
        24 => {
            cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| invalid_key())?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(unpad)?;
        }
        32 => {
            cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| invalid_key())?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(unpad)?;
        }
        _ => return Err(invalid_key()),
    }
    Ok(buf)
}

pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = pad_to_block(data.to_vec());
    let len = buf.len();
    let pad = |_| Error::malformed("plaintext is not block aligned");
    match key.len() {
        16 => {
            cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| invalid_key())?
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map_err(pad)?;
        }
        24 => {
            cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| invalid_key())?
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map_err(pad)?;
        }
        32 => {
            cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| invalid_key())?
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map_err(pad)?;
        }
        _ => return Err(invalid_key()),
    }
    Ok(buf)
}

pub fn aes_ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    fn run<C: BlockDecrypt + KeyInit>(key: &[u8], buf: &mut [u8]) -> Result<()> {
        let cipher = C::new_from_slice(key).map_err(|_| invalid_key())?;
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::malformed("ciphertext is not block aligned"));
    }
    let mut buf = data.to_vec();
    match key.len() {
        16 => run::<Aes128>(key, &mut buf)?,
        24 => run::<Aes192>(key, &mut buf)?,
        32 => run::<Aes256>(key, &mut buf)?,
        _ => return Err(invalid_key()),
    }
    Ok(buf)
}
