//! ECMA-376 Standard encryption (AES-ECB, SHA-1 key derivation), read only

use super::crypto::{HashAlgorithm, aes_ecb_decrypt, ct_eq, iterated_hash};
use crate::error::{Error, Result};
use zeroize::Zeroizing;

const SPIN_COUNT: u32 = 50_000;
const CALG_AES_128: u32 = 0x660E;
const CALG_AES_192: u32 = 0x660F;
const CALG_AES_256: u32 = 0x6610;

#[derive(Debug)]
struct StandardInfo {
    key_bits: usize,
    salt: Vec<u8>,
    encrypted_verifier: Vec<u8>,
    encrypted_verifier_hash: Vec<u8>,
}

pub fn decrypt(encryption_info: &[u8], package: &[u8], password: &str) -> Result<Vec<u8>> {
    let info = parse_encryption_info(encryption_info)?;
    let key = derive_key(&info, password);

    let verifier = aes_ecb_decrypt(&key, &info.encrypted_verifier)?;
    let verifier_hash = aes_ecb_decrypt(&key, &info.encrypted_verifier_hash)?;
    let computed = HashAlgorithm::Sha1.digest(&[&verifier[..]]);
    let expected = verifier_hash
        .get(..computed.len())
        .ok_or_else(|| Error::malformed("verifier hash is truncated"))?;
    if !ct_eq(&computed, expected) {
        return Err(Error::WrongPassword);
    }

    if package.len() < 8 {
        return Err(Error::malformed("encrypted package is truncated"));
    }
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&package[..8]);
    let size = u64::from_le_bytes(size_bytes) as usize;

    let body = &package[8..];
    let aligned = body.len() - body.len() % 16;
    let mut plain = aes_ecb_decrypt(&key, &body[..aligned])?;
    if plain.len() < size {
        return Err(Error::malformed("encrypted package is shorter than its declared size"));
    }
    plain.truncate(size);
    Ok(plain)
}

fn derive_key(info: &StandardInfo, password: &str) -> Zeroizing<Vec<u8>> {
    let sha1 = HashAlgorithm::Sha1;
    let h = iterated_hash(sha1, &info.salt, password, SPIN_COUNT);
    let h_final = Zeroizing::new(sha1.digest(&[&h[..], &0u32.to_le_bytes()[..]]));

    let mut inner = Zeroizing::new([0x36u8; 64]);
    let mut outer = Zeroizing::new([0x5cu8; 64]);
    for (i, byte) in h_final.iter().enumerate() {
        inner[i] ^= byte;
        outer[i] ^= byte;
    }

    let mut key = Zeroizing::new(sha1.digest(&[&inner[..]]));
    key.extend(sha1.digest(&[&outer[..]]));
    key.truncate(info.key_bits / 8);
    key
}

fn parse_encryption_info(bytes: &[u8]) -> Result<StandardInfo> {
    let truncated = || Error::malformed("Standard EncryptionInfo is truncated");
    let u32_at = |offset: usize| -> Result<u32> {
        bytes
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(truncated)
    };

    let header_size = u32_at(8)? as usize;
    let header = 12;
    let alg_id = u32_at(header + 8)?;
    let key_bits = match (alg_id, u32_at(header + 16)?) {
        (CALG_AES_128 | CALG_AES_192 | CALG_AES_256, bits) if matches!(bits, 128 | 192 | 256) => {
            bits as usize
        }
        (alg, _) => {
            return Err(Error::UnsupportedKind(format!(
                "Standard encryption algorithm 0x{:04X}",
                alg
            )));
        }
    };

    let verifier = header + header_size;
    let salt_size = u32_at(verifier)? as usize;
    let salt_start = verifier + 4;
    let verifier_start = salt_start + salt_size;
    let hash_start = verifier_start + 16 + 4;

    Ok(StandardInfo {
        key_bits,
        salt: bytes
            .get(salt_start..verifier_start)
            .ok_or_else(truncated)?
            .to_vec(),
        encrypted_verifier: bytes
            .get(verifier_start..verifier_start + 16)
            .ok_or_else(truncated)?
            .to_vec(),
        encrypted_verifier_hash: bytes
            .get(hash_start..hash_start + 32)
            .ok_or_else(truncated)?
            .to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::Aes128;
    use cipher::generic_array::GenericArray;
    use cipher::{BlockEncrypt, KeyInit};

    fn ecb_encrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
        let cipher = Aes128::new_from_slice(key).unwrap();
        let mut buf = data.to_vec();
        for block in buf.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        buf
    }

    fn encryption_info(password: &str, salt: [u8; 16], verifier: [u8; 16]) -> (Vec<u8>, Vec<u8>) {
        let info = StandardInfo {
            key_bits: 128,
            salt: salt.to_vec(),
            encrypted_verifier: Vec::new(),
            encrypted_verifier_hash: Vec::new(),
        };
        let key = derive_key(&info, password);

        let mut verifier_hash = HashAlgorithm::Sha1.digest(&[&verifier[..]]);
        verifier_hash.resize(32, 0);

        let mut header = Vec::new();
        for value in [0x24u32, 0, CALG_AES_128, 0x8004, 128, 0x18, 0, 0] {
            header.extend_from_slice(&value.to_le_bytes());
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&0x24u32.to_le_bytes());
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend(header);
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&salt);
        bytes.extend(ecb_encrypt(&key, &verifier));
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend(ecb_encrypt(&key, &verifier_hash));
        (bytes, key.to_vec())
    }

    #[test]
    fn test_decrypts_package() {
        let (info, key) = encryption_info("pw", [3u8; 16], [5u8; 16]);
        let plain = b"PK\x03\x04 some zip bytes".to_vec();
        let mut package = (plain.len() as u64).to_le_bytes().to_vec();
        let mut padded = plain.clone();
        padded.resize(32, 0);
        package.extend(ecb_encrypt(&key, &padded));

        assert_eq!(decrypt(&info, &package, "pw").unwrap(), plain);
    }

    #[test]
    fn test_wrong_password() {
        let (info, _) = encryption_info("pw", [3u8; 16], [5u8; 16]);
        let package = vec![0u8; 24];
        assert!(matches!(decrypt(&info, &package, "nope"), Err(Error::WrongPassword)));
    }
}
