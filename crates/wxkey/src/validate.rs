//! Known-ciphertext oracle that separates real keys from random bytes.
//!
//! The database oracle re-derives the page cipher material from a candidate
//! key and checks the HMAC trailer of the reference page (the first 4 KiB
//! page of a known encrypted database). The image oracle decrypts one AES
//! block sampled from an encrypted media file and looks for the JPEG SOI
//! marker. Both checks are pure and safe to run from many workers at once.

use std::path::{Path, PathBuf};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use sha1::Sha1;
use sha2::Sha512;

use crate::error::ExtractError;

/// Size of one database page, and of the reference page.
pub const PAGE_SIZE: usize = 4096;
/// Database keys are always 32 bytes.
pub const DB_KEY_SIZE: usize = 32;
/// Image keys are reported as their first 16 bytes.
pub const IMG_KEY_SIZE: usize = 16;

const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const AES_BLOCK_SIZE: usize = 16;
const HMAC_SHA1_SIZE: usize = 20;
const HMAC_SHA512_SIZE: usize = 64;
const PBKDF2_ROUNDS_V3: u32 = 64000;
const PBKDF2_ROUNDS_V4: u32 = 256000;
const MAC_SALT_XOR: u8 = 0x3a;
const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Client generation. Selects the page-derivation parameters and which
/// search strategies apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVersion {
    V3,
    V4,
}

/// Desktop platform the target client runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Darwin,
}

/// The validation oracle. Immutable after construction.
#[derive(Debug)]
pub struct Validator {
    version: ClientVersion,
    page: Box<[u8; PAGE_SIZE]>,
    img_sample: Option<[u8; AES_BLOCK_SIZE]>,
}

impl Validator {
    /// Build the oracle from the user's data directory, reading the first
    /// page of the version's known database file. For V4 on Windows an
    /// encrypted image sample is also located so image keys can be
    /// recognised; if none is found the image oracle simply stays off.
    pub fn new(
        platform: Platform,
        version: ClientVersion,
        data_dir: &Path,
    ) -> Result<Self, ExtractError> {
        let db_path = reference_db_path(version, data_dir);
        let bytes = std::fs::read(&db_path)
            .map_err(|_| ExtractError::ReferencePageMissing(db_path.clone()))?;
        if bytes.len() < PAGE_SIZE {
            return Err(ExtractError::ReferencePageMissing(db_path));
        }

        let mut page = Box::new([0u8; PAGE_SIZE]);
        page.copy_from_slice(&bytes[..PAGE_SIZE]);

        let img_sample = match (platform, version) {
            (Platform::Windows, ClientVersion::V4) => find_image_sample(data_dir),
            _ => None,
        };

        Ok(Self {
            version,
            page,
            img_sample,
        })
    }

    /// Build the oracle from raw parts. Used by tests and by callers that
    /// already hold a reference page in memory.
    pub fn from_parts(
        version: ClientVersion,
        page: [u8; PAGE_SIZE],
        img_sample: Option<[u8; IMG_KEY_SIZE]>,
    ) -> Self {
        Self {
            version,
            page: Box::new(page),
            img_sample,
        }
    }

    pub fn version(&self) -> ClientVersion {
        self.version
    }

    /// Does `candidate` decrypt the reference database?
    pub fn is_db_key(&self, candidate: &[u8]) -> bool {
        if candidate.len() != DB_KEY_SIZE {
            return false;
        }
        match self.version {
            ClientVersion::V3 => self.page_mac_matches_v3(candidate),
            ClientVersion::V4 => self.page_mac_matches_v4(candidate),
        }
    }

    /// Does the first 16 bytes of `candidate` decrypt the image sample?
    /// Always false when no sample was found or for V3 targets.
    pub fn is_image_key(&self, candidate: &[u8]) -> bool {
        if self.version != ClientVersion::V4 || candidate.len() < IMG_KEY_SIZE {
            return false;
        }
        let Some(sample) = self.img_sample else {
            return false;
        };
        let Ok(cipher) = Aes128::new_from_slice(&candidate[..IMG_KEY_SIZE]) else {
            return false;
        };
        let mut block = GenericArray::from(sample);
        cipher.decrypt_block(&mut block);
        block.starts_with(&JPEG_SOI)
    }

    fn page_mac_matches_v3(&self, key: &[u8]) -> bool {
        let salt = &self.page[..SALT_SIZE];
        let mac_salt: Vec<u8> = salt.iter().map(|b| b ^ MAC_SALT_XOR).collect();

        let enc_key = pbkdf2_hmac_array::<Sha1, DB_KEY_SIZE>(key, salt, PBKDF2_ROUNDS_V3);
        let mac_key = pbkdf2_hmac_array::<Sha1, DB_KEY_SIZE>(&enc_key, &mac_salt, 2);

        let mac_off = PAGE_SIZE - reserve_len(HMAC_SHA1_SIZE) + IV_SIZE;
        let Ok(mut mac) = <Hmac<Sha1> as Mac>::new_from_slice(&mac_key) else {
            return false;
        };
        mac.update(&self.page[SALT_SIZE..mac_off]);
        mac.update(&1u32.to_le_bytes());
        mac.verify_slice(&self.page[mac_off..mac_off + HMAC_SHA1_SIZE])
            .is_ok()
    }

    fn page_mac_matches_v4(&self, key: &[u8]) -> bool {
        let salt = &self.page[..SALT_SIZE];
        let mac_salt: Vec<u8> = salt.iter().map(|b| b ^ MAC_SALT_XOR).collect();

        let enc_key = pbkdf2_hmac_array::<Sha512, DB_KEY_SIZE>(key, salt, PBKDF2_ROUNDS_V4);
        let mac_key = pbkdf2_hmac_array::<Sha512, DB_KEY_SIZE>(&enc_key, &mac_salt, 2);

        let mac_off = PAGE_SIZE - reserve_len(HMAC_SHA512_SIZE) + IV_SIZE;
        let Ok(mut mac) = <Hmac<Sha512> as Mac>::new_from_slice(&mac_key) else {
            return false;
        };
        mac.update(&self.page[SALT_SIZE..mac_off]);
        mac.update(&1u32.to_le_bytes());
        mac.verify_slice(&self.page[mac_off..mac_off + HMAC_SHA512_SIZE])
            .is_ok()
    }
}

/// The page trailer holds IV plus MAC, padded up to a whole AES block.
fn reserve_len(mac_len: usize) -> usize {
    (IV_SIZE + mac_len).div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

fn reference_db_path(version: ClientVersion, data_dir: &Path) -> PathBuf {
    match version {
        ClientVersion::V3 => data_dir.join("Msg").join("Misc.db"),
        ClientVersion::V4 => data_dir
            .join("db_storage")
            .join("message")
            .join("message_0.db"),
    }
}

/// Locate an encrypted image file and take its first AES block as the known
/// ciphertext for the image oracle. The attachment tree is checked first,
/// then the data directory itself.
fn find_image_sample(data_dir: &Path) -> Option<[u8; AES_BLOCK_SIZE]> {
    for root in [data_dir.join("msg").join("attach"), data_dir.to_path_buf()] {
        if let Some(sample) = scan_for_dat(&root, 0) {
            return Some(sample);
        }
    }
    None
}

fn scan_for_dat(dir: &Path, depth: usize) -> Option<[u8; AES_BLOCK_SIZE]> {
    if depth > 6 {
        return None;
    }
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(sample) = scan_for_dat(&path, depth + 1) {
                return Some(sample);
            }
        } else if path.extension().is_some_and(|e| e == "dat") {
            if let Ok(bytes) = std::fs::read(&path) {
                if bytes.len() >= AES_BLOCK_SIZE {
                    let mut sample = [0u8; AES_BLOCK_SIZE];
                    sample.copy_from_slice(&bytes[..AES_BLOCK_SIZE]);
                    return Some(sample);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    const TEST_KEY: [u8; DB_KEY_SIZE] = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD,
        0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54, 0x32, 0x10, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54,
        0x32, 0x10,
    ];

    fn filled_page() -> [u8; PAGE_SIZE] {
        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        page
    }

    /// Build a page whose HMAC trailer is valid for `key` under V3 params.
    fn synthetic_page_v3(key: &[u8]) -> [u8; PAGE_SIZE] {
        let mut page = filled_page();
        let salt: Vec<u8> = page[..SALT_SIZE].to_vec();
        let mac_salt: Vec<u8> = salt.iter().map(|b| b ^ MAC_SALT_XOR).collect();

        let enc_key = pbkdf2_hmac_array::<Sha1, DB_KEY_SIZE>(key, &salt, PBKDF2_ROUNDS_V3);
        let mac_key = pbkdf2_hmac_array::<Sha1, DB_KEY_SIZE>(&enc_key, &mac_salt, 2);

        let mac_off = PAGE_SIZE - reserve_len(HMAC_SHA1_SIZE) + IV_SIZE;
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&mac_key).unwrap();
        mac.update(&page[SALT_SIZE..mac_off]);
        mac.update(&1u32.to_le_bytes());
        let tag = mac.finalize().into_bytes();
        page[mac_off..mac_off + HMAC_SHA1_SIZE].copy_from_slice(&tag);
        page
    }

    fn synthetic_page_v4(key: &[u8]) -> [u8; PAGE_SIZE] {
        let mut page = filled_page();
        let salt: Vec<u8> = page[..SALT_SIZE].to_vec();
        let mac_salt: Vec<u8> = salt.iter().map(|b| b ^ MAC_SALT_XOR).collect();

        let enc_key = pbkdf2_hmac_array::<Sha512, DB_KEY_SIZE>(key, &salt, PBKDF2_ROUNDS_V4);
        let mac_key = pbkdf2_hmac_array::<Sha512, DB_KEY_SIZE>(&enc_key, &mac_salt, 2);

        let mac_off = PAGE_SIZE - reserve_len(HMAC_SHA512_SIZE) + IV_SIZE;
        let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&mac_key).unwrap();
        mac.update(&page[SALT_SIZE..mac_off]);
        mac.update(&1u32.to_le_bytes());
        let tag = mac.finalize().into_bytes();
        page[mac_off..mac_off + HMAC_SHA512_SIZE].copy_from_slice(&tag);
        page
    }

    #[test]
    fn v3_oracle_accepts_matching_key() {
        let validator =
            Validator::from_parts(ClientVersion::V3, synthetic_page_v3(&TEST_KEY), None);
        assert!(validator.is_db_key(&TEST_KEY));

        let mut wrong = TEST_KEY;
        wrong[0] ^= 0xFF;
        assert!(!validator.is_db_key(&wrong));
    }

    #[test]
    fn v4_oracle_accepts_matching_key() {
        let validator =
            Validator::from_parts(ClientVersion::V4, synthetic_page_v4(&TEST_KEY), None);
        assert!(validator.is_db_key(&TEST_KEY));

        let mut wrong = TEST_KEY;
        wrong[31] ^= 0x01;
        assert!(!validator.is_db_key(&wrong));
    }

    #[test]
    fn oracle_rejects_wrong_length() {
        let validator =
            Validator::from_parts(ClientVersion::V3, synthetic_page_v3(&TEST_KEY), None);
        assert!(!validator.is_db_key(&TEST_KEY[..16]));
        assert!(!validator.is_db_key(&[]));
    }

    #[test]
    fn image_oracle_round_trip() {
        let img_key = &TEST_KEY[..IMG_KEY_SIZE];
        let mut block = GenericArray::clone_from_slice(&[
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00,
            0x00, 0x01,
        ]);
        Aes128::new_from_slice(img_key)
            .unwrap()
            .encrypt_block(&mut block);

        let mut sample = [0u8; AES_BLOCK_SIZE];
        sample.copy_from_slice(&block);
        let validator =
            Validator::from_parts(ClientVersion::V4, synthetic_page_v4(&TEST_KEY), Some(sample));

        // A 32-byte candidate contributes only its first half.
        assert!(validator.is_image_key(&TEST_KEY));
        assert!(validator.is_image_key(img_key));

        let mut wrong = TEST_KEY;
        wrong[3] ^= 0x40;
        assert!(!validator.is_image_key(&wrong));
    }

    #[test]
    fn image_oracle_off_without_sample() {
        let validator =
            Validator::from_parts(ClientVersion::V4, synthetic_page_v4(&TEST_KEY), None);
        assert!(!validator.is_image_key(&TEST_KEY));
    }

    #[test]
    fn loads_reference_page_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db_storage").join("message");
        std::fs::create_dir_all(&db_dir).unwrap();
        std::fs::write(db_dir.join("message_0.db"), synthetic_page_v4(&TEST_KEY)).unwrap();

        let validator =
            Validator::new(Platform::Windows, ClientVersion::V4, dir.path()).unwrap();
        assert!(validator.is_db_key(&TEST_KEY));
    }

    #[test]
    fn missing_reference_page_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Validator::new(Platform::Windows, ClientVersion::V4, dir.path()).unwrap_err();
        assert!(matches!(err, ExtractError::ReferencePageMissing(_)));
    }
}
