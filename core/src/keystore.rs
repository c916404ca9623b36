// Key-store collaborator interface
// The filesystem engine is handed pre-derived keys through this trait and
// never sees raw key material. Key derivation belongs to the surrounding
// emulation runtime.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{FsError, FsResult};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

pub const HASH_SIZE: usize = 20;

/// A keyed 20-byte message authentication tag.
pub type Hash = [u8; HASH_SIZE];

pub const AES_KEY_SIZE: usize = 16;
pub const MAC_KEY_SIZE: usize = 20;
pub const AES_BLOCK_SIZE: usize = 16;

/// Named key slots the engine may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHandle {
    /// AES-128 content key used for cluster data at rest.
    FsKey,
    /// HMAC key used for cluster and superblock integrity tags.
    FsMac,
}

/// Streaming MAC over a salt followed by cluster bytes.
///
/// `finalise` also resets the generator so it can be reused for the next
/// block without going back to the key store.
pub trait BlockMacGenerator: Send + Sync {
    fn update(&mut self, data: &[u8]);
    fn finalise(&mut self) -> Hash;
}

pub trait KeyStore: Send + Sync {
    /// AES-128-CBC encrypt `input` into `output` with the given IV.
    /// Lengths must match and be a multiple of the AES block size.
    fn encrypt(&self, key: KeyHandle, iv: [u8; AES_BLOCK_SIZE], input: &[u8], output: &mut [u8])
        -> FsResult<()>;

    /// AES-128-CBC decrypt `input` into `output` with the given IV.
    fn decrypt(&self, key: KeyHandle, iv: [u8; AES_BLOCK_SIZE], input: &[u8], output: &mut [u8])
        -> FsResult<()>;

    /// Obtain a block MAC generator keyed with the named key.
    fn block_mac_generator(&self, key: KeyHandle) -> FsResult<Box<dyn BlockMacGenerator>>;
}

/// Software key store holding the pre-derived NAND keys in memory.
pub struct SoftwareKeyStore {
    aes_key: [u8; AES_KEY_SIZE],
    mac_key: [u8; MAC_KEY_SIZE],
}

impl SoftwareKeyStore {
    pub fn new(aes_key: [u8; AES_KEY_SIZE], mac_key: [u8; MAC_KEY_SIZE]) -> Self {
        Self { aes_key, mac_key }
    }
}

impl KeyStore for SoftwareKeyStore {
    fn encrypt(
        &self,
        key: KeyHandle,
        iv: [u8; AES_BLOCK_SIZE],
        input: &[u8],
        output: &mut [u8],
    ) -> FsResult<()> {
        if key != KeyHandle::FsKey || input.len() != output.len() {
            return Err(FsError::Invalid);
        }
        Aes128CbcEnc::new(&self.aes_key.into(), &iv.into())
            .encrypt_padded_b2b_mut::<NoPadding>(input, output)
            .map_err(|_| FsError::Invalid)?;
        Ok(())
    }

    fn decrypt(
        &self,
        key: KeyHandle,
        iv: [u8; AES_BLOCK_SIZE],
        input: &[u8],
        output: &mut [u8],
    ) -> FsResult<()> {
        if key != KeyHandle::FsKey || input.len() != output.len() {
            return Err(FsError::Invalid);
        }
        Aes128CbcDec::new(&self.aes_key.into(), &iv.into())
            .decrypt_padded_b2b_mut::<NoPadding>(input, output)
            .map_err(|_| FsError::Invalid)?;
        Ok(())
    }

    fn block_mac_generator(&self, key: KeyHandle) -> FsResult<Box<dyn BlockMacGenerator>> {
        if key != KeyHandle::FsMac {
            return Err(FsError::Invalid);
        }
        let mac = HmacSha1::new_from_slice(&self.mac_key).map_err(|_| FsError::Invalid)?;
        Ok(Box::new(HmacSha1Generator { mac }))
    }
}

struct HmacSha1Generator {
    mac: HmacSha1,
}

impl BlockMacGenerator for HmacSha1Generator {
    fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    fn finalise(&mut self) -> Hash {
        self.mac.finalize_reset().into_bytes().into()
    }
}
