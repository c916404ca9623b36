// NAND image backend
// Byte-exact engine over a flash image file: cluster allocation, FAT chains,
// FST tree, per-cluster AES, HMAC integrity and superblock rotation.

pub mod ecc;
pub mod layout;
pub mod superblock;

mod file_ops;
mod lowlevel;
mod ops;
mod path_resolver;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use log::{error, info};
use sffs_core::{FsError, FsResult, KeyHandle, KeyStore};

use self::file_ops::{FileCache, Handle};
use self::lowlevel::NandIo;
use self::superblock::Superblock;

pub const HANDLE_COUNT: usize = 16;

/// The image-backed filesystem engine.
///
/// Exactly one instance owns a given image file; the key-store collaborator
/// is injected and consulted read-only.
pub struct NandFileSystem {
    io: NandIo,
    superblock: Option<Superblock>,
    superblock_index: u32,
    handles: [Handle; HANDLE_COUNT],
    cache: FileCache,
}

impl NandFileSystem {
    /// Open an engine over an existing NAND image.
    ///
    /// The image must already have the full medium size; on a blank image
    /// every operation fails with `SuperblockInitFailed` until `format` is
    /// called.
    pub fn new(nand_path: impl AsRef<Path>, keystore: Arc<dyn KeyStore>) -> FsResult<Self> {
        let nand_path = nand_path.as_ref();
        info!("Opening NAND image {}", nand_path.display());
        let nand = OpenOptions::new()
            .read(true)
            .write(true)
            .open(nand_path)
            .map_err(|e| {
                error!("Failed to open NAND image {}: {}", nand_path.display(), e);
                FsError::BadBlock
            })?;
        let mac_generator = keystore.block_mac_generator(KeyHandle::FsMac)?;

        let mut fs = NandFileSystem {
            io: NandIo {
                nand,
                keystore,
                mac_generator,
            },
            superblock: None,
            superblock_index: 0,
            handles: [Handle::default(); HANDLE_COUNT],
            cache: FileCache::default(),
        };
        // Load the active superblock eagerly so legacy free markers are
        // normalised before the first operation. A blank image is fine; the
        // caller is expected to format it.
        let _ = fs.ensure_superblock();
        Ok(fs)
    }
}
