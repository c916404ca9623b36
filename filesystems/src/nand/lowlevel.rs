// Raw page layer and cluster-level integrity.
// Everything that touches the backing file lives here: page and spare-area
// serialisation, per-cluster AES, HMAC generation, superblock location and
// rotation, and the ordered file-data write sequence.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use sffs_core::{BlockMacGenerator, FsError, FsResult, Hash, KeyHandle, KeyStore, HASH_SIZE};

use super::ecc;
use super::layout::{
    self, CLUSTERS_PER_SUPERBLOCK, CLUSTER_COUNT, CLUSTER_DATA_SIZE, CLUSTER_LAST_IN_CHAIN,
    CLUSTER_UNUSED, DATA_BYTES_PER_PAGE, ECC_OFFSET_IN_SPARE, HMAC1_OFFSET_IN_PAGE1, HMAC_PAGE1,
    HMAC_PAGE2, HMAC2_OFFSET_IN_PAGE1, HMAC2_OFFSET_IN_PAGE2, HMAC2_SIZE_IN_PAGE1,
    HMAC2_SIZE_IN_PAGE2, NUMBER_OF_SUPERBLOCKS, PAGES_PER_CLUSTER, SPARE_BYTES_PER_PAGE,
    SUPERBLOCK_START_CLUSTER, SUPERBLOCK_SIZE,
};
use super::superblock::{FstEntry, Superblock, SUPERBLOCK_MAGIC};
use super::NandFileSystem;

fn io_error(error: std::io::Error) -> FsError {
    error!("NAND I/O error: {}", error);
    FsError::BadBlock
}

/// Backing file plus the injected cryptographic collaborators.
pub(crate) struct NandIo {
    pub(crate) nand: File,
    pub(crate) keystore: Arc<dyn KeyStore>,
    pub(crate) mac_generator: Box<dyn BlockMacGenerator>,
}

impl NandIo {
    pub(crate) fn superblock_hmac(&mut self, superblock_bytes: &[u8], index: u32) -> Hash {
        let salt = layout::superblock_salt(layout::superblock_cluster(index));
        self.mac_generator.update(&salt);
        self.mac_generator.update(superblock_bytes);
        self.mac_generator.finalise()
    }

    pub(crate) fn data_hmac(
        &mut self,
        entry: &FstEntry,
        fst_index: u16,
        chain_index: u16,
        cluster_data: &[u8],
    ) -> Hash {
        let salt = layout::data_salt(entry.uid, &entry.name, chain_index, fst_index, entry.x3);
        self.mac_generator.update(&salt);
        self.mac_generator.update(cluster_data);
        self.mac_generator.finalise()
    }

    /// Read one cluster's data bytes, returning both stored HMAC copies.
    /// Data clusters are decrypted; superblock clusters are stored clear.
    pub(crate) fn read_cluster(&mut self, cluster: u16, data: &mut [u8]) -> FsResult<[Hash; 2]> {
        if cluster as usize >= CLUSTER_COUNT {
            return Err(FsError::Invalid);
        }
        debug_assert_eq!(data.len(), CLUSTER_DATA_SIZE);
        trace!("Reading cluster {:#06x}", cluster);

        let mut hmacs = [[0u8; HASH_SIZE]; 2];
        let mut spare = [0u8; SPARE_BYTES_PER_PAGE];
        for page in 0..PAGES_PER_CLUSTER {
            self.nand
                .seek(SeekFrom::Start(layout::offset(cluster, page)))
                .map_err(io_error)?;
            self.nand
                .read_exact(&mut data[DATA_BYTES_PER_PAGE * page..][..DATA_BYTES_PER_PAGE])
                .map_err(io_error)?;
            if page == HMAC_PAGE1 || page == HMAC_PAGE2 {
                self.nand.read_exact(&mut spare).map_err(io_error)?;
                if page == HMAC_PAGE1 {
                    hmacs[0].copy_from_slice(&spare[HMAC1_OFFSET_IN_PAGE1..][..HASH_SIZE]);
                    hmacs[1][..HMAC2_SIZE_IN_PAGE1]
                        .copy_from_slice(&spare[HMAC2_OFFSET_IN_PAGE1..][..HMAC2_SIZE_IN_PAGE1]);
                } else {
                    hmacs[1][HMAC2_SIZE_IN_PAGE1..]
                        .copy_from_slice(&spare[HMAC2_OFFSET_IN_PAGE2..][..HMAC2_SIZE_IN_PAGE2]);
                }
            }
        }

        if cluster < SUPERBLOCK_START_CLUSTER {
            let mut decrypted = vec![0u8; CLUSTER_DATA_SIZE];
            self.keystore
                .decrypt(KeyHandle::FsKey, [0u8; 16], data, &mut decrypted)?;
            data.copy_from_slice(&decrypted);
        }

        Ok(hmacs)
    }

    /// Write one cluster: data pages plus spare areas carrying the good-block
    /// marker, per-page ECC and the given HMAC in its two on-media copies.
    pub(crate) fn write_cluster(&mut self, cluster: u16, data: &[u8], hmac: &Hash) -> FsResult<()> {
        if cluster as usize >= CLUSTER_COUNT {
            return Err(FsError::Invalid);
        }
        debug_assert_eq!(data.len(), CLUSTER_DATA_SIZE);
        trace!("Writing cluster {:#06x}", cluster);

        let encrypted = if cluster < SUPERBLOCK_START_CLUSTER {
            let mut buffer = vec![0u8; CLUSTER_DATA_SIZE];
            self.keystore
                .encrypt(KeyHandle::FsKey, [0u8; 16], data, &mut buffer)?;
            Some(buffer)
        } else {
            None
        };
        let on_media = encrypted.as_deref().unwrap_or(data);

        for page in 0..PAGES_PER_CLUSTER {
            let page_data = &on_media[DATA_BYTES_PER_PAGE * page..][..DATA_BYTES_PER_PAGE];
            self.nand
                .seek(SeekFrom::Start(layout::offset(cluster, page)))
                .map_err(io_error)?;
            self.nand.write_all(page_data).map_err(io_error)?;

            let mut spare = [0u8; SPARE_BYTES_PER_PAGE];
            spare[0] = 0xff;
            // The ECC covers the bytes as stored, after encryption.
            let ecc = ecc::calculate_ecc(page_data);
            spare[ECC_OFFSET_IN_SPARE..ECC_OFFSET_IN_SPARE + ecc::ECC_SIZE].copy_from_slice(&ecc);
            if page == HMAC_PAGE1 {
                spare[HMAC1_OFFSET_IN_PAGE1..][..HASH_SIZE].copy_from_slice(hmac);
                spare[HMAC2_OFFSET_IN_PAGE1..][..HMAC2_SIZE_IN_PAGE1]
                    .copy_from_slice(&hmac[..HMAC2_SIZE_IN_PAGE1]);
            } else if page == HMAC_PAGE2 {
                spare[HMAC2_OFFSET_IN_PAGE2..][..HMAC2_SIZE_IN_PAGE2]
                    .copy_from_slice(&hmac[HMAC2_SIZE_IN_PAGE1..]);
            }
            self.nand.write_all(&spare).map_err(io_error)?;
        }

        Ok(())
    }

    /// Read and deserialise one superblock copy, without verifying it.
    pub(crate) fn read_superblock(&mut self, index: u32) -> FsResult<Superblock> {
        let mut buffer = vec![0u8; SUPERBLOCK_SIZE];
        for i in 0..CLUSTERS_PER_SUPERBLOCK as usize {
            self.read_cluster(
                layout::superblock_cluster(index) + i as u16,
                &mut buffer[CLUSTER_DATA_SIZE * i..][..CLUSTER_DATA_SIZE],
            )?;
        }
        Ok(Superblock::from_bytes(&buffer))
    }
}

/// Walk a file's FAT chain to the cluster at `index`, if it exists.
pub(crate) fn get_cluster_for_file(
    superblock: &Superblock,
    first_cluster: u16,
    index: usize,
) -> Option<u16> {
    let mut cluster = first_cluster;
    for _ in 0..index {
        if cluster as usize >= superblock.fat.len() {
            warn!(
                "Cannot find cluster number with index {} in chain {:#06x}",
                index, first_cluster
            );
            return None;
        }
        cluster = superblock.fat[cluster as usize];
    }
    ((cluster as usize) < superblock.fat.len()).then_some(cluster)
}

/// Read and HMAC-verify the cluster at `chain_index` of a file.
pub(crate) fn read_file_data(
    io: &mut NandIo,
    superblock: &Superblock,
    fst_index: u16,
    chain_index: u16,
    data: &mut [u8],
) -> FsResult<()> {
    let entry = *superblock
        .fst
        .get(fst_index as usize)
        .ok_or(FsError::Invalid)?;
    if !entry.is_file() || entry.size as u64 <= chain_index as u64 * CLUSTER_DATA_SIZE as u64 {
        return Err(FsError::Invalid);
    }

    let cluster =
        get_cluster_for_file(superblock, entry.sub, chain_index as usize).ok_or(FsError::Invalid)?;
    let hmacs = io.read_cluster(cluster, data)?;

    let hash = io.data_hmac(&entry, fst_index, chain_index, data);
    if hash != hmacs[0] && hash != hmacs[1] {
        error!(
            "Failed to verify cluster data (fst_index {:#06x} chain_index {})",
            fst_index, chain_index
        );
        return Err(FsError::CheckFailed);
    }
    Ok(())
}

/// Write one cluster of file data and splice it into the chain.
///
/// The data is written to a freshly allocated cluster first; only then are
/// the FAT and FST updated and the old cluster freed, so an interrupted write
/// either keeps the previous superblock's view intact or lands fully.
pub(crate) fn write_file_data(
    io: &mut NandIo,
    superblock: &mut Superblock,
    fst_index: u16,
    data: &[u8],
    chain_index: u16,
    new_size: u32,
) -> FsResult<()> {
    let entry = *superblock
        .fst
        .get(fst_index as usize)
        .ok_or(FsError::Invalid)?;
    if !entry.is_file() || new_size < entry.size {
        return Err(FsError::Invalid);
    }

    // No wear levelling: the backing store is a plain host file, so the
    // first unused cluster wins.
    let cluster = superblock
        .fat
        .iter()
        .position(|&c| c == CLUSTER_UNUSED)
        .ok_or(FsError::NoFreeSpace)? as u16;

    let hash = io.data_hmac(&entry, fst_index, chain_index, data);
    io.write_cluster(cluster, data, &hash)?;

    let old_cluster = get_cluster_for_file(superblock, entry.sub, chain_index as usize);

    // Point the predecessor (or the FST for the chain head) at the new
    // cluster.
    if chain_index == 0 {
        superblock.fst[fst_index as usize].sub = cluster;
    } else {
        let previous = get_cluster_for_file(superblock, entry.sub, chain_index as usize - 1)
            .ok_or(FsError::Invalid)?;
        superblock.fat[previous as usize] = cluster;
    }

    // When replacing a cluster, inherit its successor so the chain keeps its
    // length; free the replaced cluster last.
    superblock.fat[cluster as usize] = match old_cluster {
        Some(old) => superblock.fat[old as usize],
        None => CLUSTER_LAST_IN_CHAIN,
    };
    if let Some(old) = old_cluster {
        superblock.fat[old as usize] = CLUSTER_UNUSED;
    }

    superblock.fst[fst_index as usize].size = new_size;
    Ok(())
}

impl NandFileSystem {
    /// Locate the active superblock: of the 16 copies, the one with the
    /// greatest version whose magic and HMAC check out.
    pub(crate) fn ensure_superblock(&mut self) -> FsResult<()> {
        if self.superblock.is_some() {
            return Ok(());
        }

        let mut highest_version = 0u32;
        let mut best: Option<(u32, Superblock)> = None;
        for index in 0..NUMBER_OF_SUPERBLOCKS {
            let superblock = match self.io.read_superblock(index) {
                Ok(superblock) => superblock,
                Err(_) => continue,
            };
            if superblock.magic != SUPERBLOCK_MAGIC || superblock.version < highest_version {
                continue;
            }
            highest_version = superblock.version;
            best = Some((index, superblock));
        }

        let Some((index, mut superblock)) = best else {
            return Err(FsError::SuperblockInitFailed);
        };
        info!("Using superblock {} (v{})", index, superblock.version);

        // The copy's HMAC lives in the spare area of its last cluster and
        // covers the copy as stored, before any normalisation.
        let hash = self.io.superblock_hmac(&superblock.to_bytes(), index);
        let mut buffer = vec![0u8; CLUSTER_DATA_SIZE];
        let hmacs = self
            .io
            .read_cluster(layout::superblock_cluster(index) + 15, &mut buffer)
            .map_err(|_| FsError::SuperblockInitFailed)?;
        if hash != hmacs[0] && hash != hmacs[1] {
            error!("Failed to verify superblock");
            return Err(FsError::SuperblockInitFailed);
        }

        superblock.normalise_legacy_fat();
        self.superblock_index = index;
        self.superblock = Some(superblock);
        Ok(())
    }

    /// Persist the in-memory superblock: bump the version, rotate to the next
    /// slot and write the copy with a fresh HMAC. On a write failure the next
    /// slot is tried, up to one full rotation.
    pub(crate) fn flush_superblock(&mut self) -> FsResult<()> {
        let Some(superblock) = self.superblock.as_mut() else {
            return Err(FsError::NotFound);
        };
        superblock.version = superblock.version.wrapping_add(1);

        let mut last_error = FsError::BadBlock;
        for _ in 0..NUMBER_OF_SUPERBLOCKS {
            match self.write_superblock_copy() {
                Ok(()) => return Ok(()),
                Err(error) => {
                    error!(
                        "Failed to write superblock at index {}",
                        self.superblock_index
                    );
                    last_error = error;
                }
            }
        }
        error!("Failed to flush superblock");
        Err(last_error)
    }

    fn write_superblock_copy(&mut self) -> FsResult<()> {
        self.superblock_index = (self.superblock_index + 1) % NUMBER_OF_SUPERBLOCKS;
        let index = self.superblock_index;

        let (bytes, version) = {
            let superblock = self.superblock.as_ref().ok_or(FsError::NotFound)?;
            (superblock.to_bytes(), superblock.version)
        };
        debug!("Writing superblock {} (v{})", index, version);

        let hmac = self.io.superblock_hmac(&bytes, index);
        let null_hmac = [0u8; HASH_SIZE];
        for cluster in 0..CLUSTERS_PER_SUPERBLOCK as usize {
            let chunk = &bytes[CLUSTER_DATA_SIZE * cluster..][..CLUSTER_DATA_SIZE];
            let mac = if cluster == 15 { &hmac } else { &null_hmac };
            self.io
                .write_cluster(layout::superblock_cluster(index) + cluster as u16, chunk, mac)?;
        }

        // After a version counter wrap, 15 further copies are written so the
        // driver never prefers a stale high-versioned superblock.
        if version == 0 {
            warn!("Superblock version overflowed -- writing 15 extra versions");
            for _ in 0..15 {
                self.flush_superblock()?;
            }
        }
        Ok(())
    }
}
