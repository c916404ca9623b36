// Open-file table, the single write-behind cluster cache, and the
// descriptor-level operations built on them.

use log::error;
use sffs_core::{FsError, FsResult};

use super::layout::{CLUSTER_DATA_SIZE, CLUSTER_UNUSED};
use super::lowlevel::{read_file_data, write_file_data};
use super::path_resolver::{has_permission, is_valid_non_root_path, resolve_path};
use super::superblock::{Superblock, FST_ENTRY_COUNT, FST_NONE};
use super::NandFileSystem;
use crate::ops::{Fd, FileStatus, Gid, Mode, SeekMode, Uid};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Handle {
    pub(crate) opened: bool,
    pub(crate) fst_index: u16,
    pub(crate) uid: Uid,
    pub(crate) gid: Gid,
    pub(crate) mode: Mode,
    pub(crate) file_offset: u32,
    pub(crate) file_size: u32,
    pub(crate) superblock_flush_needed: bool,
}

impl Default for Handle {
    fn default() -> Self {
        Handle {
            opened: false,
            fst_index: FST_NONE,
            uid: 0,
            gid: 0,
            mode: Mode::None,
            file_offset: 0,
            file_size: 0,
            superblock_flush_needed: false,
        }
    }
}

/// Write-behind cache for exactly one (descriptor, chain index) pair.
pub(crate) struct FileCache {
    pub(crate) fd: Option<Fd>,
    pub(crate) chain_index: u16,
    pub(crate) data: Vec<u8>,
    pub(crate) for_write: bool,
}

impl Default for FileCache {
    fn default() -> Self {
        FileCache {
            fd: None,
            chain_index: 0,
            data: vec![0; CLUSTER_DATA_SIZE],
            for_write: false,
        }
    }
}

pub(crate) fn is_file_opened(handles: &[Handle], fst_index: u16) -> bool {
    handles
        .iter()
        .any(|handle| handle.opened && handle.fst_index == fst_index)
}

/// Whether any file under `directory` (recursively) is currently open.
pub(crate) fn is_directory_in_use(
    handles: &[Handle],
    superblock: &Superblock,
    directory: u16,
) -> bool {
    let mut child = superblock.fst[directory as usize].sub;
    while (child as usize) < superblock.fst.len() {
        let entry = &superblock.fst[child as usize];
        let in_use = if entry.is_file() {
            is_file_opened(handles, child)
        } else {
            is_directory_in_use(handles, superblock, child)
        };
        if in_use {
            return true;
        }
        child = entry.sib;
    }
    false
}

impl NandFileSystem {
    pub(crate) fn handle(&self, fd: Fd) -> Option<&Handle> {
        self.handles.get(fd as usize).filter(|handle| handle.opened)
    }

    fn assign_free_handle(&mut self, uid: Uid, gid: Gid) -> Option<Fd> {
        let fd = self.handles.iter().position(|handle| !handle.opened)? as Fd;
        self.handles[fd as usize] = Handle {
            opened: true,
            uid,
            gid,
            ..Default::default()
        };
        Some(fd)
    }

    /// Open an existing file and capture its size.
    ///
    /// The size is captured once per handle: if a second handle grows the
    /// file, this handle cannot see past the size it was opened with.
    pub fn open_file(&mut self, uid: Uid, gid: Gid, path: &str, mode: Mode) -> FsResult<Fd> {
        if !is_valid_non_root_path(path) {
            return Err(FsError::Invalid);
        }
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_ref()
            .ok_or(FsError::SuperblockInitFailed)?;

        let index = resolve_path(superblock, path).map_err(|_| FsError::NotFound)?;
        let entry = &superblock.fst[index as usize];
        if !entry.is_file() {
            return Err(FsError::Invalid);
        }
        if !has_permission(entry, uid, gid, mode) {
            return Err(FsError::AccessDenied);
        }
        let file_size = entry.size;

        let fd = self
            .assign_free_handle(uid, gid)
            .ok_or(FsError::NoFreeHandle)?;
        let handle = &mut self.handles[fd as usize];
        handle.fst_index = index;
        handle.mode = mode;
        handle.file_offset = 0;
        handle.file_size = file_size;
        Ok(fd)
    }

    /// Close a descriptor, writing back its cached cluster and any deferred
    /// superblock update.
    pub fn close(&mut self, fd: Fd) -> FsResult<()> {
        if self.handle(fd).is_none() {
            return Err(FsError::Invalid);
        }

        if self.cache.fd == Some(fd) {
            self.flush_file_cache()?;
            self.cache.fd = None;
        }

        if self.handles[fd as usize].superblock_flush_needed {
            self.flush_superblock()?;
        }

        self.handles[fd as usize] = Handle::default();
        Ok(())
    }

    pub fn read_file(&mut self, fd: Fd, count: u32) -> FsResult<Vec<u8>> {
        let handle = self.handle(fd).ok_or(FsError::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(FsError::Invalid);
        }
        if !handle.mode.includes(Mode::Read) {
            return Err(FsError::AccessDenied);
        }
        // Reads stop at end of file.
        let count = count.min(handle.file_size - handle.file_offset);

        let mut result = vec![0u8; count as usize];
        let mut processed: u32 = 0;
        while processed != count {
            let offset = self.handle(fd).ok_or(FsError::Invalid)?.file_offset;
            self.populate_file_cache(fd, offset, false)?;

            let start =
                (offset - self.cache.chain_index as u32 * CLUSTER_DATA_SIZE as u32) as usize;
            let copy_length = (CLUSTER_DATA_SIZE - start).min((count - processed) as usize);
            result[processed as usize..processed as usize + copy_length]
                .copy_from_slice(&self.cache.data[start..start + copy_length]);

            self.handles[fd as usize].file_offset += copy_length as u32;
            processed += copy_length as u32;
        }
        Ok(result)
    }

    pub fn write_file(&mut self, fd: Fd, data: &[u8]) -> FsResult<u32> {
        let handle = self.handle(fd).ok_or(FsError::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(FsError::Invalid);
        }
        if !handle.mode.includes(Mode::Write) {
            return Err(FsError::AccessDenied);
        }
        let count = u32::try_from(data.len()).map_err(|_| FsError::Invalid)?;

        let mut processed: u32 = 0;
        while processed != count {
            let offset = self.handle(fd).ok_or(FsError::Invalid)?.file_offset;
            self.populate_file_cache(fd, offset, true)?;

            let start =
                (offset - self.cache.chain_index as u32 * CLUSTER_DATA_SIZE as u32) as usize;
            let copy_length = (CLUSTER_DATA_SIZE - start).min((count - processed) as usize);
            self.cache.data[start..start + copy_length]
                .copy_from_slice(&data[processed as usize..processed as usize + copy_length]);

            let handle = &mut self.handles[fd as usize];
            handle.file_offset += copy_length as u32;
            handle.file_size = handle.file_size.max(handle.file_offset);
            processed += copy_length as u32;
        }
        Ok(count)
    }

    pub fn seek_file(&mut self, fd: Fd, offset: u32, mode: SeekMode) -> FsResult<u32> {
        let handle = self
            .handles
            .get_mut(fd as usize)
            .filter(|handle| handle.opened)
            .ok_or(FsError::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(FsError::Invalid);
        }

        // Relative seeks use guest u32 wrapping arithmetic, so a guest can
        // pass e.g. 0xffffffff to step back one byte.
        let new_position = match mode {
            SeekMode::Set => offset,
            SeekMode::Current => handle.file_offset.wrapping_add(offset),
            SeekMode::End => handle.file_size.wrapping_add(offset),
        };

        // Unlike POSIX, seeking past the end of the file is not allowed.
        if handle.file_size < new_position {
            return Err(FsError::Invalid);
        }
        handle.file_offset = new_position;
        Ok(new_position)
    }

    pub fn get_file_status(&self, fd: Fd) -> FsResult<FileStatus> {
        let handle = self.handle(fd).ok_or(FsError::Invalid)?;
        if handle.fst_index as usize >= FST_ENTRY_COUNT {
            return Err(FsError::Invalid);
        }
        Ok(FileStatus {
            size: handle.file_size,
            offset: handle.file_offset,
        })
    }

    /// Make the cache current for (fd, cluster containing `offset`).
    ///
    /// Any previously cached cluster of a different pair is written back
    /// first. The target cluster is read in unless the access starts a whole
    /// new cluster at end of file.
    fn populate_file_cache(&mut self, fd: Fd, offset: u32, for_write: bool) -> FsResult<()> {
        let chain_index = (offset / CLUSTER_DATA_SIZE as u32) as u16;

        if self.cache.fd == Some(fd) && self.cache.chain_index == chain_index {
            // A write can land in a cluster cached by a read; the cache
            // turns dirty but still needs a free cluster to back it.
            if for_write && !self.cache.for_write {
                self.check_free_cluster()?;
                self.cache.for_write = true;
            }
            return Ok(());
        }

        self.flush_file_cache()?;

        if for_write {
            // Fail before accepting bytes that no cluster can back.
            self.check_free_cluster()?;
        }

        let handle = self.handle(fd).ok_or(FsError::Invalid)?;
        let (fst_index, file_size) = (handle.fst_index, handle.file_size);

        if offset % CLUSTER_DATA_SIZE as u32 != 0 || offset != file_size {
            self.ensure_superblock()?;
            let superblock = self
                .superblock
                .as_ref()
                .ok_or(FsError::SuperblockInitFailed)?;
            if let Err(error) = read_file_data(
                &mut self.io,
                superblock,
                fst_index,
                chain_index,
                &mut self.cache.data,
            ) {
                error!("Failed to read data into cache: {}", error);
                return Err(error);
            }
        }

        self.cache.fd = Some(fd);
        self.cache.chain_index = chain_index;
        self.cache.for_write = for_write;
        Ok(())
    }

    fn check_free_cluster(&mut self) -> FsResult<()> {
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_ref()
            .ok_or(FsError::SuperblockInitFailed)?;
        if !superblock.fat.contains(&CLUSTER_UNUSED) {
            return Err(FsError::NoFreeSpace);
        }
        Ok(())
    }

    /// Write the cached cluster back through the ordered write sequence.
    /// The superblock flush itself stays deferred until the handle closes.
    pub(crate) fn flush_file_cache(&mut self) -> FsResult<()> {
        let Some(fd) = self.cache.fd else {
            return Ok(());
        };
        if !self.cache.for_write {
            return Ok(());
        }

        let handle = self.handle(fd).ok_or(FsError::Invalid)?;
        let (fst_index, file_size) = (handle.fst_index, handle.file_size);
        let chain_index = self.cache.chain_index;

        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_mut()
            .ok_or(FsError::SuperblockInitFailed)?;
        match write_file_data(
            &mut self.io,
            superblock,
            fst_index,
            &self.cache.data,
            chain_index,
            file_size,
        ) {
            Ok(()) => {
                // The cached bytes now match the medium; a later write to
                // the same cluster re-marks the cache dirty.
                self.cache.for_write = false;
                self.handles[fd as usize].superblock_flush_needed = true;
                Ok(())
            }
            Err(error) => {
                error!("Failed to flush file cache {}: {}", fd, error);
                Err(error)
            }
        }
    }

    /// Write back the cache if it belongs to an open handle on `fst_index`,
    /// so the entry's metadata reflects pending writes.
    pub(crate) fn flush_cache_for_fst_index(&mut self, fst_index: u16) -> FsResult<()> {
        let Some(fd) = self.cache.fd else {
            return Ok(());
        };
        let refers_to_entry = self
            .handle(fd)
            .map_or(false, |handle| handle.fst_index == fst_index);
        if refers_to_entry && self.cache.for_write {
            self.flush_file_cache()?;
        }
        Ok(())
    }
}
