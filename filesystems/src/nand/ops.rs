// Public operations of the NAND backend: format, namespace manipulation,
// metadata and statistics, plus the FilesystemOps wiring.

use log::{debug, info};
use sffs_core::{FsError, FsResult};

use super::file_ops::{is_directory_in_use, is_file_opened};
use super::layout::{
    CLUSTER_BAD_BLOCK, CLUSTER_DATA_SIZE, CLUSTER_LAST_IN_CHAIN, CLUSTER_RESERVED, CLUSTER_UNUSED,
    CLUSTER_UNUSED_LEGACY, SUPERBLOCK_START_CLUSTER,
};
use super::path_resolver::{
    find_child, find_unused_fst_index, has_permission, has_valid_characters,
    is_valid_non_root_path, resolve_path, split_path, MAX_PATH_DEPTH,
};
use super::superblock::{
    FstEntry, Superblock, FST_NONE, MAX_NAME_LENGTH, SUPERBLOCK_MAGIC,
};
use super::NandFileSystem;
use crate::ops::{
    DirectoryStats, Fd, FileAttribute, FileStatus, FilesystemOps, Gid, Metadata, Mode, Modes,
    NandStats, SeekMode, Uid,
};

/// Free a file's cluster chain and mark its entry unused.
fn delete_file(superblock: &mut Superblock, file: u16) {
    let mut cluster = superblock.fst[file as usize].sub;
    while (cluster as usize) < superblock.fat.len() {
        let next = superblock.fat[cluster as usize];
        superblock.fat[cluster as usize] = CLUSTER_UNUSED;
        cluster = next;
    }
    superblock.fst[file as usize].mode = 0;
}

/// Post-order deletion of everything inside a directory. All contained files
/// must be closed; the directory's own entry is left for the caller.
fn delete_directory_contents(superblock: &mut Superblock, directory: u16) {
    let mut child = superblock.fst[directory as usize].sub;
    while (child as usize) < superblock.fst.len() {
        let next = superblock.fst[child as usize].sib;
        if superblock.fst[child as usize].is_directory() {
            delete_directory_contents(superblock, child);
            superblock.fst[child as usize].mode = 0;
        } else {
            delete_file(superblock, child);
        }
        child = next;
    }
}

/// Unlink `child` from `parent`'s sibling chain and mark it unused.
fn remove_fst_entry_from_chain(superblock: &mut Superblock, parent: u16, child: u16) -> FsResult<()> {
    if superblock.fst[parent as usize].sub == child {
        superblock.fst[parent as usize].sub = superblock.fst[child as usize].sib;
        superblock.fst[child as usize].mode = 0;
        return Ok(());
    }

    let mut previous = superblock.fst[parent as usize].sub;
    if previous as usize >= superblock.fst.len() {
        return Err(FsError::NotFound);
    }
    let mut index = superblock.fst[previous as usize].sib;
    while (index as usize) < superblock.fst.len() {
        if index == child {
            superblock.fst[previous as usize].sib = superblock.fst[child as usize].sib;
            superblock.fst[child as usize].mode = 0;
            return Ok(());
        }
        previous = index;
        index = superblock.fst[index as usize].sib;
    }
    Err(FsError::NotFound)
}

fn count_directory_recursively(superblock: &Superblock, directory: u16) -> DirectoryStats {
    let mut stats = DirectoryStats {
        used_clusters: 0,
        used_inodes: 1, // the directory itself
    };
    let mut child = superblock.fst[directory as usize].sub;
    while (child as usize) < superblock.fst.len() {
        let entry = &superblock.fst[child as usize];
        if entry.is_file() {
            stats.used_clusters += entry.size.div_ceil(CLUSTER_DATA_SIZE as u32);
            stats.used_inodes += 1;
        } else {
            let inner = count_directory_recursively(superblock, child);
            stats.used_clusters += inner.used_clusters;
            stats.used_inodes += inner.used_inodes;
        }
        child = entry.sib;
    }
    stats
}

impl NandFileSystem {
    /// Recreate an empty filesystem on the medium. The boot and superblock
    /// regions are reserved; everything else becomes free space.
    pub fn format(&mut self, caller_uid: Uid) -> FsResult<()> {
        if caller_uid != 0 {
            return Err(FsError::AccessDenied);
        }
        info!("Formatting NAND filesystem");

        if self.ensure_superblock().is_err() {
            self.superblock = Some(Superblock::default());
        }
        let superblock = self
            .superblock
            .as_mut()
            .ok_or(FsError::SuperblockInitFailed)?;
        superblock.magic = SUPERBLOCK_MAGIC;

        for (cluster, fat) in superblock.fat.iter_mut().enumerate() {
            *fat = if cluster < 64 || cluster >= SUPERBLOCK_START_CLUSTER as usize {
                CLUSTER_RESERVED
            } else {
                CLUSTER_UNUSED
            };
        }

        superblock.fst.fill(FstEntry::default());
        let root = &mut superblock.fst[0];
        root.set_name("/");
        root.mode = 2;
        root.set_access_mode(Mode::ReadWrite, Mode::ReadWrite, Mode::None);
        root.sub = FST_NONE;
        root.sib = FST_NONE;

        // All handles are forcibly closed and pending writes from the old
        // filesystem are discarded, not written back.
        for handle in &mut self.handles {
            handle.opened = false;
        }
        self.cache.fd = None;

        self.flush_superblock()
    }

    fn create_file_or_directory(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
        attribute: FileAttribute,
        modes: Modes,
        is_file: bool,
    ) -> FsResult<()> {
        if !is_valid_non_root_path(path) || !has_valid_characters(path) {
            return Err(FsError::Invalid);
        }
        if !is_file && path.bytes().filter(|&b| b == b'/').count() > MAX_PATH_DEPTH {
            return Err(FsError::TooManyPathComponents);
        }
        let (parent_path, file_name) = split_path(path);
        if file_name.len() > MAX_NAME_LENGTH {
            return Err(FsError::Invalid);
        }

        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_mut()
            .ok_or(FsError::SuperblockInitFailed)?;

        let parent_index = resolve_path(superblock, parent_path).map_err(|_| FsError::NotFound)?;
        if !has_permission(
            &superblock.fst[parent_index as usize],
            caller_uid,
            caller_gid,
            Mode::Write,
        ) {
            return Err(FsError::AccessDenied);
        }

        if find_child(superblock, parent_index, file_name).is_ok() {
            return Err(FsError::AlreadyExists);
        }

        let child_index = find_unused_fst_index(superblock)?;
        debug!(
            "Creating {} {} (fst index {})",
            if is_file { "file" } else { "directory" },
            path,
            child_index
        );

        let parent_sub = superblock.fst[parent_index as usize].sub;
        let child = &mut superblock.fst[child_index as usize];
        child.set_name(file_name);
        child.mode = if is_file { 1 } else { 2 };
        child.set_access_mode(modes.owner, modes.group, modes.other);
        child.uid = caller_uid;
        child.gid = caller_gid;
        child.size = 0;
        child.x3 = 0;
        child.attr = attribute;
        child.sub = if is_file { CLUSTER_LAST_IN_CHAIN } else { FST_NONE };
        child.sib = parent_sub;
        superblock.fst[parent_index as usize].sub = child_index;

        self.flush_superblock()
    }

    pub fn create_file(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
        attribute: FileAttribute,
        modes: Modes,
    ) -> FsResult<()> {
        self.create_file_or_directory(caller_uid, caller_gid, path, attribute, modes, true)
    }

    pub fn create_directory(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
        attribute: FileAttribute,
        modes: Modes,
    ) -> FsResult<()> {
        self.create_file_or_directory(caller_uid, caller_gid, path, attribute, modes, false)
    }

    pub fn delete(&mut self, caller_uid: Uid, caller_gid: Gid, path: &str) -> FsResult<()> {
        if !is_valid_non_root_path(path) {
            return Err(FsError::Invalid);
        }
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_mut()
            .ok_or(FsError::SuperblockInitFailed)?;

        let (parent_path, file_name) = split_path(path);
        let parent = resolve_path(superblock, parent_path).map_err(|_| FsError::NotFound)?;
        if !has_permission(
            &superblock.fst[parent as usize],
            caller_uid,
            caller_gid,
            Mode::Write,
        ) {
            return Err(FsError::AccessDenied);
        }

        let index = find_child(superblock, parent, file_name).map_err(|_| FsError::NotFound)?;
        let entry = superblock.fst[index as usize];
        if entry.is_directory() && !is_directory_in_use(&self.handles, superblock, index) {
            delete_directory_contents(superblock, index);
        } else if entry.is_file() && !is_file_opened(&self.handles, index) {
            delete_file(superblock, index);
        } else {
            return Err(FsError::InUse);
        }

        remove_fst_entry_from_chain(superblock, parent, index)?;
        debug!("Deleted {}", path);
        self.flush_superblock()
    }

    pub fn rename(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        old_path: &str,
        new_path: &str,
    ) -> FsResult<()> {
        if !is_valid_non_root_path(old_path) || !is_valid_non_root_path(new_path) {
            return Err(FsError::Invalid);
        }
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_mut()
            .ok_or(FsError::SuperblockInitFailed)?;

        let (old_parent_path, old_name) = split_path(old_path);
        let (new_parent_path, new_name) = split_path(new_path);

        let old_parent =
            resolve_path(superblock, old_parent_path).map_err(|_| FsError::NotFound)?;
        let new_parent =
            resolve_path(superblock, new_parent_path).map_err(|_| FsError::NotFound)?;

        if !has_permission(
            &superblock.fst[old_parent as usize],
            caller_uid,
            caller_gid,
            Mode::Write,
        ) || !has_permission(
            &superblock.fst[new_parent as usize],
            caller_uid,
            caller_gid,
            Mode::Write,
        ) {
            return Err(FsError::AccessDenied);
        }

        let index = find_child(superblock, old_parent, old_name).map_err(|_| FsError::NotFound)?;
        let entry = superblock.fst[index as usize];

        // A file keeps its stored identifier: the first 12 bytes of the old
        // and new names must agree.
        let prefix = |name: &str| -> Vec<u8> {
            name.as_bytes()[..name.len().min(MAX_NAME_LENGTH)].to_vec()
        };
        if entry.is_file() && prefix(old_name) != prefix(new_name) {
            return Err(FsError::Invalid);
        }

        if (entry.is_directory() && is_directory_in_use(&self.handles, superblock, index))
            || (entry.is_file() && is_file_opened(&self.handles, index))
        {
            return Err(FsError::InUse);
        }

        // An existing destination of the same type is deleted first.
        if let Ok(new_index) = find_child(superblock, new_parent, new_name) {
            if (superblock.fst[new_index as usize].mode & 3) != (entry.mode & 3)
                || new_index == index
            {
                return Err(FsError::Invalid);
            }

            let target = superblock.fst[new_index as usize];
            if target.is_directory() && !is_directory_in_use(&self.handles, superblock, new_index) {
                delete_directory_contents(superblock, new_index);
            } else if target.is_file() && !is_file_opened(&self.handles, new_index) {
                delete_file(superblock, new_index);
            } else {
                return Err(FsError::InUse);
            }
            remove_fst_entry_from_chain(superblock, new_parent, new_index)?;
        }

        let saved_mode = superblock.fst[index as usize].mode;
        remove_fst_entry_from_chain(superblock, old_parent, index)?;

        let parent_sub = superblock.fst[new_parent as usize].sub;
        let entry = &mut superblock.fst[index as usize];
        entry.mode = saved_mode;
        entry.set_name(new_name);
        entry.sib = parent_sub;
        superblock.fst[new_parent as usize].sub = index;

        debug!("Renamed {} to {}", old_path, new_path);
        self.flush_superblock()
    }

    pub fn read_directory(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
    ) -> FsResult<Vec<String>> {
        if path != "/" && !is_valid_non_root_path(path) {
            return Err(FsError::Invalid);
        }
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_ref()
            .ok_or(FsError::SuperblockInitFailed)?;

        let index = resolve_path(superblock, path).map_err(|_| FsError::NotFound)?;
        if !has_permission(
            &superblock.fst[index as usize],
            caller_uid,
            caller_gid,
            Mode::Read,
        ) {
            return Err(FsError::AccessDenied);
        }
        if !superblock.fst[index as usize].is_directory() {
            return Err(FsError::Invalid);
        }

        let mut children = Vec::new();
        let mut child = superblock.fst[index as usize].sub;
        while (child as usize) < superblock.fst.len() {
            children.push(superblock.fst[child as usize].name());
            child = superblock.fst[child as usize].sib;
        }
        Ok(children)
    }

    pub fn get_metadata(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
    ) -> FsResult<Metadata> {
        self.ensure_superblock()?;

        let index = if path == "/" {
            0
        } else if is_valid_non_root_path(path) {
            let superblock = self
                .superblock
                .as_ref()
                .ok_or(FsError::SuperblockInitFailed)?;
            let (parent_path, file_name) = split_path(path);

            let parent = resolve_path(superblock, parent_path).map_err(|_| FsError::NotFound)?;
            if !has_permission(
                &superblock.fst[parent as usize],
                caller_uid,
                caller_gid,
                Mode::Read,
            ) {
                return Err(FsError::AccessDenied);
            }
            find_child(superblock, parent, file_name).map_err(|_| FsError::NotFound)?
        } else {
            return Err(FsError::Invalid);
        };

        // Reflect pending writes in the reported size.
        self.flush_cache_for_fst_index(index)?;

        let superblock = self
            .superblock
            .as_ref()
            .ok_or(FsError::SuperblockInitFailed)?;
        let entry = &superblock.fst[index as usize];
        Ok(Metadata {
            uid: entry.uid,
            gid: entry.gid,
            attribute: entry.attr,
            modes: Modes {
                owner: entry.owner_mode(),
                group: entry.group_mode(),
                other: entry.other_mode(),
            },
            is_file: entry.is_file(),
            size: entry.size,
            fst_index: index,
        })
    }

    pub fn set_metadata(
        &mut self,
        caller_uid: Uid,
        path: &str,
        uid: Uid,
        gid: Gid,
        attribute: FileAttribute,
        modes: Modes,
    ) -> FsResult<()> {
        if !is_valid_non_root_path(path) {
            return Err(FsError::Invalid);
        }
        self.ensure_superblock()?;
        let index = {
            let superblock = self
                .superblock
                .as_ref()
                .ok_or(FsError::SuperblockInitFailed)?;
            resolve_path(superblock, path).map_err(|_| FsError::NotFound)?
        };

        // The entry's size (and the HMAC salt of future flushes) must match
        // what the caller is changing, so write back any cached cluster now.
        self.flush_cache_for_fst_index(index)?;

        let superblock = self
            .superblock
            .as_mut()
            .ok_or(FsError::SuperblockInitFailed)?;
        let entry = &mut superblock.fst[index as usize];

        if caller_uid != 0 && caller_uid != entry.uid {
            return Err(FsError::AccessDenied);
        }
        if caller_uid != 0 && entry.uid != uid {
            return Err(FsError::AccessDenied);
        }
        if entry.uid != uid && entry.is_file() && entry.size != 0 {
            return Err(FsError::FileNotEmpty);
        }

        entry.gid = gid;
        entry.uid = uid;
        entry.attr = attribute;
        entry.set_access_mode(modes.owner, modes.group, modes.other);

        self.flush_superblock()
    }

    pub fn get_nand_stats(&mut self) -> FsResult<NandStats> {
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_ref()
            .ok_or(FsError::SuperblockInitFailed)?;

        let mut stats = NandStats {
            cluster_size: CLUSTER_DATA_SIZE as u32,
            ..Default::default()
        };
        for &cluster in &superblock.fat {
            match cluster {
                CLUSTER_UNUSED | CLUSTER_UNUSED_LEGACY => stats.free_clusters += 1,
                CLUSTER_RESERVED => stats.reserved_clusters += 1,
                CLUSTER_BAD_BLOCK => stats.bad_clusters += 1,
                _ => stats.used_clusters += 1,
            }
        }
        for entry in &superblock.fst {
            if entry.is_unused() {
                stats.free_inodes += 1;
            } else {
                stats.used_inodes += 1;
            }
        }

        // A dirty cache occupies a cluster that the FAT does not know yet.
        if self.cache.fd.is_some() && self.cache.for_write {
            stats.free_clusters -= 1;
            stats.used_clusters += 1;
        }

        Ok(stats)
    }

    pub fn get_directory_stats(&mut self, path: &str) -> FsResult<DirectoryStats> {
        if path != "/" && !is_valid_non_root_path(path) {
            return Err(FsError::Invalid);
        }
        self.ensure_superblock()?;
        let superblock = self
            .superblock
            .as_ref()
            .ok_or(FsError::SuperblockInitFailed)?;

        let index = resolve_path(superblock, path).map_err(|_| FsError::NotFound)?;
        if !superblock.fst[index as usize].is_directory() {
            return Err(FsError::Invalid);
        }
        Ok(count_directory_recursively(superblock, index))
    }
}

impl FilesystemOps for NandFileSystem {
    fn format(&mut self, caller_uid: Uid) -> FsResult<()> {
        NandFileSystem::format(self, caller_uid)
    }

    fn open_file(&mut self, uid: Uid, gid: Gid, path: &str, mode: Mode) -> FsResult<Fd> {
        NandFileSystem::open_file(self, uid, gid, path, mode)
    }

    fn close(&mut self, fd: Fd) -> FsResult<()> {
        NandFileSystem::close(self, fd)
    }

    fn read_file(&mut self, fd: Fd, count: u32) -> FsResult<Vec<u8>> {
        NandFileSystem::read_file(self, fd, count)
    }

    fn write_file(&mut self, fd: Fd, data: &[u8]) -> FsResult<u32> {
        NandFileSystem::write_file(self, fd, data)
    }

    fn seek_file(&mut self, fd: Fd, offset: u32, mode: SeekMode) -> FsResult<u32> {
        NandFileSystem::seek_file(self, fd, offset, mode)
    }

    fn get_file_status(&self, fd: Fd) -> FsResult<FileStatus> {
        NandFileSystem::get_file_status(self, fd)
    }

    fn create_file(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
        attribute: FileAttribute,
        modes: Modes,
    ) -> FsResult<()> {
        NandFileSystem::create_file(self, caller_uid, caller_gid, path, attribute, modes)
    }

    fn create_directory(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
        attribute: FileAttribute,
        modes: Modes,
    ) -> FsResult<()> {
        NandFileSystem::create_directory(self, caller_uid, caller_gid, path, attribute, modes)
    }

    fn delete(&mut self, caller_uid: Uid, caller_gid: Gid, path: &str) -> FsResult<()> {
        NandFileSystem::delete(self, caller_uid, caller_gid, path)
    }

    fn rename(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        old_path: &str,
        new_path: &str,
    ) -> FsResult<()> {
        NandFileSystem::rename(self, caller_uid, caller_gid, old_path, new_path)
    }

    fn read_directory(
        &mut self,
        caller_uid: Uid,
        caller_gid: Gid,
        path: &str,
    ) -> FsResult<Vec<String>> {
        NandFileSystem::read_directory(self, caller_uid, caller_gid, path)
    }

    fn get_metadata(&mut self, caller_uid: Uid, caller_gid: Gid, path: &str) -> FsResult<Metadata> {
        NandFileSystem::get_metadata(self, caller_uid, caller_gid, path)
    }

    fn set_metadata(
        &mut self,
        caller_uid: Uid,
        path: &str,
        uid: Uid,
        gid: Gid,
        attribute: FileAttribute,
        modes: Modes,
    ) -> FsResult<()> {
        NandFileSystem::set_metadata(self, caller_uid, path, uid, gid, attribute, modes)
    }

    fn get_nand_stats(&mut self) -> FsResult<NandStats> {
        NandFileSystem::get_nand_stats(self)
    }

    fn get_directory_stats(&mut self, path: &str) -> FsResult<DirectoryStats> {
        NandFileSystem::get_directory_stats(self, path)
    }
}
