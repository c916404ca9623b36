// Path validation, splitting and FST tree lookup.

use sffs_core::{FsError, FsResult};

use super::superblock::{FstEntry, Superblock, MAX_NAME_LENGTH};
use crate::ops::{Gid, Mode, Uid};

pub const MAX_PATH_LENGTH: usize = 64;
pub const MAX_PATH_DEPTH: usize = 8;

/// Absolute, non-root, no trailing separator, within the length limit.
pub fn is_valid_non_root_path(path: &str) -> bool {
    path.len() > 1
        && path.len() <= MAX_PATH_LENGTH
        && path.starts_with('/')
        && !path.ends_with('/')
}

/// Every byte of a created path must be printable ASCII above space, apart
/// from the separators themselves.
pub fn has_valid_characters(path: &str) -> bool {
    path.bytes().all(|b| b == b'/' || (b > 0x20 && b <= 0x7e))
}

/// Split a valid non-root path into its parent path and file name.
///
/// `/shared2/sys/SYSCONF` => (`/shared2/sys`, `SYSCONF`)
pub fn split_path(path: &str) -> (&str, &str) {
    let separator = path.rfind('/').unwrap_or(0);
    let parent = if separator == 0 { "/" } else { &path[..separator] };
    (parent, &path[separator + 1..])
}

pub fn has_permission(entry: &FstEntry, uid: Uid, gid: Gid, requested: Mode) -> bool {
    if uid == 0 {
        return true;
    }
    let granted = if entry.uid == uid {
        entry.owner_mode()
    } else if entry.gid == gid {
        entry.group_mode()
    } else {
        entry.other_mode()
    };
    granted.includes(requested)
}

/// Resolve an absolute path to its FST index, starting from the root.
pub fn resolve_path(superblock: &Superblock, path: &str) -> FsResult<u16> {
    if path == "/" || path.is_empty() {
        return Ok(0);
    }
    let mut fst_index = 0u16;
    for component in path[1..].split('/') {
        fst_index = find_child(superblock, fst_index, component)?;
    }
    Ok(fst_index)
}

/// Find a directory entry by name among `parent`'s children. Names longer
/// than the stored 12 bytes never match.
pub fn find_child(superblock: &Superblock, parent: u16, file_name: &str) -> FsResult<u16> {
    if parent as usize >= superblock.fst.len() || file_name.len() > MAX_NAME_LENGTH {
        return Err(FsError::Invalid);
    }

    let mut index = superblock.fst[parent as usize].sub;
    while (index as usize) < superblock.fst.len() {
        if superblock.fst[index as usize].name_bytes() == file_name.as_bytes() {
            return Ok(index);
        }
        index = superblock.fst[index as usize].sib;
    }
    Err(FsError::Invalid)
}

pub fn find_unused_fst_index(superblock: &Superblock) -> FsResult<u16> {
    superblock
        .fst
        .iter()
        .position(|entry| entry.is_unused())
        .map(|index| index as u16)
        .ok_or(FsError::FstFull)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::superblock::FST_NONE;

    #[test]
    fn path_validity_boundaries() {
        assert!(is_valid_non_root_path("/a"));
        assert!(!is_valid_non_root_path("/"));
        assert!(!is_valid_non_root_path(""));
        assert!(!is_valid_non_root_path("a/b"));
        assert!(!is_valid_non_root_path("/a/"));

        // 64 bytes including the leading separator is the maximum.
        let path64 = format!("/{}", "a".repeat(63));
        let path65 = format!("/{}", "a".repeat(64));
        assert_eq!(path64.len(), 64);
        assert!(is_valid_non_root_path(&path64));
        assert!(!is_valid_non_root_path(&path65));
    }

    #[test]
    fn character_validation() {
        assert!(has_valid_characters("/tmp/launch.log"));
        assert!(has_valid_characters("/~weird!chars"));
        assert!(!has_valid_characters("/has space"));
        assert!(!has_valid_characters("/ctrl\x01char"));
        assert!(!has_valid_characters("/del\x7fchar"));
    }

    #[test]
    fn split_parent_and_name() {
        assert_eq!(split_path("/shared2/sys/SYSCONF"), ("/shared2/sys", "SYSCONF"));
        assert_eq!(split_path("/tmp"), ("/", "tmp"));
    }

    fn superblock_with_tree() -> Superblock {
        // /: { dir "sys" { file "SYSCONF" }, file "banner" }
        let mut superblock = Superblock::default();
        superblock.fst[0].set_name("/");
        superblock.fst[0].mode = 2;
        superblock.fst[0].sub = 2;
        superblock.fst[0].sib = FST_NONE;

        superblock.fst[1].set_name("sys");
        superblock.fst[1].mode = 2;
        superblock.fst[1].sub = 3;
        superblock.fst[1].sib = FST_NONE;

        superblock.fst[2].set_name("banner");
        superblock.fst[2].mode = 1;
        superblock.fst[2].sib = 1;

        superblock.fst[3].set_name("SYSCONF");
        superblock.fst[3].mode = 1;
        superblock.fst[3].sib = FST_NONE;
        superblock
    }

    #[test]
    fn resolves_nested_paths() {
        let superblock = superblock_with_tree();
        assert_eq!(resolve_path(&superblock, "/"), Ok(0));
        assert_eq!(resolve_path(&superblock, "/banner"), Ok(2));
        assert_eq!(resolve_path(&superblock, "/sys"), Ok(1));
        assert_eq!(resolve_path(&superblock, "/sys/SYSCONF"), Ok(3));
        assert!(resolve_path(&superblock, "/nope").is_err());
        assert!(resolve_path(&superblock, "/sys/nope").is_err());
        // An empty component never matches anything.
        assert!(resolve_path(&superblock, "/sys//SYSCONF").is_err());
    }

    #[test]
    fn lookup_rejects_over_long_names() {
        let mut superblock = superblock_with_tree();
        superblock.fst[2].set_name("abcdefghijkl");
        assert_eq!(find_child(&superblock, 0, "abcdefghijkl"), Ok(2));
        // Thirteen bytes can never match a stored name.
        assert!(find_child(&superblock, 0, "abcdefghijkl.bin").is_err());
        assert!(find_child(&superblock, 0, "abcdefghijkx").is_err());
    }

    #[test]
    fn permission_matrix() {
        let mut entry = FstEntry {
            uid: 7,
            gid: 3,
            mode: 1,
            ..Default::default()
        };
        entry.set_access_mode(Mode::ReadWrite, Mode::Read, Mode::None);

        // Root bypasses everything.
        assert!(has_permission(&entry, 0, 0, Mode::ReadWrite));
        // Owner gets the owner bits.
        assert!(has_permission(&entry, 7, 9, Mode::ReadWrite));
        // Group members get the group bits.
        assert!(has_permission(&entry, 8, 3, Mode::Read));
        assert!(!has_permission(&entry, 8, 3, Mode::Write));
        // Everyone else gets the other bits.
        assert!(!has_permission(&entry, 8, 9, Mode::Read));
        assert!(has_permission(&entry, 8, 9, Mode::None));
    }

    #[test]
    fn unused_slot_scan() {
        let superblock = superblock_with_tree();
        assert_eq!(find_unused_fst_index(&superblock), Ok(4));

        let mut full = superblock;
        for entry in &mut full.fst {
            entry.mode = 1;
        }
        assert_eq!(find_unused_fst_index(&full), Err(FsError::FstFull));
    }
}
