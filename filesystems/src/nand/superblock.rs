// Superblock and FST records.
// The superblock is the combined magic/version/FAT/FST block stored in 16
// rotating copies at the end of the medium. All multi-byte fields are
// big-endian on media.

use byteorder::{BigEndian, ByteOrder};
use static_assertions::const_assert_eq;

use super::layout::{
    CLUSTER_COUNT, CLUSTER_UNUSED, CLUSTER_UNUSED_LEGACY, SUPERBLOCK_SIZE,
};
use crate::ops::Mode;

pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"SFFS";

/// Sentinel for an empty `sub`/`sib` link.
pub const FST_NONE: u16 = 0xffff;

pub const FST_ENTRY_SIZE: usize = 32;
const SUPERBLOCK_HEADER_SIZE: usize = 12;
const FAT_BYTES: usize = 2 * CLUSTER_COUNT;
pub const FST_ENTRY_COUNT: usize =
    (SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE - FAT_BYTES) / FST_ENTRY_SIZE;
const SUPERBLOCK_PADDING: usize =
    SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE - FAT_BYTES - FST_ENTRY_SIZE * FST_ENTRY_COUNT;

const_assert_eq!(FST_ENTRY_COUNT, 6143);
const_assert_eq!(SUPERBLOCK_PADDING, 20);

pub const MAX_NAME_LENGTH: usize = 12;

/// One 32-byte filesystem tree record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FstEntry {
    pub name: [u8; MAX_NAME_LENGTH],
    pub mode: u8,
    pub attr: u8,
    /// First child for a directory, first cluster for a file.
    pub sub: u16,
    /// Next sibling, or `FST_NONE`.
    pub sib: u16,
    pub size: u32,
    pub uid: u32,
    pub gid: u16,
    /// Opaque; preserved verbatim and bound into the data HMAC salt.
    pub x3: u32,
}

impl Default for FstEntry {
    fn default() -> Self {
        FstEntry {
            name: [0; MAX_NAME_LENGTH],
            mode: 0,
            attr: 0,
            sub: 0,
            sib: 0,
            size: 0,
            uid: 0,
            gid: 0,
            x3: 0,
        }
    }
}

impl FstEntry {
    /// Name bytes up to the first NUL. Stored names keep at most 12 bytes.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_NAME_LENGTH);
        &self.name[..len]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn set_name(&mut self, new_name: &str) {
        self.name = [0; MAX_NAME_LENGTH];
        let bytes = new_name.as_bytes();
        let len = bytes.len().min(MAX_NAME_LENGTH);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn is_unused(&self) -> bool {
        self.mode & 3 == 0
    }

    pub fn is_file(&self) -> bool {
        self.mode & 3 == 1
    }

    pub fn is_directory(&self) -> bool {
        self.mode & 3 == 2
    }

    pub fn owner_mode(&self) -> Mode {
        Mode::from_bits(self.mode >> 6)
    }

    pub fn group_mode(&self) -> Mode {
        Mode::from_bits(self.mode >> 4)
    }

    pub fn other_mode(&self) -> Mode {
        Mode::from_bits(self.mode >> 2)
    }

    pub fn set_access_mode(&mut self, owner: Mode, group: Mode, other: Mode) {
        self.mode = (self.mode & 3)
            | ((owner as u8) << 6)
            | ((group as u8) << 4)
            | ((other as u8) << 2);
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0..12].copy_from_slice(&self.name);
        out[12] = self.mode;
        out[13] = self.attr;
        BigEndian::write_u16(&mut out[14..16], self.sub);
        BigEndian::write_u16(&mut out[16..18], self.sib);
        BigEndian::write_u32(&mut out[18..22], self.size);
        BigEndian::write_u32(&mut out[22..26], self.uid);
        BigEndian::write_u16(&mut out[26..28], self.gid);
        BigEndian::write_u32(&mut out[28..32], self.x3);
    }

    fn read_from(input: &[u8]) -> FstEntry {
        let mut name = [0u8; MAX_NAME_LENGTH];
        name.copy_from_slice(&input[0..12]);
        FstEntry {
            name,
            mode: input[12],
            attr: input[13],
            sub: BigEndian::read_u16(&input[14..16]),
            sib: BigEndian::read_u16(&input[16..18]),
            size: BigEndian::read_u32(&input[18..22]),
            uid: BigEndian::read_u32(&input[22..26]),
            gid: BigEndian::read_u16(&input[26..28]),
            x3: BigEndian::read_u32(&input[28..32]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: [u8; 4],
    pub version: u32,
    /// Unknown header field; preserved verbatim.
    pub unused: u32,
    pub fat: Vec<u16>,
    pub fst: Vec<FstEntry>,
    padding: [u8; SUPERBLOCK_PADDING],
}

impl Default for Superblock {
    fn default() -> Self {
        Superblock {
            magic: SUPERBLOCK_MAGIC,
            version: 0,
            unused: 0,
            fat: vec![0; CLUSTER_COUNT],
            fst: vec![FstEntry::default(); FST_ENTRY_COUNT],
            padding: [0; SUPERBLOCK_PADDING],
        }
    }
}

impl Superblock {
    /// Serialise to the exact on-media form (one superblock copy, 0x40000
    /// bytes, before any spare-area data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; SUPERBLOCK_SIZE];
        buffer[0..4].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buffer[4..8], self.version);
        BigEndian::write_u32(&mut buffer[8..12], self.unused);
        BigEndian::write_u16_into(
            &self.fat,
            &mut buffer[SUPERBLOCK_HEADER_SIZE..SUPERBLOCK_HEADER_SIZE + FAT_BYTES],
        );
        let mut offset = SUPERBLOCK_HEADER_SIZE + FAT_BYTES;
        for entry in &self.fst {
            entry.write_to(&mut buffer[offset..offset + FST_ENTRY_SIZE]);
            offset += FST_ENTRY_SIZE;
        }
        buffer[offset..].copy_from_slice(&self.padding);
        buffer
    }

    pub fn from_bytes(buffer: &[u8]) -> Superblock {
        debug_assert_eq!(buffer.len(), SUPERBLOCK_SIZE);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buffer[0..4]);
        let version = BigEndian::read_u32(&buffer[4..8]);
        let unused = BigEndian::read_u32(&buffer[8..12]);
        let mut fat = vec![0u16; CLUSTER_COUNT];
        BigEndian::read_u16_into(
            &buffer[SUPERBLOCK_HEADER_SIZE..SUPERBLOCK_HEADER_SIZE + FAT_BYTES],
            &mut fat,
        );
        let mut fst = Vec::with_capacity(FST_ENTRY_COUNT);
        let mut offset = SUPERBLOCK_HEADER_SIZE + FAT_BYTES;
        for _ in 0..FST_ENTRY_COUNT {
            fst.push(FstEntry::read_from(&buffer[offset..offset + FST_ENTRY_SIZE]));
            offset += FST_ENTRY_SIZE;
        }
        let mut padding = [0u8; SUPERBLOCK_PADDING];
        padding.copy_from_slice(&buffer[offset..]);
        Superblock {
            magic,
            version,
            unused,
            fat,
            fst,
            padding,
        }
    }

    /// Rewrite legacy free markers left behind by older drivers. Only done
    /// in memory; the legacy value is never re-emitted.
    pub fn normalise_legacy_fat(&mut self) {
        for entry in &mut self.fat {
            if *entry == CLUSTER_UNUSED_LEGACY {
                *entry = CLUSTER_UNUSED;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_round_trip() {
        let mut entry = FstEntry {
            mode: 1,
            ..Default::default()
        };
        entry.set_access_mode(Mode::ReadWrite, Mode::Read, Mode::None);
        assert_eq!(entry.mode, 1 | 0xc0 | 0x10);
        assert!(entry.is_file());
        assert_eq!(entry.owner_mode(), Mode::ReadWrite);
        assert_eq!(entry.group_mode(), Mode::Read);
        assert_eq!(entry.other_mode(), Mode::None);

        // Changing permissions must not disturb the entry type.
        entry.set_access_mode(Mode::None, Mode::Write, Mode::ReadWrite);
        assert!(entry.is_file());
        assert_eq!(entry.owner_mode(), Mode::None);
        assert_eq!(entry.group_mode(), Mode::Write);
        assert_eq!(entry.other_mode(), Mode::ReadWrite);
    }

    #[test]
    fn names_are_capped_at_twelve_bytes() {
        let mut entry = FstEntry::default();
        entry.set_name("banner.bin");
        assert_eq!(entry.name(), "banner.bin");
        entry.set_name("abcdefghijkl.bin");
        assert_eq!(entry.name(), "abcdefghijkl");
        entry.set_name("x");
        assert_eq!(entry.name(), "x");
        assert_eq!(&entry.name[1..], &[0u8; 11]);
    }

    #[test]
    fn entry_serialisation_is_big_endian() {
        let mut entry = FstEntry {
            mode: 0xf1,
            attr: 0x42,
            sub: 0x1234,
            sib: FST_NONE,
            size: 0x0102_0304,
            uid: 0xa1b2_c3d4,
            gid: 0x5566,
            x3: 0x0908_0706,
            ..Default::default()
        };
        entry.set_name("SYSCONF");
        let mut bytes = [0u8; FST_ENTRY_SIZE];
        entry.write_to(&mut bytes);
        assert_eq!(&bytes[0..7], b"SYSCONF");
        assert_eq!(bytes[12], 0xf1);
        assert_eq!(bytes[13], 0x42);
        assert_eq!(&bytes[14..18], &[0x12, 0x34, 0xff, 0xff]);
        assert_eq!(&bytes[18..22], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[22..26], &[0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(&bytes[26..28], &[0x55, 0x66]);
        assert_eq!(&bytes[28..32], &[0x09, 0x08, 0x07, 0x06]);
        assert_eq!(FstEntry::read_from(&bytes), entry);
    }

    #[test]
    fn superblock_round_trip_is_byte_exact() {
        let mut superblock = Superblock {
            version: 7,
            unused: 0xcafe_f00d,
            ..Default::default()
        };
        superblock.fat[0] = 0xfffc;
        superblock.fat[100] = 0x1234;
        superblock.fat[CLUSTER_COUNT - 1] = 0xfffe;
        superblock.fst[0].set_name("/");
        superblock.fst[0].mode = 0xf2;
        superblock.fst[42].set_name("title.tmd");
        superblock.fst[42].mode = 1;
        superblock.fst[42].size = 9999;

        let bytes = superblock.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(&bytes[0..4], b"SFFS");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 7]);
        // FAT entry 100 lands at a fixed big-endian offset.
        assert_eq!(&bytes[12 + 200..12 + 202], &[0x12, 0x34]);

        let decoded = Superblock::from_bytes(&bytes);
        assert_eq!(decoded, superblock);
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn legacy_free_markers_are_normalised() {
        let mut superblock = Superblock::default();
        superblock.fat[5] = CLUSTER_UNUSED_LEGACY;
        superblock.fat[6] = CLUSTER_UNUSED;
        superblock.fat[7] = 0x0008;
        superblock.normalise_legacy_fat();
        assert_eq!(superblock.fat[5], CLUSTER_UNUSED);
        assert_eq!(superblock.fat[6], CLUSTER_UNUSED);
        assert_eq!(superblock.fat[7], 0x0008);
    }
}
