// Filesystem backends and the operations surface they share.

pub mod nand;
pub mod ops;

pub use nand::NandFileSystem;
pub use ops::{
    DirectoryStats, Fd, FileAttribute, FileStatus, FilesystemOps, Gid, Metadata, Mode, Modes,
    NandStats, SeekMode, Uid,
};
