#![forbid(unsafe_code)]
//! Shared identifiers and on-disk codec helpers for PocketFS.
//!
//! Defines the block-pointer sentinel type, the 11-bit permission word and
//! its bijection with host mode bits, little-endian slice decoding helpers,
//! and the geometry constants every other crate derives from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Geometry constants ──────────────────────────────────────────────────────

/// Default block size in bytes.
pub const BLOCK_SIZE: u32 = 4096;
/// Default backing-device size in bytes (4 MiB).
pub const DEVICE_SIZE: u64 = 4 * 1024 * 1024;

/// Number of direct block pointers in an inode.
pub const DIRECT_COUNT: usize = 12;
/// Index of the single-indirect pointer in `Inode::block`.
pub const SINGLE_INDIRECT: usize = 12;
/// Index of the double-indirect pointer in `Inode::block`.
pub const DOUBLE_INDIRECT: usize = 13;
/// Index of the triple-indirect pointer in `Inode::block`.
pub const TRIPLE_INDIRECT: usize = 14;
/// Total block pointers per inode (12 direct + 3 indirect).
pub const BLOCK_PTRS: usize = 15;

/// Size of the filename field in a directory record.
pub const FILENAME_MAX: usize = 255;
/// On-disk directory record size: 4-byte inode number + NUL-padded name.
/// Alignment is 1; records are packed back to back.
pub const DIRENTRY_SIZE: usize = 4 + FILENAME_MAX;

/// Superblock magic, the bytes `"pkfs"` read little-endian.
pub const SUPERBLOCK_MAGIC: u32 = 0x7366_6B70;

// ── Block pointers ──────────────────────────────────────────────────────────

/// On-disk block pointer: a valid device block number or `NULL` (−1).
///
/// Used for the 15 in-inode pointers. Entries inside indirect tables use 0
/// as their sentinel instead (block 0 is the superblock and can never hold
/// file data), so they are plain `u32` on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPtr(i32);

impl BlockPtr {
    /// The unallocated sentinel.
    pub const NULL: Self = Self(-1);

    /// Wrap a device block number.
    #[must_use]
    pub fn new(block: u32) -> Self {
        debug_assert!(i32::try_from(block).is_ok());
        #[expect(clippy::cast_possible_wrap)]
        let raw = block as i32;
        Self(raw)
    }

    /// The block number, or `None` when unallocated.
    #[must_use]
    pub fn get(self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 < 0
    }

    /// Raw on-disk representation.
    #[must_use]
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Rehydrate from the on-disk representation. Any negative value is
    /// normalized to `NULL`.
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        if raw < 0 { Self::NULL } else { Self(raw) }
    }
}

impl Default for BlockPtr {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(block) => write!(f, "{block}"),
            None => write!(f, "-"),
        }
    }
}

// ── Permission word ─────────────────────────────────────────────────────────

/// File type stored in the low two bits of the permission word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Device,
    Symlink,
}

impl FileKind {
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b01 => Self::Directory,
            0b10 => Self::Device,
            0b11 => Self::Symlink,
            _ => Self::Regular,
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u32 {
        match self {
            Self::Regular => 0b00,
            Self::Directory => 0b01,
            Self::Device => 0b10,
            Self::Symlink => 0b11,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular => write!(f, "file"),
            Self::Directory => write!(f, "dir"),
            Self::Device => write!(f, "device"),
            Self::Symlink => write!(f, "symlink"),
        }
    }
}

/// Host file-type bits (`S_IFMT` subset) used by the mode bijection.
pub mod mode {
    pub const S_IFMT: u32 = 0o170_000;
    pub const S_IFREG: u32 = 0o100_000;
    pub const S_IFDIR: u32 = 0o040_000;
    pub const S_IFCHR: u32 = 0o020_000;
    pub const S_IFLNK: u32 = 0o120_000;
}

/// The 11-bit access-control word stored in every inode.
///
/// Layout: bits 0..=1 file type (00 regular, 01 directory, 10 device,
/// 11 symlink); bits 2..=4 owner r/w/x (r lowest); bits 5..=7 group r/w/x;
/// bits 8..=10 world r/w/x. Bits 11+ must be zero; a word with high bits set
/// is corrupt and gets the inode freed by fsck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Acl(u32);

/// Reverse a 3-bit rwx triple between the on-disk order (r lowest) and the
/// POSIX order (r highest).
fn flip3(triple: u32) -> u32 {
    ((triple & 0b100) >> 2) | (triple & 0b010) | ((triple & 0b001) << 2)
}

impl Acl {
    /// Build a word from a file type and POSIX-style permission bits
    /// (e.g. `0o755`).
    #[must_use]
    pub fn new(kind: FileKind, perms: u32) -> Self {
        let owner = flip3((perms >> 6) & 0b111);
        let group = flip3((perms >> 3) & 0b111);
        let world = flip3(perms & 0b111);
        Self(kind.to_bits() | (owner << 2) | (group << 5) | (world << 8))
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Whether the word fits in its 11 bits.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 >> 11 == 0
    }

    #[must_use]
    pub fn kind(self) -> FileKind {
        FileKind::from_bits(self.0)
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// POSIX-style permission bits (e.g. `0o644`).
    #[must_use]
    pub fn perms(self) -> u32 {
        let owner = flip3((self.0 >> 2) & 0b111);
        let group = flip3((self.0 >> 5) & 0b111);
        let world = flip3((self.0 >> 8) & 0b111);
        (owner << 6) | (group << 3) | world
    }

    /// Replace the permission bits, keeping the file type.
    #[must_use]
    pub fn with_perms(self, perms: u32) -> Self {
        Self::new(self.kind(), perms & 0o777)
    }

    /// Map onto host mode bits (bijective with `from_mode`).
    #[must_use]
    pub fn to_mode(self) -> u32 {
        let kind = match self.kind() {
            FileKind::Regular => mode::S_IFREG,
            FileKind::Directory => mode::S_IFDIR,
            FileKind::Device => mode::S_IFCHR,
            FileKind::Symlink => mode::S_IFLNK,
        };
        kind | self.perms()
    }

    /// Build a word from host mode bits.
    #[must_use]
    pub fn from_mode(host_mode: u32) -> Self {
        let kind = match host_mode & mode::S_IFMT {
            mode::S_IFDIR => FileKind::Directory,
            mode::S_IFCHR => FileKind::Device,
            mode::S_IFLNK => FileKind::Symlink,
            _ => FileKind::Regular,
        };
        Self::new(kind, host_mode & 0o777)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

/// Errors from decoding on-disk records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("need {needed} bytes at offset {offset}, have {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },

    #[error("bad magic: expected {expected:#x}, found {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Little-endian slice decoding ────────────────────────────────────────────

/// Borrow `len` bytes at `offset`, or report what was missing.
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "offset + length overflows",
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

/// Read a little-endian `u16` at `offset`.
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32` at `offset`.
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `i32` at `offset`.
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `u64` at `offset`.
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

/// Read a little-endian `i64` at `offset`.
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_le_bytes(raw))
}

/// Decode a NUL-padded name field into an owned string (lossy for non-UTF-8).
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ptr_sentinel() {
        assert!(BlockPtr::NULL.is_null());
        assert_eq!(BlockPtr::NULL.get(), None);
        assert_eq!(BlockPtr::NULL.raw(), -1);

        let ptr = BlockPtr::new(42);
        assert_eq!(ptr.get(), Some(42));
        assert_eq!(ptr.raw(), 42);
        assert_eq!(BlockPtr::from_raw(-7), BlockPtr::NULL);
    }

    #[test]
    fn file_kind_bits_roundtrip() {
        for kind in [
            FileKind::Regular,
            FileKind::Directory,
            FileKind::Device,
            FileKind::Symlink,
        ] {
            assert_eq!(FileKind::from_bits(kind.to_bits()), kind);
        }
    }

    #[test]
    fn acl_perms_roundtrip() {
        for perms in [0o000, 0o644, 0o755, 0o777, 0o521] {
            let acl = Acl::new(FileKind::Regular, perms);
            assert!(acl.is_valid());
            assert_eq!(acl.perms(), perms);
        }
    }

    #[test]
    fn acl_mode_bijection() {
        let acl = Acl::new(FileKind::Directory, 0o755);
        assert_eq!(acl.to_mode(), mode::S_IFDIR | 0o755);
        assert_eq!(Acl::from_mode(acl.to_mode()), acl);

        let file = Acl::from_mode(mode::S_IFREG | 0o640);
        assert_eq!(file.kind(), FileKind::Regular);
        assert_eq!(file.perms(), 0o640);
    }

    #[test]
    fn acl_validity() {
        assert!(Acl::new(FileKind::Symlink, 0o777).is_valid());
        assert!(!Acl::from_raw(1 << 11).is_valid());
        assert!(!Acl::from_raw(u32::MAX).is_valid());
    }

    #[test]
    fn le_readers() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_i32(&bytes, 4).expect("i32"), -1);
        assert!(matches!(
            read_le_u32(&bytes, 6),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn nul_padded_names() {
        assert_eq!(trim_nul_padded(b"hello\0\0\0"), "hello");
        assert_eq!(trim_nul_padded(b"full"), "full");
        assert_eq!(trim_nul_padded(b"\0rest"), "");
    }
}
