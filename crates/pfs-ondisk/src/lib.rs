#![forbid(unsafe_code)]
//! On-disk record layout.
//!
//! Everything PocketFS persists is one of three little-endian packed records:
//! the superblock (block 0, followed by the free-inode cache), the 128-byte
//! inode, and the 259-byte directory entry. Blocks are read whole and parsed;
//! records are encoded into byte buffers and written whole, never cast out
//! of shared buffers.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_types::{
    Acl, BlockPtr, ParseError, BLOCK_PTRS, DIRENTRY_SIZE, FILENAME_MAX, SUPERBLOCK_MAGIC,
    ensure_slice, read_le_i32, read_le_i64, read_le_u32, read_le_u64, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// On-disk inode record size. 104 bytes of fields padded to a power of two so
/// records never straddle a block boundary.
pub const INODE_SIZE: u32 = 128;

/// Fixed superblock bytes before the free-inode cache begins.
const SB_FIXED_LEN: usize = 0x28;

/// Number of free-inode cache slots for a given block size.
#[must_use]
pub fn free_cache_capacity(block_size: u32) -> usize {
    (block_size as usize - SB_FIXED_LEN) / 4
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// The filesystem header stored in block 0.
///
/// Field order matches the on-disk layout; the free-inode cache fills the
/// remainder of the block, occupied slots sorted ascending before the −1
/// sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub disk_size: u32,
    pub block_size: u32,
    pub inode_size: u32,
    /// Total data-region blocks, group bitmaps included.
    pub data_blocks: u32,
    pub total_inodes: u32,
    pub used_inodes: u32,
    pub used_blocks: u32,
    pub num_groups: u32,
    /// Device index of the first data-region block (the group 0 bitmap).
    pub first_data_block: u32,
    /// Free-inode cache; length is always `free_cache_capacity(block_size)`.
    pub free_cache: Vec<i32>,
}

impl Superblock {
    /// Compute the layout for a fresh device.
    ///
    /// The data region gets `⌊num_blocks·0.9⌋` blocks and the inode table
    /// takes what remains after block 0, so the three regions tile the
    /// device exactly.
    pub fn for_geometry(device_size: u64, block_size: u32) -> Result<Self> {
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(PfsError::Invalid(format!(
                "unsupported block size {block_size}"
            )));
        }
        if device_size % u64::from(block_size) != 0 {
            return Err(PfsError::Invalid(format!(
                "device size {device_size} is not a multiple of the block size"
            )));
        }
        let num_blocks = u32::try_from(device_size / u64::from(block_size))
            .map_err(|_| PfsError::Invalid("device too large".into()))?;
        #[expect(clippy::cast_possible_truncation)]
        let data_blocks = (u64::from(num_blocks) * 9 / 10) as u32;
        let inode_blocks = num_blocks
            .checked_sub(1 + data_blocks)
            .filter(|&b| b > 0)
            .ok_or_else(|| PfsError::Invalid(format!("device of {num_blocks} blocks too small")))?;
        if data_blocks < 2 {
            return Err(PfsError::Invalid(format!(
                "device of {num_blocks} blocks leaves no data region"
            )));
        }
        let disk_size = u32::try_from(u64::from(num_blocks) * u64::from(block_size))
            .map_err(|_| PfsError::Invalid("device too large".into()))?;
        let inodes_per_block = block_size / INODE_SIZE;
        let blocks_per_group = block_size * 8;
        let sb = Self {
            disk_size,
            block_size,
            inode_size: INODE_SIZE,
            data_blocks,
            total_inodes: inode_blocks * inodes_per_block,
            used_inodes: 0,
            // group bitmap blocks are allocated from birth
            used_blocks: data_blocks.div_ceil(blocks_per_group),
            num_groups: data_blocks.div_ceil(blocks_per_group),
            first_data_block: 1 + inode_blocks,
            free_cache: vec![-1; free_cache_capacity(block_size)],
        };
        Ok(sb)
    }

    /// Parse a superblock from the raw contents of block 0.
    pub fn decode(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, SB_FIXED_LEN)?;
        let magic = read_le_u32(data, 0x00)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }
        let sb = Self {
            disk_size: read_le_u32(data, 0x04)?,
            block_size: read_le_u32(data, 0x08)?,
            inode_size: read_le_u32(data, 0x0C)?,
            data_blocks: read_le_u32(data, 0x10)?,
            total_inodes: read_le_u32(data, 0x14)?,
            used_inodes: read_le_u32(data, 0x18)?,
            used_blocks: read_le_u32(data, 0x1C)?,
            num_groups: read_le_u32(data, 0x20)?,
            first_data_block: read_le_u32(data, 0x24)?,
            free_cache: {
                let count = (data.len() - SB_FIXED_LEN) / 4;
                let mut cache = Vec::with_capacity(count);
                for slot in 0..count {
                    cache.push(read_le_i32(data, SB_FIXED_LEN + slot * 4)?);
                }
                cache
            },
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Serialize into the raw contents of block 0. `buf.len()` must equal
    /// the block size.
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0x00..0x04].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&self.disk_size.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.block_size.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.inode_size.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.data_blocks.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.total_inodes.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.used_inodes.to_le_bytes());
        buf[0x1C..0x20].copy_from_slice(&self.used_blocks.to_le_bytes());
        buf[0x20..0x24].copy_from_slice(&self.num_groups.to_le_bytes());
        buf[0x24..0x28].copy_from_slice(&self.first_data_block.to_le_bytes());
        for (slot, &entry) in self.free_cache.iter().enumerate() {
            let off = SB_FIXED_LEN + slot * 4;
            buf[off..off + 4].copy_from_slice(&entry.to_le_bytes());
        }
    }

    /// Structural consistency of the recorded geometry.
    pub fn validate(&self) -> std::result::Result<(), ParseError> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two >= 512",
            });
        }
        if self.inode_size != INODE_SIZE {
            return Err(ParseError::InvalidField {
                field: "inode_size",
                reason: "unsupported inode record size",
            });
        }
        if self.disk_size % self.block_size != 0 {
            return Err(ParseError::InvalidField {
                field: "disk_size",
                reason: "not a multiple of the block size",
            });
        }
        let num_blocks = self.disk_size / self.block_size;
        if self.first_data_block < 2
            || u64::from(self.first_data_block) + u64::from(self.data_blocks)
                != u64::from(num_blocks)
        {
            return Err(ParseError::InvalidField {
                field: "first_data_block",
                reason: "regions do not tile the device",
            });
        }
        if self.total_inodes != self.inode_blocks() * self.inodes_per_block() {
            return Err(ParseError::InvalidField {
                field: "total_inodes",
                reason: "inconsistent with the inode table size",
            });
        }
        if self.num_groups != self.data_blocks.div_ceil(self.blocks_per_group()) {
            return Err(ParseError::InvalidField {
                field: "num_groups",
                reason: "inconsistent with the data region size",
            });
        }
        if self.used_inodes > self.total_inodes || self.used_blocks > self.data_blocks {
            return Err(ParseError::InvalidField {
                field: "used_counters",
                reason: "exceed totals",
            });
        }
        Ok(())
    }

    // ── Geometry accessors ──────────────────────────────────────────────

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.disk_size / self.block_size
    }

    #[must_use]
    pub fn inode_blocks(&self) -> u32 {
        self.first_data_block - 1
    }

    #[must_use]
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size / self.inode_size
    }

    /// Blocks covered by one full group bitmap: one bit per block.
    #[must_use]
    pub fn blocks_per_group(&self) -> u32 {
        self.block_size * 8
    }

    /// Device index of a group's leading bitmap block.
    #[must_use]
    pub fn group_bitmap_block(&self, group: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group()
    }

    /// Number of blocks actually in a group (the last group is short).
    #[must_use]
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let start = group * self.blocks_per_group();
        self.data_blocks
            .saturating_sub(start)
            .min(self.blocks_per_group())
    }

    /// Map a device block to its `(group, bit)` pair, or `None` when the
    /// block lies outside the data region.
    #[must_use]
    pub fn group_of_block(&self, block: u32) -> Option<(u32, u32)> {
        let rel = block.checked_sub(self.first_data_block)?;
        if rel >= self.data_blocks {
            return None;
        }
        Some((rel / self.blocks_per_group(), rel % self.blocks_per_group()))
    }

    /// Device block for a `(group, bit)` pair.
    #[must_use]
    pub fn block_of_group_bit(&self, group: u32, bit: u32) -> u32 {
        self.first_data_block + group * self.blocks_per_group() + bit
    }

    // ── Free-inode cache ────────────────────────────────────────────────

    /// Pop the lowest cached free inode number.
    pub fn cache_pop_min(&mut self) -> Option<u32> {
        let pos = self.free_cache.iter().position(|&e| e >= 0)?;
        let entry = self.free_cache.remove(pos);
        self.free_cache.push(-1);
        u32::try_from(entry).ok()
    }

    /// Insert a free inode number keeping the occupied prefix sorted.
    /// Returns `false` when the cache is full (the number stays recoverable
    /// through a later repopulate scan).
    pub fn cache_insert_sorted(&mut self, ino: u32) -> bool {
        let Ok(value) = i32::try_from(ino) else {
            return false;
        };
        let occupied = self.free_cache.iter().take_while(|&&e| e >= 0).count();
        if occupied == self.free_cache.len() || self.free_cache[..occupied].contains(&value) {
            return false;
        }
        let pos = self.free_cache[..occupied].partition_point(|&e| e < value);
        self.free_cache.insert(pos, value);
        self.free_cache.pop();
        true
    }

    /// Replace the cache contents with `inos` (must be sorted ascending).
    pub fn cache_fill(&mut self, inos: &[u32]) {
        debug_assert!(inos.is_sorted());
        let capacity = self.free_cache.len();
        self.free_cache.fill(-1);
        for (slot, &ino) in inos.iter().take(capacity).enumerate() {
            self.free_cache[slot] = i32::try_from(ino).unwrap_or(-1);
        }
    }

    /// Number of occupied cache slots.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.free_cache.iter().filter(|&&e| e >= 0).count()
    }
}

/// Read and validate block 0.
pub fn read_superblock(dev: &dyn BlockDevice) -> Result<Superblock> {
    let data = pfs_block::read_block_to_vec(dev, 0)?;
    Superblock::decode(&data).map_err(|err| PfsError::Corruption {
        block: 0,
        detail: err.to_string(),
    })
}

/// Serialize and write block 0.
pub fn write_superblock(dev: &dyn BlockDevice, sb: &Superblock) -> Result<()> {
    let mut buf = vec![0u8; sb.block_size as usize];
    sb.encode(&mut buf);
    dev.write_block(0, &buf)
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// In-memory inode value. Loaded whole, modified, saved whole; never shared
/// across callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub acl: Acl,
    pub links: u32,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    /// Entries 0..=11 direct, 12 single-, 13 double-, 14 triple-indirect.
    pub block: [BlockPtr; BLOCK_PTRS],
}

impl Inode {
    /// A table-skeleton inode: zero links, no blocks.
    #[must_use]
    pub fn empty(ino: u32) -> Self {
        Self {
            ino,
            uid: 0,
            gid: 0,
            acl: Acl::default(),
            links: 0,
            size: 0,
            ctime: 0,
            mtime: 0,
            atime: 0,
            block: [BlockPtr::NULL; BLOCK_PTRS],
        }
    }

    /// Parse an inode from a 128-byte table slot.
    pub fn decode(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, INODE_SIZE as usize)?;
        let mut block = [BlockPtr::NULL; BLOCK_PTRS];
        for (i, ptr) in block.iter_mut().enumerate() {
            *ptr = BlockPtr::from_raw(read_le_i32(data, 0x34 + i * 4)?);
        }
        Ok(Self {
            ino: read_le_u32(data, 0x00)?,
            uid: read_le_u32(data, 0x04)?,
            gid: read_le_u32(data, 0x08)?,
            acl: Acl::from_raw(read_le_u32(data, 0x0C)?),
            links: read_le_u32(data, 0x10)?,
            size: read_le_u64(data, 0x14)?,
            ctime: read_le_i64(data, 0x1C)?,
            mtime: read_le_i64(data, 0x24)?,
            atime: read_le_i64(data, 0x2C)?,
            block,
        })
    }

    /// Serialize into a 128-byte table slot.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= INODE_SIZE as usize);
        buf[..INODE_SIZE as usize].fill(0);
        buf[0x00..0x04].copy_from_slice(&self.ino.to_le_bytes());
        buf[0x04..0x08].copy_from_slice(&self.uid.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.gid.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.acl.raw().to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.links.to_le_bytes());
        buf[0x14..0x1C].copy_from_slice(&self.size.to_le_bytes());
        buf[0x1C..0x24].copy_from_slice(&self.ctime.to_le_bytes());
        buf[0x24..0x2C].copy_from_slice(&self.mtime.to_le_bytes());
        buf[0x2C..0x34].copy_from_slice(&self.atime.to_le_bytes());
        for (i, ptr) in self.block.iter().enumerate() {
            let off = 0x34 + i * 4;
            buf[off..off + 4].copy_from_slice(&ptr.raw().to_le_bytes());
        }
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

/// A directory record: inode number plus NUL-padded filename. Records are
/// exactly 259 bytes and packed back to back in the directory's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: u32,
    pub name: String,
}

impl DirEntry {
    #[must_use]
    pub fn new(ino: u32, name: impl Into<String>) -> Self {
        Self {
            ino,
            name: name.into(),
        }
    }

    /// Parse a record from a 259-byte slice.
    pub fn decode(data: &[u8]) -> std::result::Result<Self, ParseError> {
        let ino = read_le_u32(data, 0)?;
        let name_bytes = ensure_slice(data, 4, FILENAME_MAX)?;
        Ok(Self {
            ino,
            name: trim_nul_padded(name_bytes),
        })
    }

    /// Serialize into a 259-byte slice. The name must be non-empty, at most
    /// 255 bytes, and free of `/` and NUL.
    pub fn encode(&self, buf: &mut [u8]) -> std::result::Result<(), ParseError> {
        if buf.len() < DIRENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DIRENTRY_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        let name = self.name.as_bytes();
        if name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "empty filename",
            });
        }
        if name.len() > FILENAME_MAX {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "filename exceeds 255 bytes",
            });
        }
        if name.iter().any(|&b| b == 0 || b == b'/') {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "filename contains NUL or '/'",
            });
        }
        buf[..DIRENTRY_SIZE].fill(0);
        buf[0..4].copy_from_slice(&self.ino.to_le_bytes());
        buf[4..4 + name.len()].copy_from_slice(name);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::{FileKind, BLOCK_SIZE, DEVICE_SIZE};

    fn default_sb() -> Superblock {
        Superblock::for_geometry(DEVICE_SIZE, BLOCK_SIZE).unwrap()
    }

    #[test]
    fn geometry_of_default_device() {
        let sb = default_sb();
        assert_eq!(sb.num_blocks(), 1024);
        assert_eq!(sb.data_blocks, 921);
        assert_eq!(sb.inode_blocks(), 102);
        assert_eq!(sb.inodes_per_block(), 32);
        assert_eq!(sb.total_inodes, 102 * 32);
        assert_eq!(sb.num_groups, 1);
        assert_eq!(sb.first_data_block, 103);
        assert_eq!(sb.used_blocks, 1);
        assert_eq!(sb.blocks_in_group(0), 921);
    }

    #[test]
    fn superblock_roundtrip() {
        let mut sb = default_sb();
        sb.used_inodes = 7;
        sb.used_blocks = 19;
        sb.cache_fill(&[3, 4, 9]);

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        sb.encode(&mut buf);
        let decoded = Superblock::decode(&buf).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn superblock_bad_magic_rejected() {
        let sb = default_sb();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        sb.encode(&mut buf);
        buf[0] ^= 0xFF;
        assert!(matches!(
            Superblock::decode(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_inconsistent_geometry_rejected() {
        let mut sb = default_sb();
        sb.first_data_block += 1;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        sb.encode(&mut buf);
        assert!(Superblock::decode(&buf).is_err());
    }

    #[test]
    fn group_block_mapping() {
        let sb = default_sb();
        assert_eq!(sb.group_bitmap_block(0), 103);
        assert_eq!(sb.group_of_block(103), Some((0, 0)));
        assert_eq!(sb.group_of_block(104), Some((0, 1)));
        assert_eq!(sb.group_of_block(1023), Some((0, 920)));
        assert_eq!(sb.group_of_block(102), None);
        assert_eq!(sb.group_of_block(1024), None);
        assert_eq!(sb.block_of_group_bit(0, 5), 108);
    }

    #[test]
    fn cache_pop_and_insert_stay_sorted() {
        let mut sb = default_sb();
        sb.cache_fill(&[2, 5, 9]);
        assert_eq!(sb.cache_len(), 3);

        assert_eq!(sb.cache_pop_min(), Some(2));
        assert_eq!(sb.cache_pop_min(), Some(5));

        assert!(sb.cache_insert_sorted(3));
        assert_eq!(sb.cache_pop_min(), Some(3));
        assert_eq!(sb.cache_pop_min(), Some(9));
        assert_eq!(sb.cache_pop_min(), None);
    }

    #[test]
    fn cache_full_rejects_insert() {
        let mut sb = default_sb();
        let capacity = sb.free_cache.len();
        let all: Vec<u32> = (0..capacity as u32).collect();
        sb.cache_fill(&all);
        assert!(!sb.cache_insert_sorted(capacity as u32 + 1));
        assert_eq!(sb.cache_len(), capacity);
    }

    #[test]
    fn inode_roundtrip() {
        let mut inode = Inode::empty(17);
        inode.uid = 1000;
        inode.gid = 100;
        inode.acl = Acl::new(FileKind::Directory, 0o755);
        inode.links = 2;
        inode.size = 518;
        inode.ctime = 1_700_000_000;
        inode.mtime = 1_700_000_001;
        inode.atime = 1_700_000_002;
        inode.block[0] = BlockPtr::new(104);
        inode.block[12] = BlockPtr::new(200);

        let mut buf = vec![0u8; INODE_SIZE as usize];
        inode.encode(&mut buf);
        assert_eq!(Inode::decode(&buf).unwrap(), inode);
    }

    #[test]
    fn direntry_roundtrip() {
        let entry = DirEntry::new(42, "hello.txt");
        let mut buf = vec![0u8; DIRENTRY_SIZE];
        entry.encode(&mut buf).unwrap();
        assert_eq!(DirEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn direntry_rejects_bad_names() {
        let mut buf = vec![0u8; DIRENTRY_SIZE];
        assert!(DirEntry::new(1, "").encode(&mut buf).is_err());
        assert!(DirEntry::new(1, "a/b").encode(&mut buf).is_err());
        assert!(DirEntry::new(1, "x".repeat(256)).encode(&mut buf).is_err());
        assert!(DirEntry::new(1, "x".repeat(255)).encode(&mut buf).is_ok());
    }

    #[test]
    fn superblock_device_roundtrip() {
        let dev = pfs_block::MemBlockDevice::new(1024, BLOCK_SIZE);
        let mut sb = default_sb();
        sb.cache_fill(&[0, 1, 2]);
        write_superblock(&dev, &sb).unwrap();
        assert_eq!(read_superblock(&dev).unwrap(), sb);
    }
}
