#![forbid(unsafe_code)]
//! Data-block allocation.
//!
//! The data region is partitioned into block groups; each group's first
//! block is an allocation bitmap covering the group, one bit per block,
//! LSB-first within each byte. Bit 0 describes the bitmap block itself and
//! stays set for the life of the filesystem.
//!
//! ## Design
//!
//! 1. **Bitmap primitives** — raw bit manipulation on byte slices, bounded
//!    by an explicit bit count (the last group is shorter than a full
//!    bitmap).
//! 2. **Allocator** — first-fit scan across groups in order; read the
//!    bitmap block, flip the bit, write it back.
//! 3. **Subtree free** — recursive release of indirect block trees, shared
//!    by inode deletion and truncation.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::Superblock;
use tracing::trace;

// ── Bitmap primitives ───────────────────────────────────────────────────────

/// Whether bit `idx` is set. Out-of-range indices read as set ("in use"), so
/// a bounded scan can never allocate past the end of a short group.
#[must_use]
pub fn bitmap_test(bitmap: &[u8], nbits: u32, idx: u32) -> bool {
    if idx >= nbits {
        return true;
    }
    let byte = (idx / 8) as usize;
    if byte >= bitmap.len() {
        return true;
    }
    (bitmap[byte] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx`. Idempotent; returns `false` when `idx` is out of range.
pub fn bitmap_set(bitmap: &mut [u8], nbits: u32, idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    if idx >= nbits || byte >= bitmap.len() {
        return false;
    }
    bitmap[byte] |= 1 << (idx % 8);
    true
}

/// Clear bit `idx`. Idempotent; returns `false` when `idx` is out of range.
pub fn bitmap_clear(bitmap: &mut [u8], nbits: u32, idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    if idx >= nbits || byte >= bitmap.len() {
        return false;
    }
    bitmap[byte] &= !(1 << (idx % 8));
    true
}

/// Index of the lowest clear bit among the first `nbits`, or `None` when
/// every tracked bit is set.
#[must_use]
pub fn bitmap_first_clear(bitmap: &[u8], nbits: u32) -> Option<u32> {
    for (byte_idx, &byte) in bitmap.iter().enumerate() {
        if byte == 0xFF {
            continue;
        }
        let idx = byte_idx as u32 * 8 + byte.trailing_ones();
        return (idx < nbits).then_some(idx);
    }
    None
}

/// Number of set bits among the first `nbits`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], nbits: u32) -> u32 {
    let full_bytes = (nbits / 8) as usize;
    let mut set: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|b| b.count_ones())
        .sum();
    let remainder = nbits % 8;
    if remainder > 0 && full_bytes < bitmap.len() {
        let mask = (1u8 << remainder) - 1;
        set += (bitmap[full_bytes] & mask).count_ones();
    }
    set
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// Allocate one data block, first-fit across groups in order.
///
/// The chosen block is zero-filled before it is handed out, so callers that
/// treat it as an indirect table see all-unallocated entries. Returns
/// `NoSpace` when every group is full.
pub fn alloc_block(dev: &dyn BlockDevice, sb: &mut Superblock) -> Result<u32> {
    let block_size = sb.block_size as usize;
    let mut bitmap = vec![0u8; block_size];
    for group in 0..sb.num_groups {
        let bitmap_block = sb.group_bitmap_block(group);
        dev.read_block(bitmap_block, &mut bitmap)?;
        let Some(bit) = bitmap_first_clear(&bitmap, sb.blocks_in_group(group)) else {
            continue;
        };
        bitmap_set(&mut bitmap, sb.blocks_in_group(group), bit);
        dev.write_block(bitmap_block, &bitmap)?;

        let block = sb.block_of_group_bit(group, bit);
        let zeros = vec![0u8; block_size];
        dev.write_block(block, &zeros)?;
        sb.used_blocks += 1;
        trace!(
            target: "pfs::alloc",
            event = "block_alloc",
            group = group,
            block = block
        );
        return Ok(block);
    }
    Err(PfsError::NoSpace)
}

/// Free one data block: zero it, clear its bitmap bit, drop the counter.
///
/// Freeing a block outside the data region, a group bitmap block, or a block
/// that is already free fails without mutating anything.
pub fn free_block(dev: &dyn BlockDevice, sb: &mut Superblock, block: u32) -> Result<()> {
    let Some((group, bit)) = sb.group_of_block(block) else {
        return Err(PfsError::Invalid(format!(
            "block {block} is outside the data region"
        )));
    };
    if bit == 0 {
        return Err(PfsError::Invalid(format!(
            "block {block} is a group bitmap"
        )));
    }

    let nbits = sb.blocks_in_group(group);
    let bitmap_block = sb.group_bitmap_block(group);
    let mut bitmap = vec![0u8; sb.block_size as usize];
    dev.read_block(bitmap_block, &mut bitmap)?;
    if !bitmap_test(&bitmap, nbits, bit) {
        return Err(PfsError::Invalid(format!("block {block} is already free")));
    }

    let zeros = vec![0u8; sb.block_size as usize];
    dev.write_block(block, &zeros)?;
    bitmap_clear(&mut bitmap, nbits, bit);
    dev.write_block(bitmap_block, &bitmap)?;
    sb.used_blocks -= 1;
    trace!(
        target: "pfs::alloc",
        event = "block_free",
        group = group,
        block = block
    );
    Ok(())
}

/// Free an indirect table block and everything below it.
///
/// `depth` 0 means the table's entries are data blocks (a single-indirect
/// table); depth 1 means they are depth-0 tables, and so on. Entry 0 is the
/// unallocated sentinel inside tables.
pub fn free_indirect_subtree(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    table_block: u32,
    depth: u8,
) -> Result<()> {
    let table = pfs_block::read_block_to_vec(dev, table_block)?;
    for chunk in table.chunks_exact(4) {
        let entry = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if entry == 0 {
            continue;
        }
        if depth == 0 {
            free_block(dev, sb, entry)?;
        } else {
            free_indirect_subtree(dev, sb, entry, depth - 1)?;
        }
    }
    free_block(dev, sb, table_block)
}

// ── Tests ───────────────────────────────────────────────────────────────────
