#![forbid(unsafe_code)]
//! Inode lifecycle.
//!
//! Inode `n` lives in slot `n % inodes_per_block` of table block
//! `1 + n / inodes_per_block`; saving an inode rewrites exactly that block.
//! Allocation pops the lowest number off the superblock's free-inode cache,
//! falling back to a wrap-around scan of the table when the cache drains.
//! Release walks the inode's direct and indirect subtrees, returns every
//! data block, and puts the number back on the cache.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{Inode, Superblock};
use pfs_types::{BlockPtr, DIRECT_COUNT, DOUBLE_INDIRECT, SINGLE_INDIRECT, TRIPLE_INDIRECT};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Current time in whole Unix seconds.
#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

// ── Table addressing ────────────────────────────────────────────────────────

/// Table block and byte offset of an inode's slot.
#[must_use]
pub fn locate(sb: &Superblock, ino: u32) -> (u32, usize) {
    let per_block = sb.inodes_per_block();
    let block = 1 + ino / per_block;
    let offset = (ino % per_block) as usize * sb.inode_size as usize;
    (block, offset)
}

fn check_ino(sb: &Superblock, ino: u32) -> Result<()> {
    if ino >= sb.total_inodes {
        return Err(PfsError::Invalid(format!(
            "inode {ino} out of range: table holds {}",
            sb.total_inodes
        )));
    }
    Ok(())
}

/// Load an inode from the table.
pub fn load(dev: &dyn BlockDevice, sb: &Superblock, ino: u32) -> Result<Inode> {
    check_ino(sb, ino)?;
    let (block, offset) = locate(sb, ino);
    let data = pfs_block::read_block_to_vec(dev, block)?;
    let inode = Inode::decode(&data[offset..offset + sb.inode_size as usize]).map_err(|err| {
        PfsError::Corruption {
            block,
            detail: err.to_string(),
        }
    })?;
    Ok(inode)
}

/// Save an inode: read-modify-write of the one table block holding its slot.
pub fn save(dev: &dyn BlockDevice, sb: &Superblock, inode: &Inode) -> Result<()> {
    check_ino(sb, inode.ino)?;
    let (block, offset) = locate(sb, inode.ino);
    let mut data = pfs_block::read_block_to_vec(dev, block)?;
    inode.encode(&mut data[offset..offset + sb.inode_size as usize]);
    dev.write_block(block, &data)
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Where the next cache-repopulate scan starts: just past the last inode
/// handed out. Process-local; the on-disk superblock does not carry it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocCursor(pub u32);

/// Pop a free inode number, repopulating the cache from the table when it
/// runs dry. Returns `Ok(None)` only when every inode is in use.
pub fn find_free(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    cursor: &mut AllocCursor,
) -> Result<Option<u32>> {
    if let Some(ino) = sb.cache_pop_min() {
        cursor.0 = (ino + 1) % sb.total_inodes;
        return Ok(Some(ino));
    }
    if sb.used_inodes >= sb.total_inodes {
        return Ok(None);
    }

    repopulate(dev, sb, cursor)?;
    let ino = sb.cache_pop_min();
    if let Some(ino) = ino {
        cursor.0 = (ino + 1) % sb.total_inodes;
    }
    Ok(ino)
}

/// Refill the free cache by scanning the inode table for zero-link slots,
/// starting after the last handed-out number and wrapping once. Persists the
/// refreshed superblock.
fn repopulate(dev: &dyn BlockDevice, sb: &mut Superblock, cursor: &AllocCursor) -> Result<()> {
    let total = sb.total_inodes;
    let capacity = sb.free_cache.len();
    let inode_size = sb.inode_size as usize;
    let start = cursor.0 % total;

    let mut found: Vec<u32> = Vec::new();
    let mut block_buf = vec![0u8; sb.block_size as usize];
    let mut cached_block = None;
    for step in 0..total {
        let ino = (start + step) % total;
        let (block, offset) = locate(sb, ino);
        if cached_block != Some(block) {
            dev.read_block(block, &mut block_buf)?;
            cached_block = Some(block);
        }
        let inode =
            Inode::decode(&block_buf[offset..offset + inode_size]).map_err(|err| {
                PfsError::Corruption {
                    block,
                    detail: err.to_string(),
                }
            })?;
        if inode.links == 0 {
            found.push(ino);
            if found.len() == capacity {
                break;
            }
        }
    }

    found.sort_unstable();
    debug!(
        target: "pfs::inode",
        event = "cache_repopulate",
        start = start,
        found = found.len()
    );
    sb.cache_fill(&found);
    pfs_ondisk::write_superblock(dev, sb)
}

/// Allocate and initialize a fresh inode: zero owner and permissions,
/// timestamps stamped now, no links yet, `block[0]` pre-allocated.
pub fn new_inode(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    cursor: &mut AllocCursor,
) -> Result<Inode> {
    let Some(ino) = find_free(dev, sb, cursor)? else {
        return Err(PfsError::NoSpace);
    };

    let first_block = match pfs_alloc::alloc_block(dev, sb) {
        Ok(block) => block,
        Err(err) => {
            // hand the number back so the failed allocation leaves no trace
            sb.cache_insert_sorted(ino);
            return Err(err);
        }
    };

    let now = now_secs();
    let mut inode = Inode::empty(ino);
    inode.ctime = now;
    inode.mtime = now;
    inode.atime = now;
    inode.block[0] = BlockPtr::new(first_block);

    sb.used_inodes += 1;
    save(dev, sb, &inode)?;
    trace!(target: "pfs::inode", event = "inode_alloc", ino = ino);
    Ok(inode)
}

// ── Release ─────────────────────────────────────────────────────────────────

/// Free an inode: release its direct blocks, then each indirect subtree,
/// then put the number back on the free cache (sorted ascending, dropped if
/// the cache is full) and rewrite the emptied slot.
pub fn free_inode(dev: &dyn BlockDevice, sb: &mut Superblock, mut inode: Inode) -> Result<()> {
    for slot in 0..DIRECT_COUNT {
        let Some(block) = inode.block[slot].get() else {
            break;
        };
        pfs_alloc::free_block(dev, sb, block)?;
        inode.block[slot] = BlockPtr::NULL;
    }
    for (slot, depth) in [
        (SINGLE_INDIRECT, 0u8),
        (DOUBLE_INDIRECT, 1),
        (TRIPLE_INDIRECT, 2),
    ] {
        if let Some(table) = inode.block[slot].get() {
            pfs_alloc::free_indirect_subtree(dev, sb, table, depth)?;
            inode.block[slot] = BlockPtr::NULL;
        }
    }

    let ino = inode.ino;
    inode.links = 0;
    inode.size = 0;
    save(dev, sb, &inode)?;

    sb.cache_insert_sorted(ino);
    sb.used_inodes -= 1;
    trace!(target: "pfs::inode", event = "inode_free", ino = ino);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
