#![forbid(unsafe_code)]
//! File I/O engine.
//!
//! Maps logical file offsets onto device blocks through the inode's fifteen
//! pointers: twelve direct blocks, then single-, double-, and triple-indirect
//! tables of `N = block_size / 4` entries each. Read and write share one
//! address-mapping routine and one indirect-table cache, so consecutive
//! blocks under the same table never reread it and a freshly written table is
//! never served stale.
//!
//! Writes allocate lazily. Extending past end-of-file zero-fills the gap
//! first (`ensure_size`), which keeps every logical block below the file size
//! reachable: an indirect table is only ever created once everything before
//! it exists.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{Inode, Superblock};
use pfs_types::{BlockPtr, DIRECT_COUNT, DOUBLE_INDIRECT, SINGLE_INDIRECT, TRIPLE_INDIRECT};
use tracing::trace;

/// Indirect-table entries per block.
#[must_use]
fn pointers_per_block(sb: &Superblock) -> u64 {
    u64::from(sb.block_size / 4)
}

// ── Address mapping ─────────────────────────────────────────────────────────

/// Where a logical block lives in the pointer tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPath {
    Direct(usize),
    Single { idx: usize },
    Double { outer: usize, inner: usize },
    Triple { outer: usize, mid: usize, inner: usize },
}

#[expect(clippy::cast_possible_truncation)]
fn classify(k: u64, n: u64) -> Result<BlockPath> {
    let direct = DIRECT_COUNT as u64;
    if k < direct {
        return Ok(BlockPath::Direct(k as usize));
    }
    let k = k - direct;
    if k < n {
        return Ok(BlockPath::Single { idx: k as usize });
    }
    let k = k - n;
    if k < n * n {
        return Ok(BlockPath::Double {
            outer: (k / n) as usize,
            inner: (k % n) as usize,
        });
    }
    let k = k - n * n;
    if k < n * n * n {
        return Ok(BlockPath::Triple {
            outer: (k / (n * n)) as usize,
            mid: (k / n % n) as usize,
            inner: (k % n) as usize,
        });
    }
    Err(PfsError::Invalid(
        "file offset beyond triple-indirect range".into(),
    ))
}

// ── Indirect-table cache ────────────────────────────────────────────────────

/// Small LRU of decoded indirect tables keyed by block number.
///
/// Four slots cover the deepest chain (triple + double + single tables plus
/// one in transition); entries are written through, so the cache never holds
/// a table the device has outgrown.
struct IndirectCache {
    slots: Vec<(u32, Vec<u32>)>,
}

const CACHE_SLOTS: usize = 4;

impl IndirectCache {
    fn new() -> Self {
        Self {
            slots: Vec::with_capacity(CACHE_SLOTS),
        }
    }

    /// Make `block` the front slot, reading it if absent.
    fn load(&mut self, dev: &dyn BlockDevice, block: u32) -> Result<()> {
        if let Some(pos) = self.slots.iter().position(|(b, _)| *b == block) {
            let slot = self.slots.remove(pos);
            self.slots.insert(0, slot);
            return Ok(());
        }
        let raw = pfs_block::read_block_to_vec(dev, block)?;
        let table = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.slots.insert(0, (block, table));
        self.slots.truncate(CACHE_SLOTS);
        Ok(())
    }

    /// Entry `idx` of the table in `block`.
    fn entry(&mut self, dev: &dyn BlockDevice, block: u32, idx: usize) -> Result<u32> {
        self.load(dev, block)?;
        Ok(self.slots[0].1[idx])
    }

    /// Set entry `idx` of the table in `block` and write the table through.
    fn store(&mut self, dev: &dyn BlockDevice, block: u32, idx: usize, value: u32) -> Result<()> {
        self.load(dev, block)?;
        self.slots[0].1[idx] = value;
        let table = &self.slots[0].1;
        let mut raw = Vec::with_capacity(table.len() * 4);
        for &entry in table {
            raw.extend_from_slice(&entry.to_le_bytes());
        }
        dev.write_block(block, &raw)
    }
}

/// Table-entry sentinel: 0 means unallocated (block 0 is the superblock).
fn occupied(entry: u32) -> Option<u32> {
    (entry != 0).then_some(entry)
}

/// Resolve logical block `k` without allocating. `None` means unmapped.
fn resolve(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    inode: &Inode,
    k: u64,
    cache: &mut IndirectCache,
) -> Result<Option<u32>> {
    let n = pointers_per_block(sb);
    let phys = match classify(k, n)? {
        BlockPath::Direct(i) => inode.block[i].get(),
        BlockPath::Single { idx } => match inode.block[SINGLE_INDIRECT].get() {
            Some(si) => occupied(cache.entry(dev, si, idx)?),
            None => None,
        },
        BlockPath::Double { outer, inner } => match inode.block[DOUBLE_INDIRECT].get() {
            Some(di) => match occupied(cache.entry(dev, di, outer)?) {
                Some(si) => occupied(cache.entry(dev, si, inner)?),
                None => None,
            },
            None => None,
        },
        BlockPath::Triple { outer, mid, inner } => match inode.block[TRIPLE_INDIRECT].get() {
            Some(ti) => match occupied(cache.entry(dev, ti, outer)?) {
                Some(di) => match occupied(cache.entry(dev, di, mid)?) {
                    Some(si) => occupied(cache.entry(dev, si, inner)?),
                    None => None,
                },
                None => None,
            },
            None => None,
        },
    };
    Ok(phys)
}

/// The top-level pointer at `slot`, allocating a zeroed table when missing.
fn top_table(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Inode,
    slot: usize,
) -> Result<u32> {
    if let Some(block) = inode.block[slot].get() {
        return Ok(block);
    }
    let block = pfs_alloc::alloc_block(dev, sb)?;
    inode.block[slot] = BlockPtr::new(block);
    Ok(block)
}

/// Entry `idx` of `table`, allocating when the slot is empty. Data blocks
/// and deeper tables both arrive zero-filled.
fn table_entry_alloc(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    cache: &mut IndirectCache,
    table: u32,
    idx: usize,
) -> Result<u32> {
    if let Some(block) = occupied(cache.entry(dev, table, idx)?) {
        return Ok(block);
    }
    let block = pfs_alloc::alloc_block(dev, sb)?;
    cache.store(dev, table, idx, block)?;
    Ok(block)
}

/// Resolve logical block `k`, materializing any missing pointers along the
/// path. Changed in-inode pointers are persisted by the caller's save.
fn resolve_alloc(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Inode,
    k: u64,
    cache: &mut IndirectCache,
) -> Result<u32> {
    let n = pointers_per_block(sb);
    let phys = match classify(k, n)? {
        BlockPath::Direct(i) => match inode.block[i].get() {
            Some(block) => block,
            None => {
                let block = pfs_alloc::alloc_block(dev, sb)?;
                inode.block[i] = BlockPtr::new(block);
                block
            }
        },
        BlockPath::Single { idx } => {
            let si = top_table(dev, sb, inode, SINGLE_INDIRECT)?;
            table_entry_alloc(dev, sb, cache, si, idx)?
        }
        BlockPath::Double { outer, inner } => {
            let di = top_table(dev, sb, inode, DOUBLE_INDIRECT)?;
            let si = table_entry_alloc(dev, sb, cache, di, outer)?;
            table_entry_alloc(dev, sb, cache, si, inner)?
        }
        BlockPath::Triple { outer, mid, inner } => {
            let ti = top_table(dev, sb, inode, TRIPLE_INDIRECT)?;
            let di = table_entry_alloc(dev, sb, cache, ti, outer)?;
            let si = table_entry_alloc(dev, sb, cache, di, mid)?;
            table_entry_alloc(dev, sb, cache, si, inner)?
        }
    };
    Ok(phys)
}

// ── Read ────────────────────────────────────────────────────────────────────

/// Read up to `buf.len()` bytes at `offset`, honoring end-of-file. Returns
/// the byte count actually read (0 when `offset` is at or past the end).
pub fn read_at(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    inode: &Inode,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    if buf.is_empty() || offset >= inode.size {
        return Ok(0);
    }
    let block_size = u64::from(sb.block_size);
    #[expect(clippy::cast_possible_truncation)]
    let want = buf.len().min((inode.size - offset) as usize);

    let mut cache = IndirectCache::new();
    let mut block_buf = vec![0u8; sb.block_size as usize];
    let mut done = 0usize;
    let mut k = offset / block_size;
    let mut in_off = (offset % block_size) as usize;
    while done < want {
        let chunk = (want - done).min(sb.block_size as usize - in_off);
        match resolve(dev, sb, inode, k, &mut cache)? {
            Some(block) => {
                dev.read_block(block, &mut block_buf)?;
                buf[done..done + chunk].copy_from_slice(&block_buf[in_off..in_off + chunk]);
            }
            // unmapped block inside the file reads as zeros
            None => buf[done..done + chunk].fill(0),
        }
        done += chunk;
        in_off = 0;
        k += 1;
    }
    Ok(done)
}

// ── Write ───────────────────────────────────────────────────────────────────

/// Write `buf` at `offset`, allocating blocks and indirect tables on demand.
/// A write past end-of-file zero-fills the gap first. Returns the byte count
/// written.
pub fn write_at(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Inode,
    buf: &[u8],
    offset: u64,
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    if offset > inode.size {
        ensure_size(dev, sb, inode, offset)?;
    }

    let block_size = u64::from(sb.block_size);
    let mut cache = IndirectCache::new();
    let mut block_buf = vec![0u8; sb.block_size as usize];
    let mut done = 0usize;
    let mut k = offset / block_size;
    let mut in_off = (offset % block_size) as usize;
    while done < buf.len() {
        let chunk = (buf.len() - done).min(sb.block_size as usize - in_off);
        let block = resolve_alloc(dev, sb, inode, k, &mut cache)?;
        if chunk == sb.block_size as usize {
            dev.write_block(block, &buf[done..done + chunk])?;
        } else {
            // partial head or tail: read-modify-write
            dev.read_block(block, &mut block_buf)?;
            block_buf[in_off..in_off + chunk].copy_from_slice(&buf[done..done + chunk]);
            dev.write_block(block, &block_buf)?;
        }
        done += chunk;
        let end = offset + done as u64;
        if end > inode.size {
            inode.size = end;
            pfs_inode::save(dev, sb, inode)?;
        }
        in_off = 0;
        k += 1;
    }

    inode.mtime = pfs_inode::now_secs();
    pfs_inode::save(dev, sb, inode)?;
    trace!(
        target: "pfs::file",
        event = "write",
        ino = inode.ino,
        offset = offset,
        len = done
    );
    Ok(done)
}

/// Grow the file to at least `target` bytes, zero-filling the extension.
/// Returns the number of bytes added.
///
/// Each zero chunk is written at the file's current size, so the write path
/// never sees `offset > size` and cannot re-enter this function.
pub fn ensure_size(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Inode,
    target: u64,
) -> Result<u64> {
    if inode.size >= target {
        return Ok(0);
    }
    let grown = target - inode.size;
    let block_size = u64::from(sb.block_size);
    let zeros = vec![0u8; sb.block_size as usize];
    while inode.size < target {
        let offset = inode.size;
        let room = block_size - offset % block_size;
        #[expect(clippy::cast_possible_truncation)]
        let chunk = room.min(target - offset) as usize;
        write_at(dev, sb, inode, &zeros[..chunk], offset)?;
    }
    Ok(grown)
}

// ── Truncate ────────────────────────────────────────────────────────────────

fn read_table(dev: &dyn BlockDevice, block: u32) -> Result<Vec<u32>> {
    let raw = pfs_block::read_block_to_vec(dev, block)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn write_table(dev: &dyn BlockDevice, block: u32, table: &[u32]) -> Result<()> {
    let mut raw = Vec::with_capacity(table.len() * 4);
    for &entry in table {
        raw.extend_from_slice(&entry.to_le_bytes());
    }
    dev.write_block(block, &raw)
}

/// Free everything in the table past its first `keep` logical blocks
/// (`keep >= 1`). `level` 0 means entries are data blocks; higher levels
/// recurse. A child table is freed exactly when its last block goes.
fn prune_table(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    table_block: u32,
    level: u8,
    keep: u64,
) -> Result<()> {
    let mut table = read_table(dev, table_block)?;
    let span = (table.len() as u64).pow(u32::from(level));
    #[expect(clippy::cast_possible_truncation)]
    let full = (keep / span) as usize;
    let rem = keep % span;

    let mut dirty = false;
    for idx in 0..table.len() {
        let entry = table[idx];
        if entry == 0 || idx < full {
            continue;
        }
        if idx == full && rem > 0 {
            // partially kept child; only reachable when level > 0
            prune_table(dev, sb, entry, level - 1, rem)?;
            continue;
        }
        if level == 0 {
            pfs_alloc::free_block(dev, sb, entry)?;
        } else {
            pfs_alloc::free_indirect_subtree(dev, sb, entry, level - 1)?;
        }
        table[idx] = 0;
        dirty = true;
    }
    if dirty {
        write_table(dev, table_block, &table)?;
    }
    Ok(())
}

/// Resize the file to exactly `target` bytes.
///
/// Growing zero-fills; shrinking zeroes the tail of the boundary block,
/// frees every later block, and releases indirect tables as they empty.
/// Truncating to the current size is a no-op.
pub fn truncate(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    inode: &mut Inode,
    target: u64,
) -> Result<()> {
    if target == inode.size {
        return Ok(());
    }
    if target > inode.size {
        ensure_size(dev, sb, inode, target)?;
        return Ok(());
    }

    let block_size = u64::from(sb.block_size);
    let n = pointers_per_block(sb);
    let keep = target.div_ceil(block_size);

    // zero the kept part's trailing bytes
    let tail = target % block_size;
    if tail > 0 {
        let mut cache = IndirectCache::new();
        if let Some(block) = resolve(dev, sb, inode, keep - 1, &mut cache)? {
            let mut block_buf = vec![0u8; sb.block_size as usize];
            dev.read_block(block, &mut block_buf)?;
            block_buf[tail as usize..].fill(0);
            dev.write_block(block, &block_buf)?;
        }
    }

    for (slot, ptr) in inode.block.iter_mut().enumerate().take(DIRECT_COUNT) {
        if (slot as u64) < keep {
            continue;
        }
        if let Some(block) = ptr.get() {
            pfs_alloc::free_block(dev, sb, block)?;
            *ptr = BlockPtr::NULL;
        }
    }

    let ranges = [
        (SINGLE_INDIRECT, 0u8, DIRECT_COUNT as u64, n),
        (DOUBLE_INDIRECT, 1, DIRECT_COUNT as u64 + n, n * n),
        (TRIPLE_INDIRECT, 2, DIRECT_COUNT as u64 + n + n * n, n * n * n),
    ];
    for (slot, level, first_logical, capacity) in ranges {
        let Some(table) = inode.block[slot].get() else {
            continue;
        };
        let keep_in = keep.saturating_sub(first_logical).min(capacity);
        if keep_in == 0 {
            pfs_alloc::free_indirect_subtree(dev, sb, table, level)?;
            inode.block[slot] = BlockPtr::NULL;
        } else {
            prune_table(dev, sb, table, level, keep_in)?;
        }
    }

    inode.size = target;
    inode.mtime = pfs_inode::now_secs();
    pfs_inode::save(dev, sb, inode)?;
    trace!(
        target: "pfs::file",
        event = "truncate",
        ino = inode.ino,
        size = target
    );
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::MemBlockDevice;
    use pfs_inode::AllocCursor;

    /// Miniature mkfs: inode table skeleton, group bitmaps, seeded cache.
    fn mk_fs(num_blocks: u32, block_size: u32) -> (MemBlockDevice, Superblock, AllocCursor) {
        let dev = MemBlockDevice::new(num_blocks, block_size);
        let mut sb =
            Superblock::for_geometry(u64::from(num_blocks) * u64::from(block_size), block_size)
                .unwrap();

        let mut buf = vec![0u8; block_size as usize];
        let per_block = sb.inodes_per_block();
        for table_block in 0..sb.inode_blocks() {
            for slot in 0..per_block {
                let ino = table_block * per_block + slot;
                let offset = slot as usize * sb.inode_size as usize;
                pfs_ondisk::Inode::empty(ino)
                    .encode(&mut buf[offset..offset + sb.inode_size as usize]);
            }
            dev.write_block(1 + table_block, &buf).unwrap();
        }

        for group in 0..sb.num_groups {
            let mut bitmap = vec![0u8; block_size as usize];
            bitmap[0] = 0x01;
            dev.write_block(sb.group_bitmap_block(group), &bitmap).unwrap();
        }

        let seed: Vec<u32> =
            (0..sb.free_cache.len().min(sb.total_inodes as usize) as u32).collect();
        sb.cache_fill(&seed);
        pfs_ondisk::write_superblock(&dev, &sb).unwrap();
        (dev, sb, AllocCursor::default())
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let data = vec![0x5Au8; 5000];
        let written = write_at(&dev, &mut sb, &mut inode, &data, 0).unwrap();
        assert_eq!(written, 5000);
        assert_eq!(inode.size, 5000);

        let mut back = vec![0u8; 5000];
        let read = read_at(&dev, &sb, &inode, &mut back, 0).unwrap();
        assert_eq!(read, 5000);
        assert_eq!(back, data);
    }

    #[test]
    fn write_spanning_block_boundary() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let data = pattern(1000, 7);
        write_at(&dev, &mut sb, &mut inode, &data, 3800).unwrap();
        assert_eq!(inode.size, 4800);

        let mut back = vec![0u8; 1000];
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 3800).unwrap(), 1000);
        assert_eq!(back, data);
    }

    #[test]
    fn read_honors_end_of_file() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();
        write_at(&dev, &mut sb, &mut inode, &[1, 2, 3, 4, 5], 0).unwrap();

        let mut back = vec![0u8; 100];
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 3).unwrap(), 2);
        assert_eq!(&back[..2], &[4, 5]);
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 5).unwrap(), 0);
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 500).unwrap(), 0);
    }

    #[test]
    fn write_past_eof_zero_fills_gap() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let data = pattern(100, 3);
        write_at(&dev, &mut sb, &mut inode, &data, 10000).unwrap();
        assert_eq!(inode.size, 10100);

        let mut back = vec![0u8; 10100];
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 0).unwrap(), 10100);
        assert!(back[..10000].iter().all(|&b| b == 0));
        assert_eq!(&back[10000..], &data[..]);
    }

    #[test]
    fn single_indirect_transition() {
        // 512-byte blocks: direct range ends at 12 * 512 = 6144
        let (dev, mut sb, mut cursor) = mk_fs(512, 512);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let data = pattern(1024, 11);
        write_at(&dev, &mut sb, &mut inode, &data, 6144 - 512).unwrap();
        assert!(inode.block[SINGLE_INDIRECT].get().is_some());
        assert_eq!(inode.size, 6144 + 512);

        let mut back = vec![0u8; 1024];
        assert_eq!(
            read_at(&dev, &sb, &inode, &mut back, 6144 - 512).unwrap(),
            1024
        );
        assert_eq!(back, data);
    }

    #[test]
    fn double_indirect_transition() {
        // n = 128 at 512-byte blocks; double range starts at block 140
        let (dev, mut sb, mut cursor) = mk_fs(512, 512);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let boundary = (12 + 128) * 512;
        let data = pattern(1024, 13);
        write_at(&dev, &mut sb, &mut inode, &data, boundary - 512).unwrap();
        assert!(inode.block[DOUBLE_INDIRECT].get().is_some());

        let mut back = vec![0u8; 1024];
        assert_eq!(
            read_at(&dev, &sb, &inode, &mut back, boundary - 512).unwrap(),
            1024
        );
        assert_eq!(back, data);
    }

    #[test]
    fn triple_indirect_transition_and_release() {
        // n = 128: triple range starts at block 12 + 128 + 128² = 16524
        let (dev, mut sb, mut cursor) = mk_fs(20000, 512);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();
        let baseline = sb.used_blocks;

        let boundary = (12 + 128 + 128 * 128) * 512u64;
        let data = pattern(1024, 17);
        write_at(&dev, &mut sb, &mut inode, &data, boundary - 512).unwrap();
        assert!(inode.block[TRIPLE_INDIRECT].get().is_some());

        let mut back = vec![0u8; 1024];
        assert_eq!(
            read_at(&dev, &sb, &inode, &mut back, boundary - 512).unwrap(),
            1024
        );
        assert_eq!(back, data);

        // release everything but the pre-allocated first block
        truncate(&dev, &mut sb, &mut inode, 0).unwrap();
        assert_eq!(inode.size, 0);
        assert!(inode.block.iter().all(|p| p.is_null()));
        assert_eq!(sb.used_blocks, baseline - 1);
    }

    #[test]
    fn ensure_size_is_idempotent() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        assert_eq!(ensure_size(&dev, &mut sb, &mut inode, 9000).unwrap(), 9000);
        assert_eq!(inode.size, 9000);
        assert_eq!(ensure_size(&dev, &mut sb, &mut inode, 9000).unwrap(), 0);
        assert_eq!(ensure_size(&dev, &mut sb, &mut inode, 100).unwrap(), 0);
        assert_eq!(inode.size, 9000);
    }

    #[test]
    fn truncate_zeroes_tail_of_boundary_block() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let data = vec![0xAAu8; 3000];
        write_at(&dev, &mut sb, &mut inode, &data, 0).unwrap();
        truncate(&dev, &mut sb, &mut inode, 1000).unwrap();
        assert_eq!(inode.size, 1000);

        // regrow: the zeroed tail must stay zero
        ensure_size(&dev, &mut sb, &mut inode, 3000).unwrap();
        let mut back = vec![0u8; 3000];
        read_at(&dev, &sb, &inode, &mut back, 0).unwrap();
        assert!(back[..1000].iter().all(|&b| b == 0xAA));
        assert!(back[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_releases_single_indirect_block() {
        let (dev, mut sb, mut cursor) = mk_fs(512, 512);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();
        let baseline = sb.used_blocks;

        let data = pattern(14 * 512, 19);
        write_at(&dev, &mut sb, &mut inode, &data, 0).unwrap();
        assert!(inode.block[SINGLE_INDIRECT].get().is_some());
        // 13 extra data blocks + 1 single-indirect table
        assert_eq!(sb.used_blocks, baseline + 14);

        truncate(&dev, &mut sb, &mut inode, 512).unwrap();
        assert_eq!(inode.size, 512);
        assert!(inode.block[SINGLE_INDIRECT].is_null());
        assert_eq!(sb.used_blocks, baseline);

        let mut back = vec![0u8; 512];
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 0).unwrap(), 512);
        assert_eq!(back, &data[..512]);
    }

    #[test]
    fn truncate_to_current_size_is_noop() {
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();
        write_at(&dev, &mut sb, &mut inode, &[9u8; 100], 0).unwrap();
        let blocks_before = sb.used_blocks;
        truncate(&dev, &mut sb, &mut inode, 100).unwrap();
        assert_eq!(inode.size, 100);
        assert_eq!(sb.used_blocks, blocks_before);
    }

    #[test]
    fn truncate_then_extend_leaves_zeroes() {
        // for a <= b <= c: truncate(b); truncate(c) leaves [b, c) zero
        let (dev, mut sb, mut cursor) = mk_fs(1024, 4096);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        write_at(&dev, &mut sb, &mut inode, &vec![0xFFu8; 8192], 0).unwrap();
        truncate(&dev, &mut sb, &mut inode, 5000).unwrap();
        truncate(&dev, &mut sb, &mut inode, 12000).unwrap();
        assert_eq!(inode.size, 12000);

        let mut back = vec![0u8; 12000];
        read_at(&dev, &sb, &inode, &mut back, 0).unwrap();
        assert!(back[..5000].iter().all(|&b| b == 0xFF));
        assert!(back[5000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_prune_keeps_earlier_indirect_blocks() {
        // shrink inside the single-indirect range: table survives, later
        // entries go
        let (dev, mut sb, mut cursor) = mk_fs(512, 512);
        let mut inode = pfs_inode::new_inode(&dev, &mut sb, &mut cursor).unwrap();

        let data = pattern(20 * 512, 23);
        write_at(&dev, &mut sb, &mut inode, &data, 0).unwrap();
        truncate(&dev, &mut sb, &mut inode, 15 * 512).unwrap();

        assert!(inode.block[SINGLE_INDIRECT].get().is_some());
        let mut back = vec![0u8; 15 * 512];
        assert_eq!(read_at(&dev, &sb, &inode, &mut back, 0).unwrap(), 15 * 512);
        assert_eq!(back, &data[..15 * 512]);
    }
}
