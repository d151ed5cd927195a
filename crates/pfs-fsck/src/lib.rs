#![forbid(unsafe_code)]
//! Metadata integrity checker.
//!
//! Five passes over a quiesced device: geometry bounds, inode link counts,
//! block accounting (inode subtrees versus group bitmaps), directory
//! structure, and superblock counters. Each deviation becomes a [`Finding`];
//! with `repair` enabled the fixable ones are corrected in place and a
//! second run comes back clean.
//!
//! A superblock that fails to decode aborts the check; there is nothing
//! trustworthy to walk. Duplicate block claims are reported as critical and
//! never auto-repaired; deciding which file keeps the block is the
//! operator's call.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{DirEntry, Inode, Superblock};
use pfs_types::{DIRECT_COUNT, DIRENTRY_SIZE, DOUBLE_INDIRECT, SINGLE_INDIRECT, TRIPLE_INDIRECT};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{info, warn};

// ── Findings ────────────────────────────────────────────────────────────────

/// Which pass produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Bounds,
    Inodes,
    Blocks,
    Directories,
    Counters,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounds => write!(f, "bounds"),
            Self::Inodes => write!(f, "inodes"),
            Self::Blocks => write!(f, "blocks"),
            Self::Directories => write!(f, "directories"),
            Self::Counters => write!(f, "counters"),
        }
    }
}

/// How bad a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Reclaimable waste (e.g. a bitmap bit with no owner).
    Warning,
    /// Metadata inconsistency affecting one file.
    Error,
    /// Inconsistency that risks data loss and needs operator judgement.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One deviation from the on-disk invariants.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub pass: Pass,
    pub severity: Severity,
    pub detail: String,
    pub repaired: bool,
}

/// Outcome of a full check.
#[derive(Debug, Default, Serialize)]
pub struct FsckReport {
    pub findings: Vec<Finding>,
    pub repairs: usize,
}

impl FsckReport {
    fn push(&mut self, pass: Pass, severity: Severity, detail: String, repaired: bool) {
        if repaired {
            self.repairs += 1;
            info!(target: "pfs::fsck", pass = %pass, repaired = true, detail = %detail);
        } else {
            warn!(target: "pfs::fsck", pass = %pass, severity = %severity, detail = %detail);
        }
        self.findings.push(Finding {
            pass,
            severity,
            detail,
            repaired,
        });
    }

    /// No findings at all.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

// ── Tree walk ───────────────────────────────────────────────────────────────

/// What the directory-tree walk learned.
struct TreeWalk {
    /// Expected link count per reachable inode.
    counted: HashMap<u32, u32>,
    /// Parent of each reachable directory (root maps to itself).
    parents: HashMap<u32, u32>,
    /// Reachable directories.
    dirs: Vec<u32>,
}

/// Walk the directory tree from the root, counting expected links and, in
/// repair mode, removing every record that names a `condemned`, free, or
/// out-of-range inode. Stale records never contribute to the counts, so the
/// counts describe the tree as it stands after repair.
fn walk_tree(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    condemned: &HashSet<u32>,
    repair: bool,
    report: &mut FsckReport,
) -> Result<TreeWalk> {
    let mut walk = TreeWalk {
        counted: HashMap::new(),
        parents: HashMap::new(),
        dirs: Vec::new(),
    };
    walk.counted.insert(pfs_dir::ROOT_INO, 2);
    walk.parents.insert(pfs_dir::ROOT_INO, pfs_dir::ROOT_INO);

    let mut stack = vec![pfs_dir::ROOT_INO];
    let mut visited: HashSet<u32> = HashSet::new();
    while let Some(dir_ino) = stack.pop() {
        if !visited.insert(dir_ino) {
            continue;
        }
        walk.dirs.push(dir_ino);
        let Ok(mut dir) = pfs_inode::load(dev, sb, dir_ino) else {
            report.push(
                Pass::Inodes,
                Severity::Error,
                format!("directory inode {dir_ino} is unreadable"),
                false,
            );
            continue;
        };
        let mut idx = 2;
        while idx < pfs_dir::entry_count(&dir) {
            let entry = match pfs_dir::read_entry(dev, sb, &dir, idx) {
                Ok(entry) => entry,
                Err(_) => {
                    report.push(
                        Pass::Directories,
                        Severity::Error,
                        format!("directory {dir_ino} record {idx} is unreadable"),
                        false,
                    );
                    idx += 1;
                    continue;
                }
            };

            // a record naming a bad, condemned, or free inode is stale; if
            // left behind it would alias onto whatever file the recycled
            // number lands on next
            let mut stale = None;
            let mut live_child = None;
            if entry.ino >= sb.total_inodes {
                stale = Some(format!(
                    "directory {dir_ino} entry {:?} points at bad inode {}",
                    entry.name, entry.ino
                ));
            } else if condemned.contains(&entry.ino) {
                stale = Some(format!(
                    "directory {dir_ino} entry {:?} names freed inode {}",
                    entry.name, entry.ino
                ));
            } else {
                match pfs_inode::load(dev, sb, entry.ino) {
                    Ok(child) if child.links == 0 => {
                        stale = Some(format!(
                            "directory {dir_ino} entry {:?} points at free inode {}",
                            entry.name, entry.ino
                        ));
                    }
                    Ok(child) => live_child = Some(child),
                    Err(_) => {
                        // unreadable slot; leave the record for a later run
                        idx += 1;
                        continue;
                    }
                }
            }
            if let Some(detail) = stale {
                report.push(Pass::Directories, Severity::Error, detail, repair);
                if repair {
                    pfs_dir::remove_entry(dev, sb, &mut dir, idx)?;
                    // the tail record now sits at idx; re-examine it
                    continue;
                }
                idx += 1;
                continue;
            }

            let Some(child) = live_child else {
                idx += 1;
                continue;
            };
            if child.acl.is_dir() {
                if walk.parents.contains_key(&entry.ino) {
                    report.push(
                        Pass::Directories,
                        Severity::Critical,
                        format!("directory inode {} has more than one parent", entry.ino),
                        false,
                    );
                    idx += 1;
                    continue;
                }
                walk.counted.insert(entry.ino, 2);
                walk.parents.insert(entry.ino, dir_ino);
                *walk.counted.entry(dir_ino).or_insert(0) += 1;
                stack.push(entry.ino);
            } else {
                *walk.counted.entry(entry.ino).or_insert(0) += 1;
            }
            idx += 1;
        }
    }
    Ok(walk)
}

// ── Block collection ────────────────────────────────────────────────────────

/// Every device block referenced by an inode: data blocks and the indirect
/// tables themselves. Pointers outside the data region are reported, not
/// followed.
fn inode_block_list(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    inode: &Inode,
    report: &mut FsckReport,
) -> Vec<u32> {
    let mut blocks = Vec::new();
    for slot in 0..DIRECT_COUNT {
        if let Some(block) = inode.block[slot].get() {
            if sb.group_of_block(block).is_some() {
                blocks.push(block);
            } else {
                report.push(
                    Pass::Blocks,
                    Severity::Error,
                    format!(
                        "inode {} references block {block} outside the data region",
                        inode.ino
                    ),
                    false,
                );
            }
        }
    }
    for (slot, depth) in [
        (SINGLE_INDIRECT, 0u8),
        (DOUBLE_INDIRECT, 1),
        (TRIPLE_INDIRECT, 2),
    ] {
        if let Some(table) = inode.block[slot].get() {
            collect_table(dev, sb, inode.ino, table, depth, &mut blocks, report);
        }
    }
    blocks
}

fn collect_table(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    ino: u32,
    table_block: u32,
    depth: u8,
    blocks: &mut Vec<u32>,
    report: &mut FsckReport,
) {
    if sb.group_of_block(table_block).is_none() {
        report.push(
            Pass::Blocks,
            Severity::Error,
            format!("inode {ino} references indirect block {table_block} outside the data region"),
            false,
        );
        return;
    }
    blocks.push(table_block);
    let Ok(raw) = pfs_block::read_block_to_vec(dev, table_block) else {
        report.push(
            Pass::Blocks,
            Severity::Error,
            format!("inode {ino}: indirect block {table_block} is unreadable"),
            false,
        );
        return;
    };
    for chunk in raw.chunks_exact(4) {
        let entry = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if entry == 0 {
            continue;
        }
        if depth == 0 {
            if sb.group_of_block(entry).is_some() {
                blocks.push(entry);
            } else {
                report.push(
                    Pass::Blocks,
                    Severity::Error,
                    format!("inode {ino} references block {entry} outside the data region"),
                    false,
                );
            }
        } else {
            collect_table(dev, sb, ino, entry, depth - 1, blocks, report);
        }
    }
}

// ── The check ───────────────────────────────────────────────────────────────

/// Run all five passes. `repair` applies in-place fixes; without it the
/// device is only read.
pub fn check(dev: &dyn BlockDevice, repair: bool) -> Result<FsckReport> {
    let mut report = FsckReport::default();

    // Pass 1 — bounds. An undecodable superblock is the end of the road.
    let mut sb = pfs_ondisk::read_superblock(dev)?;
    if sb.block_size != dev.block_size() || sb.num_blocks() > dev.block_count() {
        return Err(PfsError::Corruption {
            block: 0,
            detail: format!(
                "superblock claims {} blocks of {} bytes; device has {} of {}",
                sb.num_blocks(),
                sb.block_size,
                dev.block_count(),
                dev.block_size()
            ),
        });
    }

    // Pass 2 — inode scan against a tree walk. Slots whose identity is
    // corrupt are condemned up front so the walk can strip every directory
    // record that still names them; otherwise the recycled number would
    // alias a stale path onto an unrelated future file.
    let mut condemned: HashSet<u32> = HashSet::new();
    for ino in 0..sb.total_inodes {
        let Ok(inode) = pfs_inode::load(dev, &sb, ino) else {
            report.push(
                Pass::Inodes,
                Severity::Error,
                format!("inode {ino} is unreadable"),
                false,
            );
            continue;
        };
        if inode.links == 0 {
            continue;
        }
        if inode.ino != ino || !inode.acl.is_valid() {
            let what = if inode.ino != ino { "inode number" } else { "acl" };
            report.push(
                Pass::Inodes,
                Severity::Error,
                format!("inode {ino} has a corrupt {what}; freeing"),
                repair,
            );
            if repair {
                release_slot(dev, &sb, ino)?;
            }
            condemned.insert(ino);
        }
    }

    let walk = walk_tree(dev, &mut sb, &condemned, repair, &mut report)?;
    let mut live: Vec<Inode> = Vec::new();
    for ino in 0..sb.total_inodes {
        if condemned.contains(&ino) {
            continue;
        }
        let Ok(mut inode) = pfs_inode::load(dev, &sb, ino) else {
            continue;
        };
        if inode.links == 0 {
            continue;
        }
        let Some(&expected) = walk.counted.get(&ino) else {
            report.push(
                Pass::Inodes,
                Severity::Error,
                format!("inode {ino} has {} links but no directory entry", inode.links),
                repair,
            );
            if repair {
                release_slot(dev, &sb, ino)?;
            }
            continue;
        };
        if inode.links != expected {
            report.push(
                Pass::Inodes,
                Severity::Error,
                format!(
                    "inode {ino} records {} links, tree walk counts {expected}",
                    inode.links
                ),
                repair,
            );
            if repair {
                inode.links = expected;
                pfs_inode::save(dev, &sb, &inode)?;
            }
        }
        live.push(inode);
    }

    // Pass 3 — block accounting.
    let mut claimed: HashMap<u32, u32> = HashMap::new();
    for inode in &live {
        for block in inode_block_list(dev, &sb, inode, &mut report) {
            if let Some(&owner) = claimed.get(&block) {
                report.push(
                    Pass::Blocks,
                    Severity::Critical,
                    format!("block {block} is claimed by both inode {owner} and inode {}", inode.ino),
                    false,
                );
            } else {
                claimed.insert(block, inode.ino);
            }
        }
    }

    let mut bitmap = vec![0u8; sb.block_size as usize];
    for group in 0..sb.num_groups {
        let bitmap_block = sb.group_bitmap_block(group);
        dev.read_block(bitmap_block, &mut bitmap)?;
        let nbits = sb.blocks_in_group(group);
        let mut dirty = false;

        if !pfs_alloc::bitmap_test(&bitmap, nbits, 0) {
            report.push(
                Pass::Blocks,
                Severity::Error,
                format!("group {group}: the bitmap's own bit is clear"),
                repair,
            );
            if repair {
                pfs_alloc::bitmap_set(&mut bitmap, nbits, 0);
                dirty = true;
            }
        }
        for bit in 1..nbits {
            let block = sb.block_of_group_bit(group, bit);
            let set = pfs_alloc::bitmap_test(&bitmap, nbits, bit);
            let owned = claimed.contains_key(&block);
            if owned && !set {
                report.push(
                    Pass::Blocks,
                    Severity::Error,
                    format!("block {block} is in use but its bitmap bit is clear"),
                    repair,
                );
                if repair {
                    pfs_alloc::bitmap_set(&mut bitmap, nbits, bit);
                    dirty = true;
                }
            } else if !owned && set {
                report.push(
                    Pass::Blocks,
                    Severity::Warning,
                    format!("block {block} is marked used but unreachable; reclaiming"),
                    repair,
                );
                if repair {
                    pfs_alloc::bitmap_clear(&mut bitmap, nbits, bit);
                    dirty = true;
                }
            }
        }
        if dirty {
            dev.write_block(bitmap_block, &bitmap)?;
        }
    }

    // Pass 4 — directory structure.
    for &dir_ino in &walk.dirs {
        let Ok(mut dir) = pfs_inode::load(dev, &sb, dir_ino) else {
            continue;
        };
        if !dir.acl.is_dir() {
            continue;
        }
        if dir.size % DIRENTRY_SIZE as u64 != 0 {
            let fixed = dir.size / DIRENTRY_SIZE as u64 * DIRENTRY_SIZE as u64;
            report.push(
                Pass::Directories,
                Severity::Error,
                format!(
                    "directory {dir_ino} size {} is not a record multiple",
                    dir.size
                ),
                repair,
            );
            if repair {
                pfs_file::truncate(dev, &mut sb, &mut dir, fixed)?;
            }
        }
        if dir.size < 2 * DIRENTRY_SIZE as u64 {
            report.push(
                Pass::Directories,
                Severity::Critical,
                format!("directory {dir_ino} lost its seed records"),
                false,
            );
            continue;
        }
        let parent = walk.parents.get(&dir_ino).copied().unwrap_or(pfs_dir::ROOT_INO);
        check_seed_record(dev, &mut sb, &mut dir, 0, ".", dir_ino, repair, &mut report)?;
        check_seed_record(dev, &mut sb, &mut dir, 1, "..", parent, repair, &mut report)?;
    }

    // Pass 5 — counters.
    let live_inodes = u32::try_from(live.len()).unwrap_or(u32::MAX);
    let used_blocks = u32::try_from(claimed.len()).unwrap_or(u32::MAX) + sb.num_groups;
    if sb.used_inodes != live_inodes || sb.used_blocks != used_blocks {
        report.push(
            Pass::Counters,
            Severity::Error,
            format!(
                "superblock counters ({} inodes, {} blocks) disagree with the scan ({live_inodes}, {used_blocks})",
                sb.used_inodes, sb.used_blocks
            ),
            repair,
        );
        if repair {
            sb.used_inodes = live_inodes;
            sb.used_blocks = used_blocks;
        }
    }
    if repair {
        // entry removal during the walk may have moved the cached counters
        // without a mismatch here; block 0 always goes out last
        pfs_ondisk::write_superblock(dev, &sb)?;
    }

    info!(
        target: "pfs::fsck",
        event = "check_done",
        findings = report.findings.len(),
        repairs = report.repairs
    );
    Ok(report)
}

/// Repair helper: rewrite one table slot as a free inode. Blocks the slot
/// referenced are reclaimed by the bitmap pass; counters by the last pass.
fn release_slot(dev: &dyn BlockDevice, sb: &Superblock, ino: u32) -> Result<()> {
    pfs_inode::save(dev, sb, &Inode::empty(ino))
}

#[expect(clippy::too_many_arguments)]
fn check_seed_record(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    dir: &mut Inode,
    idx: u64,
    name: &str,
    expected_ino: u32,
    repair: bool,
    report: &mut FsckReport,
) -> Result<()> {
    let found = pfs_dir::read_entry(dev, sb, dir, idx).ok();
    let ok = found
        .as_ref()
        .is_some_and(|e| e.name == name && e.ino == expected_ino);
    if ok {
        return Ok(());
    }
    report.push(
        Pass::Directories,
        Severity::Error,
        format!(
            "directory {} record {idx} should be {name:?} -> {expected_ino}",
            dir.ino
        ),
        repair,
    );
    if repair {
        let mut record = [0u8; DIRENTRY_SIZE];
        DirEntry::new(expected_ino, name)
            .encode(&mut record)
            .map_err(PfsError::from)?;
        pfs_file::write_at(dev, sb, dir, &record, idx * DIRENTRY_SIZE as u64)?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
