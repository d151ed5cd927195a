#![forbid(unsafe_code)]
//! Directory layer.
//!
//! A directory is an ordinary file holding a packed array of fixed 259-byte
//! records; its size is always an exact multiple of the record size. There is
//! no free list and no tombstones: removal swaps the last record into the
//! vacated slot and truncates by one record. The first two records are `.`
//! and `..`, written at creation and never removed by operations on
//! children.
//!
//! Path resolution (`namei`) starts at inode 0, the root, which is its own
//! parent.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{DirEntry, Inode, Superblock};
use pfs_types::{Acl, FileKind, DIRENTRY_SIZE, FILENAME_MAX};
use tracing::{debug, trace};

/// Inode number of the filesystem root.
pub const ROOT_INO: u32 = 0;

const RECORD: u64 = DIRENTRY_SIZE as u64;

// ── Entry access ────────────────────────────────────────────────────────────

/// Number of records in a directory.
#[must_use]
pub fn entry_count(dir: &Inode) -> u64 {
    dir.size / RECORD
}

fn check_dir(dir: &Inode) -> Result<()> {
    if !dir.acl.is_dir() {
        return Err(PfsError::NotDirectory);
    }
    Ok(())
}

/// Read record `idx` of a directory.
pub fn read_entry(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    dir: &Inode,
    idx: u64,
) -> Result<DirEntry> {
    let mut record = [0u8; DIRENTRY_SIZE];
    let got = pfs_file::read_at(dev, sb, dir, &mut record, idx * RECORD)?;
    if got != DIRENTRY_SIZE {
        return Err(PfsError::Corruption {
            block: 0,
            detail: format!("directory {} holds a torn record at index {idx}", dir.ino),
        });
    }
    Ok(DirEntry::decode(&record)?)
}

/// Overwrite record `idx` in place.
fn write_entry(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    dir: &mut Inode,
    idx: u64,
    entry: &DirEntry,
) -> Result<()> {
    let mut record = [0u8; DIRENTRY_SIZE];
    entry.encode(&mut record)?;
    pfs_file::write_at(dev, sb, dir, &record, idx * RECORD)?;
    Ok(())
}

/// Append a record at the end of the directory.
fn append_entry(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    dir: &mut Inode,
    entry: &DirEntry,
) -> Result<()> {
    let mut record = [0u8; DIRENTRY_SIZE];
    entry.encode(&mut record)?;
    let offset = dir.size;
    pfs_file::write_at(dev, sb, dir, &record, offset)?;
    Ok(())
}

/// Remove record `idx`: swap the last record into its slot and truncate by
/// one record. Leaves the referenced inode's link count alone; callers that
/// are dropping a live name pair this with a link decrement.
pub fn remove_entry(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    dir: &mut Inode,
    idx: u64,
) -> Result<()> {
    let last = entry_count(dir) - 1;
    if idx != last {
        let tail = read_entry(dev, sb, dir, last)?;
        write_entry(dev, sb, dir, idx, &tail)?;
    }
    pfs_file::truncate(dev, sb, dir, last * RECORD)
}

/// Find the record named `name`.
pub fn lookup(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    dir: &Inode,
    name: &str,
) -> Result<Option<(u64, DirEntry)>> {
    check_dir(dir)?;
    for idx in 0..entry_count(dir) {
        let entry = read_entry(dev, sb, dir, idx)?;
        if entry.name == name {
            return Ok(Some((idx, entry)));
        }
    }
    Ok(None)
}

/// Iterator over a directory's records, yielding owned entries.
pub struct Entries<'a> {
    dev: &'a dyn BlockDevice,
    sb: &'a Superblock,
    dir: &'a Inode,
    idx: u64,
}

impl Iterator for Entries<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= entry_count(self.dir) {
            return None;
        }
        let entry = read_entry(self.dev, self.sb, self.dir, self.idx);
        self.idx += 1;
        Some(entry)
    }
}

/// Iterate a directory's records.
pub fn entries<'a>(dev: &'a dyn BlockDevice, sb: &'a Superblock, dir: &'a Inode) -> Entries<'a> {
    Entries {
        dev,
        sb,
        dir,
        idx: 0,
    }
}

/// Positional iterator in the readdir_r style: `None` for `current` returns
/// the first record; otherwise the record after the one whose filename
/// equals `current`'s. `Ok(None)` past the end, or when the cursor's name
/// no longer exists.
pub fn readdir_r(
    dev: &dyn BlockDevice,
    sb: &Superblock,
    dir: &Inode,
    current: Option<&DirEntry>,
) -> Result<Option<DirEntry>> {
    check_dir(dir)?;
    let count = entry_count(dir);
    let Some(current) = current else {
        if count == 0 {
            return Ok(None);
        }
        return read_entry(dev, sb, dir, 0).map(Some);
    };
    for idx in 0..count {
        let entry = read_entry(dev, sb, dir, idx)?;
        if entry.name == current.name {
            if idx + 1 >= count {
                return Ok(None);
            }
            return read_entry(dev, sb, dir, idx + 1).map(Some);
        }
    }
    Ok(None)
}

// ── Path resolution ─────────────────────────────────────────────────────────

/// Resolve a `/`-separated path to an inode number. The empty path and `/`
/// resolve to the root.
pub fn namei(dev: &dyn BlockDevice, sb: &Superblock, path: &str) -> Result<u32> {
    let mut ino = ROOT_INO;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let dir = pfs_inode::load(dev, sb, ino)?;
        if !dir.acl.is_dir() {
            return Err(PfsError::NotDirectory);
        }
        match lookup(dev, sb, &dir, component)? {
            Some((_, entry)) => ino = entry.ino,
            None => return Err(PfsError::NotFound(path.to_owned())),
        }
    }
    Ok(ino)
}

/// Split a path into its parent path and final component.
pub fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(PfsError::Invalid(format!("path {path:?} has no filename")));
    }
    match trimmed.rfind('/') {
        Some(pos) => Ok((&trimmed[..pos], &trimmed[pos + 1..])),
        None => Ok(("", trimmed)),
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(PfsError::Invalid(format!("bad filename {name:?}")));
    }
    if name.len() > FILENAME_MAX {
        return Err(PfsError::NameTooLong);
    }
    Ok(())
}

// ── Namespace operations ────────────────────────────────────────────────────

/// Create a regular file named `name` under `parent`. Returns the new inode
/// number.
pub fn mknod(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    cursor: &mut pfs_inode::AllocCursor,
    parent: &mut Inode,
    name: &str,
) -> Result<u32> {
    check_dir(parent)?;
    check_name(name)?;
    if lookup(dev, sb, parent, name)?.is_some() {
        return Err(PfsError::Exists);
    }

    let mut inode = pfs_inode::new_inode(dev, sb, cursor)?;
    inode.acl = Acl::new(FileKind::Regular, 0o644);
    inode.links = 1;
    pfs_inode::save(dev, sb, &inode)?;

    if let Err(err) = append_entry(dev, sb, parent, &DirEntry::new(inode.ino, name)) {
        // the entry never landed; the inode must not leak
        pfs_inode::free_inode(dev, sb, inode)?;
        return Err(err);
    }
    pfs_inode::save(dev, sb, parent)?;
    debug!(target: "pfs::dir", event = "mknod", parent = parent.ino, ino = inode.ino);
    Ok(inode.ino)
}

/// Create a directory named `name` under `parent`, seeded with `.` and `..`.
pub fn mkdir(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    cursor: &mut pfs_inode::AllocCursor,
    parent: &mut Inode,
    name: &str,
) -> Result<u32> {
    check_dir(parent)?;
    check_name(name)?;
    if lookup(dev, sb, parent, name)?.is_some() {
        return Err(PfsError::Exists);
    }

    let mut child = pfs_inode::new_inode(dev, sb, cursor)?;
    child.acl = Acl::new(FileKind::Directory, 0o755);
    child.links = 2; // parent entry + its own "."
    pfs_inode::save(dev, sb, &child)?;

    let result = write_dot_entries(dev, sb, &mut child, parent.ino)
        .and_then(|()| append_entry(dev, sb, parent, &DirEntry::new(child.ino, name)));
    if let Err(err) = result {
        pfs_inode::free_inode(dev, sb, child)?;
        return Err(err);
    }

    parent.links += 1; // the child's ".."
    pfs_inode::save(dev, sb, parent)?;
    debug!(target: "pfs::dir", event = "mkdir", parent = parent.ino, ino = child.ino);
    Ok(child.ino)
}

/// Write the two seed records of a fresh directory.
pub fn write_dot_entries(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    dir: &mut Inode,
    parent_ino: u32,
) -> Result<()> {
    let mut records = [0u8; 2 * DIRENTRY_SIZE];
    DirEntry::new(dir.ino, ".").encode(&mut records[..DIRENTRY_SIZE])?;
    DirEntry::new(parent_ino, "..").encode(&mut records[DIRENTRY_SIZE..])?;
    pfs_file::write_at(dev, sb, dir, &records, 0)?;
    Ok(())
}

/// Remove the entry `name` from `parent` and drop the target's link count,
/// freeing the inode when it reaches zero. Directories are removed
/// recursively (`rmdir`).
pub fn unlink(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    parent: &mut Inode,
    name: &str,
) -> Result<()> {
    check_dir(parent)?;
    let Some((idx, entry)) = lookup(dev, sb, parent, name)? else {
        return Err(PfsError::NotFound(name.to_owned()));
    };
    let target = pfs_inode::load(dev, sb, entry.ino)?;
    if target.acl.is_dir() {
        return rmdir(dev, sb, parent, name);
    }

    remove_entry(dev, sb, parent, idx)?;
    drop_link(dev, sb, target)?;
    pfs_inode::save(dev, sb, parent)?;
    debug!(target: "pfs::dir", event = "unlink", parent = parent.ino, ino = entry.ino);
    Ok(())
}

fn drop_link(dev: &dyn BlockDevice, sb: &mut Superblock, mut target: Inode) -> Result<()> {
    target.links = target.links.saturating_sub(1);
    if target.links == 0 {
        pfs_inode::free_inode(dev, sb, target)
    } else {
        pfs_inode::save(dev, sb, &target)
    }
}

/// Remove the directory `name` under `parent`, recursively removing its
/// contents first.
pub fn rmdir(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    parent: &mut Inode,
    name: &str,
) -> Result<()> {
    check_dir(parent)?;
    let Some((idx, entry)) = lookup(dev, sb, parent, name)? else {
        return Err(PfsError::NotFound(name.to_owned()));
    };
    if entry.ino == ROOT_INO {
        return Err(PfsError::Invalid("cannot remove the root directory".into()));
    }
    let mut dir = pfs_inode::load(dev, sb, entry.ino)?;
    if !dir.acl.is_dir() {
        return Err(PfsError::NotDirectory);
    }

    clear_directory(dev, sb, &mut dir)?;
    remove_entry(dev, sb, parent, idx)?;
    parent.links -= 1; // the child's ".." is gone
    pfs_inode::free_inode(dev, sb, dir)?;
    pfs_inode::save(dev, sb, parent)?;
    debug!(target: "pfs::dir", event = "rmdir", parent = parent.ino, ino = entry.ino);
    Ok(())
}

/// Unlink every record past `.` and `..`, recursing into subdirectories.
fn clear_directory(dev: &dyn BlockDevice, sb: &mut Superblock, dir: &mut Inode) -> Result<()> {
    while entry_count(dir) > 2 {
        let entry = read_entry(dev, sb, dir, 2)?;
        let child = pfs_inode::load(dev, sb, entry.ino)?;
        if child.acl.is_dir() {
            let mut child = child;
            clear_directory(dev, sb, &mut child)?;
            remove_entry(dev, sb, dir, 2)?;
            dir.links -= 1;
            pfs_inode::free_inode(dev, sb, child)?;
        } else {
            remove_entry(dev, sb, dir, 2)?;
            drop_link(dev, sb, child)?;
        }
    }
    Ok(())
}

/// Add a second name for `src` inside `dest_dir` (a hard link). The inode
/// gains a link; no data moves.
pub fn link(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    src: &mut Inode,
    dest_dir: &mut Inode,
    name: &str,
) -> Result<()> {
    check_dir(dest_dir)?;
    check_name(name)?;
    if src.acl.is_dir() {
        return Err(PfsError::IsDirectory);
    }
    if lookup(dev, sb, dest_dir, name)?.is_some() {
        return Err(PfsError::Exists);
    }

    append_entry(dev, sb, dest_dir, &DirEntry::new(src.ino, name))?;
    src.links += 1;
    src.ctime = pfs_inode::now_secs();
    pfs_inode::save(dev, sb, src)?;
    pfs_inode::save(dev, sb, dest_dir)?;
    trace!(target: "pfs::dir", event = "link", ino = src.ino, dir = dest_dir.ino);
    Ok(())
}

/// Move the entry `from_name` in `from_dir` to `to_name` in `to_dir`.
///
/// Equivalent to link-then-unlink for files, but moves the record directly
/// so a renamed directory keeps its contents; its `..` record and the two
/// parents' link counts are patched when the move crosses directories.
pub fn rename(
    dev: &dyn BlockDevice,
    sb: &mut Superblock,
    from_dir_ino: u32,
    from_name: &str,
    to_dir_ino: u32,
    to_name: &str,
) -> Result<()> {
    check_name(from_name)?;
    check_name(to_name)?;
    let mut from_dir = pfs_inode::load(dev, sb, from_dir_ino)?;
    check_dir(&from_dir)?;

    let Some((idx, entry)) = lookup(dev, sb, &from_dir, from_name)? else {
        return Err(PfsError::NotFound(from_name.to_owned()));
    };

    if from_dir_ino == to_dir_ino {
        if from_name == to_name {
            return Ok(());
        }
        if lookup(dev, sb, &from_dir, to_name)?.is_some() {
            return Err(PfsError::Exists);
        }
        write_entry(dev, sb, &mut from_dir, idx, &DirEntry::new(entry.ino, to_name))?;
        pfs_inode::save(dev, sb, &from_dir)?;
        return Ok(());
    }

    let mut to_dir = pfs_inode::load(dev, sb, to_dir_ino)?;
    check_dir(&to_dir)?;
    if lookup(dev, sb, &to_dir, to_name)?.is_some() {
        return Err(PfsError::Exists);
    }

    append_entry(dev, sb, &mut to_dir, &DirEntry::new(entry.ino, to_name))?;
    remove_entry(dev, sb, &mut from_dir, idx)?;

    let moved = pfs_inode::load(dev, sb, entry.ino)?;
    if moved.acl.is_dir() {
        // repoint ".." and shift the parents' link counts
        let mut moved = moved;
        write_entry(dev, sb, &mut moved, 1, &DirEntry::new(to_dir_ino, ".."))?;
        pfs_inode::save(dev, sb, &moved)?;
        from_dir.links -= 1;
        to_dir.links += 1;
    }

    pfs_inode::save(dev, sb, &from_dir)?;
    pfs_inode::save(dev, sb, &to_dir)?;
    debug!(
        target: "pfs::dir",
        event = "rename",
        ino = entry.ino,
        from = from_dir_ino,
        to = to_dir_ino
    );
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
