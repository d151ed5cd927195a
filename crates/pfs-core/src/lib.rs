#![forbid(unsafe_code)]
//! PocketFS core.
//!
//! `Filesystem` is the explicit handle the userspace adapter owns; there is
//! no global state. `format` lays a fresh filesystem onto a device; `open`
//! validates and mounts an existing one. Every operation enters here,
//! resolves its path through the directory layer, runs the file engine, and
//! persists the superblock last, so mutations land in issue order: inode,
//! then bitmap, then superblock.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_inode::AllocCursor;
use pfs_ondisk::{DirEntry, Inode, Superblock};
use pfs_types::{Acl, FileKind, DIRENTRY_SIZE, FILENAME_MAX};
use serde::Serialize;
use tracing::info;

pub use pfs_dir::ROOT_INO;

/// Snapshot of one file's metadata, shaped for the adapter's `stat`.
#[derive(Debug, Clone, Serialize)]
pub struct Stat {
    pub ino: u32,
    pub kind: FileKind,
    pub perms: u32,
    /// Host mode bits (type | permissions).
    pub mode: u32,
    pub links: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
}

impl Stat {
    fn of(inode: &Inode) -> Self {
        Self {
            ino: inode.ino,
            kind: inode.acl.kind(),
            perms: inode.acl.perms(),
            mode: inode.acl.to_mode(),
            links: inode.links,
            size: inode.size,
            uid: inode.uid,
            gid: inode.gid,
            ctime: inode.ctime,
            mtime: inode.mtime,
            atime: inode.atime,
        }
    }
}

/// Filesystem-wide counters, shaped for the adapter's `statfs`.
#[derive(Debug, Clone, Serialize)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u32,
    pub used_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub used_inodes: u32,
    pub free_inodes: u32,
    pub filename_max: u32,
}

/// An open PocketFS instance: one device, one superblock, one allocation
/// cursor. The adapter serializes all calls; operations run to completion.
pub struct Filesystem {
    dev: Box<dyn BlockDevice>,
    sb: Superblock,
    cursor: AllocCursor,
}

impl Filesystem {
    // ── Mount paths ─────────────────────────────────────────────────────

    /// Write a fresh filesystem onto the device: superblock, inode-table
    /// skeleton, group bitmaps, and the root directory.
    pub fn format(dev: Box<dyn BlockDevice>) -> Result<Self> {
        let block_size = dev.block_size();
        let device_size = u64::from(dev.block_count()) * u64::from(block_size);
        let mut sb = Superblock::for_geometry(device_size, block_size)?;

        // inode table: every slot linkless with all pointers unallocated
        let mut buf = vec![0u8; block_size as usize];
        let per_block = sb.inodes_per_block();
        for table_block in 0..sb.inode_blocks() {
            for slot in 0..per_block {
                let ino = table_block * per_block + slot;
                let offset = slot as usize * sb.inode_size as usize;
                Inode::empty(ino).encode(&mut buf[offset..offset + sb.inode_size as usize]);
            }
            dev.write_block(1 + table_block, &buf)?;
        }

        // group bitmaps: only bit 0, the bitmap itself, starts set
        for group in 0..sb.num_groups {
            let mut bitmap = vec![0u8; block_size as usize];
            bitmap[0] = 0x01;
            dev.write_block(sb.group_bitmap_block(group), &bitmap)?;
        }

        // seed the free-inode cache with the lowest numbers that fit
        let seed: Vec<u32> =
            (0..sb.free_cache.len().min(sb.total_inodes as usize) as u32).collect();
        sb.cache_fill(&seed);
        pfs_ondisk::write_superblock(&dev, &sb)?;

        // root: inode 0, a directory that is its own parent
        let mut cursor = AllocCursor::default();
        let mut root = pfs_inode::new_inode(dev.as_ref(), &mut sb, &mut cursor)?;
        debug_assert_eq!(root.ino, ROOT_INO);
        root.acl = Acl::new(FileKind::Directory, 0o755);
        root.links = 2;
        pfs_dir::write_dot_entries(dev.as_ref(), &mut sb, &mut root, ROOT_INO)?;
        pfs_inode::save(dev.as_ref(), &sb, &root)?;
        pfs_ondisk::write_superblock(&dev, &sb)?;

        info!(
            target: "pfs::mkfs",
            event = "format",
            blocks = sb.num_blocks(),
            data_blocks = sb.data_blocks,
            inodes = sb.total_inodes
        );
        Ok(Self { dev, sb, cursor })
    }

    /// Open a formatted device, validating the superblock against it.
    pub fn open(dev: Box<dyn BlockDevice>) -> Result<Self> {
        let sb = pfs_ondisk::read_superblock(dev.as_ref())?;
        if sb.block_size != dev.block_size() || sb.num_blocks() > dev.block_count() {
            return Err(PfsError::Corruption {
                block: 0,
                detail: format!(
                    "superblock geometry ({} x {}) does not fit the device ({} x {})",
                    sb.num_blocks(),
                    sb.block_size,
                    dev.block_count(),
                    dev.block_size()
                ),
            });
        }
        Ok(Self {
            dev,
            sb,
            cursor: AllocCursor::default(),
        })
    }

    /// Persist the superblock. Called at the end of every mutating
    /// operation so counter changes land after the blocks they describe.
    fn commit(&mut self) -> Result<()> {
        pfs_ondisk::write_superblock(self.dev.as_ref(), &self.sb)
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    /// Flush everything to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.commit()?;
        self.dev.sync()
    }

    // ── Lookup and metadata ─────────────────────────────────────────────

    /// Resolve a path to its inode number.
    pub fn lookup(&self, path: &str) -> Result<u32> {
        pfs_dir::namei(&*self.dev, &self.sb, path)
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let ino = self.lookup(path)?;
        let inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        Ok(Stat::of(&inode))
    }

    pub fn stat_ino(&self, ino: u32) -> Result<Stat> {
        let inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        Ok(Stat::of(&inode))
    }

    #[must_use]
    pub fn statfs(&self) -> StatFs {
        StatFs {
            block_size: self.sb.block_size,
            total_blocks: self.sb.data_blocks,
            used_blocks: self.sb.used_blocks,
            free_blocks: self.sb.data_blocks - self.sb.used_blocks,
            total_inodes: self.sb.total_inodes,
            used_inodes: self.sb.used_inodes,
            free_inodes: self.sb.total_inodes - self.sb.used_inodes,
            filename_max: FILENAME_MAX as u32,
        }
    }

    /// List a directory's entries.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let ino = self.lookup(path)?;
        let dir = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        if !dir.acl.is_dir() {
            return Err(PfsError::NotDirectory);
        }
        pfs_dir::entries(&*self.dev, &self.sb, &dir).collect()
    }

    // ── Namespace ───────────────────────────────────────────────────────

    fn parent_of(&self, path: &str) -> Result<(Inode, String)> {
        let (parent_path, name) = pfs_dir::split_path(path)?;
        let parent_ino = self.lookup(parent_path)?;
        let parent = pfs_inode::load(&*self.dev, &self.sb, parent_ino)?;
        Ok((parent, name.to_owned()))
    }

    /// Create a regular file.
    pub fn create(&mut self, path: &str) -> Result<u32> {
        let (mut parent, name) = self.parent_of(path)?;
        let ino = pfs_dir::mknod(&*self.dev, &mut self.sb, &mut self.cursor, &mut parent, &name)?;
        self.commit()?;
        Ok(ino)
    }

    /// Create a directory.
    pub fn mkdir(&mut self, path: &str) -> Result<u32> {
        let (mut parent, name) = self.parent_of(path)?;
        let ino = pfs_dir::mkdir(&*self.dev, &mut self.sb, &mut self.cursor, &mut parent, &name)?;
        self.commit()?;
        Ok(ino)
    }

    /// Remove a file name; the inode goes when its last name does.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (mut parent, name) = self.parent_of(path)?;
        pfs_dir::unlink(&*self.dev, &mut self.sb, &mut parent, &name)?;
        self.commit()
    }

    /// Remove a directory tree.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let (mut parent, name) = self.parent_of(path)?;
        pfs_dir::rmdir(&*self.dev, &mut self.sb, &mut parent, &name)?;
        self.commit()
    }

    /// Hard-link `from` to the new name `to`.
    pub fn link(&mut self, from: &str, to: &str) -> Result<()> {
        let src_ino = self.lookup(from)?;
        let mut src = pfs_inode::load(&*self.dev, &self.sb, src_ino)?;
        let (mut dest, name) = self.parent_of(to)?;
        pfs_dir::link(&*self.dev, &mut self.sb, &mut src, &mut dest, &name)?;
        self.commit()
    }

    /// Rename `from` to `to`; cross-directory moves allowed.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (from_parent_path, from_name) = pfs_dir::split_path(from)?;
        let (to_parent_path, to_name) = pfs_dir::split_path(to)?;
        let from_dir = self.lookup(from_parent_path)?;
        let to_dir = self.lookup(to_parent_path)?;
        pfs_dir::rename(
            &*self.dev,
            &mut self.sb,
            from_dir,
            from_name,
            to_dir,
            to_name,
        )?;
        self.commit()
    }

    /// Create a symbolic link at `path` holding `target`.
    pub fn symlink(&mut self, target: &str, path: &str) -> Result<u32> {
        let (mut parent, name) = self.parent_of(path)?;
        let mut inode = pfs_inode::new_inode(&*self.dev, &mut self.sb, &mut self.cursor)?;
        inode.acl = Acl::new(FileKind::Symlink, 0o777);
        pfs_inode::save(&*self.dev, &self.sb, &inode)?;

        let result = pfs_file::write_at(
            &*self.dev,
            &mut self.sb,
            &mut inode,
            target.as_bytes(),
            0,
        )
        .and_then(|_| pfs_dir::link(&*self.dev, &mut self.sb, &mut inode, &mut parent, &name));
        if let Err(err) = result {
            pfs_inode::free_inode(&*self.dev, &mut self.sb, inode)?;
            return Err(err);
        }
        self.commit()?;
        Ok(inode.ino)
    }

    /// Read a symbolic link's target.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let ino = self.lookup(path)?;
        let inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        if inode.acl.kind() != FileKind::Symlink {
            return Err(PfsError::Invalid(format!("{path} is not a symlink")));
        }
        let mut buf = vec![0u8; usize::try_from(inode.size).unwrap_or(0)];
        pfs_file::read_at(&*self.dev, &self.sb, &inode, &mut buf, 0)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // ── File I/O ────────────────────────────────────────────────────────

    /// Read at `offset`; returns the bytes actually read.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let ino = self.lookup(path)?;
        let inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        if inode.acl.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        pfs_file::read_at(&*self.dev, &self.sb, &inode, buf, offset)
    }

    /// Write at `offset`; returns the bytes written.
    pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let ino = self.lookup(path)?;
        let mut inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        if inode.acl.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        let written = pfs_file::write_at(&*self.dev, &mut self.sb, &mut inode, buf, offset)?;
        self.commit()?;
        Ok(written)
    }

    /// Resize to exactly `size` bytes.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        let ino = self.lookup(path)?;
        let mut inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        if inode.acl.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        pfs_file::truncate(&*self.dev, &mut self.sb, &mut inode, size)?;
        self.commit()
    }

    /// Grow to at least `size` bytes, zero-filled. Returns bytes added.
    pub fn ensure_size(&mut self, path: &str, size: u64) -> Result<u64> {
        let ino = self.lookup(path)?;
        let mut inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        if inode.acl.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        let grown = pfs_file::ensure_size(&*self.dev, &mut self.sb, &mut inode, size)?;
        self.commit()?;
        Ok(grown)
    }

    // ── Attributes ──────────────────────────────────────────────────────

    /// Replace the permission bits, keeping the file type.
    pub fn chmod(&mut self, path: &str, perms: u32) -> Result<()> {
        self.update_inode(path, |inode| {
            inode.acl = inode.acl.with_perms(perms);
            inode.ctime = pfs_inode::now_secs();
        })
    }

    /// Change owner and group.
    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.update_inode(path, |inode| {
            inode.uid = uid;
            inode.gid = gid;
            inode.ctime = pfs_inode::now_secs();
        })
    }

    /// Set access and modification times.
    pub fn utimens(&mut self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        self.update_inode(path, |inode| {
            inode.atime = atime;
            inode.mtime = mtime;
        })
    }

    fn update_inode(&mut self, path: &str, apply: impl FnOnce(&mut Inode)) -> Result<()> {
        let ino = self.lookup(path)?;
        let mut inode = pfs_inode::load(&*self.dev, &self.sb, ino)?;
        apply(&mut inode);
        pfs_inode::save(&*self.dev, &self.sb, &inode)?;
        self.commit()
    }
}

/// Size of one directory record, re-exported for adapters sizing readdir
/// buffers.
pub const DIRENTRY_RECORD: usize = DIRENTRY_SIZE;
