#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pfs_block::FileBlockDevice;
use pfs_core::Filesystem;
use pfs_types::{BLOCK_SIZE, DEVICE_SIZE};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pfs", about = "PocketFS: a 4 MiB filesystem in your pocket")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a filesystem image.
    Mkfs {
        /// Path to the image file.
        image: PathBuf,
        /// Device size in bytes.
        #[arg(long, default_value_t = DEVICE_SIZE)]
        size: u64,
        /// Block size in bytes.
        #[arg(long, default_value_t = BLOCK_SIZE)]
        block_size: u32,
    },
    /// Check metadata integrity, optionally repairing in place.
    Fsck {
        /// Path to the image file.
        image: PathBuf,
        /// Apply repairs instead of only reporting.
        #[arg(long)]
        repair: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
        /// Block size in bytes.
        #[arg(long, default_value_t = BLOCK_SIZE)]
        block_size: u32,
    },
    /// Print superblock geometry and usage.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
        /// Block size in bytes.
        #[arg(long, default_value_t = BLOCK_SIZE)]
        block_size: u32,
    },
    /// List a directory inside the image.
    Ls {
        image: PathBuf,
        /// Path inside the filesystem.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file's contents to stdout.
    Cat {
        image: PathBuf,
        /// Path inside the filesystem.
        path: String,
    },
    /// Copy a local file into the image.
    Import {
        image: PathBuf,
        /// Local source file.
        src: PathBuf,
        /// Destination path inside the filesystem.
        dest: String,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    total_blocks: u32,
    data_blocks: u32,
    inode_table_blocks: u32,
    block_groups: u32,
    total_inodes: u32,
    used_inodes: u32,
    used_blocks: u32,
    free_inode_cache_len: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            image,
            size,
            block_size,
        } => mkfs(&image, size, block_size),
        Command::Fsck {
            image,
            repair,
            json,
            block_size,
        } => fsck(&image, repair, json, block_size),
        Command::Inspect {
            image,
            json,
            block_size,
        } => inspect(&image, json, block_size),
        Command::Ls { image, path } => ls(&image, &path),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Import { image, src, dest } => import(&image, &src, &dest),
    }
}

fn open_fs(image: &PathBuf) -> Result<Filesystem> {
    let dev = FileBlockDevice::open(image, BLOCK_SIZE)
        .with_context(|| format!("opening image {}", image.display()))?;
    Filesystem::open(Box::new(dev)).context("mounting filesystem")
}

fn mkfs(image: &PathBuf, size: u64, block_size: u32) -> Result<()> {
    let dev = FileBlockDevice::create(image, size, block_size)
        .with_context(|| format!("creating image {}", image.display()))?;
    let mut fs = Filesystem::format(Box::new(dev)).context("formatting")?;
    fs.sync()?;

    let sb = fs.superblock();
    println!(
        "formatted {}: {} blocks of {} bytes, {} data blocks, {} inodes",
        image.display(),
        sb.num_blocks(),
        sb.block_size,
        sb.data_blocks,
        sb.total_inodes
    );
    Ok(())
}

fn fsck(image: &PathBuf, repair: bool, json: bool, block_size: u32) -> Result<()> {
    let dev = FileBlockDevice::open(image, block_size)
        .with_context(|| format!("opening image {}", image.display()))?;
    let report = pfs_fsck::check(&dev, repair).context("checking filesystem")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_clean() {
        println!("{}: clean", image.display());
    } else {
        for finding in &report.findings {
            let status = if finding.repaired { "repaired" } else { "found" };
            println!(
                "[{}] {} {}: {}",
                finding.pass, finding.severity, status, finding.detail
            );
        }
        println!(
            "{} finding(s), {} repair(s)",
            report.findings.len(),
            report.repairs
        );
    }
    if !repair && !report.is_clean() {
        bail!("filesystem has unrepaired findings");
    }
    Ok(())
}

fn inspect(image: &PathBuf, json: bool, block_size: u32) -> Result<()> {
    let dev = FileBlockDevice::open(image, block_size)
        .with_context(|| format!("opening image {}", image.display()))?;
    let fs = Filesystem::open(Box::new(dev)).context("mounting filesystem")?;
    let sb = fs.superblock();
    let out = InspectOutput {
        block_size: sb.block_size,
        total_blocks: sb.num_blocks(),
        data_blocks: sb.data_blocks,
        inode_table_blocks: sb.inode_blocks(),
        block_groups: sb.num_groups,
        total_inodes: sb.total_inodes,
        used_inodes: sb.used_inodes,
        used_blocks: sb.used_blocks,
        free_inode_cache_len: sb.cache_len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("block size:        {}", out.block_size);
        println!("total blocks:      {}", out.total_blocks);
        println!("data blocks:       {}", out.data_blocks);
        println!("inode table:       {} blocks", out.inode_table_blocks);
        println!("block groups:      {}", out.block_groups);
        println!(
            "inodes:            {} used / {}",
            out.used_inodes, out.total_inodes
        );
        println!(
            "data blocks used:  {} / {}",
            out.used_blocks, out.data_blocks
        );
        println!("free-inode cache:  {} entries", out.free_inode_cache_len);
    }
    Ok(())
}

fn ls(image: &PathBuf, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    for entry in fs.readdir(path).context("reading directory")? {
        let stat = fs.stat_ino(entry.ino)?;
        println!(
            "{:>8} {:>4} {:o} {:>10} {}",
            stat.ino, stat.links, stat.mode, stat.size, entry.name
        );
    }
    Ok(())
}

fn cat(image: &PathBuf, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let stat = fs.stat(path).context("stat")?;
    let mut buf = vec![0u8; usize::try_from(stat.size).context("file too large")?];
    let got = fs.read(path, &mut buf, 0).context("reading file")?;
    std::io::stdout().write_all(&buf[..got])?;
    Ok(())
}

fn import(image: &PathBuf, src: &PathBuf, dest: &str) -> Result<()> {
    let data =
        std::fs::read(src).with_context(|| format!("reading source {}", src.display()))?;
    let mut fs = open_fs(image)?;
    match fs.create(dest) {
        Ok(_) => {}
        Err(pfs_error::PfsError::Exists) => fs.truncate(dest, 0).context("truncating")?,
        Err(err) => return Err(err).context("creating destination"),
    }
    let written = fs.write(dest, &data, 0).context("writing")?;
    fs.sync()?;
    println!("imported {} byte(s) to {}", written, dest);
    Ok(())
}
