//! Resolve paths against a small generated tree and show what the caches hold afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use ananas_vfs::config::CacheConfig;
use ananas_vfs::fs::memfs::{MemFs, ROOT_ADDR};
use ananas_vfs::fs::{FsId, Vfs};

/// Build:
///
/// ```text
/// /bin/sh  /bin/ls
/// /etc/motd  /etc/hosts
/// /home/user/notes.txt
/// /mnt -> (mounted) readme
/// ```
fn sample_tree(config: &CacheConfig) -> std::io::Result<Vfs<MemFs>> {
    let fs = Arc::new(MemFs::new(FsId(0)));
    let bin = fs.mkdir(ROOT_ADDR, "bin")?;
    fs.create(bin, "sh", b"#!")?;
    fs.create(bin, "ls", b"#!")?;
    let etc = fs.mkdir(ROOT_ADDR, "etc")?;
    fs.create(etc, "motd", b"welcome to ananas\n")?;
    fs.create(etc, "hosts", b"127.0.0.1 localhost\n")?;
    let home = fs.mkdir(ROOT_ADDR, "home")?;
    let user = fs.mkdir(home, "user")?;
    fs.create(user, "notes.txt", b"")?;
    fs.mkdir(ROOT_ADDR, "mnt")?;
    let volume = fs.detached_dir();
    fs.create(volume.addr, "readme", b"mounted volume\n")?;

    let root = fs.root();
    let vfs = Vfs::new(fs, config, root)?;
    vfs.mount("/mnt", volume)?;
    Ok(vfs)
}

/// Resolve every path in turn, then print both cache tables.
pub fn run(config: &CacheConfig, paths: &[PathBuf]) -> std::io::Result<()> {
    let vfs = sample_tree(config)?;

    for path in paths {
        match vfs.lookup(path) {
            Ok(inode) => info!(path = %path.display(), identity = %inode.identity(), "resolved"),
            Err(e) => error!(path = %path.display(), "{e}"),
        }
    }

    println!("dcache ({} of {}):", vfs.dcache().len(), vfs.dcache().capacity());
    for entry in vfs.dcache().dump() {
        let target = entry
            .target
            .map_or_else(|| "(negative)".to_owned(), |t| t.to_string());
        let permanent = if entry.permanent { " [permanent]" } else { "" };
        println!(
            "  {} {:?} -> {target}{permanent}",
            entry.parent, entry.name
        );
    }

    println!(
        "icache ({} of {}):",
        vfs.icache().len(),
        vfs.icache().capacity()
    );
    for entry in vfs.icache().dump() {
        println!("  {} {:?}", entry.identity, entry.state);
    }

    let stats = vfs.icache().stats();
    println!(
        "hits {} misses {} evictions {} eager removals {}",
        stats.hits, stats.misses, stats.evictions, stats.eager_removals
    );
    Ok(())
}
