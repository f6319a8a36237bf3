// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{
    env,
    fs::{DirBuilder, File},
    io::ErrorKind,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log::debug;
use nix::{
    fcntl::{Flock, FlockArg},
    sys::statfs::statfs,
};

use crate::errors::XdpManError;

pub(crate) const BPFFS_ENVVAR: &str = "XDP_BPFFS";
pub(crate) const DEFAULT_BPFFS: &str = "/sys/fs/bpf";
pub(crate) const XDP_SUBDIR: &str = "xdp";

const BPF_FS_MAGIC: u64 = 0xcafe_4a11;
const MANAGED_DIR_MODE: u32 = 0o700;

// Both referents are stable for the process lifetime, so the lookups
// are done once and shared. First writer wins under thread-parallel
// callers.
static BPFFS_ROOT: OnceLock<PathBuf> = OnceLock::new();
static MANAGED_DIR: OnceLock<PathBuf> = OnceLock::new();

fn is_bpffs(path: &Path) -> bool {
    match statfs(path) {
        Ok(fs) => fs.filesystem_type().0 as u64 == BPF_FS_MAGIC,
        Err(_) => false,
    }
}

/// Returns the mount point of the bpf filesystem, honoring the
/// `XDP_BPFFS` override before falling back to `/sys/fs/bpf`.
pub fn find_root() -> Result<&'static Path, XdpManError> {
    if let Some(root) = BPFFS_ROOT.get() {
        return Ok(root.as_path());
    }

    let mut candidates = Vec::new();
    if let Some(root) = env::var_os(BPFFS_ENVVAR) {
        candidates.push(PathBuf::from(root));
    }
    candidates.push(PathBuf::from(DEFAULT_BPFFS));

    for candidate in candidates.iter() {
        if is_bpffs(candidate) {
            debug!("using bpffs at {}", candidate.display());
            let root = BPFFS_ROOT.get_or_init(|| candidate.clone());
            return Ok(root.as_path());
        }
    }

    Err(XdpManError::BpffsNotFound {
        searched: candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Returns the managed `<bpffs>/xdp` directory, creating it with
/// owner-only permissions on first use.
pub fn managed_dir() -> Result<&'static Path, XdpManError> {
    if let Some(dir) = MANAGED_DIR.get() {
        return Ok(dir.as_path());
    }

    let dir = find_root()?.join(XDP_SUBDIR);
    if let Err(e) = DirBuilder::new().mode(MANAGED_DIR_MODE).create(&dir) {
        if e.kind() != ErrorKind::AlreadyExists {
            return Err(e.into());
        }
    }
    Ok(MANAGED_DIR.get_or_init(|| dir).as_path())
}

/// Exclusive advisory lock over the managed directory. Installers in
/// other processes block in `acquire` until the guard is dropped; the
/// drop releases the lock and closes the descriptor.
pub struct LockGuard {
    _lock: Flock<File>,
}

impl LockGuard {
    pub fn acquire() -> Result<LockGuard, XdpManError> {
        LockGuard::lock_dir(managed_dir()?)
    }

    pub(crate) fn lock_dir(dir: &Path) -> Result<LockGuard, XdpManError> {
        debug!("locking {}", dir.display());
        let file = File::open(dir)?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| XdpManError::IoError(errno.into()))?;
        Ok(LockGuard { _lock: lock })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lock_dir_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = LockGuard::lock_dir(dir.path()).expect("first lock");

        let contender = File::open(dir.path()).expect("open dir");
        match Flock::lock(contender, FlockArg::LockExclusiveNonblock) {
            Ok(_) => panic!("second exclusive lock should not be grantable"),
            Err((_, errno)) => assert_eq!(errno, nix::errno::Errno::EWOULDBLOCK),
        }

        drop(guard);
        let contender = File::open(dir.path()).expect("open dir");
        Flock::lock(contender, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| errno)
            .expect("lock is free after guard drop");
    }

    #[test]
    fn test_is_bpffs_rejects_regular_fs() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!is_bpffs(dir.path()));
    }
}
