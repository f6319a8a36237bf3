// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::errors::XdpManError;

// std::fs::read, with the failing path in the error.
pub(crate) fn read(path: &Path) -> Result<Vec<u8>, XdpManError> {
    fs::read(path).map_err(|e| XdpManError::Error(format!("can't read {}: {e}", path.display())))
}

/// Resolves an interface name to its index.
pub fn get_ifindex(iface: &str) -> Result<u32, XdpManError> {
    debug!("Getting ifindex for iface: {}", iface);
    match nix::net::if_::if_nametoindex(iface) {
        Ok(index) => {
            debug!("Map {} to {}", iface, index);
            Ok(index)
        }
        Err(_) => {
            info!("Unable to validate interface {}", iface);
            Err(XdpManError::InvalidArgument(format!(
                "unknown interface {iface}"
            )))
        }
    }
}

pub(crate) fn if_index_to_name(if_index: u32) -> Option<String> {
    let interfaces = nix::net::if_::if_nameindex().ok()?;
    for iface in interfaces.iter() {
        if iface.index() == if_index {
            return Some(iface.name().to_string_lossy().into_owned());
        }
    }
    None
}

pub(crate) fn dispatch_dir(managed: &Path, dispatcher_id: u32) -> PathBuf {
    managed.join(format!("dispatch-{dispatcher_id}"))
}

pub(crate) fn link_pin_path(dispatch_dir: &Path, index: usize) -> PathBuf {
    dispatch_dir.join(format!("link-prog{index}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pin_paths_are_bit_exact() {
        let managed = Path::new("/sys/fs/bpf/xdp");
        let dir = dispatch_dir(managed, 1234);
        assert_eq!(dir, Path::new("/sys/fs/bpf/xdp/dispatch-1234"));
        assert_eq!(
            link_pin_path(&dir, 0),
            Path::new("/sys/fs/bpf/xdp/dispatch-1234/link-prog0")
        );
        assert_eq!(
            link_pin_path(&dir, 9),
            Path::new("/sys/fs/bpf/xdp/dispatch-1234/link-prog9")
        );
    }
}
