// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{
    fs::{self, DirBuilder},
    io::{self, ErrorKind},
    os::fd::RawFd,
    os::unix::fs::DirBuilderExt,
    path::Path,
};

use aya::programs::XdpFlags;
use log::{debug, info, warn};
use nix::libc;

use crate::{
    bpffs::{self, LockGuard},
    config::open_config_file,
    dispatcher::{MAX_DISPATCHER_ACTIONS, XDP_DISPATCHER_PROGRAM_NAME, XdpDispatcher},
    errors::XdpManError,
    netlink::NetlinkManager,
    program::XdpProgram,
    sys,
    types::XdpMode,
    utils,
};

const PIN_DIR_MODE: u32 = 0o700;

/// Installs a chain of programs on an interface.
///
/// A single program is loaded (if needed) and attached directly, with
/// no dispatcher and no pinning. Two or more programs are sorted into
/// canonical order, composed into a dispatcher, their slot attachments
/// pinned under the managed bpffs directory, and the dispatcher is
/// attached. The pins keep the chain alive after this process exits.
///
/// Without `force` the kernel is asked to attach only if the hook is
/// free; with `force` an installed program is replaced, including one
/// bound in an incompatible mode. Returns the kernel id of the
/// installed program (the dispatcher's when a chain was built).
///
/// # Errors
///
/// `InvalidArgument` for an empty chain. Pin failures are returned
/// before the interface is touched. Kernel refusals surface as
/// `IoError` with the raw errno after a one-line diagnostic is logged.
///
/// # Example
///
/// ```rust,no_run
/// use xdpman::{XdpProgram, attach_programs, types::XdpMode};
///
/// fn main() -> Result<(), xdpman::errors::XdpManError> {
///     let mut programs = vec![
///         XdpProgram::from_file("firewall.o", None)?,
///         XdpProgram::from_file("sampler.o", Some("xdp_sample"))?,
///     ];
///     let ifindex = xdpman::utils::get_ifindex("eth0")?;
///     let id = attach_programs(&mut programs, ifindex, false, XdpMode::Unspec)?;
///     println!("installed dispatcher {id}");
///     Ok(())
/// }
/// ```
pub fn attach_programs(
    programs: &mut [XdpProgram],
    if_index: u32,
    force: bool,
    mode: XdpMode,
) -> Result<u32, XdpManError> {
    if programs.is_empty() {
        return Err(XdpManError::InvalidArgument(
            "no programs to attach".to_string(),
        ));
    }

    let mode = effective_mode(mode, if_index);
    let netlink = NetlinkManager::new()?;

    if programs.len() == 1 {
        let program = &mut programs[0];
        if !program.is_loaded() {
            program.load()?;
        }
        install(&netlink, if_index, program.raw_fd()?, force, mode)?;
        let id = program
            .id()
            .ok_or(XdpManError::InvalidState("loaded program has no id"))?;
        info!("attached program {} on ifindex {}", id, if_index);
        Ok(id)
    } else {
        let dispatcher = XdpDispatcher::new(programs)?;
        pin_links(&dispatcher, programs)?;
        install(&netlink, if_index, dispatcher.raw_fd(), force, mode)?;
        info!(
            "attached dispatcher {} with {} programs on ifindex {}",
            dispatcher.id(),
            dispatcher.num_extensions(),
            if_index
        );
        Ok(dispatcher.id())
    }
}

/// Inserts one program into the chain already installed on an
/// interface. Pending kernel support for re-anchoring extensions on a
/// live dispatcher this cannot be done atomically, so it is not
/// implemented; callers should rebuild the chain with
/// [`attach_programs`].
pub fn attach_to_ifindex(
    _program: &mut XdpProgram,
    _if_index: u32,
    _force: bool,
    _mode: XdpMode,
) -> Result<(), XdpManError> {
    Err(XdpManError::NotSupported(
        "inserting a program into an installed chain",
    ))
}

/// Removes the pinned state of an installed dispatcher: every
/// `link-prog<i>` pin and then the `dispatch-<id>` directory itself.
/// Once the pins are gone the kernel drops the component bindings.
/// Returns `PinNotFound` when no pinned state exists for the id.
pub fn detach_dispatcher(dispatcher_id: u32) -> Result<(), XdpManError> {
    let managed = bpffs::managed_dir()?;
    let _lock = LockGuard::acquire()?;
    remove_pin_dir(&utils::dispatch_dir(managed, dispatcher_id), dispatcher_id)?;
    info!("removed pinned state of dispatcher {}", dispatcher_id);
    Ok(())
}

/// Detaches whatever program is bound to the interface's hook in the
/// given mode.
pub fn detach_ifindex(if_index: u32, mode: XdpMode) -> Result<(), XdpManError> {
    let netlink = NetlinkManager::new()?;
    netlink
        .set_xdp_fd(if_index, None, mode.as_flags().bits())
        .map_err(XdpManError::IoError)
}

/// Returns handles for the programs currently installed on an
/// interface: the components of the chain when a dispatcher is
/// attached (recovered through its pinned slot links), the single
/// program otherwise, or an empty set for a bare hook.
pub fn query_ifindex(if_index: u32) -> Result<Vec<XdpProgram>, XdpManError> {
    let netlink = NetlinkManager::new()?;
    let ids = netlink.xdp_prog_ids(if_index)?;
    let Some(id) = ids.preferred() else {
        return Ok(vec![]);
    };
    let program = XdpProgram::from_loaded_id(id)?;
    if program.name() == Some(XDP_DISPATCHER_PROGRAM_NAME) {
        return decompose_dispatcher(id);
    }
    Ok(vec![program])
}

fn decompose_dispatcher(dispatcher_id: u32) -> Result<Vec<XdpProgram>, XdpManError> {
    let managed = bpffs::managed_dir()?;
    let pin_dir = utils::dispatch_dir(managed, dispatcher_id);
    let mut programs = vec![];
    for i in 0..MAX_DISPATCHER_ACTIONS {
        let path = utils::link_pin_path(&pin_dir, i);
        if !path.exists() {
            break;
        }
        let link_fd = sys::obj_get(&path)?;
        let prog_id = sys::link_prog_id(&link_fd)?;
        programs.push(XdpProgram::from_loaded_id(prog_id)?);
    }
    if programs.is_empty() {
        return Err(XdpManError::PinNotFound(dispatcher_id));
    }
    Ok(programs)
}

// Pins every slot attachment under <managed>/dispatch-<id>, serialized
// against other installers by the directory lock. On a per-component
// failure the pins created so far are unwound in reverse; the
// directory is left for detach to remove.
fn pin_links(dispatcher: &XdpDispatcher, programs: &mut [XdpProgram]) -> Result<(), XdpManError> {
    let managed = bpffs::managed_dir()?;
    let _lock = LockGuard::acquire()?;

    let pin_dir = utils::dispatch_dir(managed, dispatcher.id());
    if let Err(e) = DirBuilder::new().mode(PIN_DIR_MODE).create(&pin_dir) {
        if e.kind() != ErrorKind::AlreadyExists {
            return Err(e.into());
        }
    }

    for i in 0..programs.len() {
        let path = utils::link_pin_path(&pin_dir, i);
        debug!("pinning slot {} attachment to {}", i, path.display());
        if let Err(e) = programs[i].pin_link(&path) {
            for j in (0..i).rev() {
                if let Err(e) = programs[j].unpin_link() {
                    warn!("failed to roll back pin for slot {}: {}", j, e);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

fn remove_pin_dir(pin_dir: &Path, dispatcher_id: u32) -> Result<(), XdpManError> {
    let entries = match fs::read_dir(pin_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(XdpManError::PinNotFound(dispatcher_id));
        }
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        fs::remove_file(entry?.path())?;
    }
    fs::remove_dir(pin_dir)?;
    Ok(())
}

fn install(
    netlink: &NetlinkManager,
    if_index: u32,
    fd: RawFd,
    force: bool,
    mode: XdpMode,
) -> Result<(), XdpManError> {
    let flags = attach_flags(mode, force);
    match netlink.set_xdp_fd(if_index, Some(fd), flags.bits()) {
        Ok(()) => Ok(()),
        Err(e) if force && e.raw_os_error() == Some(libc::EEXIST) => {
            // A program bound in the other mode blocks the replace.
            // Detach it in that mode, then retry the original attach.
            info!(
                "ifindex {} holds a program in an incompatible mode, replacing it",
                if_index
            );
            netlink
                .set_xdp_fd(if_index, None, flip_mode_flags(flags).bits())
                .map_err(attach_error)?;
            netlink
                .set_xdp_fd(if_index, Some(fd), flags.bits())
                .map_err(attach_error)?;
            Ok(())
        }
        Err(e) => Err(attach_error(e)),
    }
}

fn attach_flags(mode: XdpMode, force: bool) -> XdpFlags {
    let mut flags = mode.as_flags();
    if !force {
        flags |= XdpFlags::UPDATE_IF_NOEXIST;
    }
    flags
}

fn flip_mode_flags(flags: XdpFlags) -> XdpFlags {
    let modes = XdpFlags::SKB_MODE | XdpFlags::DRV_MODE | XdpFlags::HW_MODE;
    let base = flags - modes;
    if flags.contains(XdpFlags::SKB_MODE) {
        base | XdpFlags::DRV_MODE
    } else {
        base | XdpFlags::SKB_MODE
    }
}

fn attach_error(e: io::Error) -> XdpManError {
    match e.raw_os_error() {
        Some(libc::EBUSY) | Some(libc::EEXIST) => {
            info!("XDP program already loaded on interface; use force to replace");
        }
        Some(libc::EOPNOTSUPP) => {
            info!("native XDP mode unsupported by driver; try skb mode");
        }
        _ => {
            warn!("error attaching XDP program: {}", e);
        }
    }
    XdpManError::IoError(e)
}

// An Unspec request falls back to the interface's configured mode.
fn effective_mode(mode: XdpMode, if_index: u32) -> XdpMode {
    if mode != XdpMode::Unspec {
        return mode;
    }
    if let Some(name) = utils::if_index_to_name(if_index) {
        if let Some(configured) = open_config_file().default_mode(&name) {
            return configured;
        }
    }
    XdpMode::Unspec
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_attach_flags_noexist_iff_not_force() {
        assert!(attach_flags(XdpMode::Skb, false).contains(XdpFlags::UPDATE_IF_NOEXIST));
        assert!(!attach_flags(XdpMode::Skb, true).contains(XdpFlags::UPDATE_IF_NOEXIST));
        assert_eq!(attach_flags(XdpMode::Unspec, true), XdpFlags::empty());
    }

    #[test]
    fn test_flip_mode_flags() {
        let flipped = flip_mode_flags(XdpFlags::SKB_MODE);
        assert!(flipped.contains(XdpFlags::DRV_MODE));
        assert!(!flipped.contains(XdpFlags::SKB_MODE));

        let flipped = flip_mode_flags(XdpFlags::DRV_MODE);
        assert!(flipped.contains(XdpFlags::SKB_MODE));
        assert!(!flipped.contains(XdpFlags::DRV_MODE));

        // Mode-less attach flips to skb; other bits ride along.
        let flipped = flip_mode_flags(XdpFlags::empty());
        assert_eq!(flipped, XdpFlags::SKB_MODE);
    }

    #[test]
    fn test_remove_pin_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pin_dir = tmp.path().join("dispatch-7");
        fs::create_dir(&pin_dir).expect("create pin dir");
        fs::write(pin_dir.join("link-prog0"), b"").expect("pin file");
        fs::write(pin_dir.join("link-prog1"), b"").expect("pin file");

        remove_pin_dir(&pin_dir, 7).expect("removal succeeds");
        assert!(!pin_dir.exists());

        assert_matches!(
            remove_pin_dir(&pin_dir, 7),
            Err(XdpManError::PinNotFound(7))
        );
    }

    #[test]
    fn test_empty_chain_is_invalid() {
        assert_matches!(
            attach_programs(&mut [], 1, false, XdpMode::Skb),
            Err(XdpManError::InvalidArgument(_))
        );
    }
}
