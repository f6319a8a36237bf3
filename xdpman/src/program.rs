// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{
    cmp::Ordering,
    os::fd::{AsFd as _, AsRawFd as _, RawFd},
    path::{Path, PathBuf},
    time::SystemTime,
};

use aya::{
    Ebpf, EbpfLoader,
    programs::{
        Extension, ProgramFd, Xdp,
        links::{FdLink, PinnedLink},
        loaded_programs,
    },
};
use aya_obj::{Object, btf::Btf};
use log::debug;
use object::Endianness;

use crate::{
    errors::XdpManError,
    run_config::parse_run_config,
    sys,
    types::{DEFAULT_CHAIN_CALL_ACTIONS, DEFAULT_RUN_PRIO, XdpProceedOn},
    utils,
};

/// A dispatcher-slot attachment. Pinning moves the descriptor's
/// lifetime into the filesystem; unpinning takes it back.
#[derive(Debug)]
pub(crate) enum XdpLink {
    Fd(FdLink),
    Pinned(PinnedLink),
}

/// One component XDP program: its object, its load state, and the
/// run-config metadata recovered from the object's BTF.
///
/// A handle owns everything it holds. Dropping it closes the slot
/// attachment first, then the program descriptor, then the loaded
/// object, each exactly once.
#[derive(Debug)]
pub struct XdpProgram {
    name: Option<String>,
    // Field order is teardown order.
    link: Option<XdpLink>,
    prog_fd: Option<ProgramFd>,
    ebpf: Option<Ebpf>,
    attach_target: Option<(ProgramFd, String)>,
    bytes: Option<Vec<u8>>,
    btf: Option<Btf>,
    pin_path: Option<PathBuf>,
    id: Option<u32>,
    tag: u64,
    load_time: Option<SystemTime>,
    run_priority: u32,
    chain_call_actions: u32,
    prog_size: Option<usize>,
}

impl Default for XdpProgram {
    fn default() -> Self {
        Self {
            name: None,
            link: None,
            prog_fd: None,
            ebpf: None,
            attach_target: None,
            bytes: None,
            btf: None,
            pin_path: None,
            id: None,
            tag: 0,
            load_time: None,
            run_priority: DEFAULT_RUN_PRIO,
            chain_call_actions: DEFAULT_CHAIN_CALL_ACTIONS,
            prog_size: None,
        }
    }
}

impl XdpProgram {
    pub fn new() -> Self {
        Default::default()
    }

    /// Binds a handle to a program inside an object file image. With
    /// `prog_name = None` the first program in section order is
    /// picked. Run config is recovered from the object's BTF when
    /// present; an object without one gets the defaults.
    pub fn from_bytes(
        bytes: impl Into<Vec<u8>>,
        prog_name: Option<&str>,
    ) -> Result<Self, XdpManError> {
        let bytes = bytes.into();
        let obj = Object::parse(&bytes)?;

        let name = match prog_name {
            Some(name) => {
                if !obj.programs.contains_key(name) {
                    return Err(XdpManError::ProgramNotFound(name.to_string()));
                }
                name.to_string()
            }
            None => obj
                .programs
                .iter()
                .min_by_key(|(_, p)| (p.section_index, p.address))
                .map(|(name, _)| name.clone())
                .ok_or_else(|| {
                    XdpManError::ProgramNotFound("object declares no programs".to_string())
                })?,
        };

        let prog_size = obj
            .programs
            .get(&name)
            .and_then(|p| obj.functions.get(&(p.section_index, p.address)))
            .map(|f| f.instructions.len() * 8);

        let mut program = XdpProgram::new();
        program.name = Some(name.clone());
        program.btf = obj.btf;
        program.bytes = Some(bytes);
        program.prog_size = prog_size;
        program.refresh_run_config()?;
        Ok(program)
    }

    /// Opens `path` and delegates to [`XdpProgram::from_bytes`].
    pub fn from_file(path: impl AsRef<Path>, prog_name: Option<&str>) -> Result<Self, XdpManError> {
        let bytes = utils::read(path.as_ref())?;
        Self::from_bytes(bytes, prog_name)
    }

    /// Binds a handle to an already loaded program, recovering name,
    /// tag, load time and, when the kernel kept the program's BTF, its
    /// run config. This is what lets one process re-order programs
    /// another process installed.
    pub fn from_loaded_id(id: u32) -> Result<Self, XdpManError> {
        let info = loaded_programs()
            .filter_map(|p| p.ok())
            .find(|p| p.id() == id)
            .ok_or(XdpManError::ProgramIdNotFound(id))?;

        let mut program = XdpProgram::new();
        program.prog_fd = Some(info.fd()?);
        program.id = Some(id);
        program.tag = info.tag();
        program.load_time = info.loaded_at();
        program.name = info.name_as_str().map(|n| n.to_string());

        if let Some(btf_id) = info.btf_id() {
            let btf_bytes = sys::btf_bytes_by_id(btf_id)?;
            program.btf = Some(Btf::parse(&btf_bytes, host_endianness())?);
        }
        program.refresh_run_config()?;
        Ok(program)
    }

    // Tolerates a missing run config (defaults apply); a present but
    // malformed one is an error.
    fn refresh_run_config(&mut self) -> Result<(), XdpManError> {
        let (Some(name), Some(btf)) = (self.name.as_deref(), self.btf.as_ref()) else {
            return Ok(());
        };
        match parse_run_config(btf, name) {
            Ok(config) => {
                self.run_priority = config.priority;
                self.chain_call_actions = config.chain_call_actions;
                Ok(())
            }
            Err(XdpManError::NoRunConfig) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Loads the program into the kernel: as a function-replacement
    /// extension when a dispatcher slot target was set, as a plain XDP
    /// program otherwise. Identity (id, tag, load time) is refreshed
    /// from the kernel afterwards.
    pub fn load(&mut self) -> Result<(), XdpManError> {
        if self.prog_fd.is_some() {
            return Err(XdpManError::AlreadyLoaded);
        }
        let name = self
            .name
            .clone()
            .ok_or(XdpManError::InvalidState("program has no name"))?;
        let bytes = self
            .bytes
            .as_ref()
            .ok_or(XdpManError::InvalidState("program has no object to load"))?;

        let mut loader = EbpfLoader::new();
        if self.attach_target.is_some() {
            loader.extension(&name);
        }
        let mut ebpf = loader.load(bytes)?;

        let raw_program = ebpf
            .program_mut(&name)
            .ok_or_else(|| XdpManError::ProgramNotFound(name.clone()))?;

        let info = match self.attach_target.as_ref() {
            Some((dispatcher_fd, func_name)) => {
                let ext: &mut Extension = raw_program.try_into()?;
                ext.load(dispatcher_fd.try_clone()?, func_name)?;
                ext.info()?
            }
            None => {
                let xdp: &mut Xdp = raw_program.try_into()?;
                xdp.load()?;
                xdp.info()?
            }
        };

        self.prog_fd = Some(info.fd()?);
        self.id = Some(info.id());
        self.tag = info.tag();
        self.load_time = info.loaded_at();
        self.ebpf = Some(ebpf);
        debug!("loaded {} with id {}", name, info.id());
        Ok(())
    }

    // Anchors the next load to a dispatcher slot.
    pub(crate) fn set_attach_target(
        &mut self,
        dispatcher_fd: ProgramFd,
        func_name: String,
    ) -> Result<(), XdpManError> {
        if self.prog_fd.is_some() {
            return Err(XdpManError::InvalidState(
                "already loaded programs cannot be grafted onto a dispatcher",
            ));
        }
        self.attach_target = Some((dispatcher_fd, func_name));
        Ok(())
    }

    /// Materializes the extension binding to the slot set before
    /// [`XdpProgram::load`]. The binding holds as long as the stored
    /// descriptor (or its pin) lives.
    pub(crate) fn attach_extension(&mut self) -> Result<(), XdpManError> {
        let name = self
            .name
            .clone()
            .ok_or(XdpManError::InvalidState("program has no name"))?;
        let ebpf = self
            .ebpf
            .as_mut()
            .ok_or(XdpManError::InvalidState("program is not loaded"))?;
        let ext: &mut Extension = ebpf
            .program_mut(&name)
            .ok_or_else(|| XdpManError::ProgramNotFound(name.clone()))?
            .try_into()?;
        let link_id = ext.attach()?;
        let link: FdLink = ext.take_link(link_id)?.into();
        self.link = Some(XdpLink::Fd(link));
        Ok(())
    }

    pub(crate) fn pin_link(&mut self, path: &Path) -> Result<(), XdpManError> {
        match self.link.take() {
            Some(XdpLink::Fd(link)) => {
                let pinned = link.pin(path).map_err(XdpManError::UnableToPinLink)?;
                self.link = Some(XdpLink::Pinned(pinned));
                self.pin_path = Some(path.to_path_buf());
                Ok(())
            }
            Some(pinned @ XdpLink::Pinned(_)) => {
                self.link = Some(pinned);
                Err(XdpManError::InvalidState("attachment is already pinned"))
            }
            None => Err(XdpManError::InvalidState(
                "program has no dispatcher attachment to pin",
            )),
        }
    }

    pub(crate) fn unpin_link(&mut self) -> Result<(), XdpManError> {
        match self.link.take() {
            Some(XdpLink::Pinned(pinned)) => {
                let link = pinned
                    .unpin()
                    .map_err(|e| XdpManError::Error(format!("failed to unpin link: {e}")))?;
                self.link = Some(XdpLink::Fd(link));
                self.pin_path = None;
                Ok(())
            }
            other => {
                self.link = other;
                Err(XdpManError::InvalidState("attachment is not pinned"))
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn load_time(&self) -> Option<SystemTime> {
        self.load_time
    }

    pub fn is_loaded(&self) -> bool {
        self.prog_fd.is_some()
    }

    pub fn pin_path(&self) -> Option<&Path> {
        self.pin_path.as_deref()
    }

    pub fn run_priority(&self) -> u32 {
        self.run_priority
    }

    pub fn set_run_priority(&mut self, priority: u32) {
        self.run_priority = priority;
    }

    pub fn proceed_on(&self) -> XdpProceedOn {
        XdpProceedOn::from_mask(self.chain_call_actions)
    }

    pub fn set_proceed_on(&mut self, proceed_on: XdpProceedOn) {
        self.chain_call_actions = proceed_on.mask();
    }

    pub(crate) fn chain_call_actions(&self) -> u32 {
        self.chain_call_actions
    }

    pub(crate) fn raw_fd(&self) -> Result<RawFd, XdpManError> {
        let fd = self
            .prog_fd
            .as_ref()
            .ok_or(XdpManError::InvalidState("program is not loaded"))?;
        Ok(fd.as_fd().as_raw_fd())
    }

    /// Canonical chain order: priority, then name bytes, then loaded
    /// before unloaded, then object program size, then tag, then load
    /// time. Deterministic for identical inputs.
    pub(crate) fn chain_order(&self, other: &XdpProgram) -> Ordering {
        self.run_priority
            .cmp(&other.run_priority)
            .then_with(|| match (self.name.as_deref(), other.name.as_deref()) {
                (Some(a), Some(b)) => a.as_bytes().cmp(b.as_bytes()),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| other.is_loaded().cmp(&self.is_loaded()))
            .then_with(|| {
                if !self.is_loaded() && !other.is_loaded() {
                    if let (Some(a), Some(b)) = (self.prog_size, other.prog_size) {
                        return a.cmp(&b);
                    }
                }
                Ordering::Equal
            })
            .then_with(|| self.tag.cmp(&other.tag))
            .then_with(|| self.load_time.cmp(&other.load_time))
    }
}

fn host_endianness() -> Endianness {
    if cfg!(target_endian = "big") {
        Endianness::Big
    } else {
        Endianness::Little
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn unloaded(name: &str, priority: u32) -> XdpProgram {
        let mut p = XdpProgram::new();
        p.name = Some(name.to_string());
        p.run_priority = priority;
        p
    }

    #[test]
    fn test_defaults() {
        let p = XdpProgram::new();
        assert_eq!(p.run_priority(), DEFAULT_RUN_PRIO);
        assert_eq!(p.chain_call_actions(), DEFAULT_CHAIN_CALL_ACTIONS);
        assert!(!p.is_loaded());
        assert!(p.name().is_none());
        assert!(p.pin_path().is_none());
    }

    #[test]
    fn test_chain_order_priority_wins() {
        let a = unloaded("zeta", 10);
        let b = unloaded("alpha", 20);
        assert_eq!(a.chain_order(&b), Ordering::Less);
        assert_eq!(b.chain_order(&a), Ordering::Greater);
    }

    #[test]
    fn test_chain_order_name_breaks_ties() {
        let a = unloaded("alpha", 10);
        let b = unloaded("beta", 10);
        assert_eq!(a.chain_order(&b), Ordering::Less);
        assert_eq!(a.chain_order(&a), Ordering::Equal);
    }

    #[test]
    fn test_chain_order_size_breaks_name_ties() {
        let mut a = unloaded("filter", 10);
        let mut b = unloaded("filter", 10);
        a.prog_size = Some(16);
        b.prog_size = Some(64);
        assert_eq!(a.chain_order(&b), Ordering::Less);
    }

    #[test]
    fn test_sort_is_deterministic_and_stable() {
        let mut programs = vec![
            unloaded("p1", 20),
            unloaded("p2", 10),
            unloaded("p0", 20),
            unloaded("p3", 10),
        ];
        programs.sort_by(|a, b| a.chain_order(b));
        let names: Vec<_> = programs.iter().map(|p| p.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["p2", "p3", "p0", "p1"]);

        // Re-sorting sorted input changes nothing.
        programs.sort_by(|a, b| a.chain_order(b));
        let again: Vec<_> = programs.iter().map(|p| p.name().unwrap().to_string()).collect();
        assert_eq!(names, again);
    }

    #[test]
    fn test_load_without_object_is_invalid_state() {
        let mut p = unloaded("filter", 10);
        assert_matches!(p.load(), Err(XdpManError::InvalidState(_)));
    }

    #[test]
    fn test_pin_without_attachment_is_invalid_state() {
        let mut p = unloaded("filter", 10);
        assert_matches!(
            p.pin_link(Path::new("/sys/fs/bpf/xdp/dispatch-1/link-prog0")),
            Err(XdpManError::InvalidState(_))
        );
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(XdpProgram::from_bytes(vec![0u8; 16], None).is_err());
    }
}
