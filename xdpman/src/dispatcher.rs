// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{
    env, mem,
    os::fd::{AsFd as _, AsRawFd as _, RawFd},
    path::{Path, PathBuf},
};

use aya::{
    Ebpf, EbpfLoader,
    programs::{ProgramFd, Xdp},
};
use log::debug;
use object::{Object as _, ObjectSymbol as _};

use crate::{
    config::open_config_file,
    errors::XdpManError,
    program::XdpProgram,
    utils,
};

pub(crate) const XDP_DISPATCHER_PROGRAM_NAME: &str = "xdp_dispatcher";
pub(crate) const XDP_DISPATCHER_OBJECT: &str = "xdp-dispatcher.o";
pub(crate) const XDP_DISPATCHER_CONFIG_SYMBOL: &str = "conf";
pub(crate) const OBJECT_PATH_ENVVAR: &str = "XDP_OBJECT_PATH";

/// Number of slots in the dispatcher template, and so the longest
/// chain that can be installed on one interface.
pub const MAX_DISPATCHER_ACTIONS: usize = 10;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub(crate) struct XdpDispatcherConfig {
    pub num_progs_enabled: u32,
    pub chain_call_actions: [u32; MAX_DISPATCHER_ACTIONS],
}

unsafe impl aya::Pod for XdpDispatcherConfig {}

/// Sorts a chain into its canonical installation order.
pub fn sort_programs(programs: &mut [XdpProgram]) {
    programs.sort_by(|a, b| a.chain_order(b));
}

/// A loaded dispatcher with its component programs grafted onto its
/// `prog<i>` slots. The kernel keeps the components bound only while
/// their attachment descriptors (or pins of them) stay open.
#[derive(Debug)]
pub struct XdpDispatcher {
    #[allow(dead_code)]
    loader: Ebpf,
    fd: ProgramFd,
    id: u32,
    num_extensions: usize,
}

impl XdpDispatcher {
    /// Composes a dispatcher for `programs`: sorts them canonically,
    /// patches the template's config section with the chain-call
    /// policy, loads it, and loads every component as a
    /// function-replacement extension anchored to its slot.
    ///
    /// Nothing is rolled back on failure; partially loaded components
    /// keep their descriptors until their handles are dropped.
    pub fn new(programs: &mut [XdpProgram]) -> Result<Self, XdpManError> {
        if programs.is_empty() {
            return Err(XdpManError::InvalidArgument(
                "cannot compose an empty chain".to_string(),
            ));
        }
        if programs.len() > MAX_DISPATCHER_ACTIONS {
            return Err(XdpManError::TooManyPrograms);
        }
        for program in programs.iter() {
            if program.is_loaded() {
                return Err(XdpManError::InvalidState(
                    "already loaded programs cannot be grafted onto a dispatcher",
                ));
            }
        }

        sort_programs(programs);

        let mut chain_call_actions = [0; MAX_DISPATCHER_ACTIONS];
        for (i, program) in programs.iter().enumerate() {
            chain_call_actions[i] = program.chain_call_actions();
        }
        let config = XdpDispatcherConfig {
            num_progs_enabled: programs.len() as u32,
            chain_call_actions,
        };
        debug!("xdp dispatcher config: {:?}", config);

        let object_path = find_dispatcher_object()?;
        let bytes = utils::read(&object_path)?;
        verify_config_symbol(&bytes)?;

        let mut loader = EbpfLoader::new()
            .set_global(XDP_DISPATCHER_CONFIG_SYMBOL, &config, true)
            .load(&bytes)?;

        let (fd, id) = {
            let dispatcher: &mut Xdp = loader
                .program_mut(XDP_DISPATCHER_PROGRAM_NAME)
                .ok_or_else(|| {
                    XdpManError::MalformedDispatcher(format!(
                        "template has no {XDP_DISPATCHER_PROGRAM_NAME} program"
                    ))
                })?
                .try_into()?;
            dispatcher.load()?;
            let info = dispatcher.info()?;
            (info.fd()?, info.id())
        };

        for (i, program) in programs.iter_mut().enumerate() {
            program.set_attach_target(fd.try_clone()?, format!("prog{i}"))?;
            program.load()?;
            program.attach_extension()?;
        }

        debug!(
            "dispatcher {} composed with {} programs",
            id,
            programs.len()
        );
        Ok(XdpDispatcher {
            loader,
            fd,
            id,
            num_extensions: programs.len(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_extensions(&self) -> usize {
        self.num_extensions
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}

// XDP_OBJECT_PATH, then the configured directories.
fn find_dispatcher_object() -> Result<PathBuf, XdpManError> {
    if let Some(dir) = env::var_os(OBJECT_PATH_ENVVAR) {
        let candidate = Path::new(&dir).join(XDP_DISPATCHER_OBJECT);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    let config = open_config_file();
    for dir in config.object_dirs() {
        let candidate = Path::new(dir).join(XDP_DISPATCHER_OBJECT);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(XdpManError::ProgramNotFound(
        XDP_DISPATCHER_OBJECT.to_string(),
    ))
}

// The template's config section must match the schema we patch into
// it, or the loaded dispatcher would misread its chain policy.
fn verify_config_symbol(bytes: &[u8]) -> Result<(), XdpManError> {
    let file = object::File::parse(bytes).map_err(|e| {
        XdpManError::MalformedDispatcher(format!("unparseable dispatcher object: {e}"))
    })?;
    let symbol = file
        .symbols()
        .find(|s| s.name() == Ok(XDP_DISPATCHER_CONFIG_SYMBOL))
        .ok_or_else(|| {
            XdpManError::MalformedDispatcher(format!(
                "template has no {XDP_DISPATCHER_CONFIG_SYMBOL} symbol"
            ))
        })?;
    let expected = mem::size_of::<XdpDispatcherConfig>() as u64;
    if symbol.size() != expected {
        return Err(XdpManError::MalformedDispatcher(format!(
            "config symbol is {} bytes, expected {expected}",
            symbol.size()
        )));
    }
    Ok(())
}
