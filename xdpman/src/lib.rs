// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

mod bpffs;
pub mod config;
mod dispatcher;
pub mod errors;
mod installer;
mod netlink;
mod program;
mod run_config;
mod sys;
pub mod types;
pub mod utils;

pub use bpffs::{LockGuard, find_root, managed_dir};
pub use dispatcher::{MAX_DISPATCHER_ACTIONS, XdpDispatcher, sort_programs};
pub use installer::{
    attach_programs, attach_to_ifindex, detach_dispatcher, detach_ifindex, query_ifindex,
};
pub use program::XdpProgram;
