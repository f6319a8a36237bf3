// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XdpManError {
    #[error("An error occurred. {0}")]
    Error(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    BpfProgramError(#[from] aya::programs::ProgramError),
    #[error(transparent)]
    BpfLoadError(#[from] aya::EbpfError),
    #[error(transparent)]
    BtfError(#[from] aya_obj::btf::BtfError),
    #[error(transparent)]
    ObjectParseError(#[from] aya_obj::ParseError),
    #[error(transparent)]
    ParseError(#[from] ParseError),
    #[error("no bpf filesystem at {searched}; set XDP_BPFFS to a mounted bpffs")]
    BpffsNotFound { searched: String },
    #[error("Unable to find a valid program with function name {0}")]
    ProgramNotFound(String),
    #[error("no program with id {0} is loaded")]
    ProgramIdNotFound(u32),
    #[error("no pinned dispatcher state for id {0}")]
    PinNotFound(u32),
    #[error("program carries no run config")]
    NoRunConfig,
    #[error("malformed run config: {0}")]
    MalformedRunConfig(String),
    #[error("malformed dispatcher object: {0}")]
    MalformedDispatcher(String),
    #[error("program is already loaded")]
    AlreadyLoaded,
    #[error("{0}")]
    InvalidState(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No room to attach program. Please remove one and try again.")]
    TooManyPrograms,
    #[error("{0} is not supported")]
    NotSupported(&'static str),
    #[error("Failed to pin link {0}")]
    UnableToPinLink(#[source] aya::pin::PinError),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{action} is not a valid XDP action")]
    InvalidAction { action: String },
    #[error("{mode} is not a valid XDP attach mode")]
    InvalidXdpMode { mode: String },
    #[error(transparent)]
    ConfigParseError(#[from] toml::de::Error),
}
