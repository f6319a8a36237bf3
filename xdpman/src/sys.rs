// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

//! Thin `bpf(2)` wrappers for the few queries the loader crate does not
//! surface: fetching a program's BTF blob by id and reading the program
//! id behind a pinned link.

use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use nix::libc;

const BPF_OBJ_GET: libc::c_int = 7;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;
const BPF_BTF_GET_FD_BY_ID: libc::c_int = 19;

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct BpfObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct BpfGetIdAttr {
    id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct BpfObjGetInfoAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct BtfInfo {
    btf: u64,
    btf_size: u32,
    id: u32,
    name: u64,
    name_len: u32,
    kernel_btf: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct LinkInfo {
    link_type: u32,
    id: u32,
    prog_id: u32,
    // The per-type union; large enough for every variant we may be
    // handed back.
    _pad: [u8; 56],
}

fn sys_bpf(cmd: libc::c_int, attr: *mut libc::c_void, size: usize) -> io::Result<i64> {
    let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size as libc::c_uint) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn obj_get_info<T>(fd: &OwnedFd, info: &mut T) -> io::Result<()> {
    let mut attr = BpfObjGetInfoAttr {
        bpf_fd: fd.as_raw_fd() as u32,
        info_len: mem::size_of::<T>() as u32,
        info: info as *mut T as u64,
    };
    sys_bpf(
        BPF_OBJ_GET_INFO_BY_FD,
        &mut attr as *mut _ as *mut libc::c_void,
        mem::size_of::<BpfObjGetInfoAttr>(),
    )?;
    Ok(())
}

/// Opens a pinned bpf object, holding a reference to its referent for
/// as long as the returned descriptor lives.
pub(crate) fn obj_get(path: &Path) -> io::Result<OwnedFd> {
    let pathname = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut attr = BpfObjGetAttr {
        pathname: pathname.as_ptr() as u64,
        ..Default::default()
    };
    let fd = sys_bpf(
        BPF_OBJ_GET,
        &mut attr as *mut _ as *mut libc::c_void,
        mem::size_of::<BpfObjGetAttr>(),
    )?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Reads the program id a link refers to.
pub(crate) fn link_prog_id(fd: &OwnedFd) -> io::Result<u32> {
    let mut info = LinkInfo {
        link_type: 0,
        id: 0,
        prog_id: 0,
        _pad: [0; 56],
    };
    obj_get_info(fd, &mut info)?;
    Ok(info.prog_id)
}

/// Fetches the raw BTF blob the kernel stored for `btf_id`. The first
/// info call learns the blob size, the second fills the buffer.
pub(crate) fn btf_bytes_by_id(btf_id: u32) -> io::Result<Vec<u8>> {
    let mut attr = BpfGetIdAttr {
        id: btf_id,
        ..Default::default()
    };
    let fd = sys_bpf(
        BPF_BTF_GET_FD_BY_ID,
        &mut attr as *mut _ as *mut libc::c_void,
        mem::size_of::<BpfGetIdAttr>(),
    )?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

    let mut info = BtfInfo::default();
    obj_get_info(&fd, &mut info)?;

    let mut buf = vec![0u8; info.btf_size as usize];
    let mut info = BtfInfo {
        btf: buf.as_mut_ptr() as u64,
        btf_size: buf.len() as u32,
        ..Default::default()
    };
    obj_get_info(&fd, &mut info)?;
    buf.truncate(info.btf_size as usize);
    Ok(buf)
}
