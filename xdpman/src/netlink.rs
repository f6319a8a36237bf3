// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of xdpman

use std::{cell::RefCell, io, os::fd::RawFd};

use log::debug;
use netlink_packet_core::{NLM_F_ACK, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use netlink_packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkMessage, LinkXdp},
};
use netlink_sys::{Socket, SocketAddr, constants::NETLINK_ROUTE};

use crate::errors::XdpManError;

/// Program ids the kernel reports for an interface's XDP hook, one per
/// attach mode plus the generic one.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct XdpProgIds {
    pub(crate) prog_id: Option<u32>,
    pub(crate) drv_prog_id: Option<u32>,
    pub(crate) skb_prog_id: Option<u32>,
    pub(crate) hw_prog_id: Option<u32>,
}

impl XdpProgIds {
    // Driver mode wins over skb mode when both are reported.
    pub(crate) fn preferred(&self) -> Option<u32> {
        self.drv_prog_id
            .or(self.skb_prog_id)
            .or(self.hw_prog_id)
            .or(self.prog_id)
    }
}

pub(crate) struct NetlinkManager {
    sock: RefCell<Socket>,
}

impl NetlinkManager {
    pub(crate) fn new() -> Result<Self, XdpManError> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(NetlinkManager {
            sock: RefCell::new(socket),
        })
    }

    /// Issues the "set interface XDP program" request. `fd = None`
    /// detaches whatever is bound with the given flags. The kernel's
    /// per-interface ordering makes this atomic; errors come back as
    /// the raw errno on the netlink ack.
    pub(crate) fn set_xdp_fd(
        &self,
        if_index: u32,
        fd: Option<RawFd>,
        flags: u32,
    ) -> Result<(), io::Error> {
        debug!(
            "set_xdp_fd: if_index {} fd {:?} flags {:#x}",
            if_index, fd, flags
        );
        let mut message = LinkMessage::default();
        message.header.index = if_index;
        message.attributes.push(LinkAttribute::Xdp(vec![
            LinkXdp::Fd(fd.unwrap_or(-1)),
            LinkXdp::Flags(flags),
        ]));

        let mut req = NetlinkMessage::from(RouteNetlinkMessage::SetLink(message));
        req.header.flags = NLM_F_REQUEST | NLM_F_ACK;
        req.finalize();
        let mut buf = vec![0; req.header.length as usize];
        req.serialize(&mut buf);

        let socket = self.sock.borrow_mut();
        socket.send(&buf, 0)?;

        let mut receive_buffer = vec![0; 4096];
        let n = socket.recv(&mut &mut receive_buffer[..], 0)?;
        let rx: NetlinkMessage<RouteNetlinkMessage> =
            NetlinkMessage::deserialize(&receive_buffer[..n])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match rx.payload {
            NetlinkPayload::Error(e) => match e.code {
                Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Reads the program ids currently bound to the interface's hook.
    pub(crate) fn xdp_prog_ids(&self, if_index: u32) -> Result<XdpProgIds, io::Error> {
        let mut message = LinkMessage::default();
        message.header.index = if_index;
        let mut req = NetlinkMessage::from(RouteNetlinkMessage::GetLink(message));
        req.header.flags = NLM_F_REQUEST;
        req.finalize();
        let mut buf = vec![0; req.header.length as usize];
        req.serialize(&mut buf);

        let socket = self.sock.borrow_mut();
        socket.send(&buf, 0)?;

        let mut receive_buffer = vec![0; 8192];
        let n = socket.recv(&mut &mut receive_buffer[..], 0)?;
        let rx: NetlinkMessage<RouteNetlinkMessage> =
            NetlinkMessage::deserialize(&receive_buffer[..n])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match rx.payload {
            NetlinkPayload::Error(e) => match e.code {
                Some(code) => Err(io::Error::from_raw_os_error(-code.get())),
                None => Ok(XdpProgIds::default()),
            },
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                let mut ids = XdpProgIds::default();
                for attr in link.attributes {
                    if let LinkAttribute::Xdp(xdp) = attr {
                        for nla in xdp {
                            match nla {
                                LinkXdp::ProgId(id) => ids.prog_id = Some(id),
                                LinkXdp::DrvProgId(id) => ids.drv_prog_id = Some(id),
                                LinkXdp::SkbProgId(id) => ids.skb_prog_id = Some(id),
                                LinkXdp::HwProgId(id) => ids.hw_prog_id = Some(id),
                                _ => {}
                            }
                        }
                    }
                }
                Ok(ids)
            }
            _ => Ok(XdpProgIds::default()),
        }
    }
}
