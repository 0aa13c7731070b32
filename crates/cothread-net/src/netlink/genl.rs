//! Generic netlink family lookup through the controller

use nix::errno::Errno;
use tracing::{debug, warn};

use super::attr::{AttrSpec, Policy};
use super::message::{AttrWriter, NlMessage, NLM_F_REQUEST};
use super::socket::NlSocket;
use crate::datagram::AsyncDatagram;
use crate::error::{Error, Result};

/// Family number of the generic netlink controller
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_VERSION: u8 = 2;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

/// A resolved generic netlink family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenlFamily {
    name: String,
    id: u16,
}

impl GenlFamily {
    /// Look `name` up, asking the controller once per socket
    ///
    /// Blocks the calling task. Failed lookups are not cached, so a family
    /// whose module loads later resolves on a later call.
    pub fn resolve<D: AsyncDatagram>(socket: &NlSocket<D>, name: &str) -> Result<Self> {
        if let Some(id) = socket.family(name) {
            return Ok(Self { name: name.to_owned(), id });
        }

        let mut request = socket.genl_message(GENL_ID_CTRL, NLM_F_REQUEST, CTRL_CMD_GETFAMILY, CTRL_VERSION);
        request.put_nul_string(CTRL_ATTR_FAMILY_NAME, name);
        let reply = socket.transact_request(request).map_err(|e| {
            debug!(family = name, error = %e, "generic netlink lookup failed");
            e
        })?;
        let id = Self::parse_reply(&reply)?;

        socket.remember_family(name, id);
        debug!(family = name, id, "generic netlink family resolved");
        Ok(Self { name: name.to_owned(), id })
    }

    /// Number `socket` already learned for `name`, if any
    pub fn cached<D: AsyncDatagram>(socket: &NlSocket<D>, name: &str) -> Option<u16> {
        socket.family(name)
    }

    fn parse_reply(reply: &NlMessage) -> Result<u16> {
        let policy = Policy::new([AttrSpec::u16(CTRL_ATTR_FAMILY_ID).required()]);
        let Some(payload) = reply.genl_payload() else {
            warn!(reply = %reply, "controller reply without generic header");
            return Err(Error::Os(Errno::EPROTO));
        };
        let attrs = policy.parse(payload).map_err(|_| Error::Os(Errno::EPROTO))?;
        attrs.u16(CTRL_ATTR_FAMILY_ID).ok_or(Error::Os(Errno::EPROTO))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Request for this family from `socket`
    pub fn message<D: AsyncDatagram>(&self, socket: &NlSocket<D>, flags: u16, cmd: u8, version: u8) -> NlMessage {
        socket.genl_message(self.id, flags, cmd, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDatagram;
    use cothread_runtime::{Runtime, RuntimeConfig};
    use std::sync::Arc;
    use std::time::Duration;

    /// Answer controller lookups: "known" is family 0x1d, anything else ENOENT
    fn controller(kernel: &mut LoopbackDatagram, lookups: usize) -> usize {
        let policy = Policy::new([AttrSpec::nul_string(CTRL_ATTR_FAMILY_NAME, 1, 16).required()]);
        let mut seen = 0;
        while seen < lookups {
            let req = NlMessage::from_bytes(kernel.recv(true).unwrap()).unwrap();
            assert_eq!(req.msg_type(), GENL_ID_CTRL);
            let hdr = req.genl_header().unwrap();
            assert_eq!((hdr.cmd, hdr.version), (CTRL_CMD_GETFAMILY, CTRL_VERSION));
            let name = policy.parse(req.genl_payload().unwrap()).unwrap().nul_string(CTRL_ATTR_FAMILY_NAME);
            let reply = match name.as_deref() {
                Some("known") => {
                    let mut m = NlMessage::genl(GENL_ID_CTRL, 0, 1, CTRL_VERSION, req.seq(), req.pid());
                    m.put_u16(CTRL_ATTR_FAMILY_ID, 0x1d);
                    m
                }
                _ => NlMessage::error_reply(&req, libc::ENOENT),
            };
            kernel.send(reply.as_bytes(), true).unwrap();
            seen += 1;
        }
        seen
    }

    #[test]
    fn test_resolve_and_cache() {
        let rt = Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(10))).unwrap();
        let g = rt.default_group();
        let (a, mut kernel) = LoopbackDatagram::pair();
        let sock = Arc::new(NlSocket::new(a, 77));

        let answered = g.spawn(move |_| controller(&mut kernel, 2)).unwrap();
        let client = {
            let sock = Arc::clone(&sock);
            g.spawn(move |_| {
                let first = GenlFamily::resolve(&sock, "known");
                let again = GenlFamily::resolve(&sock, "known");
                let missing = GenlFamily::resolve(&sock, "missing");
                (first, again, missing)
            })
            .unwrap()
        };

        let (first, again, missing) = client.join();
        let family = first.unwrap();
        assert_eq!((family.name(), family.id()), ("known", 0x1d));
        assert_eq!(again.unwrap(), family);
        assert_eq!(missing, Err(Error::Os(Errno::ENOENT)));
        assert_eq!(GenlFamily::cached(&sock, "known"), Some(0x1d));
        assert_eq!(GenlFamily::cached(&sock, "missing"), None);
        // The cached lookup never reached the controller.
        assert_eq!(answered.join(), 2);
        assert_eq!(sock.outstanding(), 0);
    }

    #[test]
    fn test_reply_without_family_id() {
        let reply = NlMessage::genl(GENL_ID_CTRL, 0, 1, CTRL_VERSION, 5, 0);
        assert_eq!(GenlFamily::parse_reply(&reply), Err(Error::Os(Errno::EPROTO)));
        let bare = NlMessage::new(GENL_ID_CTRL, 0, 5, 0);
        assert_eq!(GenlFamily::parse_reply(&bare), Err(Error::Os(Errno::EPROTO)));
    }
}
