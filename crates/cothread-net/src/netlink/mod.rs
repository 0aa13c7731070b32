//! Netlink-style transactions over an unreliable datagram link
//!
//! - [`NlMessage`] and [`Attrs`]: message and attribute builders
//! - [`Policy`]: fail-closed attribute validation
//! - [`NlSocket`] and [`Transaction`]: request/reply with retransmission
//!   after a detected receive overrun
//! - [`GenlFamily`]: generic family lookup through the controller

mod attr;
mod genl;
mod message;
mod socket;
mod transaction;

#[cfg(target_os = "linux")]
mod kernel;

pub use attr::{AttrKind, AttrSpec, ParsedAttrs, Policy};
pub use genl::{
    GenlFamily, CTRL_ATTR_FAMILY_ID, CTRL_ATTR_FAMILY_NAME, CTRL_CMD_GETFAMILY, CTRL_VERSION, GENL_ID_CTRL,
};
pub use message::{
    align, AttrWriter, Attrs, GenlHeader, NlHeader, NlMessage, GENL_HDRLEN, NLA_HDRLEN, NLMSG_DONE, NLMSG_ERROR,
    NLMSG_HDRLEN, NLMSG_NOOP, NLMSG_OVERRUN, NLM_F_ACK, NLM_F_ECHO, NLM_F_MULTI, NLM_F_REQUEST,
};
pub use socket::{NlSocket, BACKLOG_LIMIT};
pub use transaction::{Transaction, TransactionState};

#[cfg(target_os = "linux")]
pub use kernel::{NetlinkDatagram, Parameters};
