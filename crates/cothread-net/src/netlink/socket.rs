//! Netlink-style socket with reliable transactions
//!
//! The transport is an unreliable datagram link: sends are reliable (a full
//! queue reports would-block) but replies can be dropped when the receive
//! buffer overflows. The transport tells us about such a drop with ENOBUFS,
//! and the socket then resends every request still waiting for its reply.
//! That makes request/reply safe for idempotent requests.
//!
//! Replies are routed to transactions by sequence number. Datagrams that
//! match no outstanding transaction go to a bounded backlog read by
//! [`NlSocket::recv`]. Mixing transactional and other traffic on one socket
//! is discouraged: a retransmission can produce duplicate replies, and the
//! backlog drops its oldest entry when full.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use cothread_runtime::{immediate_wake, might_yield, suspend};
use nix::errno::Errno;
use tracing::{debug, error, trace, warn};

use super::message::{NlMessage, NLMSG_ERROR};
use super::transaction::{Slot, Transaction, TransactionState};
use crate::connection::Connection;
use crate::datagram::AsyncDatagram;
use crate::error::{Error, Result};

/// Non-transactional datagrams kept for `recv`
pub const BACKLOG_LIMIT: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn initial_seq() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
}

pub struct NlSocket<D> {
    datagram: Mutex<D>,
    transactions: Mutex<HashMap<u32, Arc<Slot>>>,
    backlog: Mutex<VecDeque<NlMessage>>,
    families: Mutex<HashMap<String, u16>>,
    pid: u32,
    seq: AtomicU32,
    name: String,
}

impl<D: AsyncDatagram> NlSocket<D> {
    /// Wrap a datagram link whose local address is `pid`
    pub fn new(datagram: D, pid: u32) -> Self {
        Self {
            datagram: Mutex::new(datagram),
            transactions: Mutex::new(HashMap::new()),
            backlog: Mutex::new(VecDeque::new()),
            families: Mutex::new(HashMap::new()),
            pid,
            seq: AtomicU32::new(initial_seq()),
            name: format!("netlink:{pid}"),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// A fresh sequence number
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// A request addressed from this socket with a fresh sequence number
    pub fn message(&self, msg_type: u16, flags: u16) -> NlMessage {
        NlMessage::new(msg_type, flags, self.next_seq(), self.pid)
    }

    /// Generic-netlink request from this socket
    pub fn genl_message(&self, family: u16, flags: u16, cmd: u8, version: u8) -> NlMessage {
        NlMessage::genl(family, flags, cmd, version, self.next_seq(), self.pid)
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.transactions).len()
    }

    pub(crate) fn family(&self, name: &str) -> Option<u16> {
        lock(&self.families).get(name).copied()
    }

    pub(crate) fn remember_family(&self, name: &str, id: u16) {
        lock(&self.families).insert(name.to_owned(), id);
    }

    pub(crate) fn register(&self, seq: u32, slot: Arc<Slot>) {
        let dup = lock(&self.transactions).insert(seq, slot);
        assert!(dup.is_none(), "two transactions with sequence number {seq:#x}");
    }

    pub(crate) fn unregister(&self, seq: u32) {
        let removed = lock(&self.transactions).remove(&seq);
        assert!(removed.is_some(), "transaction {seq:#x} unregistered twice");
    }

    pub(crate) fn send_raw(&self, msg: &NlMessage) -> Result<()> {
        trace!(sock = %self.name, msg = %msg, "send");
        lock(&self.datagram).try_send(msg.as_bytes())
    }

    /// One receive; on a reported loss, resend every awaited request first
    fn call_recv(&self) -> Result<Vec<u8>> {
        loop {
            let r = lock(&self.datagram).try_recv();
            match r {
                Err(Error::Os(Errno::ENOBUFS)) => {
                    warn!(sock = %self.name, "lost packet (high data rate?), retransmitting");
                    self.retransmit_all();
                }
                Err(Error::Interrupted) => {}
                Err(e) => {
                    if !e.is_transient() {
                        error!(sock = %self.name, error = %e, "recv failed");
                    }
                    return Err(e);
                }
                Ok(bytes) => return Ok(bytes),
            }
        }
    }

    /// One received datagram, unless it answered a transaction
    ///
    /// Replies are delivered to their transaction and `None` is returned;
    /// duplicates of already answered requests are dropped.
    fn do_recv(&self) -> Result<Option<NlMessage>> {
        let bytes = self.call_recv()?;
        let msg = NlMessage::from_bytes(bytes).map_err(|e| {
            warn!(sock = %self.name, error = %e, "received invalid netlink message");
            e
        })?;
        let seq = msg.seq();
        let slot = lock(&self.transactions).get(&seq).cloned();
        match slot {
            None => Ok(Some(msg)),
            Some(slot) => {
                if slot.deliver(msg) {
                    trace!(sock = %self.name, seq, "reply delivered");
                } else {
                    debug!(sock = %self.name, seq, "duplicate reply dropped");
                }
                Ok(None)
            }
        }
    }

    fn queue(&self, msg: NlMessage) {
        let mut backlog = lock(&self.backlog);
        if backlog.len() >= BACKLOG_LIMIT {
            if let Some(old) = backlog.pop_front() {
                warn!(sock = %self.name, dropped = %old, "backlog full, dropping oldest message");
            }
        }
        backlog.push_back(msg);
    }

    /// Demote every request awaiting a reply and resend it
    fn retransmit_all(&self) {
        let slots: Vec<Arc<Slot>> = lock(&self.transactions).values().cloned().collect();
        for slot in slots {
            if slot.demote() {
                if let Err(e) = slot.retransmit(self) {
                    debug!(sock = %self.name, error = %e, "retransmission deferred");
                }
                // A waiter blocked on receive may now have to send instead.
                slot.wakeup.broadcast();
            }
        }
    }

    fn do_transact(&self, t: &Transaction<'_, D>) -> Result<NlMessage> {
        loop {
            let state = t.state();
            match state {
                TransactionState::NeedRetransmit => t.retransmit()?,
                TransactionState::NeedReply => {
                    if let Some(other) = self.do_recv()? {
                        self.queue(other);
                    }
                }
                TransactionState::Complete(reply) => return check_reply(reply),
                TransactionState::Failed(e) => return Err(e),
            }
        }
    }

    /// Drive `t` to its reply
    ///
    /// A kernel-level error reply becomes `Error::Os`; a reply reporting
    /// EAGAIN is mapped to EPROTO so it cannot be mistaken for would-block.
    pub fn transact(&self, t: &Transaction<'_, D>, block: bool) -> Result<NlMessage> {
        if block {
            might_yield();
        }
        loop {
            match self.do_transact(t) {
                Err(Error::WouldBlock) if block => {
                    self.transact_wait(t);
                    suspend();
                }
                r => return r,
            }
        }
    }

    /// Register what `t` needs next: writability, a reply or nothing
    pub fn transact_wait(&self, t: &Transaction<'_, D>) {
        match t.retransmit() {
            Err(Error::WouldBlock) => self.send_wait(),
            Err(_) => {
                immediate_wake();
            }
            Ok(()) => {
                // Another task may receive our reply; listen for it too.
                t.slot().wakeup.wait();
                self.recv_wait();
                if !matches!(t.state(), TransactionState::NeedReply) {
                    immediate_wake();
                }
            }
        }
    }

    /// Blocking one-shot request/reply
    pub fn transact_request(&self, request: NlMessage) -> Result<NlMessage> {
        let t = Transaction::new(self, request);
        self.transact(&t, true)
    }

    /// Send without a transaction
    pub fn send(&self, msg: &NlMessage, block: bool) -> Result<()> {
        if block {
            might_yield();
        }
        loop {
            match self.send_raw(msg) {
                Err(Error::WouldBlock) if block => {
                    self.send_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }

    /// Next datagram that belongs to no transaction
    pub fn recv(&self, block: bool) -> Result<NlMessage> {
        if block {
            might_yield();
        }
        loop {
            if let Some(msg) = lock(&self.backlog).pop_front() {
                return Ok(msg);
            }
            match self.do_recv() {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(Error::WouldBlock) if block => {
                    self.recv_wait();
                    suspend();
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn recv_wait(&self) {
        if lock(&self.backlog).is_empty() {
            lock(&self.datagram).recv_wait();
        } else {
            immediate_wake();
        }
    }

    pub fn send_wait(&self) {
        lock(&self.datagram).send_wait();
    }

    /// Drop queued non-transactional datagrams
    pub fn clear_backlog(&self) -> usize {
        let mut backlog = lock(&self.backlog);
        let n = backlog.len();
        backlog.clear();
        n
    }
}

fn check_reply(reply: NlMessage) -> Result<NlMessage> {
    if reply.msg_type() != NLMSG_ERROR {
        return Ok(reply);
    }
    match reply.error_code() {
        None => {
            error!(reply = %reply, "NLMSG_ERROR reply too short");
            Err(Error::Os(Errno::EPROTO))
        }
        Some(code) if code < 0 => {
            let errno = match Errno::from_raw(-code) {
                Errno::EAGAIN => Errno::EPROTO,
                e => e,
            };
            debug!(errno = %errno, "NLMSG_ERROR received from kernel");
            Err(Error::Os(errno))
        }
        Some(_) => Ok(reply),
    }
}

impl<D: AsyncDatagram> Connection for NlSocket<D> {
    type Message = NlMessage;

    fn connect(&mut self, _block: bool) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, msg: &NlMessage, block: bool) -> Result<()> {
        NlSocket::send(self, msg, block)
    }

    fn recv(&mut self, block: bool) -> Result<NlMessage> {
        NlSocket::recv(self, block)
    }

    fn connect_wait(&self) {
        immediate_wake();
    }

    fn send_wait(&self) {
        NlSocket::send_wait(self);
    }

    fn recv_wait(&self) {
        NlSocket::recv_wait(self);
    }

    fn close(&mut self) {
        let dropped = self.clear_backlog();
        debug!(sock = %self.name, dropped, "closed");
    }
}

impl<D> fmt::Display for NlSocket<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl<D> fmt::Debug for NlSocket<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NlSocket").field("pid", &self.pid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDatagram;
    use crate::netlink::message::{AttrWriter, NLM_F_ACK, NLM_F_REQUEST};
    use std::sync::atomic::AtomicBool;

    /// Loopback link whose sends can be refused on demand
    struct Gated {
        inner: LoopbackDatagram,
        closed: Arc<AtomicBool>,
    }

    impl AsyncDatagram for Gated {
        fn try_recv(&mut self) -> Result<Vec<u8>> {
            self.inner.try_recv()
        }

        fn try_send(&mut self, d: &[u8]) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::WouldBlock);
            }
            self.inner.try_send(d)
        }

        fn recv_wait(&self) {
            self.inner.recv_wait();
        }

        fn send_wait(&self) {
            immediate_wake();
        }
    }

    fn pair() -> (NlSocket<Gated>, LoopbackDatagram, Arc<AtomicBool>) {
        let (a, kernel) = LoopbackDatagram::pair();
        let gate = Arc::new(AtomicBool::new(false));
        let sock = NlSocket::new(Gated { inner: a, closed: Arc::clone(&gate) }, 4242);
        (sock, kernel, gate)
    }

    fn kernel_recv(kernel: &mut LoopbackDatagram) -> NlMessage {
        NlMessage::from_bytes(kernel.try_recv().unwrap()).unwrap()
    }

    fn reply_to(req: &NlMessage, value: u32) -> NlMessage {
        let mut m = NlMessage::new(0x20, 0, req.seq(), req.pid());
        m.put_u32(1, value);
        m
    }

    #[test]
    fn test_transaction_registration() {
        let (sock, _kernel, _) = pair();
        let req = sock.message(0x20, NLM_F_REQUEST);
        let seq = req.seq();
        {
            let t = Transaction::new(&sock, req);
            assert_eq!(t.seq(), seq);
            assert_ne!(t.request().flags() & NLM_F_ACK, 0);
            assert_eq!(t.state(), TransactionState::NeedRetransmit);
            assert_eq!(sock.outstanding(), 1);
        }
        assert_eq!(sock.outstanding(), 0);
    }

    #[test]
    fn test_reply_routed_by_seq() {
        let (sock, mut kernel, _) = pair();
        let t = Transaction::new(&sock, sock.message(0x20, NLM_F_REQUEST));
        assert_eq!(sock.transact(&t, false), Err(Error::WouldBlock));
        assert_eq!(t.state(), TransactionState::NeedReply);

        let req = kernel_recv(&mut kernel);
        let unrelated = NlMessage::new(0x30, 0, 1, 0);
        kernel.try_send(unrelated.as_bytes()).unwrap();
        kernel.try_send(reply_to(&req, 7).as_bytes()).unwrap();

        let reply = sock.transact(&t, false).unwrap();
        assert_eq!(reply.seq(), t.seq());
        assert_eq!(sock.recv(false), Ok(unrelated));
    }

    #[test]
    fn test_overrun_triggers_retransmission() {
        let (sock, mut kernel, gate) = pair();
        let t = Transaction::new(&sock, sock.message(0x20, NLM_F_REQUEST));
        assert_eq!(sock.transact(&t, false), Err(Error::WouldBlock));
        assert_eq!(t.state(), TransactionState::NeedReply);

        // The reply is lost in a full receive buffer.
        let req = kernel_recv(&mut kernel);
        kernel.try_send(reply_to(&req, 1).as_bytes()).unwrap();
        kernel.overrun_peer();

        gate.store(true, Ordering::SeqCst);
        assert_eq!(sock.transact(&t, false), Err(Error::WouldBlock));
        assert_eq!(t.state(), TransactionState::NeedRetransmit);

        gate.store(false, Ordering::SeqCst);
        assert_eq!(sock.transact(&t, false), Err(Error::WouldBlock));
        assert_eq!(t.state(), TransactionState::NeedReply);
        let again = kernel_recv(&mut kernel);
        assert_eq!(again.seq(), req.seq());
        kernel.try_send(reply_to(&again, 99).as_bytes()).unwrap();

        let reply = sock.transact(&t, false).unwrap();
        let attrs = crate::netlink::Policy::new([crate::netlink::AttrSpec::u32(1).required()]);
        assert_eq!(attrs.parse(reply.payload()).unwrap().u32(1), Some(99));
    }

    #[test]
    fn test_duplicate_reply_dropped() {
        let (sock, mut kernel, _) = pair();
        let t = Transaction::new(&sock, sock.message(0x20, NLM_F_REQUEST));
        let _ = sock.transact(&t, false);
        let req = kernel_recv(&mut kernel);
        kernel.try_send(reply_to(&req, 1).as_bytes()).unwrap();
        kernel.try_send(reply_to(&req, 2).as_bytes()).unwrap();

        let reply = sock.transact(&t, false).unwrap();
        assert_eq!(&reply.payload()[4..8], &1u32.to_ne_bytes());
        assert_eq!(sock.recv(false), Err(Error::WouldBlock));
    }

    #[test]
    fn test_error_replies() {
        let (sock, mut kernel, _) = pair();
        for (code, expected) in [(libc::ENOENT, Errno::ENOENT), (libc::EAGAIN, Errno::EPROTO)] {
            let t = Transaction::new(&sock, sock.message(0x20, NLM_F_REQUEST));
            let _ = sock.transact(&t, false);
            let req = kernel_recv(&mut kernel);
            kernel.try_send(NlMessage::error_reply(&req, code).as_bytes()).unwrap();
            assert_eq!(sock.transact(&t, false), Err(Error::Os(expected)));
        }

        let t = Transaction::new(&sock, sock.message(0x20, NLM_F_REQUEST));
        let _ = sock.transact(&t, false);
        let req = kernel_recv(&mut kernel);
        let ack = NlMessage::error_reply(&req, 0);
        kernel.try_send(ack.as_bytes()).unwrap();
        assert_eq!(sock.transact(&t, false), Ok(ack));
    }
}
