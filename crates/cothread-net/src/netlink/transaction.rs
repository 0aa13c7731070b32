//! One outstanding request/reply exchange

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cothread_runtime::Cond;
use tracing::trace;

use super::message::{NlMessage, NLM_F_ACK};
use super::socket::NlSocket;
use crate::datagram::AsyncDatagram;
use crate::error::{Error, Result};

/// Where a transaction stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// The request still has to be (re)sent
    NeedRetransmit,
    /// Sent; waiting for the reply
    NeedReply,
    /// Reply received
    Complete(NlMessage),
    Failed(Error),
}

/// Shared between a [`Transaction`] and its socket's table
pub(crate) struct Slot {
    request: NlMessage,
    state: Mutex<TransactionState>,
    pub(crate) wakeup: Cond,
}

impl Slot {
    fn new(request: NlMessage) -> Self {
        Self { request, state: Mutex::new(TransactionState::NeedRetransmit), wakeup: Cond::new() }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `reply` over; false if the transaction was already resolved
    pub(crate) fn deliver(&self, reply: NlMessage) -> bool {
        let delivered = {
            let mut state = self.state();
            match *state {
                TransactionState::NeedRetransmit | TransactionState::NeedReply => {
                    *state = TransactionState::Complete(reply);
                    true
                }
                _ => false,
            }
        };
        if delivered {
            self.wakeup.broadcast();
        }
        delivered
    }

    /// Send the request if it still needs sending
    ///
    /// `WouldBlock` leaves it pending; any other send error fails the
    /// transaction.
    pub(crate) fn retransmit<D: AsyncDatagram>(&self, socket: &NlSocket<D>) -> Result<()> {
        let mut state = self.state();
        if *state != TransactionState::NeedRetransmit {
            return Ok(());
        }
        match socket.send_raw(&self.request) {
            Ok(()) => {
                *state = TransactionState::NeedReply;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                *state = TransactionState::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Demote a sent request whose reply may have been lost
    pub(crate) fn demote(&self) -> bool {
        let mut state = self.state();
        if *state == TransactionState::NeedReply {
            *state = TransactionState::NeedRetransmit;
            true
        } else {
            false
        }
    }
}

/// A request registered with its socket under its sequence number
///
/// Registration happens in [`new`](Self::new) and is undone exactly once
/// when the transaction is dropped. Requests are retransmitted after a
/// detected loss, so they must be idempotent.
pub struct Transaction<'a, D: AsyncDatagram> {
    socket: &'a NlSocket<D>,
    slot: Arc<Slot>,
}

impl<'a, D: AsyncDatagram> Transaction<'a, D> {
    /// Register `request` (with the ack flag added) on `socket`
    ///
    /// # Panics
    ///
    /// If another live transaction on `socket` uses the same sequence number.
    pub fn new(socket: &'a NlSocket<D>, mut request: NlMessage) -> Self {
        request.set_flags(request.flags() | NLM_F_ACK);
        let seq = request.seq();
        let slot = Arc::new(Slot::new(request));
        socket.register(seq, Arc::clone(&slot));
        trace!(seq, "transaction registered");
        Self { socket, slot }
    }

    pub fn seq(&self) -> u32 {
        self.slot.request.seq()
    }

    pub fn request(&self) -> &NlMessage {
        &self.slot.request
    }

    pub fn state(&self) -> TransactionState {
        self.slot.state().clone()
    }

    pub(crate) fn slot(&self) -> &Slot {
        &self.slot
    }

    pub(crate) fn retransmit(&self) -> Result<()> {
        self.slot.retransmit(self.socket)
    }
}

impl<D: AsyncDatagram> Drop for Transaction<'_, D> {
    fn drop(&mut self) {
        self.socket.unregister(self.seq());
    }
}
