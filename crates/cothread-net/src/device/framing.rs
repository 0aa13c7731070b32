//! Message framing over an [`AsyncStream`]
//!
//! Receiving is resumable: a partially read header or body is kept
//! between calls. Sending keeps at most one message queued; a new message
//! is accepted only once the previous one has been flushed.

use tracing::warn;

use super::wire::{Header, Message, HEADER_LEN};
use crate::error::{Error, Result};
use crate::stream::AsyncStream;

pub(crate) struct Framed<S> {
    stream: S,
    rx_header: [u8; HEADER_LEN],
    rx_buf: Vec<u8>,
    rx_bytes: usize,
    tx_buf: Vec<u8>,
    tx_pos: usize,
}

impl<S: AsyncStream> Framed<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            rx_header: [0; HEADER_LEN],
            rx_buf: Vec::new(),
            rx_bytes: 0,
            tx_buf: Vec::new(),
            tx_pos: 0,
        }
    }

    pub(crate) fn stream(&self) -> &S {
        &self.stream
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn tx_pending(&self) -> bool {
        self.tx_pos < self.tx_buf.len()
    }

    /// Read toward `need` more bytes at `rx_bytes`
    fn fill(&mut self, in_header: bool, need: usize) -> Result<()> {
        let start = self.rx_bytes;
        let dst = if in_header {
            &mut self.rx_header[start..start + need]
        } else {
            &mut self.rx_buf[start..start + need]
        };
        match self.stream.read(dst, false) {
            Ok(0) => {
                self.stream.close();
                if self.rx_bytes == 0 {
                    Err(Error::Eof)
                } else {
                    warn!("unexpected connection drop in middle of a message");
                    Err(Error::protocol("connection dropped mid-message"))
                }
            }
            Ok(n) => {
                self.rx_bytes += n;
                if n < need {
                    Err(Error::WouldBlock)
                } else {
                    Ok(())
                }
            }
            Err(e) => {
                if !e.is_transient() {
                    self.stream.close();
                }
                Err(e)
            }
        }
    }

    /// Receive one complete message without blocking
    pub(crate) fn try_recv(&mut self) -> Result<Message> {
        if self.rx_bytes < HEADER_LEN {
            self.fill(true, HEADER_LEN - self.rx_bytes)?;
            let header = Header::decode(&self.rx_header).ok_or_else(|| Error::protocol("short header"))?;
            let length = header.length as usize;
            if length < HEADER_LEN {
                warn!(length, "received length claims to be shorter than header");
                self.stream.close();
                self.rx_bytes = 0;
                return Err(Error::protocol(format!("frame length {length} shorter than header")));
            }
            self.rx_buf = Vec::with_capacity(length);
            self.rx_buf.extend_from_slice(&self.rx_header);
            self.rx_buf.resize(length, 0);
        }
        let need = self.rx_buf.len() - self.rx_bytes;
        if need > 0 {
            self.fill(false, need)?;
        }
        self.rx_bytes = 0;
        Message::from_bytes(std::mem::take(&mut self.rx_buf))
    }

    /// Push queued bytes; `WouldBlock` while some remain
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.tx_pending() {
            return Ok(());
        }
        let (n, status) = self.stream.write_fully(&self.tx_buf[self.tx_pos..], false);
        self.tx_pos += n;
        if let Err(e) = status {
            if !e.is_transient() {
                self.stream.close();
            }
            return Err(e);
        }
        self.tx_buf.clear();
        self.tx_pos = 0;
        Ok(())
    }

    /// Queue `msg` for transmission
    ///
    /// `Ok` means accepted, not delivered: a partially written message is
    /// finished by later [`flush`](Self::flush) calls. `WouldBlock` means a
    /// previous message is still queued.
    pub(crate) fn try_send(&mut self, msg: &Message) -> Result<()> {
        self.flush()?;
        self.tx_buf.extend_from_slice(msg.as_bytes());
        self.tx_pos = 0;
        match self.flush() {
            Err(Error::WouldBlock) => Ok(()),
            r => r,
        }
    }

    pub(crate) fn close(&mut self) {
        self.stream.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::wire;
    use crate::loopback::LoopbackStream;

    #[test]
    fn test_partial_frames() {
        let (a, mut peer) = LoopbackStream::pair();
        let mut framed = Framed::new(a);
        let bytes = Message::new(1, 9, 3, b"payload").unwrap().as_bytes().to_vec();

        peer.try_write(&bytes[..5]).unwrap();
        assert_eq!(framed.try_recv(), Err(Error::WouldBlock));
        peer.try_write(&bytes[5..10]).unwrap();
        assert_eq!(framed.try_recv(), Err(Error::WouldBlock));
        peer.try_write(&bytes[10..]).unwrap();
        let m = framed.try_recv().unwrap();
        assert_eq!((m.msg_type(), m.body()), (9, &b"payload"[..]));
    }

    #[test]
    fn test_eof_between_and_inside_messages() {
        let (a, mut peer) = LoopbackStream::pair();
        let mut framed = Framed::new(a);
        peer.close();
        assert_eq!(framed.try_recv(), Err(Error::Eof));

        let (a, mut peer) = LoopbackStream::pair();
        let mut framed = Framed::new(a);
        peer.try_write(&Message::hello(1, 1).as_bytes()[..3]).unwrap();
        peer.close();
        assert_eq!(framed.try_recv(), Err(Error::WouldBlock));
        assert!(matches!(framed.try_recv(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_short_length_rejected() {
        let (a, mut peer) = LoopbackStream::pair();
        let mut framed = Framed::new(a);
        peer.try_write(&[1, wire::HELLO, 0, 4, 0, 0, 0, 0]).unwrap();
        assert!(matches!(framed.try_recv(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_send_queues_behind_full_stream() {
        let (a, mut peer) = LoopbackStream::pair_with_capacity(12);
        let mut framed = Framed::new(a);
        let m = Message::new(1, 9, 1, b"12345678").unwrap();
        assert_eq!(framed.try_send(&m), Ok(()));
        assert!(framed.tx_pending());
        assert_eq!(framed.try_send(&m), Err(Error::WouldBlock));

        let mut buf = [0u8; 16];
        assert_eq!(peer.try_read(&mut buf), Ok(12));
        assert_eq!(framed.flush(), Ok(()));
        assert!(!framed.tx_pending());
        assert_eq!(peer.try_read(&mut buf), Ok(4));
    }
}
