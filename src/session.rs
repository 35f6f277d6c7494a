//! The lock-step transfer state machine.
//!
//! A [`TransferSession`] owns the sequencing of one file transfer from one
//! side. It performs no I/O: the driver hands it received datagrams and file
//! chunks, and collects the packets it wants sent.

use core::fmt::{self, Write as _};

use log::debug;
use smoltcp::{
    time::{Duration, Instant},
    wire::IpEndpoint,
};

use crate::{
    error::{Error, Result},
    packet::{Repr, DATA_SIZE, META_SIZE, PACKET_SIZE},
};

/// Which way file data flows for this side of the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// How long to wait for an answer, and how often to resend before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Zero means fail fast: strict sequencing and no retransmission.
    pub max_retries: u8,
}

impl RetryPolicy {
    pub const fn fail_fast(timeout: Duration) -> Self {
        RetryPolicy {
            timeout,
            max_retries: 0,
        }
    }

    fn tolerates_duplicates(&self) -> bool {
        self.max_retries > 0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

/// What a processed datagram meant for the driver.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<'p> {
    /// Nothing new: a duplicate, an out-of-order block, or a stale ack.
    Nothing,
    /// The outstanding block was acknowledged.
    Acked(u16),
    /// The next block of the file arrived; write it out.
    Data(&'p [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Sender with nothing in flight; wants the next chunk.
    Idle,
    /// Sender waiting on the ack for `block`.
    Outstanding { block: u16, last: bool },
    /// Receiver waiting for data block `expected`.
    Waiting { expected: u16 },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    /// Requests go here; the first reply from the same host is latched.
    Pending(IpEndpoint),
    Latched(IpEndpoint),
}

/// One side of one transfer.
#[derive(Debug)]
pub struct TransferSession {
    direction: Direction,
    state: State,
    peer: Peer,
    policy: RetryPolicy,
    /// The last packet sent, kept for retransmission.
    last: heapless::Vec<u8, PACKET_SIZE>,
    /// `last` has not been handed to the driver yet.
    queued: bool,
    /// The last DATA block sent or acknowledged.
    block: u16,
    sent_at: Instant,
    retries: u8,
}

impl TransferSession {
    fn new(direction: Direction, state: State, peer: Peer, policy: RetryPolicy) -> Self {
        TransferSession {
            direction,
            state,
            peer,
            policy,
            last: heapless::Vec::new(),
            queued: false,
            block: 0,
            sent_at: Instant::ZERO,
            retries: 0,
        }
    }

    /// Client side of a read: queue an RRQ and wait for block 1.
    pub fn start_read(
        server: IpEndpoint,
        filename: &[u8],
        mode: &str,
        policy: RetryPolicy,
        now: Instant,
    ) -> Result<Self> {
        let mut session = Self::new(
            Direction::Receiving,
            State::Waiting { expected: 1 },
            Peer::Pending(server),
            policy,
        );
        session.queue(&Repr::Rrq { filename, mode }, now)?;
        Ok(session)
    }

    /// Client side of a write: queue a WRQ and wait for the handshake ack (block 0).
    pub fn start_write(
        server: IpEndpoint,
        filename: &[u8],
        mode: &str,
        policy: RetryPolicy,
        now: Instant,
    ) -> Result<Self> {
        let mut session = Self::new(
            Direction::Sending,
            State::Outstanding {
                block: 0,
                last: false,
            },
            Peer::Pending(server),
            policy,
        );
        session.queue(&Repr::Wrq { filename, mode }, now)?;
        Ok(session)
    }

    /// Server side of a read: ready to send block 1 to the requester.
    pub fn serve_read(peer: IpEndpoint, policy: RetryPolicy) -> Self {
        Self::new(Direction::Sending, State::Idle, Peer::Latched(peer), policy)
    }

    /// Server side of a write: queue the handshake ack and wait for block 1.
    pub fn serve_write(peer: IpEndpoint, policy: RetryPolicy, now: Instant) -> Result<Self> {
        let mut session = Self::new(
            Direction::Receiving,
            State::Waiting { expected: 1 },
            Peer::Latched(peer),
            policy,
        );
        session.queue(&Repr::Ack { block: 0 }, now)?;
        Ok(session)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The transfer finished successfully.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// A sender with no block in flight.
    pub fn can_send(&self) -> bool {
        self.state == State::Idle
    }

    /// The latched peer, once known.
    pub fn peer(&self) -> Option<IpEndpoint> {
        match self.peer {
            Peer::Latched(endpoint) => Some(endpoint),
            Peer::Pending(_) => None,
        }
    }

    /// For a sender, the last block handed out; for a receiver, the next block expected.
    pub fn block(&self) -> u16 {
        match self.state {
            State::Outstanding { block, .. } => block,
            State::Waiting { expected } => expected,
            State::Idle | State::Done => self.block,
        }
    }

    /// When the driver should next call [`poll`](Self::poll), if anything is in flight.
    pub fn poll_at(&self) -> Option<Instant> {
        match self.state {
            State::Outstanding { .. } | State::Waiting { .. } => {
                Some(self.sent_at + self.policy.timeout)
            }
            State::Idle | State::Done => None,
        }
    }

    /// Fire the retransmission timer.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        let Some(deadline) = self.poll_at() else {
            return Ok(());
        };
        if now < deadline {
            return Ok(());
        }
        if self.retries >= self.policy.max_retries {
            return Err(Error::Timeout {
                block: self.block(),
            });
        }
        self.retries += 1;
        self.sent_at = now;
        self.queued = true;
        debug!(
            "retransmitting around block {} (attempt {})",
            self.block(),
            self.retries
        );
        Ok(())
    }

    /// Take the packet that should go out now, with its destination.
    pub fn dispatch(&mut self) -> Option<(IpEndpoint, &[u8])> {
        if !self.queued {
            return None;
        }
        self.queued = false;
        let to = match self.peer {
            Peer::Pending(endpoint) | Peer::Latched(endpoint) => endpoint,
        };
        Some((to, &self.last[..]))
    }

    /// Hand the next chunk of the file to a sender. A chunk shorter than
    /// [`DATA_SIZE`] is the terminal block.
    pub fn send_data(&mut self, chunk: &[u8], now: Instant) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::Illegal);
        }
        let block = self.block.wrapping_add(1);
        self.queue(&Repr::Data { block, data: chunk }, now)?;
        self.block = block;
        self.state = State::Outstanding {
            block,
            last: chunk.len() < DATA_SIZE,
        };
        debug!("sent block {block} ({} bytes)", chunk.len());
        Ok(())
    }

    /// Feed a datagram received from `from`.
    ///
    /// `Error::InvalidAddr` leaves the session untouched; every other error
    /// ends the transfer.
    pub fn process<'p>(
        &mut self,
        from: IpEndpoint,
        bytes: &'p [u8],
        now: Instant,
    ) -> Result<Received<'p>> {
        self.check_source(from)?;
        let repr = Repr::decode(bytes)?;
        let received = match (self.direction, repr) {
            (_, Repr::Error { code, message }) => Err(Error::remote(code, message)),
            (Direction::Sending, Repr::Ack { block }) => self.process_ack(block),
            (Direction::Receiving, Repr::Data { block, data }) => {
                self.process_data(block, data, now)
            }
            (_, other) => Err(Error::UnexpectedPacket(other.opcode())),
        }?;
        if let Peer::Pending(_) = self.peer {
            self.peer = Peer::Latched(from);
        }
        Ok(received)
    }

    fn check_source(&self, from: IpEndpoint) -> Result<()> {
        match self.peer {
            Peer::Latched(peer) if peer == from => Ok(()),
            Peer::Pending(server) if server.addr == from.addr => Ok(()),
            _ => Err(Error::InvalidAddr(from)),
        }
    }

    fn process_ack(&mut self, acked: u16) -> Result<Received<'static>> {
        match self.state {
            State::Outstanding { block, last } if acked == block => {
                self.retries = 0;
                self.state = if last { State::Done } else { State::Idle };
                debug!("block {block} acknowledged");
                Ok(Received::Acked(block))
            }
            State::Outstanding { block, .. }
                if self.policy.tolerates_duplicates() && acked == block.wrapping_sub(1) =>
            {
                debug!("ignoring stale ack {acked}");
                Ok(Received::Nothing)
            }
            State::Outstanding { block, .. } => Err(Error::SequenceMismatch {
                expected: block,
                received: acked,
            }),
            State::Idle | State::Done if acked == self.block => Ok(Received::Nothing),
            _ => Err(Error::SequenceMismatch {
                expected: self.block,
                received: acked,
            }),
        }
    }

    fn process_data<'p>(&mut self, block: u16, data: &'p [u8], now: Instant) -> Result<Received<'p>> {
        let expected = match self.state {
            State::Waiting { expected } => expected,
            _ => {
                debug!("discarding block {block} after completion");
                return Ok(Received::Nothing);
            }
        };
        if block == expected {
            self.queue(&Repr::Ack { block }, now)?;
            self.block = block;
            self.state = if data.len() < DATA_SIZE {
                State::Done
            } else {
                State::Waiting {
                    expected: expected.wrapping_add(1),
                }
            };
            debug!("received block {block} ({} bytes)", data.len());
            return Ok(Received::Data(data));
        }

        let previous = expected.wrapping_sub(1);
        if self.policy.tolerates_duplicates() && block == previous && self.last_is_ack() {
            debug!("duplicate block {block}, re-sending ack");
            self.queued = true;
            self.sent_at = now;
        } else {
            debug!("discarding block {block}, expected {expected}");
        }
        Ok(Received::Nothing)
    }

    fn last_is_ack(&self) -> bool {
        self.last.get(..2) == Some(&[0, 4][..])
    }

    fn queue(&mut self, repr: &Repr<'_>, now: Instant) -> Result<()> {
        self.last = repr.encode()?;
        self.queued = true;
        self.sent_at = now;
        self.retries = 0;
        Ok(())
    }
}

/// Formatted text cut at a char boundary once an ERROR packet is full.
struct MessageBuf {
    text: heapless::String<{ PACKET_SIZE - META_SIZE - 1 }>,
    full: bool,
}

impl fmt::Write for MessageBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.full {
            return Ok(());
        }
        let room = self.text.capacity() - self.text.len();
        let mut end = s.len().min(room);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.full = end < s.len();
        // Fits by construction.
        let _ = self.text.push_str(&s[..end]);
        Ok(())
    }
}

/// Encode the courtesy ERROR packet sent to the peer when this side aborts.
/// Errors received from the peer are never answered.
pub fn abort_packet(error: &Error) -> Option<heapless::Vec<u8, PACKET_SIZE>> {
    if let Error::Remote { .. } = error {
        return None;
    }
    let mut message = MessageBuf {
        text: heapless::String::new(),
        full: false,
    };
    write!(message, "{error}").ok()?;
    Repr::Error {
        code: error.code(),
        message: message.text.as_bytes(),
    }
    .encode()
    .ok()
}
