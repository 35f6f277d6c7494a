//! A blocking UDP endpoint that carries one [`TransferSession`] at a time.

use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant as MonoInstant},
};

use log::{debug, warn};
use smoltcp::{time::Instant, wire::IpEndpoint};

use crate::{
    error::{Error, Result},
    packet::{ErrorCode, Repr, DATA_SIZE, PACKET_SIZE},
    session::{abort_packet, Received, TransferSession},
};

pub struct Socket {
    inner: UdpSocket,
    /// One byte larger than any valid packet so oversized datagrams are caught.
    buffer: [u8; PACKET_SIZE + 1],
    /// Session time is measured from here, so it never runs backwards.
    epoch: MonoInstant,
}

impl Socket {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Ok(Self::from_std(UdpSocket::bind(addr)?))
    }

    pub fn from_std(inner: UdpSocket) -> Self {
        Socket {
            inner,
            buffer: [0; PACKET_SIZE + 1],
            epoch: MonoInstant::now(),
        }
    }

    /// Monotonic time for the sessions this socket drives.
    pub fn now(&self) -> Instant {
        let micros = self.epoch.elapsed().as_micros();
        Instant::from_micros(i64::try_from(micros).unwrap_or(i64::MAX))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn send_to(&self, bytes: &[u8], to: IpEndpoint) -> Result<()> {
        self.inner.send_to(bytes, socket_addr(to))?;
        Ok(())
    }

    /// Send an ERROR packet. Messages too long for one packet are cut short.
    pub fn send_error(&self, to: IpEndpoint, code: ErrorCode, message: &str) -> Result<()> {
        let max = PACKET_SIZE - 5;
        let mut end = message.len().min(max);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let packet = Repr::Error {
            code,
            message: message[..end].as_bytes(),
        }
        .encode()?;
        self.send_to(&packet, to)
    }

    /// Wait for a datagram until `deadline`, measured on [`now`](Self::now).
    /// `None` means the deadline passed.
    pub fn recv_until(&mut self, deadline: Option<Instant>) -> Result<Option<(usize, IpEndpoint)>> {
        let timeout = match deadline {
            Some(deadline) => {
                let now = self.now();
                if deadline <= now {
                    return Ok(None);
                }
                let wait = Duration::from_micros((deadline - now).total_micros());
                Some(wait.max(Duration::from_millis(1)))
            }
            None => None,
        };
        self.inner.set_read_timeout(timeout)?;
        match self.inner.recv_from(&mut self.buffer) {
            Ok((len, from)) => Ok(Some((len, from.into()))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The datagram most recently returned by [`recv_until`](Self::recv_until).
    pub fn received(&self, len: usize) -> &[u8] {
        &self.buffer[..len]
    }

    /// Send the session's file from `reader`, returning the bytes sent.
    pub fn upload<R: Read>(&mut self, session: &mut TransferSession, reader: &mut R) -> Result<u64> {
        let result = self.upload_inner(session, reader);
        if let Err(e) = &result {
            self.abort(session, e);
        }
        result
    }

    /// Receive the session's file into `writer`, returning the bytes received.
    pub fn download<W: Write>(
        &mut self,
        session: &mut TransferSession,
        writer: &mut W,
    ) -> Result<u64> {
        let result = self.download_inner(session, writer);
        if let Err(e) = &result {
            self.abort(session, e);
        }
        result
    }

    fn upload_inner<R: Read>(&mut self, session: &mut TransferSession, reader: &mut R) -> Result<u64> {
        let mut chunk = [0u8; DATA_SIZE];
        let mut total = 0u64;
        loop {
            self.flush(session)?;
            if session.is_done() {
                return Ok(total);
            }
            if session.can_send() {
                let len = read_chunk(reader, &mut chunk)?;
                session.send_data(&chunk[..len], self.now())?;
                total += len as u64;
            } else {
                self.step(session)?;
            }
        }
    }

    fn download_inner<W: Write>(
        &mut self,
        session: &mut TransferSession,
        writer: &mut W,
    ) -> Result<u64> {
        let mut total = 0u64;
        loop {
            self.flush(session)?;
            if session.is_done() {
                return Ok(total);
            }
            if let Received::Data(payload) = self.step(session)? {
                writer.write_all(payload)?;
                total += payload.len() as u64;
                // The final ack goes out only once the data is safely written.
                if session.is_done() {
                    writer.flush()?;
                }
            }
        }
    }

    /// Run the timer, then wait for and process one datagram.
    fn step(&mut self, session: &mut TransferSession) -> Result<Received<'_>> {
        session.poll(self.now())?;
        self.flush(session)?;
        let Some((len, from)) = self.recv_until(session.poll_at())? else {
            return Ok(Received::Nothing);
        };
        let now = self.now();
        match session.process(from, &self.buffer[..len], now) {
            Err(Error::InvalidAddr(stranger)) => {
                self.reject_stranger(stranger);
                Ok(Received::Nothing)
            }
            other => other,
        }
    }

    /// Tell a datagram's sender it is not part of this transfer. Failing to
    /// do so is logged and otherwise ignored.
    fn reject_stranger(&self, stranger: IpEndpoint) {
        warn!("datagram from unknown endpoint {stranger}");
        if let Err(e) = self.send_error(stranger, ErrorCode::UnknownTransferId, "unknown transfer id") {
            warn!("could not answer {stranger}: {e}");
        }
    }

    fn flush(&self, session: &mut TransferSession) -> Result<()> {
        if let Some((to, bytes)) = session.dispatch() {
            self.send_to(bytes, to)?;
        }
        Ok(())
    }

    fn abort(&self, session: &TransferSession, error: &Error) {
        let Some(peer) = session.peer() else {
            return;
        };
        if let Some(packet) = abort_packet(error) {
            debug!("sending error to {peer}: {error}");
            if let Err(e) = self.send_to(&packet, peer) {
                warn!("could not notify {peer}: {e}");
            }
        }
    }
}

/// Fill `buf` unless the reader runs dry first.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(endpoint.addr.into(), endpoint.port)
}
