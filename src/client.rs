//! The client module provides a TFTP client that can be used to send and receive files.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::Path,
};

use log::info;

use crate::{
    config::TransferConfig,
    error::{Error, Result},
    packet::OCTET,
    session::TransferSession,
    socket::Socket,
};

#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::{ffi::OsStr, io::Error as IoError, io::ErrorKind as IoErrorKind};

/// A client bound to one local UDP port, talking to one server.
pub struct Client {
    socket: Socket,
    /// The server's request port; each transfer latches its own TID from there.
    server_addr: SocketAddr,
    config: TransferConfig,
}

impl Client {
    pub fn new(addr: SocketAddr, server_addr: SocketAddr, config: TransferConfig) -> Result<Self> {
        Ok(Client {
            socket: Socket::bind(addr)?,
            server_addr,
            config,
        })
    }

    /// Bind an ephemeral port of the same family as `server_addr`.
    pub fn connect(server_addr: SocketAddr, config: TransferConfig) -> Result<Self> {
        let any = match server_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        Self::new(any, server_addr, config)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Download `file_name` from the server into `writer` (RRQ).
    pub fn receive_file<W: Write>(&mut self, file_name: &[u8], writer: &mut W) -> Result<u64> {
        let mut session = TransferSession::start_read(
            self.server_addr.into(),
            file_name,
            OCTET,
            self.config.policy(),
            self.socket.now(),
        )?;
        let received = self.socket.download(&mut session, writer)?;
        info!(
            "received {} ({received} bytes) from {}",
            String::from_utf8_lossy(file_name),
            self.server_addr
        );
        Ok(received)
    }

    /// Upload everything `reader` yields to the server as `file_name` (WRQ).
    pub fn send_file<R: Read>(&mut self, file_name: &[u8], reader: &mut R) -> Result<u64> {
        let mut session = TransferSession::start_write(
            self.server_addr.into(),
            file_name,
            OCTET,
            self.config.policy(),
            self.socket.now(),
        )?;
        let sent = self.socket.upload(&mut session, reader)?;
        info!(
            "sent {} ({sent} bytes) to {}",
            String::from_utf8_lossy(file_name),
            self.server_addr
        );
        Ok(sent)
    }

    /// Download `remote` into the local file `path`, removing it again on failure.
    pub fn get(&mut self, remote: &[u8], path: &Path) -> Result<u64> {
        let file = File::create(path).map_err(|source| Error::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        let result = self.receive_file(remote, &mut writer);
        if result.is_err() {
            drop(writer);
            let _ = fs::remove_file(path);
        }
        result
    }

    /// Upload the local file `path`, named `remote` on the server or after its own file name.
    pub fn put(&mut self, path: &Path, remote: Option<&[u8]>) -> Result<u64> {
        let name = match remote {
            Some(name) => name.to_vec(),
            None => {
                let file_name = path.file_name().ok_or_else(|| Error::Unavailable {
                    path: path.to_path_buf(),
                    source: IoError::new(IoErrorKind::InvalidInput, "a filename was expected!"),
                })?;
                name_bytes(file_name)?
            }
        };
        let file = File::open(path).map_err(|source| Error::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;
        self.send_file(&name, &mut BufReader::new(file))
    }
}

// Filenames are bytes on Unix systems and wide chars on Windows systems; TFTP
// only carries bytes, so elsewhere the name must be valid UTF-8.
#[cfg(unix)]
fn name_bytes(name: &OsStr) -> Result<Vec<u8>> {
    Ok(name.as_bytes().to_vec())
}

#[cfg(not(unix))]
fn name_bytes(name: &OsStr) -> Result<Vec<u8>> {
    name.to_str()
        .map(|s| s.as_bytes().to_vec())
        .ok_or_else(|| {
            Error::Io(IoError::new(
                IoErrorKind::InvalidInput,
                "file name is not valid UTF-8",
            ))
        })
}
