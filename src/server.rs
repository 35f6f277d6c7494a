//! The request dispatcher and the per-transfer handlers it spawns.
//!
//! The dispatcher socket only ever sees requests. Every accepted transfer gets
//! its own thread and its own ephemeral socket (its TID), so concurrent
//! transfers never read each other's datagrams.

use std::{
    ffi::{OsStr, OsString},
    fs::{self, File},
    io::{BufReader, BufWriter, Error as IoError, ErrorKind as IoErrorKind},
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};
use smoltcp::{time::Duration, wire::IpEndpoint};

#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    packet::{ErrorCode, Repr, OCTET},
    session::{RetryPolicy, TransferSession},
    socket::Socket,
};

/// How often, in milliseconds, the dispatcher wakes up to check for shutdown.
const POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// An owned RRQ or WRQ, as handed from the dispatcher to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub filename: Vec<u8>,
    pub mode: String,
}

impl Request {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (kind, filename, mode) = match Repr::decode(bytes)? {
            Repr::Rrq { filename, mode } => (RequestKind::Read, filename, mode),
            Repr::Wrq { filename, mode } => (RequestKind::Write, filename, mode),
            other => return Err(Error::UnexpectedPacket(other.opcode())),
        };
        Ok(Request {
            kind,
            filename: filename.to_vec(),
            mode: mode.to_owned(),
        })
    }

    fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.filename).into_owned()
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct Server {
    socket: Socket,
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let socket = Socket::bind(config.bind)?;
        fs::create_dir_all(&config.write_dir).map_err(|source| Error::Unavailable {
            path: config.write_dir.clone(),
            source,
        })?;
        Ok(Server {
            socket,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Transfers currently being served.
    pub fn active_transfers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accept requests until shut down, then wait for running transfers.
    pub fn run(&mut self) -> Result<()> {
        info!("serving on {}", self.local_addr()?);
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        while !self.shutdown.load(Ordering::Acquire) {
            let deadline = self.socket.now() + Duration::from_millis(POLL_INTERVAL_MS);
            let received = match self.socket.recv_until(Some(deadline)) {
                Ok(received) => received,
                Err(Error::Io(e)) if e.kind() == IoErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };
            workers.retain(|worker| !worker.is_finished());
            let Some((len, from)) = received else {
                continue;
            };
            match Request::parse(self.socket.received(len)) {
                Ok(request) => match self.dispatch(request, from) {
                    Ok(Some(worker)) => workers.push(worker),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("could not start transfer for {from}: {e}");
                        self.reply_error(from, e.code(), "could not start transfer");
                    }
                },
                Err(e) => {
                    warn!("bad request from {from}: {e}");
                    self.reply_error(from, ErrorCode::IllegalOperation, &e.to_string());
                }
            }
        }
        debug!("shutting down, waiting on {} transfers", workers.len());
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    /// Hand a request to a fresh handler thread, or refuse it.
    fn dispatch(&self, request: Request, from: IpEndpoint) -> Result<Option<JoinHandle<()>>> {
        if !request.mode.eq_ignore_ascii_case(OCTET) {
            warn!("{from} asked for unsupported mode {:?}", request.mode);
            self.reply_error(
                from,
                ErrorCode::IllegalOperation,
                "only octet mode is supported",
            );
            return Ok(None);
        }
        let Some(slot) = Slot::acquire(&self.active, self.config.max_transfers) else {
            warn!("refusing {from}: {} transfers running", self.config.max_transfers);
            self.reply_error(from, ErrorCode::NotDefined, "server busy");
            return Ok(None);
        };

        let socket = Socket::bind((self.local_addr()?.ip(), 0))?;
        let root = match request.kind {
            RequestKind::Read => self.config.read_dir.clone(),
            RequestKind::Write => self.config.write_dir.clone(),
        };
        info!(
            "{from}: {:?} {} on {}",
            request.kind,
            request.display_name(),
            socket.local_addr()?
        );
        let handler = Handler {
            socket,
            peer: from,
            request,
            root,
            policy: self.config.transfer.policy(),
            _slot: slot,
        };
        let worker = thread::Builder::new()
            .name(format!("tftp-{from}"))
            .spawn(move || handler.run())?;
        Ok(Some(worker))
    }

    fn reply_error(&self, to: IpEndpoint, code: ErrorCode, message: &str) {
        if let Err(e) = self.socket.send_error(to, code, message) {
            warn!("could not send error to {to}: {e}");
        }
    }
}

/// One admitted transfer; released when its handler is dropped.
struct Slot(Arc<AtomicUsize>);

impl Slot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Slot> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Slot(Arc::clone(active)))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serves one request from its own socket.
struct Handler {
    socket: Socket,
    peer: IpEndpoint,
    request: Request,
    root: PathBuf,
    policy: RetryPolicy,
    _slot: Slot,
}

impl Handler {
    fn run(mut self) {
        let name = self.request.display_name();
        let kind = self.request.kind;
        let result = match kind {
            RequestKind::Read => self.serve_read(),
            RequestKind::Write => self.serve_write(),
        };
        match result {
            Ok(bytes) => info!("{}: {kind:?} {name} complete, {bytes} bytes", self.peer),
            Err(e) => warn!("{}: {kind:?} {name} failed: {e}", self.peer),
        }
    }

    fn serve_read(&mut self) -> Result<u64> {
        let path = match resolve(&self.root, &self.request.filename) {
            Ok(path) => path,
            Err(e) => return Err(self.refuse(e, "access violation")),
        };
        let file = match open_regular(&path) {
            Ok(file) => file,
            Err(e) => {
                let message = format!("File not found: {}", self.request.display_name());
                return Err(self.refuse(e, &message));
            }
        };
        let mut session = TransferSession::serve_read(self.peer, self.policy);
        self.socket.upload(&mut session, &mut BufReader::new(file))
    }

    fn serve_write(&mut self) -> Result<u64> {
        let path = match resolve(&self.root, &self.request.filename) {
            Ok(path) => path,
            Err(e) => return Err(self.refuse(e, "access violation")),
        };
        let partial = partial_path(&path, self.socket.local_addr()?.port());
        let file = match File::create(&partial) {
            Ok(file) => file,
            Err(source) => {
                let e = Error::Unavailable {
                    path: path.clone(),
                    source,
                };
                return Err(self.refuse(e, "cannot create file"));
            }
        };

        let mut writer = BufWriter::new(file);
        let result = TransferSession::serve_write(self.peer, self.policy, self.socket.now())
            .and_then(|mut session| self.socket.download(&mut session, &mut writer));
        drop(writer);
        match result {
            Ok(received) => {
                fs::rename(&partial, &path).map_err(|source| Error::Unavailable {
                    path: path.clone(),
                    source,
                })?;
                Ok(received)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }

    /// Tell the peer why its request cannot be served.
    fn refuse(&self, error: Error, message: &str) -> Error {
        if let Err(e) = self.socket.send_error(self.peer, error.code(), message) {
            warn!("could not send error to {}: {e}", self.peer);
        }
        error
    }
}

/// Map a requested filename to a path below `root`.
///
/// Only plain relative names are accepted; anything that could leave `root`
/// is refused as an access violation.
pub fn resolve(root: &Path, filename: &[u8]) -> Result<PathBuf> {
    let relative = Path::new(name_os_str(filename)?);
    let mut path = root.to_path_buf();
    let mut parts = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                parts += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(denied(relative));
            }
        }
    }
    if parts == 0 {
        return Err(denied(relative));
    }
    Ok(path)
}

fn denied(relative: &Path) -> Error {
    Error::Unavailable {
        path: relative.to_path_buf(),
        source: IoError::new(
            IoErrorKind::PermissionDenied,
            "path leaves the served directory",
        ),
    }
}

#[cfg(unix)]
fn name_os_str(filename: &[u8]) -> Result<&OsStr> {
    Ok(OsStr::from_bytes(filename))
}

#[cfg(not(unix))]
fn name_os_str(filename: &[u8]) -> Result<&OsStr> {
    std::str::from_utf8(filename)
        .map(OsStr::new)
        .map_err(|_| Error::Io(IoError::new(IoErrorKind::InvalidInput, "filename is not UTF-8")))
}

/// Open `path` for reading, treating anything but a regular file as absent.
fn open_regular(path: &Path) -> Result<File> {
    let unavailable = |source| Error::Unavailable {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(unavailable)?;
    let metadata = file.metadata().map_err(unavailable)?;
    if !metadata.is_file() {
        return Err(unavailable(IoError::new(
            IoErrorKind::NotFound,
            "not a regular file",
        )));
    }
    Ok(file)
}

/// Uploads are written beside their target and renamed into place on success.
fn partial_path(path: &Path, port: u16) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{port}.part"));
    path.with_file_name(name)
}
