//! End-to-end transfers against a real server on loopback.

use std::{
    fs,
    net::{SocketAddr, UdpSocket},
    path::Path,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use lockstep_tftp::{
    client::Client,
    config::{ServerConfig, TransferConfig},
    error::Error,
    packet::{ErrorCode, Repr, DATA_SIZE},
    server::{Server, ShutdownHandle},
};
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    dir: TempDir,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    fn start_with(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            read_dir: dir.path().to_path_buf(),
            write_dir: dir.path().to_path_buf(),
            transfer: transfer_config(),
            ..Default::default()
        };
        configure(&mut config);
        let mut server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || server.run().unwrap());
        TestServer {
            addr,
            dir,
            shutdown,
            thread: Some(thread),
        }
    }

    fn client(&self) -> Client {
        Client::connect(self.addr, transfer_config()).unwrap()
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn transfer_config() -> TransferConfig {
    TransferConfig {
        timeout: Duration::from_millis(500),
        max_retries: 3,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn raw_socket() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    socket
}

fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 1024];
    let (len, from) = socket.recv_from(&mut buf).unwrap();
    (buf[..len].to_vec(), from)
}

fn encode(repr: Repr<'_>) -> Vec<u8> {
    repr.encode().unwrap().to_vec()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Uploads are renamed into place just after the final ack goes out.
fn stored(path: &Path, content: &[u8]) -> bool {
    wait_until(|| fs::read(path).map(|stored| stored == content).unwrap_or(false))
}

fn part_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
        .count()
}

#[test]
fn upload_then_download_round_trips() {
    let server = TestServer::start();
    let mut client = server.client();

    for len in [0, 1, 511, 512, 513, 1000, 1024, 5000] {
        let name = format!("file-{len}.bin");
        let content = pattern(len, len as u8);

        let sent = client.send_file(name.as_bytes(), &mut &content[..]).unwrap();
        assert_eq!(sent, len as u64);
        assert!(stored(&server.path(&name), &content), "length {len}");

        let mut received = Vec::new();
        let count = client.receive_file(name.as_bytes(), &mut received).unwrap();
        assert_eq!(count, len as u64);
        assert_eq!(received, content, "length {len}");
    }
    assert!(wait_until(|| part_files(server.dir.path()) == 0));
}

#[test]
fn get_and_put_use_local_files() {
    let server = TestServer::start();
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("notes.txt");
    let content = pattern(3000, 7);
    fs::write(&source, &content).unwrap();

    let mut client = server.client();
    client.put(&source, None).unwrap();
    assert!(stored(&server.path("notes.txt"), &content));

    let copy = local.path().join("copy.txt");
    client.get(b"notes.txt", &copy).unwrap();
    assert_eq!(fs::read(&copy).unwrap(), content);
}

#[test]
fn missing_file_is_reported_by_the_server() {
    let server = TestServer::start();
    let mut client = server.client();
    let mut received = Vec::new();

    match client.receive_file(b"nope.bin", &mut received) {
        Err(Error::Remote { code, message }) => {
            assert_eq!(code, ErrorCode::FileNotFound);
            assert_eq!(&message[..], b"File not found: nope.bin");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(received.is_empty());
}

#[test]
fn failed_get_removes_the_local_file() {
    let server = TestServer::start();
    let local = tempfile::tempdir().unwrap();
    let target = local.path().join("absent.bin");

    let err = server.client().get(b"absent.bin", &target).unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));
    assert!(!target.exists());
}

#[test]
fn missing_file_sends_one_error_and_no_data() {
    let server = TestServer::start();
    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Rrq {
                filename: b"ghost",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();

    let (packet, _) = recv(&socket);
    assert!(matches!(
        Repr::decode(&packet).unwrap(),
        Repr::Error {
            code: ErrorCode::FileNotFound,
            ..
        }
    ));

    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = [0u8; 1024];
    assert!(socket.recv_from(&mut buf).is_err(), "nothing may follow the error");
}

#[test]
fn thousand_byte_upload_on_the_wire() {
    let server = TestServer::start();
    let content = pattern(1000, 3);
    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Wrq {
                filename: b"wire.bin",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();

    let (ack, tid) = recv(&socket);
    assert_eq!(Repr::decode(&ack).unwrap(), Repr::Ack { block: 0 });
    assert_ne!(tid, server.addr, "transfers run on their own port");

    for (block, chunk) in (1u16..).zip(content.chunks(DATA_SIZE)) {
        socket
            .send_to(&encode(Repr::Data { block, data: chunk }), tid)
            .unwrap();
        let (ack, from) = recv(&socket);
        assert_eq!(from, tid);
        assert_eq!(Repr::decode(&ack).unwrap(), Repr::Ack { block });
    }

    assert!(stored(&server.path("wire.bin"), &content));
}

#[test]
fn thousand_byte_download_on_the_wire() {
    let server = TestServer::start();
    let content = pattern(1000, 9);
    fs::write(server.path("down.bin"), &content).unwrap();

    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Rrq {
                filename: b"down.bin",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();

    let mut blocks = Vec::new();
    let mut received = Vec::new();
    loop {
        let (packet, tid) = recv(&socket);
        let Repr::Data { block, data } = Repr::decode(&packet).unwrap() else {
            panic!("expected data");
        };
        blocks.push((block, data.len()));
        received.extend_from_slice(data);
        socket
            .send_to(&encode(Repr::Ack { block }), tid)
            .unwrap();
        if data.len() < DATA_SIZE {
            break;
        }
    }
    assert_eq!(blocks, [(1, 512), (2, 488)]);
    assert_eq!(received, content);
}

#[test]
fn exact_multiple_download_ends_with_empty_block() {
    let server = TestServer::start();
    fs::write(server.path("even.bin"), pattern(1024, 1)).unwrap();

    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Rrq {
                filename: b"even.bin",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();

    let mut sizes = Vec::new();
    loop {
        let (packet, tid) = recv(&socket);
        let Repr::Data { block, data } = Repr::decode(&packet).unwrap() else {
            panic!("expected data");
        };
        sizes.push(data.len());
        socket
            .send_to(&encode(Repr::Ack { block }), tid)
            .unwrap();
        if data.len() < DATA_SIZE {
            break;
        }
    }
    assert_eq!(sizes, [512, 512, 0]);
}

#[test]
fn concurrent_transfers_stay_isolated() {
    let server = TestServer::start();
    let first = pattern(40_000, 1);
    let second = pattern(40_000, 2);
    fs::write(server.path("one.bin"), &first).unwrap();
    fs::write(server.path("two.bin"), &second).unwrap();

    let downloads: Vec<_> = [("one.bin", first.clone()), ("two.bin", second.clone())]
        .into_iter()
        .map(|(name, expected)| {
            let mut client = server.client();
            thread::spawn(move || {
                let mut received = Vec::new();
                client.receive_file(name.as_bytes(), &mut received).unwrap();
                assert_eq!(received, expected, "{name}");
            })
        })
        .collect();

    let uploads: Vec<_> = [("up-one.bin", first.clone()), ("up-two.bin", second.clone())]
        .into_iter()
        .map(|(name, content)| {
            let mut client = server.client();
            thread::spawn(move || {
                client.send_file(name.as_bytes(), &mut &content[..]).unwrap();
            })
        })
        .collect();

    for handle in downloads.into_iter().chain(uploads) {
        handle.join().unwrap();
    }
    assert!(stored(&server.path("up-one.bin"), &first));
    assert!(stored(&server.path("up-two.bin"), &second));
}

#[test]
fn paths_outside_the_root_are_refused() {
    let server = TestServer::start();
    let mut client = server.client();

    let mut sink = Vec::new();
    let err = client.receive_file(b"../etc/passwd", &mut sink).unwrap_err();
    assert!(matches!(
        err,
        Error::Remote {
            code: ErrorCode::AccessViolation,
            ..
        }
    ));

    let err = client
        .send_file(b"../escaped.bin", &mut &b"data"[..])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Remote {
            code: ErrorCode::AccessViolation,
            ..
        }
    ));
    assert!(!server.dir.path().join("../escaped.bin").exists());
}

#[test]
fn unsupported_mode_is_refused() {
    let server = TestServer::start();
    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Rrq {
                filename: b"any",
                mode: "netascii",
            }),
            server.addr,
        )
        .unwrap();
    let (packet, from) = recv(&socket);
    assert_eq!(from, server.addr);
    assert!(matches!(
        Repr::decode(&packet).unwrap(),
        Repr::Error {
            code: ErrorCode::IllegalOperation,
            ..
        }
    ));
}

#[test]
fn non_request_at_the_dispatcher_is_refused() {
    let server = TestServer::start();
    let socket = raw_socket();
    socket.send_to(&[0, 4, 0, 1], server.addr).unwrap();
    let (packet, _) = recv(&socket);
    assert!(matches!(
        Repr::decode(&packet).unwrap(),
        Repr::Error {
            code: ErrorCode::IllegalOperation,
            ..
        }
    ));

    socket.send_to(&[0, 9, 0, 1], server.addr).unwrap();
    let (packet, _) = recv(&socket);
    assert!(matches!(
        Repr::decode(&packet).unwrap(),
        Repr::Error {
            code: ErrorCode::IllegalOperation,
            ..
        }
    ));
}

#[test]
fn busy_server_refuses_extra_transfers() {
    let server = TestServer::start_with(|config| {
        config.max_transfers = 1;
        config.transfer = TransferConfig {
            timeout: Duration::from_secs(1),
            max_retries: 1,
        };
    });
    fs::write(server.path("big.bin"), pattern(4096, 5)).unwrap();

    // Hold the only slot by never acknowledging.
    let holder = raw_socket();
    holder
        .send_to(
            &encode(Repr::Rrq {
                filename: b"big.bin",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();
    let (first, _) = recv(&holder);
    assert!(matches!(
        Repr::decode(&first).unwrap(),
        Repr::Data { block: 1, .. }
    ));

    let mut sink = Vec::new();
    match server.client().receive_file(b"big.bin", &mut sink) {
        Err(Error::Remote { code, message }) => {
            assert_eq!(code, ErrorCode::NotDefined);
            assert_eq!(&message[..], b"server busy");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn aborted_upload_leaves_nothing_behind() {
    let server = TestServer::start();
    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Wrq {
                filename: b"aborted.bin",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();
    let (_, tid) = recv(&socket);

    let full = [4u8; DATA_SIZE];
    socket
        .send_to(&encode(Repr::Data { block: 1, data: &full }), tid)
        .unwrap();
    let (ack, _) = recv(&socket);
    assert_eq!(Repr::decode(&ack).unwrap(), Repr::Ack { block: 1 });
    assert_eq!(part_files(server.dir.path()), 1);

    socket
        .send_to(
            &encode(Repr::Error {
                code: ErrorCode::DiskFull,
                message: b"giving up",
            }),
            tid,
        )
        .unwrap();

    assert!(wait_until(|| part_files(server.dir.path()) == 0));
    assert!(!server.path("aborted.bin").exists());
}

#[test]
fn strangers_get_unknown_tid_without_disturbing_the_transfer() {
    let server = TestServer::start();
    let content = pattern(700, 8);
    fs::write(server.path("shared.bin"), &content).unwrap();

    let socket = raw_socket();
    socket
        .send_to(
            &encode(Repr::Rrq {
                filename: b"shared.bin",
                mode: "octet",
            }),
            server.addr,
        )
        .unwrap();
    let (packet, tid) = recv(&socket);
    assert!(matches!(
        Repr::decode(&packet).unwrap(),
        Repr::Data { block: 1, .. }
    ));

    let stranger = raw_socket();
    stranger
        .send_to(&encode(Repr::Ack { block: 1 }), tid)
        .unwrap();
    let (reply, _) = recv(&stranger);
    assert!(matches!(
        Repr::decode(&reply).unwrap(),
        Repr::Error {
            code: ErrorCode::UnknownTransferId,
            ..
        }
    ));

    socket
        .send_to(&encode(Repr::Ack { block: 1 }), tid)
        .unwrap();
    let (packet, _) = recv(&socket);
    assert!(matches!(
        Repr::decode(&packet).unwrap(),
        Repr::Data { block: 2, data } if data.len() == 700 - DATA_SIZE
    ));
}

#[test]
fn silent_server_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = TransferConfig {
        timeout: Duration::from_millis(50),
        max_retries: 2,
    };
    let mut client = Client::connect(silent.local_addr().unwrap(), config).unwrap();
    let mut sink = Vec::new();
    let err = client.receive_file(b"anything", &mut sink).unwrap_err();
    assert!(matches!(err, Error::Timeout { block: 1 }));

    // The request itself was resent on every timeout.
    silent
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 64];
    let mut requests = 0;
    while silent.recv_from(&mut buf).is_ok() {
        requests += 1;
    }
    assert_eq!(requests, 3);
}
