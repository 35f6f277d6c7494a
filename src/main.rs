//! Command-line TFTP client and server.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use lockstep_tftp::{
    client::Client,
    config::{ServerConfig, TransferConfig, DEFAULT_PORT},
    error::{Error, Result},
    server::Server,
};

#[derive(Parser)]
#[command(name = "lockstep_tftp", version, about = "Lock-step TFTP over UDP")]
struct Cli {
    #[command(flatten)]
    transfer: TransferArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TransferArgs {
    /// Milliseconds to wait for the peer before resending
    #[arg(long, global = true, default_value_t = 2000, env = "TFTP_TIMEOUT_MS")]
    timeout_ms: u64,

    /// Resends per block before giving up (0 fails on the first fault)
    #[arg(long, global = true, default_value_t = 5, env = "TFTP_RETRIES")]
    retries: u8,
}

impl TransferArgs {
    fn config(&self) -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.retries,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve files until interrupted
    Serve {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)), env = "TFTP_BIND")]
        bind: SocketAddr,

        /// Directory read requests are served from
        #[arg(long, default_value = "send", env = "TFTP_READ_DIR")]
        read_dir: PathBuf,

        /// Directory write requests are stored in
        #[arg(long, default_value = "receive", env = "TFTP_WRITE_DIR")]
        write_dir: PathBuf,

        #[arg(long, default_value_t = 64)]
        max_transfers: usize,
    },
    /// Download a file (RRQ)
    Get {
        /// Server as host[:port]
        server: String,
        remote: String,
        /// Local path, defaults to the remote file name
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a file (WRQ)
    Put {
        /// Server as host[:port]
        server: String,
        local: PathBuf,
        /// Name on the server, defaults to the local file name
        #[arg(short, long)]
        remote: Option<String>,
    },
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let transfer = cli.transfer.config();

    match cli.command {
        Command::Serve {
            bind,
            read_dir,
            write_dir,
            max_transfers,
        } => {
            let mut server = Server::bind(ServerConfig {
                bind,
                read_dir,
                write_dir,
                max_transfers,
                transfer,
            })?;
            server.run()
        }
        Command::Get {
            server,
            remote,
            output,
        } => {
            let output = output.unwrap_or_else(|| {
                Path::new(&remote)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&remote))
            });
            let mut client = Client::connect(server_addr(&server)?, transfer)?;
            client.get(remote.as_bytes(), &output)?;
            Ok(())
        }
        Command::Put {
            server,
            local,
            remote,
        } => {
            let mut client = Client::connect(server_addr(&server)?, transfer)?;
            client.put(&local, remote.as_deref().map(str::as_bytes))?;
            Ok(())
        }
    }
}

/// Resolve `host[:port]`, falling back to the default port.
fn server_addr(server: &str) -> Result<SocketAddr> {
    let mut addrs = match server.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => (server, DEFAULT_PORT).to_socket_addrs()?,
    };
    addrs.next().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {server}"),
        ))
    })
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,lockstep_tftp=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
