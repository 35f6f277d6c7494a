//! Client and server settings.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use smoltcp::time::Duration as SmolDuration;

use crate::session::RetryPolicy;

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 2000;

/// Per-transfer timing, shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long to wait for the peer before resending the last packet.
    pub timeout: Duration,
    /// Resends allowed per block before the transfer fails with a timeout.
    pub max_retries: u8,
}

impl TransferConfig {
    /// No retransmission: the first timeout or sequencing fault ends the transfer.
    pub fn fail_fast(timeout: Duration) -> Self {
        TransferConfig {
            timeout,
            max_retries: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        RetryPolicy {
            timeout: SmolDuration::from_millis(millis.max(1)),
            max_retries: self.max_retries,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            timeout: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the dispatcher socket that receives requests.
    pub bind: SocketAddr,
    /// Files served to read requests live here.
    pub read_dir: PathBuf,
    /// Write requests land here.
    pub write_dir: PathBuf,
    /// Transfers allowed to run at once; further requests are refused.
    pub max_transfers: usize,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            read_dir: PathBuf::from("send"),
            write_dir: PathBuf::from("receive"),
            max_transfers: 64,
            transfer: TransferConfig::default(),
        }
    }
}
