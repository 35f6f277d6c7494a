//! A lock-step TFTP (RFC 1350) client and server.
//!
//! The wire codec ([`packet`]) and the transfer state machine ([`session`])
//! need nothing beyond `core`; the UDP transport, client, and server live
//! behind the `std` feature.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod macros;

pub mod error;
pub mod packet;
pub mod session;

#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod socket;

#[cfg(feature = "std")]
pub mod client;
#[cfg(feature = "std")]
pub mod server;
