//! # Relay Socks
//!
//! Shared socket plumbing for the relay proxy family. Every relay binary
//! fronts its traffic the same way: an optional transparent-redirect lookup,
//! a SOCKS5 handshake with the client, an upstream connection that is either
//! direct or chained through another SOCKS5 hop, and a raw byte splicer used
//! once a connection no longer needs any protocol-level attention.
//!
//! The pieces here are deliberately blocking; callers that need async wrap
//! the resulting `TcpStream`s themselves.

pub mod hostport;
pub mod origdst;
pub mod socks;
pub mod splice;

pub use hostport::{HostPort, Via};
pub use socks::{SocksError, SocksRequest};
