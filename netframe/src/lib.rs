//! Framing helpers and connection supervision shared by the protocol
//! servers.
//!
//! Every server in this workspace speaks a different wire protocol, but
//! they keep tripping over the same three problems:
//!
//! * splitting a byte stream into lines while still being able to pull
//!   an exact number of raw bytes out of the same stream
//!   ([`scanner::Scanner`]),
//! * reading and writing big-endian integers and length-prefixed
//!   strings ([`wire`]),
//! * accepting connections behind a load balancer that speaks the
//!   PROXY protocol, and shutting down without dropping in-flight
//!   connections ([`proxy`], [`supervisor`]).

pub mod proxy;
pub mod scanner;
pub mod supervisor;
pub mod wire;

pub use scanner::Scanner;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token too long")]
    TokenTooLong,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("string field too long")]
    StringTooLong,

    #[error("malformed proxy header")]
    MalformedProxyHeader,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
