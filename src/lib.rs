//! An event-driven stub DNS resolver engine.
//!
//! This crate contains the client side machinery of a stub resolver: it
//! accepts pre-serialized DNS queries, multiplexes them over one or more
//! upstream name servers via UDP and TCP, honors retry, timeout, and
//! fallback policy, matches replies back to their originating queries,
//! and delivers each outcome to a per-query callback exactly once.
//!
//! The engine does not run an event loop of its own. The caller registers
//! the sockets reported by [`Channel::sockets`] with whatever multiplex
//! primitive it likes, and feeds readiness back through
//! [`Channel::process`]. Time is pulled from an injectable [`clock::Clock`]
//! and all socket work goes through an injectable [`io::SocketProvider`],
//! so the whole engine can be driven deterministically in tests.
//!
//! What this crate does not do: read system resolver configuration, apply
//! search lists, parse record data, cache answers, validate DNSSEC, or
//! recurse. It is the engine underneath all of that.
//!
//! # Example
//!
//! ```no_run
//! use stub_resolv::{Channel, Config, ServerSpec};
//!
//! let mut config = Config::default();
//! config.servers = vec![ServerSpec::new("192.0.2.53".parse().unwrap())];
//! let mut channel = Channel::new(config).unwrap();
//!
//! // A pre-serialized query for `example.com A IN`; the channel patches
//! // in a fresh id.
//! let mut wire = vec![
//!     0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
//!     0x00, 0x00,
//! ];
//! wire.extend_from_slice(b"\x07example\x03com\x00");
//! wire.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
//! channel.send(&wire, |result, timeouts| {
//!     match result {
//!         Ok(answer) => println!("{}", answer.message().header()),
//!         Err(err) => println!("failed after {} timeouts: {}", timeouts, err),
//!     }
//! }).unwrap();
//!
//! // Drive the engine until the callback has fired.
//! while channel.pending_queries() > 0 {
//!     let sockets = channel.sockets();
//!     // ... poll the sockets, sleeping at most channel.timeout() ...
//!     let readable: Vec<_> =
//!         sockets.iter().map(|interest| interest.handle).collect();
//!     let writable: Vec<_> = sockets
//!         .iter()
//!         .filter(|interest| interest.writable)
//!         .map(|interest| interest.handle)
//!         .collect();
//!     channel.process(&readable, &writable);
//! }
//! ```

pub mod base;
pub mod buf;
pub mod clock;
pub mod config;
pub mod error;
pub mod io;

mod channel;
mod process;
mod query;
mod server;

pub use self::channel::{
    Channel, SocketConfigCallback, SocketCreateCallback, SocketStateCallback,
};
pub use self::config::{Config, Flags, ServerSpec};
pub use self::error::Error;
pub use self::query::{Answer, Callback};
