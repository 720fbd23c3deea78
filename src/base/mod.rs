//! The wire-format codec.
//!
//! This module contains the small read-only view of DNS messages that the
//! resolver engine needs: the twelve octet header, the question section,
//! and enough record traversal to detect an OPT record in the additional
//! section. It deliberately stops there. Interpreting record data is the
//! business of whatever sits on top of the engine.

pub mod header;
pub mod iana;
pub mod message;

pub use self::header::Header;
pub use self::iana::{Rclass, Rcode, Rtype};
pub use self::message::{Message, ParseError, Question};
