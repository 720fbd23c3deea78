//! State of an in-flight query.

use crate::base::message::Message;
use crate::base::header::HEADER_LEN;
use crate::error::Error;
use crate::server::ConnKey;
use bytes::Bytes;
use std::time::Duration;

/// The key of a query in the channel's arena.
pub(crate) type QueryKey = usize;

/// The key of a query in the deadline order.
///
/// The sequence number keeps queries with equal deadlines apart.
pub(crate) type DeadlineKey = (Duration, u64);

/// The callback invoked exactly once with a query's outcome.
///
/// The second argument is the number of attempts that ran into their
/// deadline before the query completed.
pub type Callback = Box<dyn FnOnce(Result<Answer, Error>, usize)>;

//------------ Query ---------------------------------------------------------

/// A query submitted to a channel, tracked until completion.
///
/// The query lives in the channel's arena and is referenced by its key
/// from the id index, the deadline order, and the connection it was last
/// sent on.
pub(crate) struct Query {
    /// The transaction id, in host byte order.
    pub qid: u16,

    /// The serialized query with a leading two octet length prefix.
    ///
    /// TCP sends use the buffer as is, UDP sends skip the prefix.
    pub tcpbuf: Vec<u8>,

    /// The caller's completion callback.
    ///
    /// Taken out when invoked, which is what makes a second invocation
    /// impossible.
    pub callback: Option<Callback>,

    /// Where the query sits in the deadline order, if anywhere.
    pub deadline: Option<DeadlineKey>,

    /// The connection the pending attempt was sent on.
    pub conn: Option<ConnKey>,

    /// Number of attempts made so far.
    pub try_count: usize,

    /// Index of the server the last attempt was aimed at.
    pub server: usize,

    /// Per-server state, indexed like the channel's server list.
    pub server_info: Vec<QueryServerInfo>,

    /// Whether the query has been promoted to TCP.
    pub using_tcp: bool,

    /// The status a terminal failure will report.
    ///
    /// Starts out as [`Error::Timeout`] so that a query that never hears
    /// anything at all fails with the right cause, and is overwritten
    /// whenever something more specific happens.
    pub error_status: Error,

    /// Number of attempts that ran into their deadline.
    pub timeouts: usize,

    /// Whether retries are forbidden. Set when the query is cancelled.
    pub no_retries: bool,
}

impl Query {
    /// Creates a query around the given length-prefixed wire bytes.
    pub fn new(qid: u16, tcpbuf: Vec<u8>, nservers: usize) -> Self {
        Query {
            qid,
            tcpbuf,
            callback: None,
            deadline: None,
            conn: None,
            try_count: 0,
            server: 0,
            server_info: vec![QueryServerInfo::default(); nservers],
            using_tcp: false,
            error_status: Error::Timeout,
            timeouts: 0,
            no_retries: false,
        }
    }

    /// Returns the wire bytes without the length prefix.
    pub fn qbuf(&self) -> &[u8] {
        &self.tcpbuf[2..]
    }

    /// Strips a suffix of `count` octets off the wire bytes.
    ///
    /// Patches the length prefix so the buffer stays consistent.
    pub fn shrink_by(&mut self, count: usize) {
        debug_assert!(self.tcpbuf.len() >= count + 2 + HEADER_LEN);
        let new_len = self.tcpbuf.len() - count;
        self.tcpbuf.truncate(new_len);
        let wire_len = (new_len - 2) as u16;
        self.tcpbuf[..2].copy_from_slice(&wire_len.to_be_bytes());
    }
}

//------------ QueryServerInfo -----------------------------------------------

/// Per-server state of one query.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct QueryServerInfo {
    /// Avoid this server for the rest of the query's life.
    pub skip_server: bool,

    /// The TCP connection incarnation the query was last sent into.
    pub tcp_connection_generation: u64,
}

//------------ Answer --------------------------------------------------------

/// The response delivered to a completed query.
#[derive(Clone, Debug)]
pub struct Answer {
    /// The response message.
    message: Message<Bytes>,
}

impl Answer {
    /// Creates an answer from validated response bytes.
    pub(crate) fn from_wire(wire: &[u8]) -> Self {
        let message = Message::from_octets(Bytes::copy_from_slice(wire))
            .expect("answer length was validated on receipt");
        Answer { message }
    }

    /// Returns the response message.
    pub fn message(&self) -> &Message<Bytes> {
        &self.message
    }

    /// Returns the raw response bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.message.as_slice()
    }

    /// Converts the answer into the response message.
    pub fn into_message(self) -> Message<Bytes> {
        self.message
    }
}

impl AsRef<Message<Bytes>> for Answer {
    fn as_ref(&self) -> &Message<Bytes> {
        &self.message
    }
}

//============ Test ==========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shrink_patches_prefix() {
        let mut wire = vec![0x00, 0x17];
        wire.extend_from_slice(&[0u8; 12]);
        wire.extend_from_slice(&[1u8; 11]);
        let mut query = Query::new(7, wire, 1);
        query.shrink_by(11);
        assert_eq!(query.tcpbuf.len(), 14);
        assert_eq!(&query.tcpbuf[..2], &[0x00, 0x0C]);
        assert_eq!(query.qbuf().len(), 12);
    }
}
