//! The query engine.
//!
//! Something interesting happened on the wire, or time passed. The
//! functions here see what is up and respond accordingly: they write
//! queued TCP data, read and frame inbound traffic, match responses back
//! to queries, and walk expired deadlines. All of them are driven from
//! [`Channel::process`].

use crate::base::header::{Header, ARCOUNT_OFF, HEADER_LEN};
use crate::base::iana::Rcode;
use crate::base::message::Message;
use crate::buf::OctetBuf;
use crate::channel::Channel;
use crate::config::{Flags, EDNS_FIXED_SZ, MAX_EDNS_SZ, PACKET_SZ};
use crate::error::Error;
use crate::io::SocketHandle;
use crate::query::{Answer, QueryKey};
use crate::server::ConnKey;
use std::io;
use std::time::Duration;
use tracing::{debug, trace, warn};

impl Channel {
    /// Sends or re-sends a query towards its current server.
    ///
    /// The query's serialized bytes and server index are already in
    /// place. Whatever happens, the query leaves this function either
    /// installed in all indexes with a fresh deadline, re-routed through
    /// [`next_server`], or terminated.
    ///
    /// [`next_server`]: Self::next_server
    pub(crate) fn send_query(
        &mut self,
        key: QueryKey,
        now: Duration,
    ) -> Result<(), Error> {
        let server_idx = self.queries[key].server;

        let conn_key = if self.queries[key].using_tcp {
            let conn_key = match self.servers[server_idx].tcp_conn {
                Some(conn_key) => conn_key,
                None => match self.open_connection(server_idx, true) {
                    Ok(conn_key) => conn_key,
                    Err(err @ (Error::ConnRefused | Error::BadFamily)) => {
                        // Per-server trouble, somebody else may do better.
                        self.queries[key].error_status = err;
                        self.skip_server(key, server_idx);
                        return self.next_server(key, now);
                    }
                    Err(err) => {
                        self.end_query(key, Err(err));
                        return Err(err);
                    }
                },
            };

            let prior_len = self.servers[server_idx].tcp_send.len();
            let wire = &self.queries[key].tcpbuf;
            self.servers[server_idx].tcp_send.append_slice(wire);
            if prior_len == 0 {
                // The send queue went from empty to non-empty, the
                // socket needs write readiness now.
                let handle = self.conns[conn_key].handle;
                self.notify_socket_state(handle, true, true);
            }
            let generation =
                self.servers[server_idx].tcp_connection_generation;
            self.queries[key].server_info[server_idx]
                .tcp_connection_generation = generation;
            conn_key
        } else {
            let mut conn_key =
                self.servers[server_idx].connections.front().copied();
            if let Some(found) = conn_key {
                let conn = &self.conns[found];
                // Neither the TCP connection nor a used-up UDP
                // connection is fit for reuse.
                if conn.is_tcp
                    || (self.config.udp_max_queries > 0
                        && conn.total_queries >= self.config.udp_max_queries)
                {
                    conn_key = None;
                }
            }
            let conn_key = match conn_key {
                Some(conn_key) => conn_key,
                None => match self.open_connection(server_idx, false) {
                    Ok(conn_key) => conn_key,
                    Err(err @ (Error::ConnRefused | Error::BadFamily)) => {
                        self.queries[key].error_status = err;
                        self.skip_server(key, server_idx);
                        return self.next_server(key, now);
                    }
                    Err(err) => {
                        self.end_query(key, Err(err));
                        return Err(err);
                    }
                },
            };

            let handle = self.conns[conn_key].handle;
            let sent =
                self.provider.write(handle, self.queries[key].qbuf());
            let short = match sent {
                Ok(sent) => sent != self.queries[key].qbuf().len(),
                Err(err) => {
                    warn!(%handle, %err, "UDP send failed");
                    true
                }
            };
            if short {
                self.skip_server(key, server_idx);
                return self.next_server(key, now);
            }
            conn_key
        };

        // Compute the deadline of this attempt and move the query to its
        // slot in the deadline order.
        let timeplus = compute_timeplus(
            self.config.timeout,
            self.queries[key].try_count,
            self.servers.len(),
        );
        let deadline = now.checked_add(timeplus).unwrap_or(Duration::MAX);
        if let Some(old) = self.queries[key].deadline.take() {
            self.queries_by_timeout.remove(&old);
        }
        let seq = self.next_deadline_seq();
        self.queries_by_timeout.insert((deadline, seq), key);
        self.queries[key].deadline = Some((deadline, seq));

        // Rebind the query to the connection the attempt went out on.
        if let Some(old) = self.queries[key].conn.take() {
            if let Some(conn) = self.conns.get_mut(old) {
                conn.queries.remove(&key);
            }
        }
        let conn = &mut self.conns[conn_key];
        conn.queries.insert(key);
        conn.total_queries += 1;
        self.queries[key].conn = Some(conn_key);
        Ok(())
    }

    /// Moves a query on to the next usable server, or ends it.
    ///
    /// Each server gets its configured number of tries. A server is
    /// passed over if it failed this query before, or if a TCP retry
    /// would go into the very connection incarnation that already carries
    /// the query.
    pub(crate) fn next_server(
        &mut self,
        key: QueryKey,
        now: Duration,
    ) -> Result<(), Error> {
        let nservers = self.servers.len();
        let max_attempts = nservers * self.config.tries;
        loop {
            {
                let query = &mut self.queries[key];
                query.try_count += 1;
                if query.try_count >= max_attempts || query.no_retries {
                    break;
                }
                query.server = (query.server + 1) % nservers;
            }
            let query = &self.queries[key];
            let server_idx = query.server;
            let info = query.server_info[server_idx];
            let unusable = info.skip_server
                || (query.using_tcp
                    && info.tcp_connection_generation
                        == self.servers[server_idx]
                            .tcp_connection_generation);
            if !unusable {
                return self.send_query(key, now);
            }
            // Even over TCP one try is not enough. Servers time out our
            // connection just as we send, or die, or drop the request on
            // the floor, so keep looping through the list.
        }

        // All attempts to perform the query failed.
        let status = self.queries[key].error_status;
        self.end_query(key, Err(status));
        Err(status)
    }

    /// Marks a server as unusable for one query.
    pub(crate) fn skip_server(&mut self, key: QueryKey, server_idx: usize) {
        // With a single server there is nothing to skip to. Retrying the
        // one server we have is the only hope, perhaps we just got
        // unlucky and the retry will work.
        if self.servers.len() > 1 {
            self.queries[key].server_info[server_idx].skip_server = true;
        }
    }

    /// Fires every deadline that has passed.
    pub(crate) fn process_timeouts(&mut self, now: Duration) {
        loop {
            let (deadline, key) = match self.queries_by_timeout.iter().next()
            {
                Some((&(deadline, _), &key)) => (deadline, key),
                None => break,
            };
            // The order is ascending, so the first pending deadline
            // decides. A deadline equal to now has expired.
            if deadline > now {
                break;
            }
            {
                let query = &mut self.queries[key];
                if !query.no_retries {
                    query.error_status = Error::Timeout;
                    query.timeouts += 1;
                }
                trace!(qid = %query.qid, "attempt timed out");
            }
            let handle =
                self.queries[key].conn.map(|conn| self.conns[conn].handle);
            let _ = self.next_server(key, now);
            // A timeout is one of the places where an idle connection can
            // become eligible for cleanup.
            if let Some(handle) = handle {
                self.check_cleanup_conn(handle);
            }
        }
    }

    /// Tears down a broken connection and requeues its queries.
    pub(crate) fn handle_error(&mut self, conn_key: ConnKey, now: Duration) {
        // Steal the query list and close the connection first. That way
        // nothing gets requeued onto the broken connection.
        let stolen: Vec<QueryKey> =
            self.conns[conn_key].queries.drain().collect();
        let server_idx = self.conns[conn_key].server;
        for &key in &stolen {
            self.queries[key].conn = None;
        }
        self.close_connection(conn_key);

        for key in stolen {
            debug_assert_eq!(self.queries[key].server, server_idx);
            self.skip_server(key, server_idx);
            let _ = self.next_server(key, now);
        }
    }

    /// Writes queued TCP data for every server whose socket is writable.
    pub(crate) fn write_tcp_data(
        &mut self,
        write: &[SocketHandle],
        now: Duration,
    ) {
        if write.is_empty() {
            return;
        }
        for server_idx in 0..self.servers.len() {
            let conn_key = match self.servers[server_idx].tcp_conn {
                Some(conn_key) => conn_key,
                None => continue,
            };
            if self.servers[server_idx].tcp_send.is_empty() {
                continue;
            }
            let handle = self.conns[conn_key].handle;
            if !write.contains(&handle) {
                continue;
            }
            let result = self
                .provider
                .write(handle, self.servers[server_idx].tcp_send.peek());
            match result {
                Ok(written) if written > 0 => {
                    self.servers[server_idx].tcp_send.consume(written);
                    if self.servers[server_idx].tcp_send.is_empty() {
                        // Everything is out, write interest is over.
                        self.notify_socket_state(handle, true, false);
                    }
                }
                Ok(_) => self.handle_error(conn_key, now),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(%handle, %err, "TCP write failed");
                    self.handle_error(conn_key, now);
                }
            }
        }
    }

    /// Reads every socket the caller reported as readable.
    pub(crate) fn read_packets(
        &mut self,
        read: &[SocketHandle],
        now: Duration,
    ) {
        for &handle in read {
            // The handle may already be gone, closed while an earlier
            // one was processed.
            let conn_key = match self.conn_by_socket.get(&handle) {
                Some(&conn_key) => conn_key,
                None => continue,
            };
            if self.conns[conn_key].is_tcp {
                self.read_tcp(conn_key, now);
            } else {
                self.read_udp(conn_key, now);
            }
        }
    }

    /// Drains a readable TCP connection and processes complete frames.
    fn read_tcp(&mut self, conn_key: ConnKey, now: Duration) {
        let handle = self.conns[conn_key].handle;
        let server_idx = self.conns[conn_key].server;
        let mut chunk = [0u8; 512];
        loop {
            let count = match self.provider.recv(handle, &mut chunk) {
                Ok(0) => {
                    debug!(%handle, "TCP peer closed the connection");
                    self.handle_error(conn_key, now);
                    return;
                }
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%handle, %err, "TCP read failed");
                    self.handle_error(conn_key, now);
                    return;
                }
            };
            self.servers[server_idx]
                .tcp_parser
                .append_slice(&chunk[..count]);

            while let Some(frame) =
                next_tcp_frame(&mut self.servers[server_idx].tcp_parser)
            {
                self.process_answer(&frame, conn_key, true, now);
                // Processing the answer may have closed this very
                // connection. Check before looking at the parser again.
                if self.conn_by_socket.get(&handle) != Some(&conn_key) {
                    return;
                }
            }
        }
    }

    /// Drains a readable UDP connection, one datagram at a time.
    fn read_udp(&mut self, conn_key: ConnKey, now: Duration) {
        let handle = self.conns[conn_key].handle;
        let server_ip = self.servers[self.conns[conn_key].server].addr;
        let mut buf = [0u8; MAX_EDNS_SZ as usize + 1];
        loop {
            match self.provider.recv_from(handle, &mut buf) {
                Ok((0, _)) => {
                    // UDP is connectionless, a zero length datagram is
                    // just that and not an end of file.
                }
                Ok((count, from)) => {
                    if from.ip() != server_ip {
                        // Wrong sender. Someone may be attempting cache
                        // poisoning; never let this reach a query.
                        debug!(
                            %handle, %from,
                            "dropping datagram from unexpected source"
                        );
                    } else {
                        self.process_answer(&buf[..count], conn_key, false, now);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%handle, %err, "UDP read failed");
                    self.handle_error(conn_key, now);
                    return;
                }
            }
            // Processing the answer may have closed the connection.
            if self.conn_by_socket.get(&handle) != Some(&conn_key) {
                return;
            }
        }
    }

    /// Handles one candidate response arriving on a connection.
    pub(crate) fn process_answer(
        &mut self,
        abuf: &[u8],
        conn_key: ConnKey,
        via_tcp: bool,
        now: Duration,
    ) {
        // Cache these, re-sending the query below may reorganize the
        // connection list.
        let server_idx = self.conns[conn_key].server;
        let handle = self.conns[conn_key].handle;

        let msg = match Message::from_octets(abuf) {
            Ok(msg) => msg,
            Err(err) => {
                trace!(%handle, %err, "dropping unparseable response");
                return;
            }
        };
        if msg.validate().is_err() {
            trace!(%handle, "dropping malformed response");
            return;
        }

        // Find the query this response belongs to.
        let qid = msg.header().id();
        let key = match self.queries_by_qid.get(&qid) {
            Some(&key) => key,
            None => {
                trace!(%handle, qid = %qid, "response matches no query");
                return;
            }
        };

        // The id alone is not proof. The response must echo the very
        // question we asked or it is treated as hostile and dropped.
        {
            let query = &self.queries[key];
            let qmsg = match Message::from_octets(query.qbuf()) {
                Ok(qmsg) => qmsg,
                Err(_) => return,
            };
            if !qmsg.same_questions(&msg) {
                debug!(
                    %handle, qid = %qid,
                    "response question does not match query"
                );
                return;
            }
        }

        // The attempt is answered, detach it from its connection. The
        // connection cleanup itself waits until we know whether a resend
        // goes out first.
        if let Some(conn) = self.queries[key].conn.take() {
            if let Some(conn) = self.conns.get_mut(conn) {
                conn.queries.remove(&key);
            }
        }

        let mut packetsz = PACKET_SZ;
        if self.config.flags.contains(Flags::EDNS) {
            packetsz = usize::from(self.config.edns_payload_size);

            // A FORMERR without an OPT record means the responder does
            // not understand EDNS at all. Strip the OPT record off the
            // query, stop using EDNS on this channel, and try again.
            if msg.header().rcode() == Rcode::FormErr
                && !msg.has_opt().unwrap_or(false)
            {
                let query = &mut self.queries[key];
                let strippable = query.tcpbuf.len()
                    >= 2 + HEADER_LEN + EDNS_FIXED_SZ
                    && Header::for_message_slice(query.qbuf()).arcount() > 0;
                if strippable {
                    query.shrink_by(EDNS_FIXED_SZ);
                    query.tcpbuf[2 + ARCOUNT_OFF..2 + ARCOUNT_OFF + 2]
                        .copy_from_slice(&[0, 0]);
                    self.config.flags.remove(Flags::EDNS);
                    debug!(qid = %qid, "server speaks no EDNS, disabling");
                    let _ = self.send_query(key, now);
                    self.check_cleanup_conn(handle);
                    return;
                }
            }
        }

        // A truncated UDP response is not accepted. Promote the query to
        // TCP and try again; if it already runs on TCP, drop the response
        // and let the deadline deal with it.
        if (msg.header().tc() || abuf.len() > packetsz)
            && !via_tcp
            && !self.config.flags.contains(Flags::IGNTC)
        {
            if !self.queries[key].using_tcp {
                self.queries[key].using_tcp = true;
                let _ = self.send_query(key, now);
            }
            self.check_cleanup_conn(handle);
            return;
        }

        // Unless the caller asked for them, refusal codes mean this
        // server is no good for this query.
        if !self.config.flags.contains(Flags::NOCHECKRESP) {
            let status = match msg.header().rcode() {
                Rcode::ServFail => Some(Error::ServFail),
                Rcode::NotImp => Some(Error::NotImp),
                Rcode::Refused => Some(Error::Refused),
                _ => None,
            };
            if let Some(status) = status {
                debug!(
                    %handle, qid = %qid, rcode = %msg.header().rcode(),
                    "server refused the query"
                );
                self.queries[key].error_status = status;
                self.skip_server(key, server_idx);
                // Only move on if no newer attempt is already underway
                // at a different server.
                if self.queries[key].server == server_idx {
                    let _ = self.next_server(key, now);
                }
                self.check_cleanup_conn(handle);
                return;
            }
        }

        let answer = Answer::from_wire(abuf);
        self.end_query(key, Ok(answer));
        self.check_cleanup_conn(handle);
    }
}

//------------ Helpers -------------------------------------------------------

/// Computes the timeout of an attempt.
///
/// For each complete trip through the server list the configured timeout
/// doubles. The shift is only applied while every bit it would push out
/// is zero; beyond that the value pins at the maximum instead of
/// wrapping.
fn compute_timeplus(
    base: Duration,
    try_count: usize,
    nservers: usize,
) -> Duration {
    let shift = (try_count / nservers.max(1)) as u32;
    let millis = base.as_millis().min(u128::from(u64::MAX)) as u64;
    if shift < 64 && millis >> (63 - shift) == 0 {
        Duration::from_millis(millis << shift)
    } else {
        Duration::from_millis(u64::MAX)
    }
}

/// Pulls one length-prefixed DNS message out of the reassembly buffer.
///
/// Returns `None` and leaves the buffer untouched while the frame is
/// still incomplete.
fn next_tcp_frame(parser: &mut OctetBuf) -> Option<Vec<u8>> {
    parser.tag();
    let len = match parser.fetch_be16() {
        Some(len) => usize::from(len),
        None => {
            parser.rollback_tag();
            return None;
        }
    };
    if !parser.consume(len) {
        parser.rollback_tag();
        return None;
    }
    // Strip the two length octets off the front.
    let frame = parser.tagged()[2..].to_vec();
    parser.clear_tag();
    Some(frame)
}

//============ Test ==========================================================
