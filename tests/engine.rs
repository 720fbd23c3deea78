//! End-to-end tests of the query engine.
//!
//! The channel is driven with a fake clock and a scripted socket
//! provider, so every test controls time and the wire completely.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stub_resolv::clock::FakeClock;
use stub_resolv::io::{MockProvider, SocketHandle, Transport};
use stub_resolv::{Answer, Channel, Config, Error, Flags, ServerSpec};

const SERVER_A: &str = "127.0.0.1:5300";
const SERVER_B: &str = "127.0.0.2:5300";
const SERVER_C: &str = "127.0.0.3:5300";

fn addr(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

//------------ Outcome -------------------------------------------------------

/// Records every callback invocation of one query.
#[derive(Clone, Default)]
struct Outcome {
    calls: Arc<Mutex<Vec<(Result<Vec<u8>, Error>, usize)>>>,
}

impl Outcome {
    fn recorder(&self) -> impl FnOnce(Result<Answer, Error>, usize) + 'static {
        let calls = self.calls.clone();
        move |result, timeouts| {
            calls
                .lock()
                .unwrap()
                .push((result.map(|a| a.as_slice().to_vec()), timeouts));
        }
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn single(&self) -> (Result<Vec<u8>, Error>, usize) {
        let calls = self.calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "expected exactly one callback");
        calls[0].clone()
    }
}

//------------ Wire helpers --------------------------------------------------

/// A query for `example.com A IN` with a zero id and RD set.
fn build_query() -> Vec<u8> {
    let mut wire = vec![
        0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];
    wire.extend_from_slice(b"\x07example\x03com\x00");
    wire.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    wire
}

/// Like [`build_query`] but with an EDNS OPT record appended.
fn build_edns_query() -> Vec<u8> {
    let mut wire = build_query();
    wire[11] = 1; // arcount
    wire.extend_from_slice(&[0x00]); // root owner name
    wire.extend_from_slice(&41u16.to_be_bytes()); // OPT
    wire.extend_from_slice(&1280u16.to_be_bytes()); // payload size
    wire.extend_from_slice(&[0, 0, 0, 0]); // ttl
    wire.extend_from_slice(&0u16.to_be_bytes()); // rdlen
    wire
}

/// Turns a captured query into a response.
fn response_for(sent: &[u8], rcode: u8, tc: bool, answer: bool) -> Vec<u8> {
    let mut msg = sent.to_vec();
    msg[2] |= 0x80; // qr
    if tc {
        msg[2] |= 0x02;
    }
    msg[3] = (msg[3] & 0xF0) | (rcode & 0x0F);
    if answer {
        msg[7] = 1; // ancount
        msg.extend_from_slice(&[0xC0, 0x0C]); // name pointer
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        msg.extend_from_slice(&[0x00, 0x00, 0x0E, 0x10]); // ttl
        msg.extend_from_slice(&[0x00, 0x04, 93, 184, 216, 34]);
    }
    msg
}

/// Removes a trailing OPT record from a response.
fn strip_opt(mut msg: Vec<u8>) -> Vec<u8> {
    assert_eq!(msg[11], 1, "expected one additional record");
    msg[11] = 0;
    msg.truncate(msg.len() - 11);
    msg
}

/// Wraps a message in a two octet length prefix for TCP delivery.
fn tcp_frame(msg: &[u8]) -> Vec<u8> {
    let mut frame = (msg.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(msg);
    frame
}

//------------ Channel setup -------------------------------------------------

fn channel(
    servers: &[&str],
    tweak: impl FnOnce(&mut Config),
) -> (Channel, MockProvider, FakeClock) {
    let mock = MockProvider::new();
    let clock = FakeClock::new();
    let mut config = Config::default();
    config.servers =
        servers.iter().map(|s| ServerSpec::from(addr(s))).collect();
    tweak(&mut config);
    let channel =
        Channel::with_io(config, mock.clone(), clock.clone()).unwrap();
    (channel, mock, clock)
}

fn udp_handle(mock: &MockProvider, server: &str) -> SocketHandle {
    mock.lookup(Transport::Udp, addr(server))
        .expect("no UDP socket towards server")
}

fn tcp_handle(mock: &MockProvider, server: &str) -> SocketHandle {
    mock.lookup(Transport::Tcp, addr(server))
        .expect("no TCP socket towards server")
}

//============ Scenarios =====================================================

#[test]
fn udp_success() {
    let (mut chan, mock, clock) = channel(&[SERVER_A], |config| {
        config.timeout = Duration::from_millis(2000);
        config.tries = 1;
    });
    let outcome = Outcome::default();
    let qid = chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(udp);
    assert_eq!(sent.len(), 1);
    assert_eq!(u16::from_be_bytes([sent[0][0], sent[0][1]]), qid);

    clock.adjust(Duration::from_millis(50));
    let response = response_for(&sent[0], 0, false, true);
    mock.push_datagram(udp, addr(SERVER_A), &response);
    chan.process(&[udp], &[]);

    let (result, timeouts) = outcome.single();
    assert_eq!(result.unwrap(), response);
    assert_eq!(timeouts, 0);
    assert_eq!(chan.pending_queries(), 0);

    // Nothing fires later either.
    clock.adjust(Duration::from_secs(30));
    chan.process(&[], &[]);
    assert_eq!(outcome.count(), 1);
}

#[test]
fn udp_timeout_is_terminal_with_one_try() {
    let (mut chan, _mock, clock) = channel(&[SERVER_A], |config| {
        config.timeout = Duration::from_millis(2000);
        config.tries = 1;
    });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    clock.adjust(Duration::from_millis(2000));
    chan.process(&[], &[]);
    let (result, timeouts) = outcome.single();
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert_eq!(timeouts, 1);
    assert_eq!(chan.pending_queries(), 0);

    clock.adjust(Duration::from_secs(60));
    chan.process(&[], &[]);
    assert_eq!(outcome.count(), 1);
}

#[test]
fn servfail_moves_to_next_server() {
    let (mut chan, mock, _clock) =
        channel(&[SERVER_A, SERVER_B], |config| {
            config.timeout = Duration::from_millis(1000);
            config.tries = 1;
        });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp_a = udp_handle(&mock, SERVER_A);
    let sent_a = mock.sent(udp_a);
    assert_eq!(sent_a.len(), 1);

    // SERVFAIL from the first server must not complete the query.
    mock.push_datagram(
        udp_a,
        addr(SERVER_A),
        &response_for(&sent_a[0], 2, false, false),
    );
    chan.process(&[udp_a], &[]);
    assert_eq!(outcome.count(), 0);
    assert_eq!(chan.pending_queries(), 1);

    // The retry went to the second server.
    let udp_b = udp_handle(&mock, SERVER_B);
    let sent_b = mock.sent(udp_b);
    assert_eq!(sent_b.len(), 1);
    assert_eq!(sent_b[0], sent_a[0]);

    let response = response_for(&sent_b[0], 0, false, true);
    mock.push_datagram(udp_b, addr(SERVER_B), &response);
    chan.process(&[udp_b], &[]);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap(), response);
}

#[test]
fn servfail_everywhere_is_terminal() {
    let (mut chan, mock, _clock) =
        channel(&[SERVER_A, SERVER_B], |config| {
            config.tries = 1;
        });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    for server in [SERVER_A, SERVER_B] {
        let udp = udp_handle(&mock, server);
        let sent = mock.sent(udp);
        mock.push_datagram(
            udp,
            addr(server),
            &response_for(sent.last().unwrap(), 2, false, false),
        );
        chan.process(&[udp], &[]);
    }
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap_err(), Error::ServFail);
}

#[test]
fn mismatched_question_is_dropped_silently() {
    let (mut chan, mock, _clock) =
        channel(&[SERVER_A, SERVER_B], |config| {
            config.tries = 1;
        });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp_a = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(udp_a);

    // Right id, wrong question name.
    let mut bogus = response_for(&sent[0], 0, false, false);
    bogus[13..20].copy_from_slice(b"openple");
    mock.push_datagram(udp_a, addr(SERVER_A), &bogus);
    chan.process(&[udp_a], &[]);
    assert_eq!(outcome.count(), 0);
    assert_eq!(chan.pending_queries(), 1);
    // No resend happened either, the query still waits on server A.
    assert_eq!(mock.sent(udp_a).len(), 1);
    assert!(mock.lookup(Transport::Udp, addr(SERVER_B)).is_none());

    // A correctly matching response still completes the query.
    let response = response_for(&sent[0], 0, false, true);
    mock.push_datagram(udp_a, addr(SERVER_A), &response);
    chan.process(&[udp_a], &[]);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap(), response);
}

#[test]
fn wrong_source_address_is_dropped_silently() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |_| {});
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(udp);
    let response = response_for(&sent[0], 0, false, true);

    // Correct bytes, wrong sender.
    mock.push_datagram(udp, addr("127.0.0.9:5300"), &response);
    chan.process(&[udp], &[]);
    assert_eq!(outcome.count(), 0);
    assert_eq!(chan.pending_queries(), 1);

    mock.push_datagram(udp, addr(SERVER_A), &response);
    chan.process(&[udp], &[]);
    assert_eq!(outcome.count(), 1);
}

#[test]
fn formerr_without_opt_disables_edns_and_resends() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |config| {
        config.flags.insert(Flags::EDNS);
    });
    let outcome = Outcome::default();
    chan.send(&build_edns_query(), outcome.recorder()).unwrap();

    let udp = udp_handle(&mock, SERVER_A);
    let first = mock.sent(udp)[0].clone();
    let opt_len = 11;

    // FORMERR with the OPT record missing from the response.
    let formerr = strip_opt(response_for(&first, 1, false, false));
    mock.push_datagram(udp, addr(SERVER_A), &formerr);
    chan.process(&[udp], &[]);

    // EDNS is off for the rest of the channel's life.
    assert!(!chan.config().flags.contains(Flags::EDNS));
    assert_eq!(outcome.count(), 0);

    // The resent query is the original minus the OPT record, with a
    // zeroed ARCOUNT.
    let sent = mock.sent(udp);
    assert_eq!(sent.len(), 2);
    let resent = &sent[1];
    assert_eq!(resent.len(), first.len() - opt_len);
    assert_eq!(&resent[10..12], &[0, 0]);
    assert_eq!(&resent[..10], &first[..10]);
    assert_eq!(&resent[12..], &first[12..first.len() - opt_len]);

    // And it completes normally.
    let response = response_for(resent, 0, false, true);
    mock.push_datagram(udp, addr(SERVER_A), &response);
    chan.process(&[udp], &[]);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap(), response);
}

#[test]
fn truncation_promotes_to_tcp() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |_| {});
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(udp);
    mock.push_datagram(
        udp,
        addr(SERVER_A),
        &response_for(&sent[0], 0, true, false),
    );
    chan.process(&[udp], &[]);
    assert_eq!(outcome.count(), 0);

    // A TCP connection is open and wants to write.
    let tcp = tcp_handle(&mock, SERVER_A);
    let interest = chan
        .sockets()
        .into_iter()
        .find(|interest| interest.handle == tcp)
        .unwrap();
    assert!(interest.readable);
    assert!(interest.writable);

    // Flush the send queue: the very same query, length prefixed.
    chan.process(&[], &[tcp]);
    let stream = mock.sent_stream(tcp);
    assert_eq!(stream, tcp_frame(&sent[0]));
    assert!(!chan
        .sockets()
        .into_iter()
        .find(|interest| interest.handle == tcp)
        .unwrap()
        .writable);

    // Answer over TCP, delivered in two pieces to exercise reassembly.
    let response = response_for(&sent[0], 0, false, true);
    let frame = tcp_frame(&response);
    mock.push_stream(tcp, &frame[..3]);
    chan.process(&[tcp], &[]);
    assert_eq!(outcome.count(), 0);
    mock.push_stream(tcp, &frame[3..]);
    chan.process(&[tcp], &[]);
    let (result, timeouts) = outcome.single();
    assert_eq!(result.unwrap(), response);
    assert_eq!(timeouts, 0);
}

#[test]
fn igntc_accepts_truncated_response() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |config| {
        config.flags.insert(Flags::IGNTC);
    });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(udp);
    let truncated = response_for(&sent[0], 0, true, false);
    mock.push_datagram(udp, addr(SERVER_A), &truncated);
    chan.process(&[udp], &[]);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap(), truncated);
    assert!(mock.lookup(Transport::Tcp, addr(SERVER_A)).is_none());
}

#[test]
fn tcp_peer_close_requeues_on_fresh_connection() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |config| {
        config.flags.insert(Flags::USEVC);
    });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let first = tcp_handle(&mock, SERVER_A);
    chan.process(&[], &[first]);
    let sent = mock.sent_stream(first);

    // The peer closes on us.
    mock.push_eof(first);
    chan.process(&[first], &[]);
    assert!(!mock.is_open(first));
    assert_eq!(outcome.count(), 0);
    assert_eq!(chan.pending_queries(), 1);

    // The retry runs on a fresh connection to the same server.
    let second = tcp_handle(&mock, SERVER_A);
    assert_ne!(second, first);
    chan.process(&[], &[second]);
    assert_eq!(mock.sent_stream(second), sent);

    let response = response_for(&sent[2..], 0, false, true);
    mock.push_stream(second, &tcp_frame(&response));
    chan.process(&[second], &[]);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap(), response);
}

#[test]
fn attempts_are_bounded_by_servers_times_tries() {
    let (mut chan, mock, clock) =
        channel(&[SERVER_A, SERVER_B, SERVER_C], |config| {
            config.timeout = Duration::from_millis(1000);
            config.tries = 2;
        });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    for _ in 0..10 {
        clock.adjust(Duration::from_secs(10));
        chan.process(&[], &[]);
    }

    // Six attempts went out, a seventh never did.
    assert_eq!(mock.total_writes(), 6);
    let (result, timeouts) = outcome.single();
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert_eq!(timeouts, 6);
}

#[test]
fn rotate_spreads_queries_over_servers() {
    let (mut chan, mock, _clock) =
        channel(&[SERVER_A, SERVER_B], |config| {
            config.rotate = true;
        });
    let first = Outcome::default();
    let second = Outcome::default();
    chan.send(&build_query(), first.recorder()).unwrap();
    chan.send(&build_query(), second.recorder()).unwrap();

    let udp_a = udp_handle(&mock, SERVER_A);
    let udp_b = udp_handle(&mock, SERVER_B);
    assert_eq!(mock.sent(udp_a).len(), 1);
    assert_eq!(mock.sent(udp_b).len(), 1);

    // Independent ids for independent submissions.
    let qid_a = u16::from_be_bytes([
        mock.sent(udp_a)[0][0],
        mock.sent(udp_a)[0][1],
    ]);
    let qid_b = u16::from_be_bytes([
        mock.sent(udp_b)[0][0],
        mock.sent(udp_b)[0][1],
    ]);
    assert_ne!(qid_a, qid_b);
}

#[test]
fn udp_connection_reuse_is_capped() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |config| {
        config.udp_max_queries = 1;
    });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let first = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(first);
    mock.push_datagram(
        first,
        addr(SERVER_A),
        &response_for(&sent[0], 0, false, true),
    );
    chan.process(&[first], &[]);
    assert_eq!(outcome.count(), 1);

    // The used-up connection is gone, the next query gets a fresh one.
    assert!(!mock.is_open(first));
    let other = Outcome::default();
    chan.send(&build_query(), other.recorder()).unwrap();
    let second = udp_handle(&mock, SERVER_A);
    assert_ne!(second, first);
}

#[test]
fn refused_connection_falls_over_to_next_server() {
    let (mut chan, mock, _clock) =
        channel(&[SERVER_A, SERVER_B], |_| {});
    mock.refuse(addr(SERVER_A));

    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();
    assert_eq!(outcome.count(), 0);

    let udp_b = udp_handle(&mock, SERVER_B);
    let sent = mock.sent(udp_b);
    assert_eq!(sent.len(), 1);
    let response = response_for(&sent[0], 0, false, true);
    mock.push_datagram(udp_b, addr(SERVER_B), &response);
    chan.process(&[udp_b], &[]);
    assert_eq!(outcome.count(), 1);
}

#[test]
fn refused_everywhere_reports_the_true_cause() {
    let (mut chan, mock, _clock) =
        channel(&[SERVER_A, SERVER_B], |_| {});
    mock.refuse(addr(SERVER_A));
    mock.refuse(addr(SERVER_B));

    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap_err(), Error::ConnRefused);
}

#[test]
fn nocheckresp_delivers_refusals() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |config| {
        config.flags.insert(Flags::NOCHECKRESP);
    });
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    let udp = udp_handle(&mock, SERVER_A);
    let sent = mock.sent(udp);
    let servfail = response_for(&sent[0], 2, false, false);
    mock.push_datagram(udp, addr(SERVER_A), &servfail);
    chan.process(&[udp], &[]);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap(), servfail);
}

#[test]
fn cancel_ends_the_query_on_the_next_pass() {
    let (mut chan, _mock, _clock) = channel(&[SERVER_A], |_| {});
    let outcome = Outcome::default();
    let qid = chan.send(&build_query(), outcome.recorder()).unwrap();

    assert!(chan.cancel(qid));
    assert!(!chan.cancel(qid.wrapping_add(1)));
    assert_eq!(outcome.count(), 0);

    chan.process(&[], &[]);
    let (result, timeouts) = outcome.single();
    assert_eq!(result.unwrap_err(), Error::Cancelled);
    assert_eq!(timeouts, 0);
    assert_eq!(chan.pending_queries(), 0);
}

#[test]
fn cancel_all_is_immediate() {
    let (mut chan, _mock, _clock) = channel(&[SERVER_A], |_| {});
    let first = Outcome::default();
    let second = Outcome::default();
    chan.send(&build_query(), first.recorder()).unwrap();
    chan.send(&build_query(), second.recorder()).unwrap();

    chan.cancel_all();
    assert_eq!(first.single().0.unwrap_err(), Error::Cancelled);
    assert_eq!(second.single().0.unwrap_err(), Error::Cancelled);
    assert_eq!(chan.pending_queries(), 0);
}

#[test]
fn drop_reports_shutdown() {
    let (mut chan, _mock, _clock) = channel(&[SERVER_A], |_| {});
    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();

    drop(chan);
    let (result, _) = outcome.single();
    assert_eq!(result.unwrap_err(), Error::Shutdown);
}

#[test]
fn short_submissions_are_rejected() {
    let (mut chan, _mock, _clock) = channel(&[SERVER_A], |_| {});
    let outcome = Outcome::default();
    assert_eq!(
        chan.send(&[0u8; 11], outcome.recorder()),
        Err(Error::BadQuery)
    );
    assert_eq!(outcome.count(), 0);
    assert_eq!(chan.pending_queries(), 0);
}

#[test]
fn socket_state_callback_tracks_interest() {
    let (mut chan, mock, _clock) = channel(&[SERVER_A], |config| {
        config.flags.insert(Flags::USEVC);
    });
    let events: Arc<Mutex<Vec<(SocketHandle, bool, bool)>>> =
        Default::default();
    let sink = events.clone();
    chan.set_socket_state_callback(Box::new(move |handle, r, w| {
        sink.lock().unwrap().push((handle, r, w));
    }));

    let outcome = Outcome::default();
    chan.send(&build_query(), outcome.recorder()).unwrap();
    let tcp = tcp_handle(&mock, SERVER_A);
    {
        let events = events.lock().unwrap();
        // Opened read-only, then write interest once data got queued.
        assert_eq!(events.as_slice(), &[(tcp, true, false), (tcp, true, true)]);
    }

    chan.process(&[], &[tcp]);
    assert_eq!(events.lock().unwrap().last(), Some(&(tcp, true, false)));

    drop(chan);
    assert_eq!(events.lock().unwrap().last(), Some(&(tcp, false, false)));
}
