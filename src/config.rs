//! Channel configuration.

use crate::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

//------------ Configuration Constants ----------------------------------------

/// Default per-attempt timeout.
pub const DEF_TIMEOUT: Duration = Duration::from_millis(2000);

/// Minimum configuration value for the per-attempt timeout.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Maximum configuration value for the per-attempt timeout.
const MAX_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of tries per server.
pub const DEF_TRIES: usize = 3;

/// Minimum allowed configuration value for tries.
const MIN_TRIES: usize = 1;

/// Maximum allowed configuration value for tries.
const MAX_TRIES: usize = 100;

/// Default port for UDP and TCP transports.
pub const DEF_PORT: u16 = 53;

/// Default EDNS UDP payload size, as suggested in RFC 2671.
pub const EDNS_PACKET_SZ: u16 = 1280;

/// Maximum local limit for the EDNS packet size.
pub const MAX_EDNS_SZ: u16 = 4096;

/// Fixed size of an EDNS OPT record.
pub const EDNS_FIXED_SZ: usize = 11;

/// Maximum size of a plain DNS datagram.
pub const PACKET_SZ: usize = 512;

//------------ Flags ---------------------------------------------------------

/// Behavior flags of a channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags {
    /// The raw bits.
    bits: u16,
}

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags { bits: 0 };

    /// Accept truncated responses instead of retrying over TCP.
    pub const IGNTC: Flags = Flags { bits: 0x0001 };

    /// Deliver SERVFAIL, NOTIMP, and REFUSED responses to the caller
    /// instead of skipping to the next server.
    pub const NOCHECKRESP: Flags = Flags { bits: 0x0002 };

    /// Submitted queries carry an EDNS OPT record.
    pub const EDNS: Flags = Flags { bits: 0x0004 };

    /// Only use the first configured server.
    pub const PRIMARY: Flags = Flags { bits: 0x0008 };

    /// Always use TCP, never UDP.
    pub const USEVC: Flags = Flags { bits: 0x0010 };

    /// Returns whether all flags in `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Sets all flags in `other`.
    pub fn insert(&mut self, other: Flags) {
        self.bits |= other.bits;
    }

    /// Clears all flags in `other`.
    pub fn remove(&mut self, other: Flags) {
        self.bits &= !other.bits;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, other: Flags) -> Flags {
        Flags {
            bits: self.bits | other.bits,
        }
    }
}

//------------ ServerSpec ----------------------------------------------------

/// The address of one upstream server.
///
/// A port of zero means the channel's default port for that transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerSpec {
    /// The server's address.
    pub addr: IpAddr,

    /// The UDP port, zero for the channel default.
    pub udp_port: u16,

    /// The TCP port, zero for the channel default.
    pub tcp_port: u16,
}

impl ServerSpec {
    /// Creates a spec using the channel's default ports.
    pub fn new(addr: IpAddr) -> Self {
        ServerSpec {
            addr,
            udp_port: 0,
            tcp_port: 0,
        }
    }
}

impl From<IpAddr> for ServerSpec {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr)
    }
}

impl From<SocketAddr> for ServerSpec {
    fn from(addr: SocketAddr) -> Self {
        ServerSpec {
            addr: addr.ip(),
            udp_port: addr.port(),
            tcp_port: addr.port(),
        }
    }
}

//------------ Config --------------------------------------------------------

/// User configuration variables for a channel.
#[derive(Clone, Debug)]
pub struct Config {
    /// Behavior flags.
    pub flags: Flags,

    /// Timeout of the first attempt at each server.
    ///
    /// Later attempts double the timeout for every full pass through the
    /// server list.
    pub timeout: Duration,

    /// Number of tries per server.
    pub tries: usize,

    /// Threshold of dots at which a name is looked up as-is first.
    ///
    /// Carried for the benefit of search-list processing built on top of
    /// the channel. The engine itself does not consult it.
    pub ndots: usize,

    /// Rotate through servers between submissions.
    pub rotate: bool,

    /// Default UDP port for servers that do not name one.
    pub udp_port: u16,

    /// Default TCP port for servers that do not name one.
    pub tcp_port: u16,

    /// Advertised EDNS UDP payload size.
    pub edns_payload_size: u16,

    /// Maximum number of queries sent on one UDP connection.
    ///
    /// Zero means unlimited.
    pub udp_max_queries: usize,

    /// The upstream servers, tried in order.
    ///
    /// An empty list falls back to a single server on the IPv4 loopback
    /// address.
    pub servers: Vec<ServerSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flags: Flags::NONE,
            timeout: DEF_TIMEOUT,
            tries: DEF_TRIES,
            ndots: 1,
            rotate: false,
            udp_port: DEF_PORT,
            tcp_port: DEF_PORT,
            edns_payload_size: EDNS_PACKET_SZ,
            udp_max_queries: 0,
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Returns the configured servers, falling back to loopback.
    pub(crate) fn effective_servers(&self) -> Vec<ServerSpec> {
        let mut servers = if self.servers.is_empty() {
            vec![ServerSpec::new(IpAddr::V4(Ipv4Addr::LOCALHOST))]
        } else {
            self.servers.clone()
        };
        if self.flags.contains(Flags::PRIMARY) {
            servers.truncate(1);
        }
        servers
    }
}

/// Check if a config is valid.
pub(crate) fn check_config(config: &Config) -> Result<(), Error> {
    if config.timeout < MIN_TIMEOUT || config.timeout > MAX_TIMEOUT {
        return Err(Error::BadConfig("timeout"));
    }
    if config.tries < MIN_TRIES || config.tries > MAX_TRIES {
        return Err(Error::BadConfig("tries"));
    }
    if config.ndots == 0 {
        return Err(Error::BadConfig("ndots"));
    }
    if config.edns_payload_size < PACKET_SZ as u16
        || config.edns_payload_size > MAX_EDNS_SZ
    {
        return Err(Error::BadConfig("edns_payload_size"));
    }
    Ok(())
}

//============ Test ==========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(check_config(&Config::default()).is_ok());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut config = Config::default();
        config.timeout = Duration::ZERO;
        assert_eq!(check_config(&config), Err(Error::BadConfig("timeout")));

        let mut config = Config::default();
        config.tries = 0;
        assert_eq!(check_config(&config), Err(Error::BadConfig("tries")));

        let mut config = Config::default();
        config.edns_payload_size = 100;
        assert_eq!(
            check_config(&config),
            Err(Error::BadConfig("edns_payload_size"))
        );
    }

    #[test]
    fn flags_ops() {
        let mut flags = Flags::EDNS | Flags::IGNTC;
        assert!(flags.contains(Flags::EDNS));
        assert!(flags.contains(Flags::IGNTC));
        assert!(!flags.contains(Flags::PRIMARY));
        flags.remove(Flags::EDNS);
        assert!(!flags.contains(Flags::EDNS));
        flags.insert(Flags::USEVC);
        assert!(flags.contains(Flags::USEVC));
    }

    #[test]
    fn primary_trims_server_list() {
        let mut config = Config::default();
        config.servers = vec![
            ServerSpec::new("192.0.2.1".parse().unwrap()),
            ServerSpec::new("192.0.2.2".parse().unwrap()),
        ];
        config.flags.insert(Flags::PRIMARY);
        assert_eq!(config.effective_servers().len(), 1);
    }

    #[test]
    fn empty_server_list_falls_back_to_loopback() {
        let servers = Config::default().effective_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
