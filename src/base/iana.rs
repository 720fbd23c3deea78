//! DNS parameter types.

use core::fmt;

//------------ Rcode ---------------------------------------------------------

/// A DNS response code.
///
/// The engine only ever branches on a handful of codes, so everything else
/// is kept in its raw form via the `Other` variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rcode {
    /// No error condition.
    NoError,

    /// The server was unable to interpret the query.
    FormErr,

    /// The server encountered an internal failure.
    ServFail,

    /// The queried name does not exist.
    NXDomain,

    /// The server does not implement the requested kind of query.
    NotImp,

    /// The server refused to answer for policy reasons.
    Refused,

    /// Any other code.
    Other(u8),
}

impl Rcode {
    /// Creates an rcode from the low four bits of a header flags field.
    pub fn from_int(value: u8) -> Self {
        match value & 0x0F {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NXDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            value => Rcode::Other(value),
        }
    }

    /// Returns the integer value of the rcode.
    pub fn to_int(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NXDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::Other(value) => value,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::FormErr => write!(f, "FORMERR"),
            Rcode::ServFail => write!(f, "SERVFAIL"),
            Rcode::NXDomain => write!(f, "NXDOMAIN"),
            Rcode::NotImp => write!(f, "NOTIMP"),
            Rcode::Refused => write!(f, "REFUSED"),
            Rcode::Other(value) => write!(f, "RCODE{}", value),
        }
    }
}

//------------ Rtype ---------------------------------------------------------

/// A record type in its raw 16 bit form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Rtype(pub u16);

impl Rtype {
    /// A host address.
    pub const A: Rtype = Rtype(1);

    /// An IPv6 host address.
    pub const AAAA: Rtype = Rtype(28);

    /// The EDNS pseudo record.
    pub const OPT: Rtype = Rtype(41);
}

impl fmt::Display for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Rtype::A => write!(f, "A"),
            Rtype::AAAA => write!(f, "AAAA"),
            Rtype::OPT => write!(f, "OPT"),
            Rtype(value) => write!(f, "TYPE{}", value),
        }
    }
}

//------------ Rclass --------------------------------------------------------

/// A record class in its raw 16 bit form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Rclass(pub u16);

impl Rclass {
    /// The Internet class.
    pub const IN: Rclass = Rclass(1);
}

impl fmt::Display for Rclass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Rclass::IN => write!(f, "IN"),
            Rclass(value) => write!(f, "CLASS{}", value),
        }
    }
}

//============ Test ==========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rcode_round_trip() {
        for value in 0..16 {
            assert_eq!(Rcode::from_int(value).to_int(), value);
        }
    }

    #[test]
    fn rcode_masks_high_bits() {
        assert_eq!(Rcode::from_int(0xF2), Rcode::ServFail);
    }
}
