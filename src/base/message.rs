//! Read-only access to DNS messages in wire format.
//!
//! [`Message`] wraps an octets sequence and hands out the pieces the
//! resolver engine cares about: the header, the question section, and the
//! presence of an OPT record in the additional section. Records themselves
//! are only ever skipped over, never interpreted.

use super::header::{Header, HEADER_LEN};
use super::iana::{Rclass, Rtype};
use core::fmt;
use octseq::parse::{Parser, ShortInput};

/// Upper bound on compression pointers while walking one name.
///
/// A name can have at most 127 labels, so any pointer chain longer than
/// that is a loop.
const MAX_COMPRESSION_JUMPS: usize = 127;

//------------ Message -------------------------------------------------------

/// A DNS message in wire format.
///
/// The octets are checked to be at least a header long on creation.
/// Everything past the header is parsed lazily. Use [`validate`] to walk
/// the entire message once if you need to know it is well-formed.
///
/// [`validate`]: Message::validate
#[derive(Clone, Debug)]
pub struct Message<Octs> {
    /// The underlying octets.
    octets: Octs,
}

impl<Octs: AsRef<[u8]>> Message<Octs> {
    /// Creates a message from an octets sequence.
    ///
    /// Fails if the sequence is too short to even contain a header.
    pub fn from_octets(octets: Octs) -> Result<Self, ParseError> {
        if octets.as_ref().len() < HEADER_LEN {
            return Err(ParseError::ShortInput);
        }
        Ok(Message { octets })
    }

    /// Returns a reference to the message octets.
    pub fn as_slice(&self) -> &[u8] {
        self.octets.as_ref()
    }

    /// Converts the message into its underlying octets.
    pub fn into_octets(self) -> Octs {
        self.octets
    }

    /// Returns the message header.
    pub fn header(&self) -> Header {
        Header::for_message_slice(self.as_slice())
    }

    /// Returns an iterator over the question section.
    pub fn questions(&self) -> Questions<'_> {
        Questions::new(self.as_slice())
    }

    /// Walks the entire message, checking that all sections are
    /// well-formed and complete.
    pub fn validate(&self) -> Result<(), ParseError> {
        let slice = self.as_slice();
        let header = self.header();
        let mut parser = Parser::from_ref(slice);
        parser.advance(HEADER_LEN)?;
        for _ in 0..header.qdcount() {
            skip_question(&mut parser)?;
        }
        let records = usize::from(header.ancount())
            + usize::from(header.nscount())
            + usize::from(header.arcount());
        for _ in 0..records {
            skip_record(&mut parser)?;
        }
        Ok(())
    }

    /// Returns whether the additional section contains an OPT record.
    ///
    /// Returns an error if the message cannot be walked that far.
    pub fn has_opt(&self) -> Result<bool, ParseError> {
        let slice = self.as_slice();
        let header = self.header();
        let mut parser = Parser::from_ref(slice);
        parser.advance(HEADER_LEN)?;
        for _ in 0..header.qdcount() {
            skip_question(&mut parser)?;
        }
        let records =
            usize::from(header.ancount()) + usize::from(header.nscount());
        for _ in 0..records {
            skip_record(&mut parser)?;
        }
        for _ in 0..header.arcount() {
            skip_name(&mut parser)?;
            let rtype = Rtype(parser.parse_u16_be()?);
            // class and ttl
            parser.advance(6)?;
            let rdlen = parser.parse_u16_be()?;
            parser.advance(usize::from(rdlen))?;
            if rtype == Rtype::OPT {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns whether `other` carries exactly the same questions.
    ///
    /// The counts have to agree and each pair of questions has to match
    /// with a case-insensitive name comparison. Any parse error makes the
    /// comparison fail.
    pub fn same_questions<Other: AsRef<[u8]>>(
        &self,
        other: &Message<Other>,
    ) -> bool {
        if self.header().qdcount() != other.header().qdcount() {
            return false;
        }
        let mut mine = self.questions();
        let mut theirs = other.questions();
        loop {
            match (mine.next(), theirs.next()) {
                (Some(Ok(left)), Some(Ok(right))) => {
                    if !left.matches(&right) {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

//------------ Questions -----------------------------------------------------

/// An iterator over the question section of a message.
///
/// The iterator fuses after the first parse error.
#[derive(Clone, Debug)]
pub struct Questions<'a> {
    /// The complete message, for compression pointer chasing.
    message: &'a [u8],

    /// The parser positioned at the next question.
    parser: Parser<'a, [u8]>,

    /// The remaining number of questions, or `None` after an error.
    remaining: Option<u16>,
}

impl<'a> Questions<'a> {
    /// Creates an iterator over the questions of a message slice.
    fn new(message: &'a [u8]) -> Self {
        let mut parser = Parser::from_ref(message);
        let remaining = match parser.advance(HEADER_LEN) {
            Ok(()) => Some(Header::for_message_slice(message).qdcount()),
            Err(_) => None,
        };
        Questions {
            message,
            parser,
            remaining,
        }
    }
}

impl<'a> Iterator for Questions<'a> {
    type Item = Result<Question<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        if remaining == 0 {
            return None;
        }
        match Question::parse(self.message, &mut self.parser) {
            Ok(question) => {
                self.remaining = Some(remaining - 1);
                Some(Ok(question))
            }
            Err(err) => {
                self.remaining = None;
                Some(Err(err))
            }
        }
    }
}

//------------ Question ------------------------------------------------------

/// A single entry of the question section.
#[derive(Clone, Copy, Debug)]
pub struct Question<'a> {
    /// The name asked for.
    name: ParsedName<'a>,

    /// The record type asked for.
    rtype: Rtype,

    /// The class asked for.
    rclass: Rclass,
}

impl<'a> Question<'a> {
    /// Parses a question at the parser's current position.
    fn parse(
        message: &'a [u8],
        parser: &mut Parser<'a, [u8]>,
    ) -> Result<Self, ParseError> {
        let start = parser.pos();
        skip_name(parser)?;
        let rtype = Rtype(parser.parse_u16_be()?);
        let rclass = Rclass(parser.parse_u16_be()?);
        Ok(Question {
            name: ParsedName { message, start },
            rtype,
            rclass,
        })
    }

    /// Returns the question name.
    pub fn name(&self) -> ParsedName<'a> {
        self.name
    }

    /// Returns the question type.
    pub fn rtype(&self) -> Rtype {
        self.rtype
    }

    /// Returns the question class.
    pub fn rclass(&self) -> Rclass {
        self.rclass
    }

    /// Returns whether `other` asks the very same question.
    ///
    /// Names compare case-insensitively, type and class exactly.
    pub fn matches(&self, other: &Question<'_>) -> bool {
        self.rtype == other.rtype
            && self.rclass == other.rclass
            && self.name.eq_ignore_case(&other.name)
    }
}

impl<'a> fmt::Display for Question<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.rclass, self.rtype)
    }
}

//------------ ParsedName ----------------------------------------------------

/// A possibly compressed name inside a message.
///
/// The name is referenced by its start position. Labels are produced on
/// demand, following compression pointers as needed.
#[derive(Clone, Copy, Debug)]
pub struct ParsedName<'a> {
    /// The complete message.
    message: &'a [u8],

    /// The position of the first label.
    start: usize,
}

impl<'a> ParsedName<'a> {
    /// Returns an iterator over the labels of the name.
    pub fn labels(&self) -> Labels<'a> {
        Labels {
            message: self.message,
            pos: self.start,
            jumps: 0,
            done: false,
        }
    }

    /// Returns whether `other` is the same name, ignoring ASCII case.
    pub fn eq_ignore_case(&self, other: &ParsedName<'_>) -> bool {
        let mut mine = self.labels();
        let mut theirs = other.labels();
        loop {
            match (mine.next(), theirs.next()) {
                (Some(Ok(left)), Some(Ok(right))) => {
                    if !left.eq_ignore_ascii_case(right) {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl<'a> fmt::Display for ParsedName<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for label in self.labels() {
            let label = match label {
                Ok(label) => label,
                Err(_) => return f.write_str("<invalid>"),
            };
            if !first {
                f.write_str(".")?;
            }
            first = false;
            write!(f, "{}", label.escape_ascii())?;
        }
        if first {
            // The root name.
            f.write_str(".")?;
        }
        Ok(())
    }
}

//------------ Labels --------------------------------------------------------

/// An iterator over the labels of a parsed name.
///
/// The root label is not produced. The iterator fuses after an error.
#[derive(Clone, Debug)]
pub struct Labels<'a> {
    /// The complete message.
    message: &'a [u8],

    /// The position of the next label.
    pos: usize,

    /// How many compression pointers we have followed so far.
    jumps: usize,

    /// Whether the end of the name or an error was reached.
    done: bool,
}

impl<'a> Iterator for Labels<'a> {
    type Item = Result<&'a [u8], ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let head = match self.message.get(self.pos) {
                Some(&head) => head,
                None => return Some(self.fail(ParseError::ShortInput)),
            };
            match head {
                0 => {
                    self.done = true;
                    return None;
                }
                len @ 1..=0x3F => {
                    let start = self.pos + 1;
                    let end = start + usize::from(len);
                    let label = match self.message.get(start..end) {
                        Some(label) => label,
                        None => {
                            return Some(self.fail(ParseError::ShortInput))
                        }
                    };
                    self.pos = end;
                    return Some(Ok(label));
                }
                ptr if ptr & 0xC0 == 0xC0 => {
                    let low = match self.message.get(self.pos + 1) {
                        Some(&low) => low,
                        None => return Some(self.fail(ParseError::ShortInput)),
                    };
                    let target = usize::from(ptr & 0x3F) << 8 | usize::from(low);
                    // A pointer must reference an earlier occurrence.
                    if target >= self.pos {
                        return Some(self.fail(ParseError::form_error(
                            "forward compression pointer",
                        )));
                    }
                    self.jumps += 1;
                    if self.jumps > MAX_COMPRESSION_JUMPS {
                        return Some(self.fail(ParseError::form_error(
                            "compression pointer loop",
                        )));
                    }
                    self.pos = target;
                }
                _ => {
                    return Some(self.fail(ParseError::form_error(
                        "reserved label type",
                    )))
                }
            }
        }
    }
}

impl<'a> Labels<'a> {
    /// Records an error and fuses the iterator.
    fn fail(&mut self, err: ParseError) -> Result<&'a [u8], ParseError> {
        self.done = true;
        Err(err)
    }
}

//------------ Section walking helpers ---------------------------------------

/// Advances the parser past a possibly compressed name.
fn skip_name(parser: &mut Parser<'_, [u8]>) -> Result<(), ParseError> {
    loop {
        let head = parser.parse_u8()?;
        match head {
            0 => return Ok(()),
            len @ 1..=0x3F => parser.advance(usize::from(len))?,
            ptr if ptr & 0xC0 == 0xC0 => {
                // The rest of the name lives at the pointer target.
                parser.advance(1)?;
                return Ok(());
            }
            _ => return Err(ParseError::form_error("reserved label type")),
        }
    }
}

/// Advances the parser past one question.
fn skip_question(parser: &mut Parser<'_, [u8]>) -> Result<(), ParseError> {
    skip_name(parser)?;
    parser.advance(4)
        .map_err(Into::into)
}

/// Advances the parser past one record of any section.
fn skip_record(parser: &mut Parser<'_, [u8]>) -> Result<(), ParseError> {
    skip_name(parser)?;
    // type, class, ttl
    parser.advance(8)?;
    let rdlen = parser.parse_u16_be()?;
    parser.advance(usize::from(rdlen))?;
    Ok(())
}

//============ Error Types ===================================================

//------------ ParseError ----------------------------------------------------

/// An error happened while parsing message data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// An attempt was made to go beyond the end of the message.
    ShortInput,

    /// A formatting error occurred.
    Form(&'static str),
}

impl ParseError {
    /// Creates a parse error describing a formatting problem.
    pub fn form_error(msg: &'static str) -> Self {
        ParseError::Form(msg)
    }
}

impl From<ShortInput> for ParseError {
    fn from(_: ShortInput) -> Self {
        ParseError::ShortInput
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParseError::ShortInput => f.write_str("unexpected end of input"),
            ParseError::Form(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ParseError {}

//============ Test ==========================================================
