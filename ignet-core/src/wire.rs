//! Node transfer wire protocol: client commands and numeric status replies.

use std::fmt;

/// Commands the polling side sends. Each encodes to one LF-terminated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Identify as `node` using the shared `secret`.
    Netp { node: String, secret: String },
    /// Open the remote's outbound spool for us; reply carries its size.
    Ndop,
    /// Request the next chunk at `offset` of a `total` byte download.
    Read { offset: u64, total: u64 },
    /// Close the download.
    Clos,
    /// Open an upload.
    Nuop,
    /// Announce `remaining` bytes to upload.
    Writ { remaining: u64 },
    /// Close the upload and ask the remote to process it.
    Ucls,
    Quit,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Netp { node, secret } => writeln!(f, "NETP {}|{}", node, secret),
            Command::Ndop => writeln!(f, "NDOP"),
            Command::Read { offset, total } => writeln!(f, "READ {}|{}", offset, total),
            Command::Clos => writeln!(f, "CLOS"),
            Command::Nuop => writeln!(f, "NUOP"),
            Command::Writ { remaining } => writeln!(f, "WRIT {}", remaining),
            Command::Ucls => writeln!(f, "UCLS 1"),
            Command::Quit => writeln!(f, "QUIT"),
        }
    }
}

/// Leading digit of a status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// `2xx`
    Ok,
    /// `6xx`: binary follows; the argument is its size.
    BinaryFollows,
    /// `7xx`: send binary; the argument is how much the remote accepts.
    SendBinary,
    Failed,
}

/// A parsed `NNN text` reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status<'a> {
    pub class: StatusClass,
    /// Three digit code, when the line starts with one.
    pub code: Option<u16>,
    /// Everything after the code and its separator.
    pub text: &'a str,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatusParseError {
    #[error("empty status line")]
    Empty,
}

impl<'a> Status<'a> {
    pub fn parse(line: &'a str) -> Result<Self, StatusParseError> {
        let first = line.chars().next().ok_or(StatusParseError::Empty)?;
        let class = match first {
            '2' => StatusClass::Ok,
            '6' => StatusClass::BinaryFollows,
            '7' => StatusClass::SendBinary,
            _ => StatusClass::Failed,
        };
        let code = line
            .get(..3)
            .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse().ok());
        let text = line.get(4..).unwrap_or("");
        Ok(Self { class, code, text })
    }

    pub fn is_ok(&self) -> bool {
        self.class == StatusClass::Ok
    }

    /// Leading decimal number of the argument, as the size-bearing replies
    /// carry. Missing or non-numeric arguments read as zero.
    pub fn size_arg(&self) -> u64 {
        leading_number(self.text)
    }
}

/// Parse the leading run of digits, ignoring leading whitespace.
fn leading_number(s: &str) -> u64 {
    let s = s.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().unwrap_or(0)
}

/// Token `index` of a space separated line; empty when absent.
pub fn token(line: &str, index: usize) -> &str {
    line.split(' ').nth(index).unwrap_or("")
}

/// Auth reply code meaning the remote is already talking to us.
pub const AUTH_ALREADY_TALKING: u16 = 552;
