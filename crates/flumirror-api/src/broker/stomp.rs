//! STOMP 1.2 frame codec.
//!
//! One websocket message carries exactly one frame. A message holding only
//! end-of-line bytes is a heart-beat and decodes to `None`.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    // CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            other => return Err(Error::Frame(format!("unknown command '{other}'"))),
        })
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated headers are kept; the first wins on lookup.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// A `SEND` frame carrying a JSON body.
    pub fn send(destination: &str, body: String) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json;charset=utf-8")
            .body(body)
    }

    /// Body as UTF-8 text.
    pub fn body_text(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.body).map_err(|e| Error::Frame(format!("body is not UTF-8: {e}")))
    }

    pub fn encode(&self) -> Bytes {
        let escape = self.command.escapes_headers();
        let mut buf = BytesMut::with_capacity(64 + self.body.len());

        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(b'\n');
        for (name, value) in &self.headers {
            put_header_part(&mut buf, name, escape);
            buf.put_u8(b':');
            put_header_part(&mut buf, value, escape);
            buf.put_u8(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            buf.put_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
        buf.freeze()
    }

    /// Decode one frame. Returns `Ok(None)` for a heart-beat.
    pub fn decode(input: &[u8]) -> Result<Option<Self>, Error> {
        let start = input
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(input.len());
        let input = &input[start..];
        if input.is_empty() {
            return Ok(None);
        }

        let (command_line, mut rest) = split_line(input)?;
        let command: Command = command_line.parse()?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, tail) = split_line(rest)?;
            rest = tail;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Frame(format!("header without ':' in '{line}'")))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let mut frame = Self {
            command,
            headers,
            body: Bytes::new(),
        };

        let body = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| Error::Frame(format!("bad content-length '{len}'")))?;
                if rest.len() <= len || rest[len] != 0 {
                    return Err(Error::Frame("body shorter than content-length".into()));
                }
                &rest[..len]
            }
            None => {
                let end = rest
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| Error::Frame("missing NUL terminator".into()))?;
                &rest[..end]
            }
        };
        frame.body = Bytes::copy_from_slice(body);
        Ok(Some(frame))
    }
}

/// Parse a `heart-beat: cx,cy` header value into milliseconds.
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (cx, cy) = value.split_once(',')?;
    Some((cx.trim().parse().ok()?, cy.trim().parse().ok()?))
}

fn split_line(input: &[u8]) -> Result<(&str, &[u8]), Error> {
    let end = input
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::Frame("unterminated header block".into()))?;
    let mut line = &input[..end];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }
    let line = std::str::from_utf8(line).map_err(|e| Error::Frame(format!("header is not UTF-8: {e}")))?;
    Ok((line, &input[end + 1..]))
}

fn put_header_part(buf: &mut BytesMut, text: &str, escape: bool) {
    if !escape {
        buf.put_slice(text.as_bytes());
        return;
    }
    for ch in text.chars() {
        match ch {
            '\\' => buf.put_slice(b"\\\\"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            ':' => buf.put_slice(b"\\c"),
            other => {
                let mut utf8 = [0_u8; 4];
                buf.put_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
}

fn unescape_header(text: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::Frame(format!(
                    "invalid escape '\\{}' in header",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
