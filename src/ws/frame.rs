//! STOMP 1.2 frames carried in WebSocket text messages.
//!
//! A frame is `COMMAND\n`, zero or more `name:value\n` headers, an empty line, the body and a
//! terminating NUL octet. Header values are escaped on every frame except `CONNECT` and
//! `CONNECTED`. A text message made only of end-of-line characters is a heartbeat.

use std::fmt::Write as _;
use std::str::FromStr;

use super::error::WsError;

const NUL: char = '\0';

/// STOMP command verbs used by the client and the broker.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    /// `CONNECT` and `CONNECTED` frames carry their header values verbatim.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl FromStr for Command {
    type Err = WsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            other => return Err(WsError::InvalidFrame(format!("unknown command {other:?}"))),
        })
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a JSON body along with its `content-type` and `content-length` headers.
    #[must_use]
    pub fn json_body(mut self, body: String) -> Self {
        self.headers
            .push(("content-type".to_owned(), "application/json".to_owned()));
        self.headers
            .push(("content-length".to_owned(), body.len().to_string()));
        self.body = body;
        self
    }

    /// First value of the named header. Repeated headers keep the first occurrence.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `CONNECT` frame opening a session for `host`.
    #[must_use]
    pub fn connect(host: &str, heartbeat: (u64, u64), bearer: Option<&str>) -> Self {
        let mut frame = Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1));
        if let Some(token) = bearer {
            frame = frame.header("Authorization", format!("Bearer {token}"));
        }
        frame
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    #[must_use]
    pub fn send(destination: &str, body: String) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .json_body(body)
    }

    #[must_use]
    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Human readable description of an `ERROR` frame.
    #[must_use]
    pub fn error_message(&self) -> String {
        match (self.get("message"), self.body.trim()) {
            (Some(message), "") => message.to_owned(),
            (Some(message), body) => format!("{message}: {body}"),
            (None, "") => "no details provided".to_owned(),
            (None, body) => body.to_owned(),
        }
    }

    /// Parses a frame from a WebSocket text message.
    ///
    /// Returns `Ok(None)` for heartbeats.
    pub fn parse(text: &str) -> Result<Option<Self>, WsError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let (command_line, rest) = text
            .split_once('\n')
            .ok_or_else(|| WsError::InvalidFrame("missing command terminator".to_owned()))?;
        let command: Command = command_line.trim_end_matches('\r').parse()?;

        let mut headers = Vec::new();
        let mut remaining = rest;
        loop {
            let (line, tail) = remaining
                .split_once('\n')
                .ok_or_else(|| WsError::InvalidFrame("unterminated headers".to_owned()))?;
            remaining = tail;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WsError::InvalidFrame(format!("malformed header {line:?}")))?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .parse::<usize>()
                    .map_err(|_e| WsError::InvalidFrame(format!("bad content-length {value:?}")))
            })
            .transpose()?;

        let body = match length {
            Some(length) => remaining
                .get(..length)
                .ok_or_else(|| WsError::InvalidFrame("body shorter than content-length".to_owned()))?,
            None => remaining
                .find(NUL)
                .and_then(|end| remaining.get(..end))
                .ok_or_else(|| WsError::InvalidFrame("missing NUL terminator".to_owned()))?,
        };

        Ok(Some(Self {
            command,
            headers,
            body: body.to_owned(),
        }))
    }

    /// Serializes the frame, including the trailing NUL.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        let _ = writeln!(out, "{}", self.command);
        for (name, value) in &self.headers {
            if self.command.escapes_headers() {
                let _ = writeln!(out, "{}:{}", escape(name), escape(value));
            } else {
                let _ = writeln!(out, "{name}:{value}");
            }
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String, WsError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
                return Err(WsError::InvalidFrame(format!(
                    "undefined escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
