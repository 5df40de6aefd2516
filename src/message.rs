//! This module turns a raw inbound byte stream into classified AMI [`Frame`]s.
//!
//! Two collaborating pieces do the work, mirroring the two-stage buffering the reference
//! codebase this crate grew out of uses for its own (differently framed) protocol: a
//! [`LineFramer`] that only knows about splitting bytes on `\r\n`, and a [`MessageAssembler`]
//! that turns a sequence of lines into whole messages and classifies them.
use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "tracing")]
use tracing::Level;

/// A parsed AMI message's header map: lowercased key -> left-trimmed value.
pub type Headers = HashMap<String, String>;

/// Errors arising while framing or assembling AMI messages.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// The first line received was not a valid AMI banner.
    UnknownBanner(String),
    /// A buffered line had no `:` separator and was not a command-body terminator.
    MalformedHeaderLine(String),
    /// A `--END COMMAND--` line was seen, but the message's `response` header was not `Follows`.
    BodyInNonFollowsResponse,
    /// A `Response: Follows` message had no body line.
    NoBodyOnFollows,
    /// A message had neither an `event` nor a `response` header.
    BadMessage,
    /// A `Response:` header carried a value other than `Success`, `Error`, or `Follows`.
    BadResponseValue(String),
    /// A single line exceeded the configured maximum length without a `\r\n` terminator.
    LineTooLong,
    /// The stream contained bytes that were not valid UTF-8.
    NotUtf8,
}
impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownBanner(line) => write!(f, "unknown banner: {line:?}"),
            Self::MalformedHeaderLine(line) => write!(f, "malformed header line: {line:?}"),
            Self::BodyInNonFollowsResponse => {
                write!(f, "body in non-Follows response")
            }
            Self::NoBodyOnFollows => write!(f, "no body on Follows response"),
            Self::BadMessage => write!(f, "message had neither an event nor a response header"),
            Self::BadResponseValue(v) => write!(f, "bad response value: {v:?}"),
            Self::LineTooLong => write!(f, "line exceeded the configured maximum length"),
            Self::NotUtf8 => write!(f, "stream contained non-UTF-8 bytes"),
        }
    }
}
impl std::error::Error for ProtocolError {}

/// The three `Response:` values the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    Error,
    Follows,
}
impl ResponseKind {
    fn from_value(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "Success" => Ok(Self::Success),
            "Error" => Ok(Self::Error),
            "Follows" => Ok(Self::Follows),
            other => Err(ProtocolError::BadResponseValue(other.to_owned())),
        }
    }
}

/// A single classified unit of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The one-time banner line, e.g. `Asterisk Call Manager/1.3`.
    Banner(String),
    /// An `Event:` message, with the event name already split off.
    Event { name: String, headers: Headers },
    /// A `Response:` message, with the response kind, the ActionID still present (the action
    /// correlator pops it), and an optional command body.
    Response {
        kind: ResponseKind,
        headers: Headers,
        body: Option<String>,
    },
}

/// Splits an inbound byte stream on `\r\n`, buffering partial trailing bytes.
///
/// This is deliberately the only thing that understands byte-level framing; everything above it
/// operates on whole lines (without their trailing `\r\n`).
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_len: usize,
}
impl LineFramer {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_len,
        }
    }

    /// Feed newly-received bytes in, draining every complete line out (without its `\r\n`).
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, bytes), level = Level::TRACE))]
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        loop {
            let Some(pos) = find_crlf(&self.buf) else {
                if self.buf.len() > self.max_line_len {
                    return Err(ProtocolError::LineTooLong);
                }
                break;
            };
            let line_bytes: Vec<u8> = self.buf.drain(..=pos + 1).collect();
            let line = String::from_utf8(line_bytes[..line_bytes.len() - 2].to_vec())
                .map_err(|_| ProtocolError::NotUtf8)?;
            lines.push(line);
        }
        Ok(lines)
    }
}
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Accumulates lines into whole messages and classifies them (banner / event / response).
///
/// State machine per the AMI framing rules: the first line must be the banner; afterwards,
/// non-empty lines accumulate until a blank line terminates a message.
#[derive(Debug)]
pub struct MessageAssembler {
    started: bool,
    buffered_lines: Vec<String>,
}
impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}
impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            started: false,
            buffered_lines: Vec::new(),
        }
    }

    /// Feed a single line (already stripped of its `\r\n`) into the assembler.
    ///
    /// Returns `Some(Frame)` once a full message (or the banner) has been recognized.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), level = Level::TRACE))]
    pub fn push_line(&mut self, line: String) -> Result<Option<Frame>, ProtocolError> {
        if !self.started {
            if !line.starts_with("Asterisk Call Manager/") {
                return Err(ProtocolError::UnknownBanner(line));
            }
            self.started = true;
            return Ok(Some(Frame::Banner(line)));
        }

        if !line.is_empty() {
            self.buffered_lines.push(line);
            return Ok(None);
        }

        let lines = std::mem::take(&mut self.buffered_lines);
        let mut headers = Headers::new();
        let mut body: Option<String> = None;
        for (idx, line) in lines.iter().enumerate() {
            if line.ends_with("--END COMMAND--") {
                if idx != lines.len() - 1 {
                    return Err(ProtocolError::MalformedHeaderLine(line.clone()));
                }
                let response_is_follows = headers
                    .get("response")
                    .map(|v| v.as_str() == "Follows")
                    .unwrap_or(false);
                if !response_is_follows {
                    return Err(ProtocolError::BodyInNonFollowsResponse);
                }
                body = Some(line[..line.len() - "--END COMMAND--".len()].to_owned());
            } else {
                let Some((key, value)) = line.split_once(':') else {
                    return Err(ProtocolError::MalformedHeaderLine(line.clone()));
                };
                headers.insert(key.to_ascii_lowercase(), value.trim_start().to_owned());
            }
        }

        if let Some(name) = headers.remove("event") {
            return Ok(Some(Frame::Event { name, headers }));
        }
        if let Some(response) = headers.remove("response") {
            let kind = ResponseKind::from_value(&response)?;
            match kind {
                ResponseKind::Success | ResponseKind::Error if body.is_some() => {
                    return Err(ProtocolError::BodyInNonFollowsResponse);
                }
                ResponseKind::Follows if body.is_none() => {
                    return Err(ProtocolError::NoBodyOnFollows);
                }
                _ => {}
            }
            return Ok(Some(Frame::Response {
                kind,
                headers,
                body,
            }));
        }
        Err(ProtocolError::BadMessage)
    }
}

/// Serialize an outbound action: `<key-lowercased>: <value>\r\n` for every field, terminated by
/// a blank line. Iteration order follows the map's own (unspecified) order; nothing downstream
/// may depend on it (§9 "Action serialization iteration order").
pub fn serialize_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(&key.to_ascii_lowercase());
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_simple_lines() {
        let mut framer = LineFramer::new(65536);
        let lines = framer.feed(b"foo\r\nbar\r\n").unwrap();
        assert_eq!(lines, vec!["foo".to_owned(), "bar".to_owned()]);
    }

    #[test]
    fn framer_buffers_partial_line() {
        let mut framer = LineFramer::new(65536);
        assert_eq!(framer.feed(b"foo").unwrap(), Vec::<String>::new());
        assert_eq!(framer.feed(b"bar\r\n").unwrap(), vec!["foobar".to_owned()]);
    }

    #[test]
    fn framer_rejects_oversize_line() {
        let mut framer = LineFramer::new(4);
        assert_eq!(framer.feed(b"12345"), Err(ProtocolError::LineTooLong));
    }

    #[test]
    fn banner_accepted() {
        let mut assembler = MessageAssembler::new();
        let frame = assembler
            .push_line("Asterisk Call Manager/1.3".to_owned())
            .unwrap();
        assert_eq!(frame, Some(Frame::Banner("Asterisk Call Manager/1.3".to_owned())));
    }

    #[test]
    fn banner_rejected() {
        let mut assembler = MessageAssembler::new();
        let err = assembler.push_line("garbage".to_owned()).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownBanner("garbage".to_owned()));
    }

    fn started_assembler() -> MessageAssembler {
        let mut assembler = MessageAssembler::new();
        assembler
            .push_line("Asterisk Call Manager/1.3".to_owned())
            .unwrap();
        assembler
    }

    #[test]
    fn event_message() {
        let mut assembler = started_assembler();
        assert_eq!(assembler.push_line("Event: FullyBooted".to_owned()).unwrap(), None);
        assert_eq!(assembler.push_line("Status: Fully Booted".to_owned()).unwrap(), None);
        let frame = assembler.push_line(String::new()).unwrap().unwrap();
        match frame {
            Frame::Event { name, headers } => {
                assert_eq!(name, "FullyBooted");
                assert_eq!(headers.get("status"), Some(&"Fully Booted".to_owned()));
            }
            _ => panic!("expected Event"),
        }
    }

    #[test]
    fn response_success_with_body_is_protocol_error() {
        let mut assembler = started_assembler();
        assembler.push_line("Response: Success".to_owned()).unwrap();
        assembler.push_line("ActionID: 1".to_owned()).unwrap();
        assembler
            .push_line("some body text--END COMMAND--".to_owned())
            .unwrap();
        let err = assembler.push_line(String::new()).unwrap_err();
        assert_eq!(err, ProtocolError::BodyInNonFollowsResponse);
    }

    #[test]
    fn response_follows_without_body_is_protocol_error() {
        let mut assembler = started_assembler();
        assembler.push_line("Response: Follows".to_owned()).unwrap();
        assembler.push_line("ActionID: 1".to_owned()).unwrap();
        let err = assembler.push_line(String::new()).unwrap_err();
        assert_eq!(err, ProtocolError::NoBodyOnFollows);
    }

    #[test]
    fn response_follows_with_body() {
        let mut assembler = started_assembler();
        assembler.push_line("Response: Follows".to_owned()).unwrap();
        assembler.push_line("ActionID: 1".to_owned()).unwrap();
        assembler
            .push_line("line one\nline two--END COMMAND--".to_owned())
            .unwrap();
        let frame = assembler.push_line(String::new()).unwrap().unwrap();
        match frame {
            Frame::Response { kind, headers, body } => {
                assert_eq!(kind, ResponseKind::Follows);
                assert_eq!(headers.get("actionid"), Some(&"1".to_owned()));
                assert_eq!(body, Some("line one\nline two".to_owned()));
            }
            _ => panic!("expected Response"),
        }
    }

    #[test]
    fn body_line_must_be_last() {
        let mut assembler = started_assembler();
        assembler.push_line("Response: Follows".to_owned()).unwrap();
        assembler
            .push_line("line one--END COMMAND--".to_owned())
            .unwrap();
        let err = assembler
            .push_line("ActionID: 1".to_owned())
            .and_then(|_| assembler.push_line(String::new()));
        assert!(err.is_err());
    }

    #[test]
    fn message_without_event_or_response_is_bad_message() {
        let mut assembler = started_assembler();
        assembler.push_line("Channel: SIP/1".to_owned()).unwrap();
        let err = assembler.push_line(String::new()).unwrap_err();
        assert_eq!(err, ProtocolError::BadMessage);
    }

    #[test]
    fn header_value_tolerates_missing_space() {
        let mut assembler = started_assembler();
        assembler.push_line("Event:FullyBooted".to_owned()).unwrap();
        let frame = assembler.push_line(String::new()).unwrap().unwrap();
        match frame {
            Frame::Event { name, .. } => assert_eq!(name, "FullyBooted"),
            _ => panic!("expected Event"),
        }
    }

    #[test]
    fn serialize_fields_terminates_with_blank_line() {
        let out = serialize_fields([("Action", "Login"), ("Username", "u")]);
        assert_eq!(out, "action: Login\r\nusername: u\r\n\r\n");
    }

    /// Parse(serialize(message)) == message, for randomly generated header maps without
    /// embedded `\r`/`\n` (§9 "Round-trips").
    #[test]
    fn parse_serialize_round_trip_on_random_header_maps() {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let event_name_len = rng.gen_range(1..10);
            let event_name: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(event_name_len)
                .map(char::from)
                .collect();

            let mut headers = Headers::new();
            let field_count = rng.gen_range(0..6);
            for _ in 0..field_count {
                let key_len = rng.gen_range(1..8);
                let key: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(key_len)
                    .map(char::from)
                    .collect();
                let key = key.to_ascii_lowercase();
                if key == "event" || key == "response" {
                    continue;
                }
                let value_len = rng.gen_range(0..12);
                let value: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(value_len)
                    .map(char::from)
                    .collect();
                headers.insert(key, value);
            }

            let mut fields: Vec<(&str, &str)> = vec![("Event", event_name.as_str())];
            fields.extend(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            let wire = serialize_fields(fields);

            let mut assembler = started_assembler();
            let mut frame = None;
            for line in wire.lines() {
                frame = assembler.push_line(line.to_owned()).unwrap();
                if frame.is_some() {
                    break;
                }
            }
            match frame.expect("a blank line always terminates the message") {
                Frame::Event { name, headers: parsed } => {
                    assert_eq!(name, event_name);
                    assert_eq!(parsed, headers);
                }
                other => panic!("expected Event, got {other:?}"),
            }
        }
    }
}
