//! # Wire Messages
//!
//! Frame payloads are `;`-delimited. The last field of every message is raw
//! bytes and may itself contain `;`, so parsing only ever splits off leading
//! fields.
//!
//! ```text
//! OPEN;<b64 public key>;<b64 nonce>
//! <challenge>;<COMMAND>;<payload>
//! [<echo>;]OK[;<discriminant or body>]
//! [<echo>;]ERROR;<reason>
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{KEY_SIZE, OPEN_NONCE_SIZE};

/// Field separator
pub const SEPARATOR: u8 = b';';

const OPEN: &[u8] = b"OPEN";
const OK: &[u8] = b"OK";
const ERROR: &[u8] = b"ERROR";

/// Split off the first field
fn split_field(data: &[u8]) -> (&[u8], Option<&[u8]>) {
    match data.iter().position(|&b| b == SEPARATOR) {
        Some(pos) => (&data[..pos], Some(&data[pos + 1..])),
        None => (data, None),
    }
}

fn decode_fixed<const N: usize>(field: &[u8], what: &str) -> ProtocolResult<[u8; N]> {
    let raw = URL_SAFE_NO_PAD
        .decode(field)
        .map_err(|e| ProtocolError::Malformed(format!("Bad {} encoding: {}", what, e)))?;
    raw.as_slice().try_into().map_err(|_| {
        ProtocolError::Malformed(format!("{} must be {} bytes, got {}", what, N, raw.len()))
    })
}

/// Commands carried by validated requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Sealed master secret
    Session,
    /// Log into an existing account
    Login,
    /// Create a new account
    Creation,
    /// Sealed layer-suite configuration
    Configuration,
    /// Store a new secret entry
    AddData,
    /// Remove a secret entry
    DeleteData,
    /// Search secret entries
    SearchData,
}

impl Command {
    /// Wire name, also used as challenge label and AEAD associated data
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Session => "SESSION",
            Command::Login => "LOGIN",
            Command::Creation => "CREATION",
            Command::Configuration => "CONFIGURATION",
            Command::AddData => "ADDDATA",
            Command::DeleteData => "DELETEDATA",
            Command::SearchData => "SEARCHDATA",
        }
    }

    /// Wire name as bytes
    pub fn label(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value {
            b"SESSION" => Ok(Command::Session),
            b"LOGIN" => Ok(Command::Login),
            b"CREATION" => Ok(Command::Creation),
            b"CONFIGURATION" => Ok(Command::Configuration),
            b"ADDDATA" => Ok(Command::AddData),
            b"DELETEDATA" => Ok(Command::DeleteData),
            b"SEARCHDATA" => Ok(Command::SearchData),
            _ => Err(ProtocolError::Malformed(format!(
                "Unknown command: {}",
                String::from_utf8_lossy(value)
            ))),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opening message: ephemeral public key and nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub public_key: [u8; KEY_SIZE],
    pub nonce: [u8; OPEN_NONCE_SIZE],
}

impl OpenMessage {
    /// Encode as `OPEN;<key>;<nonce>`
    pub fn encode(&self) -> Bytes {
        format!(
            "OPEN;{};{}",
            URL_SAFE_NO_PAD.encode(self.public_key),
            URL_SAFE_NO_PAD.encode(self.nonce)
        )
        .into()
    }

    /// Parse an opening message
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let (tag, rest) = split_field(data);
        if tag != OPEN {
            return Err(ProtocolError::Malformed("Expected OPEN message".to_string()));
        }
        let rest = rest.ok_or_else(|| ProtocolError::Malformed("OPEN without key".to_string()))?;
        let (key, nonce) = split_field(rest);
        let nonce =
            nonce.ok_or_else(|| ProtocolError::Malformed("OPEN without nonce".to_string()))?;

        Ok(Self {
            public_key: decode_fixed(key, "public key")?,
            nonce: decode_fixed(nonce, "opening nonce")?,
        })
    }
}

/// Challenged request: `<challenge>;<COMMAND>;<payload>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub challenge: Bytes,
    pub command: Command,
    pub payload: Bytes,
}

impl Request {
    /// Build a request around an already computed challenge token
    pub fn new(challenge: impl Into<Bytes>, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            challenge: challenge.into(),
            command,
            payload: payload.into(),
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.challenge.len() + self.command.as_str().len() + self.payload.len() + 2,
        );
        buf.put_slice(&self.challenge);
        buf.put_u8(SEPARATOR);
        buf.put_slice(self.command.label());
        buf.put_u8(SEPARATOR);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse wire bytes
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let (challenge, rest) = split_field(data);
        let rest =
            rest.ok_or_else(|| ProtocolError::Malformed("Request without command".to_string()))?;
        let (command, payload) = split_field(rest);

        Ok(Self {
            challenge: Bytes::copy_from_slice(challenge),
            command: Command::try_from(command)?,
            payload: payload.map(Bytes::copy_from_slice).unwrap_or_default(),
        })
    }
}

/// Body of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK` alone, or `OK;<discriminant or body>`
    Ok(Option<Bytes>),
    /// `ERROR;<reason>`
    Error(String),
}

impl Reply {
    /// Whole body of an `OK;<body>` reply
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            Reply::Ok(Some(body)) => Some(body.as_ref()),
            _ => None,
        }
    }

    /// First body field, e.g. `1` in `OK;1` or `2` in `OK;2;<suite>`
    pub fn discriminant(&self) -> Option<&[u8]> {
        self.body().map(|body| split_field(body).0)
    }

    /// Body after the discriminant
    pub fn detail(&self) -> Option<&[u8]> {
        self.body().and_then(|body| split_field(body).1)
    }
}

/// Response with an optional challenge echo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub echo: Option<Bytes>,
    pub reply: Reply,
}

impl Response {
    /// Plain `OK`, no echo
    pub fn ack() -> Self {
        Self {
            echo: None,
            reply: Reply::Ok(None),
        }
    }

    /// `<echo>;OK[;body]`
    pub fn ok(echo: impl Into<Bytes>, body: Option<Bytes>) -> Self {
        Self {
            echo: Some(echo.into()),
            reply: Reply::Ok(body),
        }
    }

    /// `<echo>;ERROR;<reason>`, or bare when no echo is available
    pub fn error(echo: Option<Bytes>, reason: impl Into<String>) -> Self {
        Self {
            echo,
            reply: Reply::Error(reason.into()),
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        if let Some(echo) = &self.echo {
            buf.put_slice(echo);
            buf.put_u8(SEPARATOR);
        }
        match &self.reply {
            Reply::Ok(body) => {
                buf.put_slice(OK);
                if let Some(body) = body {
                    buf.put_u8(SEPARATOR);
                    buf.put_slice(body);
                }
            }
            Reply::Error(reason) => {
                buf.put_slice(ERROR);
                buf.put_u8(SEPARATOR);
                buf.put_slice(reason.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Split off the echo, if any, from the reply
    ///
    /// Echo tokens are base64 and never equal `OK` or `ERROR`, so a leading
    /// marker means the echo is absent.
    pub fn split_echo(data: &[u8]) -> (Option<Bytes>, &[u8]) {
        let (first, rest) = split_field(data);
        if first == OK || first == ERROR {
            (None, data)
        } else {
            (Some(Bytes::copy_from_slice(first)), rest.unwrap_or_default())
        }
    }

    /// Parse wire bytes
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let (echo, rest) = Self::split_echo(data);
        Ok(Self {
            echo,
            reply: Reply::parse(rest)?,
        })
    }
}

impl Reply {
    /// Parse `OK[;body]` or `ERROR;<reason>`
    pub fn parse(data: &[u8]) -> ProtocolResult<Self> {
        let (marker, rest) = split_field(data);
        match marker {
            OK => Ok(Reply::Ok(rest.map(Bytes::copy_from_slice))),
            ERROR => Ok(Reply::Error(
                String::from_utf8_lossy(rest.unwrap_or_default()).into_owned(),
            )),
            _ => Err(ProtocolError::Malformed(format!(
                "Unknown response marker: {}",
                String::from_utf8_lossy(marker)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_roundtrip() {
        let open = OpenMessage {
            public_key: [1u8; KEY_SIZE],
            nonce: [2u8; OPEN_NONCE_SIZE],
        };
        assert_eq!(OpenMessage::parse(&open.encode()).unwrap(), open);
    }

    #[test]
    fn test_open_rejects_short_key() {
        let data = format!("OPEN;{};{}", URL_SAFE_NO_PAD.encode([1u8; 8]), URL_SAFE_NO_PAD.encode([2u8; 32]));
        assert!(OpenMessage::parse(data.as_bytes()).is_err());
    }

    #[test]
    fn test_request_payload_may_contain_separator() {
        let request = Request::new("tok", Command::AddData, Bytes::from_static(b"a;b;\x00c"));
        let encoded = request.encode();
        assert_eq!(&encoded[..], b"tok;ADDDATA;a;b;\x00c");

        let parsed = Request::parse(&encoded).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_request_unknown_command() {
        let result = Request::parse(b"tok;DROPTABLE;x");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_response_forms() {
        assert_eq!(Response::parse(b"OK").unwrap(), Response::ack());

        let bare_error = Response::parse(b"ERROR;bad credentials").unwrap();
        assert_eq!(bare_error.echo, None);
        assert_eq!(bare_error.reply, Reply::Error("bad credentials".to_string()));

        let ok1 = Response::parse(b"echo;OK;1").unwrap();
        assert_eq!(ok1.echo.as_deref(), Some(&b"echo"[..]));
        assert_eq!(ok1.reply.discriminant(), Some(&b"1"[..]));

        let ok2 = Response::parse(b"echo;OK;2;sealed;bytes").unwrap();
        assert_eq!(ok2.reply.discriminant(), Some(&b"2"[..]));
        assert_eq!(ok2.reply.detail(), Some(&b"sealed;bytes"[..]));
        assert_eq!(ok2.reply.body(), Some(&b"2;sealed;bytes"[..]));

        let err = Response::parse(b"echo;ERROR;no;way").unwrap();
        assert_eq!(err.reply, Reply::Error("no;way".to_string()));
    }

    #[test]
    fn test_response_encode_matches_wire() {
        let ok = Response::ok("e", Some(Bytes::from_static(b"2")));
        assert_eq!(&ok.encode()[..], b"e;OK;2");

        let err = Response::error(None, "Invalid login");
        assert_eq!(&err.encode()[..], b"ERROR;Invalid login");
    }

    #[test]
    fn test_response_without_marker() {
        assert!(Response::parse(b"echo;MAYBE").is_err());
        assert!(Response::parse(b"echo").is_err());
    }

    #[test]
    fn test_split_echo_ahead_of_unknown_marker() {
        let (echo, rest) = Response::split_echo(b"echo;MAYBE;later");
        assert_eq!(echo.as_deref(), Some(&b"echo"[..]));
        assert_eq!(rest, b"MAYBE;later");
        assert!(Reply::parse(rest).is_err());

        let (echo, rest) = Response::split_echo(b"ERROR;denied");
        assert_eq!(echo, None);
        assert_eq!(Reply::parse(rest).unwrap(), Reply::Error("denied".to_string()));
    }
}
