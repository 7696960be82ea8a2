//! Client protocol states and the step run for each inbound message.
//!
//! States carry no data. Everything mutable lives in [`ClientContext`]; a
//! state only selects which step function interprets the next message.

use std::fmt;

use bytes::Bytes;

use crate::account::Entry;
use crate::crypto::SessionKeys;
use crate::error::{ProtocolError, ProtocolResult};
use crate::keyhandler::LayerSuite;
use crate::message::{Command, OpenMessage, Reply, Request, Response};
use crate::notify::Notification;

use super::{AccountAction, ClientContext};

/// Step run on an inbound message
pub(super) type Step = fn(&mut ClientContext, &[u8]) -> ProtocolResult<()>;

/// Client side of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Waiting for the server's opening key
    SessionOpen,
    /// Own opening key sent, waiting for the acknowledgment
    SessionEstablished,
    /// Session keys ready, waiting for credentials from the user
    AwaitingCredentials,
    /// Master secret sent, waiting for the server to take it
    LoginOrCreate,
    /// Login sent
    Login,
    /// Account creation sent
    Creation,
    /// Logged in, waiting for the user's configuration
    Configuration,
    /// Configuration sent
    ConfigurationAck,
    /// Idle, data operations allowed
    Ready,
    /// Entry sent
    AddData,
    /// Deletion sent
    DeleteData,
    /// Search sent
    SearchData,
    /// Terminal
    Closed,
}

impl ClientState {
    /// State name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::SessionOpen => "SessionOpen",
            ClientState::SessionEstablished => "SessionEstablished",
            ClientState::AwaitingCredentials => "AwaitingCredentials",
            ClientState::LoginOrCreate => "LoginOrCreate",
            ClientState::Login => "Login",
            ClientState::Creation => "Creation",
            ClientState::Configuration => "Configuration",
            ClientState::ConfigurationAck => "ConfigurationAck",
            ClientState::Ready => "Ready",
            ClientState::AddData => "AddData",
            ClientState::DeleteData => "DeleteData",
            ClientState::SearchData => "SearchData",
            ClientState::Closed => "Closed",
        }
    }

    /// Whether new credentials may be submitted from here
    pub fn accepts_credentials(&self) -> bool {
        matches!(
            self,
            ClientState::AwaitingCredentials
                | ClientState::LoginOrCreate
                | ClientState::Login
                | ClientState::Creation
        )
    }

    /// Step for an inbound message, `None` when the state expects none
    pub(super) fn step(&self) -> Option<Step> {
        match self {
            ClientState::SessionOpen => Some(session_open),
            ClientState::SessionEstablished => Some(session_established),
            ClientState::LoginOrCreate => Some(login_or_create),
            ClientState::Login => Some(login),
            ClientState::Creation => Some(creation),
            ClientState::ConfigurationAck => Some(configuration_ack),
            ClientState::AddData => Some(add_data),
            ClientState::DeleteData => Some(delete_data),
            ClientState::SearchData => Some(search_data),
            ClientState::AwaitingCredentials
            | ClientState::Configuration
            | ClientState::Ready
            | ClientState::Closed => None,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check a response's echo against the pending challenge
///
/// A bare `ERROR;<reason>` carries no echo and is passed through unchecked;
/// it never advances the state.
fn check_echo(ctx: &mut ClientContext, response: &Response) -> ProtocolResult<()> {
    let label = ctx.state.name().to_string();
    let challenger = ctx.challenger_mut()?;

    match (&response.echo, &response.reply) {
        (Some(echo), _) => {
            if !challenger.control_challenge(echo) {
                return Err(ProtocolError::ChallengeFailure { label });
            }
        }
        (None, Reply::Error(_)) => challenger.clear_pending(),
        (None, Reply::Ok(_)) => return Err(ProtocolError::ChallengeFailure { label }),
    }
    Ok(())
}

fn verified(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<Response> {
    let response = Response::parse(message)?;
    check_echo(ctx, &response)?;
    Ok(response)
}

/// Check the echo first, then parse the reply leniently
///
/// `None` means the echo verified but the reply marker is not `OK` or
/// `ERROR`; the caller ignores such replies.
fn verified_or_unknown(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<Option<Response>> {
    let (echo, rest) = Response::split_echo(message);
    match Reply::parse(rest) {
        Ok(reply) => {
            let response = Response { echo, reply };
            check_echo(ctx, &response)?;
            Ok(Some(response))
        }
        Err(_) => {
            // a missing echo always comes with a known marker
            let label = ctx.state.name().to_string();
            let echo = echo.unwrap_or_default();
            if !ctx.challenger_mut()?.control_challenge(&echo) {
                return Err(ProtocolError::ChallengeFailure { label });
            }
            Ok(None)
        }
    }
}

fn session_open(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let server = OpenMessage::parse(message)?;
    let shared = ctx.keypair.agree(&server.public_key)?;
    let keys = SessionKeys::derive(&shared, &ctx.client_nonce, &server.nonce)?;
    ctx.install_session(&keys)?;

    let open = OpenMessage {
        public_key: ctx.keypair.public_bytes(),
        nonce: ctx.client_nonce,
    };
    ctx.send(open.encode())?;
    ctx.transition(ClientState::SessionEstablished);
    Ok(())
}

fn session_established(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let response = Response::parse(message)?;
    if response.echo.is_some() {
        return Err(ProtocolError::UnexpectedMessage {
            state: ctx.state.name().to_string(),
            detail: "session acknowledgement carries an echo".to_string(),
        });
    }
    match response.reply {
        Reply::Ok(_) => {
            ctx.transition(ClientState::AwaitingCredentials);
            ctx.notifier.status("Session established");
            Ok(())
        }
        Reply::Error(reason) => Err(ProtocolError::UnexpectedMessage {
            state: ctx.state.name().to_string(),
            detail: format!("session refused: {}", reason),
        }),
    }
}

fn login_or_create(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let response = verified(ctx, message)?;
    if let Reply::Error(reason) = response.reply {
        ctx.transition(ClientState::AwaitingCredentials);
        return Err(ProtocolError::AuthenticationRejected(reason));
    }

    let (command, next) = match ctx.action {
        AccountAction::Login => (Command::Login, ClientState::Login),
        AccountAction::Create => (Command::Creation, ClientState::Creation),
    };
    let login = ctx.login.clone().unwrap_or_default();
    ctx.send_request(command, login.as_bytes())?;
    ctx.transition(next);
    Ok(())
}

fn login(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let Some(response) = verified_or_unknown(ctx, message)? else {
        tracing::debug!("Ignoring unrecognized login response");
        return Ok(());
    };

    match response.reply {
        Reply::Ok(_) => {
            ctx.transition(ClientState::Configuration);
            ctx.notifier.notify(Notification::Connected);
            Ok(())
        }
        Reply::Error(reason) => Err(ProtocolError::AuthenticationRejected(reason)),
    }
}

fn creation(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let Some(response) = verified_or_unknown(ctx, message)? else {
        tracing::debug!("Ignoring unrecognized creation response");
        return Ok(());
    };

    match (&response.reply, response.reply.discriminant()) {
        (Reply::Ok(_), Some(b"1")) => {
            ctx.transition(ClientState::Configuration);
            ctx.notifier.notify(Notification::AccountCreated);
            Ok(())
        }
        (Reply::Ok(_), Some(b"2")) => {
            ctx.notifier.notify(Notification::AccountExists);
            Ok(())
        }
        (Reply::Error(reason), _) => Err(ProtocolError::AuthenticationRejected(reason.clone())),
        (Reply::Ok(_), _) => {
            tracing::debug!("Ignoring creation response without known discriminant");
            Ok(())
        }
    }
}

fn configuration_ack(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let response = verified(ctx, message)?;

    match (&response.reply, response.reply.discriminant()) {
        (Reply::Ok(_), Some(b"1")) => {
            ctx.transition(ClientState::Ready);
            ctx.notifier.notify(Notification::ConfigurationAccepted);
            Ok(())
        }
        (Reply::Ok(_), Some(b"2")) => {
            if let Some(sealed) = response.reply.detail() {
                let text = ctx.cipher()?.open(sealed, Command::Configuration.label())?;
                let suite: LayerSuite = String::from_utf8(text)
                    .map_err(|_| ProtocolError::Malformed("Configuration is not UTF-8".to_string()))?
                    .parse()?;
                tracing::info!("Adopting server configuration {}", suite);
                ctx.suite = Some(suite);
            }
            ctx.transition(ClientState::Ready);
            ctx.notifier.notify(Notification::NewConfigurationAccepted);
            Ok(())
        }
        (Reply::Error(reason), _) => {
            ctx.transition(ClientState::Configuration);
            Err(ProtocolError::AuthenticationRejected(reason.clone()))
        }
        (Reply::Ok(_), other) => Err(ProtocolError::UnexpectedMessage {
            state: ctx.state.name().to_string(),
            detail: format!(
                "unknown configuration discriminant {:?}",
                other.map(String::from_utf8_lossy)
            ),
        }),
    }
}

/// Common shape of the data operation replies
fn data_reply(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<Option<Bytes>> {
    let response = verified(ctx, message)?;
    ctx.transition(ClientState::Ready);
    match response.reply {
        Reply::Ok(body) => Ok(body),
        Reply::Error(reason) => Err(ProtocolError::AuthenticationRejected(reason)),
    }
}

fn add_data(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let body = data_reply(ctx, message)?.unwrap_or_default();
    let index = std::str::from_utf8(&body)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| ProtocolError::Malformed("ADDDATA reply without index".to_string()))?;
    ctx.notifier.notify(Notification::EntryStored(index));
    Ok(())
}

fn delete_data(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let index = ctx.pending_delete.take();
    data_reply(ctx, message)?;
    if let Some(index) = index {
        ctx.notifier.notify(Notification::EntryDeleted(index));
    }
    Ok(())
}

fn search_data(ctx: &mut ClientContext, message: &[u8]) -> ProtocolResult<()> {
    let sealed = data_reply(ctx, message)?
        .ok_or_else(|| ProtocolError::Malformed("SEARCHDATA reply without body".to_string()))?;
    let plain = ctx.cipher()?.open(&sealed, Command::SearchData.label())?;
    let entries: Vec<Entry> = bincode::deserialize(&plain)?;
    ctx.notifier.notify(Notification::Entries(entries));
    Ok(())
}

/// Encode a request for `command` with a fresh challenge and sealed payload
pub(super) fn build_request(
    ctx: &mut ClientContext,
    command: Command,
    plaintext: &[u8],
) -> ProtocolResult<Bytes> {
    let sealed = ctx.cipher()?.seal(plaintext, command.label())?;
    let token = ctx.challenger_mut()?.compute_challenge(command.label());
    Ok(Request::new(token, command, sealed).encode())
}
