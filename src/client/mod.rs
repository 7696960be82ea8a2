//! # Vault Client
//!
//! [`ClientContext`] holds everything one connection knows: its state, the
//! ephemeral key pair, session cipher and challenger, the master secret and
//! the outbound queue. [`ClientHandler`] wraps it in the per-connection lock
//! shared by the reader task and user intents, so a message write and the
//! state change that follows it always happen together.
//!
//! ```text
//! SessionOpen -> SessionEstablished -> AwaitingCredentials
//!   -(credentials)-> LoginOrCreate -> Login | Creation -> Configuration
//!   -(configuration)-> ConfigurationAck -> Ready <-> AddData | DeleteData | SearchData
//! ```

mod state;

pub use state::ClientState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::challenge::Challenger;
use crate::crypto::{
    derive_master_secret, random_bytes, KdfParams, KeyPair, MasterSecret, SessionCipher,
    SessionKeys,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::keyhandler::LayerSuite;
use crate::message::Command;
use crate::notify::{Notification, Notifier};
use crate::transport::{Outbound, Transport};
use crate::OPEN_NONCE_SIZE;

/// Which branch the credentials are for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAction {
    Login,
    Create,
}

/// Per-connection client state
pub struct ClientContext {
    state: ClientState,
    keypair: KeyPair,
    client_nonce: [u8; OPEN_NONCE_SIZE],
    cipher: Option<SessionCipher>,
    challenger: Option<Challenger>,
    master_secret: Option<MasterSecret>,
    login: Option<String>,
    action: AccountAction,
    suite: Option<LayerSuite>,
    pending_delete: Option<u32>,
    outbound: Outbound,
    notifier: Notifier,
}

impl ClientContext {
    /// Fresh context waiting for the server's opening message
    pub fn new(outbound: Outbound, notifier: Notifier) -> Self {
        Self {
            state: ClientState::SessionOpen,
            keypair: KeyPair::generate(),
            client_nonce: random_bytes(),
            cipher: None,
            challenger: None,
            master_secret: None,
            login: None,
            action: AccountAction::Login,
            suite: None,
            pending_delete: None,
            outbound,
            notifier,
        }
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether the connection reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }

    /// Layer suite in force after configuration
    pub fn suite(&self) -> Option<&LayerSuite> {
        self.suite.as_ref()
    }

    /// Dispatch one inbound message to the current state
    ///
    /// Failures end up as exactly one notification. Fatal ones also close
    /// the context.
    pub fn handle(&mut self, message: &[u8]) {
        let state = self.state;
        let result = match state.step() {
            Some(step) => step(self, message),
            None if state == ClientState::Closed => return,
            None => Err(ProtocolError::UnexpectedMessage {
                state: state.name().to_string(),
                detail: "no request in flight".to_string(),
            }),
        };

        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn fail(&mut self, error: ProtocolError) {
        if error.is_fatal() {
            tracing::warn!("Protocol failure in {}: {}", self.state, error);
            self.notifier.error(error);
            self.close();
        } else {
            tracing::warn!("Request rejected in {}: {}", self.state, error);
            self.notifier.error(error);
        }
    }

    /// Enter the terminal state
    pub fn close(&mut self) {
        if self.state != ClientState::Closed {
            self.transition(ClientState::Closed);
            self.master_secret = None;
            self.notifier.notify(Notification::Closed);
        }
    }

    /// The transport went away underneath the context
    pub fn connection_lost(&mut self, error: ProtocolError) {
        if self.is_closed() {
            return;
        }
        match error {
            ProtocolError::ConnectionClosed => tracing::info!("Server closed the connection"),
            e => {
                tracing::warn!("Connection lost: {}", e);
                self.notifier.error(e);
            }
        }
        self.close();
    }

    fn transition(&mut self, next: ClientState) {
        tracing::debug!("Client state {} -> {}", self.state, next);
        self.state = next;
    }

    fn install_session(&mut self, keys: &SessionKeys) -> ProtocolResult<()> {
        self.cipher = Some(SessionCipher::new(&keys.cipher_key)?);
        self.challenger = Some(Challenger::new(&keys.challenge_key));
        Ok(())
    }

    fn cipher(&self) -> ProtocolResult<&SessionCipher> {
        self.cipher.as_ref().ok_or_else(|| ProtocolError::UnexpectedMessage {
            state: self.state.name().to_string(),
            detail: "session keys not established".to_string(),
        })
    }

    fn challenger_mut(&mut self) -> ProtocolResult<&mut Challenger> {
        let state = self.state.name();
        self.challenger
            .as_mut()
            .ok_or_else(|| ProtocolError::UnexpectedMessage {
                state: state.to_string(),
                detail: "session keys not established".to_string(),
            })
    }

    fn send(&self, payload: Bytes) -> ProtocolResult<()> {
        self.outbound
            .send(payload)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn send_request(&mut self, command: Command, plaintext: &[u8]) -> ProtocolResult<()> {
        let request = state::build_request(self, command, plaintext)?;
        self.send(request)
    }

    fn require(&self, expected: ClientState, intent: &str) -> ProtocolResult<()> {
        if self.state != expected {
            return Err(ProtocolError::InvalidStateTransition {
                from: self.state.name().to_string(),
                to: intent.to_string(),
            });
        }
        Ok(())
    }

    /// Check credentials could be submitted right now
    pub fn check_credentials_allowed(&self) -> ProtocolResult<()> {
        let in_flight = self.challenger.as_ref().map_or(false, |c| c.has_pending());
        if !self.state.accepts_credentials() || in_flight {
            return Err(ProtocolError::InvalidStateTransition {
                from: self.state.name().to_string(),
                to: "credentials".to_string(),
            });
        }
        Ok(())
    }

    /// Send the master secret derived from the user's credentials
    pub fn submit_credentials(
        &mut self,
        login: String,
        master_secret: MasterSecret,
        action: AccountAction,
    ) -> ProtocolResult<()> {
        self.check_credentials_allowed()?;

        self.send_request(Command::Session, master_secret.as_bytes())?;
        self.master_secret = Some(master_secret);
        self.login = Some(login);
        self.action = action;
        self.transition(ClientState::LoginOrCreate);
        Ok(())
    }

    /// Send the local layer configuration
    pub fn send_configuration(&mut self, suite: &LayerSuite) -> ProtocolResult<()> {
        self.require(ClientState::Configuration, "configuration")?;

        self.send_request(Command::Configuration, suite.to_string().as_bytes())?;
        self.suite = Some(suite.clone());
        self.transition(ClientState::ConfigurationAck);
        Ok(())
    }

    /// Store a new entry
    pub fn add_data(&mut self, fields: &[String]) -> ProtocolResult<()> {
        self.require(ClientState::Ready, "add")?;

        let payload = bincode::serialize(fields)?;
        self.send_request(Command::AddData, &payload)?;
        self.transition(ClientState::AddData);
        Ok(())
    }

    /// Delete an entry by index
    pub fn delete_data(&mut self, index: u32) -> ProtocolResult<()> {
        self.require(ClientState::Ready, "delete")?;

        self.send_request(Command::DeleteData, index.to_string().as_bytes())?;
        self.pending_delete = Some(index);
        self.transition(ClientState::DeleteData);
        Ok(())
    }

    /// Search entries, an empty pattern lists them all
    pub fn search_data(&mut self, pattern: &str) -> ProtocolResult<()> {
        self.require(ClientState::Ready, "search")?;

        self.send_request(Command::SearchData, pattern.as_bytes())?;
        self.transition(ClientState::SearchData);
        Ok(())
    }
}

/// Connected client: reader task plus intents under the connection lock
pub struct ClientHandler {
    context: Arc<Mutex<ClientContext>>,
    kdf: KdfParams,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientHandler {
    /// Connect and start processing server messages
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        kdf: KdfParams,
        notifier: Notifier,
    ) -> ProtocolResult<Self> {
        let transport = Transport::connect(addr, connect_timeout).await?;
        tracing::info!("Connected to {}", transport.peer_addr());

        let (mut reader, writer) = transport.into_split();
        let (outbound, writer) = writer.spawn();
        let context = Arc::new(Mutex::new(ClientContext::new(outbound, notifier)));

        let shared = Arc::clone(&context);
        let reader = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(message) => {
                        let mut ctx = shared.lock().await;
                        ctx.handle(&message);
                        if ctx.is_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        shared.lock().await.connection_lost(e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            context,
            kdf,
            reader,
            writer,
        })
    }

    /// Current state
    pub async fn state(&self) -> ClientState {
        self.context.lock().await.state()
    }

    /// Log into an existing account
    pub async fn login(&self, login: &str, password: &str) -> ProtocolResult<()> {
        self.credentials(login, password, AccountAction::Login).await
    }

    /// Create a new account
    pub async fn create_account(&self, login: &str, password: &str) -> ProtocolResult<()> {
        self.credentials(login, password, AccountAction::Create).await
    }

    async fn credentials(
        &self,
        login: &str,
        password: &str,
        action: AccountAction,
    ) -> ProtocolResult<()> {
        self.context.lock().await.check_credentials_allowed()?;

        // Argon2 runs without the lock; the state is checked again afterwards
        let kdf = self.kdf;
        let login_owned = login.to_string();
        let password = Zeroizing::new(password.to_string());
        let master_secret = tokio::task::spawn_blocking(move || {
            derive_master_secret(&login_owned, &password, kdf)
        })
        .await??;

        self.context
            .lock()
            .await
            .submit_credentials(login.to_string(), master_secret, action)
    }

    /// Send the layer configuration
    pub async fn configure(&self, suite: &LayerSuite) -> ProtocolResult<()> {
        self.context.lock().await.send_configuration(suite)
    }

    /// Store a new entry
    pub async fn add_data(&self, fields: &[String]) -> ProtocolResult<()> {
        self.context.lock().await.add_data(fields)
    }

    /// Delete an entry
    pub async fn delete_data(&self, index: u32) -> ProtocolResult<()> {
        self.context.lock().await.delete_data(index)
    }

    /// Search entries
    pub async fn search_data(&self, pattern: &str) -> ProtocolResult<()> {
        self.context.lock().await.search_data(pattern)
    }

    /// Close the connection and wait for the writer to flush
    pub async fn close(self) {
        self.context.lock().await.close();
        self.reader.abort();
        let _ = self.reader.await;
        drop(self.context);
        let _ = self.writer.await;
    }
}
