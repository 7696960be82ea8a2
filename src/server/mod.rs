//! # Vault Server
//!
//! One task per connection owns a [`ServerContext`] and feeds it messages
//! strictly in arrival order. Replies go through the connection's writer
//! task. Connections only share the [`AccountStore`].
//!
//! ```text
//! accept -> OPEN sent -> Open -> Session -> Select -> Configuration -> Ready
//!                          ^                  |
//!                          +-- unknown login / account exists
//! ```

mod state;

pub use state::ServerState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use zeroize::Zeroizing;

use crate::account::{AccountRecord, AccountStore};
use crate::challenge::Challenger;
use crate::config::ServerConfig;
use crate::crypto::{account_filename, random_bytes, KeyPair, MasterSecret, SessionCipher, SessionKeys};
use crate::error::{ProtocolError, ProtocolResult};
use crate::keyhandler::{KeyHandler, LayerSuite};
use crate::message::{Command, OpenMessage, Request, Response};
use crate::transport::{Outbound, Transport, TransportListener};
use crate::OPEN_NONCE_SIZE;

/// Reason sent for an unknown account
pub const UNKNOWN_ACCOUNT: &str = "Invalid login or password";

/// Account opened by a successful login or creation
struct OpenAccount {
    filename: String,
    record: AccountRecord,
    keys: Option<Arc<KeyHandler>>,
}

/// Per-connection server state
pub struct ServerContext {
    state: ServerState,
    peer: SocketAddr,
    keypair: KeyPair,
    server_nonce: [u8; OPEN_NONCE_SIZE],
    cipher: Option<SessionCipher>,
    challenger: Option<Challenger>,
    master_secret: Option<MasterSecret>,
    account: Option<OpenAccount>,
    store: AccountStore,
    outbound: Outbound,
}

impl ServerContext {
    /// Fresh context for an accepted connection
    pub fn new(store: AccountStore, outbound: Outbound, peer: SocketAddr) -> Self {
        Self {
            state: ServerState::Open,
            peer,
            keypair: KeyPair::generate(),
            server_nonce: random_bytes(),
            cipher: None,
            challenger: None,
            master_secret: None,
            account: None,
            store,
            outbound,
        }
    }

    /// Current state
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Whether the connection reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.state == ServerState::Closed
    }

    /// Send the opening key and nonce
    pub fn open(&mut self) -> ProtocolResult<()> {
        let open = OpenMessage {
            public_key: self.keypair.public_bytes(),
            nonce: self.server_nonce,
        };
        self.send(open.encode())
    }

    /// Process one inbound message
    ///
    /// Rejections are answered in place and return `Ok`. Errors returned
    /// here are fatal and leave the context closed.
    pub async fn handle(&mut self, message: &[u8]) -> ProtocolResult<()> {
        let result = match self.state {
            ServerState::Open => self.on_open(message),
            ServerState::Closed => return Ok(()),
            _ => self.on_request(message).await,
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                self.close();
            }
        }
        result
    }

    /// Enter the terminal state, forgetting all account material
    pub fn close(&mut self) {
        self.transition(ServerState::Closed);
        self.master_secret = None;
        self.account = None;
    }

    fn transition(&mut self, next: ServerState) {
        tracing::debug!("Server state for {}: {} -> {}", self.peer, self.state, next);
        self.state = next;
    }

    fn send(&self, payload: Bytes) -> ProtocolResult<()> {
        self.outbound
            .send(payload)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn reply(&self, response: Response) -> ProtocolResult<()> {
        self.send(response.encode())
    }

    fn unexpected(&self, detail: impl Into<String>) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            state: self.state.name().to_string(),
            detail: detail.into(),
        }
    }

    fn cipher(&self) -> ProtocolResult<&SessionCipher> {
        self.cipher
            .as_ref()
            .ok_or_else(|| self.unexpected("session keys not established"))
    }

    fn master_secret(&self) -> ProtocolResult<&MasterSecret> {
        self.master_secret
            .as_ref()
            .ok_or_else(|| self.unexpected("no master secret"))
    }

    fn account(&self) -> ProtocolResult<&OpenAccount> {
        self.account
            .as_ref()
            .ok_or_else(|| self.unexpected("no account open"))
    }

    fn keys(&self) -> ProtocolResult<Arc<KeyHandler>> {
        self.account()?
            .keys
            .clone()
            .ok_or_else(|| self.unexpected("account not configured"))
    }

    /// Apply `change` to the open account's stored record
    async fn update<T, F>(&mut self, change: F) -> ProtocolResult<T>
    where
        F: FnOnce(&mut AccountRecord) -> ProtocolResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let filename = self.account()?.filename.clone();
        let (record, value) = self
            .store
            .update(&filename, self.master_secret()?, change)
            .await?;
        if let Some(account) = self.account.as_mut() {
            account.record = record;
        }
        Ok(value)
    }

    fn on_open(&mut self, message: &[u8]) -> ProtocolResult<()> {
        let client = OpenMessage::parse(message)?;
        let shared = self.keypair.agree(&client.public_key)?;
        let keys = SessionKeys::derive(&shared, &client.nonce, &self.server_nonce)?;

        self.cipher = Some(SessionCipher::new(&keys.cipher_key)?);
        self.challenger = Some(Challenger::new(&keys.challenge_key));

        self.reply(Response::ack())?;
        self.transition(ServerState::Session);
        Ok(())
    }

    async fn on_request(&mut self, message: &[u8]) -> ProtocolResult<()> {
        let request = Request::parse(message)?;
        let command = request.command;
        if !self.state.accepts(command) {
            return Err(self.unexpected(format!("{} not accepted", command)));
        }

        let echo = self
            .challenger
            .as_mut()
            .ok_or_else(|| ProtocolError::ChallengeFailure {
                label: command.to_string(),
            })?
            .answer_challenge(command.label(), &request.challenge)?;
        let echo = Bytes::from(echo);
        let payload = Zeroizing::new(self.cipher()?.open(&request.payload, command.label())?);

        match command {
            Command::Session => self.on_session(echo, &payload),
            Command::Login => self.on_login(echo, &payload).await,
            Command::Creation => self.on_creation(echo, &payload).await,
            Command::Configuration => self.on_configuration(echo, &payload).await,
            Command::AddData => self.on_add(echo, &payload).await,
            Command::DeleteData => self.on_delete(echo, &payload).await,
            Command::SearchData => self.on_search(echo, &payload).await,
        }
    }

    fn on_session(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        self.master_secret = Some(MasterSecret::from_slice(payload)?);
        self.account = None;
        self.reply(Response::ok(echo, None))?;
        self.transition(ServerState::Select);
        Ok(())
    }

    fn filename(&self, payload: &[u8]) -> ProtocolResult<String> {
        let login = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::Malformed("Login is not UTF-8".to_string()))?;
        Ok(account_filename(self.master_secret()?, login))
    }

    /// Back to waiting for a master secret
    fn restart(&mut self) {
        self.master_secret = None;
        self.account = None;
        self.transition(ServerState::Session);
    }

    async fn on_login(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        let filename = self.filename(payload)?;

        let Some(blob) = self.store.load(&filename).await? else {
            tracing::warn!("Login for unknown account from {}", self.peer);
            self.reply(Response::error(Some(echo), UNKNOWN_ACCOUNT))?;
            self.restart();
            return Ok(());
        };

        match AccountRecord::open(&blob, self.master_secret()?) {
            Ok(record) => {
                tracing::info!("Login from {}", self.peer);
                self.account = Some(OpenAccount {
                    filename,
                    record,
                    keys: None,
                });
                self.reply(Response::ok(echo, None))?;
                self.transition(ServerState::Configuration);
                Ok(())
            }
            Err(e) => {
                self.reply(Response::error(
                    Some(echo),
                    "Account record failed its integrity check",
                ))?;
                Err(e)
            }
        }
    }

    async fn on_creation(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        let filename = self.filename(payload)?;
        let record = AccountRecord::default();
        let blob = record.seal(self.master_secret()?)?;

        if self.store.create(&filename, &blob).await? {
            tracing::info!("Account created from {}", self.peer);
            self.account = Some(OpenAccount {
                filename,
                record,
                keys: None,
            });
            self.reply(Response::ok(echo, Some(Bytes::from_static(b"1"))))?;
            self.transition(ServerState::Configuration);
        } else {
            tracing::warn!("Creation of existing account from {}", self.peer);
            self.reply(Response::ok(echo, Some(Bytes::from_static(b"2"))))?;
            self.restart();
        }
        Ok(())
    }

    async fn on_configuration(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        let submitted = match std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::InvalidConfiguration("not UTF-8".to_string()))
            .and_then(str::parse::<LayerSuite>)
        {
            Ok(suite) => suite,
            Err(e) => {
                self.reply(Response::error(Some(echo), e.to_string()))?;
                return Ok(());
            }
        };

        // The first configuration of an account sticks
        let stored = match self.account()?.record.configuration.clone() {
            Some(text) => text,
            None => {
                let offered = submitted.to_string();
                self.update(move |record| Ok(record.configuration.get_or_insert(offered).clone()))
                    .await?
            }
        };
        let stored: LayerSuite = stored.parse()?;

        let body = if stored == submitted {
            Bytes::from_static(b"1")
        } else {
            tracing::info!("Client {} offered {}, keeping {}", self.peer, submitted, stored);
            let sealed = self
                .cipher()?
                .seal(stored.to_string().as_bytes(), Command::Configuration.label())?;
            let mut body = b"2;".to_vec();
            body.extend_from_slice(&sealed);
            Bytes::from(body)
        };
        let ms = self.master_secret()?.clone();
        let keys = tokio::task::spawn_blocking(move || KeyHandler::new(&ms, &stored)).await??;
        if let Some(account) = self.account.as_mut() {
            account.keys = Some(Arc::new(keys));
        }

        self.reply(Response::ok(echo, Some(body)))?;
        self.transition(ServerState::Ready);
        Ok(())
    }

    async fn on_add(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        let Ok(fields) = bincode::deserialize::<Vec<String>>(payload) else {
            self.reply(Response::error(Some(echo), "Malformed entry"))?;
            return Ok(());
        };

        let keys = self.keys()?;
        let added = self
            .update(move |record| record.add_entry(&keys, &fields))
            .await;

        match added {
            Ok(index) => self.reply(Response::ok(echo, Some(Bytes::from(index.to_string())))),
            Err(e @ ProtocolError::InvalidConfiguration(_)) => {
                self.reply(Response::error(Some(echo), e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn on_delete(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        let Some(index) = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            self.reply(Response::error(Some(echo), "Malformed index"))?;
            return Ok(());
        };

        if !self.update(move |record| Ok(record.remove_entry(index))).await? {
            return self.reply(Response::error(Some(echo), format!("No entry {}", index)));
        }
        self.reply(Response::ok(echo, None))
    }

    async fn on_search(&mut self, echo: Bytes, payload: &[u8]) -> ProtocolResult<()> {
        let pattern = String::from_utf8_lossy(payload).into_owned();
        let keys = self.keys()?;
        let record = self
            .store
            .load_record(&self.account()?.filename, self.master_secret()?)
            .await?;
        if let Some(account) = self.account.as_mut() {
            account.record = record.clone();
        }

        let found = tokio::task::spawn_blocking(move || record.search(&keys, &pattern)).await?;
        match found {
            Ok(entries) => {
                let body = bincode::serialize(&entries)?;
                let sealed = self.cipher()?.seal(&body, Command::SearchData.label())?;
                self.reply(Response::ok(echo, Some(Bytes::from(sealed))))
            }
            Err(e) => {
                self.reply(Response::error(
                    Some(echo),
                    "Stored entry failed its integrity check",
                ))?;
                Err(e)
            }
        }
    }
}

/// Drive one accepted connection until it ends
pub async fn serve_connection(
    transport: Transport,
    peer: SocketAddr,
    store: AccountStore,
    idle_timeout: Duration,
) {
    tracing::info!("Connection from {}", peer);

    let (mut reader, writer) = transport.with_read_timeout(Some(idle_timeout)).into_split();
    let (outbound, writer) = writer.spawn();
    let mut ctx = ServerContext::new(store, outbound, peer);

    if let Err(e) = ctx.open() {
        tracing::warn!("Could not open session with {}: {}", peer, e);
        return;
    }

    loop {
        match reader.recv().await {
            Ok(message) => {
                if let Err(e) = ctx.handle(&message).await {
                    tracing::warn!("Dropping {}: {}", peer, e);
                }
                if ctx.is_closed() {
                    break;
                }
            }
            Err(ProtocolError::ConnectionClosed) => {
                tracing::info!("{} disconnected", peer);
                break;
            }
            Err(e) => {
                tracing::warn!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    drop(ctx);
    let _ = writer.await;
}

/// Accept loop over a shared account store
pub struct Server {
    listener: TransportListener,
    store: AccountStore,
    idle_timeout: Duration,
}

impl Server {
    /// Open the store and bind the listener
    pub async fn bind(config: &ServerConfig) -> ProtocolResult<Self> {
        let store = AccountStore::open(&config.data_dir).await?;
        let listener = TransportListener::bind(config.listen).await?;
        tracing::info!("Listening on {}", listener.local_addr());

        Ok(Self {
            listener,
            store,
            idle_timeout: config.idle_timeout(),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task each
    pub async fn run(self) -> ProtocolResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((transport, peer)) => {
                    let store = self.store.clone();
                    let idle_timeout = self.idle_timeout;
                    tokio::spawn(serve_connection(transport, peer, store, idle_timeout));
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AccountAction, ClientContext, ClientState};
    use crate::notify::{Notification, Notifier};
    use crate::MASTER_SECRET_SIZE;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    /// Client and server contexts wired back to back in memory
    struct Pair {
        client: ClientContext,
        server: ServerContext,
        to_server: mpsc::UnboundedReceiver<Bytes>,
        to_client: mpsc::UnboundedReceiver<Bytes>,
        events: mpsc::UnboundedReceiver<Notification>,
        server_errors: Vec<ProtocolError>,
    }

    impl Pair {
        async fn new(store: &AccountStore) -> Self {
            let (client_out, to_server) = mpsc::unbounded_channel();
            let (server_out, to_client) = mpsc::unbounded_channel();
            let (notifier, events) = Notifier::channel();

            let mut pair = Self {
                client: ClientContext::new(client_out, notifier),
                server: ServerContext::new(
                    store.clone(),
                    server_out,
                    "127.0.0.1:1".parse().unwrap(),
                ),
                to_server,
                to_client,
                events,
                server_errors: Vec::new(),
            };
            pair.server.open().unwrap();
            pair.pump().await;
            assert_eq!(pair.client.state(), ClientState::AwaitingCredentials);
            pair
        }

        async fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(message) = self.to_client.try_recv() {
                    self.client.handle(&message);
                    progressed = true;
                }
                while let Ok(message) = self.to_server.try_recv() {
                    if let Err(e) = self.server.handle(&message).await {
                        self.server_errors.push(e);
                    }
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }

        async fn credentials(&mut self, seed: u8, action: AccountAction) {
            let ms = MasterSecret::from_slice(&[seed; MASTER_SECRET_SIZE]).unwrap();
            self.client
                .submit_credentials("alice".to_string(), ms, action)
                .unwrap();
            self.pump().await;
        }

        async fn configure(&mut self, suite: &LayerSuite) {
            self.client.send_configuration(suite).unwrap();
            self.pump().await;
        }

        fn events(&mut self) -> Vec<Notification> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn other_suite() -> LayerSuite {
        "xchacha20-poly1305;aes-256-gcm;xchacha20-poly1305"
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_login() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut first = Pair::new(&store).await;
        first.credentials(1, AccountAction::Create).await;
        assert_eq!(first.client.state(), ClientState::Configuration);
        assert_eq!(first.server.state(), ServerState::Configuration);
        assert!(first
            .events()
            .iter()
            .any(|e| matches!(e, Notification::AccountCreated)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let mut second = Pair::new(&store).await;
        second.credentials(1, AccountAction::Login).await;
        assert_eq!(second.client.state(), ClientState::Configuration);
        let connected = second
            .events()
            .iter()
            .filter(|e| matches!(e, Notification::Connected))
            .count();
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn test_unknown_login_then_create_on_same_connection() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut pair = Pair::new(&store).await;
        pair.credentials(2, AccountAction::Login).await;
        assert_eq!(pair.client.state(), ClientState::Login);
        assert_eq!(pair.server.state(), ServerState::Session);

        let events = pair.events();
        assert!(events
            .iter()
            .any(|e| e.message() == UNKNOWN_ACCOUNT));

        pair.credentials(2, AccountAction::Create).await;
        assert_eq!(pair.client.state(), ClientState::Configuration);
        assert!(pair.server_errors.is_empty());
    }

    #[tokio::test]
    async fn test_existing_account_creation() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        Pair::new(&store)
            .await
            .credentials(3, AccountAction::Create)
            .await;

        let mut again = Pair::new(&store).await;
        again.credentials(3, AccountAction::Create).await;
        assert_eq!(again.client.state(), ClientState::Creation);
        assert_eq!(again.server.state(), ServerState::Session);
        assert!(again
            .events()
            .iter()
            .any(|e| matches!(e, Notification::AccountExists)));
    }

    #[tokio::test]
    async fn test_configuration_negotiation() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut first = Pair::new(&store).await;
        first.credentials(4, AccountAction::Create).await;
        first.configure(&LayerSuite::default()).await;
        assert_eq!(first.client.state(), ClientState::Ready);
        assert!(first
            .events()
            .iter()
            .any(|e| matches!(e, Notification::ConfigurationAccepted)));

        let mut second = Pair::new(&store).await;
        second.credentials(4, AccountAction::Login).await;
        second.configure(&other_suite()).await;
        assert_eq!(second.client.state(), ClientState::Ready);
        assert_eq!(second.client.suite(), Some(&LayerSuite::default()));
        assert!(second
            .events()
            .iter()
            .any(|e| matches!(e, Notification::NewConfigurationAccepted)));
    }

    #[tokio::test]
    async fn test_entries_persist_across_connections() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut pair = Pair::new(&store).await;
        pair.credentials(5, AccountAction::Create).await;
        pair.configure(&LayerSuite::default()).await;

        pair.client
            .add_data(&["website".into(), "example.org".into(), "pw".into()])
            .unwrap();
        pair.pump().await;
        pair.client.add_data(&["note".into(), "milk".into()]).unwrap();
        pair.pump().await;
        pair.client.delete_data(1).unwrap();
        pair.pump().await;

        let events = pair.events();
        assert!(events.iter().any(|e| matches!(e, Notification::EntryStored(0))));
        assert!(events.iter().any(|e| matches!(e, Notification::EntryDeleted(1))));

        let mut later = Pair::new(&store).await;
        later.credentials(5, AccountAction::Login).await;
        later.configure(&LayerSuite::default()).await;
        later.client.search_data("").unwrap();
        later.pump().await;

        let entries = later
            .events()
            .into_iter()
            .find_map(|e| match e {
                Notification::Entries(entries) => Some(entries),
                _ => None,
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields[1], "example.org");
    }

    #[tokio::test]
    async fn test_two_sessions_on_one_account_keep_both_entries() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut a = Pair::new(&store).await;
        a.credentials(8, AccountAction::Create).await;
        a.configure(&LayerSuite::default()).await;
        let mut b = Pair::new(&store).await;
        b.credentials(8, AccountAction::Login).await;
        b.configure(&LayerSuite::default()).await;

        a.client.add_data(&["note".into(), "from-a".into()]).unwrap();
        a.pump().await;
        b.client.add_data(&["note".into(), "from-b".into()]).unwrap();
        b.pump().await;

        assert!(a.events().iter().any(|e| matches!(e, Notification::EntryStored(0))));
        assert!(b.events().iter().any(|e| matches!(e, Notification::EntryStored(1))));

        a.client.search_data("").unwrap();
        a.pump().await;
        let entries = a
            .events()
            .into_iter()
            .find_map(|e| match e {
                Notification::Entries(entries) => Some(entries),
                _ => None,
            })
            .unwrap();
        let values: Vec<&str> = entries.iter().map(|e| e.fields[1].as_str()).collect();
        assert_eq!(values, ["from-a", "from-b"]);
    }

    #[tokio::test]
    async fn test_tampered_record_closes_connection() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        Pair::new(&store)
            .await
            .credentials(6, AccountAction::Create)
            .await;

        let path = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let mut blob = std::fs::read(&path).unwrap();
        blob[0] ^= 0x01;
        std::fs::write(&path, blob).unwrap();

        let mut pair = Pair::new(&store).await;
        pair.credentials(6, AccountAction::Login).await;
        assert!(pair.server.is_closed());
        assert!(matches!(
            pair.server_errors.as_slice(),
            [ProtocolError::IntegrityViolation(_)]
        ));
        assert_eq!(pair.client.state(), ClientState::Login);
    }

    #[tokio::test]
    async fn test_replayed_request_rejected() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut pair = Pair::new(&store).await;
        pair.credentials(7, AccountAction::Create).await;
        pair.configure(&LayerSuite::default()).await;

        pair.client.search_data("").unwrap();
        let request = pair.to_server.try_recv().unwrap();
        pair.server.handle(&request).await.unwrap();

        let replay = pair.server.handle(&request).await;
        assert!(matches!(replay, Err(ProtocolError::ChallengeFailure { .. })));
        assert!(pair.server.is_closed());
    }

    #[tokio::test]
    async fn test_out_of_order_command_is_fatal() {
        let dir = tempdir().unwrap();
        let store = AccountStore::open(dir.path()).await.unwrap();

        let mut pair = Pair::new(&store).await;
        let result = pair.server.handle(b"token;ADDDATA;x").await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedMessage { .. })));
        assert!(pair.server.is_closed());
    }
}
