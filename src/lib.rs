//! # Mnemo Vault
//!
//! Client and server for a password vault whose secrets stay encrypted end
//! to end:
//! - X25519 key agreement per connection, HKDF-derived session keys
//! - A challenge on every request, bound to the command and the session
//! - Argon2id master secret that never leaves the client unsealed
//! - Per-field layered encryption with a 512-bit integrity tag per record
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                        Server
//!   |<------------ OPEN;pk;nonce ------------------|
//!   |------------- OPEN;pk;nonce ----------------->|
//!   |<------------ OK -----------------------------|
//!   |  [both derive cipher and challenge keys]     |
//!   |------------- ch;SESSION;{ms} --------------->|
//!   |<------------ echo;OK ------------------------|
//!   |------------- ch;LOGIN|CREATION;{login} ----->|
//!   |<------------ echo;OK[;1|2] ------------------|
//!   |------------- ch;CONFIGURATION;{suite} ------>|
//!   |<------------ echo;OK;1 | echo;OK;2;{suite} --|
//!   |------------- ch;ADDDATA|DELETEDATA|SEARCHDATA|
//! ```
//!
//! `{x}` is `x` sealed under the session cipher with the command as
//! associated data.

pub mod account;
pub mod challenge;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod infoblock;
pub mod keyhandler;
pub mod message;
pub mod notify;
pub mod server;
pub mod transport;

pub use account::{AccountRecord, AccountStore, Entry};
pub use client::{AccountAction, ClientContext, ClientHandler, ClientState};
pub use config::Config;
pub use error::{ProtocolError, ProtocolResult};
pub use infoblock::{InfoBlock, SecretInfoBlock};
pub use keyhandler::{KeyHandler, LayerAlgorithm, LayerSuite};
pub use notify::{Notification, Notifier};
pub use server::{Server, ServerContext, ServerState};

/// Protocol version identifier
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Header magic bytes for protocol identification
pub const PROTOCOL_MAGIC: [u8; 4] = *b"MNEM";

/// Nonce size for AES-GCM (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AES-GCM authentication
pub const TAG_SIZE: usize = 16;

/// Key size for AES-256 and X25519
pub const KEY_SIZE: usize = 32;

/// Opening nonce size
pub const OPEN_NONCE_SIZE: usize = 32;

/// Master secret size
pub const MASTER_SECRET_SIZE: usize = 64;

/// Challenge nonce size
pub const CHALLENGE_NONCE_SIZE: usize = 16;

/// Record integrity tag size (HMAC-SHA512)
pub const INTEGRITY_TAG_SIZE: usize = 64;

/// Largest block capacity accepted from disk
pub const MAX_CAPACITY: usize = 4096;

/// Most fields one entry may hold
pub const MAX_ENTRY_FIELDS: usize = 32;
