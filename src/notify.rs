//! Observer notifications emitted by the client state machine.

use tokio::sync::mpsc;

use crate::account::Entry;
use crate::error::ProtocolError;

/// Event surfaced to whatever renders the client
#[derive(Debug)]
pub enum Notification {
    /// Informational progress text
    Status(String),
    /// Login accepted
    Connected,
    /// New account stored
    AccountCreated,
    /// Creation refused, the account is already there
    AccountExists,
    /// Server took the submitted configuration as is
    ConfigurationAccepted,
    /// Server kept its own configuration and the client adopted it
    NewConfigurationAccepted,
    /// Entry stored under this index
    EntryStored(u32),
    /// Entry removed
    EntryDeleted(u32),
    /// Search results
    Entries(Vec<Entry>),
    /// Rejection or failure
    Error(ProtocolError),
    /// Connection is gone
    Closed,
}

impl Notification {
    /// Display text as the console shows it
    pub fn message(&self) -> String {
        match self {
            Notification::Status(text) => text.clone(),
            Notification::Connected => "Connected".to_string(),
            Notification::AccountCreated => "Account created".to_string(),
            Notification::AccountExists => "Account already exists".to_string(),
            Notification::ConfigurationAccepted => "Configuration accepted".to_string(),
            Notification::NewConfigurationAccepted => "New configuration accepted".to_string(),
            Notification::EntryStored(index) => format!("Entry {} stored", index),
            Notification::EntryDeleted(index) => format!("Entry {} deleted", index),
            Notification::Entries(entries) => format!("{} entries found", entries.len()),
            Notification::Error(e) => e.to_string(),
            Notification::Closed => "Connection closed".to_string(),
        }
    }
}

/// Sending side of the notification channel
///
/// Sends never block and never fail the protocol: a dropped receiver only
/// means nobody is watching anymore.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Create a notifier and the receiver to watch it with
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit one notification
    pub fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!("Notification dropped, no observer");
        }
    }

    /// Emit a status line
    pub fn status(&self, text: impl Into<String>) {
        self.notify(Notification::Status(text.into()));
    }

    /// Emit an error
    pub fn error(&self, error: ProtocolError) {
        self.notify(Notification::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.status("Session opened");
        notifier.notify(Notification::Connected);
        notifier.error(ProtocolError::AuthenticationRejected("bad credentials".into()));

        assert!(matches!(rx.recv().await, Some(Notification::Status(_))));
        assert!(matches!(rx.recv().await, Some(Notification::Connected)));
        let last = rx.recv().await.unwrap();
        assert_eq!(last.message(), "bad credentials");
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.notify(Notification::Closed);
    }

    #[test]
    fn test_config_messages() {
        assert_eq!(
            Notification::ConfigurationAccepted.message(),
            "Configuration accepted"
        );
        assert_eq!(
            Notification::NewConfigurationAccepted.message(),
            "New configuration accepted"
        );
    }
}
