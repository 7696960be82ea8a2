//! End-to-end runs of a real server and client over loopback TCP.

use std::time::Duration;

use mnemo_vault::config::ServerConfig;
use mnemo_vault::crypto::KdfParams;
use mnemo_vault::{
    ClientHandler, ClientState, LayerSuite, Notification, Notifier, ProtocolError, Server,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn fast_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

async fn start_server(dir: &TempDir) -> std::net::SocketAddr {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.path().to_path_buf(),
        idle_timeout_secs: 30,
    };
    let server = Server::bind(&config).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());
    addr
}

async fn connect(
    addr: std::net::SocketAddr,
) -> (ClientHandler, UnboundedReceiver<Notification>) {
    let (notifier, mut events) = Notifier::channel();
    let client = ClientHandler::connect(addr, WAIT, fast_kdf(), notifier)
        .await
        .unwrap();
    next_event(&mut events, |n| matches!(n, Notification::Status(_))).await;
    (client, events)
}

/// Wait for the first notification matching `want`, failing on errors
async fn next_event<F>(events: &mut UnboundedReceiver<Notification>, want: F) -> Notification
where
    F: Fn(&Notification) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed");
        if want(&event) {
            return event;
        }
        if let Notification::Error(e) = &event {
            panic!("unexpected error notification: {}", e);
        }
    }
}

#[tokio::test]
async fn test_full_session() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir).await;

    let (client, mut events) = connect(addr).await;
    client.create_account("alice", "correct horse").await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::AccountCreated)).await;

    client.configure(&LayerSuite::default()).await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::ConfigurationAccepted)).await;

    client
        .add_data(&[
            "website".to_string(),
            "example.org".to_string(),
            "alice".to_string(),
            "s3cret".to_string(),
        ])
        .await
        .unwrap();
    next_event(&mut events, |n| matches!(n, Notification::EntryStored(0))).await;

    client.search_data("example").await.unwrap();
    match next_event(&mut events, |n| matches!(n, Notification::Entries(_))).await {
        Notification::Entries(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].fields[3], "s3cret");
        }
        _ => unreachable!(),
    }

    client.close().await;

    let (client, mut events) = connect(addr).await;
    client.login("alice", "correct horse").await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::Connected)).await;
    assert_eq!(client.state().await, ClientState::Configuration);
    client.close().await;
}

#[tokio::test]
async fn test_wrong_password_then_retry() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir).await;

    let (client, mut events) = connect(addr).await;
    client.create_account("bob", "hunter2").await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::AccountCreated)).await;
    client.close().await;

    let (client, mut events) = connect(addr).await;
    client.login("bob", "hunter3").await.unwrap();
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        Notification::Error(ProtocolError::AuthenticationRejected(_))
    ));
    assert_eq!(client.state().await, ClientState::Login);

    client.login("bob", "hunter2").await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::Connected)).await;
    client.close().await;
}

#[tokio::test]
async fn test_stored_files_hide_secrets() {
    let dir = TempDir::new().unwrap();
    let addr = start_server(&dir).await;

    let (client, mut events) = connect(addr).await;
    client.create_account("carol", "pw").await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::AccountCreated)).await;
    client.configure(&LayerSuite::default()).await.unwrap();
    next_event(&mut events, |n| matches!(n, Notification::ConfigurationAccepted)).await;
    client
        .add_data(&["note".to_string(), "the-plaintext-marker".to_string()])
        .await
        .unwrap();
    next_event(&mut events, |n| matches!(n, Notification::EntryStored(_))).await;
    client.close().await;

    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(!name.contains("carol"));

        let data = std::fs::read(entry.path()).unwrap();
        let marker = b"the-plaintext-marker";
        assert!(!data.windows(marker.len()).any(|w| w == marker));
    }
}
