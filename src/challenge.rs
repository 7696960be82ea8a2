//! # Challenge Mechanism
//!
//! Every validated request carries a challenge token and every response to
//! it carries the matching echo:
//!
//! ```text
//! token = b64( nonce[16] || HMAC(challenge_key, "request"  || label || nonce) )
//! echo  = b64(              HMAC(challenge_key, "response" || label || nonce) )
//! ```
//!
//! The requester keeps exactly one pending challenge and consumes it on the
//! first response, so a stale echo never verifies twice. The responder keeps
//! the set of nonces it has answered in this session and refuses repeats.
//! Freshness is scoped to one session: nothing here stops a token from a
//! previous connection, but the challenge key differs per connection.

use std::collections::HashSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::crypto::{random_bytes, MacContext};
use crate::error::{ProtocolError, ProtocolResult};
use crate::{CHALLENGE_NONCE_SIZE, KEY_SIZE};

const REQUEST_DOMAIN: &[u8] = b"request";
const RESPONSE_DOMAIN: &[u8] = b"response";

/// Challenge awaiting its echo
struct PendingChallenge {
    label: Vec<u8>,
    nonce: [u8; CHALLENGE_NONCE_SIZE],
}

/// Per-session challenge state, usable from either side
pub struct Challenger {
    mac: MacContext,
    pending: Option<PendingChallenge>,
    answered: HashSet<[u8; CHALLENGE_NONCE_SIZE]>,
}

impl Challenger {
    /// Create a challenger from the session's challenge key
    pub fn new(challenge_key: &[u8; KEY_SIZE]) -> Self {
        Self {
            mac: MacContext::new(challenge_key),
            pending: None,
            answered: HashSet::new(),
        }
    }

    /// Generate a fresh challenge for `label` and remember its expected echo
    ///
    /// Replaces any challenge still pending.
    pub fn compute_challenge(&mut self, label: &[u8]) -> String {
        let nonce: [u8; CHALLENGE_NONCE_SIZE] = random_bytes();
        let tag = self.mac.compute(&[REQUEST_DOMAIN, label, &nonce]);

        let mut token = Vec::with_capacity(CHALLENGE_NONCE_SIZE + tag.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&tag);

        self.pending = Some(PendingChallenge {
            label: label.to_vec(),
            nonce,
        });

        URL_SAFE_NO_PAD.encode(token)
    }

    /// Check a response echo against the pending challenge
    ///
    /// The pending challenge is consumed whatever the outcome.
    pub fn control_challenge(&mut self, echo: &[u8]) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        let Ok(echo) = URL_SAFE_NO_PAD.decode(echo) else {
            return false;
        };
        self.mac
            .verify(&[RESPONSE_DOMAIN, &pending.label, &pending.nonce], &echo)
    }

    /// Verify a request token for `label` and produce its echo
    pub fn answer_challenge(&mut self, label: &[u8], token: &[u8]) -> ProtocolResult<String> {
        let failure = || ProtocolError::ChallengeFailure {
            label: String::from_utf8_lossy(label).into_owned(),
        };

        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| failure())?;
        if raw.len() != CHALLENGE_NONCE_SIZE + 32 {
            return Err(failure());
        }

        let (nonce_bytes, tag) = raw.split_at(CHALLENGE_NONCE_SIZE);
        if !self.mac.verify(&[REQUEST_DOMAIN, label, nonce_bytes], tag) {
            return Err(failure());
        }

        let mut nonce = [0u8; CHALLENGE_NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        if !self.answered.insert(nonce) {
            tracing::warn!("Replayed challenge nonce on {}", String::from_utf8_lossy(label));
            return Err(failure());
        }

        let echo = self.mac.compute(&[RESPONSE_DOMAIN, label, &nonce]);
        Ok(URL_SAFE_NO_PAD.encode(echo))
    }

    /// Whether a request is in flight
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the pending challenge without checking it
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Challenger, Challenger) {
        let key = random_bytes::<KEY_SIZE>();
        (Challenger::new(&key), Challenger::new(&key))
    }

    #[test]
    fn test_request_and_echo() {
        let (mut client, mut server) = pair();

        let token = client.compute_challenge(b"LOGIN");
        let echo = server.answer_challenge(b"LOGIN", token.as_bytes()).unwrap();

        assert!(client.control_challenge(echo.as_bytes()));
        assert!(!client.has_pending());
    }

    #[test]
    fn test_successive_challenges_differ() {
        let (mut client, _) = pair();
        let first = client.compute_challenge(b"LOGIN");
        let second = client.compute_challenge(b"LOGIN");
        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_echo_fails() {
        let (mut client, mut server) = pair();

        let first = client.compute_challenge(b"LOGIN");
        let stale = server.answer_challenge(b"LOGIN", first.as_bytes()).unwrap();
        assert!(client.control_challenge(stale.as_bytes()));

        let second = client.compute_challenge(b"LOGIN");
        let _ = server.answer_challenge(b"LOGIN", second.as_bytes()).unwrap();
        assert!(!client.control_challenge(stale.as_bytes()));
    }

    #[test]
    fn test_echo_without_pending_fails() {
        let (mut client, mut server) = pair();
        let token = client.compute_challenge(b"SESSION");
        let echo = server.answer_challenge(b"SESSION", token.as_bytes()).unwrap();

        client.clear_pending();
        assert!(!client.control_challenge(echo.as_bytes()));
    }

    #[test]
    fn test_label_is_bound() {
        let (mut client, mut server) = pair();

        let token = client.compute_challenge(b"LOGIN");
        let result = server.answer_challenge(b"CREATION", token.as_bytes());
        assert!(matches!(result, Err(ProtocolError::ChallengeFailure { .. })));
    }

    #[test]
    fn test_replayed_token_rejected() {
        let (mut client, mut server) = pair();

        let token = client.compute_challenge(b"ADDDATA");
        server.answer_challenge(b"ADDDATA", token.as_bytes()).unwrap();
        assert!(server.answer_challenge(b"ADDDATA", token.as_bytes()).is_err());
    }

    #[test]
    fn test_other_session_key_rejected() {
        let (mut client, _) = pair();
        let (_, mut stranger) = pair();

        let token = client.compute_challenge(b"LOGIN");
        assert!(stranger.answer_challenge(b"LOGIN", token.as_bytes()).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let (_, mut server) = pair();
        assert!(server.answer_challenge(b"LOGIN", b"not base64!").is_err());
        assert!(server.answer_challenge(b"LOGIN", b"AAAA").is_err());
    }
}
