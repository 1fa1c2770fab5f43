//! Secure event bridge.
//!
//! One explicitly constructed `Arc<EventBridge>` is handed to every
//! collaborator. Publishing, registering collaborators and issuing tokens
//! require an [`AccessToken`]; subscribing does not.
//!
//! Tokens are 32 random bytes from the OS RNG, base64url encoded. The bridge
//! keeps only their SHA-256 digests.

pub mod events;

pub use events::{BridgeEvent, EngineStatusEvent, StreamEvent};

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{QuellError, Result};

/// Broadcast channel capacity: slow subscribers lag rather than block publishers.
const BROADCAST_CAP: usize = 256;

const TOKEN_BYTES: usize = 32;

type Digest32 = [u8; 32];
type Collaborator = Arc<dyn Any + Send + Sync>;

/// Bearer credential for privileged bridge operations.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    fn generate() -> Self {
        let mut raw = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    fn digest(&self) -> Digest32 {
        Sha256::digest(self.0.as_bytes()).into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

impl From<String> for AccessToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

pub struct EventBridge {
    tx: broadcast::Sender<BridgeEvent>,
    tokens: RwLock<HashSet<Digest32>>,
    collaborators: RwLock<HashMap<String, Collaborator>>,
}

impl EventBridge {
    /// Create a bridge and its owner token.
    pub fn new() -> (Arc<Self>, AccessToken) {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        let owner = AccessToken::generate();
        let bridge = Self {
            tx,
            tokens: RwLock::new(HashSet::from([owner.digest()])),
            collaborators: RwLock::new(HashMap::new()),
        };
        (Arc::new(bridge), owner)
    }

    pub fn is_authorized(&self, token: &AccessToken) -> bool {
        self.tokens.read().contains(&token.digest())
    }

    fn authorize(&self, token: &AccessToken, action: &str) -> Result<()> {
        if self.is_authorized(token) {
            Ok(())
        } else {
            warn!(action, "rejected bridge call with unknown token");
            Err(QuellError::Permission(format!("{action}: invalid access token")))
        }
    }

    pub fn issue_token(&self, by: &AccessToken) -> Result<AccessToken> {
        self.authorize(by, "issue token")?;
        let token = AccessToken::generate();
        self.tokens.write().insert(token.digest());
        debug!(live_tokens = self.tokens.read().len(), "bridge token issued");
        Ok(token)
    }

    /// Revoke `token`. Returns `false` if it was not live.
    pub fn revoke(&self, by: &AccessToken, token: &AccessToken) -> Result<bool> {
        self.authorize(by, "revoke token")?;
        Ok(self.tokens.write().remove(&token.digest()))
    }

    pub fn register<T>(&self, by: &AccessToken, name: &str, value: Arc<T>) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        self.authorize(by, "register collaborator")?;
        let previous = self
            .collaborators
            .write()
            .insert(name.to_string(), value as Collaborator);
        if previous.is_some() {
            debug!(name, "bridge collaborator replaced");
        }
        Ok(())
    }

    pub fn unregister(&self, by: &AccessToken, name: &str) -> Result<bool> {
        self.authorize(by, "unregister collaborator")?;
        Ok(self.collaborators.write().remove(name).is_some())
    }

    /// Look up a collaborator by name and concrete type.
    pub fn collaborator<T>(&self, by: &AccessToken, name: &str) -> Result<Option<Arc<T>>>
    where
        T: Any + Send + Sync,
    {
        self.authorize(by, "lookup collaborator")?;
        let found = self.collaborators.read().get(name).cloned();
        Ok(found.and_then(|c| c.downcast::<T>().ok()))
    }

    /// Broadcast `event`. Returns the number of subscribers reached.
    pub fn publish(&self, by: &AccessToken, event: BridgeEvent) -> Result<usize> {
        self.authorize(by, "publish")?;
        // No subscribers is not an error.
        Ok(self.tx.send(event).unwrap_or(0))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }
}

impl fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBridge")
            .field("tokens", &self.tokens.read().len())
            .field("collaborators", &self.collaborators.read().len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// A bridge plus the token a component publishes with.
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    pub bridge: Arc<EventBridge>,
    pub token: AccessToken,
}

impl BridgeHandle {
    pub fn new(bridge: Arc<EventBridge>, token: AccessToken) -> Self {
        Self { bridge, token }
    }

    /// Publish, logging instead of failing. Used from background tasks.
    pub fn emit(&self, event: BridgeEvent) {
        if let Err(e) = self.bridge.publish(&self.token, event) {
            warn!(error = %e, "bridge publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn error_event() -> BridgeEvent {
        BridgeEvent::Error(QuellError::Network("offline".into()).record())
    }

    #[test]
    fn tokens_are_base64url_of_32_bytes() {
        let (_bridge, token) = EventBridge::new();
        assert_eq!(token.as_str().len(), 43);
        assert!(token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!format!("{token:?}").contains(token.as_str()));
    }

    #[test]
    fn unknown_token_cannot_publish() {
        let (bridge, _owner) = EventBridge::new();
        let forged = AccessToken::from("forged".to_string());
        let err = bridge.publish(&forged, error_event()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Permission);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let (bridge, owner) = EventBridge::new();
        assert_eq!(bridge.publish(&owner, error_event()).unwrap(), 0);

        let mut rx = bridge.subscribe();
        assert_eq!(bridge.publish(&owner, error_event()).unwrap(), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel(), "quell://error");
    }

    #[test]
    fn issued_tokens_work_until_revoked() {
        let (bridge, owner) = EventBridge::new();
        let child = bridge.issue_token(&owner).unwrap();
        assert!(bridge.publish(&child, error_event()).is_ok());
        assert!(bridge.revoke(&owner, &child).unwrap());
        assert!(!bridge.revoke(&owner, &child).unwrap());
        assert!(bridge.publish(&child, error_event()).is_err());
        assert!(bridge.is_authorized(&owner));
    }

    #[test]
    fn collaborators_downcast_by_type() {
        let (bridge, owner) = EventBridge::new();
        bridge.register(&owner, "decoder", Arc::new(42u32)).unwrap();
        let hit: Option<Arc<u32>> = bridge.collaborator(&owner, "decoder").unwrap();
        assert_eq!(hit.as_deref(), Some(&42));
        let wrong: Option<Arc<String>> = bridge.collaborator(&owner, "decoder").unwrap();
        assert!(wrong.is_none());
        assert!(bridge.unregister(&owner, "decoder").unwrap());

        let forged = AccessToken::from("x".to_string());
        assert!(bridge.register(&forged, "decoder", Arc::new(1u8)).is_err());
    }
}
