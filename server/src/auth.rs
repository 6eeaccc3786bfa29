//! Pluggable authentication mechanisms
//!
//! Mechanisms are registered once at setup under a name and a flag saying
//! whether they may only be offered on a secure transport. The registry is
//! ordered by [`AuthenticationKey`], so the list offered to a client is
//! sorted by name and then by the flag.

use crate::client::Client;
use crate::session::SessionPtr;
use log::debug;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of one authentication step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// More data is needed; the payload goes back to the client
    Ongoing(Vec<u8>),
    /// Authentication finished; the payload carries any final data
    Succeeded(Vec<u8>),
    Failed(String),
}

/// Drives one authentication exchange for a session
pub trait AuthenticationHandler: Send {
    fn handle_start(&mut self, mechanism: &str, initial_response: &[u8]) -> AuthResponse;

    fn handle_continue(&mut self, data: &[u8]) -> AuthResponse;

    /// Called once the exchange is over, whatever the outcome
    fn done(&mut self) {}
}

/// Builds authentication handlers bound to a session
pub trait AuthenticationMechanism: Send + Sync {
    fn create(&self, session: SessionPtr) -> Box<dyn AuthenticationHandler>;
}

impl<F> AuthenticationMechanism for F
where
    F: Fn(SessionPtr) -> Box<dyn AuthenticationHandler> + Send + Sync,
{
    fn create(&self, session: SessionPtr) -> Box<dyn AuthenticationHandler> {
        self(session)
    }
}

/// Registry key: mechanism name plus whether it needs a secure transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationKey {
    pub name: String,
    pub requires_secure_transport: bool,
}

impl AuthenticationKey {
    pub fn new(name: impl Into<String>, requires_secure_transport: bool) -> Self {
        Self {
            name: name.into(),
            requires_secure_transport,
        }
    }

    /// Whether a client with the given transport security may use it
    pub fn usable_by(&self, secure: bool) -> bool {
        secure || !self.requires_secure_transport
    }
}

impl Ord for AuthenticationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.name.as_str(), self.requires_secure_transport)
            .cmp(&(other.name.as_str(), other.requires_secure_transport))
    }
}

impl PartialOrd for AuthenticationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered map of registered mechanisms
///
/// Written during setup and read concurrently afterwards; nothing is ever
/// removed.
#[derive(Default)]
pub struct AuthenticationRegistry {
    mechanisms: RwLock<BTreeMap<AuthenticationKey, Arc<dyn AuthenticationMechanism>>>,
}

impl AuthenticationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mechanism
    ///
    /// Registering the same name and flag again replaces the earlier
    /// mechanism: the last registration wins, intentionally. Returns true if
    /// an earlier registration was replaced.
    pub fn add(
        &self,
        name: &str,
        mechanism: Arc<dyn AuthenticationMechanism>,
        requires_secure_transport: bool,
    ) -> bool {
        let key = AuthenticationKey::new(name, requires_secure_transport);
        let replaced = self.mechanisms.write().insert(key, mechanism).is_some();
        if replaced {
            debug!(
                "Authentication mechanism {} (secure only: {}) replaced",
                name, requires_secure_transport
            );
        }
        replaced
    }

    /// Names of mechanisms a client with the given security may use
    ///
    /// A name registered under both flags is listed once.
    pub fn names_for(&self, secure: bool) -> Vec<String> {
        let mechanisms = self.mechanisms.read();
        let mut names: Vec<String> = Vec::with_capacity(mechanisms.len());
        for key in mechanisms.keys().filter(|key| key.usable_by(secure)) {
            if names.last() != Some(&key.name) {
                names.push(key.name.clone());
            }
        }
        names
    }

    /// Mechanism with the given name usable at the given security level
    ///
    /// Secure clients get the secure-only registration when both exist.
    pub fn find(&self, name: &str, secure: bool) -> Option<Arc<dyn AuthenticationMechanism>> {
        let mechanisms = self.mechanisms.read();
        let lookup = |flag: bool| mechanisms.get(&AuthenticationKey::new(name, flag)).cloned();

        if secure {
            lookup(true).or_else(|| lookup(false))
        } else {
            lookup(false)
        }
    }

    /// Builds a handler for `session`, or `None` if its client may not use
    /// any mechanism called `name`
    pub fn handler(&self, name: &str, session: SessionPtr) -> Option<Box<dyn AuthenticationHandler>> {
        let secure = session.client().is_secure();
        let mechanism = self.find(name, secure)?;
        Some(mechanism.create(session))
    }

    /// Convenience wrapper over [`names_for`](Self::names_for)
    pub fn names_for_client(&self, client: &dyn Client) -> Vec<String> {
        self.names_for(client.is_secure())
    }

    pub fn len(&self) -> usize {
        self.mechanisms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientPtr;
    use crate::session::Session;
    use crate::test_support::MockClient;

    struct TestSession {
        client: ClientPtr,
    }

    impl Session for TestSession {
        fn session_id(&self) -> u32 {
            1
        }

        fn client(&self) -> ClientPtr {
            Arc::clone(&self.client)
        }
    }

    /// Handler that succeeds immediately and reports which mechanism built it
    struct TaggedHandler {
        tag: &'static str,
    }

    impl AuthenticationHandler for TaggedHandler {
        fn handle_start(&mut self, _mechanism: &str, _initial_response: &[u8]) -> AuthResponse {
            AuthResponse::Succeeded(self.tag.as_bytes().to_vec())
        }

        fn handle_continue(&mut self, _data: &[u8]) -> AuthResponse {
            AuthResponse::Failed("unexpected continuation".to_string())
        }
    }

    fn tagged(tag: &'static str) -> Arc<dyn AuthenticationMechanism> {
        Arc::new(move |_session: SessionPtr| -> Box<dyn AuthenticationHandler> {
            Box::new(TaggedHandler { tag })
        })
    }

    fn session_for(client: ClientPtr) -> SessionPtr {
        Arc::new(TestSession { client })
    }

    fn start(handler: &mut dyn AuthenticationHandler) -> AuthResponse {
        handler.handle_start("any", b"")
    }

    #[test]
    fn test_key_ordering() {
        let a = AuthenticationKey::new("MYSQL41", true);
        let b = AuthenticationKey::new("PLAIN", false);
        let c = AuthenticationKey::new("PLAIN", true);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.cmp(&b.clone()), Ordering::Equal);
    }

    #[test]
    fn test_usable_by() {
        let open = AuthenticationKey::new("PLAIN", false);
        let restricted = AuthenticationKey::new("MYSQL41", true);

        assert!(open.usable_by(false));
        assert!(open.usable_by(true));
        assert!(!restricted.usable_by(false));
        assert!(restricted.usable_by(true));
    }

    #[test]
    fn test_mechanism_listing_by_security() {
        let registry = AuthenticationRegistry::new();
        registry.add("PLAIN", tagged("plain"), false);
        registry.add("MYSQL41", tagged("mysql41"), true);

        assert_eq!(registry.names_for(false), vec!["PLAIN"]);
        assert_eq!(registry.names_for(true), vec!["MYSQL41", "PLAIN"]);
    }

    #[test]
    fn test_listing_for_clients() {
        let registry = AuthenticationRegistry::new();
        registry.add("PLAIN", tagged("plain"), false);
        registry.add("MYSQL41", tagged("mysql41"), true);

        let insecure = MockClient::new(1);
        let secure = MockClient::secure(2);

        assert_eq!(registry.names_for_client(insecure.as_ref()), vec!["PLAIN"]);
        assert_eq!(
            registry.names_for_client(secure.as_ref()),
            vec!["MYSQL41", "PLAIN"]
        );
    }

    #[test]
    fn test_name_under_both_flags_listed_once() {
        let registry = AuthenticationRegistry::new();
        registry.add("SHA256", tagged("open"), false);
        registry.add("SHA256", tagged("secure"), true);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names_for(true), vec!["SHA256"]);
        assert_eq!(registry.names_for(false), vec!["SHA256"]);
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = AuthenticationRegistry::new();
        assert!(!registry.add("PLAIN", tagged("first"), false));
        assert!(registry.add("PLAIN", tagged("second"), false));

        assert_eq!(registry.len(), 1);

        let session = session_for(MockClient::new(1));
        let mut handler = registry.handler("PLAIN", session).unwrap();
        assert_eq!(start(handler.as_mut()), AuthResponse::Succeeded(b"second".to_vec()));
    }

    #[test]
    fn test_handler_lookup_respects_security() {
        let registry = AuthenticationRegistry::new();
        registry.add("MYSQL41", tagged("mysql41"), true);

        let insecure = session_for(MockClient::new(1));
        assert!(registry.handler("MYSQL41", insecure).is_none());

        let secure = session_for(MockClient::secure(2));
        assert!(registry.handler("MYSQL41", secure).is_some());
    }

    #[test]
    fn test_secure_client_prefers_secure_registration() {
        let registry = AuthenticationRegistry::new();
        registry.add("SHA256", tagged("open"), false);
        registry.add("SHA256", tagged("secure"), true);

        let mut handler = registry
            .handler("SHA256", session_for(MockClient::secure(1)))
            .unwrap();
        assert_eq!(start(handler.as_mut()), AuthResponse::Succeeded(b"secure".to_vec()));

        let mut handler = registry
            .handler("SHA256", session_for(MockClient::new(2)))
            .unwrap();
        assert_eq!(start(handler.as_mut()), AuthResponse::Succeeded(b"open".to_vec()));
    }

    #[test]
    fn test_secure_client_can_use_open_mechanism() {
        let registry = AuthenticationRegistry::new();
        registry.add("PLAIN", tagged("plain"), false);

        assert!(registry
            .handler("PLAIN", session_for(MockClient::secure(1)))
            .is_some());
    }

    #[test]
    fn test_unknown_mechanism() {
        let registry = AuthenticationRegistry::new();
        registry.add("PLAIN", tagged("plain"), false);

        assert!(registry
            .handler("GSSAPI", session_for(MockClient::secure(1)))
            .is_none());
        assert!(registry.find("GSSAPI", true).is_none());
    }

    #[test]
    fn test_empty_registry() {
        let registry = AuthenticationRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names_for(true).is_empty());
    }
}
