//! Collaborator interfaces for session identity.
//!
//! The primary peer issues and resumes session ids through a
//! [`SessionRepository`]; the trust collaborator reduces a peer's
//! certificate chain to a [`Principal`], which is all the engine ever
//! consumes of it. [`VolatileRepository`] is the in-memory
//! implementation used by tests and by nodes that do not persist
//! sessions.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use uuid::Uuid;

use asterisque_core::TlsProfile;

/// Validated identity of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Principal(name.into())
    }

    /// Identity of a peer that presented no certificate.
    pub fn anonymous() -> Self {
        Principal("anonymous".to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Principal carried by a wire's TLS descriptor, or anonymous for a
    /// plaintext transport.
    pub fn from_tls(tls: Option<&TlsProfile>) -> Self {
        match tls {
            Some(profile) => Principal::new(profile.peer_principal.clone()),
            None => Principal::anonymous(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-value store the primary consults during the handshake to issue
/// fresh session ids and resume prior ones.
pub trait SessionRepository: Send + Sync {
    fn next_uuid(&self) -> Uuid;

    fn store(&self, principal: &Principal, id: Uuid, data: Vec<u8>, expires_at_millis: i64);

    /// One-shot retrieval: a stored entry can be resumed at most once.
    fn load_and_delete(&self, principal: &Principal, id: Uuid) -> Option<Vec<u8>>;
}

/// In-memory repository; entries vanish with the process.
#[derive(Default)]
pub struct VolatileRepository {
    entries: Mutex<HashMap<(Principal, Uuid), (Vec<u8>, i64)>>,
}

impl VolatileRepository {
    pub fn new() -> Self {
        VolatileRepository::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SessionRepository for VolatileRepository {
    fn next_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn store(&self, principal: &Principal, id: Uuid, data: Vec<u8>, expires_at_millis: i64) {
        self.entries
            .lock()
            .insert((principal.clone(), id), (data, expires_at_millis));
    }

    fn load_and_delete(&self, principal: &Principal, id: Uuid) -> Option<Vec<u8>> {
        let (data, expires_at_millis) = self.entries.lock().remove(&(principal.clone(), id))?;
        if expires_at_millis < now_millis() {
            return None;
        }
        Some(data)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
