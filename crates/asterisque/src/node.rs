//! Node: the owner of services and sessions.
//!
//! A node holds the merged function registry and the set of live
//! sessions. It interprets no protocol itself: `bind` wraps a wire into
//! a session, `shutdown` closes everything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use asterisque_core::{Error, Wire};

use crate::repository::{SessionRepository, VolatileRepository};
use crate::service::{BindError, Registry, Service};
use crate::session::{Session, SessionConfig};

pub struct Node {
    name: String,
    id: Uuid,
    registry: Arc<Registry>,
    repository: Arc<dyn SessionRepository>,
    config: SessionConfig,
    sessions: Mutex<Vec<Arc<Session>>>,
    session_seq: AtomicU64,
    closed: AtomicBool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Node {
        Node {
            name: name.into(),
            id: Uuid::new_v4(),
            registry: Arc::new(Registry::new()),
            repository: Arc::new(VolatileRepository::new()),
            config: SessionConfig::default(),
            sessions: Mutex::new(Vec::new()),
            session_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Node {
        self.id = id;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Node {
        self.config = config;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn SessionRepository>) -> Node {
        self.repository = repository;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Expose a service's functions to every session of this node.
    pub fn serve(&self, service: Service) -> Result<(), BindError> {
        self.registry.bind(service)
    }

    /// Wrap a wire into a new session and start dispatching it.
    pub fn bind(&self, wire: Arc<Wire>) -> Result<Arc<Session>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("node"));
        }
        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            format!("{}#{}", self.name, seq),
            self.id,
            self.registry.clone(),
            self.repository.clone(),
            wire,
            self.config.clone(),
        );
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.push(session.clone());
        tracing::debug!(node = %self.name, session = %session.name(), "bound");
        Ok(session)
    }

    /// Live sessions at this moment.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.clone()
    }

    /// Close every session gracefully. Further binds are refused.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in &sessions {
            session.close(true);
        }
        tracing::debug!(node = %self.name, sessions = sessions.len(), "shut down");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
