//! Remote function stubs.
//!
//! A [`RemoteInterface`] is a data-driven description of the peer's
//! functions: method name → function id and priority. A [`Remote`] binds
//! that description to a live session, so application code calls by
//! name and gets back the pipe (and through it the result future).

use std::collections::HashMap;
use std::sync::Arc;

use asterisque_core::{CloseResult, Error, Value, PRIORITY_NORMAL};

use crate::pipe::Pipe;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMethod {
    pub function_id: u16,
    pub priority: i8,
}

/// Description of a peer-side interface.
#[derive(Debug, Clone, Default)]
pub struct RemoteInterface {
    name: String,
    methods: HashMap<String, RemoteMethod>,
}

impl RemoteInterface {
    pub fn new(name: impl Into<String>) -> Self {
        RemoteInterface {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a method at normal priority.
    pub fn method(self, name: impl Into<String>, function_id: u16) -> Self {
        self.method_with_priority(name, function_id, PRIORITY_NORMAL)
    }

    pub fn method_with_priority(
        mut self,
        name: impl Into<String>,
        function_id: u16,
        priority: i8,
    ) -> Self {
        self.methods.insert(
            name.into(),
            RemoteMethod {
                function_id,
                priority,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<RemoteMethod> {
        self.methods.get(name).copied()
    }
}

/// A stub for calling the peer through a session.
pub struct Remote {
    session: Arc<Session>,
    interface: RemoteInterface,
}

impl Remote {
    pub fn new(session: Arc<Session>, interface: RemoteInterface) -> Self {
        Remote { session, interface }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start a call and return its pipe; stream blocks on it or await
    /// `pipe.result()` as needed.
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<Arc<Pipe>, Error> {
        let m = self.interface.get(method).ok_or_else(|| {
            Error::NotFound(format!(
                "method {:?} not declared on interface {:?}",
                method, self.interface.name
            ))
        })?;
        self.session.open(m.priority, m.function_id, params)
    }

    /// Start a call and wait for its outcome.
    pub async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<CloseResult, Error> {
        let pipe = self.call(method, params)?;
        Ok(pipe.result().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_lookup() {
        let iface = RemoteInterface::new("greeter")
            .method("hello", 10)
            .method_with_priority("urgent", 11, 5);

        assert_eq!(
            iface.get("hello"),
            Some(RemoteMethod {
                function_id: 10,
                priority: PRIORITY_NORMAL
            })
        );
        assert_eq!(
            iface.get("urgent"),
            Some(RemoteMethod {
                function_id: 11,
                priority: 5
            })
        );
        assert_eq!(iface.get("missing"), None);
    }
}
