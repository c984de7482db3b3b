//! Declarative service binding.
//!
//! A service is a table of function entries, each mapping a 16-bit
//! function id to a name and an async handler. Handlers receive the pipe
//! they were dispatched for as an explicit argument — there is no
//! ambient "current pipe" — plus the decoded call parameters, and
//! resolve to the call's outcome.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use asterisque_core::{Abort, TryFromValue, Value};

use crate::pipe::Pipe;

/// Positional view over a call's parameters.
///
/// `get` maps a transferable value onto the handler's declared type,
/// widening where [`TryFromValue`] allows it; a missing parameter or an
/// unconvertible value surfaces as the call's failure, which `?`
/// propagates straight out of the handler.
#[derive(Debug, Clone)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Params(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get<T: TryFromValue>(&self, index: usize) -> Result<T, Abort> {
        let value = self
            .0
            .get(index)
            .cloned()
            .ok_or_else(|| Abort::unexpected(format!("missing parameter {}", index)))?;
        T::try_from_value(value)
            .map_err(|e| Abort::unexpected(format!("parameter {}: {}", index, e)))
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, Abort>> + Send + 'static>>;

type HandlerFn = dyn Fn(Arc<Pipe>, Params) -> HandlerFuture + Send + Sync;

/// One callable unit exposed to the peer.
pub struct Function {
    id: u16,
    name: String,
    handler: Arc<HandlerFn>,
}

impl Function {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, pipe: Arc<Pipe>, params: Params) -> HandlerFuture {
        (self.handler)(pipe, params)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named set of functions, built declaratively and bound into a
/// node's registry.
pub struct Service {
    name: String,
    functions: Vec<Function>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a function. Duplicate ids within one service are a
    /// programming error and rejected at bind time.
    pub fn func<F, Fut>(mut self, id: u16, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<Pipe>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Abort>> + Send + 'static,
    {
        self.functions.push(Function {
            id,
            name: name.into(),
            handler: Arc::new(move |pipe, params| Box::pin(handler(pipe, params))),
        });
        self
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }
}

/// A function id is already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindError {
    pub function_id: u16,
    pub existing: String,
    pub incoming: String,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "function id {} already bound to {:?}, cannot bind {:?}",
            self.function_id, self.existing, self.incoming
        )
    }
}

impl std::error::Error for BindError {}

/// Merged function table shared by every session of a node.
#[derive(Default)]
pub struct Registry {
    functions: Mutex<HashMap<u16, Arc<Function>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Bind every function of a service. All-or-nothing: a single id
    /// conflict leaves the registry untouched.
    pub fn bind(&self, service: Service) -> Result<(), BindError> {
        let mut functions = self.functions.lock();
        for function in &service.functions {
            if let Some(existing) = functions.get(&function.id) {
                return Err(BindError {
                    function_id: function.id,
                    existing: existing.name.clone(),
                    incoming: function.name.clone(),
                });
            }
        }
        let name = service.name;
        let count = service.functions.len();
        // A service may not conflict with itself either.
        let mut fresh = HashMap::new();
        for function in service.functions {
            let id = function.id;
            let incoming = function.name.clone();
            if let Some(prior) = fresh.insert(id, Arc::new(function)) {
                return Err(BindError {
                    function_id: id,
                    existing: prior.name.clone(),
                    incoming,
                });
            }
        }
        functions.extend(fresh);
        tracing::debug!(service = %name, functions = count, "service bound");
        Ok(())
    }

    pub fn lookup(&self, function_id: u16) -> Option<Arc<Function>> {
        self.functions.lock().get(&function_id).cloned()
    }

    pub fn function_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.functions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_service() -> Service {
        Service::new("echo")
            .func(10, "echo", |_pipe, params| async move {
                Ok(params.value(0).cloned().unwrap_or(Value::Null))
            })
            .func(11, "ping", |_pipe, _params| async move { Ok(Value::Null) })
    }

    #[test]
    fn bind_and_lookup() {
        let registry = Registry::new();
        registry.bind(echo_service()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(10).unwrap().name(), "echo");
        assert_eq!(registry.lookup(11).unwrap().name(), "ping");
        assert!(registry.lookup(12).is_none());
        assert_eq!(registry.function_ids(), vec![10, 11]);
    }

    #[test]
    fn conflicting_bind_is_atomic() {
        let registry = Registry::new();
        registry.bind(echo_service()).unwrap();

        let clashing = Service::new("other")
            .func(20, "fresh", |_p, _v| async move { Ok(Value::Null) })
            .func(10, "clash", |_p, _v| async move { Ok(Value::Null) });

        let err = registry.bind(clashing).unwrap_err();
        assert_eq!(err.function_id, 10);
        assert_eq!(err.existing, "echo");
        assert_eq!(err.incoming, "clash");

        // Nothing from the failed service landed.
        assert!(registry.lookup(20).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn internal_conflict_is_rejected() {
        let registry = Registry::new();
        let bad = Service::new("dup")
            .func(5, "a", |_p, _v| async move { Ok(Value::Null) })
            .func(5, "b", |_p, _v| async move { Ok(Value::Null) });
        assert!(registry.bind(bad).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn handler_invocation() {
        let registry = Registry::new();
        registry.bind(echo_service()).unwrap();

        let (wire, _peer) = asterisque_core::Wire::pair();
        let ctx = crate::pipe::PipeContext {
            post: crate::session::SessionPost::for_tests(wire),
            max_backlog: 4,
            meter: std::sync::Arc::new(asterisque_core::CircuitBreaker::new("m", 10, 20)),
        };
        let pipe = Pipe::new(1, 10, 0, &ctx);

        let f = registry.lookup(10).unwrap();
        let out = f.invoke(pipe, Params::new(vec![Value::I32(42)])).await;
        assert_eq!(out, Ok(Value::I32(42)));
    }

    #[test]
    fn params_typed_access_with_widening() {
        let params = Params::new(vec![
            Value::String("foo".to_string()),
            Value::I16(42),
            Value::Null,
        ]);

        assert_eq!(params.len(), 3);
        assert_eq!(params.get::<String>(0), Ok("foo".to_string()));
        assert_eq!(params.get::<i64>(1), Ok(42));
        assert_eq!(params.get::<Option<i32>>(2), Ok(None));

        let missing = params.get::<i32>(3).unwrap_err();
        assert!(missing.message.contains("missing parameter 3"));

        let mismatch = params.get::<bool>(0).unwrap_err();
        assert!(mismatch.message.contains("parameter 0"));
    }
}
