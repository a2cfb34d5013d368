//! Per-role remote-call tables.
//!
//! Each role builds one [`HandlerRegistry`] at startup, registering every
//! function a peer may invoke on it. Incoming calls are looked up by name;
//! nothing outside the table can be reached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{FarmError, Result};
use crate::protocol::{FunctionMessage, Target};

pub type HandlerFuture = BoxFuture<'static, Result<()>>;

type Handler<C> = Arc<dyn Fn(C, Call) -> HandlerFuture + Send + Sync>;

/// A decoded remote invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Display name of the peer that sent the call
    pub sender: String,
}

impl From<FunctionMessage> for Call {
    fn from(message: FunctionMessage) -> Self {
        Self {
            function: message.function,
            args: message.args,
            kwargs: message.kwargs,
            sender: message.name,
        }
    }
}

impl Call {
    /// Argument `name`, or positional argument `index` when not passed by
    /// keyword.
    pub fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T> {
        self.opt_arg(index, name)?
            .ok_or_else(|| FarmError::bad_arguments(&self.function, format!("missing `{name}`")))
    }

    pub fn opt_arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>> {
        let value = self.kwargs.get(name).or_else(|| self.args.get(index));
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                FarmError::bad_arguments(&self.function, format!("`{name}`: {e}"))
            }),
        }
    }
}

/// Function name to handler table for one role. `C` is the context every
/// handler receives, cloned per call.
pub struct HandlerRegistry<C> {
    role: Target,
    handlers: HashMap<String, Handler<C>>,
}

impl<C> std::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("role", &self.role)
            .field("functions", &names)
            .finish()
    }
}

impl<C: Send + 'static> HandlerRegistry<C> {
    pub fn new(role: Target) -> Self {
        Self {
            role,
            handlers: HashMap::new(),
        }
    }

    pub fn role(&self) -> Target {
        self.role
    }

    pub fn register<F, Fut>(mut self, function: &str, handler: F) -> Self
    where
        F: Fn(C, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler<C> = Arc::new(move |ctx, call| Box::pin(handler(ctx, call)));
        self.handlers.insert(function.to_string(), handler);
        self
    }

    pub fn contains(&self, function: &str) -> bool {
        self.handlers.contains_key(function)
    }

    /// Resolve a call to the future that runs it.
    pub fn dispatch(&self, ctx: C, call: Call) -> Result<HandlerFuture> {
        let handler = self
            .handlers
            .get(&call.function)
            .ok_or_else(|| FarmError::UnknownFunction(call.function.clone()))?;
        tracing::debug!(role = %self.role, function = %call.function, sender = %call.sender, "Dispatching call");
        Ok(handler(ctx, call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn call(function: &str) -> Call {
        FunctionMessage::new(Target::Server, "render01", function)
            .arg(7)
            .kwarg("reason", "segfault")
            .into()
    }

    #[test]
    fn args_by_keyword_then_position() {
        let call = call("fail_task");
        assert_eq!(call.arg::<i64>(0, "task").unwrap(), 7);
        assert_eq!(call.arg::<String>(1, "reason").unwrap(), "segfault");
        assert_eq!(call.opt_arg::<i64>(5, "missing").unwrap(), None);
        assert!(matches!(
            call.arg::<i64>(5, "missing"),
            Err(FarmError::BadArguments { .. })
        ));
        assert!(call.arg::<i64>(1, "reason").is_err());
    }

    #[tokio::test]
    async fn dispatch_runs_registered_handler() {
        async fn add(total: Arc<AtomicI64>, call: Call) -> Result<()> {
            total.fetch_add(call.arg::<i64>(0, "value")?, Ordering::SeqCst);
            Ok(())
        }

        let total = Arc::new(AtomicI64::new(0));
        let registry = HandlerRegistry::new(Target::Server).register("add", add);

        assert!(registry.contains("add"));
        registry.dispatch(total.clone(), call("add")).unwrap().await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn unknown_function_is_an_error() {
        let registry: HandlerRegistry<()> = HandlerRegistry::new(Target::Client);
        assert!(matches!(
            registry.dispatch((), call("rm_rf")),
            Err(FarmError::UnknownFunction(ref f)) if f == "rm_rf"
        ));
    }
}
