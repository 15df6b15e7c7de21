use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ToolError;
use crate::stream::{PendingToolCall, ToolResult};

/// A tool the caller resolves in-process.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Runs the tool with the arguments sent by the remote agent.
    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

struct FnToolHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        (self.0)(args).await
    }
}

/// Tool name to handler mapping for one invocation.
///
/// A pending tool call is local iff its exact name is registered here;
/// everything else is handed back to the caller.
#[derive(Clone, Default)]
pub struct ToolHandlers {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one with the same name.
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnToolHandler(f)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Splits calls into `(local, external)`, preserving order within each set.
    pub fn partition(
        &self,
        calls: Vec<PendingToolCall>,
    ) -> (Vec<PendingToolCall>, Vec<PendingToolCall>) {
        calls
            .into_iter()
            .partition(|call| self.contains(&call.tool_name))
    }

    /// Runs every call concurrently and returns results in input order.
    ///
    /// Handler failures (including panics) become error results.
    pub async fn execute_local(&self, calls: &[PendingToolCall]) -> Vec<ToolResult> {
        futures::future::join_all(calls.iter().map(|call| self.execute_one(call))).await
    }

    async fn execute_one(&self, call: &PendingToolCall) -> ToolResult {
        let Some(handler) = self.handlers.get(&call.tool_name) else {
            return ToolResult::failure(call, format!("no handler for tool {}", call.tool_name));
        };
        debug!(tool_call_id = %call.tool_call_id, tool = %call.tool_name, "running local tool");
        match AssertUnwindSafe(handler.call(call.args.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => ToolResult::success(call, result),
            Ok(Err(err)) => {
                debug!(tool_call_id = %call.tool_call_id, error = %err, "local tool failed");
                ToolResult::failure(call, err.message())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(tool_call_id = %call.tool_call_id, tool = %call.tool_name, %message, "local tool panicked");
                ToolResult::failure(call, format!("tool {} panicked: {message}", call.tool_name))
            }
        }
    }
}

impl fmt::Debug for ToolHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ToolHandlers").field("tools", &names).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
