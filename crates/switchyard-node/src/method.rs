//! Local method table.

use crate::context::NodeContext;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use switchyard_wire::RpcError;

/// Name of the hub's routing method. No node may define it.
pub const INVOKE: &str = "invoke";

/// A locally implemented RPC method.
#[async_trait]
pub trait Method: Send + Sync + 'static {
    /// Execute with the node's context and positional params.
    async fn call(&self, ctx: &NodeContext, params: Vec<Value>) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into a [`Method`].
pub struct FnMethod<F>(F);

#[async_trait]
impl<F, Fut> Method for FnMethod<F>
where
    F: Fn(NodeContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, ctx: &NodeContext, params: Vec<Value>) -> Result<Value, RpcError> {
        (self.0)(ctx.clone(), params).await
    }
}

/// Wrap an async closure as a method.
pub fn method_fn<F, Fut>(f: F) -> Arc<dyn Method>
where
    F: Fn(NodeContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnMethod(f))
}

/// Methods a node serves, by name.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, Arc<dyn Method>>,
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, method: Arc<dyn Method>) {
        self.methods.insert(name.into(), method);
    }

    /// Builder form of [`MethodTable::insert`] for closures.
    pub fn with<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(NodeContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.insert(name, method_fn(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Method>> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Method names in sorted order; this is what a node announces.
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Run `name` locally, or report method-not-found.
    pub async fn dispatch(
        &self,
        ctx: &NodeContext,
        name: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match self.methods.get(name) {
            Some(method) => method.call(ctx, params).await,
            None => Err(RpcError::method_not_found(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_table_dispatch() {
        let table = MethodTable::new()
            .with("echo", |_ctx, params| async move {
                Ok(params.into_iter().next().unwrap_or(Value::Null))
            })
            .with("service", |ctx: NodeContext, _| async move {
                Ok(json!(ctx.current_service()))
            });
        let ctx = NodeContext::detached("svc");

        assert_eq!(table.names(), vec!["echo".to_string(), "service".to_string()]);
        assert_eq!(
            table.dispatch(&ctx, "echo", vec![json!("x")]).await.unwrap(),
            json!("x")
        );
        assert_eq!(
            table.dispatch(&ctx, "service", vec![]).await.unwrap(),
            json!("svc")
        );
        assert!(table
            .dispatch(&ctx, "missing", vec![])
            .await
            .unwrap_err()
            .is_method_not_found());
    }
}
