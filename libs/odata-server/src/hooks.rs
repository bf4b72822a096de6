//! Lifecycle callbacks around CRUD operations.
//!
//! A callback registered with [`HookRegistry::hook`] is awaited inside the
//! request transaction; returning an error aborts the operation. Reads made
//! through [`HookContext::count`] and [`HookContext::find`] see that
//! transaction. One registered with [`HookRegistry::event`] runs on a spawned
//! task after commit and its failure is only logged.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use odata_core::ODataQuery;
use odata_db::{EntityRegistry, EntityType, JsonObject, TransactionContext};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::Instrument;

use crate::error::ServiceError;
use crate::service::EntityService;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeCreate,
    AfterLoad,
    BeforeUpdate,
    BeforeDelete,
    AfterSave,
}

impl HookKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::BeforeCreate => "beforeCreate",
            HookKind::AfterLoad => "afterLoad",
            HookKind::BeforeUpdate => "beforeUpdate",
            HookKind::BeforeDelete => "beforeDelete",
            HookKind::AfterSave => "afterSave",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a callback sees.
///
/// `data` is the request body for before-create/update, the stored row for
/// before-delete and the loaded or saved row for the after kinds. Changes a
/// hook makes to `data` are used by the operation.
#[derive(Clone)]
pub struct HookContext {
    pub entity: Arc<EntityType>,
    pub kind: HookKind,
    pub data: JsonObject,
    pub key: Option<Json>,
    pub service: Arc<EntityService>,
    pub(crate) tx: Weak<TransactionContext>,
}

impl HookContext {
    /// The transaction of the triggering operation; `None` once it has ended.
    #[must_use]
    pub fn transaction(&self) -> Option<Arc<TransactionContext>> {
        self.tx.upgrade()
    }

    /// Rows of `set` matching `$filter`, read inside the operation's
    /// transaction while it is open.
    ///
    /// # Errors
    /// Unknown set, query translation or database failures.
    pub async fn count(&self, set: &str, query: &ODataQuery) -> Result<u64, ServiceError> {
        match self.transaction() {
            Some(tx) => self.service.count_on(tx.conn(), set, query).await,
            None => self.service.count(set, query).await,
        }
    }

    /// Raw rows of `set` for `query`. Hooks and `$expand` are not applied.
    ///
    /// # Errors
    /// Unknown set, query translation or database failures.
    pub async fn find(
        &self,
        set: &str,
        query: &ODataQuery,
    ) -> Result<Vec<JsonObject>, ServiceError> {
        match self.transaction() {
            Some(tx) => self.service.rows_on(tx.conn(), set, query).await,
            None => self.service.rows_on(self.service.db().conn(), set, query).await,
        }
    }
}

impl fmt::Debug for HookContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookContext")
            .field("entity", &self.entity.name)
            .field("kind", &self.kind)
            .field("data", &self.data)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Rejection raised by a hook; surfaces to clients as 422.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
}

impl HookError {
    #[must_use]
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    /// # Errors
    /// A [`HookError`] aborts awaited hooks; for events it is logged.
    async fn call(&self, ctx: &mut HookContext) -> Result<(), HookError>;
}

/// Adapter for async closures taking and returning the context by value.
pub struct FnHook<F>(F);

/// Wrap `f` as a [`Hook`].
#[must_use]
pub fn hook_fn<F, Fut>(f: F) -> FnHook<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookContext, HookError>> + Send + 'static,
{
    FnHook(f)
}

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookContext, HookError>> + Send + 'static,
{
    async fn call(&self, ctx: &mut HookContext) -> Result<(), HookError> {
        *ctx = (self.0)(ctx.clone()).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dispatch {
    Await,
    Spawn,
}

#[derive(Clone)]
struct Registered {
    hook: Arc<dyn Hook>,
    dispatch: Dispatch,
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    entries: HashMap<(String, HookKind), Vec<Registered>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .map(|((entity, kind), v)| format!("{entity}:{kind}x{}", v.len()))
            .collect();
        keys.sort();
        f.debug_struct("HookRegistry").field("entries", &keys).finish()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an awaited hook for the entity type named `entity`.
    #[must_use]
    pub fn hook(self, entity: &str, kind: HookKind, hook: impl Hook + 'static) -> Self {
        self.push(entity, kind, Arc::new(hook), Dispatch::Await)
    }

    /// Register a fire-and-forget event handler.
    #[must_use]
    pub fn event(self, entity: &str, kind: HookKind, hook: impl Hook + 'static) -> Self {
        self.push(entity, kind, Arc::new(hook), Dispatch::Spawn)
    }

    fn push(
        mut self,
        entity: &str,
        kind: HookKind,
        hook: Arc<dyn Hook>,
        dispatch: Dispatch,
    ) -> Self {
        self.entries
            .entry((entity.to_ascii_lowercase(), kind))
            .or_default()
            .push(Registered { hook, dispatch });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every registration must name a registered entity type.
    ///
    /// # Errors
    /// The first unknown entity type name.
    pub fn validate(&self, registry: &EntityRegistry) -> Result<(), String> {
        for (entity, kind) in self.entries.keys() {
            if registry.by_name(entity).is_none() {
                return Err(format!(
                    "{kind} callback registered for unknown entity type '{entity}'"
                ));
            }
        }
        Ok(())
    }

    fn registered(&self, ctx: &HookContext) -> &[Registered] {
        self.entries
            .get(&(ctx.entity.name.to_ascii_lowercase(), ctx.kind))
            .map_or(&[], Vec::as_slice)
    }

    /// Await every hook for `ctx.entity`/`ctx.kind` in registration order.
    ///
    /// # Errors
    /// The first hook error; later hooks are not run.
    pub async fn run_hooks(&self, ctx: &mut HookContext) -> Result<(), HookError> {
        for r in self.registered(ctx) {
            if r.dispatch != Dispatch::Await {
                continue;
            }
            if let Err(err) = r.hook.call(ctx).await {
                tracing::debug!(
                    entity = %ctx.entity.name,
                    kind = %ctx.kind,
                    error = %err,
                    "hook rejected operation"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// Spawn every event handler for `ctx.entity`/`ctx.kind` without waiting.
    pub fn dispatch_events(&self, ctx: &HookContext) {
        for r in self.registered(ctx) {
            if r.dispatch != Dispatch::Spawn {
                continue;
            }
            let hook = r.hook.clone();
            let mut ctx = ctx.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = hook.call(&mut ctx).await {
                        tracing::warn!(
                            entity = %ctx.entity.name,
                            kind = %ctx.kind,
                            error = %err,
                            "event handler failed"
                        );
                    }
                }
                .in_current_span(),
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use odata_db::{ConnectOpts, DbHandle, FieldKind, Property};
    use tracing_test::traced_test;

    struct Noop;

    #[async_trait]
    impl Hook for Noop {
        async fn call(&self, _ctx: &mut HookContext) -> Result<(), HookError> {
            Ok(())
        }
    }

    fn registry() -> EntityRegistry {
        let mut reg = EntityRegistry::new();
        reg.register(
            EntityType::builder("Product")
                .key("Id")
                .property(Property::new("Id", FieldKind::I64))
                .build()
                .unwrap(),
        )
        .unwrap();
        reg
    }

    #[test]
    fn registrations_must_name_known_types() {
        let hooks = HookRegistry::new()
            .hook("product", HookKind::BeforeCreate, Noop)
            .event("Product", HookKind::AfterSave, Noop);
        assert!(hooks.validate(&registry()).is_ok());

        let hooks = hooks.hook("Order", HookKind::BeforeDelete, Noop);
        let err = hooks.validate(&registry()).unwrap_err();
        assert!(err.contains("beforeDelete"), "{err}");
        assert!(err.contains("'order'"), "{err}");
    }

    struct Failing;

    #[async_trait]
    impl Hook for Failing {
        async fn call(&self, _ctx: &mut HookContext) -> Result<(), HookError> {
            Err(HookError::reject("mailer offline"))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_events_are_logged_not_raised() {
        let db = DbHandle::connect("sqlite::memory:", ConnectOpts::default())
            .await
            .unwrap();
        let service = EntityService::builder(db, registry()).build().unwrap();
        let hooks = HookRegistry::new().event("Product", HookKind::AfterSave, Failing);
        let ctx = HookContext {
            entity: service.registry().by_name("Product").unwrap(),
            kind: HookKind::AfterSave,
            data: JsonObject::new(),
            key: Some(Json::from(1)),
            service,
            tx: Weak::new(),
        };

        hooks.dispatch_events(&ctx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(logs_contain("event handler failed"));
        assert!(logs_contain("mailer offline"));
    }

    #[test]
    fn kinds_render_as_lifecycle_names() {
        assert_eq!(HookKind::AfterLoad.to_string(), "afterLoad");
        assert!(HookRegistry::new().is_empty());
    }
}
