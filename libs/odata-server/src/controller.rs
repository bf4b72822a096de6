//! Controllers bind entity sets to the HTTP surface and carry their actions.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use odata_db::{EntityType, JsonObject};
use serde_json::Value as Json;

use crate::error::ServiceError;
use crate::service::EntityService;

/// Input handed to an action.
#[derive(Clone)]
pub struct ActionContext {
    pub service: Arc<EntityService>,
    pub entity: Arc<EntityType>,
    /// Bound entity for `Set(key)/ns.action`; `None` for collection-bound calls.
    pub target: Option<JsonObject>,
    /// JSON body for actions, query-string parameters for functions.
    pub params: JsonObject,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("entity", &self.entity.name)
            .field("target", &self.target)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Custom operation addressed as `<Set>/<namespace>.<name>`.
///
/// The result is rendered as a collection envelope for arrays, as a bare
/// body otherwise, and as `204 No Content` for `None`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Functions are side-effect free and invoked with GET; actions with POST.
    fn is_function(&self) -> bool {
        false
    }

    /// # Errors
    /// Any [`ServiceError`]; it is rendered like CRUD failures.
    async fn invoke(&self, ctx: ActionContext) -> Result<Option<Json>, ServiceError>;
}

pub struct FnAction<F> {
    f: F,
    function: bool,
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Json>, ServiceError>> + Send + 'static,
{
    fn is_function(&self) -> bool {
        self.function
    }

    async fn invoke(&self, ctx: ActionContext) -> Result<Option<Json>, ServiceError> {
        (self.f)(ctx).await
    }
}

/// POST-invoked action from an async closure.
#[must_use]
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Json>, ServiceError>> + Send + 'static,
{
    FnAction { f, function: false }
}

/// GET-invoked function from an async closure.
#[must_use]
pub fn function_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Json>, ServiceError>> + Send + 'static,
{
    FnAction { f, function: true }
}

/// Exposes one entity set.
#[derive(Clone)]
pub struct Controller {
    entity_set: String,
    read_only: bool,
    actions: HashMap<String, Arc<dyn Action>>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("Controller")
            .field("entity_set", &self.entity_set)
            .field("read_only", &self.read_only)
            .field("actions", &names)
            .finish()
    }
}

impl Controller {
    #[must_use]
    pub fn new(entity_set: impl Into<String>) -> Self {
        Self {
            entity_set: entity_set.into(),
            read_only: false,
            actions: HashMap::new(),
        }
    }

    /// Reject POST, PUT, PATCH and DELETE on the set with 405.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn action(mut self, name: impl Into<String>, action: impl Action + 'static) -> Self {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    #[must_use]
    pub fn entity_set(&self) -> &str {
        &self.entity_set
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn find_action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// `(name, is_function)` pairs sorted by name.
    #[must_use]
    pub fn actions(&self) -> Vec<(&str, bool)> {
        let mut out: Vec<_> = self
            .actions
            .iter()
            .map(|(name, a)| (name.as_str(), a.is_function()))
            .collect();
        out.sort_unstable();
        out
    }
}
