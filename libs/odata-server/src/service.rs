//! CRUD entry points shared by every entity set.
//!
//! Each operation runs in its own transaction: awaited hooks run inside it,
//! events are dispatched once the outcome is known (after commit for
//! `AfterLoad` and `AfterSave`).

use std::collections::HashMap;
use std::sync::Arc;

use odata_core::{EntityKey, ODataLimits, ODataQuery};
use odata_db::{
    BodyMode, DbHandle, EntityRegistry, EntityType, JsonObject, Related, Repository,
    ResolvedNavigation, SqlQuery, TransactionContext, body_to_values, translate,
    visitor::coerce,
};
use sea_orm::ConnectionTrait;
use serde_json::Value as Json;
use tracing::instrument;

use crate::controller::{ActionContext, Controller};
use crate::error::ServiceError;
use crate::hooks::{HookContext, HookKind, HookRegistry};

/// One page of a collection read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<JsonObject>,
    pub count: Option<u64>,
    /// `$skip` of the next page when the server truncated the result.
    pub next_skip: Option<u64>,
    /// Remaining `$top` for the next page when the client asked for one.
    pub next_top: Option<u64>,
}

/// Target of a navigation read.
#[derive(Clone, Debug, PartialEq)]
pub struct RelatedResult {
    pub target: Arc<EntityType>,
    pub related: Related,
}

pub struct EntityServiceBuilder {
    db: DbHandle,
    registry: EntityRegistry,
    hooks: HookRegistry,
    controllers: Vec<Controller>,
    limits: ODataLimits,
    max_page_size: Option<u64>,
}

impl EntityServiceBuilder {
    #[must_use]
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn controller(mut self, controller: Controller) -> Self {
        self.controllers.push(controller);
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ODataLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn max_page_size(mut self, size: Option<u64>) -> Self {
        self.max_page_size = size.filter(|&n| n > 0);
        self
    }

    /// Check the wiring and freeze it.
    ///
    /// # Errors
    /// `ServerInternal` for unresolvable navigations, callbacks on unknown
    /// entity types, or controllers for unknown entity sets.
    pub fn build(self) -> Result<Arc<EntityService>, ServiceError> {
        self.registry.validate()?;
        self.hooks
            .validate(&self.registry)
            .map_err(ServiceError::ServerInternal)?;

        let mut controllers = HashMap::with_capacity(self.controllers.len());
        for controller in self.controllers {
            if self.registry.by_set(controller.entity_set()).is_none() {
                return Err(ServiceError::internal(format!(
                    "controller bound to unknown entity set '{}'",
                    controller.entity_set()
                )));
            }
            controllers.insert(controller.entity_set().to_ascii_lowercase(), controller);
        }

        Ok(Arc::new(EntityService {
            repo: Repository::for_engine(self.db.engine()),
            db: self.db,
            registry: Arc::new(self.registry),
            hooks: self.hooks,
            controllers,
            limits: self.limits,
            max_page_size: self.max_page_size,
        }))
    }
}

pub struct EntityService {
    db: DbHandle,
    repo: Repository,
    registry: Arc<EntityRegistry>,
    hooks: HookRegistry,
    controllers: HashMap<String, Controller>,
    limits: ODataLimits,
    max_page_size: Option<u64>,
}

impl std::fmt::Debug for EntityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityService")
            .field("engine", &self.db.engine())
            .field("entity_sets", &self.controllers.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl EntityService {
    #[must_use]
    pub fn builder(db: DbHandle, registry: EntityRegistry) -> EntityServiceBuilder {
        EntityServiceBuilder {
            db,
            registry,
            hooks: HookRegistry::new(),
            controllers: Vec::new(),
            limits: ODataLimits::default(),
            max_page_size: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    #[must_use]
    pub fn limits(&self) -> &ODataLimits {
        &self.limits
    }

    #[must_use]
    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Exposed entity sets with their controllers, in registry order.
    pub fn exposed(&self) -> impl Iterator<Item = (&Arc<EntityType>, &Controller)> {
        self.registry.iter().filter_map(|entity| {
            self.controllers
                .get(&entity.set_name.to_ascii_lowercase())
                .map(|c| (entity, c))
        })
    }

    /// Entity type and controller behind an exposed set.
    ///
    /// # Errors
    /// `NoSuchResource` when no controller exposes `set`.
    pub fn resolve_set(
        &self,
        set: &str,
    ) -> Result<(Arc<EntityType>, &Controller), ServiceError> {
        let controller = self
            .controllers
            .get(&set.to_ascii_lowercase())
            .ok_or_else(|| ServiceError::NoSuchResource(set.to_owned()))?;
        let entity = self
            .registry
            .by_set(set)
            .ok_or_else(|| ServiceError::NoSuchResource(set.to_owned()))?;
        Ok((entity, controller))
    }

    fn writable(&self, set: &str, method: &str) -> Result<Arc<EntityType>, ServiceError> {
        let (entity, controller) = self.resolve_set(set)?;
        if controller.is_read_only() {
            return Err(ServiceError::MethodNotAllowed {
                method: method.to_owned(),
                resource: entity.set_name.clone(),
            });
        }
        Ok(entity)
    }

    /// Convert a path key to a value of the key property's type.
    ///
    /// # Errors
    /// `InvalidKey` when the key names another property or does not fit its type.
    pub fn key_value(
        entity: &EntityType,
        key: &EntityKey,
    ) -> Result<sea_orm::Value, ServiceError> {
        if let Some(name) = &key.name {
            if !name.eq_ignore_ascii_case(&entity.key) {
                return Err(odata_core::Error::InvalidKey(format!(
                    "'{name}' is not the key of {}",
                    entity.name
                ))
                .into());
            }
        }
        coerce(entity.key_property().kind, &key.value)
            .map_err(|e| odata_core::Error::InvalidKey(e.to_string()).into())
    }

    fn not_found(entity: &EntityType, key: &EntityKey) -> ServiceError {
        ServiceError::NotFound {
            entity_set: entity.set_name.clone(),
            key: key.to_string(),
        }
    }

    fn context(
        self: &Arc<Self>,
        entity: &Arc<EntityType>,
        kind: HookKind,
        data: JsonObject,
        key: Option<Json>,
        tx: &Arc<TransactionContext>,
    ) -> HookContext {
        HookContext {
            entity: entity.clone(),
            kind,
            data,
            key,
            service: self.clone(),
            tx: Arc::downgrade(tx),
        }
    }

    /// Commit once no hook holds on to the transaction any more.
    async fn commit(tx: Arc<TransactionContext>) -> Result<(), ServiceError> {
        let tx = Arc::into_inner(tx)
            .ok_or_else(|| ServiceError::internal("transaction still held by a hook"))?;
        Ok(tx.commit().await?)
    }

    fn row_key(entity: &EntityType, row: &JsonObject) -> Option<Json> {
        row.get(&entity.key_property().name).cloned()
    }

    /// Run `AfterLoad` hooks over `rows`; returns the contexts for event dispatch.
    async fn after_load(
        self: &Arc<Self>,
        entity: &Arc<EntityType>,
        rows: &mut [JsonObject],
        tx: &Arc<TransactionContext>,
    ) -> Result<Vec<HookContext>, ServiceError> {
        let mut contexts = Vec::with_capacity(rows.len());
        for row in rows.iter_mut() {
            let key = Self::row_key(entity, row);
            let mut ctx = self.context(entity, HookKind::AfterLoad, std::mem::take(row), key, tx);
            self.hooks.run_hooks(&mut ctx).await?;
            row.clone_from(&ctx.data);
            contexts.push(ctx);
        }
        Ok(contexts)
    }

    fn dispatch_all(&self, contexts: &[HookContext]) {
        for ctx in contexts {
            self.hooks.dispatch_events(ctx);
        }
    }

    /// Resolve `$expand` entries; to-one foreign keys are added to the select
    /// list and returned so they can be stripped again.
    fn prepare_expand<'e>(
        &self,
        entity: &'e EntityType,
        query: &ODataQuery,
        sql: &mut SqlQuery,
    ) -> Result<(Vec<ResolvedNavigation<'e>>, Vec<String>), ServiceError> {
        let mut resolved = Vec::with_capacity(query.expand.len());
        let mut added = Vec::new();
        for name in &query.expand {
            let nav = entity.navigation(name).ok_or_else(|| {
                odata_core::Error::InvalidExpand(format!(
                    "'{name}' is not a navigation of {}",
                    entity.name
                ))
            })?;
            let nav = self.registry.resolve(entity, nav)?;
            if !nav.navigation.kind.is_collection()
                && !sql.selected.iter().any(|p| p.name == nav.foreign_key.name)
            {
                sql.ensure_selected(&nav.foreign_key);
                added.push(nav.foreign_key.name.clone());
            }
            resolved.push(nav);
        }
        Ok((resolved, added))
    }

    async fn expand_rows<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        navs: &[ResolvedNavigation<'_>],
        added: &[String],
        rows: &mut [JsonObject],
    ) -> Result<(), ServiceError> {
        for nav in navs {
            let all = SqlQuery::all(&nav.target);
            for row in rows.iter_mut() {
                let related = self.repo.find_related(conn, entity, nav, row, &all).await?;
                row.insert(nav.navigation.name.clone(), related.into_json());
            }
        }
        for row in rows.iter_mut() {
            for name in added {
                row.remove(name);
            }
        }
        Ok(())
    }

    /// `(limit to fetch, page size)` for server-driven paging.
    fn page_window(&self, top: Option<u64>) -> (Option<u64>, Option<u64>) {
        match self.max_page_size {
            Some(max) if top.is_none_or(|t| t > max) => {
                (Some(max.saturating_add(1)), Some(max))
            }
            _ => (top, None),
        }
    }

    /// Read a collection.
    ///
    /// # Errors
    /// Query, translation and database failures; hook rejections.
    #[instrument(skip_all, fields(set = %set))]
    pub async fn find(
        self: &Arc<Self>,
        set: &str,
        query: &ODataQuery,
    ) -> Result<Page, ServiceError> {
        let (entity, _) = self.resolve_set(set)?;
        let mut sql = translate(&entity, query)?;
        let (navs, added) = self.prepare_expand(&entity, query, &mut sql)?;
        let (limit, page_size) = self.page_window(query.top);
        sql.limit = limit;

        let tx = Arc::new(TransactionContext::begin(&self.db).await?);
        let found = self.repo.find(tx.conn(), &entity, &sql).await?;
        let mut rows = found.rows;

        let mut next_skip = None;
        let mut next_top = None;
        if let Some(size) = page_size {
            let size_usize = usize::try_from(size).unwrap_or(usize::MAX);
            if rows.len() > size_usize {
                rows.truncate(size_usize);
                next_skip = Some(query.skip.unwrap_or(0).saturating_add(size));
                next_top = query.top.map(|t| t - size);
            }
        }

        self.expand_rows(tx.conn(), &entity, &navs, &added, &mut rows).await?;
        let contexts = self.after_load(&entity, &mut rows, &tx).await?;
        Self::commit(tx).await?;
        self.dispatch_all(&contexts);

        tracing::debug!(rows = rows.len(), "collection read");
        Ok(Page {
            rows,
            count: found.count,
            next_skip,
            next_top,
        })
    }

    /// `/Set/$count`: rows matching `$filter`, paging ignored.
    ///
    /// # Errors
    /// Query, translation and database failures.
    #[instrument(skip_all, fields(set = %set))]
    pub async fn count(&self, set: &str, query: &ODataQuery) -> Result<u64, ServiceError> {
        self.count_on(self.db.conn(), set, query).await
    }

    pub(crate) async fn count_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        set: &str,
        query: &ODataQuery,
    ) -> Result<u64, ServiceError> {
        let (entity, _) = self.resolve_set(set)?;
        let sql = translate(&entity, query)?;
        Ok(self.repo.count(conn, &entity, &sql).await?)
    }

    /// Rows for `query` without hooks or `$expand`.
    pub(crate) async fn rows_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        set: &str,
        query: &ODataQuery,
    ) -> Result<Vec<JsonObject>, ServiceError> {
        let (entity, _) = self.resolve_set(set)?;
        let sql = translate(&entity, query)?;
        Ok(self.repo.find(conn, &entity, &sql).await?.rows)
    }

    /// Read one entity by key; `$select` and `$expand` apply.
    ///
    /// # Errors
    /// `NotFound` when no row has the key.
    #[instrument(skip_all, fields(set = %set, key = %key))]
    pub async fn find_one(
        self: &Arc<Self>,
        set: &str,
        key: &EntityKey,
        query: &ODataQuery,
    ) -> Result<JsonObject, ServiceError> {
        let (entity, _) = self.resolve_set(set)?;
        let key_value = Self::key_value(&entity, key)?;
        let mut sql = translate(&entity, query)?;
        let (navs, added) = self.prepare_expand(&entity, query, &mut sql)?;

        let tx = Arc::new(TransactionContext::begin(&self.db).await?);
        let row = self
            .repo
            .find_by_key(tx.conn(), &entity, key_value, &sql.selected)
            .await?
            .ok_or_else(|| Self::not_found(&entity, key))?;
        let mut rows = vec![row];
        self.expand_rows(tx.conn(), &entity, &navs, &added, &mut rows).await?;
        let contexts = self.after_load(&entity, &mut rows, &tx).await?;
        Self::commit(tx).await?;
        self.dispatch_all(&contexts);

        rows.pop()
            .ok_or_else(|| ServiceError::internal("loaded row vanished"))
    }

    /// Insert a new entity from a JSON body.
    ///
    /// # Errors
    /// Body violations, hook rejections, constraint conflicts.
    #[instrument(skip_all, fields(set = %set))]
    pub async fn create(
        self: &Arc<Self>,
        set: &str,
        body: JsonObject,
    ) -> Result<JsonObject, ServiceError> {
        let entity = self.writable(set, "POST")?;
        let tx = Arc::new(TransactionContext::begin(&self.db).await?);

        let mut before = self.context(&entity, HookKind::BeforeCreate, body, None, &tx);
        self.hooks.run_hooks(&mut before).await?;
        let values = body_to_values(&entity, &before.data, BodyMode::Create)
            .map_err(ServiceError::Body)?;

        let created = self.repo.insert(tx.conn(), &entity, values).await?;
        let key = Self::row_key(&entity, &created);
        let mut after = self.context(&entity, HookKind::AfterSave, created, key, &tx);
        self.hooks.run_hooks(&mut after).await?;
        Self::commit(tx).await?;

        self.hooks.dispatch_events(&before);
        self.hooks.dispatch_events(&after);
        tracing::info!(entity = %entity.name, key = ?after.key, "entity created");
        Ok(after.data)
    }

    /// PATCH (`BodyMode::Merge`) or PUT (`BodyMode::Replace`) one entity.
    ///
    /// # Errors
    /// `NotFound`, body violations, hook rejections, constraint conflicts.
    #[instrument(skip_all, fields(set = %set, key = %key))]
    pub async fn update(
        self: &Arc<Self>,
        set: &str,
        key: &EntityKey,
        body: JsonObject,
        mode: BodyMode,
    ) -> Result<JsonObject, ServiceError> {
        let method = if mode == BodyMode::Replace { "PUT" } else { "PATCH" };
        let entity = self.writable(set, method)?;
        let key_value = Self::key_value(&entity, key)?;
        let tx = Arc::new(TransactionContext::begin(&self.db).await?);

        let existing = self
            .repo
            .find_by_key(tx.conn(), &entity, key_value.clone(), &entity.properties)
            .await?
            .ok_or_else(|| Self::not_found(&entity, key))?;
        let row_key = Self::row_key(&entity, &existing);

        let mut before =
            self.context(&entity, HookKind::BeforeUpdate, body, row_key.clone(), &tx);
        self.hooks.run_hooks(&mut before).await?;
        let mode = if mode == BodyMode::Create { BodyMode::Merge } else { mode };
        let values = body_to_values(&entity, &before.data, mode).map_err(ServiceError::Body)?;
        self.repo
            .update(tx.conn(), &entity, key_value.clone(), values)
            .await?;

        let saved = self
            .repo
            .find_by_key(tx.conn(), &entity, key_value, &entity.properties)
            .await?
            .ok_or_else(|| Self::not_found(&entity, key))?;
        let mut after = self.context(&entity, HookKind::AfterSave, saved, row_key, &tx);
        self.hooks.run_hooks(&mut after).await?;
        Self::commit(tx).await?;

        self.hooks.dispatch_events(&before);
        self.hooks.dispatch_events(&after);
        tracing::info!(entity = %entity.name, key = ?after.key, "entity updated");
        Ok(after.data)
    }

    /// # Errors
    /// `NotFound`, hook rejections, rows still referenced by foreign keys.
    #[instrument(skip_all, fields(set = %set, key = %key))]
    pub async fn delete(self: &Arc<Self>, set: &str, key: &EntityKey) -> Result<(), ServiceError> {
        let entity = self.writable(set, "DELETE")?;
        let key_value = Self::key_value(&entity, key)?;
        let tx = Arc::new(TransactionContext::begin(&self.db).await?);

        let existing = self
            .repo
            .find_by_key(tx.conn(), &entity, key_value.clone(), &entity.properties)
            .await?
            .ok_or_else(|| Self::not_found(&entity, key))?;
        let row_key = Self::row_key(&entity, &existing);
        let mut before = self.context(&entity, HookKind::BeforeDelete, existing, row_key, &tx);
        self.hooks.run_hooks(&mut before).await?;

        self.repo.delete(tx.conn(), &entity, key_value).await?;
        Self::commit(tx).await?;

        self.hooks.dispatch_events(&before);
        tracing::info!(entity = %entity.name, key = ?before.key, "entity deleted");
        Ok(())
    }

    /// Follow `navigation` from the entity at `key`. The query applies to the
    /// target set (`$filter`, `$orderby`, paging for collections).
    ///
    /// # Errors
    /// `NotFound` for the source, `NoSuchResource` for an unknown navigation,
    /// `ServerInternal` when the navigation cannot be resolved.
    #[instrument(skip_all, fields(set = %set, key = %key, navigation = %navigation))]
    pub async fn find_related(
        self: &Arc<Self>,
        set: &str,
        key: &EntityKey,
        navigation: &str,
        query: &ODataQuery,
    ) -> Result<RelatedResult, ServiceError> {
        let (entity, _) = self.resolve_set(set)?;
        let nav = entity
            .navigation(navigation)
            .ok_or_else(|| ServiceError::NoSuchResource(format!("{set}/{navigation}")))?;
        let nav = self.registry.resolve(&entity, nav)?;
        let target = nav.target.clone();
        let key_value = Self::key_value(&entity, key)?;
        let sql = translate(&target, query)?;

        let tx = Arc::new(TransactionContext::begin(&self.db).await?);
        let source = self
            .repo
            .find_by_key(tx.conn(), &entity, key_value, &entity.properties)
            .await?
            .ok_or_else(|| Self::not_found(&entity, key))?;
        let related = self
            .repo
            .find_related(tx.conn(), &entity, &nav, &source, &sql)
            .await?;

        let (related, contexts) = match related {
            Related::One(Some(row)) => {
                let mut rows = vec![row];
                let contexts = self.after_load(&target, &mut rows, &tx).await?;
                (Related::One(rows.pop()), contexts)
            }
            Related::One(None) => (Related::One(None), Vec::new()),
            Related::Many(mut found) => {
                let contexts = self.after_load(&target, &mut found.rows, &tx).await?;
                (Related::Many(found), contexts)
            }
        };
        Self::commit(tx).await?;
        self.dispatch_all(&contexts);

        Ok(RelatedResult { target, related })
    }

    /// Invoke a controller action, bound to the collection or to one entity.
    ///
    /// # Errors
    /// `NoSuchResource` for unknown actions, `MethodNotAllowed` when an
    /// action is called with GET or a function with POST, and whatever the
    /// action itself returns.
    #[instrument(skip_all, fields(set = %set, action = %action))]
    pub async fn invoke(
        self: &Arc<Self>,
        set: &str,
        key: Option<&EntityKey>,
        action: &str,
        params: JsonObject,
        via_get: bool,
    ) -> Result<Option<Json>, ServiceError> {
        let (entity, controller) = self.resolve_set(set)?;
        let handler = controller
            .find_action(action)
            .ok_or_else(|| ServiceError::NoSuchResource(format!("{set}/{action}")))?;
        if handler.is_function() != via_get {
            return Err(ServiceError::MethodNotAllowed {
                method: if via_get { "GET" } else { "POST" }.to_owned(),
                resource: format!("{set}/{action}"),
            });
        }

        let target = match key {
            Some(key) => {
                let key_value = Self::key_value(&entity, key)?;
                let row = self
                    .repo
                    .find_by_key(self.db.conn(), &entity, key_value, &entity.properties)
                    .await?
                    .ok_or_else(|| Self::not_found(&entity, key))?;
                Some(row)
            }
            None => None,
        };

        handler
            .invoke(ActionContext {
                service: self.clone(),
                entity,
                target,
                params,
            })
            .await
    }
}
