//! Demo catalog served by the host: categories and products with hooks,
//! events and bound operations.

pub mod entities;
pub mod migrations;

use std::sync::Arc;

use anyhow::Result;
use odata_core::{EntityKey, ODataOrderBy, ODataQuery, OrderKey, SortDir, ast, parse_query};
use odata_db::{BodyMode, DbHandle, EntityRegistry, EntityType, JsonObject, Navigation};
use odata_server::{
    ActionContext, Controller, EntityService, HookContext, HookError, HookKind, HookRegistry,
    ServerConfig, ServiceError, action_fn, function_fn, hook_fn,
};
use serde_json::{Value as Json, json};

use entities::{category, product};

const DEFAULT_CHEAPEST: u64 = 3;

/// Entity types for the catalog tables.
///
/// # Errors
/// Column types without an EDM mapping or dangling navigations.
pub fn registry(schema: Option<&str>) -> Result<EntityRegistry> {
    let mut registry = EntityRegistry::new();
    registry.register(
        EntityType::from_sea_orm::<category::Entity>("Category")?
            .set_name("Categories")
            .default_schema(schema)
            .navigation(Navigation::one_to_many("Products", "Product", "CategoryId"))
            .build()?,
    )?;
    registry.register(
        EntityType::from_sea_orm::<product::Entity>("Product")?
            .set_name("Products")
            .default_schema(schema)
            .navigation(Navigation::many_to_one("Category", "Category", "CategoryId"))
            .build()?,
    )?;
    registry.validate()?;
    Ok(registry)
}

async fn reject_negative_price(ctx: HookContext) -> Result<HookContext, HookError> {
    match ctx.data.get("Price").and_then(Json::as_f64) {
        Some(price) if price < 0.0 => Err(HookError::reject("Price must not be negative")),
        _ => Ok(ctx),
    }
}

async fn trim_name(mut ctx: HookContext) -> Result<HookContext, HookError> {
    if let Some(Json::String(name)) = ctx.data.get_mut("Name") {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(HookError::reject("Name must not be blank"));
        }
        *name = trimmed.to_owned();
    }
    Ok(ctx)
}

/// Categories still holding products stay.
async fn keep_used_category(ctx: HookContext) -> Result<HookContext, HookError> {
    let Some(id) = ctx.key.as_ref().and_then(Json::as_i64) else {
        return Ok(ctx);
    };
    let query = parse_query(&format!("$filter=CategoryId%20eq%20{id}"), ctx.service.limits())
        .map_err(|e| HookError::reject(e.to_string()))?;
    let products = ctx
        .count("Products", &query)
        .await
        .map_err(|e| HookError::reject(e.to_string()))?;
    if products > 0 {
        return Err(HookError::reject(format!(
            "category {id} still has {products} products"
        )));
    }
    Ok(ctx)
}

async fn log_saved(ctx: HookContext) -> Result<HookContext, HookError> {
    tracing::info!(
        entity = %ctx.entity.name,
        key = ?ctx.key,
        "catalog entry saved"
    );
    Ok(ctx)
}

#[must_use]
pub fn hooks() -> HookRegistry {
    HookRegistry::new()
        .hook("Category", HookKind::BeforeCreate, hook_fn(trim_name))
        .hook("Category", HookKind::BeforeUpdate, hook_fn(trim_name))
        .hook("Category", HookKind::BeforeDelete, hook_fn(keep_used_category))
        .hook("Product", HookKind::BeforeCreate, hook_fn(trim_name))
        .hook("Product", HookKind::BeforeCreate, hook_fn(reject_negative_price))
        .hook("Product", HookKind::BeforeUpdate, hook_fn(reject_negative_price))
        .event("Product", HookKind::AfterSave, hook_fn(log_saved))
        .event("Category", HookKind::AfterSave, hook_fn(log_saved))
}

fn u64_param(params: &JsonObject, name: &str) -> Result<Option<u64>, ServiceError> {
    match params.get(name) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ServiceError::BadBody(format!("'{name}' must be a positive integer"))),
        Some(Json::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| ServiceError::BadBody(format!("'{name}' must be a positive integer"))),
        Some(_) => Err(ServiceError::BadBody(format!("'{name}' must be a number"))),
    }
}

fn f64_param(params: &JsonObject, name: &str) -> Result<f64, ServiceError> {
    params
        .get(name)
        .and_then(|v| match v {
            Json::Number(n) => n.as_f64(),
            Json::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| ServiceError::BadBody(format!("'{name}' must be a number")))
}

/// `GET Products/Default.cheapest?count=n`: the `n` lowest-priced products.
async fn cheapest(ctx: ActionContext) -> Result<Option<Json>, ServiceError> {
    let count = u64_param(&ctx.params, "count")?.unwrap_or(DEFAULT_CHEAPEST);
    ctx.service.limits().validate_top(count)?;
    let query = ODataQuery::new()
        .with_order(ODataOrderBy(vec![OrderKey {
            field: "Price".to_owned(),
            dir: SortDir::Asc,
        }]))
        .with_top(count);
    let page = ctx.service.find(&ctx.entity.set_name, &query).await?;
    let rows = page.rows.into_iter().map(Json::Object).collect();
    Ok(Some(Json::Array(rows)))
}

/// `POST Products(id)/Default.discount {"percent": p}`: lower the price.
async fn discount(ctx: ActionContext) -> Result<Option<Json>, ServiceError> {
    let target = ctx
        .target
        .ok_or_else(|| ServiceError::BadBody("discount is bound to a single product".into()))?;
    let percent = f64_param(&ctx.params, "percent")?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(ServiceError::BadBody("'percent' must be between 0 and 100".into()));
    }

    let price = target.get("Price").and_then(Json::as_f64).unwrap_or_default();
    let key = target
        .get(&ctx.entity.key)
        .and_then(Json::as_i64)
        .ok_or_else(|| ServiceError::internal("product row without a key"))?;
    let discounted = (price * (100.0 - percent)).round() / 100.0;

    let mut body = JsonObject::new();
    body.insert("Price".to_owned(), json!(discounted));
    let key = EntityKey {
        name: None,
        value: ast::Value::Number(key.into()),
    };
    let saved = ctx
        .service
        .update(&ctx.entity.set_name, &key, body, BodyMode::Merge)
        .await?;
    Ok(Some(Json::Object(saved)))
}

/// `GET Categories(id)/Default.productCount`
async fn product_count(ctx: ActionContext) -> Result<Option<Json>, ServiceError> {
    let id = ctx
        .target
        .as_ref()
        .and_then(|t| t.get("Id"))
        .and_then(Json::as_i64)
        .ok_or_else(|| ServiceError::BadBody("productCount is bound to a category".into()))?;
    let query = parse_query(&format!("$filter=CategoryId%20eq%20{id}"), ctx.service.limits())?;
    let count = ctx.service.count("Products", &query).await?;
    Ok(Some(json!({ "count": count })))
}

#[must_use]
pub fn controllers() -> Vec<Controller> {
    vec![
        Controller::new("Categories").action("productCount", function_fn(product_count)),
        Controller::new("Products")
            .action("cheapest", function_fn(cheapest))
            .action("discount", action_fn(discount)),
    ]
}

/// Wire the catalog into an [`EntityService`].
///
/// # Errors
/// Registry or hook validation failures.
pub fn service(
    db: DbHandle,
    schema: Option<&str>,
    server: &ServerConfig,
) -> Result<Arc<EntityService>> {
    let mut builder = EntityService::builder(db, registry(schema)?)
        .hooks(hooks())
        .limits(server.limits.clone())
        .max_page_size(server.max_page_size);
    for controller in controllers() {
        builder = builder.controller(controller);
    }
    Ok(builder.build()?)
}
