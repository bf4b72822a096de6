//! HTTP surface: one catch-all route under the service root, dispatched on
//! the parsed [`ResourcePath`].

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use odata_core::{EntityKey, ODataResult, context_url, format_key_value, parse_query};
use odata_db::{BodyMode, EntityType, JsonObject, Related};
use odata_errors::Problem;
use serde_json::Value as JsonValue;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::ServiceError;
use crate::metadata;
use crate::resource_path::{self, ResourcePath};
use crate::service::{EntityService, Page, RelatedResult};

pub const ODATA_VERSION: HeaderName = HeaderName::from_static("odata-version");
const REQUEST_ID: &str = "x-request-id";
const PREFER_REPRESENTATION: &str = "return=representation";

#[derive(Clone)]
struct AppState {
    service: Arc<EntityService>,
    root: Arc<str>,
    namespace: Arc<str>,
}

/// Build the router with its middleware stack.
///
/// Runtime order, outermost first: `SetRequestId` → `PropagateRequestId` →
/// Trace → Timeout → CORS (when enabled) → `OData-Version` → handler.
pub fn router(service: Arc<EntityService>, config: &ServerConfig) -> Router {
    let root = config.service_root();
    let state = AppState {
        service,
        root: Arc::from(root),
        namespace: Arc::from(config.namespace.as_str()),
    };

    let routes: Router<AppState> = if root.is_empty() {
        Router::new()
            .route("/", any(dispatch))
            .route("/{*path}", any(dispatch))
    } else {
        Router::new()
            .route(root, any(dispatch))
            .route(&format!("{root}/"), any(dispatch))
            .route(&format!("{root}/{{*path}}"), any(dispatch))
    };
    let mut router = routes.with_state(state).layer(from_fn(odata_version));

    if config.cors_enabled {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([header::LOCATION, ODATA_VERSION]),
        );
    }

    router = router.layer(TimeoutLayer::with_status_code(
        StatusCode::GATEWAY_TIMEOUT,
        Duration::from_millis(config.request_timeout_ms),
    ));
    router = apply_trace_layer(router);
    router = router.layer(PropagateRequestIdLayer::x_request_id());
    router.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn apply_trace_layer(router: Router) -> Router {
    use tracing::field::Empty;

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                let rid = req
                    .headers()
                    .get(REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("n/a");
                tracing::info_span!(
                    "http_request",
                    method = %req.method(),
                    uri = %req.uri().path(),
                    request_id = %rid,
                    status = Empty,
                    latency_ms = Empty,
                )
            })
            .on_response(|res: &Response, latency: Duration, span: &tracing::Span| {
                span.record("status", res.status().as_u16());
                span.record("latency_ms", latency.as_millis());
            }),
    )
}

async fn odata_version(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    res.headers_mut()
        .insert(ODATA_VERSION, HeaderValue::from_static("4.0"));
    res
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let instance = uri.path().to_owned();
    match handle(&state, &method, &uri, &headers, &body).await {
        Ok(res) => res,
        Err(err) => {
            let trace_id = headers
                .get(REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);
            let problem = odata_errors::finalize(Problem::from(err), &instance, trace_id);
            problem.into_response()
        }
    }
}

fn not_allowed(method: &Method, uri: &Uri) -> ServiceError {
    ServiceError::MethodNotAllowed {
        method: method.to_string(),
        resource: uri.path().to_owned(),
    }
}

async fn handle(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ServiceError> {
    let root = state.root.as_ref();
    let service = &state.service;
    let rest = uri.path().strip_prefix(root).unwrap_or_default();
    let path = resource_path::parse(rest, &state.namespace)?;
    let raw_query = uri.query().unwrap_or_default();
    tracing::debug!(set = path.entity_set(), %method, "dispatching odata request");

    match (path, method.clone()) {
        (ResourcePath::ServiceDocument, Method::GET) => {
            Ok(Json(metadata::service_document(service, root)).into_response())
        }
        (ResourcePath::Metadata, Method::GET) => {
            let xml = metadata::csdl(service, &state.namespace)?;
            Ok(([(header::CONTENT_TYPE, "application/xml")], xml).into_response())
        }
        (ResourcePath::Collection { set }, Method::GET) => {
            let query = parse_query(raw_query, service.limits())?;
            let page = service.find(&set, &query).await?;
            let (entity, _) = service.resolve_set(&set)?;
            let fragment = collection_fragment(&entity, query.selected_fields());
            Ok(collection_response(root, &entity, &fragment, raw_query, page))
        }
        (ResourcePath::Collection { set }, Method::POST) => {
            let created = service.create(&set, json_object(body)?).await?;
            let (entity, _) = service.resolve_set(&set)?;
            let location = entity_url(root, &entity, &created);
            let body = with_context(
                context_url(root, &format!("{}/$entity", entity.set_name)),
                created,
            );
            let mut res = (StatusCode::CREATED, Json(body)).into_response();
            if let Ok(v) = HeaderValue::from_str(&location) {
                res.headers_mut().insert(header::LOCATION, v);
            }
            Ok(res)
        }
        (ResourcePath::Count { set }, Method::GET) => {
            let query = parse_query(raw_query, service.limits())?;
            let n = service.count(&set, &query).await?;
            Ok(([(header::CONTENT_TYPE, "text/plain")], n.to_string()).into_response())
        }
        (ResourcePath::Entity { set, key }, Method::GET) => {
            let query = parse_query(raw_query, service.limits())?;
            let row = service.find_one(&set, &key, &query).await?;
            let (entity, _) = service.resolve_set(&set)?;
            let ctx = context_url(root, &format!("{}/$entity", entity.set_name));
            Ok(Json(with_context(ctx, row)).into_response())
        }
        (ResourcePath::Entity { set, key }, Method::PATCH) => {
            update(state, &set, &key, BodyMode::Merge, headers, body).await
        }
        (ResourcePath::Entity { set, key }, Method::PUT) => {
            update(state, &set, &key, BodyMode::Replace, headers, body).await
        }
        (ResourcePath::Entity { set, key }, Method::DELETE) => {
            service.delete(&set, &key).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (
            ResourcePath::Navigation {
                set,
                key,
                navigation,
            },
            Method::GET,
        ) => {
            let query = parse_query(raw_query, service.limits())?;
            let result = service.find_related(&set, &key, &navigation, &query).await?;
            Ok(related_response(root, result))
        }
        (ResourcePath::CollectionAction { set, action }, m)
            if m == Method::GET || m == Method::POST =>
        {
            invoke(state, &set, None, &action, &m, raw_query, body).await
        }
        (ResourcePath::EntityAction { set, key, action }, m)
            if m == Method::GET || m == Method::POST =>
        {
            invoke(state, &set, Some(&key), &action, &m, raw_query, body).await
        }
        _ => Err(not_allowed(method, uri)),
    }
}

async fn update(
    state: &AppState,
    set: &str,
    key: &EntityKey,
    mode: BodyMode,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ServiceError> {
    let saved = state
        .service
        .update(set, key, json_object(body)?, mode)
        .await?;
    if !prefers_representation(headers) {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let (entity, _) = state.service.resolve_set(set)?;
    let ctx = context_url(&state.root, &format!("{}/$entity", entity.set_name));
    let mut res = Json(with_context(ctx, saved)).into_response();
    res.headers_mut().insert(
        HeaderName::from_static("preference-applied"),
        HeaderValue::from_static(PREFER_REPRESENTATION),
    );
    Ok(res)
}

fn related_response(root: &str, result: RelatedResult) -> Response {
    let target = &result.target;
    match result.related {
        Related::One(Some(row)) => {
            let ctx = context_url(root, &format!("{}/$entity", target.set_name));
            Json(with_context(ctx, row)).into_response()
        }
        Related::One(None) => StatusCode::NO_CONTENT.into_response(),
        Related::Many(found) => {
            let value: Vec<JsonValue> = found.rows.into_iter().map(JsonValue::Object).collect();
            let ctx = context_url(root, &target.set_name);
            let envelope = ODataResult::new(ctx, value).with_count(found.count);
            Json(envelope).into_response()
        }
    }
}

async fn invoke(
    state: &AppState,
    set: &str,
    key: Option<&EntityKey>,
    action: &str,
    method: &Method,
    raw_query: &str,
    body: &Bytes,
) -> Result<Response, ServiceError> {
    let via_get = method == Method::GET;
    let params = if via_get {
        query_params(raw_query)?
    } else if body.is_empty() {
        JsonObject::new()
    } else {
        json_object(body)?
    };

    let result = state
        .service
        .invoke(set, key, action, params, via_get)
        .await?;
    Ok(match result {
        None => StatusCode::NO_CONTENT.into_response(),
        Some(JsonValue::Array(items)) => {
            let ctx = context_url(&state.root, "Collection(Edm.Untyped)");
            Json(ODataResult::new(ctx, items)).into_response()
        }
        Some(other) => Json(other).into_response(),
    })
}

/// Function parameters: every non-`$` query parameter as a string.
fn query_params(raw: &str) -> Result<JsonObject, ServiceError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw)
        .map_err(|e| odata_core::Error::MalformedQuery(e.to_string()))?;
    Ok(pairs
        .into_iter()
        .filter(|(k, _)| !k.starts_with('$'))
        .map(|(k, v)| (k, JsonValue::String(v)))
        .collect())
}

fn json_object(body: &Bytes) -> Result<JsonObject, ServiceError> {
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err(ServiceError::BadBody("expected a JSON object".to_owned())),
        Err(e) => Err(ServiceError::BadBody(e.to_string())),
    }
}

fn prefers_representation(headers: &HeaderMap) -> bool {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim().eq_ignore_ascii_case(PREFER_REPRESENTATION))
}

fn with_context(context: String, row: JsonObject) -> JsonValue {
    let mut obj = JsonObject::with_capacity(row.len() + 1);
    obj.insert("@odata.context".to_owned(), JsonValue::String(context));
    obj.extend(row);
    JsonValue::Object(obj)
}

fn collection_fragment(entity: &EntityType, select: Option<&[String]>) -> String {
    match select {
        Some(fields) if !fields.is_empty() => format!("{}({})", entity.set_name, fields.join(",")),
        _ => entity.set_name.clone(),
    }
}

fn entity_url(root: &str, entity: &EntityType, row: &JsonObject) -> String {
    let key = row
        .get(&entity.key_property().name)
        .map(|value| encode_key_literal(&format_key_value(value)))
        .unwrap_or_default();
    format!("{root}/{}({key})", entity.set_name)
}

/// Percent-encode a key literal, leaving its `'` delimiters readable.
fn encode_key_literal(literal: &str) -> String {
    literal
        .split('\'')
        .map(|part| urlencoding::encode(part).into_owned())
        .collect::<Vec<_>>()
        .join("'")
}

/// Next-page link: the original query with `$skip` (and `$top`) advanced.
fn next_link(root: &str, set: &str, raw_query: &str, skip: u64, top: Option<u64>) -> String {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw_query).unwrap_or_default();
    let mut pairs: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(k, _)| k != "$skip" && k != "$top")
        .collect();
    if let Some(top) = top {
        pairs.push(("$top".to_owned(), top.to_string()));
    }
    pairs.push(("$skip".to_owned(), skip.to_string()));
    let query = serde_urlencoded::to_string(&pairs).unwrap_or_default();
    format!("{root}/{set}?{query}")
}

fn collection_response(
    root: &str,
    entity: &EntityType,
    fragment: &str,
    raw_query: &str,
    page: Page,
) -> Response {
    let link = page
        .next_skip
        .map(|skip| next_link(root, &entity.set_name, raw_query, skip, page.next_top));
    let value: Vec<JsonValue> = page.rows.into_iter().map(JsonValue::Object).collect();
    let envelope = ODataResult::new(context_url(root, fragment), value)
        .with_count(page.count)
        .with_next_link(link);
    Json(envelope).into_response()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn key_literals_are_percent_encoded() {
        assert_eq!(encode_key_literal("'soft drinks'"), "'soft%20drinks'");
        assert_eq!(encode_key_literal("'O''Brien/Sons'"), "'O''Brien%2FSons'");
        assert_eq!(encode_key_literal("42"), "42");
    }

    #[test]
    fn next_link_replaces_paging_options() {
        let link = next_link(
            "/odata",
            "Products",
            "$filter=Price%20gt%201&$top=50&$skip=20",
            40,
            Some(30),
        );
        let (path, query) = link.split_once('?').unwrap();
        assert_eq!(path, "/odata/Products");
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("$filter".to_owned(), "Price gt 1".to_owned()),
                ("$top".to_owned(), "30".to_owned()),
                ("$skip".to_owned(), "40".to_owned()),
            ]
        );
    }

    #[test]
    fn prefer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(!prefers_representation(&headers));
        headers.insert(
            "prefer",
            HeaderValue::from_static("odata.maxpagesize=5, return=representation"),
        );
        assert!(prefers_representation(&headers));
        headers.insert("prefer", HeaderValue::from_static("return=minimal"));
        assert!(!prefers_representation(&headers));
    }

    #[test]
    fn function_params_skip_system_options() {
        let params = query_params("limit=3&$format=json&name=O%27Brien").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["limit"], JsonValue::String("3".to_owned()));
        assert_eq!(params["name"], JsonValue::String("O'Brien".to_owned()));
    }

    #[test]
    fn body_must_be_an_object() {
        assert!(json_object(&Bytes::from_static(br#"{"Name":"Tea"}"#)).is_ok());
        assert!(matches!(
            json_object(&Bytes::from_static(b"[1,2]")),
            Err(ServiceError::BadBody(_))
        ));
        assert!(matches!(
            json_object(&Bytes::from_static(b"{oops")),
            Err(ServiceError::BadBody(_))
        ));
    }
}
