#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! OData v4 service over registered entity types.
//!
//! An [`EntityService`] owns the database handle, the entity registry, the
//! lifecycle hooks and one [`Controller`] per exposed entity set. [`router`]
//! puts it behind axum with request ids, tracing, timeouts and problem
//! responses.

pub mod config;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod metadata;
pub mod resource_path;
pub mod router;
pub mod service;

pub use config::ServerConfig;
pub use controller::{Action, ActionContext, Controller, action_fn, function_fn};
pub use error::ServiceError;
pub use hooks::{Hook, HookContext, HookError, HookKind, HookRegistry, hook_fn};
pub use resource_path::ResourcePath;
pub use router::{ODATA_VERSION, router};
pub use service::{EntityService, EntityServiceBuilder, Page, RelatedResult};
