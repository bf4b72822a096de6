use odata_db::{FieldViolation, RepoError, TranslateError};
use odata_errors::{Problem, ValidationViolation, catalog};
use thiserror::Error;

use crate::hooks::HookError;

/// Everything an entity service operation can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity_set}({key}) does not exist")]
    NotFound { entity_set: String, key: String },

    #[error("resource not found: {0}")]
    NoSuchResource(String),

    #[error("{0}")]
    ServerInternal(String),

    #[error(transparent)]
    Query(#[from] odata_core::Error),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error("invalid request body: {0}")]
    BadBody(String),

    #[error("request body has invalid properties")]
    Body(Vec<FieldViolation>),

    #[error("{0}")]
    Conflict(String),

    #[error("hook rejected the operation: {0}")]
    Hook(#[from] HookError),

    #[error("{method} is not allowed on {resource}")]
    MethodNotAllowed { method: String, resource: String },
}

impl ServiceError {
    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::ServerInternal(message.into())
    }
}

impl From<RepoError> for ServiceError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Translate(e) => ServiceError::Translate(e),
            RepoError::Body(violations) => ServiceError::Body(violations),
            RepoError::InvalidValue { field, message } => {
                ServiceError::Body(vec![FieldViolation { field, message }])
            }
            RepoError::Conflict(msg) | RepoError::ForeignKey(msg) => ServiceError::Conflict(msg),
            other => ServiceError::ServerInternal(other.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for ServiceError {
    fn from(err: sea_orm::DbErr) -> Self {
        RepoError::from(err).into()
    }
}

impl From<odata_db::EntityError> for ServiceError {
    fn from(err: odata_db::EntityError) -> Self {
        ServiceError::ServerInternal(err.to_string())
    }
}

fn translate_def(err: &TranslateError) -> odata_errors::ErrDef {
    match err {
        TranslateError::UnknownSelectField(_) => catalog::INVALID_SELECT,
        TranslateError::UnknownOrderByField(_) => catalog::INVALID_ORDERBY,
        _ => catalog::INVALID_FILTER,
    }
}

impl From<ServiceError> for Problem {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound { .. } | ServiceError::NoSuchResource(_) => {
                catalog::NOT_FOUND.as_problem(err.to_string())
            }
            ServiceError::ServerInternal(ref detail) => {
                tracing::error!(error = %detail, "internal error");
                catalog::INTERNAL.as_problem("An internal error occurred")
            }
            ServiceError::Query(e) => e.into(),
            ServiceError::Translate(ref e) => translate_def(e).as_problem(err.to_string()),
            ServiceError::BadBody(detail) => catalog::INVALID_BODY.as_problem(detail),
            ServiceError::Body(violations) => catalog::INVALID_BODY
                .as_problem("One or more properties are invalid")
                .with_errors(
                    violations
                        .into_iter()
                        .map(|v| ValidationViolation {
                            field: v.field,
                            message: v.message,
                        })
                        .collect(),
                ),
            ServiceError::Conflict(detail) => catalog::CONFLICT.as_problem(detail),
            ServiceError::Hook(e) => catalog::HOOK_REJECTED.as_problem(e.message),
            ServiceError::MethodNotAllowed { .. } => {
                catalog::METHOD_NOT_ALLOWED.as_problem(err.to_string())
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn not_found_names_the_resource() {
        let p: Problem = ServiceError::NotFound {
            entity_set: "Products".to_owned(),
            key: "42".to_owned(),
        }
        .into();
        assert_eq!(p.status, StatusCode::NOT_FOUND);
        assert_eq!(p.detail, "Products(42) does not exist");
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let p: Problem = ServiceError::internal("navigation target 'Ghost' missing").into();
        assert_eq!(p.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!p.detail.contains("Ghost"));
    }

    #[test]
    fn repository_errors_map_by_kind() {
        let conflict: ServiceError = RepoError::Conflict("UNIQUE constraint failed".into()).into();
        assert!(matches!(conflict, ServiceError::Conflict(_)));

        let fk: ServiceError = RepoError::ForeignKey("FOREIGN KEY constraint failed".into()).into();
        assert_eq!(Problem::from(fk).status, StatusCode::CONFLICT);

        let other: ServiceError = RepoError::MissingInsertedRow("Product".into()).into();
        assert!(matches!(other, ServiceError::ServerInternal(_)));
    }

    #[test]
    fn body_violations_are_listed() {
        let p: Problem = ServiceError::Body(vec![FieldViolation {
            field: "Colour".to_owned(),
            message: "unknown property".to_owned(),
        }])
        .into();
        assert_eq!(p.status, StatusCode::BAD_REQUEST);
        assert_eq!(p.code, "odata.body.invalid");
        let errors = p.errors.unwrap();
        assert_eq!(errors[0].field, "Colour");
    }

    #[test]
    fn translate_errors_pick_the_option_code() {
        let p: Problem =
            ServiceError::from(TranslateError::UnknownOrderByField("Nope".into())).into();
        assert_eq!(p.code, "odata.query.invalid_orderby");
        let p: Problem = ServiceError::from(TranslateError::UnknownField("Nope".into())).into();
        assert_eq!(p.code, "odata.query.invalid_filter");
    }

    #[test]
    fn hook_rejection_is_unprocessable() {
        let p: Problem = ServiceError::from(HookError::reject("price must be positive")).into();
        assert_eq!(p.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(p.detail, "price must be positive");
    }
}
