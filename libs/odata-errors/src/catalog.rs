//! Every failure the OData layer reports, keyed by a stable `odata.*` code.

use http::StatusCode;

use crate::problem::Problem;

/// One catalog entry. `code` doubles as the last segment of `type_url`.
#[derive(Debug, Clone, Copy)]
pub struct ErrDef {
    pub status: StatusCode,
    pub title: &'static str,
    pub code: &'static str,
    pub type_url: &'static str,
}

impl ErrDef {
    pub fn as_problem(&self, detail: impl Into<String>) -> Problem {
        Problem::new(self.status, self.title, detail)
            .with_code(self.code)
            .with_type(self.type_url)
    }

    pub fn with_context(
        &self,
        detail: impl Into<String>,
        instance: &str,
        trace_id: Option<String>,
    ) -> Problem {
        self.as_problem(detail).at(instance, trace_id)
    }
}

macro_rules! err_def {
    ($name:ident, $status:ident, $title:literal, $code:literal) => {
        pub const $name: ErrDef = ErrDef {
            status: StatusCode::$status,
            title: $title,
            code: $code,
            type_url: concat!("https://errors.odata-sea.dev/", $code),
        };
    };
}

err_def!(INVALID_FILTER, BAD_REQUEST, "Invalid Filter", "odata.query.invalid_filter");
err_def!(INVALID_ORDERBY, BAD_REQUEST, "Invalid OrderBy", "odata.query.invalid_orderby");
err_def!(INVALID_SELECT, BAD_REQUEST, "Invalid Select", "odata.query.invalid_select");
err_def!(INVALID_EXPAND, BAD_REQUEST, "Invalid Expand", "odata.query.invalid_expand");
err_def!(INVALID_PAGING, BAD_REQUEST, "Invalid Paging", "odata.query.invalid_paging");
err_def!(INVALID_QUERY, BAD_REQUEST, "Invalid Query", "odata.query.invalid");
err_def!(INVALID_KEY, BAD_REQUEST, "Invalid Key", "odata.resource.invalid_key");
err_def!(INVALID_BODY, BAD_REQUEST, "Invalid Body", "odata.body.invalid");
err_def!(NOT_FOUND, NOT_FOUND, "Not Found", "odata.resource.not_found");
err_def!(METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED, "Method Not Allowed", "odata.resource.method_not_allowed");
err_def!(CONFLICT, CONFLICT, "Conflict", "odata.resource.conflict");
err_def!(HOOK_REJECTED, UNPROCESSABLE_ENTITY, "Operation Rejected", "odata.hook.rejected");
err_def!(INTERNAL, INTERNAL_SERVER_ERROR, "Internal Server Error", "odata.server.internal");
