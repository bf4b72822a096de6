//! Mapping from query-option errors to Problem (pure data).
//!
//! The HTTP layer adds instance paths and trace ids before rendering.

use odata_errors::{Problem, catalog};

use crate::Error;

impl From<Error> for Problem {
    fn from(err: Error) -> Self {
        let def = match &err {
            Error::InvalidFilter(_) => catalog::INVALID_FILTER,
            Error::InvalidOrderByField(_) => catalog::INVALID_ORDERBY,
            Error::InvalidSelect(_) => catalog::INVALID_SELECT,
            Error::InvalidExpand(_) => catalog::INVALID_EXPAND,
            Error::InvalidPaging { .. } => catalog::INVALID_PAGING,
            Error::InvalidKey(_) => catalog::INVALID_KEY,
            Error::InvalidCount(_)
            | Error::UnsupportedOption(_)
            | Error::DuplicateOption(_)
            | Error::UnsupportedFormat(_)
            | Error::MalformedQuery(_) => catalog::INVALID_QUERY,
        };
        def.as_problem(err.to_string())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn filter_error_converts_to_problem() {
        let problem: Problem = Error::InvalidFilter("malformed".to_owned()).into();

        assert_eq!(problem.status.as_u16(), 400);
        assert_eq!(problem.title, "Invalid Filter");
        assert!(problem.detail.contains("malformed"));
        assert_eq!(problem.code, "odata.query.invalid_filter");
    }

    #[test]
    fn paging_error_names_the_option() {
        let problem: Problem = Error::InvalidPaging {
            option: "skip",
            value: "-3".to_owned(),
        }
        .into();
        assert_eq!(problem.code, "odata.query.invalid_paging");
        assert_eq!(problem.detail, "invalid $skip value '-3'");
    }

    #[test]
    fn unknown_option_is_a_generic_query_error() {
        let problem: Problem = Error::UnsupportedOption("$search".to_owned()).into();
        assert_eq!(problem.code, "odata.query.invalid");
        assert!(problem.detail.contains("$search"));
    }
}
