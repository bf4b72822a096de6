//! Caps on query options, checked while parsing so oversized requests never
//! reach the database.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Per-service caps. Any field missing from configuration keeps its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ODataLimits {
    pub max_top: u64,
    pub max_orderby_fields: usize,
    /// Raw `$filter` text, in bytes.
    pub max_filter_length: usize,
    /// Nodes in the converted `$filter` tree.
    pub max_filter_nodes: usize,
    pub max_select_fields: usize,
    pub max_expand: usize,
}

impl Default for ODataLimits {
    fn default() -> Self {
        Self {
            max_top: 1000,
            max_orderby_fields: 5,
            max_filter_length: 2000,
            max_filter_nodes: 2000,
            max_select_fields: 100,
            max_expand: 8,
        }
    }
}

/// `Err(make(max))` when `actual` is over `max`.
fn within<T: PartialOrd + Copy>(actual: T, max: T, make: impl FnOnce(T) -> Error) -> Result<(), Error> {
    if actual > max { Err(make(max)) } else { Ok(()) }
}

impl ODataLimits {
    #[must_use]
    pub fn with_max_top(self, max_top: u64) -> Self {
        Self { max_top, ..self }
    }

    #[must_use]
    pub fn with_max_filter_length(self, max_filter_length: usize) -> Self {
        Self {
            max_filter_length,
            ..self
        }
    }

    /// # Errors
    /// `Error::InvalidPaging` for a `$top` above `max_top`.
    pub fn validate_top(&self, top: u64) -> Result<(), Error> {
        within(top, self.max_top, |max| Error::InvalidPaging {
            option: "top",
            value: format!("{top} (max: {max})"),
        })
    }

    /// # Errors
    /// `Error::InvalidFilter` when the raw text is too long.
    pub fn validate_filter(&self, filter: &str) -> Result<(), Error> {
        within(filter.len(), self.max_filter_length, |max| {
            Error::InvalidFilter(format!("expression longer than {max} characters"))
        })
    }

    /// # Errors
    /// `Error::InvalidFilter` when the tree has too many nodes.
    pub fn validate_filter_nodes(&self, nodes: usize) -> Result<(), Error> {
        within(nodes, self.max_filter_nodes, |_| {
            Error::InvalidFilter("filter too complex".into())
        })
    }

    /// # Errors
    /// `Error::InvalidOrderByField` when there are too many sort keys.
    pub fn validate_orderby_count(&self, count: usize) -> Result<(), Error> {
        within(count, self.max_orderby_fields, |max| {
            Error::InvalidOrderByField(format!("at most {max} sort keys are allowed"))
        })
    }

    /// # Errors
    /// `Error::InvalidSelect` when too many properties are selected.
    pub fn validate_select_count(&self, count: usize) -> Result<(), Error> {
        within(count, self.max_select_fields, |max| {
            Error::InvalidSelect(format!("at most {max} properties can be selected"))
        })
    }

    /// # Errors
    /// `Error::InvalidExpand` when too many navigations are expanded.
    pub fn validate_expand_count(&self, count: usize) -> Result<(), Error> {
        within(count, self.max_expand, |max| {
            Error::InvalidExpand(format!("at most {max} navigations can be expanded"))
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn top_equal_to_the_cap_is_accepted() {
        let limits = ODataLimits::default().with_max_top(50);
        assert!(limits.validate_top(50).is_ok());
        assert!(matches!(
            limits.validate_top(51),
            Err(Error::InvalidPaging { option: "top", .. })
        ));
    }

    #[test]
    fn long_filters_are_refused_before_parsing() {
        let limits = ODataLimits::default().with_max_filter_length(10);
        assert!(limits.validate_filter("Id eq 1").is_ok());
        let err = limits.validate_filter("Name eq 'Chartreuse'").unwrap_err();
        assert!(err.to_string().contains("10 characters"), "{err}");
    }

    #[test]
    fn list_caps_name_the_option() {
        let limits = ODataLimits {
            max_orderby_fields: 1,
            max_select_fields: 1,
            max_expand: 0,
            ..ODataLimits::default()
        };
        assert!(matches!(
            limits.validate_orderby_count(2),
            Err(Error::InvalidOrderByField(_))
        ));
        assert!(matches!(limits.validate_select_count(2), Err(Error::InvalidSelect(_))));
        assert!(matches!(limits.validate_expand_count(1), Err(Error::InvalidExpand(_))));
        assert!(limits.validate_filter_nodes(2000).is_ok());
    }

    #[test]
    fn missing_fields_keep_defaults() {
        let limits: ODataLimits = serde_json::from_str(r#"{"max_expand": 2}"#).unwrap();
        assert_eq!(limits.max_expand, 2);
        assert_eq!(limits.max_top, 1000);
        assert!(serde_json::from_str::<ODataLimits>(r#"{"max_depth": 2}"#).is_err());
    }
}
