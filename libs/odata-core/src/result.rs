use serde::{Deserialize, Serialize};

/// JSON envelope returned for entity collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct ODataResult<T = serde_json::Value> {
    #[serde(rename = "@odata.context")]
    pub context: String,
    #[serde(rename = "@odata.count", skip_serializing_if = "Option::is_none", default)]
    pub count: Option<u64>,
    #[serde(rename = "@odata.nextLink", skip_serializing_if = "Option::is_none", default)]
    pub next_link: Option<String>,
    pub value: Vec<T>,
}

impl<T> ODataResult<T> {
    pub fn new(context: impl Into<String>, value: Vec<T>) -> Self {
        Self {
            context: context.into(),
            count: None,
            next_link: None,
            value,
        }
    }

    pub fn with_count(mut self, count: Option<u64>) -> Self {
        self.count = count;
        self
    }

    pub fn with_next_link(mut self, link: Option<String>) -> Self {
        self.next_link = link;
        self
    }
}

/// `<service root>/$metadata#<fragment>`
#[must_use]
pub fn context_url(service_root: &str, fragment: &str) -> String {
    format!("{}/$metadata#{fragment}", service_root.trim_end_matches('/'))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_omits_absent_annotations() {
        let result = ODataResult::new(context_url("/odata/", "Products"), vec![json!({"Id": 1})]);
        let body = serde_json::to_value(&result).unwrap();
        assert_eq!(
            body,
            json!({"@odata.context": "/odata/$metadata#Products", "value": [{"Id": 1}]})
        );
    }

    #[test]
    fn envelope_carries_count_and_next_link() {
        let result = ODataResult::<serde_json::Value>::new("/odata/$metadata#Products", vec![])
            .with_count(Some(12))
            .with_next_link(Some("/odata/Products?$skip=10".into()));
        let body = serde_json::to_value(&result).unwrap();
        assert_eq!(body["@odata.count"], 12);
        assert_eq!(body["@odata.nextLink"], "/odata/Products?$skip=10");
    }
}
