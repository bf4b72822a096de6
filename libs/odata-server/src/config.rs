use odata_core::ODataLimits;
use serde::{Deserialize, Serialize};

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_base_path() -> String {
    "/odata".to_owned()
}

fn default_namespace() -> String {
    "Default".to_owned()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// HTTP side of the service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Mount point of the service root, e.g. `/odata`.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Schema namespace; actions are addressed as `<namespace>.<name>`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub cors_enabled: bool,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Server-driven paging: collections longer than this get `@odata.nextLink`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_page_size: Option<u64>,

    #[serde(default)]
    pub limits: ODataLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            base_path: default_base_path(),
            namespace: default_namespace(),
            cors_enabled: false,
            request_timeout_ms: default_request_timeout_ms(),
            max_page_size: None,
            limits: ODataLimits::default(),
        }
    }
}

impl ServerConfig {
    /// Base path without trailing slash; empty for a root mount.
    #[must_use]
    pub fn service_root(&self) -> &str {
        self.base_path.trim_end_matches('/')
    }
}
