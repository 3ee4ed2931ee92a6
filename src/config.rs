use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_rules_file() -> String {
    "rules.yaml".to_string()
}

fn default_ignore_namespaces() -> Vec<String> {
    vec!["karpenter".to_string()]
}

fn default_accept_node_selectors() -> Vec<String> {
    vec!["kubernetes.io/os".to_string()]
}

/// Runtime configuration, merged from an optional YAML file and
/// `STEWARD_`-prefixed environment variables (environment wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StewardConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    /// Path to the YAML rule document.
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    /// Pod and daemon-set requests from these namespaces pass through with
    /// no patch.
    #[serde(default = "default_ignore_namespaces")]
    pub ignore_namespaces: Vec<String>,
    /// Node-selector keys retained on pods; all others are stripped.
    #[serde(default = "default_accept_node_selectors")]
    pub accept_node_selectors: Vec<String>,
    /// Verbose per-request tracing.
    #[serde(default)]
    pub debug: bool,
}

impl StewardConfig {
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("STEWARD_").split("__"))
            .extract()
            .map_err(Box::new)
    }
}
