use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "paas.anvil.dev", version = "v1", kind = "Application")]
#[kube(shortname = "app", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub routing_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<ApplicationDomain>,
    /// Name of the Secret whose entries are injected into the container environment.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_ref: String,
    /// Opaque value; changing it cycles the application's pods.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_marker: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDomain {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "paas.anvil.dev", version = "v1", kind = "ApplicationConfig")]
#[kube(shortname = "appcfg", namespaced)]
pub struct ApplicationConfigSpec {
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

// Revisions are written once and never updated.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "paas.anvil.dev", version = "v1", kind = "ApplicationRevision")]
#[kube(shortname = "apprev", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRevisionSpec {
    pub app: ApplicationSpec,
    #[serde(default)]
    pub cfg: ApplicationConfigSpec,
    pub app_hash: String,
    #[serde(default)]
    pub cfg_hash: String,
}
