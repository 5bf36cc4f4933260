use std::collections::BTreeMap;

/// Holds the number of the latest revision recorded for an Application.
pub const REVISION_NUMBER_ANNOTATION: &str = "paas.anvil.dev/revision-number";

/// Carries `spec.restartMarker` onto the workload pod template.
pub const RESTART_MARKER_ANNOTATION: &str = "paas.anvil.dev/restart-marker";

pub const REVISION_APPLICATION_LABEL: &str = "paas.anvil.dev/application";

pub const APP_LABEL: &str = "app";

/// Port every network endpoint exposes, whatever the container listens on.
pub const EXPOSED_PORT: i32 = 80;

pub const HTTP_PORT_NAME: &str = "http";

pub fn app_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), app_name.to_string())])
}

pub fn workload_name(app_name: &str) -> String {
    app_name.to_string()
}

pub fn network_endpoint_name(app_name: &str) -> String {
    app_name.to_string()
}

pub fn routing_name(app_name: &str) -> String {
    app_name.to_string()
}

pub fn revision_name(app_name: &str, number: u64) -> String {
    format!("{}-v{}", app_name, number)
}

/// Inverse of [`revision_name`]; `None` if `name` is not a revision of `app_name`.
pub fn revision_number(app_name: &str, name: &str) -> Option<u64> {
    name.strip_prefix(app_name)?
        .strip_prefix("-v")?
        .parse()
        .ok()
}

pub fn config_secret_name(config_name: &str, content_hash: &str) -> String {
    format!("{}-{}", config_name, content_hash)
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
