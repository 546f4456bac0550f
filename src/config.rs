//! Config Overlay (C2): merges hard-coded defaults with the global, development
//! and upload config maps plus the upload secret into an effective, per-reconcile
//! configuration and an environment map for the workload.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use tracing::{debug, info};

pub const GLOBAL_CONFIG_MAP_NAME: &str = "sosreport-global-configuration";
pub const DEVELOPMENT_CONFIG_MAP_NAME: &str = "sosreport-development-configuration";
pub const UPLOAD_CONFIG_MAP_NAME: &str = "sosreport-upload-configuration";
pub const UPLOAD_SECRET_NAME: &str = "sosreport-upload-secret";

pub const DEFAULT_IMAGE: &str = "quay.io/akaris/sosreport-centos:0.0.2";
pub const DEFAULT_COMMAND: &str = "bash /scripts/entrypoint.sh";
pub const DEFAULT_CONCURRENCY: u32 = 1;
pub const DEFAULT_PVC_CAPACITY: &str = "10Gi";

/// Effective settings for one reconcile, after layering defaults with the
/// optional config maps.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerConfig {
    pub image: String,
    pub command: String,
    pub image_pull_policy: Option<String>,
    pub concurrency: u32,
    pub pvc_storage_class: Option<String>,
    pub pvc_capacity: String,
    pub debug: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            image: DEFAULT_IMAGE.to_string(),
            command: DEFAULT_COMMAND.to_string(),
            image_pull_policy: None,
            concurrency: DEFAULT_CONCURRENCY,
            pvc_storage_class: None,
            pvc_capacity: DEFAULT_PVC_CAPACITY.to_string(),
            debug: false,
        }
    }
}

const VALID_PULL_POLICIES: [&str; 3] = ["Always", "Never", "IfNotPresent"];

const UPLOAD_CM_RENAME: &[(&str, &str)] = &[
    ("upload-method", "UPLOAD_METHOD"),
    ("case-number", "CASE_NUMBER"),
    ("obfuscate", "OBFUSCATE"),
    ("nfs-share", "NFS_SHARE"),
    ("nfs-options", "NFS_OPTIONS"),
    ("ftp-server", "FTP_SERVER"),
];

const DEVELOPMENT_CM_RENAME: &[(&str, &str)] =
    &[("simulation-mode", "SIMULATION_MODE"), ("debug", "DEBUG")];

const SECRET_RENAME: &[(&str, &str)] = &[("username", "USERNAME"), ("password", "PASSWORD")];

/// Fetch a config map by name in `namespace`. Absence is not an error: callers
/// fall back to defaults and only log at debug.
async fn get_config_map(client: &Client, namespace: &str, name: &str) -> Option<ConfigMap> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.get(name).await {
        Ok(cm) => Some(cm),
        Err(e) => {
            debug!(namespace, name, error = %e, "config map not found, using defaults");
            None
        }
    }
}

async fn get_secret(client: &Client, namespace: &str, name: &str) -> Option<Secret> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match api.get(name).await {
        Ok(s) => Some(s),
        Err(e) => {
            info!(namespace, name, error = %e, "unable to get authentication secret");
            None
        }
    }
}

/// Compose the effective reconciler configuration for a namespace: defaults,
/// then the global config map, then (only with `developer-mode` compiled in)
/// the development config map.
pub async fn effective_config(client: &Client, namespace: &str) -> ReconcilerConfig {
    let mut config = ReconcilerConfig::default();

    if let Some(cm) = get_config_map(client, namespace, GLOBAL_CONFIG_MAP_NAME).await {
        let data = cm.data.unwrap_or_default();
        if let Some(raw) = data.get("concurrency") {
            match raw.parse::<u32>() {
                Ok(n) if n > 0 => config.concurrency = n,
                _ => debug!(concurrency = raw, "cannot parse concurrency, keeping default"),
            }
        }
        if let Some(class) = data.get("pvc-storage-class") {
            config.pvc_storage_class = Some(class.clone());
        }
        if let Some(capacity) = data.get("pvc-capacity") {
            config.pvc_capacity = capacity.clone();
        }
    }

    if cfg!(feature = "developer-mode") {
        if let Some(cm) = get_config_map(client, namespace, DEVELOPMENT_CONFIG_MAP_NAME).await {
            let data = cm.data.unwrap_or_default();
            if let Some(image) = data.get("sosreport-image") {
                config.image = image.clone();
            }
            if let Some(command) = data.get("sosreport-command") {
                config.command = command.clone();
            }
            if let Some(policy) = data.get("image-pull-policy") {
                if VALID_PULL_POLICIES.contains(&policy.as_str()) {
                    config.image_pull_policy = Some(policy.clone());
                } else {
                    debug!(policy, "unknown image-pull-policy, ignoring");
                }
            }
            if let Some(debug_flag) = data.get("debug") {
                config.debug = debug_flag == "true";
            }
        }
    }

    config
}

/// Build the environment map for a workload from the upload config map, the
/// development config map (developer mode only) and the upload secret.
/// Unknown keys are dropped; secret values are trimmed of trailing newlines.
pub async fn environment_map(client: &Client, namespace: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    if let Some(cm) = get_config_map(client, namespace, UPLOAD_CONFIG_MAP_NAME).await {
        apply_rename_table(&cm.data.unwrap_or_default(), UPLOAD_CM_RENAME, &mut env);
    }

    if cfg!(feature = "developer-mode") {
        if let Some(cm) = get_config_map(client, namespace, DEVELOPMENT_CONFIG_MAP_NAME).await {
            apply_rename_table(&cm.data.unwrap_or_default(), DEVELOPMENT_CM_RENAME, &mut env);
        }
    }

    if let Some(secret) = get_secret(client, namespace, UPLOAD_SECRET_NAME).await {
        if let Some(data) = secret.data {
            for (key, target) in SECRET_RENAME {
                if let Some(value) = data.get(*key) {
                    let trimmed = String::from_utf8_lossy(&value.0).trim_end_matches('\n').to_string();
                    env.insert((*target).to_string(), trimmed);
                }
            }
        }
    }

    env
}

fn apply_rename_table(
    data: &BTreeMap<String, String>,
    table: &[(&str, &str)],
    env: &mut BTreeMap<String, String>,
) {
    for (key, target) in table {
        if let Some(value) = data.get(*key) {
            env.insert((*target).to_string(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_documented_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.command, DEFAULT_COMMAND);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.pvc_capacity, DEFAULT_PVC_CAPACITY);
        assert!(config.pvc_storage_class.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn rename_table_only_keeps_known_keys() {
        let data = BTreeMap::from([
            ("case-number".to_string(), "01234567".to_string()),
            ("unrelated-key".to_string(), "ignored".to_string()),
        ]);
        let mut env = BTreeMap::new();
        apply_rename_table(&data, UPLOAD_CM_RENAME, &mut env);
        assert_eq!(env.get("CASE_NUMBER"), Some(&"01234567".to_string()));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn secret_values_are_trimmed_of_trailing_newlines() {
        let trimmed = "hunter2\n\n".trim_end_matches('\n').to_string();
        assert_eq!(trimmed, "hunter2");
    }
}
