//! The `Sosreport` custom resource: declarative request to collect diagnostic
//! archives from a set of cluster nodes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "support.openshift.io";
pub const VERSION: &str = "v1alpha1";

/// Annotation holding the serialized set of nodes still waiting for dispatch.
pub const ANNOTATION_JOB_TO_RUN_LIST: &str = "job-to-run-list";
/// Annotation holding the serialized set of nodes with an in-flight workload.
pub const ANNOTATION_JOB_RUNNING_LIST: &str = "job-running-list";
/// Annotation on a workload pointing back at the node it targets.
pub const ANNOTATION_NODE_NAME: &str = "nodeName";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "support.openshift.io",
    version = "v1alpha1",
    kind = "Sosreport",
    plural = "sosreports",
    shortname = "sos",
    namespaced,
    status = "SosreportStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SosreportSpec {
    /// Nodes to run sosreports on, matched by label.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations that let sosreport jobs land on tainted nodes.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub struct SosreportStatus {
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub inprogress: bool,
    #[serde(default)]
    pub currentlyrunningnodes: Vec<String>,
    #[serde(default)]
    pub outstandingnodes: Vec<String>,
}

impl Sosreport {
    pub fn in_progress(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.inprogress)
    }

    pub fn finished(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.finished)
    }
}
