//! Cluster API Gateway (C1): the only module that talks to the Kubernetes API
//! directly. Everything else operates on typed values and goes through here
//! for reads, writes and event emission.
//!
//! Reads are served from `kube`'s watch-backed cache and writes return as soon
//! as the API server accepts them, before that cache has refreshed: callers
//! must not assume a write is visible to the very next read in the same
//! reconcile.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::Sosreport;
use crate::error::Result;

pub const FIELD_MANAGER: &str = "sosreport-operator";

#[derive(Clone)]
pub struct Gateway {
    client: Client,
    namespace: String,
    recorder: Recorder,
}

impl Gateway {
    pub fn new(client: Client, namespace: &str) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Gateway {
            client,
            namespace: namespace.to_string(),
            recorder,
        }
    }

    fn requests(&self) -> Api<Sosreport> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Nodes matching `selector`. An empty selector matches every node.
    pub async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let lp = ListParams::default().labels(&label_selector);
        let list = api.list(&lp).await?;
        Ok(list.items)
    }

    pub async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.pvcs().create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    pub async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs().create(&PostParams::default(), job).await?;
        Ok(())
    }

    /// Merge-patches the two scheduling annotations on the request. A no-op
    /// patch still round-trips through the API; callers are expected to skip
    /// calling this when nothing actually changed.
    pub async fn patch_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "annotations": annotations,
            }
        });
        self.requests()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await?;
        Ok(())
    }

    pub async fn patch_status(&self, name: &str, status: &crate::crd::SosreportStatus) -> Result<Sosreport> {
        let patch = json!({ "status": status });
        let updated = self
            .requests()
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(patch))
            .await?;
        Ok(updated)
    }

    /// Re-reads the request after a write. Each status write should be
    /// followed by a fresh read to limit stale-version conflicts on the next
    /// write.
    pub async fn get_request(&self, name: &str) -> Result<Sosreport> {
        let request = self.requests().get(name).await?;
        Ok(request)
    }

    pub async fn emit_event(&self, request: &Sosreport, reason: &str, message: &str) {
        let object_ref = request.object_ref(&());
        if let Err(e) = self
            .recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.to_string(),
                    note: Some(message.to_string()),
                    action: reason.to_string(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            debug!(error = %e, reason, "failed to emit event");
        }
    }
}
