//! Workload Factory (C3): turns a target node plus the effective configuration
//! into a batch Job and its PersistentVolumeClaim.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Toleration, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::config::ReconcilerConfig;
use crate::crd::{Sosreport, ANNOTATION_NODE_NAME};
use crate::error::{Error, Result};

const CONTROLLER_VERSION: &str = "support.openshift.io/v1alpha1";
const MOUNT_PATH: &str = "/pv";
const TIMESTAMP_LAYOUT_LEN: usize = 14; // YYYYMMDDhhmmss

/// Finds the workload template directory, trying `templates/` then `../templates/`.
pub fn template_dir() -> Result<PathBuf> {
    for candidate in ["templates", "../templates"] {
        let path = Path::new(candidate);
        if path.is_dir() {
            return Ok(path.to_path_buf());
        }
    }
    Err(Error::NoTemplatesDir)
}

/// Loads the base Job template, with all of the per-run fields still blank.
fn job_from_template(template_name: &str) -> Result<Job> {
    let dir = template_dir()?;
    let path = dir.join(template_name);
    let contents = std::fs::read_to_string(&path).map_err(|source| Error::TemplateRead {
        path: path.display().to_string(),
        source,
    })?;
    let job: Job = serde_yaml::from_str(&contents)?;
    Ok(job)
}

/// Bounds a node's short hostname so `<request>-<host>-<timestamp>` and its
/// `-pvc` derivative both stay inside the 63-character DNS label limit.
fn short_node_name(node_name: &str, request_name: &str) -> String {
    let max_len = 63usize
        .saturating_sub(2)
        .saturating_sub(request_name.len())
        .saturating_sub(TIMESTAMP_LAYOUT_LEN)
        .saturating_sub(4);
    let short = node_name.split('.').next().unwrap_or(node_name);
    if short.len() > max_len {
        short[..max_len].to_string()
    } else {
        short.to_string()
    }
}

fn owner_reference(request: &Sosreport) -> OwnerReference {
    OwnerReference {
        api_version: CONTROLLER_VERSION.to_string(),
        kind: "Sosreport".to_string(),
        name: request.name_any(),
        uid: request.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn labels(request_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "sosreport".to_string()),
        ("sosreport-cr".to_string(), request_name.to_string()),
    ])
}

/// Produces the storage claim and Job for one node, ready to be created through
/// the gateway.
pub fn build(
    node_name: &str,
    environment: &BTreeMap<String, String>,
    request: &Sosreport,
    config: &ReconcilerConfig,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(PersistentVolumeClaim, Job)> {
    let request_name = request.name_any();
    let namespace = request.namespace().unwrap_or_default();
    let timestamp = now.format("%Y%m%d%H%M%S").to_string();
    let short_name = short_node_name(node_name, &request_name);
    let job_name = format!("{request_name}-{short_name}-{timestamp}");
    let pvc_name = format!("{job_name}-pvc");
    let owner = owner_reference(request);
    let labels = labels(&request_name);

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: config.pvc_storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(config.pvc_capacity.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut job = job_from_template("sosreport.yaml")?;

    job.metadata = ObjectMeta {
        name: Some(job_name.clone()),
        namespace: Some(namespace),
        labels: Some(BTreeMap::new()),
        annotations: Some(BTreeMap::from([(
            ANNOTATION_NODE_NAME.to_string(),
            node_name.to_string(),
        )])),
        owner_references: Some(vec![owner]),
        ..Default::default()
    };

    let spec = job.spec.get_or_insert_with(Default::default);
    let template = &mut spec.template;
    template.metadata = Some(ObjectMeta {
        labels: Some(labels),
        ..Default::default()
    });

    let pod_spec = template.spec.get_or_insert_with(Default::default);
    pod_spec.tolerations = request_tolerations(request);
    pod_spec.affinity = Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/hostname".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node_name.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: pvc_name.clone(),
        persistent_volume_claim: Some(
            k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name.clone(),
                read_only: None,
            },
        ),
        ..Default::default()
    });

    let container = pod_spec
        .containers
        .first_mut()
        .expect("workload template must declare at least one container");
    container.name = job_name.clone();
    container.image = Some(config.image.clone());
    container.command = Some(
        config
            .command
            .split_whitespace()
            .map(str::to_string)
            .collect(),
    );
    container.env = Some(
        environment
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                value_from: None,
            })
            .collect(),
    );
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: pvc_name,
            mount_path: MOUNT_PATH.to_string(),
            ..Default::default()
        });
    if let Some(policy) = &config.image_pull_policy {
        container.image_pull_policy = Some(policy.clone());
    }

    Ok((pvc, job))
}

fn request_tolerations(request: &Sosreport) -> Option<Vec<Toleration>> {
    if request.spec.tolerations.is_empty() {
        None
    } else {
        Some(request.spec.tolerations.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SosreportSpec;

    fn fixture_request(name: &str) -> Sosreport {
        let mut request = Sosreport::new(name, SosreportSpec::default());
        request.metadata.namespace = Some("default".to_string());
        request.metadata.uid = Some("11111111-1111-1111-1111-111111111111".to_string());
        request
    }

    #[test]
    fn short_name_passes_through_when_it_fits() {
        assert_eq!(short_node_name("worker-0.example.com", "sos"), "worker-0");
    }

    #[test]
    fn short_name_is_truncated_to_respect_the_dns_label_limit() {
        let long_host = "a".repeat(80);
        let short = short_node_name(&long_host, "my-sosreport-request");
        let max_len = 63 - 2 - "my-sosreport-request".len() - TIMESTAMP_LAYOUT_LEN - 4;
        assert_eq!(short.len(), max_len);
    }

    #[test]
    fn build_names_stay_within_the_dns_label_limit() {
        let request = fixture_request("a-fairly-long-sosreport-request-name");
        let config = ReconcilerConfig::default();
        let env = BTreeMap::new();
        let now = chrono::DateTime::parse_from_rfc3339("2026-07-28T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        let (pvc, job) = build(
            "worker-0.cluster.example.com",
            &env,
            &request,
            &config,
            now,
        )
        .expect("template must be found relative to the crate root");

        let job_name = job.metadata.name.unwrap();
        assert!(job_name.len() <= 63, "job name {job_name} exceeds 63 chars");
        let pvc_name = pvc.metadata.name.unwrap();
        assert!(pvc_name.len() <= 63, "pvc name {pvc_name} exceeds 63 chars");
        assert_eq!(pvc_name, format!("{job_name}-pvc"));
    }

    #[test]
    fn build_sets_owner_reference_and_node_affinity() {
        let request = fixture_request("sos-demo");
        let config = ReconcilerConfig::default();
        let env = BTreeMap::from([("USERNAME".to_string(), "alice".to_string())]);
        let now = chrono::Utc::now();

        let (pvc, job) = build("worker-1", &env, &request, &config, now).unwrap();

        let owners = job.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].uid, request.uid().unwrap());
        assert_eq!(pvc.metadata.owner_references.as_ref().unwrap().len(), 1);

        assert_eq!(
            job.metadata.annotations.unwrap().get(ANNOTATION_NODE_NAME).unwrap(),
            "worker-1"
        );

        let affinity = job
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .affinity
            .unwrap()
            .node_affinity
            .unwrap();
        let terms = affinity
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        assert_eq!(
            terms[0].match_expressions.as_ref().unwrap()[0].values,
            Some(vec!["worker-1".to_string()])
        );
    }
}
