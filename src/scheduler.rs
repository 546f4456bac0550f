//! Scheduling Engine (C5): node selection, the bounded-concurrency dispatcher,
//! and the process-local caches that make both restart-resilient.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::api::core::v1::Toleration;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::crd::{Sosreport, ANNOTATION_JOB_RUNNING_LIST, ANNOTATION_JOB_TO_RUN_LIST};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::{attribution, workload};

/// Process-local, per-request-uid scheduling state. Safe to mutate without
/// fine-grained locking because the controller runtime guarantees only one
/// reconcile per object key runs at a time; the coarse [`Mutex`] here only
/// protects against the (currently theoretical) case of two keys being
/// serviced by the same worker thread concurrently, and is never held across
/// an `.await`.
#[derive(Default)]
pub struct Caches {
    run_list: HashSet<String>,
    to_run: HashMap<String, BTreeSet<String>>,
    running: HashMap<String, BTreeSet<String>>,
}

/// Shared handle installed in the reconciler's context.
pub type SharedCaches = Mutex<Caches>;

impl Caches {
    pub fn new() -> SharedCaches {
        Mutex::new(Caches::default())
    }
}

/// Emitted by a tick for the caller to persist and publish. Kept free of any
/// `kube` I/O so the scheduling decisions stay easy to unit test.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    pub to_run: BTreeSet<String>,
    pub running: BTreeSet<String>,
    pub annotations_changed: bool,
    pub events: Vec<(&'static str, String)>,
    pub done: bool,
}

fn set_to_annotation(set: &BTreeSet<String>) -> String {
    let obj: BTreeMap<String, serde_json::Value> =
        set.iter().map(|n| (n.clone(), serde_json::json!({}))).collect();
    serde_json::to_string(&obj).unwrap_or_else(|_| "{}".to_string())
}

fn set_from_annotation(raw: &str) -> BTreeSet<String> {
    serde_json::from_str::<BTreeMap<String, serde_json::Value>>(raw)
        .map(|m| m.into_keys().collect())
        .unwrap_or_default()
}

fn toleration_tolerates_taint(tol: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = tol.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    if let Some(key) = tol.key.as_deref() {
        if !key.is_empty() && key != taint.key {
            return false;
        }
    }
    match tol.operator.as_deref() {
        None | Some("") | Some("Equal") => {
            tol.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or("")
        }
        Some("Exists") => true,
        _ => false,
    }
}

/// A node is tolerated if every one of its taints is matched by at least one
/// toleration on the request. No taints means the node is always tolerated.
pub fn tolerated(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .all(|taint| tolerations.iter().any(|tol| toleration_tolerates_taint(tol, taint)))
}

/// Phase A: runs once per request (guarded by the run list). Selects eligible
/// nodes and seeds `to_run`. Returns `None` without marking `in_progress` if
/// the selector matched nothing, so the next reconcile retries.
pub async fn plan(
    gateway: &Gateway,
    caches: &SharedCaches,
    request: &Sosreport,
) -> Result<Option<BTreeSet<String>>> {
    let uid = request.uid().unwrap_or_default();
    let nodes = gateway.list_nodes(&request.spec.node_selector).await?;
    if nodes.is_empty() {
        info!(request = %request.name_any(), "no nodes matched selector, staying idle");
        return Ok(None);
    }

    let mut selected = BTreeSet::new();
    for node in &nodes {
        let taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        if tolerated(&request.spec.tolerations, &taints) {
            if let Some(name) = node.metadata.labels.as_ref().and_then(|l| l.get("kubernetes.io/hostname")) {
                selected.insert(name.clone());
            } else {
                selected.insert(node.name_any());
            }
        } else {
            debug!(node = %node.name_any(), "node not tolerated, skipping");
        }
    }

    {
        let mut caches = caches.lock().expect("caches mutex poisoned");
        caches.run_list.insert(uid.clone());
        caches.to_run.insert(uid, selected.clone());
    }

    let annotations = BTreeMap::from([(
        ANNOTATION_JOB_TO_RUN_LIST.to_string(),
        set_to_annotation(&selected),
    )]);
    gateway.patch_annotations(&request.name_any(), &annotations).await?;

    Ok(Some(selected))
}

/// Phase B: dequeues terminal workloads, dispatches new ones under the
/// concurrency budget, and reports whether the request is now fully done.
pub async fn progress(
    gateway: &Gateway,
    caches: &SharedCaches,
    request: &Sosreport,
    config: &ReconcilerConfig,
    environment: &BTreeMap<String, String>,
) -> Result<TickOutcome> {
    let uid = request.uid().unwrap_or_default();
    let name = request.name_any();

    rehydrate(caches, request);

    let owned = attribution::owned_workloads(&gateway.jobs(), request).await?;

    let mut events = Vec::new();
    {
        let mut caches = caches.lock().expect("caches mutex poisoned");
        let running = caches.running.entry(uid.clone()).or_default();
        for job in &owned {
            if !attribution::is_terminal(job) {
                continue;
            }
            if let Some(node) = attribution::node_name(job) {
                if running.remove(node) {
                    events.push(("Sosreport finished", format!("Sosreport {node} finished")));
                }
            }
        }
    }

    let budget = {
        let caches = caches.lock().expect("caches mutex poisoned");
        let running_count = caches.running.get(&uid).map(|s| s.len()).unwrap_or(0);
        config.concurrency.saturating_sub(running_count as u32) as usize
    };

    let candidates: Vec<String> = {
        let caches = caches.lock().expect("caches mutex poisoned");
        caches
            .to_run
            .get(&uid)
            .into_iter()
            .flatten()
            .take(budget)
            .cloned()
            .collect()
    };

    let mut dispatched = Vec::new();
    for node_name in candidates {
        let (pvc, job) = match workload::build(
            &node_name,
            environment,
            request,
            config,
            chrono::Utc::now(),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(node = %node_name, error = %e, "could not build workload, will retry next reconcile");
                continue;
            }
        };
        if let Err(e) = gateway.create_pvc(&pvc).await {
            warn!(node = %node_name, error = %e, "failed to create storage claim, will retry next reconcile");
            continue;
        }
        if let Err(e) = gateway.create_job(&job).await {
            warn!(node = %node_name, error = %e, "failed to create workload, will retry next reconcile");
            continue;
        }
        events.push(("Sosreport job started", format!("Sosreport started on {node_name}")));
        dispatched.push(node_name);
    }

    let (to_run_snapshot, running_snapshot) = {
        let mut caches = caches.lock().expect("caches mutex poisoned");
        let to_run = caches.to_run.entry(uid.clone()).or_default();
        for node in &dispatched {
            to_run.remove(node);
        }
        let to_run_snapshot = to_run.clone();
        let running = caches.running.entry(uid.clone()).or_default();
        for node in &dispatched {
            running.insert(node.clone());
        }
        (to_run_snapshot, running.clone())
    };

    let done = to_run_snapshot.is_empty() && running_snapshot.is_empty();
    if done {
        events.push(("Sosreports finished", "All Sosreports finished".to_string()));
        debug!(request = %name, "sosreport run complete");
    }

    Ok(TickOutcome {
        to_run: to_run_snapshot,
        running: running_snapshot,
        annotations_changed: true,
        events,
        done,
    })
}

/// Rebuilds `to_run`/`running` from the request's annotations whenever the
/// in-memory caches for this uid are empty, covering operator restarts. Never
/// rebuilds from the live workload list alone, because a planned-but-not-yet
/// -dispatched node has no workload to be found by.
fn rehydrate(caches: &SharedCaches, request: &Sosreport) {
    let uid = request.uid().unwrap_or_default();
    let mut caches = caches.lock().expect("caches mutex poisoned");

    if !caches.to_run.contains_key(&uid) {
        if let Some(raw) = request.annotations().get(ANNOTATION_JOB_TO_RUN_LIST) {
            caches.to_run.insert(uid.clone(), set_from_annotation(raw));
        }
    }
    if !caches.running.contains_key(&uid) {
        if let Some(raw) = request.annotations().get(ANNOTATION_JOB_RUNNING_LIST) {
            caches.running.insert(uid.clone(), set_from_annotation(raw));
        }
    }
}

pub fn annotations_for(outcome: &TickOutcome) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            ANNOTATION_JOB_TO_RUN_LIST.to_string(),
            set_to_annotation(&outcome.to_run),
        ),
        (
            ANNOTATION_JOB_RUNNING_LIST.to_string(),
            set_to_annotation(&outcome.running),
        ),
    ])
}

pub fn in_run_list(caches: &SharedCaches, request: &Sosreport) -> bool {
    let uid = request.uid().unwrap_or_default();
    caches.lock().expect("caches mutex poisoned").run_list.contains(&uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: Option<&str>, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.map(str::to_string),
            effect: effect.to_string(),
            time_added: None,
        }
    }

    fn toleration(key: Option<&str>, operator: Option<&str>, value: Option<&str>, effect: Option<&str>) -> Toleration {
        Toleration {
            key: key.map(str::to_string),
            operator: operator.map(str::to_string),
            value: value.map(str::to_string),
            effect: effect.map(str::to_string),
            toleration_seconds: None,
        }
    }

    #[test]
    fn no_taints_is_always_tolerated() {
        assert!(tolerated(&[], &[]));
    }

    #[test]
    fn untolerated_taint_rejects_the_node() {
        let taints = vec![taint("do-not-schedule", None, "NoSchedule")];
        assert!(!tolerated(&[], &taints));
    }

    #[test]
    fn matching_toleration_admits_the_node() {
        let taints = vec![taint("node-role.kubernetes.io/master", None, "NoSchedule")];
        let tolerations = vec![toleration(
            Some("node-role.kubernetes.io/master"),
            Some("Exists"),
            None,
            Some("NoSchedule"),
        )];
        assert!(tolerated(&tolerations, &taints));
    }

    #[test]
    fn toleration_for_a_different_key_does_not_match() {
        let taints = vec![taint("do-not-schedule", None, "NoSchedule")];
        let tolerations = vec![toleration(Some("other-key"), Some("Exists"), None, None)];
        assert!(!tolerated(&tolerations, &taints));
    }

    #[test]
    fn equal_operator_requires_matching_value() {
        let taints = vec![taint("dedicated", Some("gpu"), "NoSchedule")];
        let matching = vec![toleration(Some("dedicated"), None, Some("gpu"), None)];
        let mismatching = vec![toleration(Some("dedicated"), None, Some("cpu"), None)];
        assert!(tolerated(&matching, &taints));
        assert!(!tolerated(&mismatching, &taints));
    }

    #[test]
    fn annotation_round_trips_a_set() {
        let set: BTreeSet<String> = ["worker-0", "worker-1"].into_iter().map(String::from).collect();
        let raw = set_to_annotation(&set);
        assert_eq!(set_from_annotation(&raw), set);
    }

    #[test]
    fn empty_set_round_trips() {
        let set: BTreeSet<String> = BTreeSet::new();
        assert_eq!(set_from_annotation(&set_to_annotation(&set)), set);
    }

    #[test]
    fn malformed_annotation_yields_empty_set() {
        assert_eq!(set_from_annotation("not json"), BTreeSet::new());
    }
}
