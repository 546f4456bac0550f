//! Attribution & Completion (C4): maps workloads back to the Sosreport that
//! owns them, and decides whether a workload has reached a terminal state.

use k8s_openapi::api::batch::v1::{Job, JobCondition};
use kube::api::{Api, ListParams};
use kube::ResourceExt;

use crate::crd::{Sosreport, ANNOTATION_NODE_NAME};
use crate::error::Result;

/// Lists every Job in the Sosreport's namespace whose controller owner
/// reference points at this Sosreport's uid. Jobs with no controller owner
/// (or a different one) are skipped silently.
pub async fn owned_workloads(jobs: &Api<Job>, request: &Sosreport) -> Result<Vec<Job>> {
    let uid = request.uid().unwrap_or_default();
    let all = jobs.list(&ListParams::default()).await?;
    Ok(all
        .items
        .into_iter()
        .filter(|job| {
            job.owner_references()
                .iter()
                .any(|owner| owner.controller == Some(true) && owner.kind == "Sosreport" && owner.uid == uid)
        })
        .collect())
}

/// A job's target node, read from its `nodeName` annotation.
pub fn node_name(job: &Job) -> Option<&str> {
    job.annotations().get(ANNOTATION_NODE_NAME).map(String::as_str)
}

/// A workload is terminal once any status condition reports `Complete` or
/// `Failed` with status `True`. The two are not distinguished further.
pub fn is_terminal(job: &Job) -> bool {
    let Some(status) = &job.status else {
        return false;
    };
    let Some(conditions) = &status.conditions else {
        return false;
    };
    conditions.iter().any(is_terminal_condition)
}

fn is_terminal_condition(condition: &JobCondition) -> bool {
    matches!(condition.type_.as_str(), "Complete" | "Failed") && condition.status == "True"
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn condition(type_: &str, status: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_probe_time: None,
            last_transition_time: None::<Time>,
            message: None,
            reason: None,
        }
    }

    #[test]
    fn job_with_no_status_is_not_terminal() {
        let job = Job::default();
        assert!(!is_terminal(&job));
    }

    #[test]
    fn job_still_running_is_not_terminal() {
        let mut job = Job::default();
        job.status = Some(JobStatus {
            conditions: Some(vec![condition("Suspended", "True")]),
            ..Default::default()
        });
        assert!(!is_terminal(&job));
    }

    #[test]
    fn complete_condition_is_terminal() {
        let mut job = Job::default();
        job.status = Some(JobStatus {
            conditions: Some(vec![condition("Complete", "True")]),
            ..Default::default()
        });
        assert!(is_terminal(&job));
    }

    #[test]
    fn failed_condition_is_also_terminal() {
        let mut job = Job::default();
        job.status = Some(JobStatus {
            conditions: Some(vec![condition("Failed", "True")]),
            ..Default::default()
        });
        assert!(is_terminal(&job));
    }

    #[test]
    fn complete_condition_with_false_status_is_not_terminal() {
        let mut job = Job::default();
        job.status = Some(JobStatus {
            conditions: Some(vec![condition("Complete", "False")]),
            ..Default::default()
        });
        assert!(!is_terminal(&job));
    }
}
