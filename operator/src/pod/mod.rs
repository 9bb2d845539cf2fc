//! Validation pod construction, naming and status classification.

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, Pod, PodSecurityContext,
    PodSpec, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{ObjectMeta, Resource};
use validator_types::{ValidationJob, reasons};

use crate::util::{self, Error, annotations};

pub const SCRATCH_MOUNT: &str = "/scratch";
pub const SCRATCH_VOLUME_NAME: &str = "notebook-scratch";
const GIT_CLONE_IMAGE: &str = "registry/git-fetch:latest";
pub const EXECUTION_CONTAINER_NAME: &str = "validate";
const PENDING_THRESHOLD_SECS: i64 = 300;
const IMAGE_PULL_BACKOFF_THRESHOLD_SECS: i64 = 300;

const FATAL_WAITING_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImageNeverPull",
    "RegistryUnavailable",
    "CreateSandboxError",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

/// Deterministic name: `<job-name>-validator`.
pub fn pod_name(job_name: &str) -> String {
    format!("{job_name}-validator")
}

/// Scratch path the execution tool writes NDJSON cell results to.
pub fn results_path() -> String {
    format!("{SCRATCH_MOUNT}/results.ndjson")
}

fn instance_name(job: &ValidationJob) -> Result<&str, Error> {
    job.meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("ValidationJob is missing metadata.name".to_string()))
}

fn instance_namespace(job: &ValidationJob) -> Result<&str, Error> {
    job.meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("ValidationJob is missing metadata.namespace".to_string()))
}

/// Paths the execution tool reads from/writes to inside the scratch volume.
pub fn reserved_env(has_golden: bool) -> Vec<EnvVar> {
    let mut vars = vec![
        EnvVar {
            name: "NOTEBOOK_INPUT_PATH".to_string(),
            value: Some(format!("{SCRATCH_MOUNT}/input.ipynb")),
            value_from: None,
        },
        EnvVar {
            name: "NOTEBOOK_OUTPUT_PATH".to_string(),
            value: Some(format!("{SCRATCH_MOUNT}/output.ipynb")),
            value_from: None,
        },
        EnvVar {
            name: "NOTEBOOK_RESULTS_PATH".to_string(),
            value: Some(format!("{SCRATCH_MOUNT}/results.ndjson")),
            value_from: None,
        },
    ];
    if has_golden {
        vars.push(EnvVar {
            name: "NOTEBOOK_GOLDEN_PATH".to_string(),
            value: Some(format!("{SCRATCH_MOUNT}/golden.ipynb")),
            value_from: None,
        });
    }
    vars
}

/// Builds the `Pod` resource for a job, given the image to run (either the
/// literal `podConfig.containerImage` or a completed build's `imageRef`).
pub fn build_pod(job: &ValidationJob, image: &str) -> Result<Pod, Error> {
    let name = instance_name(job)?.to_string();
    let namespace = instance_namespace(job)?.to_string();
    let has_golden = job.spec.golden_notebook.is_some();
    let pod_config = &job.spec.pod_config;

    let mut env = reserved_env(has_golden);
    env.extend(pod_config.env.clone());

    let mut volumes = vec![Volume {
        name: SCRATCH_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    volumes.extend(pod_config.volumes.clone());

    let mut volume_mounts = vec![VolumeMount {
        name: SCRATCH_VOLUME_NAME.to_string(),
        mount_path: SCRATCH_MOUNT.to_string(),
        ..Default::default()
    }];
    volume_mounts.extend(pod_config.volumes.iter().map(|v| VolumeMount {
        name: v.name.clone(),
        mount_path: format!("/mnt/{}", v.name),
        ..Default::default()
    }));

    let security_context = SecurityContext {
        run_as_non_root: Some(true),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut init_containers = Vec::new();
    if pod_config
        .build_config
        .as_ref()
        .is_none_or(|b| !b.enabled)
    {
        init_containers.push(git_fetch_container(job, has_golden));
    }

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            owner_references: Some(vec![job.controller_owner_ref(&()).unwrap()]),
            annotations: Some({
                let mut annotations = std::collections::BTreeMap::new();
                annotations.insert(
                    annotations::SPEC_HASH.to_string(),
                    util::hash_spec(&job.spec),
                );
                annotations.insert(
                    annotations::CREATED_BY.to_string(),
                    "validator-operator".to_string(),
                );
                annotations
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            containers: vec![Container {
                name: EXECUTION_CONTAINER_NAME.to_string(),
                image: Some(image.to_string()),
                env: Some(env),
                env_from: Some(pod_config.env_from.clone()),
                volume_mounts: Some(volume_mounts),
                resources: pod_config.resources.clone(),
                security_context: Some(security_context),
                ..Default::default()
            }],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            tolerations: (!pod_config.tolerations.is_empty()).then(|| pod_config.tolerations.clone()),
            node_selector: (!pod_config.node_selector.is_empty())
                .then(|| pod_config.node_selector.clone()),
            affinity: pod_config.affinity.clone(),
            service_account_name: pod_config.service_account_name.clone(),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    };
    Ok(pod)
}

fn git_fetch_container(job: &ValidationJob, has_golden: bool) -> Container {
    let notebook = &job.spec.notebook;
    let mut env = vec![
        EnvVar {
            name: "GIT_URL".to_string(),
            value: Some(notebook.url.clone()),
            value_from: None,
        },
        EnvVar {
            name: "GIT_REF".to_string(),
            value: Some(notebook.git_ref.clone()),
            value_from: None,
        },
        EnvVar {
            name: "GIT_PATH".to_string(),
            value: Some(notebook.path.clone()),
            value_from: None,
        },
        EnvVar {
            name: "DEST_PATH".to_string(),
            value: Some(format!("{SCRATCH_MOUNT}/input.ipynb")),
            value_from: None,
        },
    ];
    if let Some(secret) = &notebook.credentials_secret_ref {
        env.push(EnvVar {
            name: "GIT_CREDENTIALS".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    key: "credentials".to_string(),
                    name: secret.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        });
    }
    if has_golden && let Some(golden) = &job.spec.golden_notebook {
        env.push(EnvVar {
            name: "GOLDEN_GIT_URL".to_string(),
            value: Some(golden.url.clone()),
            value_from: None,
        });
        env.push(EnvVar {
            name: "GOLDEN_GIT_REF".to_string(),
            value: Some(golden.git_ref.clone()),
            value_from: None,
        });
        env.push(EnvVar {
            name: "GOLDEN_GIT_PATH".to_string(),
            value: Some(golden.path.clone()),
            value_from: None,
        });
        env.push(EnvVar {
            name: "GOLDEN_DEST_PATH".to_string(),
            value: Some(format!("{SCRATCH_MOUNT}/golden.ipynb")),
            value_from: None,
        });
    }
    Container {
        name: "fetch-notebook".to_string(),
        image: Some(GIT_CLONE_IMAGE.to_string()),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: SCRATCH_VOLUME_NAME.to_string(),
            mount_path: SCRATCH_MOUNT.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Outcome of mapping an observed pod's status to a controller action, per
/// the table in §4.3.
#[derive(Debug, Clone, PartialEq)]
pub enum PodOutcome {
    Pending,
    Running,
    Succeeded,
    Failed { reason: &'static str, message: String },
}

/// Classifies a pod's current status. `created_at` anchors the pending/image
/// pull thresholds so a controller restart mid-wait does not reset the clock.
pub fn classify_pod_status(pod: &Pod, created_at: Option<&Time>, now: Timestamp) -> PodOutcome {
    let age_secs = created_at
        .map(|t| now.duration_since(t.0).as_secs())
        .unwrap_or(0);

    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => PodOutcome::Succeeded,
        Some("Failed") => PodOutcome::Failed {
            reason: reasons::POD_FAILED,
            message: pod
                .status
                .as_ref()
                .and_then(|s| s.message.clone())
                .unwrap_or_else(|| "pod terminated in Failed phase".to_string()),
        },
        Some("Running") => PodOutcome::Running,
        Some("Pending") => classify_pending(pod, age_secs, now),
        _ => PodOutcome::Pending,
    }
}

fn classify_pending(pod: &Pod, age_secs: i64, now: Timestamp) -> PodOutcome {
    if let Some(conditions) = pod.status.as_ref().and_then(|s| s.conditions.as_ref())
        && let Some(cond) = conditions.iter().find(|c| c.type_ == "PodScheduled")
        && cond.status == "False"
        && cond.reason.as_deref() == Some("Unschedulable")
    {
        // Anchored off the condition's own transition time, not pod age: a
        // pod can sit Pending for a while before the scheduler even marks it
        // unschedulable, and that wait shouldn't count against the threshold.
        let unschedulable_secs = cond
            .last_transition_time
            .as_ref()
            .map(|t| now.duration_since(t.0).as_secs())
            .unwrap_or(age_secs as u64);
        if unschedulable_secs >= PENDING_THRESHOLD_SECS as u64 {
            return PodOutcome::Failed {
                reason: reasons::UNSCHEDULABLE,
                message: cond
                    .message
                    .clone()
                    .unwrap_or_else(|| "pod is unschedulable".to_string()),
            };
        }
    }

    // ContainerStateWaiting carries no transition timestamp of its own, unlike
    // PodCondition, so this threshold still anchors off total pod age.
    if let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        for cs in statuses {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                let reason = waiting.reason.as_deref().unwrap_or("");
                if FATAL_WAITING_REASONS.contains(&reason) && age_secs >= IMAGE_PULL_BACKOFF_THRESHOLD_SECS
                {
                    return PodOutcome::Failed {
                        reason: reasons::IMAGE_PULL_FAILURE,
                        message: format!(
                            "container '{}' stuck in '{}' for over the pending threshold",
                            cs.name, reason
                        ),
                    };
                }
            }
        }
    }

    PodOutcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn time_secs_ago(secs: i64) -> Time {
        Time(Timestamp::now() - std::time::Duration::from_secs(secs as u64))
    }

    #[test]
    fn succeeded_phase_maps_directly() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Succeeded".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            classify_pod_status(&pod, None, Timestamp::now()),
            PodOutcome::Succeeded
        );
    }

    #[test]
    fn fresh_unschedulable_pod_stays_pending() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("no nodes match".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = time_secs_ago(10);
        assert_eq!(
            classify_pod_status(&pod, Some(&created), Timestamp::now()),
            PodOutcome::Pending
        );
    }

    #[test]
    fn stale_unschedulable_pod_fails() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("no nodes match".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = time_secs_ago(400);
        match classify_pod_status(&pod, Some(&created), Timestamp::now()) {
            PodOutcome::Failed { reason, .. } => assert_eq!(reason, reasons::UNSCHEDULABLE),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn old_pod_with_recently_unschedulable_condition_stays_pending() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("no nodes match".to_string()),
                    last_transition_time: Some(time_secs_ago(10)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        // Pod itself is old, but it only just became unschedulable (e.g. a
        // node drain evicted it after it had been Running for a while).
        let created = time_secs_ago(400);
        assert_eq!(
            classify_pod_status(&pod, Some(&created), Timestamp::now()),
            PodOutcome::Pending
        );
    }

    #[test]
    fn stale_image_pull_backoff_fails() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "validate".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("ImagePullBackOff".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = time_secs_ago(301);
        match classify_pod_status(&pod, Some(&created), Timestamp::now()) {
            PodOutcome::Failed { reason, .. } => assert_eq!(reason, reasons::IMAGE_PULL_FAILURE),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn running_phase_maps_directly() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            classify_pod_status(&pod, None, Timestamp::now()),
            PodOutcome::Running
        );
    }
}
