//! Write-phase functions: every status mutation a `ValidationJob`
//! reconcile can make, one function per phase transition.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use owo_colors::OwoColorize;
use validator_common::redact::redact;
use validator_types::{
    condition_types, BuildStatus, CellResult, ComparisonResult, ValidationJob, ValidationJobPhase,
};

use crate::build::BuildProgress;
use crate::pod;
use crate::util::patch::patch_status;
use crate::util::{colors::FG2, Error};

/// `message` is redacted before it is recorded: a Condition is long-lived
/// cluster-visible state, not a transient log line.
fn condition(type_: &str, status: bool, reason: &str, message: impl Into<String>, generation: Option<i64>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: redact(&message.into()),
        last_transition_time: Time(Timestamp::now()),
        observed_generation: generation,
    }
}

fn push_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        *existing = new;
    } else {
        conditions.push(new);
    }
}

/// Validates, then transitions Pending -> Building or Pending -> Running.
pub async fn start(client: Client, job: &ValidationJob, build_enabled: bool) -> Result<ValidationJob, Error> {
    let next_phase = if build_enabled {
        ValidationJobPhase::Building
    } else {
        ValidationJobPhase::Running
    };
    println!(
        "🚦 {}{}{} -> {:?}",
        job.namespace().unwrap_or_default().color(FG2),
        "/".color(FG2),
        job.name_any().color(FG2),
        next_phase,
    );
    patch_status(client, job, |status| {
        status.phase = next_phase;
        status.start_time.get_or_insert(Time(Timestamp::now()));
        push_condition(
            &mut status.conditions,
            condition(condition_types::READY, true, "Validating", "spec accepted", job.metadata.generation),
        );
    })
    .await
    .map_err(Error::Kube)
}

/// Records why spec validation rejected the job and moves it straight to
/// `Failed` — invalid specs never reach Building or Running.
pub async fn reject_spec(client: Client, job: &ValidationJob, reason: &str, message: &str) -> Result<ValidationJob, Error> {
    fail(client, job, reason, message).await
}

/// Records a new build's existence and keeps the job in `Building`.
pub async fn build_in_progress(client: Client, job: &ValidationJob, build: &BuildProgress) -> Result<ValidationJob, Error> {
    let phase = build.phase.clone();
    let build_ref = build.build_ref.clone();
    let message = build.message.clone();
    patch_status(client, job, |status| {
        status.build_status = Some(BuildStatus {
            phase: Some(phase),
            build_ref: Some(build_ref),
            image_ref: None,
            start_time: status.build_status.as_ref().and_then(|b| b.start_time.clone()).or(Some(Time(Timestamp::now()))),
            completion_time: None,
            message,
        });
    })
    .await
    .map_err(Error::Kube)
}

/// Records a completed build's image and transitions Building -> BuildComplete.
pub async fn build_succeeded(client: Client, job: &ValidationJob, build: &BuildProgress) -> Result<ValidationJob, Error> {
    let image_ref = build.image_ref.clone();
    let build_ref = build.build_ref.clone();
    patch_status(client, job, |status| {
        status.phase = ValidationJobPhase::BuildComplete;
        status.build_status = Some(BuildStatus {
            phase: Some("Complete".to_string()),
            build_ref: Some(build_ref),
            image_ref,
            start_time: status.build_status.as_ref().and_then(|b| b.start_time.clone()),
            completion_time: Some(Time(Timestamp::now())),
            message: None,
        });
        push_condition(
            &mut status.conditions,
            condition(
                condition_types::BUILD_READY,
                true,
                "BuildComplete",
                "image build succeeded",
                job.metadata.generation,
            ),
        );
    })
    .await
    .map_err(Error::Kube)
}

/// BuildComplete -> Running. Separated from `build_succeeded` so a controller
/// restart between the two can tell "build done, pod not scheduled" apart
/// from "pod already scheduled."
pub async fn schedule_pod(client: Client, job: &ValidationJob, image: &str) -> Result<ValidationJob, Error> {
    let built_pod = pod::build_pod(job, image)?;
    let namespace = job
        .namespace()
        .ok_or_else(|| Error::UserInput("ValidationJob has no namespace".to_string()))?;
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let name = pod::pod_name(&job.name_any());

    match pods.get_opt(&name).await.map_err(Error::Kube)? {
        Some(existing) => {
            let owned = existing
                .owner_references()
                .iter()
                .any(|o| o.uid == job.metadata.uid.clone().unwrap_or_default());
            if !owned {
                return fail(
                    client,
                    job,
                    validator_types::reasons::NAME_CONFLICT,
                    &format!("pod '{name}' already exists and is not owned by this job"),
                )
                .await;
            }
        }
        None => {
            match pods.create(&PostParams::default(), &built_pod).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(Error::Kube(e)),
            }
        }
    }

    patch_status(client, job, |status| {
        status.phase = ValidationJobPhase::Running;
        status.validation_pod_name = Some(name.clone());
    })
    .await
    .map_err(Error::Kube)
}

/// Keeps `Running` up to date while the pod is still executing.
pub async fn pod_still_running(client: Client, job: &ValidationJob) -> Result<ValidationJob, Error> {
    patch_status(client, job, |_status| {}).await.map_err(Error::Kube)
}

/// Running -> Succeeded/Failed once the pod has reached a terminal phase and
/// results (and optionally a comparison) have been collected.
pub async fn finish(
    client: Client,
    job: &ValidationJob,
    cell_results: Vec<CellResult>,
    comparison: Option<ComparisonResult>,
    succeeded: bool,
    message: String,
) -> Result<ValidationJob, Error> {
    let generation = job.metadata.generation;
    patch_status(client, job, |status| {
        status.phase = if succeeded {
            ValidationJobPhase::Succeeded
        } else {
            ValidationJobPhase::Failed
        };
        status.completion_time = Some(Time(Timestamp::now()));
        status.cell_results = cell_results;
        status.message = Some(redact(&message));
        push_condition(
            &mut status.conditions,
            condition(
                condition_types::VALIDATION_COMPLETE,
                succeeded,
                if succeeded { "Succeeded" } else { "Failed" },
                message,
                generation,
            ),
        );
        if let Some(comparison) = comparison {
            let matched = comparison.result == validator_types::ComparisonOutcome::Matched;
            push_condition(
                &mut status.conditions,
                condition(
                    condition_types::GOLDEN_COMPARISON,
                    matched,
                    if matched { "Matched" } else { "Mismatch" },
                    format!(
                        "{}/{} cells matched",
                        comparison.matched_cells, comparison.total_cells
                    ),
                    generation,
                ),
            );
            status.comparison_result = Some(comparison);
        }
    })
    .await
    .map_err(Error::Kube)
}

/// Unconditional transition to `Failed`, used by spec validation, timeouts,
/// pod failure classification, and name conflicts alike.
pub async fn fail(client: Client, job: &ValidationJob, reason: &str, message: &str) -> Result<ValidationJob, Error> {
    let message = redact(message);
    eprintln!(
        "{}",
        format!("❌ {}/{} failed: {reason}: {message}", job.namespace().unwrap_or_default(), job.name_any()).red()
    );
    let generation = job.metadata.generation;
    patch_status(client, job, |status| {
        status.phase = ValidationJobPhase::Failed;
        status.completion_time = Some(Time(Timestamp::now()));
        status.message = Some(message.clone());
        push_condition(
            &mut status.conditions,
            condition(condition_types::READY, false, reason, message.clone(), generation),
        );
    })
    .await
    .map_err(Error::Kube)
}

/// Best-effort deletion of the validation pod, used when a build/name
/// conflict requires re-creating it.
pub async fn delete_pod(client: Client, namespace: &str, name: &str) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    match pods.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}
