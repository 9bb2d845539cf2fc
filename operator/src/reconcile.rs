use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::jiff::Timestamp;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use rand::Rng;
use std::{collections::HashMap, sync::Arc, time::Instant};
use validator_common::redact::redact;
use validator_types::{reasons, BuildStrategyName, ValidationJob, ValidationJobPhase};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::actions;
use crate::build::BuildStrategyRegistry;
use crate::compare;
use crate::pod;
use crate::results;
use crate::validation;
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Knobs that come from CLI flags / env vars at process start.
pub struct ReconcilerConfig {
    pub namespace: String,
    pub enabled_build_strategies: Vec<BuildStrategyName>,
    pub worker_count: usize,
    /// Gates leader-election: single-replica deployments can skip lease
    /// contention and run the controller directly.
    pub leader_elect: bool,
    #[cfg(feature = "metrics")]
    pub metrics: Arc<ControllerMetrics>,
}

/// Entrypoint for the `ValidationJob` controller.
pub async fn run(client: Client, config: ReconcilerConfig) -> Result<(), Error> {
    println!("{}", "⚙️ Starting ValidationJob controller...".green());

    let registry = Arc::new(BuildStrategyRegistry::discover(&client, &config.enabled_build_strategies).await);
    #[cfg(feature = "metrics")]
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), registry, config.metrics.clone()));
    #[cfg(not(feature = "metrics"))]
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), registry));
    let worker_count = config.worker_count.max(1);
    let lease_namespace = config.namespace.clone();

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        validator_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    validator_common::signal_ready();
    println!("{}", "🌱 ValidationJob controller ready.".green());

    if !config.leader_elect {
        println!(
            "{}",
            "🔓 leader election disabled; running controller in single-replica mode.".green()
        );
        let crd_api: Api<ValidationJob> = Api::namespaced(client.clone(), &lease_namespace);
        let pods_api = Api::<Pod>::namespaced(client.clone(), &lease_namespace);
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = Controller::new(crd_api, Default::default())
                .owns(pods_api, Default::default())
                .run(reconcile, on_error, context)
                .for_each_concurrent(worker_count, |_res| async move {}) => {}
        }
        return Ok(());
    }

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("validator-operator-{}", uuid::Uuid::new_v4()));
    let lease_name = "validator-operator-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<ValidationJob> = Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 ValidationJob controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .owns(
                            Api::<Pod>::namespaced(client_for_controller, &controller_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each_concurrent(worker_count, |_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    registry: Arc<BuildStrategyRegistry>,

    #[cfg(feature = "metrics")]
    metrics: Arc<ControllerMetrics>,

    last_action: Mutex<HashMap<(String, String), (String, Instant)>>,
    /// Consecutive-error count per (namespace, name), used to size the
    /// exponential backoff in `on_error`. Reset on a clean reconcile.
    /// `on_error` is a sync callback invoked directly by `kube-runtime`, so
    /// this is a std `Mutex`, not the async `last_action` one above.
    error_backoff: std::sync::Mutex<HashMap<(String, String), u32>>,
}

impl ContextData {
    #[cfg(feature = "metrics")]
    fn new(client: Client, registry: Arc<BuildStrategyRegistry>, metrics: Arc<ControllerMetrics>) -> Self {
        ContextData {
            client,
            registry,
            metrics,
            last_action: Mutex::new(HashMap::new()),
            error_backoff: std::sync::Mutex::new(HashMap::new()),
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn new(client: Client, registry: Arc<BuildStrategyRegistry>) -> Self {
        ContextData {
            client,
            registry,
            last_action: Mutex::new(HashMap::new()),
            error_backoff: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

/// Action to be taken upon a `ValidationJob` resource during reconciliation.
#[derive(Debug, Clone)]
enum ValidationJobAction {
    Validate,
    Reject { reason: &'static str, message: String },
    CreateBuild,
    BuildInProgress { phase: String, build_ref: String, message: Option<String> },
    BuildSucceeded { image_ref: Option<String>, build_ref: String },
    BuildFailed { message: String },
    SchedulePod { image: String },
    PodStillRunning,
    PodSucceeded,
    PodFailed { reason: &'static str, message: String },
    Timeout,
    NoOp,
    Requeue(Duration),
}

impl ValidationJobAction {
    fn to_str(&self) -> &str {
        match self {
            ValidationJobAction::Validate => "Validate",
            ValidationJobAction::Reject { .. } => "Reject",
            ValidationJobAction::CreateBuild => "CreateBuild",
            ValidationJobAction::BuildInProgress { .. } => "BuildInProgress",
            ValidationJobAction::BuildSucceeded { .. } => "BuildSucceeded",
            ValidationJobAction::BuildFailed { .. } => "BuildFailed",
            ValidationJobAction::SchedulePod { .. } => "SchedulePod",
            ValidationJobAction::PodStillRunning => "PodStillRunning",
            ValidationJobAction::PodSucceeded => "PodSucceeded",
            ValidationJobAction::PodFailed { .. } => "PodFailed",
            ValidationJobAction::Timeout => "Timeout",
            ValidationJobAction::NoOp => "NoOp",
            ValidationJobAction::Requeue(_) => "Requeue",
        }
    }
}

/// Decrements the work-queue-depth gauge when a reconcile finishes, however
/// it finishes — early return via `?` included.
#[cfg(feature = "metrics")]
struct InFlightGuard {
    metrics: Arc<ControllerMetrics>,
    namespace: String,
}

#[cfg(feature = "metrics")]
impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.work_queue_depth.with_label_values(&[&self.namespace]).dec();
    }
}

async fn reconcile(instance: Arc<ValidationJob>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client: Client = context.client.clone();
    let namespace: String = instance.namespace().ok_or_else(|| {
        Error::UserInput("Expected ValidationJob to be namespaced".to_owned())
    })?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.reconcile_counter.with_label_values(&[&name, &namespace]).inc();
    #[cfg(feature = "metrics")]
    context.metrics.work_queue_depth.with_label_values(&[&namespace]).inc();
    #[cfg(feature = "metrics")]
    let _in_flight = InFlightGuard { metrics: context.metrics.clone(), namespace: namespace.clone() };
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(&client, &context.registry, &instance).await?;

    {
        let mut la = context.last_action.lock().await;
        let key = (namespace.clone(), name.clone());
        let changed = la
            .get(&key)
            .map(|(last, at)| last != action.to_str() || at.elapsed() > Duration::from_secs(300))
            .unwrap_or(true);
        if changed && !matches!(action, ValidationJobAction::NoOp) {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                action.to_str().color(FG2),
            );
        }
        la.insert(key, (action.to_str().to_string(), Instant::now()));
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());
    #[cfg(feature = "metrics")]
    context.metrics.action_counter.with_label_values(&[&name, &namespace, action.to_str()]).inc();
    #[cfg(feature = "metrics")]
    let timer = (!matches!(action, ValidationJobAction::NoOp)).then(|| {
        context
            .metrics
            .write_histogram
            .with_label_values(&[&name, &namespace, action.to_str()])
            .start_timer()
    });

    let result = execute(&context, &instance, action).await;

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    if result.is_ok() {
        context.error_backoff.lock().unwrap().remove(&(namespace, name));
    }

    result
}

#[cfg(feature = "metrics")]
fn elapsed_secs_since(t: Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>) -> f64 {
    t.map(|t| Timestamp::now().duration_since(t.0).as_secs_f64()).unwrap_or(0.0)
}

async fn execute(
    context: &ContextData,
    instance: &ValidationJob,
    action: ValidationJobAction,
) -> Result<Action, Error> {
    let client = context.client.clone();
    let registry = &context.registry;
    #[cfg(feature = "metrics")]
    let namespace = instance.namespace().unwrap_or_default();

    match action {
        ValidationJobAction::NoOp => Ok(Action::requeue(PROBE_INTERVAL)),
        ValidationJobAction::Requeue(d) => Ok(Action::requeue(d)),
        ValidationJobAction::Timeout => {
            actions::fail(client, instance, reasons::TIMEOUT, "job exceeded spec.timeoutSeconds").await?;
            #[cfg(feature = "metrics")]
            context.metrics.validation_jobs.with_label_values(&["Failed"]).inc();
            Ok(Action::await_change())
        }
        ValidationJobAction::Validate => {
            let build_enabled = instance
                .spec
                .pod_config
                .build_config
                .as_ref()
                .is_some_and(|b| b.enabled);
            actions::start(client, instance, build_enabled).await?;
            Ok(Action::await_change())
        }
        ValidationJobAction::Reject { reason, message } => {
            actions::reject_spec(client, instance, reason, &message).await?;
            #[cfg(feature = "metrics")]
            context.metrics.validation_jobs.with_label_values(&["Failed"]).inc();
            Ok(Action::await_change())
        }
        ValidationJobAction::CreateBuild => {
            let strategy = required_strategy(instance)?;
            let builder = registry
                .get(strategy)
                .ok_or_else(|| Error::Build(format!("no builder registered for strategy '{strategy}'")))?;
            match builder.create_build(&client, instance).await {
                Ok(()) => Ok(Action::requeue(PROBE_INTERVAL)),
                Err(Error::BuildUnverified(detail)) => {
                    actions::fail(client, instance, reasons::BUILD_CREATION_UNVERIFIED, &detail).await?;
                    #[cfg(feature = "metrics")]
                    context.metrics.validation_jobs.with_label_values(&["Failed"]).inc();
                    Ok(Action::await_change())
                }
                Err(e) => Err(e),
            }
        }
        ValidationJobAction::BuildInProgress { phase, build_ref, message } => {
            actions::build_in_progress(
                client,
                instance,
                &crate::build::BuildProgress {
                    phase,
                    build_ref,
                    image_ref: None,
                    message,
                    failed: false,
                },
            )
            .await?;
            Ok(Action::requeue(PROBE_INTERVAL))
        }
        ValidationJobAction::BuildSucceeded { image_ref, build_ref } => {
            #[cfg(feature = "metrics")]
            {
                let start_time = instance.status.as_ref().and_then(|s| s.build_status.as_ref()).and_then(|b| b.start_time.as_ref());
                context
                    .metrics
                    .build_duration
                    .with_label_values(&[&required_strategy(instance).map(|s| s.to_string()).unwrap_or_default(), "succeeded"])
                    .observe(elapsed_secs_since(start_time));
            }
            actions::build_succeeded(
                client,
                instance,
                &crate::build::BuildProgress {
                    phase: "Complete".to_string(),
                    build_ref,
                    image_ref,
                    message: None,
                    failed: false,
                },
            )
            .await?;
            Ok(Action::await_change())
        }
        ValidationJobAction::BuildFailed { message } => {
            #[cfg(feature = "metrics")]
            {
                let start_time = instance.status.as_ref().and_then(|s| s.build_status.as_ref()).and_then(|b| b.start_time.as_ref());
                context
                    .metrics
                    .build_duration
                    .with_label_values(&[&required_strategy(instance).map(|s| s.to_string()).unwrap_or_default(), "failed"])
                    .observe(elapsed_secs_since(start_time));
                context.metrics.validation_jobs.with_label_values(&["Failed"]).inc();
            }
            actions::fail(client, instance, reasons::BUILD_FAILED, &message).await?;
            Ok(Action::await_change())
        }
        ValidationJobAction::SchedulePod { image } => {
            actions::schedule_pod(client, instance, &image).await?;
            #[cfg(feature = "metrics")]
            context.metrics.active_validation_pods.with_label_values(&[&namespace]).inc();
            Ok(Action::await_change())
        }
        ValidationJobAction::PodStillRunning => {
            actions::pod_still_running(client, instance).await?;
            Ok(Action::requeue(PROBE_INTERVAL))
        }
        ValidationJobAction::PodFailed { reason, message } => {
            // Comparison is skipped (not just left absent) on pod failure: a
            // partial, never-finished notebook has nothing meaningful to diff.
            let (cell_results, message) = collect_on_termination(&client, instance, &format!("{reason}: {message}")).await?;
            #[cfg(feature = "metrics")]
            {
                context.metrics.active_validation_pods.with_label_values(&[&namespace]).dec();
                context.metrics.validation_jobs.with_label_values(&["Failed"]).inc();
                let start_time = instance.status.as_ref().and_then(|s| s.start_time.as_ref());
                context
                    .metrics
                    .validation_duration
                    .with_label_values(&["failed"])
                    .observe(elapsed_secs_since(start_time));
            }
            actions::finish(client, instance, cell_results, None, false, message).await?;
            Ok(Action::await_change())
        }
        ValidationJobAction::PodSucceeded => {
            let (cell_results, message) = collect_on_termination(&client, instance, "notebook executed successfully").await?;
            let comparison = match maybe_compare(&client, instance, &cell_results).await {
                Ok(c) => c,
                Err(_) => {
                    actions::fail(client, instance, reasons::COMPARISON_IO_ERROR, "failed to read golden notebook for comparison").await?;
                    #[cfg(feature = "metrics")]
                    {
                        context.metrics.active_validation_pods.with_label_values(&[&namespace]).dec();
                        context.metrics.validation_jobs.with_label_values(&["Failed"]).inc();
                    }
                    return Ok(Action::await_change());
                }
            };
            let succeeded = comparison
                .as_ref()
                .map(|c| c.result == validator_types::ComparisonOutcome::Matched)
                .unwrap_or(true);
            let message = if succeeded {
                message
            } else {
                format!(
                    "golden comparison found {} mismatched cell(s)",
                    comparison.as_ref().map(|c| c.mismatched_cells).unwrap_or(0)
                )
            };
            #[cfg(feature = "metrics")]
            {
                context.metrics.active_validation_pods.with_label_values(&[&namespace]).dec();
                context
                    .metrics
                    .validation_jobs
                    .with_label_values(&[if succeeded { "Succeeded" } else { "Failed" }])
                    .inc();
                let start_time = instance.status.as_ref().and_then(|s| s.start_time.as_ref());
                context
                    .metrics
                    .validation_duration
                    .with_label_values(&[if succeeded { "succeeded" } else { "failed" }])
                    .observe(elapsed_secs_since(start_time));
            }
            actions::finish(client, instance, cell_results, comparison, succeeded, message).await?;
            Ok(Action::await_change())
        }
    }
}

fn required_strategy(instance: &ValidationJob) -> Result<BuildStrategyName, Error> {
    instance
        .spec
        .pod_config
        .build_config
        .as_ref()
        .and_then(|b| b.strategy)
        .ok_or_else(|| Error::UserInput("buildConfig.enabled is set but no strategy was named".to_string()))
}

async fn collect_on_termination(
    client: &Client,
    instance: &ValidationJob,
    default_message: &str,
) -> Result<(Vec<validator_types::CellResult>, String), Error> {
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("ValidationJob has no namespace".to_string()))?;
    let pod_name = pod::pod_name(&instance.name_any());
    match results::collect_results(client, &namespace, &pod_name, pod::EXECUTION_CONTAINER_NAME, &pod::results_path()).await {
        Ok(Some(cells)) => Ok((cells, default_message.to_string())),
        Ok(None) => {
            let tail = fetch_stderr_tail(client, &namespace, &pod_name).await;
            Ok((results::synthesize_failure(&tail), "execution tool produced no results file".to_string()))
        }
        Err(e) => {
            let detail = redact(&e.to_string());
            eprintln!("{}", format!("result collection error: {detail}").yellow());
            Ok((
                results::synthesize_failure(&detail),
                "failed to collect cell results from pod".to_string(),
            ))
        }
    }
}

async fn fetch_stderr_tail(client: &Client, namespace: &str, pod_name: &str) -> String {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.get(pod_name).await {
        Ok(p) => p
            .status
            .and_then(|s| s.container_statuses)
            .and_then(|cs| cs.into_iter().find(|c| c.name == pod::EXECUTION_CONTAINER_NAME))
            .and_then(|c| c.state)
            .and_then(|s| s.terminated)
            .and_then(|t| t.message)
            .unwrap_or_else(|| "(no termination message available)".to_string()),
        Err(_) => "(pod unavailable)".to_string(),
    }
}

/// Reads the golden notebook's own recorded outputs out of the pod's
/// scratch volume and diffs them against `executed`. `None` when the job
/// has no comparison configured; an `Err` only on I/O failure reading the
/// golden notebook (per the comparator's result contract, content never
/// produces an error — only a diff).
async fn maybe_compare(
    client: &Client,
    instance: &ValidationJob,
    executed: &[validator_types::CellResult],
) -> Result<Option<validator_types::ComparisonResult>, Error> {
    let Some(comparison_config) = instance.spec.comparison.as_ref() else {
        return Ok(None);
    };
    if instance.spec.golden_notebook.is_none() {
        return Ok(None);
    }
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("ValidationJob has no namespace".to_string()))?;
    let pod_name = pod::pod_name(&instance.name_any());
    let golden_path = format!("{}/golden.ipynb", pod::SCRATCH_MOUNT);

    let golden = results::collect_golden_outputs(client, &namespace, &pod_name, pod::EXECUTION_CONTAINER_NAME, &golden_path)
        .await?
        .ok_or_else(|| Error::ResultCollection("golden notebook was not found in the pod's scratch volume".to_string()))?;

    Ok(Some(compare::compare_cells(comparison_config, executed, &golden)))
}

async fn determine_action(
    client: &Client,
    registry: &BuildStrategyRegistry,
    instance: &ValidationJob,
) -> Result<ValidationJobAction, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(ValidationJobAction::Requeue(Duration::from_secs(2)));
    }

    let phase = instance.status.as_ref().map(|s| s.phase).unwrap_or_default();

    if !phase.is_terminal() && is_timed_out(instance) {
        return Ok(ValidationJobAction::Timeout);
    }

    match phase {
        ValidationJobPhase::Pending => determine_pending_action(instance),
        ValidationJobPhase::Building => determine_building_action(client, registry, instance).await,
        ValidationJobPhase::BuildComplete => determine_build_complete_action(instance),
        ValidationJobPhase::Running => determine_running_action(client, instance).await,
        ValidationJobPhase::Succeeded | ValidationJobPhase::Failed => Ok(ValidationJobAction::NoOp),
    }
}

fn is_timed_out(instance: &ValidationJob) -> bool {
    let Some(start) = instance.status.as_ref().and_then(|s| s.start_time.as_ref()) else {
        return false;
    };
    let elapsed = Timestamp::now().duration_since(start.0).as_secs();
    elapsed > instance.spec.timeout_seconds
}

fn determine_pending_action(instance: &ValidationJob) -> Result<ValidationJobAction, Error> {
    match validation::validate_spec(&instance.spec) {
        Ok(()) => Ok(ValidationJobAction::Validate),
        Err(e) => Ok(ValidationJobAction::Reject {
            reason: e.reason,
            message: e.message,
        }),
    }
}

async fn determine_building_action(
    client: &Client,
    registry: &BuildStrategyRegistry,
    instance: &ValidationJob,
) -> Result<ValidationJobAction, Error> {
    let strategy = match required_strategy(instance) {
        Ok(s) => s,
        Err(e) => return Ok(ValidationJobAction::BuildFailed { message: e.to_string() }),
    };
    let Some(builder) = registry.get(strategy) else {
        return Ok(ValidationJobAction::BuildFailed {
            message: format!("build strategy '{strategy}' is not available on this cluster"),
        });
    };

    match builder.get_latest_build(client, instance).await? {
        None => Ok(ValidationJobAction::CreateBuild),
        Some(progress) if progress.failed => Ok(ValidationJobAction::BuildFailed {
            message: progress.message.unwrap_or_else(|| "build failed".to_string()),
        }),
        Some(progress) if progress.phase == "Complete" => Ok(ValidationJobAction::BuildSucceeded {
            image_ref: progress.image_ref,
            build_ref: progress.build_ref,
        }),
        Some(progress) => Ok(ValidationJobAction::BuildInProgress {
            phase: progress.phase,
            build_ref: progress.build_ref,
            message: progress.message,
        }),
    }
}

fn determine_build_complete_action(instance: &ValidationJob) -> Result<ValidationJobAction, Error> {
    let image = instance
        .status
        .as_ref()
        .and_then(|s| s.build_status.as_ref())
        .and_then(|b| b.image_ref.clone())
        .or_else(|| instance.spec.pod_config.container_image.clone());
    match image {
        Some(image) => Ok(ValidationJobAction::SchedulePod { image }),
        None => Ok(ValidationJobAction::BuildFailed {
            message: "build reported complete but produced no imageRef".to_string(),
        }),
    }
}

async fn determine_running_action(client: &Client, instance: &ValidationJob) -> Result<ValidationJobAction, Error> {
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("ValidationJob has no namespace".to_string()))?;
    let pod_name = instance
        .status
        .as_ref()
        .and_then(|s| s.validation_pod_name.clone())
        .unwrap_or_else(|| pod::pod_name(&instance.name_any()));

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let current = match pods.get_opt(&pod_name).await.map_err(Error::Kube)? {
        Some(p) => p,
        None => {
            return Ok(ValidationJobAction::PodFailed {
                reason: reasons::POD_FAILED,
                message: format!("pod '{pod_name}' is missing while job is Running"),
            });
        }
    };

    let created_at = current.metadata.creation_timestamp.clone();
    let outcome = pod::classify_pod_status(&current, created_at.as_ref(), Timestamp::now());
    Ok(match outcome {
        pod::PodOutcome::Pending => ValidationJobAction::Requeue(Duration::from_secs(5)),
        pod::PodOutcome::Running => ValidationJobAction::PodStillRunning,
        pod::PodOutcome::Succeeded => ValidationJobAction::PodSucceeded,
        pod::PodOutcome::Failed { reason, message } => ValidationJobAction::PodFailed { reason, message },
    })
}

/// On a resource-version conflict, requeues immediately: the conflict means
/// someone else already changed the object, so the next read will see fresh
/// state with no point waiting. Every other error backs off exponentially
/// (base 1s, capped at 5min) with full jitter, tracked per (namespace, name)
/// and reset by `reconcile` on the next clean pass.
fn on_error(instance: Arc<ValidationJob>, error: &Error, context: Arc<ContextData>) -> Action {
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();

    if let Error::Kube(kube::Error::Api(ae)) = error {
        if ae.code == 409 {
            eprintln!(
                "{}",
                format!("🔁 {namespace}/{name} hit a resource-version conflict; requeueing immediately").yellow()
            );
            return Action::requeue(Duration::from_secs(0));
        }
    }

    let key = (namespace.clone(), name.clone());
    let attempt = {
        let mut backoff = context.error_backoff.lock().unwrap();
        let count = backoff.entry(key).or_insert(0);
        *count += 1;
        *count
    };

    let exp_secs = (BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt.min(20) as i32 - 1)).min(BACKOFF_CAP.as_secs_f64());
    let jittered = Duration::from_secs_f64(rand::rng().random_range(0.0..=exp_secs));

    eprintln!(
        "{}",
        format!(
            "Reconciliation error for {namespace}/{name}: {} (attempt {attempt}, retrying in {:.1}s)",
            redact(&format!("{error:?}")),
            jittered.as_secs_f64(),
        )
        .red()
    );
    Action::requeue(jittered)
}
