//! Build strategy registry and the shared `Builder` capability contract.
//!
//! Each strategy gets its own reconciliation handler rather than a shared
//! generic one (see DESIGN.md): different backends name and discover their
//! child resources differently, and a generic path risks never locating the
//! build it just created.

pub mod s2i;
pub mod tekton;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams, PostParams};
use kube::discovery::oneshot;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use validator_types::{BuildStrategyName, ValidationJob};

use crate::util::Error;

const SECURITY_GROUP: &str = "security.openshift.io";
const SECURITY_VERSION: &str = "v1";

/// Namespace-scoped singleton: every job in a namespace shares one build
/// service account rather than getting its own.
pub const BUILD_SERVICE_ACCOUNT_NAME: &str = "validator-operator-builder";

/// A snapshot of a build's progress, as reported by its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildProgress {
    pub phase: String,
    pub build_ref: String,
    pub image_ref: Option<String>,
    pub message: Option<String>,
    pub failed: bool,
}

/// Per-strategy build backend. Implementors own one external build system
/// (OpenShift S2I builds, Tekton PipelineRuns, ...).
#[async_trait]
pub trait Builder: Send + Sync {
    fn strategy(&self) -> BuildStrategyName;

    /// True if the backing build system's CRDs are installed in the cluster.
    async fn detect(&self, client: &Client) -> bool;

    /// Idempotently creates all resources needed to build an image for this
    /// job. Must be a no-op if the build already exists.
    async fn create_build(&self, client: &Client, job: &ValidationJob) -> Result<(), Error>;

    /// Discovers the current build by this backend's own label convention —
    /// never by reconstructing a resource name.
    async fn get_latest_build(
        &self,
        client: &Client,
        job: &ValidationJob,
    ) -> Result<Option<BuildProgress>, Error>;

    /// Best-effort deletion of owned build resources.
    async fn cleanup(&self, client: &Client, job: &ValidationJob) -> Result<(), Error>;
}

/// Process-wide mapping from strategy name to `Builder`, populated once at
/// startup from `--enabled-build-strategies`, filtered by `detect()`.
/// Registration is closed after construction; lookup is pure.
pub struct BuildStrategyRegistry {
    builders: Vec<Box<dyn Builder>>,
}

impl BuildStrategyRegistry {
    pub async fn discover(client: &Client, candidates: &[BuildStrategyName]) -> Self {
        let all: Vec<Box<dyn Builder>> = vec![
            Box::new(s2i::S2IBuilder::default()),
            Box::new(tekton::TektonBuilder::default()),
        ];
        let mut builders = Vec::new();
        for builder in all {
            if !candidates.contains(&builder.strategy()) {
                continue;
            }
            if builder.detect(client).await {
                println!("build strategy '{}' detected and enabled", builder.strategy());
                builders.push(builder);
            } else {
                println!(
                    "build strategy '{}' requested but not detected on this cluster; skipping",
                    builder.strategy()
                );
            }
        }
        BuildStrategyRegistry { builders }
    }

    pub fn get(&self, strategy: BuildStrategyName) -> Option<&dyn Builder> {
        self.builders
            .iter()
            .find(|b| b.strategy() == strategy)
            .map(|b| b.as_ref())
    }
}

/// Unique per-build workspace name: job name plus a short hash of its UID, so
/// concurrent jobs never share a build workspace.
pub fn workspace_name(job: &ValidationJob) -> String {
    let uid = job
        .metadata
        .uid
        .as_deref()
        .unwrap_or("unknown-uid");
    let mut hasher = Sha256::new();
    hasher.update(uid.as_bytes());
    let digest = hasher.finalize();
    format!("{}-{}", job.metadata.name.as_deref().unwrap_or("job"), hex::encode(&digest[..4]))
}

/// Read-after-write verification: retries `check` with exponential backoff
/// (100 ms -> 1.6 s), five attempts, to tolerate API propagation delay.
pub async fn verify_created_with_retry<F, Fut>(mut check: F) -> Result<bool, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, Error>>,
{
    let mut delay = Duration::from_millis(100);
    for attempt in 0..5 {
        if check().await? {
            return Ok(true);
        }
        if attempt < 4 {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Ok(false)
}

/// Detects whether the cluster exposes the given API group/version, used for
/// feature-detecting security constraints, alternative build CRDs, etc.
/// Degrades to `false`, not an error, when the group is absent.
pub async fn api_group_present(client: &Client, group: &str, version: &str, kind: &str) -> bool {
    use kube::core::GroupVersionKind;
    let gvk = GroupVersionKind::gvk(group, version, kind);
    oneshot::pinned_kind(client, &gvk).await.is_ok()
}

fn scc_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(SECURITY_GROUP, SECURITY_VERSION, "SecurityContextConstraints"))
}

/// Ensures `namespace` has a dedicated build service account and that it is
/// granted `scc_name`. Both the account and the grant are namespace-scoped
/// singletons shared by every job in the namespace. A no-op, not an error,
/// on clusters without the SCC API group: not every build backend runs on
/// OpenShift.
pub async fn bootstrap_privileges(client: &Client, namespace: &str, scc_name: &str) -> Result<(), Error> {
    if !api_group_present(client, SECURITY_GROUP, SECURITY_VERSION, "SecurityContextConstraints").await {
        return Ok(());
    }
    ensure_build_service_account(client, namespace).await?;
    grant_security_constraint(client, namespace, scc_name).await
}

async fn ensure_build_service_account(client: &Client, namespace: &str) -> Result<(), Error> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    if api.get_opt(BUILD_SERVICE_ACCOUNT_NAME).await?.is_some() {
        return Ok(());
    }
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(BUILD_SERVICE_ACCOUNT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &account).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::Kube(e)),
    }
}

/// Adds the namespace's build service account to the cluster-scoped SCC's
/// `users` list. Read-modify-write with conflict retry: other namespaces'
/// bootstraps race on the same object.
async fn grant_security_constraint(client: &Client, namespace: &str, scc_name: &str) -> Result<(), Error> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &scc_resource());
    let user = format!("system:serviceaccount:{namespace}:{BUILD_SERVICE_ACCOUNT_NAME}");

    for attempt in 0..5 {
        let Some(scc) = api.get_opt(scc_name).await? else {
            return Ok(());
        };
        let users: Vec<String> = scc
            .data
            .get("users")
            .and_then(|u| u.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if users.iter().any(|u| u == &user) {
            return Ok(());
        }
        let mut new_users = users;
        new_users.push(user.clone());
        let patch = Patch::Merge(json!({ "users": new_users }));
        match api.patch(scc_name, &PatchParams::default(), &patch).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < 4 => continue,
            Err(e) => return Err(Error::Kube(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verify_created_with_retry_succeeds_on_later_attempt() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let found = verify_created_with_retry(move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(n >= 2)
            }
        })
        .await
        .unwrap();
        assert!(found);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn verify_created_with_retry_gives_up_after_five_attempts() {
        let found = verify_created_with_retry(|| async { Ok(false) }).await.unwrap();
        assert!(!found);
    }
}
