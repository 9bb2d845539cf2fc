//! Source-to-Image builder: drives OpenShift `BuildConfig`/`Build` resources
//! through the dynamic client, since no typed binding for them exists in this
//! workspace's dependency graph.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use validator_types::{BuildStrategyName, ValidationJob};

use super::{api_group_present, workspace_name, BuildProgress, Builder};
use crate::util::Error;

const BUILD_GROUP: &str = "build.openshift.io";
const BUILD_VERSION: &str = "v1";

pub const LABEL_JOB_NAME: &str = "validation.jupyter-operator.io/job-name";
pub const LABEL_JOB_UID: &str = "validation.jupyter-operator.io/job-uid";

#[derive(Default)]
pub struct S2IBuilder;

impl S2IBuilder {
    fn build_config_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(BUILD_GROUP, BUILD_VERSION, "BuildConfig"))
    }

    fn build_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(BUILD_GROUP, BUILD_VERSION, "Build"))
    }

    fn labels(job: &ValidationJob) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_JOB_NAME.to_string(), job.name_any());
        labels.insert(
            LABEL_JOB_UID.to_string(),
            job.metadata.uid.clone().unwrap_or_default(),
        );
        labels
    }
}

#[async_trait]
impl Builder for S2IBuilder {
    fn strategy(&self) -> BuildStrategyName {
        BuildStrategyName::S2i
    }

    async fn detect(&self, client: &Client) -> bool {
        api_group_present(client, BUILD_GROUP, BUILD_VERSION, "BuildConfig").await
    }

    async fn create_build(&self, client: &Client, job: &ValidationJob) -> Result<(), Error> {
        let namespace = job.namespace().ok_or_else(|| {
            Error::UserInput("ValidationJob has no namespace".to_string())
        })?;
        super::bootstrap_privileges(client, &namespace, "anyuid").await?;

        let name = workspace_name(job);
        let resource = Self::build_config_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &resource);

        if api.get_opt(&name).await?.is_some() {
            return Ok(());
        }

        let strategy_config = &job.spec.build_config.strategy_config;
        let base_image = job
            .spec
            .build_config
            .base_image
            .clone()
            .unwrap_or_else(|| "image-registry.openshift-image-registry.svc:5000/openshift/s2i-core".to_string());

        let mut object = DynamicObject::new(&name, &resource);
        object.metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(Self::labels(job)),
            owner_references: Some(vec![job.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        };
        object.data = json!({
            "spec": {
                "source": {
                    "git": { "uri": job.spec.notebook.url, "ref": job.spec.notebook.git_ref },
                    "contextDir": strategy_config.get("contextDir").cloned().unwrap_or_default(),
                },
                "strategy": {
                    "sourceStrategy": { "from": { "kind": "DockerImage", "name": base_image } }
                },
                "output": {
                    "to": { "kind": "ImageStreamTag", "name": format!("{name}:latest") }
                },
            }
        });

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(Error::Kube(e)),
        }

        let build_api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &Self::build_resource());
        let found = super::verify_created_with_retry(|| {
            let build_api = build_api.clone();
            let name = name.clone();
            async move {
                let list = build_api
                    .list(&kube::api::ListParams::default().labels(&format!("{LABEL_JOB_NAME}={name}")))
                    .await
                    .map_err(Error::Kube)?;
                Ok(!list.items.is_empty())
            }
        })
        .await?;

        if !found {
            // BuildConfig trigger builds automatically on creation; if none
            // materialized, request one explicitly via the instantiate subresource.
            let request = json!({
                "kind": "BuildRequest",
                "apiVersion": "build.openshift.io/v1",
                "metadata": { "name": name },
            });
            let _ = api
                .patch_subresource(
                    "instantiate",
                    &name,
                    &PatchParams::default(),
                    &Patch::Apply(request),
                )
                .await;

            let found_after_instantiate = super::verify_created_with_retry(|| {
                let build_api = build_api.clone();
                let name = name.clone();
                async move {
                    let list = build_api
                        .list(&kube::api::ListParams::default().labels(&format!("{LABEL_JOB_NAME}={name}")))
                        .await
                        .map_err(Error::Kube)?;
                    Ok(!list.items.is_empty())
                }
            })
            .await?;

            if !found_after_instantiate {
                return Err(Error::BuildUnverified(format!(
                    "no Build materialized for BuildConfig '{name}' after instantiate request"
                )));
            }
        }

        Ok(())
    }

    async fn get_latest_build(
        &self,
        client: &Client,
        job: &ValidationJob,
    ) -> Result<Option<BuildProgress>, Error> {
        let namespace = job.namespace().ok_or_else(|| {
            Error::UserInput("ValidationJob has no namespace".to_string())
        })?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &Self::build_resource());
        let list = api
            .list(&kube::api::ListParams::default().labels(&format!("{LABEL_JOB_NAME}={}", job.name_any())))
            .await?;

        let latest = list
            .items
            .into_iter()
            .max_by_key(|o| o.metadata.creation_timestamp.clone().map(|t| t.0));

        let Some(build) = latest else {
            return Ok(None);
        };

        let phase = build
            .data
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let message = build
            .data
            .get("status")
            .and_then(|s| s.get("message"))
            .and_then(|m| m.as_str())
            .map(|s| s.to_string());
        let image_ref = build
            .data
            .get("status")
            .and_then(|s| s.get("outputDockerImageReference"))
            .and_then(|i| i.as_str())
            .map(|s| s.to_string());
        let failed = matches!(phase.as_str(), "Failed" | "Error" | "Cancelled");

        Ok(Some(BuildProgress {
            build_ref: build.metadata.name.unwrap_or_default(),
            phase,
            image_ref,
            message,
            failed,
        }))
    }

    async fn cleanup(&self, client: &Client, job: &ValidationJob) -> Result<(), Error> {
        let Some(namespace) = job.namespace() else {
            return Ok(());
        };
        let name = workspace_name(job);
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &namespace, &Self::build_config_resource());
        match api.delete(&name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
