//! Tekton builder: drives a `PipelineRun` through the dynamic client.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use validator_types::{BuildStrategyName, ValidationJob};

use super::{api_group_present, workspace_name, BuildProgress, Builder};
use crate::build::s2i::{LABEL_JOB_NAME, LABEL_JOB_UID};
use crate::util::Error;

const PIPELINE_GROUP: &str = "tekton.dev";
const PIPELINE_VERSION: &str = "v1";

#[derive(Default)]
pub struct TektonBuilder;

impl TektonBuilder {
    fn pipeline_run_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(PIPELINE_GROUP, PIPELINE_VERSION, "PipelineRun"))
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
impl Builder for TektonBuilder {
    fn strategy(&self) -> BuildStrategyName {
        BuildStrategyName::Tekton
    }

    async fn detect(&self, client: &Client) -> bool {
        api_group_present(client, PIPELINE_GROUP, PIPELINE_VERSION, "PipelineRun").await
    }

    async fn create_build(&self, client: &Client, job: &ValidationJob) -> Result<(), Error> {
        let namespace = job.namespace().ok_or_else(|| {
            Error::UserInput("ValidationJob has no namespace".to_string())
        })?;
        super::bootstrap_privileges(client, &namespace, "nonroot-v2").await?;

        let name = workspace_name(job);
        let resource = Self::pipeline_run_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &resource);

        if api.get_opt(&name).await?.is_some() {
            return Ok(());
        }

        let pipeline_name = job
            .spec
            .build_config
            .strategy_config
            .get("pipelineRef")
            .cloned()
            .unwrap_or_else(|| "notebook-image-build".to_string());
        let image_ref = format!("image-registry.svc:5000/{namespace}/{name}:latest");

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
                "pipelineRef": { "name": pipeline_name },
                "params": [
                    { "name": "git-url", "value": job.spec.notebook.url },
                    { "name": "git-revision", "value": job.spec.notebook.git_ref },
                    { "name": "image", "value": image_ref },
                ],
            }
        });

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(Error::Kube(e)),
        }

        let found = super::verify_created_with_retry(|| {
            let api = api.clone();
            let name = name.clone();
            async move { Ok(api.get_opt(&name).await.map_err(Error::Kube)?.is_some()) }
        })
        .await?;

        if !found {
            return Err(Error::BuildUnverified(format!(
                "PipelineRun '{name}' did not appear after creation"
            )));
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
            Api::namespaced_with(client.clone(), &namespace, &Self::pipeline_run_resource());
        let name = workspace_name(job);
        let Some(run) = api.get_opt(&name).await? else {
            return Ok(None);
        };

        let conditions = run
            .data
            .get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        let succeeded_condition = conditions
            .iter()
            .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Succeeded"));

        let (phase, failed) = match succeeded_condition.and_then(|c| c.get("status")).and_then(|s| s.as_str()) {
            Some("True") => ("Complete".to_string(), false),
            Some("False") => ("Failed".to_string(), true),
            _ => ("Running".to_string(), false),
        };
        let message = succeeded_condition
            .and_then(|c| c.get("message"))
            .and_then(|m| m.as_str())
            .map(|s| s.to_string());
        let image_ref = if phase == "Complete" {
            Some(format!("image-registry.svc:5000/{namespace}/{name}:latest"))
        } else {
            None
        };

        Ok(Some(BuildProgress {
            build_ref: name,
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
            Api::namespaced_with(client.clone(), &namespace, &Self::pipeline_run_resource());
        match api.delete(&name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
