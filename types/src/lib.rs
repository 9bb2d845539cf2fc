use k8s_openapi::api::core::v1::{
    Affinity, EnvFromSource, EnvVar, ResourceRequirements, Toleration, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A reference to a notebook (or golden notebook) inside a Git repository.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GitRef {
    pub url: String,
    #[serde(rename = "ref", default = "default_git_ref")]
    pub git_ref: String,
    pub path: String,
    /// Name of a Secret in the job's namespace holding Git credentials.
    #[serde(default, rename = "credentialsSecretRef")]
    pub credentials_secret_ref: Option<String>,
}

fn default_git_ref() -> String {
    "main".to_string()
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum BuildStrategyName {
    S2i,
    Tekton,
}

impl fmt::Display for BuildStrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStrategyName::S2i => write!(f, "s2i"),
            BuildStrategyName::Tekton => write!(f, "tekton"),
        }
    }
}

impl FromStr for BuildStrategyName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s2i" => Ok(BuildStrategyName::S2i),
            "tekton" => Ok(BuildStrategyName::Tekton),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BuildConfig {
    #[serde(default)]
    pub enabled: bool,
    pub strategy: Option<BuildStrategyName>,
    #[serde(default, rename = "baseImage")]
    pub base_image: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default, rename = "strategyConfig")]
    pub strategy_config: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodConfig {
    #[serde(default, rename = "containerImage")]
    pub container_image: Option<String>,
    #[serde(default, rename = "buildConfig")]
    pub build_config: Option<BuildConfig>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default, rename = "envFrom")]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default, rename = "nodeSelector")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub affinity: Option<Affinity>,
    #[serde(default, rename = "serviceAccountName")]
    pub service_account_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonStrategy {
    Exact,
    Normalized,
    FuzzyNumeric,
}

impl fmt::Display for ComparisonStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonStrategy::Exact => write!(f, "exact"),
            ComparisonStrategy::Normalized => write!(f, "normalized"),
            ComparisonStrategy::FuzzyNumeric => write!(f, "fuzzyNumeric"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ComparisonConfig {
    pub strategy: ComparisonStrategy,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default, rename = "ignorePatterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_timeout_seconds() -> u64 {
    1800
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "validation.jupyter-operator.io",
    version = "v1",
    kind = "ValidationJob",
    plural = "validationjobs",
    derive = "PartialEq",
    status = "ValidationJobStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.message\", \"name\": \"MESSAGE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".metadata.creationTimestamp\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct ValidationJobSpec {
    pub notebook: GitRef,
    #[serde(default, rename = "goldenNotebook")]
    pub golden_notebook: Option<GitRef>,
    #[serde(rename = "podConfig")]
    pub pod_config: PodConfig,
    #[serde(default)]
    pub comparison: Option<ComparisonConfig>,
    #[serde(default = "default_timeout_seconds", rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

/// The only authoritative lifecycle field of a [`ValidationJob`]. All other
/// status fields are advisory and may lag the true cluster state.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ValidationJobPhase {
    #[default]
    Pending,
    Building,
    BuildComplete,
    Running,
    Succeeded,
    Failed,
}

impl ValidationJobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ValidationJobPhase::Succeeded | ValidationJobPhase::Failed
        )
    }
}

impl FromStr for ValidationJobPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ValidationJobPhase::Pending),
            "Building" => Ok(ValidationJobPhase::Building),
            "BuildComplete" => Ok(ValidationJobPhase::BuildComplete),
            "Running" => Ok(ValidationJobPhase::Running),
            "Succeeded" => Ok(ValidationJobPhase::Succeeded),
            "Failed" => Ok(ValidationJobPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ValidationJobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationJobPhase::Pending => write!(f, "Pending"),
            ValidationJobPhase::Building => write!(f, "Building"),
            ValidationJobPhase::BuildComplete => write!(f, "BuildComplete"),
            ValidationJobPhase::Running => write!(f, "Running"),
            ValidationJobPhase::Succeeded => write!(f, "Succeeded"),
            ValidationJobPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct BuildStatus {
    pub phase: Option<String>,
    #[serde(default, rename = "buildRef")]
    pub build_ref: Option<String>,
    #[serde(default, rename = "imageRef")]
    pub image_ref: Option<String>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<Time>,
    #[serde(default, rename = "completionTime")]
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CellStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CellResult {
    #[serde(rename = "cellIndex")]
    pub cell_index: i64,
    pub status: CellStatus,
    #[serde(default, rename = "executionTimeMs")]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ComparisonOutcome {
    Matched,
    Failed,
    Skipped,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum DiffSeverity {
    Minor,
    Major,
    Critical,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CellDiff {
    #[serde(rename = "cellIndex")]
    pub cell_index: i64,
    pub severity: DiffSeverity,
    /// Short machine-readable kind, e.g. `missing_cell`, `value_mismatch`, `status_mismatch`.
    pub kind: String,
    pub message: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ComparisonResult {
    pub strategy: ComparisonStrategy,
    pub result: ComparisonOutcome,
    #[serde(rename = "totalCells")]
    pub total_cells: u32,
    #[serde(rename = "matchedCells")]
    pub matched_cells: u32,
    #[serde(rename = "mismatchedCells")]
    pub mismatched_cells: u32,
    #[serde(default)]
    pub diffs: Vec<CellDiff>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct ValidationJobStatus {
    pub phase: ValidationJobPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, rename = "buildStatus")]
    pub build_status: Option<BuildStatus>,
    #[serde(default, rename = "validationPodName")]
    pub validation_pod_name: Option<String>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<Time>,
    #[serde(default, rename = "completionTime")]
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "cellResults")]
    pub cell_results: Vec<CellResult>,
    #[serde(default, rename = "comparisonResult")]
    pub comparison_result: Option<ComparisonResult>,
    #[serde(default, rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

/// Condition type names used in `status.conditions[].type`.
pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const GIT_CLONED: &str = "GitCloned";
    pub const BUILD_READY: &str = "BuildReady";
    pub const VALIDATION_COMPLETE: &str = "ValidationComplete";
    pub const GOLDEN_COMPARISON: &str = "GoldenComparison";
}

/// Failure/terminal reasons used in `status.conditions[].reason` and as a stable
/// vocabulary for metrics labels.
pub mod reasons {
    pub const TIMEOUT: &str = "Timeout";
    pub const NAME_CONFLICT: &str = "NameConflict";
    pub const IMAGE_PULL_FAILURE: &str = "ImagePullFailure";
    pub const UNSCHEDULABLE: &str = "Unschedulable";
    pub const BUILD_CREATION_UNVERIFIED: &str = "BuildCreationUnverified";
    pub const BUILD_FAILED: &str = "BuildFailed";
    pub const COMPARISON_IO_ERROR: &str = "ComparisonIOError";
    pub const COMPARISON_MISMATCH: &str = "ComparisonMismatch";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const POD_FAILED: &str = "PodFailed";
}
