#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Build system error: {0}")]
    Build(String),

    #[error("Pod execution error: {0}")]
    PodExecution(String),

    #[error("Failed to collect results: {0}")]
    ResultCollection(String),

    #[error("Build creation could not be verified: {0}")]
    BuildUnverified(String),
}
