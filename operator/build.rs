use kube::CustomResourceExt;
use std::fs;
use validator_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/validation.jupyter-operator.io_validationjob_crd.yaml",
        serde_yaml::to_string(&ValidationJob::crd()).unwrap(),
    )
    .unwrap();
}
