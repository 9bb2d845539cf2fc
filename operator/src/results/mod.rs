//! Reads the execution tool's results file out of a validation pod and maps
//! it into status-sized `CellResult`s.

use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use validator_types::{CellResult, CellStatus};

use crate::util::Error;

/// Per-field byte cap; beyond this the API server's per-object size limit
/// becomes a real risk across a notebook with many cells.
pub const TRUNCATION_CAP_BYTES: usize = 16 * 1024;

const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Exec's into the pod, cats `path`, and returns the raw contents. Empty or
/// missing files (the path never got written) are reported as `Ok(None)`.
async fn read_file_from_pod(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    container_name: &str,
    path: &str,
) -> Result<Option<String>, Error> {
    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), namespace);
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cat {path} 2>/dev/null || true"),
    ];

    let attach = tokio::time::timeout(
        READ_TIMEOUT,
        pods.exec(
            pod_name,
            command,
            &AttachParams::default()
                .container(container_name)
                .stdout(true)
                .stderr(false),
        ),
    )
    .await
    .map_err(|_| Error::ResultCollection(format!("timed out reading '{path}' from pod '{pod_name}'")))?
    .map_err(|e| Error::ResultCollection(format!("exec into pod '{pod_name}' failed: {e}")))?;

    let mut attach = attach;
    let mut stdout = attach
        .stdout()
        .ok_or_else(|| Error::ResultCollection("exec session had no stdout stream".to_string()))?;

    let mut buf = String::new();
    tokio::time::timeout(READ_TIMEOUT, stdout.read_to_string(&mut buf))
        .await
        .map_err(|_| Error::ResultCollection(format!("timed out draining '{path}' stream")))?
        .map_err(|e| Error::ResultCollection(format!("failed to read '{path}' stream: {e}")))?;

    if buf.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(buf))
    }
}

/// Reads the execution tool's NDJSON results file out of the validation
/// pod. A nonexistent file (the tool crashed before writing anything) is
/// reported as `Ok(None)`, not an error — the caller synthesizes the
/// failure-classification result from the container's exit status instead.
pub async fn collect_results(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    container_name: &str,
    results_path: &str,
) -> Result<Option<Vec<CellResult>>, Error> {
    let contents = read_file_from_pod(client, namespace, pod_name, container_name, results_path).await?;
    Ok(contents.map(|buf| parse_ndjson(&buf)))
}

/// Reads the golden `.ipynb` notebook out of the validation pod's scratch
/// volume and extracts each code cell's rendered text output, so it can be
/// compared to the executed notebook's cell results without re-running it.
pub async fn collect_golden_outputs(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    container_name: &str,
    golden_path: &str,
) -> Result<Option<Vec<CellResult>>, Error> {
    let contents = read_file_from_pod(client, namespace, pod_name, container_name, golden_path).await?;
    match contents {
        Some(raw) => parse_notebook_outputs(&raw).map(Some),
        None => Ok(None),
    }
}

/// Extracts per-code-cell text output from a Jupyter notebook JSON document,
/// treating whatever is already recorded in the notebook as the reference
/// ("golden") result.
pub fn parse_notebook_outputs(notebook_json: &str) -> Result<Vec<CellResult>, Error> {
    let doc: serde_json::Value =
        serde_json::from_str(notebook_json).map_err(|e| Error::ResultCollection(format!("malformed golden notebook JSON: {e}")))?;
    let cells = doc
        .get("cells")
        .and_then(|c| c.as_array())
        .ok_or_else(|| Error::ResultCollection("golden notebook has no 'cells' array".to_string()))?;

    let mut results = Vec::new();
    let mut index = 0i64;
    for cell in cells {
        if cell.get("cell_type").and_then(|t| t.as_str()) != Some("code") {
            continue;
        }
        let text = cell
            .get("outputs")
            .and_then(|o| o.as_array())
            .map(|outputs| render_cell_outputs(outputs))
            .unwrap_or_default();
        let has_error = cell
            .get("outputs")
            .and_then(|o| o.as_array())
            .is_some_and(|outputs| outputs.iter().any(|o| o.get("output_type").and_then(|t| t.as_str()) == Some("error")));
        results.push(CellResult {
            cell_index: index,
            status: if has_error { CellStatus::Failure } else { CellStatus::Success },
            execution_time_ms: None,
            output: (!text.is_empty()).then(|| truncate_field(&text)),
            error_message: None,
        });
        index += 1;
    }
    Ok(results)
}

fn render_cell_outputs(outputs: &[serde_json::Value]) -> String {
    outputs
        .iter()
        .filter_map(|o| {
            o.get("text")
                .and_then(json_text_lines)
                .or_else(|| o.get("data").and_then(|d| d.get("text/plain")).and_then(json_text_lines))
        })
        .collect::<Vec<_>>()
        .join("")
}

fn json_text_lines(value: &serde_json::Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    value.as_array().map(|lines| {
        lines
            .iter()
            .filter_map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join("")
    })
}

/// Parses newline-delimited `CellResult` JSON, truncating oversized fields.
/// Lines that fail to parse are skipped rather than aborting the whole batch
/// — a single malformed line from a buggy execution tool shouldn't erase
/// every cell that did parse.
pub fn parse_ndjson(input: &str) -> Vec<CellResult> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<CellResult>(line).ok())
        .map(|mut cell| {
            cell.output = cell.output.map(|o| truncate_field(&o));
            cell.error_message = cell.error_message.map(|m| truncate_field(&m));
            cell
        })
        .collect()
}

/// Truncates `field` to `TRUNCATION_CAP_BYTES`, appending an elision marker
/// naming how many bytes were dropped. Truncates on a char boundary so the
/// result is always valid UTF-8.
pub fn truncate_field(field: &str) -> String {
    if field.len() <= TRUNCATION_CAP_BYTES {
        return field.to_string();
    }
    let mut cut = TRUNCATION_CAP_BYTES;
    while !field.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = field.len() - cut;
    format!("{}...[truncated {dropped} bytes]", &field[..cut])
}

/// Builds the synthetic failure result recorded when the execution tool
/// exits non-zero without ever writing a results file.
pub fn synthesize_failure(stderr_tail: &str) -> Vec<CellResult> {
    vec![CellResult {
        cell_index: -1,
        status: CellStatus::Failure,
        execution_time_ms: None,
        output: None,
        error_message: Some(truncate_field(stderr_tail)),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_field_leaves_short_strings_untouched() {
        assert_eq!(truncate_field("hello"), "hello");
    }

    #[test]
    fn truncate_field_appends_elision_marker() {
        let big = "a".repeat(TRUNCATION_CAP_BYTES + 100);
        let truncated = truncate_field(&big);
        assert!(truncated.ends_with("...[truncated 100 bytes]"));
        assert_eq!(truncated.len(), TRUNCATION_CAP_BYTES + "...[truncated 100 bytes]".len());
    }

    #[test]
    fn parse_ndjson_skips_malformed_lines() {
        let input = "{\"cellIndex\":0,\"status\":\"Success\",\"executionTimeMs\":12}\nnot json\n{\"cellIndex\":1,\"status\":\"Failure\",\"executionTimeMs\":3,\"errorMessage\":\"boom\"}";
        let results = parse_ndjson(input);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].cell_index, 0);
        assert_eq!(results[1].cell_index, 1);
    }

    #[test]
    fn synthesize_failure_produces_sentinel_cell() {
        let results = synthesize_failure("panic: oom");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cell_index, -1);
        assert_eq!(results[0].status, CellStatus::Failure);
    }

    #[test]
    fn parse_notebook_outputs_skips_markdown_cells() {
        let notebook = r#"{
            "cells": [
                {"cell_type": "markdown", "source": ["# title"]},
                {"cell_type": "code", "outputs": [{"output_type": "stream", "text": ["42\n"]}]}
            ]
        }"#;
        let results = parse_notebook_outputs(notebook).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cell_index, 0);
        assert_eq!(results[0].output.as_deref(), Some("42\n"));
        assert_eq!(results[0].status, CellStatus::Success);
    }

    #[test]
    fn parse_notebook_outputs_marks_error_outputs_as_failure() {
        let notebook = r#"{
            "cells": [
                {"cell_type": "code", "outputs": [{"output_type": "error", "ename": "ValueError"}]}
            ]
        }"#;
        let results = parse_notebook_outputs(notebook).unwrap();
        assert_eq!(results[0].status, CellStatus::Failure);
    }

    #[test]
    fn parse_notebook_outputs_rejects_malformed_json() {
        assert!(parse_notebook_outputs("not json").is_err());
    }
}
