//! Compares executed cell outputs against golden outputs under a
//! configurable equivalence rule.

use regex::Regex;
use std::sync::OnceLock;
use validator_types::{
    CellResult, CellStatus, ComparisonConfig, ComparisonOutcome, ComparisonResult, ComparisonStrategy, DiffSeverity,
    CellDiff,
};

/// Elisions applied before a `Normalized`/`FuzzyNumeric` comparison, beyond
/// whatever the job itself configures: ISO-8601 timestamps, POSIX
/// datestamps, and Python's `Out[n]`/`In[n]` execution-count markers.
fn builtin_elisions() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?").unwrap(),
            Regex::new(r"\b\w{3} \w{3} +\d{1,2} \d{2}:\d{2}:\d{2} \d{4}\b").unwrap(),
            Regex::new(r"\b(In|Out)\[\d+\]").unwrap(),
        ]
    })
}

fn numeric_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(\.\d+)?([eE][+-]?\d+)?").unwrap())
}

/// Normalizes text before equality under `Normalized`/`FuzzyNumeric`: trims,
/// collapses CRLF to LF, and applies the configured plus built-in elisions.
pub fn normalize(input: &str, user_patterns: &[String]) -> String {
    let mut text = input.replace("\r\n", "\n").trim().to_string();
    for pattern in builtin_elisions() {
        text = pattern.replace_all(&text, "").to_string();
    }
    for pattern in user_patterns {
        if let Ok(re) = Regex::new(pattern) {
            text = re.replace_all(&text, "").to_string();
        }
    }
    text
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Number(f64),
}

/// Splits `input` into an alternating sequence of non-numeric text runs and
/// parsed numeric runs, used by `FuzzyNumeric` to compare structure exactly
/// but numbers within tolerance.
fn extract_tokens(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for m in numeric_run().find_iter(input) {
        if m.start() > last {
            tokens.push(Token::Text(input[last..m.start()].to_string()));
        }
        if let Ok(n) = m.as_str().parse::<f64>() {
            tokens.push(Token::Number(n));
        } else {
            tokens.push(Token::Text(m.as_str().to_string()));
        }
        last = m.end();
    }
    if last < input.len() {
        tokens.push(Token::Text(input[last..].to_string()));
    }
    tokens
}

/// `a` and `b` match if within absolute `tolerance`, or within relative
/// `tolerance` of the larger magnitude (epsilon-guarded against division by
/// zero for values near 0).
fn numeric_eq(a: f64, b: f64, tolerance: f64) -> bool {
    let diff = (a - b).abs();
    if diff <= tolerance {
        return true;
    }
    let denom = a.abs().max(b.abs()).max(f64::EPSILON);
    diff / denom <= tolerance
}

fn fuzzy_numeric_eq(a: &str, b: &str, tolerance: f64) -> bool {
    let ta = extract_tokens(a);
    let tb = extract_tokens(b);
    if ta.len() != tb.len() {
        return false;
    }
    ta.iter().zip(tb.iter()).all(|(x, y)| match (x, y) {
        (Token::Text(sx), Token::Text(sy)) => sx == sy,
        (Token::Number(nx), Token::Number(ny)) => numeric_eq(*nx, *ny, tolerance),
        _ => false,
    })
}

/// Outcome of comparing one pair of cell outputs, fine-grained enough to
/// tell a near-miss numeric delta (severity `minor`) apart from a genuine
/// mismatch (severity `major`).
enum OutputComparison {
    Match,
    NumericNearMiss,
    Mismatch,
}

fn compare_outputs(config: &ComparisonConfig, executed: Option<&str>, golden: Option<&str>) -> OutputComparison {
    let (executed, golden) = match (executed, golden) {
        (Some(e), Some(g)) => (e, g),
        (None, None) => return OutputComparison::Match,
        _ => return OutputComparison::Mismatch,
    };
    match config.strategy {
        ComparisonStrategy::Exact => {
            if executed == golden {
                OutputComparison::Match
            } else {
                OutputComparison::Mismatch
            }
        }
        ComparisonStrategy::Normalized => {
            if normalize(executed, &config.ignore_patterns) == normalize(golden, &config.ignore_patterns) {
                OutputComparison::Match
            } else {
                OutputComparison::Mismatch
            }
        }
        ComparisonStrategy::FuzzyNumeric => {
            let ne = normalize(executed, &config.ignore_patterns);
            let ng = normalize(golden, &config.ignore_patterns);
            let tolerance = config.tolerance.unwrap_or(0.0);
            if fuzzy_numeric_eq(&ne, &ng, tolerance) {
                OutputComparison::Match
            } else if fuzzy_numeric_eq(&ne, &ng, tolerance * 10.0) {
                OutputComparison::NumericNearMiss
            } else {
                OutputComparison::Mismatch
            }
        }
    }
}

/// Aligns executed and golden cell results by `cellIndex` and classifies
/// each pairing's diff severity. Cells present on only one side produce a
/// `missing_cell` diff of severity `major`.
pub fn compare_cells(config: &ComparisonConfig, executed: &[CellResult], golden: &[CellResult]) -> ComparisonResult {
    let mut diffs = Vec::new();
    let mut matched = 0u32;
    let mut mismatched = 0u32;

    let max_index = executed
        .iter()
        .chain(golden.iter())
        .map(|c| c.cell_index)
        .max()
        .unwrap_or(-1);

    let find = |cells: &[CellResult], index: i64| cells.iter().find(|c| c.cell_index == index);

    let mut total = 0u32;
    for index in 0..=max_index {
        let exec_cell = find(executed, index);
        let golden_cell = find(golden, index);
        total += 1;

        match (exec_cell, golden_cell) {
            (Some(e), Some(g)) => {
                if e.status != g.status {
                    mismatched += 1;
                    diffs.push(CellDiff {
                        cell_index: index,
                        severity: if e.status == CellStatus::Failure || g.status == CellStatus::Failure {
                            DiffSeverity::Critical
                        } else {
                            DiffSeverity::Major
                        },
                        kind: "status_mismatch".to_string(),
                        message: format!("executed status {:?} != golden status {:?}", e.status, g.status),
                    });
                    continue;
                }
                match compare_outputs(config, e.output.as_deref(), g.output.as_deref()) {
                    OutputComparison::Match => matched += 1,
                    OutputComparison::NumericNearMiss => {
                        mismatched += 1;
                        diffs.push(CellDiff {
                            cell_index: index,
                            severity: DiffSeverity::Minor,
                            kind: "value_mismatch".to_string(),
                            message: "output differs within 10x the configured numeric tolerance".to_string(),
                        });
                    }
                    OutputComparison::Mismatch => {
                        mismatched += 1;
                        diffs.push(CellDiff {
                            cell_index: index,
                            severity: DiffSeverity::Major,
                            kind: "value_mismatch".to_string(),
                            message: "output differs under the configured comparison strategy".to_string(),
                        });
                    }
                }
            }
            (None, Some(_)) | (Some(_), None) => {
                mismatched += 1;
                diffs.push(CellDiff {
                    cell_index: index,
                    severity: DiffSeverity::Major,
                    kind: "missing_cell".to_string(),
                    message: "cell present on only one side of the comparison".to_string(),
                });
            }
            (None, None) => {
                total -= 1;
            }
        }
    }

    ComparisonResult {
        strategy: config.strategy,
        result: if mismatched == 0 {
            ComparisonOutcome::Matched
        } else {
            ComparisonOutcome::Failed
        },
        total_cells: total,
        matched_cells: matched,
        mismatched_cells: mismatched,
        diffs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(index: i64, status: CellStatus, output: &str) -> CellResult {
        CellResult {
            cell_index: index,
            status,
            execution_time_ms: Some(1),
            output: Some(output.to_string()),
            error_message: None,
        }
    }

    fn config(strategy: ComparisonStrategy, tolerance: Option<f64>) -> ComparisonConfig {
        ComparisonConfig {
            strategy,
            tolerance,
            ignore_patterns: vec![],
        }
    }

    #[test]
    fn exact_strategy_is_reflexive() {
        let cfg = config(ComparisonStrategy::Exact, None);
        let cells = vec![cell(0, CellStatus::Success, "answer: 42")];
        let result = compare_cells(&cfg, &cells, &cells);
        assert_eq!(result.result, ComparisonOutcome::Matched);
        assert_eq!(result.mismatched_cells, 0);
    }

    #[test]
    fn exact_strategy_catches_textual_mismatch() {
        let cfg = config(ComparisonStrategy::Exact, None);
        let executed = vec![cell(0, CellStatus::Success, "answer: 41")];
        let golden = vec![cell(0, CellStatus::Success, "answer: 42")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.result, ComparisonOutcome::Failed);
        assert_eq!(result.mismatched_cells, 1);
        assert_eq!(result.diffs[0].severity, DiffSeverity::Major);
    }

    #[test]
    fn normalized_strategy_ignores_trailing_whitespace() {
        let cfg = config(ComparisonStrategy::Normalized, None);
        let executed = vec![cell(0, CellStatus::Success, "answer: 42\n  ")];
        let golden = vec![cell(0, CellStatus::Success, "answer: 42")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.result, ComparisonOutcome::Matched);
    }

    #[test]
    fn fuzzy_numeric_with_zero_tolerance_matches_normalized_on_integers() {
        let cfg = config(ComparisonStrategy::FuzzyNumeric, Some(0.0));
        let executed = vec![cell(0, CellStatus::Success, "answer: 42")];
        let golden = vec![cell(0, CellStatus::Success, "answer: 42")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.result, ComparisonOutcome::Matched);
    }

    #[test]
    fn fuzzy_numeric_tolerates_small_deltas() {
        let cfg = config(ComparisonStrategy::FuzzyNumeric, Some(0.01));
        let executed = vec![cell(0, CellStatus::Success, "mean: 3.14159")];
        let golden = vec![cell(0, CellStatus::Success, "mean: 3.14160")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.result, ComparisonOutcome::Matched);
    }

    #[test]
    fn fuzzy_numeric_matches_on_relative_tolerance_alone() {
        let cfg = config(ComparisonStrategy::FuzzyNumeric, Some(1e-6));
        let executed = vec![cell(0, CellStatus::Success, "total: 1000000")];
        let golden = vec![cell(0, CellStatus::Success, "total: 1000000.5")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.result, ComparisonOutcome::Matched);
    }

    #[test]
    fn fuzzy_numeric_near_miss_is_minor_severity() {
        let cfg = config(ComparisonStrategy::FuzzyNumeric, Some(0.01));
        let executed = vec![cell(0, CellStatus::Success, "mean: 3.14")];
        let golden = vec![cell(0, CellStatus::Success, "mean: 3.20")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.result, ComparisonOutcome::Failed);
        assert_eq!(result.diffs[0].severity, DiffSeverity::Minor);
    }

    #[test]
    fn fuzzy_numeric_beyond_ten_x_tolerance_is_major() {
        let cfg = config(ComparisonStrategy::FuzzyNumeric, Some(0.01));
        let executed = vec![cell(0, CellStatus::Success, "mean: 3.14")];
        let golden = vec![cell(0, CellStatus::Success, "mean: 9.00")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.diffs[0].severity, DiffSeverity::Major);
    }

    #[test]
    fn missing_cell_on_golden_side_is_major() {
        let cfg = config(ComparisonStrategy::Exact, None);
        let executed = vec![cell(0, CellStatus::Success, "a"), cell(1, CellStatus::Success, "b")];
        let golden = vec![cell(0, CellStatus::Success, "a")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.mismatched_cells, 1);
        assert_eq!(result.diffs[0].kind, "missing_cell");
    }

    #[test]
    fn status_mismatch_is_critical() {
        let cfg = config(ComparisonStrategy::Exact, None);
        let executed = vec![cell(0, CellStatus::Failure, "boom")];
        let golden = vec![cell(0, CellStatus::Success, "ok")];
        let result = compare_cells(&cfg, &executed, &golden);
        assert_eq!(result.diffs[0].severity, DiffSeverity::Critical);
    }
}
