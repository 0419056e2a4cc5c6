//! Log parsing and verdict data model for functional-test regression checks.

use regex::Regex;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

pub const COMPLETION_PREFIX: &str = "Solver finished at";

/// Which side of a test a log belongs to. Error and completion checks only
/// apply to run logs; both sides contribute metric observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Run,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorLine {
    /// 1-based line number within the log.
    pub line_number: usize,
    /// Original line text, case preserved, line terminator stripped.
    pub text: String,
}

/// Signals extracted from one solver log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedLog {
    pub completed: bool,
    pub error_lines: Vec<ErrorLine>,
    /// Maximum observed working-set peak, 0.0 if never observed.
    pub peak_memory_mb: f64,
    /// Last observed mesh-brick total, 0 if never observed.
    pub total_bricks: u64,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|\s)error").expect("error pattern"));
static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Memory Working Set Current = (\d+(?:\.\d+)?) Mb, Memory Working Set Peak = (\d+(?:\.\d+)?) Mb",
    )
    .expect("memory pattern")
});
static BRICKS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"MESH::Bricks: Total=(\d+) Gas=(\d+) Solid=(\d+) Partial=(\d+) Irregular=(\d+)")
        .expect("bricks pattern")
});

/// Scans lines in order and extracts the log signals. Each line matches at
/// most one category: error check (run logs only), then completion check
/// (run logs only), then the memory pattern, then the bricks pattern.
pub fn parse_lines<I, S>(lines: I, kind: LogKind) -> ParsedLog
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = ParsedLog::default();
    for (index, line) in lines.into_iter().enumerate() {
        let line = line.as_ref();
        if kind == LogKind::Run && ERROR_RE.is_match(line) {
            parsed.error_lines.push(ErrorLine {
                line_number: index + 1,
                text: line.to_string(),
            });
        } else if kind == LogKind::Run && line.starts_with(COMPLETION_PREFIX) {
            parsed.completed = true;
        } else if let Some(caps) = MEMORY_RE.captures(line) {
            if let Ok(peak) = caps[2].parse::<f64>() {
                parsed.peak_memory_mb = parsed.peak_memory_mb.max(peak);
            }
        } else if let Some(caps) = BRICKS_RE.captures(line) {
            if let Ok(total) = caps[1].parse::<u64>() {
                parsed.total_bricks = total;
            }
        }
    }
    parsed
}

/// Reads and parses one log file. Solver logs occasionally contain non-UTF-8
/// bytes, so the content is decoded lossily; only a filesystem failure is an
/// error.
pub fn parse_log_file(path: &Path, kind: LogKind) -> Result<ParsedLog, LogError> {
    let bytes = std::fs::read(path).map_err(|source| LogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(parse_lines(text.lines(), kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    MissingDirectory,
    MissingIteration,
    ExtraIteration,
    RunErrorLine,
    MissingCompletionMarker,
    MemoryDeviation,
    BricksDeviation,
    UnreadableLog,
}

/// One discrepancy contributing to a test's failure report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// Iteration the finding applies to, if any. Structural findings
    /// (missing directory, iteration set mismatch) carry none.
    pub iteration: Option<String>,
    pub message: String,
}

/// Pass/fail outcome plus the ordered findings for one test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub findings: Vec<Finding>,
}

impl Verdict {
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        Verdict {
            passed: findings.is_empty(),
            findings,
        }
    }

    /// Report body: newline-joined finding messages with a trailing newline,
    /// empty for a passing verdict.
    pub fn report_text(&self) -> String {
        if self.findings.is_empty() {
            return String::new();
        }
        let mut text = self
            .findings
            .iter()
            .map(|finding| finding.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_lines_recorded_in_run_mode_only() {
        let lines = ["ERROR: segmentation fault", "fatal error: oom"];
        let run = parse_lines(lines, LogKind::Run);
        assert_eq!(run.error_lines.len(), 2);
        assert_eq!(run.error_lines[0].line_number, 1);
        assert_eq!(run.error_lines[0].text, "ERROR: segmentation fault");
        assert_eq!(run.error_lines[1].line_number, 2);

        let reference = parse_lines(lines, LogKind::Reference);
        assert!(reference.error_lines.is_empty());
    }

    #[test]
    fn error_token_must_start_line_or_follow_whitespace() {
        let parsed = parse_lines(
            ["terrors everywhere", "preerror noise", "an error occurred"],
            LogKind::Run,
        );
        assert_eq!(parsed.error_lines.len(), 1);
        assert_eq!(parsed.error_lines[0].line_number, 3);
    }

    #[test]
    fn error_match_is_case_insensitive_but_text_is_original() {
        let parsed = parse_lines(["Solver Error: bad flux"], LogKind::Run);
        assert_eq!(parsed.error_lines[0].text, "Solver Error: bad flux");
    }

    #[test]
    fn completion_marker_is_case_sensitive_prefix_and_run_only() {
        assert!(parse_lines(["Solver finished at 10:00:00"], LogKind::Run).completed);
        assert!(!parse_lines(["solver finished at 10:00:00"], LogKind::Run).completed);
        assert!(!parse_lines(["  Solver finished at 10:00:00"], LogKind::Run).completed);
        assert!(!parse_lines(["Solver finished at 10:00:00"], LogKind::Reference).completed);
    }

    #[test]
    fn peak_memory_takes_maximum_across_observations() {
        let lines = [
            "Memory Working Set Current = 1.0 Mb, Memory Working Set Peak = 3.0 Mb",
            "Memory Working Set Current = 2.0 Mb, Memory Working Set Peak = 7.5 Mb",
            "Memory Working Set Current = 1.5 Mb, Memory Working Set Peak = 2.0 Mb",
        ];
        assert_eq!(parse_lines(lines, LogKind::Reference).peak_memory_mb, 7.5);
    }

    #[test]
    fn peak_memory_uses_second_capture_not_current() {
        let lines = ["Memory Working Set Current = 99.0 Mb, Memory Working Set Peak = 5.0 Mb"];
        assert_eq!(parse_lines(lines, LogKind::Run).peak_memory_mb, 5.0);
    }

    #[test]
    fn total_bricks_last_observation_wins() {
        let lines = [
            "MESH::Bricks: Total=10 Gas=1 Solid=2 Partial=3 Irregular=4",
            "MESH::Bricks: Total=15 Gas=1 Solid=2 Partial=3 Irregular=4",
        ];
        assert_eq!(parse_lines(lines, LogKind::Run).total_bricks, 15);
    }

    #[test]
    fn defaults_when_metrics_never_observed() {
        let parsed = parse_lines(["nothing interesting"], LogKind::Run);
        assert_eq!(parsed.peak_memory_mb, 0.0);
        assert_eq!(parsed.total_bricks, 0);
    }

    #[test]
    fn error_check_takes_priority_over_metric_patterns() {
        let line = "error Memory Working Set Current = 1.0 Mb, Memory Working Set Peak = 9.0 Mb";
        let run = parse_lines([line], LogKind::Run);
        assert_eq!(run.error_lines.len(), 1);
        assert_eq!(run.peak_memory_mb, 0.0);

        // Reference logs skip the error check, so the same line is a
        // memory observation there.
        let reference = parse_lines([line], LogKind::Reference);
        assert!(reference.error_lines.is_empty());
        assert_eq!(reference.peak_memory_mb, 9.0);
    }

    #[test]
    fn malformed_metric_lines_are_skipped() {
        let lines = [
            "Memory Working Set Current = x Mb, Memory Working Set Peak = y Mb",
            "MESH::Bricks: Total=abc Gas=1 Solid=2 Partial=3 Irregular=4",
        ];
        let parsed = parse_lines(lines, LogKind::Reference);
        assert_eq!(parsed, ParsedLog::default());
    }

    #[test]
    fn report_text_is_newline_joined_with_trailing_newline() {
        let verdict = Verdict::from_findings(vec![
            Finding {
                kind: FindingKind::RunErrorLine,
                iteration: Some("it1".to_string()),
                message: "it1/it1.stdout(5): ERROR: boom".to_string(),
            },
            Finding {
                kind: FindingKind::MissingCompletionMarker,
                iteration: Some("it1".to_string()),
                message: "it1/it1.stdout: missing 'Solver finished at'".to_string(),
            },
        ]);
        assert!(!verdict.passed);
        assert_eq!(
            verdict.report_text(),
            "it1/it1.stdout(5): ERROR: boom\nit1/it1.stdout: missing 'Solver finished at'\n"
        );
    }

    #[test]
    fn empty_verdict_passes_with_empty_report() {
        let verdict = Verdict::from_findings(Vec::new());
        assert!(verdict.passed);
        assert_eq!(verdict.report_text(), "");
    }

    #[test]
    fn parse_log_file_reports_io_failure() {
        let missing = Path::new("/nonexistent/ftcheck/it1.stdout");
        let err = parse_log_file(missing, LogKind::Run).expect_err("file is absent");
        let LogError::Io { path, .. } = err;
        assert_eq!(path, missing);
    }
}
