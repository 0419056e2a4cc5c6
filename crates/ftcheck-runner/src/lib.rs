use anyhow::{anyhow, Context, Result};
use ftcheck_core::{
    parse_log_file, Finding, FindingKind, LogError, LogKind, ParsedLog, Verdict,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info};
use walkdir::WalkDir;

pub const REFERENCE_DIR: &str = "ft_reference";
pub const RUN_DIR: &str = "ft_run";
pub const REPORT_FILE: &str = "report.txt";

/// Relative-difference thresholds for the metric checks.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tolerances {
    pub max_memory_diff: f64,
    pub max_bricks_diff: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            max_memory_diff: 0.5,
            max_bricks_diff: 0.1,
        }
    }
}

/// Treats `reference_total` as authoritative whenever a run log reports
/// exactly `run_total` bricks. Used to paper over known-bad reference
/// artifacts without widening the general tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BricksOverride {
    pub run_total: u64,
    pub reference_total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckConfig {
    pub tolerances: Tolerances,
    /// Worker pool size. Defaults to half the available cores.
    pub jobs: Option<usize>,
    pub bricks_overrides: Vec<BricksOverride>,
}

impl CheckConfig {
    pub fn load(path: &Path) -> Result<CheckConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config: {}", path.display()))?;
        let config: CheckConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_memory_diff", self.tolerances.max_memory_diff),
            ("max_bricks_diff", self.tolerances.max_bricks_diff),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!(
                    "config: {} must be a positive finite number, got {}",
                    name,
                    value
                ));
            }
        }
        if self.jobs == Some(0) {
            return Err(anyhow!("config: jobs must be at least 1"));
        }
        let mut seen = BTreeSet::new();
        for entry in &self.bricks_overrides {
            if !seen.insert(entry.run_total) {
                return Err(anyhow!(
                    "config: duplicate bricks override for run total {}",
                    entry.run_total
                ));
            }
        }
        Ok(())
    }
}

/// Evaluates one test directory against its reference. Every failure mode,
/// including unreadable files, surfaces as a finding; this never errors.
pub fn evaluate_test(test_dir: &Path, config: &CheckConfig) -> Verdict {
    let mut findings = Vec::new();
    let run_dir = test_dir.join(RUN_DIR);
    let reference_dir = test_dir.join(REFERENCE_DIR);
    if !run_dir.is_dir() {
        findings.push(structural(
            FindingKind::MissingDirectory,
            format!("directory missing: {}", RUN_DIR),
        ));
    }
    if !reference_dir.is_dir() {
        findings.push(structural(
            FindingKind::MissingDirectory,
            format!("directory missing: {}", REFERENCE_DIR),
        ));
    }
    if !findings.is_empty() {
        return Verdict::from_findings(findings);
    }

    let reference_names = match list_entry_names(&reference_dir) {
        Ok(names) => names,
        Err(err) => {
            findings.push(structural(
                FindingKind::UnreadableLog,
                format!("{}: cannot read: {}", REFERENCE_DIR, err),
            ));
            BTreeSet::new()
        }
    };
    let run_names = match list_entry_names(&run_dir) {
        Ok(names) => names,
        Err(err) => {
            findings.push(structural(
                FindingKind::UnreadableLog,
                format!("{}: cannot read: {}", RUN_DIR, err),
            ));
            BTreeSet::new()
        }
    };
    if !findings.is_empty() {
        return Verdict::from_findings(findings);
    }

    let missing_in_run: Vec<&String> = reference_names.difference(&run_names).collect();
    if !missing_in_run.is_empty() {
        findings.push(structural(
            FindingKind::MissingIteration,
            format!(
                "In ft_run there are missing files present in ft_reference: {}",
                join_iteration_files(&missing_in_run)
            ),
        ));
    }
    let extra_in_run: Vec<&String> = run_names.difference(&reference_names).collect();
    if !extra_in_run.is_empty() {
        findings.push(structural(
            FindingKind::ExtraIteration,
            format!(
                "In ft_run there are extra files not present in ft_reference: {}",
                join_iteration_files(&extra_in_run)
            ),
        ));
    }
    if !findings.is_empty() {
        return Verdict::from_findings(findings);
    }

    for name in &reference_names {
        check_iteration(test_dir, name, config, &mut findings);
    }
    Verdict::from_findings(findings)
}

fn structural(kind: FindingKind, message: String) -> Finding {
    Finding {
        kind,
        iteration: None,
        message,
    }
}

fn list_entry_names(dir: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        names.insert(entry?.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

fn join_iteration_files(names: &[&String]) -> String {
    names
        .iter()
        .map(|name| format!("'{}/{}.stdout'", name, name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn check_iteration(
    test_dir: &Path,
    name: &str,
    config: &CheckConfig,
    findings: &mut Vec<Finding>,
) {
    let stdout_name = format!("{}.stdout", name);
    let rel = format!("{}/{}", name, stdout_name);
    let run_path = test_dir.join(RUN_DIR).join(name).join(&stdout_name);
    let reference_path = test_dir.join(REFERENCE_DIR).join(name).join(&stdout_name);

    let run = match parse_log_file(&run_path, LogKind::Run) {
        Ok(parsed) => parsed,
        Err(LogError::Io { source, .. }) => {
            findings.push(iteration_finding(
                FindingKind::UnreadableLog,
                name,
                format!("{}: cannot read: {}", rel, source),
            ));
            return;
        }
    };
    let reference = match parse_log_file(&reference_path, LogKind::Reference) {
        Ok(parsed) => parsed,
        Err(LogError::Io { source, .. }) => {
            findings.push(iteration_finding(
                FindingKind::UnreadableLog,
                name,
                format!("{}: cannot read: {}", rel, source),
            ));
            return;
        }
    };

    for error_line in &run.error_lines {
        findings.push(iteration_finding(
            FindingKind::RunErrorLine,
            name,
            format!("{}({}): {}", rel, error_line.line_number, error_line.text),
        ));
    }
    if !run.completed {
        findings.push(iteration_finding(
            FindingKind::MissingCompletionMarker,
            name,
            format!("{}: missing '{}'", rel, ftcheck_core::COMPLETION_PREFIX),
        ));
    }
    check_memory(name, &rel, &run, &reference, config, findings);
    check_bricks(name, &rel, &run, &reference, config, findings);
}

fn check_memory(
    name: &str,
    rel: &str,
    run: &ParsedLog,
    reference: &ParsedLog,
    config: &CheckConfig,
    findings: &mut Vec<Finding>,
) {
    let criterion = config.tolerances.max_memory_diff;
    let diff = rel_diff(run.peak_memory_mb, reference.peak_memory_mb);
    if !exceeds(diff, run.peak_memory_mb, criterion) {
        return;
    }
    findings.push(iteration_finding(
        FindingKind::MemoryDeviation,
        name,
        format!(
            "{}: different 'Memory Working Set Peak' (ft_run={}, ft_reference={}, rel.diff={}, criterion={})",
            rel,
            run.peak_memory_mb,
            reference.peak_memory_mb,
            diff_text(diff),
            criterion
        ),
    ));
}

fn check_bricks(
    name: &str,
    rel: &str,
    run: &ParsedLog,
    reference: &ParsedLog,
    config: &CheckConfig,
    findings: &mut Vec<Finding>,
) {
    let mut reference_total = reference.total_bricks;
    if let Some(entry) = config
        .bricks_overrides
        .iter()
        .find(|entry| entry.run_total == run.total_bricks)
    {
        reference_total = entry.reference_total;
    }
    let criterion = config.tolerances.max_bricks_diff;
    let diff = rel_diff(run.total_bricks as f64, reference_total as f64);
    if !exceeds(diff, run.total_bricks as f64, criterion) {
        return;
    }
    findings.push(iteration_finding(
        FindingKind::BricksDeviation,
        name,
        format!(
            "{}: different 'Total' of bricks (ft_run={}, ft_reference={}, rel.diff={}, criterion={})",
            rel,
            run.total_bricks,
            reference_total,
            diff_text(diff),
            criterion
        ),
    ));
}

fn iteration_finding(kind: FindingKind, name: &str, message: String) -> Finding {
    Finding {
        kind,
        iteration: Some(name.to_string()),
        message,
    }
}

/// Relative difference rounded to two decimals, or None when the reference
/// value is zero and no ratio exists.
fn rel_diff(run: f64, reference: f64) -> Option<f64> {
    if reference == 0.0 {
        return None;
    }
    Some(round2((run - reference) / reference))
}

/// A zero reference with a non-zero run value is always a deviation; when
/// both sides are zero there is nothing to compare.
fn exceeds(diff: Option<f64>, run_value: f64, criterion: f64) -> bool {
    match diff {
        Some(diff) => diff.abs() > criterion,
        None => run_value != 0.0,
    }
}

fn diff_text(diff: Option<f64>) -> String {
    match diff {
        Some(diff) => format!("{:.2}", diff),
        None => "n/a".to_string(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTest {
    pub experiment: String,
    pub test: String,
    pub path: PathBuf,
}

impl DiscoveredTest {
    /// Console label, `<experiment>/<test>/`.
    pub fn label(&self) -> String {
        format!("{}/{}/", self.experiment, self.test)
    }
}

/// Lists test directories under the logs root: first-level subdirectories
/// are experiments, second-level are tests.
pub fn discover_tests(root: &Path) -> Result<Vec<DiscoveredTest>> {
    if !root.is_dir() {
        return Err(anyhow!("logs root is not a directory: {}", root.display()));
    }
    let mut tests = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let test = entry.file_name().to_string_lossy().to_string();
        let experiment = entry
            .path()
            .parent()
            .and_then(|parent| parent.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        tests.push(DiscoveredTest {
            experiment,
            test,
            path: entry.into_path(),
        });
    }
    debug!(count = tests.len(), "discovered tests");
    Ok(tests)
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub experiment: String,
    pub test: String,
    pub passed: bool,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Per-test results, sorted by experiment then test name.
    pub tests: Vec<TestReport>,
}

/// Worker pool size: the explicit request if any, otherwise half the
/// available cores, never less than one.
pub fn worker_count(requested: Option<usize>) -> usize {
    if let Some(jobs) = requested {
        return jobs.max(1);
    }
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cores / 2).max(1)
}

/// Evaluates every discovered test on a fixed-size worker pool. Each test's
/// report file is written by the worker that evaluated it; the collector
/// emits one buffered console block per test (summary line plus report text
/// on failure) so concurrent completions never interleave.
pub fn run_batch(root: &Path, config: &CheckConfig, out: &mut impl Write) -> Result<BatchReport> {
    let tests = discover_tests(root)?;
    let jobs = worker_count(config.jobs).min(tests.len()).max(1);
    debug!(jobs, tests = tests.len(), "starting batch");

    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(TestReport, String)>();
    let mut reports = Vec::with_capacity(tests.len());
    thread::scope(|scope| -> Result<()> {
        for _ in 0..jobs {
            let tx = tx.clone();
            let cursor = &cursor;
            let tests = &tests;
            scope.spawn(move || loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(test) = tests.get(index) else {
                    break;
                };
                if tx.send(check_one(test, config)).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        for (report, block) in rx {
            out.write_all(block.as_bytes())
                .context("cannot write console output")?;
            reports.push(report);
        }
        Ok(())
    })?;

    reports.sort_by(|a, b| (&a.experiment, &a.test).cmp(&(&b.experiment, &b.test)));
    let passed = reports.iter().filter(|report| report.passed).count();
    let summary = BatchReport {
        total: reports.len(),
        passed,
        failed: reports.len() - passed,
        tests: reports,
    };
    info!(
        total = summary.total,
        passed = summary.passed,
        failed = summary.failed,
        "batch complete"
    );
    Ok(summary)
}

/// Evaluates one test, persists its report file, and returns the result
/// paired with the fully buffered console block.
fn check_one(test: &DiscoveredTest, config: &CheckConfig) -> (TestReport, String) {
    let verdict = evaluate_test(&test.path, config);
    let report_text = verdict.report_text();
    let label = test.label();
    let report = TestReport {
        experiment: test.experiment.clone(),
        test: test.test.clone(),
        passed: verdict.passed,
        findings: verdict.findings,
    };
    if let Err(err) = fs::write(test.path.join(REPORT_FILE), &report_text) {
        let block = format!("FAIL: {}\ncannot write report: {}\n", label, err);
        let report = TestReport {
            passed: false,
            ..report
        };
        return (report, block);
    }
    let block = if report.passed {
        format!("OK: {}\n", label)
    } else {
        format!("FAIL: {}\n{}", label, report_text)
    };
    (report, block)
}
