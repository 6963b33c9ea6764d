#![forbid(unsafe_code)]

pub mod equivalence;
mod logging;
mod pipeline;
pub mod scenario;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cp_backend::{
    ConversionBackend, DEFAULT_STRUCTURE_SUFFIX, DEFAULT_WEIGHTS_SUFFIX, LoopbackBackend,
    ProcessBackend, ProcessCommand,
};
use cp_core::{DenseTensor, OutputTuple};
use serde::Deserialize;
use serde_json::{Value, json};

pub use equivalence::{
    EquivalenceError, EquivalenceVerdict, Mismatch, ToleranceSpec, check_equivalence,
};
pub use logging::{STRUCTURED_LOG_SCHEMA_VERSION, StructuredCaseLog, outcome_label};
pub use pipeline::{
    SUITE_ID, ScenarioFailure, ScenarioReport, SuiteReport, artifact_path_for, run_registry,
    run_scenario,
};
pub use scenario::{CoverageAxis, ModelFamily, Scenario, ScenarioRegistry, ScenarioSetup};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const EQUIVALENCE_FIXTURE: &str = "equivalence_cases.json";

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub work_dir: PathBuf,
    pub fixture_root: PathBuf,
    pub tolerance: ToleranceSpec,
    pub converter_program: Option<PathBuf>,
    pub converter_args: Vec<String>,
    pub runner_program: Option<PathBuf>,
    pub runner_args: Vec<String>,
    pub structure_suffix: String,
    pub weights_suffix: String,
    /// `None` blocks until the converter exits.
    pub converter_timeout_millis: Option<u64>,
    pub keep_artifacts: bool,
}

impl HarnessConfig {
    /// Repository defaults, overridable through `CP_WORK_DIR`, `CP_CONVERTER`,
    /// `CP_TARGET_RUNNER` and `CP_CONVERTER_TIMEOUT_MS`.
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let (converter_program, converter_args) = env_command("CP_CONVERTER");
        let (runner_program, runner_args) = env_command("CP_TARGET_RUNNER");
        Self {
            work_dir: std::env::var_os("CP_WORK_DIR").map_or_else(
                || repo_root.join("artifacts/conversion_equivalence/work"),
                PathBuf::from,
            ),
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            tolerance: ToleranceSpec::default(),
            converter_program,
            converter_args,
            runner_program,
            runner_args,
            structure_suffix: DEFAULT_STRUCTURE_SUFFIX.to_string(),
            weights_suffix: DEFAULT_WEIGHTS_SUFFIX.to_string(),
            converter_timeout_millis: std::env::var("CP_CONVERTER_TIMEOUT_MS")
                .ok()
                .and_then(|raw| raw.trim().parse().ok()),
            keep_artifacts: false,
        }
    }

    /// Subprocess backend driven by the configured converter and runner.
    pub fn process_backend(&self) -> Result<ProcessBackend, String> {
        let converter = self.converter_program.as_ref().ok_or_else(|| {
            "process backend needs a converter; set CP_CONVERTER".to_string()
        })?;
        let runner = self.runner_program.as_ref().ok_or_else(|| {
            "process backend needs a target runner; set CP_TARGET_RUNNER".to_string()
        })?;
        Ok(ProcessBackend::new(
            ProcessCommand::new(converter.clone())
                .with_args(&self.converter_args)
                .with_timeout_millis(self.converter_timeout_millis),
            ProcessCommand::new(runner.clone()).with_args(&self.runner_args),
            self.work_dir.clone(),
        )
        .with_suffixes(self.structure_suffix.as_str(), self.weights_suffix.as_str()))
    }

    pub fn backend(&self, kind: BackendKind) -> Result<Box<dyn ConversionBackend>, String> {
        let backend: Box<dyn ConversionBackend> = match kind {
            BackendKind::Process => Box::new(self.process_backend()?),
            BackendKind::Loopback => Box::new(LoopbackBackend::new(self.work_dir.clone())),
        };
        Ok(backend)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Process,
    Loopback,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "process" => Ok(Self::Process),
            "loopback" => Ok(Self::Loopback),
            other => Err(format!(
                "unsupported backend '{other}'; expected process|loopback"
            )),
        }
    }
}

/// Splits `program arg arg ...` from an environment variable on whitespace.
fn env_command(key: &str) -> (Option<PathBuf>, Vec<String>) {
    std::env::var(key)
        .ok()
        .map_or((None, Vec::new()), |raw| split_command_line(&raw))
}

fn split_command_line(raw: &str) -> (Option<PathBuf>, Vec<String>) {
    let mut parts = raw.split_whitespace();
    let program = parts.next().map(PathBuf::from);
    (program, parts.map(str::to_string).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquivalenceCaseReport {
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub position_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl EquivalenceCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.expected == self.actual && self.position_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EquivalenceFixtureFile {
    cases: Vec<EquivalenceCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EquivalenceCase {
    name: String,
    reference: Vec<DenseTensor>,
    target: Vec<DenseTensor>,
    #[serde(default)]
    tolerance: Option<ToleranceSpec>,
    expected: String,
    #[serde(default)]
    expected_position: Option<usize>,
}

/// Checks the equivalence checker itself against hand-authored verdicts.
pub fn run_equivalence_fixture_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<EquivalenceCaseReport>), String> {
    let fixture: EquivalenceFixtureFile =
        load_fixture(&config.fixture_root.join(EQUIVALENCE_FIXTURE))?;
    let case_reports: Vec<EquivalenceCaseReport> = fixture
        .cases
        .iter()
        .map(|case| run_equivalence_case(config, case))
        .collect();

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(EquivalenceCaseReport::passed));
    Ok((
        HarnessReport {
            suite: "equivalence_checker",
            fixture_count: 1,
            cases_total,
            cases_passed,
        },
        case_reports,
    ))
}

fn run_equivalence_case(config: &HarnessConfig, case: &EquivalenceCase) -> EquivalenceCaseReport {
    let tolerance = case.tolerance.unwrap_or(config.tolerance);
    let reference = OutputTuple::new(case.reference.clone());
    let target = OutputTuple::new(case.target.clone());
    let (actual, position, detail) = match check_equivalence(&reference, &target, tolerance) {
        Ok(verdict) => (
            verdict.reason_code(),
            verdict.mismatch().and_then(Mismatch::position),
            serde_json::to_value(verdict.mismatch()).unwrap_or(Value::Null),
        ),
        Err(error) => (error.reason_code(), None, json!(error.to_string())),
    };
    let position_ok = case
        .expected_position
        .is_none_or(|expected| Some(expected) == position);
    let passed = case.expected == actual && position_ok;

    EquivalenceCaseReport {
        name: case.name.clone(),
        expected: case.expected.clone(),
        actual: actual.to_string(),
        position_ok,
        forensic_log: StructuredCaseLog::new(
            "equivalence_checker",
            case.name.as_str(),
            "checker",
            "fixture",
            0,
            vec![format!("crates/cp-conformance/fixtures/{EQUIVALENCE_FIXTURE}")],
            "cargo test -p cp-conformance equivalence_fixture_conformance_is_green -- --nocapture"
                .to_string(),
            passed,
            if passed { "verdict_ok" } else { "verdict_mismatch" },
        )
        .with_extra_fields(BTreeMap::from([
            ("expected_verdict".to_string(), json!(case.expected)),
            ("actual_verdict".to_string(), json!(actual)),
            ("tolerance".to_string(), json!(tolerance)),
            ("mismatch".to_string(), detail),
        ])),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
}

/// Writes one structured log line per scenario in `report`.
pub fn emit_suite_log(
    report: &SuiteReport,
    output_path: &Path,
) -> Result<SuiteForensicsSummary, String> {
    let mut lines = String::new();
    for scenario in &report.scenarios {
        let line = serde_json::to_string(&scenario.forensic_log)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    write_output(output_path, lines, "scenario log")?;

    Ok(SuiteForensicsSummary {
        output_path: output_path.to_path_buf(),
        log_entries: report.scenarios.len(),
        failed_entries: report
            .scenarios
            .iter()
            .filter(|scenario| !scenario.forensic_log.passed())
            .count(),
    })
}

/// Machine-readable summary of a suite run.
#[must_use]
pub fn suite_summary(report: &SuiteReport) -> Value {
    let scenarios: Vec<Value> = report
        .scenarios
        .iter()
        .map(|scenario| {
            json!({
                "name": scenario.name,
                "family": scenario.family.as_str(),
                "seed": scenario.seed,
                "outcome": outcome_label(scenario.passed()),
                "reason_code": scenario.reason_code(),
                "duration_ms": scenario.forensic_log.duration_ms,
                "detail": scenario.forensic_log.extra_fields.get("detail"),
            })
        })
        .collect();
    let status = if report.all_passed() { "ok" } else { "failed" };
    json!({
        "suite": report.suite,
        "backend": report.backend,
        "status": status,
        "scenarios_total": report.scenarios_total,
        "scenarios_passed": report.scenarios_passed,
        "exit_code": report.exit_code(),
        "scenarios": scenarios,
    })
}

pub fn emit_suite_report(report: &SuiteReport, output_path: &Path) -> Result<(), String> {
    let pretty = serde_json::to_string_pretty(&suite_summary(report))
        .map_err(|error| format!("failed to serialize suite report: {error}"))?;
    write_output(output_path, pretty, "suite report")
}

fn write_output(output_path: &Path, contents: String, what: &str) -> Result<(), String> {
    if let Some(parent) = output_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create {what} output dir {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, contents).map_err(|error| {
        format!("failed to write {what} {}: {error}", output_path.display())
    })
}

pub(crate) fn scenario_id(suite: &str, backend: &str, case_name: &str) -> String {
    format!("{suite}/{backend}:{}", canonical_case_name(case_name))
}

/// Lowercased name with everything outside `[a-z0-9_-]` replaced by `_`.
#[must_use]
pub fn canonical_case_name(case_name: &str) -> String {
    let mut out = String::with_capacity(case_name.len());
    for ch in case_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
