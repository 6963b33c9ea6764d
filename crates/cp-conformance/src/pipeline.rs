//! Scenario orchestration: reference run, export, conversion, target run and
//! comparison, strictly in that order and one scenario at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use cp_backend::{ConversionBackend, ConversionError, ConvertedArtifact, InferenceError};
use cp_core::det64_label;
use cp_export::{ARTIFACT_EXTENSION, ExportError, export_model};
use cp_graph::{ExecError, ReferenceExecutor};
use serde_json::{Value, json};

use crate::equivalence::{EquivalenceError, EquivalenceVerdict, check_equivalence};
use crate::logging::StructuredCaseLog;
use crate::scenario::{ModelFamily, Scenario, ScenarioRegistry};
use crate::{HarnessConfig, canonical_case_name, summarize_passes};

pub const SUITE_ID: &str = "conversion_equivalence";

/// Why a scenario stopped before a verdict could be issued.
#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioFailure {
    Setup { diagnostic: String },
    Reference(ExecError),
    Export(ExportError),
    Conversion(ConversionError),
    Inference(InferenceError),
    Comparison(EquivalenceError),
}

impl ScenarioFailure {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup_failed",
            Self::Reference(_) => "reference_failed",
            Self::Export(_) => "export_failed",
            Self::Conversion(_) => "conversion_failed",
            Self::Inference(_) => "inference_failed",
            Self::Comparison(error) => error.reason_code(),
        }
    }
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup { diagnostic } => write!(f, "{diagnostic}"),
            Self::Reference(error) => write!(f, "reference execution failed: {error}"),
            Self::Export(error) => write!(f, "export failed: {error}"),
            Self::Conversion(error) => write!(f, "{error}"),
            Self::Inference(error) => write!(f, "{error}"),
            Self::Comparison(error) => write!(f, "comparison failed: {error}"),
        }
    }
}

impl std::error::Error for ScenarioFailure {}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub name: String,
    pub family: ModelFamily,
    pub seed: u64,
    pub result: Result<EquivalenceVerdict, ScenarioFailure>,
    pub artifact_path: PathBuf,
    pub forensic_log: StructuredCaseLog,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result
            .as_ref()
            .is_ok_and(EquivalenceVerdict::passed)
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match &self.result {
            Ok(verdict) => verdict.reason_code(),
            Err(failure) => failure.reason_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub backend: String,
    pub scenarios_total: usize,
    pub scenarios_passed: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.scenarios_total > 0 && self.scenarios_total == self.scenarios_passed
    }

    /// 0 when every compared output was equivalent, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() { 0 } else { 1 }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios.iter().filter(|report| !report.passed())
    }
}

/// Artifact location for `scenario`; distinct per scenario by registry validation.
#[must_use]
pub fn artifact_path_for(work_dir: &Path, scenario: &Scenario) -> PathBuf {
    work_dir.join(format!(
        "{}.{ARTIFACT_EXTENSION}",
        canonical_case_name(scenario.name())
    ))
}

/// What a run learned before it stopped, kept for the forensic log.
#[derive(Debug, Default)]
struct RunTrail {
    input_shapes: Vec<Vec<usize>>,
    reference_shapes: Option<Vec<Vec<usize>>>,
    reference_fingerprint: Option<u64>,
    graph_hash: Option<String>,
    converted: Option<ConvertedArtifact>,
    target_shapes: Option<Vec<Vec<usize>>>,
}

/// Runs one scenario end to end. Failures are captured in the report, never
/// propagated, so one broken scenario cannot take down the suite.
pub fn run_scenario(
    scenario: &Scenario,
    backend: &dyn ConversionBackend,
    config: &HarnessConfig,
) -> ScenarioReport {
    let started = Instant::now();
    let artifact_path = artifact_path_for(&config.work_dir, scenario);
    let mut trail = RunTrail::default();
    let result = execute(scenario, backend, config, &artifact_path, &mut trail);

    if !config.keep_artifacts {
        remove_quietly(&artifact_path);
        if let Some(converted) = &trail.converted {
            for path in converted.paths() {
                remove_quietly(path);
            }
        }
    }

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let forensic_log = scenario_log(
        scenario,
        backend.name(),
        config,
        &artifact_path,
        &trail,
        &result,
    )
    .with_duration_ms(duration_ms);

    ScenarioReport {
        name: scenario.name().to_string(),
        family: scenario.family(),
        seed: scenario.seed(),
        result,
        artifact_path,
        forensic_log,
    }
}

/// Runs the scenarios named in `names` (all when empty) in registry order.
pub fn run_registry(
    registry: &ScenarioRegistry,
    names: &[String],
    backend: &dyn ConversionBackend,
    config: &HarnessConfig,
) -> Result<SuiteReport, String> {
    let selected = registry.select(names)?;
    fs::create_dir_all(&config.work_dir).map_err(|error| {
        format!(
            "failed creating work dir {}: {error}",
            config.work_dir.display()
        )
    })?;

    let scenarios: Vec<ScenarioReport> = selected
        .iter()
        .map(|scenario| run_scenario(scenario, backend, config))
        .collect();
    let (scenarios_total, scenarios_passed) =
        summarize_passes(scenarios.iter().map(ScenarioReport::passed));

    Ok(SuiteReport {
        suite: SUITE_ID,
        backend: backend.name().to_string(),
        scenarios_total,
        scenarios_passed,
        scenarios,
    })
}

fn execute(
    scenario: &Scenario,
    backend: &dyn ConversionBackend,
    config: &HarnessConfig,
    artifact_path: &Path,
    trail: &mut RunTrail,
) -> Result<EquivalenceVerdict, ScenarioFailure> {
    let setup = scenario
        .setup()
        .map_err(|diagnostic| ScenarioFailure::Setup { diagnostic })?;
    trail.input_shapes = setup.input_shapes();

    let reference = ReferenceExecutor::default()
        .run(&setup.model, &setup.inputs)
        .map_err(ScenarioFailure::Reference)?;
    trail.reference_shapes = Some(reference.shapes());
    trail.reference_fingerprint = Some(reference.fingerprint64());

    let artifact =
        export_model(&setup.model, &setup.inputs, artifact_path).map_err(ScenarioFailure::Export)?;
    trail.graph_hash = Some(artifact.graph_hash().to_string());

    let converted = backend
        .convert(artifact_path, &trail.input_shapes)
        .map_err(ScenarioFailure::Conversion)?;
    trail.converted = Some(converted.clone());

    let target = backend
        .infer(&converted, &setup.inputs)
        .map_err(ScenarioFailure::Inference)?;
    trail.target_shapes = Some(target.shapes());

    check_equivalence(&reference, &target, config.tolerance).map_err(ScenarioFailure::Comparison)
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        let _ = fs::remove_file(path);
    }
}

fn scenario_log(
    scenario: &Scenario,
    backend: &str,
    config: &HarnessConfig,
    artifact_path: &Path,
    trail: &RunTrail,
    result: &Result<EquivalenceVerdict, ScenarioFailure>,
) -> StructuredCaseLog {
    let mut artifact_refs = vec![artifact_path.display().to_string()];
    if let Some(converted) = &trail.converted {
        artifact_refs.extend(converted.paths().iter().map(|path| path.display().to_string()));
    }

    let mut extra_fields = BTreeMap::from([
        ("tolerance".to_string(), json!(config.tolerance)),
        (
            "coverage_axes".to_string(),
            json!(
                scenario
                    .axes()
                    .iter()
                    .map(|axis| axis.as_str())
                    .collect::<Vec<_>>()
            ),
        ),
        ("input_shapes".to_string(), json!(trail.input_shapes)),
        ("reference_shapes".to_string(), json!(trail.reference_shapes)),
        ("target_shapes".to_string(), json!(trail.target_shapes)),
        (
            "reference_fingerprint".to_string(),
            json!(trail.reference_fingerprint.map(det64_label)),
        ),
        ("graph_hash".to_string(), json!(trail.graph_hash)),
        ("artifacts_kept".to_string(), json!(config.keep_artifacts)),
    ]);
    match result {
        Ok(verdict) => {
            extra_fields.insert("pairs_checked".to_string(), json!(verdict.pairs_checked()));
            extra_fields.insert(
                "mismatch".to_string(),
                serde_json::to_value(verdict.mismatch()).unwrap_or(Value::Null),
            );
            if let Some(mismatch) = verdict.mismatch() {
                extra_fields.insert("detail".to_string(), json!(mismatch.to_string()));
            }
        }
        Err(failure) => {
            extra_fields.insert("detail".to_string(), json!(failure.to_string()));
        }
    }

    let (passed, reason_code) = match result {
        Ok(verdict) => (verdict.passed(), verdict.reason_code()),
        Err(failure) => (false, failure.reason_code()),
    };
    StructuredCaseLog::new(
        SUITE_ID,
        scenario.name(),
        scenario.family().as_str(),
        backend,
        scenario.seed(),
        artifact_refs,
        format!(
            "cargo run -p cp-conformance --bin run_scenarios -- --backend {backend} --scenario {} --keep-artifacts",
            scenario.name()
        ),
        passed,
        reason_code,
    )
    .with_extra_fields(extra_fields)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    use cp_backend::{
        ConversionBackend, ConversionError, ConvertedArtifact, InferenceError, LoopbackBackend,
    };
    use cp_core::{DenseTensor, OutputTuple};

    use super::{ScenarioFailure, artifact_path_for, run_registry, run_scenario};
    use crate::HarnessConfig;
    use crate::scenario::ScenarioRegistry;

    fn unique_temp_dir(label: &str) -> PathBuf {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis());
        std::env::temp_dir().join(format!(
            "cp_pipeline_{label}_{}_{}",
            std::process::id(),
            now_ms
        ))
    }

    fn config_in(dir: &Path) -> HarnessConfig {
        HarnessConfig {
            work_dir: dir.to_path_buf(),
            ..HarnessConfig::default_paths()
        }
    }

    /// Returns zeros of the right shapes instead of the model's outputs.
    struct ZeroBackend {
        inner: LoopbackBackend,
    }

    impl ConversionBackend for ZeroBackend {
        fn name(&self) -> &'static str {
            "zeros"
        }

        fn convert(
            &self,
            artifact_path: &Path,
            input_shapes: &[Vec<usize>],
        ) -> Result<ConvertedArtifact, ConversionError> {
            self.inner.convert(artifact_path, input_shapes)
        }

        fn infer(
            &self,
            converted: &ConvertedArtifact,
            inputs: &[DenseTensor],
        ) -> Result<OutputTuple, InferenceError> {
            let outputs = self.inner.infer(converted, inputs)?;
            Ok(OutputTuple::new(
                outputs
                    .iter()
                    .map(|tensor| tensor.map(|_| 0.0))
                    .collect(),
            ))
        }
    }

    #[test]
    fn loopback_run_passes_and_cleans_up() {
        let dir = unique_temp_dir("clean");
        let config = config_in(&dir);
        let registry = ScenarioRegistry::builtin();
        let scenario = registry.get("f_batch_norm_single_channel").expect("scenario");
        let backend = LoopbackBackend::new(dir.clone());

        let report = run_scenario(scenario, &backend, &config);
        assert!(report.passed(), "{:?}", report.result);
        assert_eq!(report.reason_code(), "equivalent");
        assert!(!report.artifact_path.exists());
        assert_eq!(report.forensic_log.reason_code, "equivalent");
        assert_eq!(
            report.forensic_log.scenario_id,
            "conversion_equivalence/loopback:f_batch_norm_single_channel"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn keep_artifacts_leaves_the_artifact_trail_on_disk() {
        let dir = unique_temp_dir("keep");
        let config = HarnessConfig {
            keep_artifacts: true,
            ..config_in(&dir)
        };
        let registry = ScenarioRegistry::builtin();
        let scenario = registry.get("f_batch_norm_without_affine").expect("scenario");
        let report = run_scenario(scenario, &LoopbackBackend::new(dir.clone()), &config);

        assert!(report.passed());
        assert_eq!(report.artifact_path, artifact_path_for(&dir, scenario));
        for reference in &report.forensic_log.artifact_refs {
            assert!(Path::new(reference).is_file(), "missing {reference}");
        }
        assert_eq!(report.forensic_log.artifact_refs.len(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wrong_target_values_yield_a_negative_verdict_not_a_failure() {
        let dir = unique_temp_dir("zeros");
        let config = config_in(&dir);
        let backend = ZeroBackend {
            inner: LoopbackBackend::new(dir.clone()),
        };
        let registry = ScenarioRegistry::builtin();
        let suite = run_registry(&registry, &["f_batch_norm".to_string()], &backend, &config)
            .expect("suite");

        assert_eq!(suite.exit_code(), 1);
        let report = &suite.scenarios[0];
        let verdict = report.result.as_ref().expect("verdict is issued");
        assert!(!verdict.passed());
        assert_eq!(report.reason_code(), "numeric_mismatch");
        assert!(report.forensic_log.extra_fields.contains_key("mismatch"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unwritable_work_dir_surfaces_as_export_failure() {
        let dir = unique_temp_dir("blocked");
        std::fs::create_dir_all(dir.parent().expect("parent")).expect("temp root");
        std::fs::write(&dir, b"not a directory").expect("blocker file");
        let config = config_in(&dir);
        let registry = ScenarioRegistry::builtin();
        let scenario = registry.get("f_batch_norm_single_channel").expect("scenario");

        let report = run_scenario(scenario, &LoopbackBackend::new(dir.clone()), &config);
        assert!(matches!(report.result, Err(ScenarioFailure::Export(_))));
        assert_eq!(report.forensic_log.reason_code, "export_failed");
        assert_eq!(report.forensic_log.outcome, "fail");
        let _ = std::fs::remove_file(&dir);
    }
}
