use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cp_backend::{
    ConversionBackend, ConversionError, ConvertedArtifact, InferenceError, LoopbackBackend,
};
use cp_conformance::{
    HarnessConfig, Mismatch, ScenarioFailure, ScenarioRegistry, SuiteReport, run_registry,
};
use cp_core::{DenseTensor, OutputTuple};

fn unique_work_dir(label: &str) -> PathBuf {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    std::env::temp_dir().join(format!(
        "cp_smoke_{label}_{}_{}",
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

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| (*name).to_string()).collect()
}

fn report_for<'a>(suite: &'a SuiteReport, name: &str) -> &'a cp_conformance::ScenarioReport {
    suite
        .scenarios
        .iter()
        .find(|report| report.name == name)
        .unwrap_or_else(|| panic!("no report for {name}"))
}

/// Loopback engine that perturbs one output position of one scenario.
struct CorruptingBackend {
    inner: LoopbackBackend,
    scenario_stem: &'static str,
    position: usize,
}

impl ConversionBackend for CorruptingBackend {
    fn name(&self) -> &'static str {
        "corrupting"
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
        let targeted = converted
            .structure_path()
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(self.scenario_stem));
        if !targeted {
            return Ok(outputs);
        }
        let tensors = outputs
            .into_tensors()
            .into_iter()
            .enumerate()
            .map(|(position, tensor)| {
                if position == self.position {
                    tensor.map(|value| value + 1e-2 * (1.0 + value.abs()))
                } else {
                    tensor
                }
            })
            .collect();
        Ok(OutputTuple::new(tensors))
    }
}

/// Loopback engine whose converter refuses one artifact.
struct RefusingBackend {
    inner: LoopbackBackend,
    refused_stem: &'static str,
}

impl ConversionBackend for RefusingBackend {
    fn name(&self) -> &'static str {
        "refusing"
    }

    fn convert(
        &self,
        artifact_path: &Path,
        input_shapes: &[Vec<usize>],
    ) -> Result<ConvertedArtifact, ConversionError> {
        if artifact_path
            .file_stem()
            .is_some_and(|stem| stem == self.refused_stem)
        {
            return Err(ConversionError::MissingOutput {
                path: artifact_path.display().to_string(),
            });
        }
        self.inner.convert(artifact_path, input_shapes)
    }

    fn infer(
        &self,
        converted: &ConvertedArtifact,
        inputs: &[DenseTensor],
    ) -> Result<OutputTuple, InferenceError> {
        self.inner.infer(converted, inputs)
    }
}

#[test]
fn builtin_registry_is_equivalent_on_loopback() {
    let dir = unique_work_dir("loopback");
    let cfg = config_in(&dir);
    let registry = ScenarioRegistry::builtin();
    let suite = run_registry(&registry, &[], &LoopbackBackend::new(dir.clone()), &cfg)
        .expect("suite should run");

    let failing: Vec<_> = suite
        .failures()
        .map(|report| format!("{}: {:?}", report.name, report.result))
        .collect();
    assert!(failing.is_empty(), "{failing:?}");
    assert_eq!(suite.scenarios_total, registry.len());
    assert_eq!(suite.scenarios_total, suite.scenarios_passed);
    assert_eq!(suite.exit_code(), 0);

    let bn = report_for(&suite, "f_batch_norm");
    let verdict = bn.result.as_ref().expect("verdict");
    assert_eq!(verdict.pairs_checked(), 3);
    let deform = report_for(&suite, "torchvision_deform_conv2d");
    assert_eq!(deform.result.as_ref().expect("verdict").pairs_checked(), 2);

    let leftovers = std::fs::read_dir(&dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "artifacts should be disposed after each run");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wrong_second_deform_output_fails_the_suite() {
    let dir = unique_work_dir("corrupt");
    let cfg = config_in(&dir);
    let backend = CorruptingBackend {
        inner: LoopbackBackend::new(dir.clone()),
        scenario_stem: "torchvision_deform_conv2d",
        position: 1,
    };
    let suite = run_registry(
        &ScenarioRegistry::builtin(),
        &names(&["torchvision_deform_conv2d", "f_batch_norm"]),
        &backend,
        &cfg,
    )
    .expect("suite should run");

    assert_eq!(suite.exit_code(), 1);
    assert!(report_for(&suite, "f_batch_norm").passed());
    let deform = report_for(&suite, "torchvision_deform_conv2d");
    let verdict = deform.result.as_ref().expect("both executions succeed");
    assert!(!verdict.passed());
    assert_eq!(verdict.pairs_checked(), 2);
    assert!(matches!(
        verdict.mismatch(),
        Some(Mismatch::Numeric { position: 1, .. })
    ));
    assert_eq!(deform.forensic_log.outcome, "fail");
    assert_eq!(deform.forensic_log.reason_code, "numeric_mismatch");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn batch_norm_instances_fail_independently() {
    let dir = unique_work_dir("bn_positions");
    let cfg = config_in(&dir);
    for position in 0..3 {
        let backend = CorruptingBackend {
            inner: LoopbackBackend::new(dir.clone()),
            scenario_stem: "f_batch_norm.",
            position,
        };
        let suite = run_registry(
            &ScenarioRegistry::builtin(),
            &names(&["f_batch_norm"]),
            &backend,
            &cfg,
        )
        .expect("suite should run");
        let verdict = suite.scenarios[0].result.as_ref().expect("verdict");
        assert_eq!(
            verdict.mismatch().and_then(Mismatch::position),
            Some(position),
            "regression in output #{position} must be reported there"
        );
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn conversion_failure_aborts_only_its_own_scenario() {
    let dir = unique_work_dir("refuse");
    let cfg = config_in(&dir);
    let backend = RefusingBackend {
        inner: LoopbackBackend::new(dir.clone()),
        refused_stem: "deform_conv2d_offset_only",
    };
    let suite = run_registry(
        &ScenarioRegistry::builtin(),
        &names(&[
            "f_batch_norm_single_channel",
            "deform_conv2d_offset_only",
            "deform_conv2d_with_mask",
        ]),
        &backend,
        &cfg,
    )
    .expect("suite should run");

    assert_eq!(suite.scenarios_total, 3);
    assert_eq!(suite.scenarios_passed, 2);
    assert_eq!(suite.exit_code(), 1);
    let refused = report_for(&suite, "deform_conv2d_offset_only");
    assert!(matches!(refused.result, Err(ScenarioFailure::Conversion(_))));
    assert_eq!(refused.reason_code(), "conversion_failed");
    assert_eq!(refused.forensic_log.reason_code, "conversion_failed");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn reruns_and_reordering_reproduce_reference_outputs() {
    let dir = unique_work_dir("repeat");
    let cfg = config_in(&dir);
    let registry = ScenarioRegistry::builtin();
    let backend = LoopbackBackend::new(dir.clone());
    let forward = run_registry(
        &registry,
        &names(&["f_batch_norm_without_affine", "deform_conv2d_with_mask"]),
        &backend,
        &cfg,
    )
    .expect("first run");
    let reversed = run_registry(
        &registry,
        &names(&["deform_conv2d_with_mask", "f_batch_norm_without_affine"]),
        &backend,
        &cfg,
    )
    .expect("second run");

    for name in ["f_batch_norm_without_affine", "deform_conv2d_with_mask"] {
        let a = report_for(&forward, name);
        let b = report_for(&reversed, name);
        assert_eq!(a.result, b.result);
        for key in ["reference_fingerprint", "graph_hash"] {
            let value = a.forensic_log.extra_fields.get(key).expect(key);
            assert!(!value.is_null(), "{key} should be recorded");
            assert_eq!(Some(value), b.forensic_log.extra_fields.get(key));
        }
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn process_backend_failures_surface_as_scenario_outcomes() {
    let dir = unique_work_dir("process");
    std::fs::create_dir_all(&dir).expect("work dir");

    // converter that produces nothing
    let silent = HarnessConfig {
        converter_program: Some(PathBuf::from("sh")),
        converter_args: names(&["-c", "exit 0", "converter"]),
        runner_program: Some(PathBuf::from("sh")),
        runner_args: names(&["-c", "cat >/dev/null", "runner"]),
        ..config_in(&dir)
    };
    let suite = run_registry(
        &ScenarioRegistry::builtin(),
        &names(&["f_batch_norm_single_channel"]),
        &silent.process_backend().expect("backend"),
        &silent,
    )
    .expect("suite should run");
    assert!(matches!(
        suite.scenarios[0].result,
        Err(ScenarioFailure::Conversion(ConversionError::MissingOutput { .. }))
    ));

    // converter that writes placeholders and a runner that reports no outputs
    let placeholder = HarnessConfig {
        converter_args: names(&[
            "-c",
            "stem=$(basename \"$1\" .cpa); : > \"$stem.ncnn.param\"; : > \"$stem.ncnn.bin\"",
            "converter",
        ]),
        runner_args: names(&["-c", "cat >/dev/null; echo '{\"outputs\":[]}'", "runner"]),
        ..silent
    };
    let suite = run_registry(
        &ScenarioRegistry::builtin(),
        &names(&["f_batch_norm_single_channel"]),
        &placeholder.process_backend().expect("backend"),
        &placeholder,
    )
    .expect("suite should run");
    let verdict = suite.scenarios[0]
        .result
        .as_ref()
        .expect("both executions succeed");
    assert_eq!(verdict.reason_code(), "length_mismatch");
    assert_eq!(suite.exit_code(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}
