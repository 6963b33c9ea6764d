#![forbid(unsafe_code)]

mod loopback;
mod process;

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use cp_core::{DenseTensor, OutputTuple};
use serde::{Deserialize, Serialize};

pub use loopback::LoopbackBackend;
pub use process::{ProcessCommand, ProcessError};

use process::{DIAGNOSTIC_BYTES, bounded_diagnostic, last_non_empty_line, run_process};

pub const DEFAULT_STRUCTURE_SUFFIX: &str = "ncnn.param";
pub const DEFAULT_WEIGHTS_SUFFIX: &str = "ncnn.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    Process(ProcessError),
    MissingOutput { path: String },
    InvalidArtifact { diagnostic: String },
    ShapeMismatch {
        declared: Vec<Vec<usize>>,
        requested: Vec<Vec<usize>>,
    },
    Io { path: String, diagnostic: String },
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(error) => write!(f, "converter failed: {error}"),
            Self::MissingOutput { path } => {
                write!(f, "converter exited cleanly but did not produce {path}")
            }
            Self::InvalidArtifact { diagnostic } => {
                write!(f, "portable artifact rejected: {diagnostic}")
            }
            Self::ShapeMismatch {
                declared,
                requested,
            } => write!(
                f,
                "requested input shapes {requested:?} do not match artifact inputs {declared:?}"
            ),
            Self::Io { path, diagnostic } => write!(f, "io error at {path}: {diagnostic}"),
        }
    }
}

impl std::error::Error for ConversionError {}

impl From<ProcessError> for ConversionError {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    Process(ProcessError),
    MalformedOutput { diagnostic: String },
    InvalidStructure { diagnostic: String },
    Execution { diagnostic: String },
    Io { path: String, diagnostic: String },
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(error) => write!(f, "target runner failed: {error}"),
            Self::MalformedOutput { diagnostic } => {
                write!(f, "target output is malformed: {diagnostic}")
            }
            Self::InvalidStructure { diagnostic } => {
                write!(f, "converted artifact could not be loaded: {diagnostic}")
            }
            Self::Execution { diagnostic } => write!(f, "target execution failed: {diagnostic}"),
            Self::Io { path, diagnostic } => write!(f, "io error at {path}: {diagnostic}"),
        }
    }
}

impl std::error::Error for InferenceError {}

impl From<ProcessError> for InferenceError {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

/// Converter output. The harness only knows that both files exist and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedArtifact {
    structure_path: PathBuf,
    weights_path: PathBuf,
}

impl ConvertedArtifact {
    #[must_use]
    pub fn new(structure_path: PathBuf, weights_path: PathBuf) -> Self {
        Self {
            structure_path,
            weights_path,
        }
    }

    #[must_use]
    pub fn structure_path(&self) -> &Path {
        &self.structure_path
    }

    #[must_use]
    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    #[must_use]
    pub fn paths(&self) -> [&Path; 2] {
        [&self.structure_path, &self.weights_path]
    }
}

/// Converter plus target engine. Alternate backends plug in here without the
/// equivalence checker knowing which one ran.
pub trait ConversionBackend {
    fn name(&self) -> &'static str;

    /// Converts the portable artifact at `artifact_path`, specialising it to
    /// `input_shapes` (one per model input, in forward-signature order).
    fn convert(
        &self,
        artifact_path: &Path,
        input_shapes: &[Vec<usize>],
    ) -> Result<ConvertedArtifact, ConversionError>;

    /// Runs the converted model on `inputs` and returns outputs in declared order.
    fn infer(
        &self,
        converted: &ConvertedArtifact,
        inputs: &[DenseTensor],
    ) -> Result<OutputTuple, InferenceError>;
}

/// Renders the converter's shape argument, e.g. `inputshape=[1,16],[1,2,16]`.
#[must_use]
pub fn format_inputshape(shapes: &[Vec<usize>]) -> String {
    let rendered = shapes
        .iter()
        .map(|shape| {
            let dims = shape
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{dims}]")
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("inputshape={rendered}")
}

/// `<work_dir>/<artifact stem>.<suffix>` for both converter outputs.
pub fn converted_paths(
    work_dir: &Path,
    artifact_path: &Path,
    structure_suffix: &str,
    weights_suffix: &str,
) -> Result<ConvertedArtifact, ConversionError> {
    let stem = artifact_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| ConversionError::InvalidArtifact {
            diagnostic: format!("artifact path {} has no file stem", artifact_path.display()),
        })?;
    Ok(ConvertedArtifact::new(
        work_dir.join(format!("{stem}.{structure_suffix}")),
        work_dir.join(format!("{stem}.{weights_suffix}")),
    ))
}

#[derive(Serialize)]
struct RunnerRequest<'a> {
    inputs: &'a [DenseTensor],
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerResponse {
    outputs: Vec<DenseTensor>,
}

/// External converter and runner, both driven as blocking subprocesses.
///
/// The converter runs as `<converter> [args] <artifact> inputshape=...` inside
/// `work_dir`. The runner runs as `<runner> [args] <structure> <weights>`, gets
/// `{"inputs":[...]}` on stdin and prints `{"outputs":[...]}` as its last line.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    converter: ProcessCommand,
    runner: ProcessCommand,
    work_dir: PathBuf,
    structure_suffix: String,
    weights_suffix: String,
}

impl ProcessBackend {
    #[must_use]
    pub fn new(converter: ProcessCommand, runner: ProcessCommand, work_dir: PathBuf) -> Self {
        Self {
            converter,
            runner,
            work_dir,
            structure_suffix: DEFAULT_STRUCTURE_SUFFIX.to_string(),
            weights_suffix: DEFAULT_WEIGHTS_SUFFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_suffixes(
        mut self,
        structure_suffix: impl Into<String>,
        weights_suffix: impl Into<String>,
    ) -> Self {
        self.structure_suffix = structure_suffix.into();
        self.weights_suffix = weights_suffix.into();
        self
    }

    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

impl ConversionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn convert(
        &self,
        artifact_path: &Path,
        input_shapes: &[Vec<usize>],
    ) -> Result<ConvertedArtifact, ConversionError> {
        fs::create_dir_all(&self.work_dir).map_err(|error| ConversionError::Io {
            path: self.work_dir.display().to_string(),
            diagnostic: error.to_string(),
        })?;
        // the converter runs inside work_dir, so hand it an absolute path
        let artifact = fs::canonicalize(artifact_path).map_err(|error| ConversionError::Io {
            path: artifact_path.display().to_string(),
            diagnostic: error.to_string(),
        })?;
        let converted = converted_paths(
            &self.work_dir,
            artifact_path,
            &self.structure_suffix,
            &self.weights_suffix,
        )?;
        for stale in converted.paths() {
            let _ = fs::remove_file(stale);
        }

        let mut command = self.converter.clone();
        command.working_dir = Some(self.work_dir.clone());
        run_process(
            &command,
            &[
                artifact.into_os_string(),
                OsString::from(format_inputshape(input_shapes)),
            ],
            None,
        )?;

        for path in converted.paths() {
            if !path.is_file() {
                return Err(ConversionError::MissingOutput {
                    path: path.display().to_string(),
                });
            }
        }
        Ok(converted)
    }

    fn infer(
        &self,
        converted: &ConvertedArtifact,
        inputs: &[DenseTensor],
    ) -> Result<OutputTuple, InferenceError> {
        let request = serde_json::to_vec(&RunnerRequest { inputs }).map_err(|error| {
            InferenceError::Execution {
                diagnostic: format!("failed to serialize runner inputs: {error}"),
            }
        })?;
        let output = run_process(
            &self.runner,
            &[
                converted.structure_path().as_os_str().to_os_string(),
                converted.weights_path().as_os_str().to_os_string(),
            ],
            Some(request),
        )?;
        parse_runner_stdout(&output.stdout)
    }
}

fn parse_runner_stdout(stdout: &[u8]) -> Result<OutputTuple, InferenceError> {
    let text = std::str::from_utf8(stdout).map_err(|error| InferenceError::MalformedOutput {
        diagnostic: format!("runner stdout was not utf8: {error}"),
    })?;
    let line = last_non_empty_line(text).ok_or_else(|| InferenceError::MalformedOutput {
        diagnostic: "runner produced empty stdout".to_string(),
    })?;
    let response: RunnerResponse =
        serde_json::from_str(line).map_err(|error| InferenceError::MalformedOutput {
            diagnostic: format!(
                "{error}; raw={}",
                bounded_diagnostic(line, DIAGNOSTIC_BYTES)
            ),
        })?;
    Ok(OutputTuple::new(response.outputs))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    use cp_core::DenseTensor;
    use proptest::prelude::*;

    use super::{
        ConversionBackend, ConversionError, InferenceError, ProcessBackend, ProcessCommand,
        ProcessError, converted_paths, format_inputshape, parse_runner_stdout,
    };

    fn unique_temp_dir(label: &str) -> PathBuf {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis());
        let dir = std::env::temp_dir().join(format!(
            "cp_backend_{label}_{}_{}",
            std::process::id(),
            now_ms
        ));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh").with_args(["-c", script, "sh"])
    }

    fn write_artifact_stub(dir: &Path) -> PathBuf {
        let path = dir.join("model.cpa");
        std::fs::write(&path, "{}").expect("artifact stub");
        path
    }

    #[test]
    fn inputshape_has_no_spaces_and_keeps_order() {
        assert_eq!(
            format_inputshape(&[vec![1, 16], vec![1, 2, 16], vec![1, 3, 12, 16]]),
            "inputshape=[1,16],[1,2,16],[1,3,12,16]"
        );
        assert_eq!(format_inputshape(&[vec![]]), "inputshape=[]");
    }

    #[test]
    fn converted_paths_derive_from_artifact_stem() {
        let converted = converted_paths(
            Path::new("/work"),
            Path::new("/elsewhere/f_batch_norm.cpa"),
            "ncnn.param",
            "ncnn.bin",
        )
        .expect("paths");
        assert_eq!(
            converted.structure_path(),
            Path::new("/work/f_batch_norm.ncnn.param")
        );
        assert_eq!(
            converted.weights_path(),
            Path::new("/work/f_batch_norm.ncnn.bin")
        );
    }

    #[test]
    fn converter_receives_artifact_and_shapes_and_outputs_are_found() {
        let dir = unique_temp_dir("convert_ok");
        let artifact = write_artifact_stub(&dir);
        let script = r#"stem=$(basename "$1" .cpa); echo "$2" > "$stem.ncnn.param"; : > "$stem.ncnn.bin""#;
        let backend = ProcessBackend::new(sh(script), sh("true"), dir.clone());

        let converted = backend
            .convert(&artifact, &[vec![1, 16], vec![1, 2, 16]])
            .expect("conversion should succeed");
        let recorded =
            std::fs::read_to_string(converted.structure_path()).expect("structure file");
        assert_eq!(recorded.trim(), "inputshape=[1,16],[1,2,16]");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn converter_non_zero_exit_is_a_conversion_error() {
        let dir = unique_temp_dir("convert_fail");
        let artifact = write_artifact_stub(&dir);
        let backend = ProcessBackend::new(sh("echo unsupported op >&2; exit 2"), sh("true"), dir.clone());
        let err = backend
            .convert(&artifact, &[vec![1]])
            .expect_err("exit 2 must fail");
        let ConversionError::Process(ProcessError::NonZeroExit { stderr, .. }) = err else {
            panic!("expected NonZeroExit, got {err:?}");
        };
        assert_eq!(stderr, "unsupported op");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn converter_success_without_outputs_is_missing_output() {
        let dir = unique_temp_dir("convert_missing");
        let artifact = write_artifact_stub(&dir);
        let script = r#"stem=$(basename "$1" .cpa); : > "$stem.ncnn.param""#;
        let backend = ProcessBackend::new(sh(script), sh("true"), dir.clone());
        let err = backend
            .convert(&artifact, &[vec![1]])
            .expect_err("weights missing");
        assert!(matches!(err, ConversionError::MissingOutput { path } if path.ends_with("model.ncnn.bin")));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_outputs_from_a_previous_run_do_not_count() {
        let dir = unique_temp_dir("convert_stale");
        let artifact = write_artifact_stub(&dir);
        std::fs::write(dir.join("model.ncnn.param"), "old").expect("stale param");
        std::fs::write(dir.join("model.ncnn.bin"), "old").expect("stale bin");
        let backend = ProcessBackend::new(sh("true"), sh("true"), dir.clone());
        let err = backend
            .convert(&artifact, &[vec![1]])
            .expect_err("no fresh outputs");
        assert!(matches!(err, ConversionError::MissingOutput { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn runner_echoes_inputs_back_as_outputs() {
        let dir = unique_temp_dir("infer_echo");
        let runner = sh(r#"test -f "$1" && test -f "$2" && sed 's/"inputs"/"outputs"/'"#);
        let backend = ProcessBackend::new(sh("true"), runner, dir.clone());
        let structure = dir.join("m.ncnn.param");
        let weights = dir.join("m.ncnn.bin");
        std::fs::write(&structure, "").expect("structure");
        std::fs::write(&weights, "").expect("weights");

        let input = DenseTensor::new(vec![1, 2], vec![0.25, -1.5]).expect("input");
        let outputs = backend
            .infer(
                &super::ConvertedArtifact::new(structure, weights),
                std::slice::from_ref(&input),
            )
            .expect("echo runner");
        assert_eq!(outputs.tensors(), &[input]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn runner_output_uses_last_line_and_fails_closed() {
        let parsed = parse_runner_stdout(
            b"loading model\n{\"outputs\":[{\"shape\":[1],\"data\":[2.0]}]}\n",
        )
        .expect("last line parses");
        assert_eq!(parsed.len(), 1);

        assert!(matches!(
            parse_runner_stdout(b"\n\n"),
            Err(InferenceError::MalformedOutput { .. })
        ));
        assert!(matches!(
            parse_runner_stdout(b"{\"outputs\":[],\"extra\":1}"),
            Err(InferenceError::MalformedOutput { .. })
        ));
        assert!(matches!(
            parse_runner_stdout(b"{\"outputs\":[{\"shape\":[2],\"data\":[1.0]}]}"),
            Err(InferenceError::MalformedOutput { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_inputshape_lists_one_bracket_group_per_input(
            shapes in prop::collection::vec(prop::collection::vec(1usize..=64, 1..=4), 1..=4)
        ) {
            let rendered = format_inputshape(&shapes);
            prop_assert!(rendered.starts_with("inputshape=["));
            prop_assert!(!rendered.contains(' '));
            prop_assert_eq!(rendered.matches('[').count(), shapes.len());
            prop_assert_eq!(rendered.matches("],[").count(), shapes.len() - 1);
        }
    }
}
