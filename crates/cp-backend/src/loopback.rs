use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cp_core::{DenseTensor, OutputTuple, checked_numel};
use cp_export::load_artifact;
use cp_graph::{InputDecl, ModelSpec, Node, Precision, ReferenceExecutor};
use serde::{Deserialize, Serialize};

use crate::process::{DIAGNOSTIC_BYTES, bounded_diagnostic};
use crate::{ConversionBackend, ConversionError, ConvertedArtifact, InferenceError, converted_paths};

pub const LOOPBACK_STRUCTURE_SUFFIX: &str = "loopback.param";
pub const LOOPBACK_WEIGHTS_SUFFIX: &str = "loopback.bin";
const LOOPBACK_FORMAT_VERSION: u32 = 1;
const MAX_STRUCTURE_BYTES: u64 = 16 * 1_048_576;
const MAX_WEIGHTS_BYTES: u64 = 256 * 1_048_576;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoopbackStructure {
    format_version: u32,
    model_name: String,
    inputs: Vec<InputDecl>,
    nodes: Vec<Node>,
    outputs: Vec<String>,
    weights: Vec<WeightSlot>,
}

/// Location of one constant inside the weights blob, counted in `f32` elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WeightSlot {
    name: String,
    shape: Vec<usize>,
    offset: usize,
}

/// In-process stand-in for a converter plus engine.
///
/// "Conversion" re-encodes the portable artifact as a JSON structure file and a
/// little-endian `f32` weights blob, specialised to the requested shapes. Inference
/// reloads both files and runs the reference kernels at single precision, so it
/// behaves like a float32 engine fed the converted files and nothing else.
#[derive(Debug, Clone)]
pub struct LoopbackBackend {
    work_dir: PathBuf,
}

impl LoopbackBackend {
    #[must_use]
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }
}

impl ConversionBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn convert(
        &self,
        artifact_path: &Path,
        input_shapes: &[Vec<usize>],
    ) -> Result<ConvertedArtifact, ConversionError> {
        let artifact =
            load_artifact(artifact_path).map_err(|error| ConversionError::InvalidArtifact {
                diagnostic: error.to_string(),
            })?;
        let declared = artifact.input_shapes();
        if declared.as_slice() != input_shapes {
            return Err(ConversionError::ShapeMismatch {
                declared,
                requested: input_shapes.to_vec(),
            });
        }

        let mut weights = Vec::new();
        let mut slots = Vec::with_capacity(artifact.constants().len());
        for record in artifact.constants() {
            slots.push(WeightSlot {
                name: record.name.clone(),
                shape: record.tensor.shape().to_vec(),
                offset: weights.len() / 4,
            });
            for value in record.tensor.values() {
                weights.extend_from_slice(&(*value as f32).to_le_bytes());
            }
        }
        let graph = artifact.graph();
        let structure = LoopbackStructure {
            format_version: LOOPBACK_FORMAT_VERSION,
            model_name: artifact.model_name().to_string(),
            inputs: graph.inputs.clone(),
            nodes: graph.nodes.clone(),
            outputs: graph.outputs.clone(),
            weights: slots,
        };
        let encoded =
            serde_json::to_vec_pretty(&structure).map_err(|error| ConversionError::Io {
                path: artifact_path.display().to_string(),
                diagnostic: format!("structure encoding failed: {error}"),
            })?;

        fs::create_dir_all(&self.work_dir).map_err(|error| ConversionError::Io {
            path: self.work_dir.display().to_string(),
            diagnostic: error.to_string(),
        })?;
        let converted = converted_paths(
            &self.work_dir,
            artifact_path,
            LOOPBACK_STRUCTURE_SUFFIX,
            LOOPBACK_WEIGHTS_SUFFIX,
        )?;
        write_file(converted.structure_path(), &encoded)?;
        write_file(converted.weights_path(), &weights)?;
        Ok(converted)
    }

    fn infer(
        &self,
        converted: &ConvertedArtifact,
        inputs: &[DenseTensor],
    ) -> Result<OutputTuple, InferenceError> {
        let spec = load_converted(converted)?;
        ReferenceExecutor::new(Precision::F32)
            .run(&spec, inputs)
            .map_err(|error| InferenceError::Execution {
                diagnostic: error.to_string(),
            })
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ConversionError> {
    fs::write(path, bytes).map_err(|error| ConversionError::Io {
        path: path.display().to_string(),
        diagnostic: error.to_string(),
    })
}

fn read_file(path: &Path, max_bytes: u64) -> Result<Vec<u8>, InferenceError> {
    let io_error = |error: std::io::Error| InferenceError::Io {
        path: path.display().to_string(),
        diagnostic: error.to_string(),
    };
    let size = fs::metadata(path).map_err(io_error)?.len();
    if size > max_bytes {
        return Err(InferenceError::InvalidStructure {
            diagnostic: format!(
                "{} exceeds max bytes: actual={size} max={max_bytes}",
                path.display()
            ),
        });
    }
    fs::read(path).map_err(io_error)
}

fn load_converted(converted: &ConvertedArtifact) -> Result<ModelSpec, InferenceError> {
    let structure_bytes = read_file(converted.structure_path(), MAX_STRUCTURE_BYTES)?;
    let structure: LoopbackStructure = serde_json::from_slice(&structure_bytes).map_err(|error| {
        InferenceError::InvalidStructure {
            diagnostic: bounded_diagnostic(&error.to_string(), DIAGNOSTIC_BYTES),
        }
    })?;
    if structure.format_version != LOOPBACK_FORMAT_VERSION {
        return Err(InferenceError::InvalidStructure {
            diagnostic: format!(
                "unsupported loopback format version {}",
                structure.format_version
            ),
        });
    }

    let blob = read_file(converted.weights_path(), MAX_WEIGHTS_BYTES)?;
    if blob.len() % 4 != 0 {
        return Err(InferenceError::InvalidStructure {
            diagnostic: format!("weights blob length {} is not a multiple of 4", blob.len()),
        });
    }
    let floats: Vec<f64> = blob
        .chunks_exact(4)
        .map(|chunk| f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect();

    let mut constants = BTreeMap::new();
    for slot in structure.weights {
        let numel = checked_numel(&slot.shape).map_err(|error| InferenceError::InvalidStructure {
            diagnostic: error.to_string(),
        })?;
        let data = slot
            .offset
            .checked_add(numel)
            .and_then(|end| floats.get(slot.offset..end))
            .ok_or_else(|| InferenceError::InvalidStructure {
                diagnostic: format!(
                    "weight '{}' [{}, +{numel}) lies outside the {}-element blob",
                    slot.name,
                    slot.offset,
                    floats.len()
                ),
            })?;
        let tensor = DenseTensor::new(slot.shape, data.to_vec()).map_err(|error| {
            InferenceError::InvalidStructure {
                diagnostic: error.to_string(),
            }
        })?;
        constants.insert(slot.name, tensor);
    }

    ModelSpec::from_parts(
        structure.model_name,
        structure.inputs,
        constants,
        structure.nodes,
        structure.outputs,
    )
    .map_err(|error| InferenceError::InvalidStructure {
        diagnostic: error.to_string(),
    })
}
