#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use cp_core::DenseTensor;
use cp_graph::{ExecError, GraphError, InputDecl, ModelSpec, Node, Precision, ReferenceExecutor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ARTIFACT_SCHEMA_VERSION: u32 = 1;
pub const ARTIFACT_EXTENSION: &str = "cpa";
const MAX_ARTIFACT_PAYLOAD_BYTES: usize = 64 * 1_048_576;
const MAX_DIAGNOSTIC_BYTES: usize = 200;
const GRAPH_HASH_DOMAIN: &[u8] = b"cp-artifact-graph-v1\n";
const SOURCE_HASH_DOMAIN: &[u8] = b"cp-artifact-source-v1\n";

#[derive(Debug, Clone, PartialEq)]
pub enum ExportError {
    InputCount {
        expected: usize,
        actual: usize,
    },
    InputShapeMismatch {
        position: usize,
        name: String,
        declared: Vec<usize>,
        actual: Vec<usize>,
    },
    Trace(ExecError),
    NonFiniteConstant {
        name: String,
    },
    InvalidJson {
        diagnostic: String,
    },
    UnknownField {
        field: String,
    },
    VersionMismatch {
        expected: u32,
        found: u32,
    },
    ChecksumMismatch {
        section: &'static str,
        expected: String,
        found: String,
    },
    PayloadTooLarge {
        actual: usize,
        max: usize,
    },
    Graph(GraphError),
    Io {
        path: String,
        diagnostic: String,
    },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputCount { expected, actual } => {
                write!(f, "model declares {expected} inputs but {actual} were supplied")
            }
            Self::InputShapeMismatch {
                position,
                name,
                declared,
                actual,
            } => write!(
                f,
                "input #{position} '{name}' declared shape {declared:?} but traced with {actual:?}"
            ),
            Self::Trace(error) => write!(f, "trace failed: {error}"),
            Self::NonFiniteConstant { name } => {
                write!(f, "constant '{name}' holds a non-finite value")
            }
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => write!(
                f,
                "schema version mismatch: expected={expected} found={found}"
            ),
            Self::ChecksumMismatch {
                section,
                expected,
                found,
            } => write!(
                f,
                "{section} checksum mismatch: expected={expected} found={found}"
            ),
            Self::PayloadTooLarge { actual, max } => write!(
                f,
                "artifact payload exceeds max bytes: actual={actual} max={max}"
            ),
            Self::Graph(error) => write!(f, "artifact graph is invalid: {error}"),
            Self::Io { path, diagnostic } => write!(f, "io error at {path}: {diagnostic}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<ExecError> for ExportError {
    fn from(value: ExecError) -> Self {
        Self::Trace(value)
    }
}

impl From<GraphError> for ExportError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

/// Structural half of an artifact. Its encoding is what `graph_hash` covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactGraph {
    pub inputs: Vec<InputDecl>,
    pub nodes: Vec<Node>,
    pub outputs: Vec<String>,
    pub value_shapes: BTreeMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantRecord {
    pub name: String,
    pub tensor: DenseTensor,
}

/// Self-contained snapshot of a traced model and its frozen constants.
///
/// Fields are private: an artifact is only produced by [`PortableArtifact::capture`]
/// or a checksum-verified decode, and is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortableArtifact {
    schema_version: u32,
    model_name: String,
    graph: ArtifactGraph,
    constants: Vec<ConstantRecord>,
    graph_hash: String,
    source_hash: String,
}

impl PortableArtifact {
    /// Traces `spec` with `inputs` and freezes its constants.
    ///
    /// The supplied inputs must match the declared input shapes exactly; the
    /// converter is later told those same shapes.
    pub fn capture(spec: &ModelSpec, inputs: &[DenseTensor]) -> Result<Self, ExportError> {
        let declared = spec.inputs();
        if declared.len() != inputs.len() {
            return Err(ExportError::InputCount {
                expected: declared.len(),
                actual: inputs.len(),
            });
        }
        for (position, (decl, tensor)) in declared.iter().zip(inputs).enumerate() {
            if decl.shape.as_slice() != tensor.shape() {
                return Err(ExportError::InputShapeMismatch {
                    position,
                    name: decl.name.clone(),
                    declared: decl.shape.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
        }

        let mut constants = Vec::with_capacity(spec.constants().len());
        for (name, tensor) in spec.constants() {
            if tensor.values().iter().any(|value| !value.is_finite()) {
                return Err(ExportError::NonFiniteConstant { name: name.clone() });
            }
            constants.push(ConstantRecord {
                name: name.clone(),
                tensor: tensor.clone(),
            });
        }

        let value_shapes = ReferenceExecutor::new(Precision::F64).trace(spec, inputs)?;
        let graph = ArtifactGraph {
            inputs: declared.to_vec(),
            nodes: spec.nodes().to_vec(),
            outputs: spec.outputs().to_vec(),
            value_shapes,
        };

        let graph_hash = graph_hash(&graph)?;
        let source_hash = source_hash(
            ARTIFACT_SCHEMA_VERSION,
            spec.name(),
            &graph_hash,
            &constants,
        )?;
        Ok(Self {
            schema_version: ARTIFACT_SCHEMA_VERSION,
            model_name: spec.name().to_string(),
            graph,
            constants,
            graph_hash,
            source_hash,
        })
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    #[must_use]
    pub fn graph(&self) -> &ArtifactGraph {
        &self.graph
    }

    #[must_use]
    pub fn constants(&self) -> &[ConstantRecord] {
        &self.constants
    }

    #[must_use]
    pub fn graph_hash(&self) -> &str {
        &self.graph_hash
    }

    #[must_use]
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    /// Input shapes in forward-signature order, as the converter expects them.
    #[must_use]
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.graph
            .inputs
            .iter()
            .map(|input| input.shape.clone())
            .collect()
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.graph.outputs.len()
    }

    #[must_use]
    pub fn value_shape(&self, name: &str) -> Option<&[usize]> {
        self.graph.value_shapes.get(name).map(Vec::as_slice)
    }

    /// Rebuilds an executable model from the artifact alone.
    pub fn to_model_spec(&self) -> Result<ModelSpec, ExportError> {
        let mut constants = BTreeMap::new();
        for record in &self.constants {
            if constants
                .insert(record.name.clone(), record.tensor.clone())
                .is_some()
            {
                return Err(ExportError::Graph(GraphError::DuplicateValue {
                    name: record.name.clone(),
                }));
            }
        }
        Ok(ModelSpec::from_parts(
            self.model_name.clone(),
            self.graph.inputs.clone(),
            constants,
            self.graph.nodes.clone(),
            self.graph.outputs.clone(),
        )?)
    }
}

/// Captures `spec` and writes the artifact to `path`.
pub fn export_model(
    spec: &ModelSpec,
    inputs: &[DenseTensor],
    path: &Path,
) -> Result<PortableArtifact, ExportError> {
    let artifact = PortableArtifact::capture(spec, inputs)?;
    write_artifact(&artifact, path)?;
    Ok(artifact)
}

pub fn encode_artifact(artifact: &PortableArtifact) -> Result<String, ExportError> {
    serde_json::to_string(artifact).map_err(|error| ExportError::InvalidJson {
        diagnostic: bounded(&format!("artifact encoding failed: {error}"), MAX_DIAGNOSTIC_BYTES),
    })
}

/// Fail-closed decode: size cap, unknown fields, schema version and both checksums.
pub fn decode_artifact(input: &str) -> Result<PortableArtifact, ExportError> {
    validate_payload_size(input.len())?;
    let artifact: PortableArtifact = serde_json::from_str(input).map_err(|error| {
        let message = error.to_string();
        match extract_unknown_field(&message) {
            Some(field) => ExportError::UnknownField { field },
            None => ExportError::InvalidJson {
                diagnostic: bounded(&message, MAX_DIAGNOSTIC_BYTES),
            },
        }
    })?;
    validate_artifact(&artifact)?;
    Ok(artifact)
}

/// Writes through a sibling temp file and renames it into place.
pub fn write_artifact(artifact: &PortableArtifact, path: &Path) -> Result<(), ExportError> {
    let encoded = encode_artifact(artifact)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| io_error(parent, &error))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ExportError::Io {
            path: path.display().to_string(),
            diagnostic: "artifact path has no file name".to_string(),
        })?;
    let staging = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    fs::write(&staging, encoded).map_err(|error| io_error(&staging, &error))?;
    fs::rename(&staging, path).map_err(|error| {
        let _ = fs::remove_file(&staging);
        io_error(path, &error)
    })
}

pub fn load_artifact(path: &Path) -> Result<PortableArtifact, ExportError> {
    let metadata = fs::metadata(path).map_err(|error| io_error(path, &error))?;
    let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
    validate_payload_size(size)?;
    let raw = fs::read_to_string(path).map_err(|error| io_error(path, &error))?;
    decode_artifact(&raw)
}

fn validate_payload_size(actual: usize) -> Result<(), ExportError> {
    if actual > MAX_ARTIFACT_PAYLOAD_BYTES {
        return Err(ExportError::PayloadTooLarge {
            actual,
            max: MAX_ARTIFACT_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

fn validate_artifact(artifact: &PortableArtifact) -> Result<(), ExportError> {
    if artifact.schema_version != ARTIFACT_SCHEMA_VERSION {
        return Err(ExportError::VersionMismatch {
            expected: ARTIFACT_SCHEMA_VERSION,
            found: artifact.schema_version,
        });
    }

    let expected_graph = graph_hash(&artifact.graph)?;
    if artifact.graph_hash != expected_graph {
        return Err(ExportError::ChecksumMismatch {
            section: "graph",
            expected: expected_graph,
            found: artifact.graph_hash.clone(),
        });
    }

    let expected_source = source_hash(
        artifact.schema_version,
        &artifact.model_name,
        &artifact.graph_hash,
        &artifact.constants,
    )?;
    if artifact.source_hash != expected_source {
        return Err(ExportError::ChecksumMismatch {
            section: "source",
            expected: expected_source,
            found: artifact.source_hash.clone(),
        });
    }
    Ok(())
}

fn graph_hash(graph: &ArtifactGraph) -> Result<String, ExportError> {
    let bytes = canonical_bytes(graph)?;
    let mut hasher = Sha256::new();
    hasher.update(GRAPH_HASH_DOMAIN);
    hasher.update(&bytes);
    Ok(sha256_label(&hasher.finalize()))
}

fn source_hash(
    schema_version: u32,
    model_name: &str,
    graph_hash: &str,
    constants: &[ConstantRecord],
) -> Result<String, ExportError> {
    let mut hasher = Sha256::new();
    hasher.update(SOURCE_HASH_DOMAIN);
    hasher.update(schema_version.to_le_bytes());
    hasher.update(model_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(graph_hash.as_bytes());
    hasher.update(b"\n");
    for record in constants {
        hasher.update(record.name.as_bytes());
        hasher.update(b":");
        for dim in record.tensor.shape() {
            hasher.update((*dim as u64).to_le_bytes());
        }
        hasher.update(b":");
        for value in record.tensor.values() {
            hasher.update(value.to_bits().to_le_bytes());
        }
        hasher.update(b"\n");
    }
    Ok(sha256_label(&hasher.finalize()))
}

fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ExportError> {
    serde_json::to_vec(value).map_err(|error| ExportError::InvalidJson {
        diagnostic: bounded(&format!("canonical encoding failed: {error}"), MAX_DIAGNOSTIC_BYTES),
    })
}

fn sha256_label(digest: &[u8]) -> String {
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn io_error(path: &Path, error: &std::io::Error) -> ExportError {
    ExportError::Io {
        path: path.display().to_string(),
        diagnostic: error.to_string(),
    }
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut boundary = max_len;
    while boundary > 0 && !input.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &input[..boundary])
}
