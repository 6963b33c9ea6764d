#![forbid(unsafe_code)]

mod executor;
pub mod kernels;
pub mod modules;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use cp_core::{DenseTensor, TensorError};
use serde::{Deserialize, Serialize};

pub use executor::{ExecError, Precision, ReferenceExecutor, round_to_f32};
pub use kernels::{Conv2dParams, KernelError};

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    DuplicateValue { name: String },
    UndefinedValue { node: String, name: String },
    UnknownOutput { name: String },
    NoOutputs,
    InvalidModule { module: String, reason: String },
    Tensor(TensorError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateValue { name } => write!(f, "value '{name}' is defined twice"),
            Self::UndefinedValue { node, name } => {
                write!(f, "node '{node}' reads undefined value '{name}'")
            }
            Self::UnknownOutput { name } => write!(f, "graph output '{name}' is not defined"),
            Self::NoOutputs => write!(f, "graph declares no outputs"),
            Self::InvalidModule { module, reason } => {
                write!(f, "module '{module}' is invalid: {reason}")
            }
            Self::Tensor(error) => write!(f, "tensor error: {error}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<TensorError> for GraphError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDecl {
    pub name: String,
    pub shape: Vec<usize>,
}

/// One operator application. Operands name graph inputs, constants, or earlier node outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    BatchNorm {
        input: String,
        running_mean: String,
        running_var: String,
        weight: Option<String>,
        bias: Option<String>,
        eps: f64,
    },
    Conv2d {
        input: String,
        weight: String,
        bias: Option<String>,
        params: Conv2dParams,
    },
    DeformConv2d {
        input: String,
        offset: String,
        mask: Option<String>,
        weight: String,
        bias: Option<String>,
        params: Conv2dParams,
    },
    Sigmoid {
        input: String,
    },
}

impl Op {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BatchNorm { .. } => "batch_norm",
            Self::Conv2d { .. } => "conv2d",
            Self::DeformConv2d { .. } => "deform_conv2d",
            Self::Sigmoid { .. } => "sigmoid",
        }
    }

    /// Every value name this op reads, optional operands included when present.
    #[must_use]
    pub fn operands(&self) -> Vec<&str> {
        let mut names = Vec::new();
        match self {
            Self::BatchNorm {
                input,
                running_mean,
                running_var,
                weight,
                bias,
                ..
            } => {
                names.extend([input.as_str(), running_mean.as_str(), running_var.as_str()]);
                names.extend(weight.as_deref());
                names.extend(bias.as_deref());
            }
            Self::Conv2d {
                input,
                weight,
                bias,
                ..
            } => {
                names.extend([input.as_str(), weight.as_str()]);
                names.extend(bias.as_deref());
            }
            Self::DeformConv2d {
                input,
                offset,
                mask,
                weight,
                bias,
                ..
            } => {
                names.extend([input.as_str(), offset.as_str()]);
                names.extend(mask.as_deref());
                names.push(weight.as_str());
                names.extend(bias.as_deref());
            }
            Self::Sigmoid { input } => names.push(input.as_str()),
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub output: String,
    #[serde(flatten)]
    pub op: Op,
}

/// Immutable model: declared inputs, frozen constants, and a topologically
/// ordered node list. Execution state never lives here.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    name: String,
    inputs: Vec<InputDecl>,
    constants: BTreeMap<String, DenseTensor>,
    nodes: Vec<Node>,
    outputs: Vec<String>,
}

impl ModelSpec {
    /// Validates and assembles a model. Used by the builder and by artifact replay.
    pub fn from_parts(
        name: impl Into<String>,
        inputs: Vec<InputDecl>,
        constants: BTreeMap<String, DenseTensor>,
        nodes: Vec<Node>,
        outputs: Vec<String>,
    ) -> Result<Self, GraphError> {
        let mut defined = BTreeSet::new();
        for name in inputs
            .iter()
            .map(|input| input.name.as_str())
            .chain(constants.keys().map(String::as_str))
        {
            if !defined.insert(name.to_string()) {
                return Err(GraphError::DuplicateValue {
                    name: name.to_string(),
                });
            }
        }

        for node in &nodes {
            for operand in node.op.operands() {
                if !defined.contains(operand) {
                    return Err(GraphError::UndefinedValue {
                        node: node.output.clone(),
                        name: operand.to_string(),
                    });
                }
            }
            if !defined.insert(node.output.clone()) {
                return Err(GraphError::DuplicateValue {
                    name: node.output.clone(),
                });
            }
        }

        if outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        if let Some(missing) = outputs.iter().find(|name| !defined.contains(name.as_str())) {
            return Err(GraphError::UnknownOutput {
                name: missing.clone(),
            });
        }

        Ok(Self {
            name: name.into(),
            inputs,
            constants,
            nodes,
            outputs,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn inputs(&self) -> &[InputDecl] {
        &self.inputs
    }

    #[must_use]
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.inputs.iter().map(|input| input.shape.clone()).collect()
    }

    #[must_use]
    pub fn constants(&self) -> &BTreeMap<String, DenseTensor> {
        &self.constants
    }

    #[must_use]
    pub fn constant(&self, name: &str) -> Option<&DenseTensor> {
        self.constants.get(name)
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Copy whose constants went through `f`. The graph is untouched.
    #[must_use]
    pub fn map_constants<F>(&self, f: F) -> Self
    where
        F: Fn(f64) -> f64,
    {
        let constants = self
            .constants
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.map(&f)))
            .collect();
        Self {
            constants,
            ..self.clone()
        }
    }

    /// Copy with every constant rounded through IEEE binary16, matching a
    /// model that was cast to half precision and back before export.
    #[must_use]
    pub fn with_constants_rounded_to_f16(&self) -> Self {
        self.map_constants(|value| half::f16::from_f64(value).to_f64())
    }
}

/// Accumulates inputs, constants and nodes; `finish` validates the result.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    inputs: Vec<InputDecl>,
    constants: Vec<(String, DenseTensor)>,
    nodes: Vec<Node>,
    outputs: Vec<String>,
}

impl ModelBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            constants: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(&mut self, name: impl Into<String>, shape: Vec<usize>) -> String {
        let name = name.into();
        self.inputs.push(InputDecl {
            name: name.clone(),
            shape,
        });
        name
    }

    pub fn constant(&mut self, name: impl Into<String>, tensor: DenseTensor) -> String {
        let name = name.into();
        self.constants.push((name.clone(), tensor));
        name
    }

    pub fn node(&mut self, output: impl Into<String>, op: Op) -> String {
        let output = output.into();
        self.nodes.push(Node {
            output: output.clone(),
            op,
        });
        output
    }

    pub fn output(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
    }

    pub fn finish(self) -> Result<ModelSpec, GraphError> {
        let mut constants = BTreeMap::new();
        for (name, tensor) in self.constants {
            if constants.contains_key(&name) {
                return Err(GraphError::DuplicateValue { name });
            }
            constants.insert(name, tensor);
        }
        ModelSpec::from_parts(self.name, self.inputs, constants, self.nodes, self.outputs)
    }
}
