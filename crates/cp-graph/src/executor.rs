use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use cp_core::{DenseTensor, OutputTuple};

use crate::kernels::{self, KernelError};
use crate::{ModelSpec, Node, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Ground truth. Every intermediate stays in `f64`.
    #[default]
    F64,
    /// Inputs, constants and every node output are rounded to `f32`.
    F32,
}

impl Precision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    InputCount {
        expected: usize,
        actual: usize,
    },
    InputShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    MissingValue {
        name: String,
    },
    Kernel {
        node: String,
        op: &'static str,
        source: KernelError,
    },
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputCount { expected, actual } => {
                write!(f, "model expects {expected} inputs, got {actual}")
            }
            Self::InputShape {
                name,
                expected,
                actual,
            } => write!(
                f,
                "input '{name}' shape mismatch expected={expected:?} actual={actual:?}"
            ),
            Self::MissingValue { name } => write!(f, "value '{name}' was never produced"),
            Self::Kernel { node, op, source } => {
                write!(f, "node '{node}' ({op}) failed: {source}")
            }
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kernel { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[must_use]
pub fn round_to_f32(tensor: &DenseTensor) -> DenseTensor {
    tensor.map(|value| f64::from(value as f32))
}

/// Evaluation-mode interpreter over a [`ModelSpec`]. Holds no model state, so
/// the same spec can be run any number of times with identical results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceExecutor {
    precision: Precision,
}

impl ReferenceExecutor {
    #[must_use]
    pub fn new(precision: Precision) -> Self {
        Self { precision }
    }

    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Runs the model and returns its declared outputs in order.
    pub fn run(&self, spec: &ModelSpec, inputs: &[DenseTensor]) -> Result<OutputTuple, ExecError> {
        let values = self.evaluate(spec, inputs)?;
        let outputs = spec
            .outputs()
            .iter()
            .map(|name| self.lookup(spec, &values, name).map(Cow::into_owned))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OutputTuple::new(outputs))
    }

    /// Concrete shape of every named value: inputs, constants and node outputs.
    pub fn trace(
        &self,
        spec: &ModelSpec,
        inputs: &[DenseTensor],
    ) -> Result<BTreeMap<String, Vec<usize>>, ExecError> {
        let values = self.evaluate(spec, inputs)?;
        let mut shapes: BTreeMap<String, Vec<usize>> = spec
            .constants()
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.shape().to_vec()))
            .collect();
        shapes.extend(
            values
                .into_iter()
                .map(|(name, tensor)| (name, tensor.shape().to_vec())),
        );
        Ok(shapes)
    }

    fn evaluate(
        &self,
        spec: &ModelSpec,
        inputs: &[DenseTensor],
    ) -> Result<BTreeMap<String, DenseTensor>, ExecError> {
        if inputs.len() != spec.inputs().len() {
            return Err(ExecError::InputCount {
                expected: spec.inputs().len(),
                actual: inputs.len(),
            });
        }

        let mut values = BTreeMap::new();
        for (decl, tensor) in spec.inputs().iter().zip(inputs) {
            if tensor.shape() != decl.shape.as_slice() {
                return Err(ExecError::InputShape {
                    name: decl.name.clone(),
                    expected: decl.shape.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
            values.insert(decl.name.clone(), self.quantize(tensor.clone()));
        }

        for node in spec.nodes() {
            let produced = self.apply(spec, &values, node)?;
            values.insert(node.output.clone(), self.quantize(produced));
        }
        Ok(values)
    }

    fn apply(
        &self,
        spec: &ModelSpec,
        values: &BTreeMap<String, DenseTensor>,
        node: &Node,
    ) -> Result<DenseTensor, ExecError> {
        let get = |name: &str| self.lookup(spec, values, name);
        let get_opt = |name: &Option<String>| name.as_deref().map(get).transpose();

        let result = match &node.op {
            Op::BatchNorm {
                input,
                running_mean,
                running_var,
                weight,
                bias,
                eps,
            } => {
                let weight = get_opt(weight)?;
                let bias = get_opt(bias)?;
                kernels::batch_norm(
                    &*get(input)?,
                    &*get(running_mean)?,
                    &*get(running_var)?,
                    weight.as_deref(),
                    bias.as_deref(),
                    *eps,
                )
            }
            Op::Conv2d {
                input,
                weight,
                bias,
                params,
            } => {
                let bias = get_opt(bias)?;
                kernels::conv2d(&*get(input)?, &*get(weight)?, bias.as_deref(), *params)
            }
            Op::DeformConv2d {
                input,
                offset,
                mask,
                weight,
                bias,
                params,
            } => {
                let mask = get_opt(mask)?;
                let bias = get_opt(bias)?;
                kernels::deform_conv2d(
                    &*get(input)?,
                    &*get(offset)?,
                    mask.as_deref(),
                    &*get(weight)?,
                    bias.as_deref(),
                    *params,
                )
            }
            Op::Sigmoid { input } => Ok(kernels::sigmoid(&*get(input)?)),
        };

        result.map_err(|source| ExecError::Kernel {
            node: node.output.clone(),
            op: node.op.kind(),
            source,
        })
    }

    fn lookup<'a>(
        &self,
        spec: &'a ModelSpec,
        values: &'a BTreeMap<String, DenseTensor>,
        name: &str,
    ) -> Result<Cow<'a, DenseTensor>, ExecError> {
        if let Some(tensor) = values.get(name) {
            return Ok(Cow::Borrowed(tensor));
        }
        let constant = spec.constant(name).ok_or_else(|| ExecError::MissingValue {
            name: name.to_string(),
        })?;
        Ok(match self.precision {
            Precision::F64 => Cow::Borrowed(constant),
            Precision::F32 => Cow::Owned(round_to_f32(constant)),
        })
    }

    fn quantize(&self, tensor: DenseTensor) -> DenseTensor {
        match self.precision {
            Precision::F64 => tensor,
            Precision::F32 => round_to_f32(&tensor),
        }
    }
}
