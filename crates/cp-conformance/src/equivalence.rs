//! Positional, elementwise comparison of two output tuples.
//!
//! An element pair `(reference, target)` is close when
//! `|reference - target| <= atol + rtol * |reference|`. NaN is never close and
//! non-finite values are close only when exactly equal, matching
//! `torch.allclose(..., equal_nan=False)`. Because `rtol` scales the reference
//! magnitude, swapping the operands can change the verdict near the bound.

use std::fmt;

use cp_core::{DenseTensor, OutputTuple, TensorError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RTOL: f64 = 1e-4;
pub const DEFAULT_ATOL: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToleranceSpec {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for ToleranceSpec {
    fn default() -> Self {
        Self {
            rtol: DEFAULT_RTOL,
            atol: DEFAULT_ATOL,
        }
    }
}

impl ToleranceSpec {
    pub fn new(rtol: f64, atol: f64) -> Result<Self, EquivalenceError> {
        let tolerance = Self { rtol, atol };
        tolerance.validate()?;
        Ok(tolerance)
    }

    fn validate(self) -> Result<(), EquivalenceError> {
        let usable = |value: f64| value.is_finite() && value >= 0.0;
        if usable(self.rtol) && usable(self.atol) {
            Ok(())
        } else {
            Err(EquivalenceError::InvalidTolerance {
                rtol: self.rtol,
                atol: self.atol,
            })
        }
    }

    #[must_use]
    pub fn bound(self, reference: f64) -> f64 {
        self.atol + self.rtol * reference.abs()
    }

    #[must_use]
    pub fn is_close(self, reference: f64, target: f64) -> bool {
        if reference.is_nan() || target.is_nan() {
            return false;
        }
        if !reference.is_finite() || !target.is_finite() {
            return reference == target;
        }
        (reference - target).abs() <= self.bound(reference)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EquivalenceError {
    /// Both tuples were empty, so there was nothing to compare.
    EmptyOutputs,
    InvalidTolerance { rtol: f64, atol: f64 },
    Tensor(TensorError),
}

impl EquivalenceError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyOutputs => "degenerate_outputs",
            Self::InvalidTolerance { .. } => "invalid_tolerance",
            Self::Tensor(_) => "tensor_error",
        }
    }
}

impl fmt::Display for EquivalenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOutputs => write!(
                f,
                "both output tuples are empty; at least one pair must be compared"
            ),
            Self::InvalidTolerance { rtol, atol } => write!(
                f,
                "tolerance must be finite and non-negative, got rtol={rtol} atol={atol}"
            ),
            Self::Tensor(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for EquivalenceError {}

impl From<TensorError> for EquivalenceError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// First failing location found by [`check_equivalence`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    Length {
        reference: usize,
        target: usize,
    },
    Shape {
        position: usize,
        reference: Vec<usize>,
        target: Vec<usize>,
    },
    Numeric {
        position: usize,
        flat_index: usize,
        index: Vec<usize>,
        reference: f64,
        target: f64,
        abs_diff: f64,
        bound: f64,
    },
}

impl Mismatch {
    /// Tuple position of the failing pair; `None` for a length mismatch.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Length { .. } => None,
            Self::Shape { position, .. } | Self::Numeric { position, .. } => Some(*position),
        }
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Length { .. } => "length_mismatch",
            Self::Shape { .. } => "shape_mismatch",
            Self::Numeric { .. } => "numeric_mismatch",
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length { reference, target } => write!(
                f,
                "output count differs: reference={reference} target={target}"
            ),
            Self::Shape {
                position,
                reference,
                target,
            } => write!(
                f,
                "output #{position} shape differs: reference={reference:?} target={target:?}"
            ),
            Self::Numeric {
                position,
                index,
                reference,
                target,
                abs_diff,
                bound,
                ..
            } => write!(
                f,
                "output #{position} at {index:?}: reference={reference} target={target} |diff|={abs_diff} > bound={bound}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquivalenceVerdict {
    pairs_checked: usize,
    tolerance: ToleranceSpec,
    mismatch: Option<Mismatch>,
}

impl EquivalenceVerdict {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatch.is_none()
    }

    /// Number of output pairs examined before the verdict was reached.
    #[must_use]
    pub fn pairs_checked(&self) -> usize {
        self.pairs_checked
    }

    #[must_use]
    pub fn tolerance(&self) -> ToleranceSpec {
        self.tolerance
    }

    #[must_use]
    pub fn mismatch(&self) -> Option<&Mismatch> {
        self.mismatch.as_ref()
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        self.mismatch
            .as_ref()
            .map_or("equivalent", Mismatch::reason_code)
    }
}

/// Compares `reference` and `target` pair by pair, stopping at the first
/// failing pair.
///
/// A length mismatch is reported before emptiness is considered, so only two
/// empty tuples produce [`EquivalenceError::EmptyOutputs`].
pub fn check_equivalence(
    reference: &OutputTuple,
    target: &OutputTuple,
    tolerance: ToleranceSpec,
) -> Result<EquivalenceVerdict, EquivalenceError> {
    tolerance.validate()?;
    let mut verdict = EquivalenceVerdict {
        pairs_checked: 0,
        tolerance,
        mismatch: None,
    };

    if reference.len() != target.len() {
        verdict.mismatch = Some(Mismatch::Length {
            reference: reference.len(),
            target: target.len(),
        });
        return Ok(verdict);
    }
    if reference.is_empty() {
        return Err(EquivalenceError::EmptyOutputs);
    }

    for (position, (expected, actual)) in reference.iter().zip(target.iter()).enumerate() {
        verdict.pairs_checked += 1;
        if let Some(mismatch) = compare_pair(position, expected, actual, tolerance)? {
            verdict.mismatch = Some(mismatch);
            break;
        }
    }
    Ok(verdict)
}

fn compare_pair(
    position: usize,
    reference: &DenseTensor,
    target: &DenseTensor,
    tolerance: ToleranceSpec,
) -> Result<Option<Mismatch>, EquivalenceError> {
    if reference.shape() != target.shape() {
        return Ok(Some(Mismatch::Shape {
            position,
            reference: reference.shape().to_vec(),
            target: target.shape().to_vec(),
        }));
    }

    let failing = reference
        .values()
        .iter()
        .zip(target.values())
        .position(|(&r, &t)| !tolerance.is_close(r, t));
    let Some(flat_index) = failing else {
        return Ok(None);
    };

    let r = reference.values()[flat_index];
    let t = target.values()[flat_index];
    Ok(Some(Mismatch::Numeric {
        position,
        flat_index,
        index: reference.unravel_index(flat_index)?,
        reference: r,
        target: t,
        abs_diff: (r - t).abs(),
        bound: tolerance.bound(r),
    }))
}
