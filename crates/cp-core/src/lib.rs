#![forbid(unsafe_code)]

mod rng;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use rng::{DEFAULT_SCENARIO_SEED, SeededRng};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    ShapeDataMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    NumelOverflow {
        shape: Vec<usize>,
    },
    IndexOutOfBounds {
        index: usize,
        numel: usize,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeDataMismatch {
                shape,
                expected,
                actual,
            } => write!(
                f,
                "shape {shape:?} expects {expected} elements but data holds {actual}"
            ),
            Self::NumelOverflow { shape } => {
                write!(f, "element count overflows usize for shape {shape:?}")
            }
            Self::IndexOutOfBounds { index, numel } => {
                write!(f, "flat index {index} out of bounds for numel={numel}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Row-major dense tensor of `f64` values.
///
/// The shape and data length are validated on construction and on
/// deserialization, so every live tensor satisfies `data.len() == product(shape)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct DenseTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl TryFrom<RawTensor> for DenseTensor {
    type Error = TensorError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Self::new(raw.shape, raw.data)
    }
}

impl DenseTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, TensorError> {
        let expected = checked_numel(&shape)?;
        if expected != data.len() {
            return Err(TensorError::ShapeDataMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Result<Self, TensorError> {
        let numel = checked_numel(&shape)?;
        Ok(Self {
            shape,
            data: vec![0.0; numel],
        })
    }

    pub fn full(shape: Vec<usize>, value: f64) -> Result<Self, TensorError> {
        let numel = checked_numel(&shape)?;
        Ok(Self {
            shape,
            data: vec![value; numel],
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    #[must_use]
    pub fn into_values(self) -> Vec<f64> {
        self.data
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of `axis`, or `None` when the tensor has fewer dimensions.
    #[must_use]
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.shape.get(axis).copied()
    }

    /// Applies `f` elementwise, keeping the shape.
    #[must_use]
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f64) -> f64,
    {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    /// Converts a flat row-major index into a multi-dimensional index.
    pub fn unravel_index(&self, flat: usize) -> Result<Vec<usize>, TensorError> {
        if flat >= self.data.len() {
            return Err(TensorError::IndexOutOfBounds {
                index: flat,
                numel: self.data.len(),
            });
        }
        let strides = contiguous_strides(&self.shape);
        let mut remaining = flat;
        let mut index = Vec::with_capacity(self.shape.len());
        for stride in strides {
            index.push(remaining / stride);
            remaining %= stride;
        }
        Ok(index)
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut words = Vec::with_capacity(self.shape.len() + self.data.len() + 1);
        words.push(self.shape.len() as u64);
        words.extend(self.shape.iter().map(|dim| *dim as u64));
        words.extend(self.data.iter().map(|value| value.to_bits()));
        det_hash64_words(&words)
    }
}

/// Ordered outputs of one model execution. Position is significant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputTuple {
    tensors: Vec<DenseTensor>,
}

impl OutputTuple {
    #[must_use]
    pub fn new(tensors: Vec<DenseTensor>) -> Self {
        Self { tensors }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&DenseTensor> {
        self.tensors.get(position)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DenseTensor> {
        self.tensors.iter()
    }

    #[must_use]
    pub fn tensors(&self) -> &[DenseTensor] {
        &self.tensors
    }

    #[must_use]
    pub fn into_tensors(self) -> Vec<DenseTensor> {
        self.tensors
    }

    #[must_use]
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors
            .iter()
            .map(|tensor| tensor.shape().to_vec())
            .collect()
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let parts = self
            .tensors
            .iter()
            .map(DenseTensor::fingerprint64)
            .collect::<Vec<_>>();
        det_hash64_words(&parts)
    }
}

impl From<Vec<DenseTensor>> for OutputTuple {
    fn from(tensors: Vec<DenseTensor>) -> Self {
        Self::new(tensors)
    }
}

impl<'a> IntoIterator for &'a OutputTuple {
    type Item = &'a DenseTensor;
    type IntoIter = std::slice::Iter<'a, DenseTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}

pub fn checked_numel(shape: &[usize]) -> Result<usize, TensorError> {
    shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| TensorError::NumelOverflow {
            shape: shape.to_vec(),
        })
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

/// FNV-1a over the little-endian bytes of `parts`. Stable across runs and platforms.
#[must_use]
pub fn det_hash64_words(parts: &[u64]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for value in parts {
        for byte in value.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

#[must_use]
pub fn det_hash64_bytes(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[must_use]
pub fn det64_label(value: u64) -> String {
    format!("det64:{value:016x}")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DenseTensor, OutputTuple, TensorError, checked_numel, contiguous_strides,
        det_hash64_words, det64_label,
    };

    #[test]
    fn tensor_rejects_data_length_mismatch() {
        let err = DenseTensor::new(vec![2, 3], vec![0.0; 5]).expect_err("5 != 6 must fail");
        assert!(matches!(
            err,
            TensorError::ShapeDataMismatch {
                expected: 6,
                actual: 5,
                ..
            }
        ));
    }

    #[test]
    fn scalar_shape_holds_one_element() {
        let tensor = DenseTensor::new(Vec::new(), vec![3.5]).expect("scalar tensor");
        assert_eq!(tensor.rank(), 0);
        assert_eq!(tensor.numel(), 1);
    }

    #[test]
    fn numel_overflow_is_reported() {
        let err = checked_numel(&[usize::MAX, 2]).expect_err("overflow must fail");
        assert!(matches!(err, TensorError::NumelOverflow { .. }));
    }

    #[test]
    fn unravel_index_matches_row_major_layout() {
        let tensor = DenseTensor::zeros(vec![2, 3, 4]).expect("zeros");
        assert_eq!(tensor.unravel_index(0).expect("first"), vec![0, 0, 0]);
        assert_eq!(tensor.unravel_index(5).expect("middle"), vec![0, 1, 1]);
        assert_eq!(tensor.unravel_index(23).expect("last"), vec![1, 2, 3]);
        assert!(tensor.unravel_index(24).is_err());
    }

    #[test]
    fn deserialization_validates_shape() {
        let err = serde_json::from_str::<DenseTensor>(r#"{"shape":[2,2],"data":[1.0]}"#)
            .expect_err("mismatched payload must fail");
        assert!(err.to_string().contains("expects 4 elements"));

        let ok: DenseTensor =
            serde_json::from_str(r#"{"shape":[2],"data":[1.0,2.0]}"#).expect("valid payload");
        assert_eq!(ok.values(), &[1.0, 2.0]);
    }

    #[test]
    fn output_tuple_serializes_as_plain_array() {
        let tuple = OutputTuple::new(vec![
            DenseTensor::new(vec![1], vec![1.0]).expect("tensor"),
        ]);
        let raw = serde_json::to_string(&tuple).expect("serialize");
        assert_eq!(raw, r#"[{"shape":[1],"data":[1.0]}]"#);
    }

    #[test]
    fn output_tuple_fingerprint_is_position_sensitive() {
        let a = DenseTensor::new(vec![1], vec![1.0]).expect("a");
        let b = DenseTensor::new(vec![1], vec![2.0]).expect("b");
        let forward = OutputTuple::new(vec![a.clone(), b.clone()]);
        let reversed = OutputTuple::new(vec![b, a]);
        assert_ne!(forward.fingerprint64(), reversed.fingerprint64());
    }

    #[test]
    fn det64_label_is_fixed_width() {
        assert_eq!(det64_label(0xab), "det64:00000000000000ab");
        assert_eq!(det_hash64_words(&[]), 0xcbf2_9ce4_8422_2325);
    }

    proptest! {
        #[test]
        fn prop_strides_are_row_major(shape in prop::collection::vec(1usize..=5, 1..=4)) {
            let strides = contiguous_strides(&shape);
            prop_assert_eq!(strides.last().copied(), Some(1));
            for axis in 0..shape.len() - 1 {
                prop_assert_eq!(strides[axis], strides[axis + 1] * shape[axis + 1]);
            }
        }

        #[test]
        fn prop_unravel_round_trips(shape in prop::collection::vec(1usize..=5, 1..=4), pick in 0usize..1000) {
            let tensor = DenseTensor::zeros(shape.clone()).expect("zeros");
            let flat = pick % tensor.numel();
            let index = tensor.unravel_index(flat).expect("in range");
            let strides = contiguous_strides(&shape);
            let rebuilt: usize = index.iter().zip(strides.iter()).map(|(i, s)| i * s).sum();
            prop_assert_eq!(rebuilt, flat);
        }
    }
}
