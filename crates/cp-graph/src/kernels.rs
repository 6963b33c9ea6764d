use std::fmt;

use cp_core::{DenseTensor, TensorError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    RankMismatch {
        op: &'static str,
        operand: &'static str,
        expected: &'static str,
        shape: Vec<usize>,
    },
    ShapeMismatch {
        op: &'static str,
        operand: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    InvalidParameter {
        op: &'static str,
        reason: String,
    },
    Tensor(TensorError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch {
                op,
                operand,
                expected,
                shape,
            } => write!(f, "{op}: {operand} must be {expected}, got shape {shape:?}"),
            Self::ShapeMismatch {
                op,
                operand,
                expected,
                actual,
            } => write!(
                f,
                "{op}: {operand} shape mismatch expected={expected:?} actual={actual:?}"
            ),
            Self::InvalidParameter { op, reason } => write!(f, "{op}: {reason}"),
            Self::Tensor(error) => write!(f, "tensor error: {error}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorError> for KernelError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Spatial hyper-parameters shared by `conv2d` and `deform_conv2d`, ordered `[h, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

/// Evaluation-mode batch normalization over axis 1.
///
/// `y = (x - mean[c]) / sqrt(var[c] + eps) * weight[c] + bias[c]`, with a missing
/// weight acting as 1 and a missing bias as 0. The channel count comes from the
/// input, so any cardinality (including 1) takes the same path.
pub fn batch_norm(
    input: &DenseTensor,
    running_mean: &DenseTensor,
    running_var: &DenseTensor,
    weight: Option<&DenseTensor>,
    bias: Option<&DenseTensor>,
    eps: f64,
) -> Result<DenseTensor, KernelError> {
    const OP: &str = "batch_norm";
    if input.rank() < 2 {
        return Err(KernelError::RankMismatch {
            op: OP,
            operand: "input",
            expected: "rank >= 2",
            shape: input.shape().to_vec(),
        });
    }
    if !eps.is_finite() || eps < 0.0 {
        return Err(KernelError::InvalidParameter {
            op: OP,
            reason: format!("eps must be finite and non-negative, got {eps}"),
        });
    }

    let shape = input.shape();
    let channels = shape[1];
    let inner: usize = shape[2..].iter().product();
    let outer = shape[0];

    ensure_channel_vector(OP, "running_mean", running_mean, channels)?;
    ensure_channel_vector(OP, "running_var", running_var, channels)?;
    if let Some(weight) = weight {
        ensure_channel_vector(OP, "weight", weight, channels)?;
    }
    if let Some(bias) = bias {
        ensure_channel_vector(OP, "bias", bias, channels)?;
    }

    let mean = running_mean.values();
    let var = running_var.values();
    let scale: Vec<f64> = (0..channels)
        .map(|c| {
            let gamma = weight.map_or(1.0, |w| w.values()[c]);
            gamma / (var[c] + eps).sqrt()
        })
        .collect();

    let x = input.values();
    let mut out = Vec::with_capacity(x.len());
    for _n in 0..outer {
        for c in 0..channels {
            let beta = bias.map_or(0.0, |b| b.values()[c]);
            let base = out.len();
            for i in 0..inner {
                out.push((x[base + i] - mean[c]) * scale[c] + beta);
            }
        }
    }

    Ok(DenseTensor::new(shape.to_vec(), out)?)
}

/// NCHW cross-correlation.
pub fn conv2d(
    input: &DenseTensor,
    weight: &DenseTensor,
    bias: Option<&DenseTensor>,
    params: Conv2dParams,
) -> Result<DenseTensor, KernelError> {
    const OP: &str = "conv2d";
    let geometry = ConvGeometry::resolve(OP, input, weight, bias, params)?;
    let ConvGeometry {
        batch,
        in_channels,
        in_h,
        in_w,
        out_channels,
        in_per_group,
        out_per_group,
        kernel_h,
        kernel_w,
        out_h,
        out_w,
    } = geometry;

    let x = input.values();
    let wv = weight.values();
    let mut out = vec![0.0; batch * out_channels * out_h * out_w];

    for b in 0..batch {
        for co in 0..out_channels {
            let group = co / out_per_group;
            let bias_value = bias.map_or(0.0, |t| t.values()[co]);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = bias_value;
                    for ci_local in 0..in_per_group {
                        let ci = group * in_per_group + ci_local;
                        let plane = (b * in_channels + ci) * in_h * in_w;
                        let kernel = (co * in_per_group + ci_local) * kernel_h * kernel_w;
                        for ky in 0..kernel_h {
                            let Some(iy) = tap_coordinate(oy, ky, params, 0, in_h) else {
                                continue;
                            };
                            for kx in 0..kernel_w {
                                let Some(ix) = tap_coordinate(ox, kx, params, 1, in_w) else {
                                    continue;
                                };
                                acc += wv[kernel + ky * kernel_w + kx] * x[plane + iy * in_w + ix];
                            }
                        }
                    }
                    out[((b * out_channels + co) * out_h + oy) * out_w + ox] = acc;
                }
            }
        }
    }

    Ok(DenseTensor::new(
        vec![batch, out_channels, out_h, out_w],
        out,
    )?)
}

/// Deformable convolution v1/v2 with torchvision semantics.
///
/// `offset` is `[N, 2 * G * kh * kw, out_h, out_w]` holding `(dy, dx)` pairs per
/// kernel tap for each of `G` offset groups. `mask`, when present, is
/// `[N, G * kh * kw, out_h, out_w]` and scales every sampled value.
pub fn deform_conv2d(
    input: &DenseTensor,
    offset: &DenseTensor,
    mask: Option<&DenseTensor>,
    weight: &DenseTensor,
    bias: Option<&DenseTensor>,
    params: Conv2dParams,
) -> Result<DenseTensor, KernelError> {
    const OP: &str = "deform_conv2d";
    let geometry = ConvGeometry::resolve(OP, input, weight, bias, params)?;
    let ConvGeometry {
        batch,
        in_channels,
        in_h,
        in_w,
        out_channels,
        in_per_group,
        out_per_group,
        kernel_h,
        kernel_w,
        out_h,
        out_w,
    } = geometry;
    let taps = kernel_h * kernel_w;
    let spatial = out_h * out_w;

    if offset.rank() != 4 {
        return Err(KernelError::RankMismatch {
            op: OP,
            operand: "offset",
            expected: "rank 4",
            shape: offset.shape().to_vec(),
        });
    }
    let offset_channels = offset.shape()[1];
    if offset_channels == 0 || offset_channels % (2 * taps) != 0 {
        return Err(KernelError::InvalidParameter {
            op: OP,
            reason: format!(
                "offset channels {offset_channels} must be a positive multiple of 2*kh*kw={}",
                2 * taps
            ),
        });
    }
    let offset_groups = offset_channels / (2 * taps);
    if in_channels % offset_groups != 0 {
        return Err(KernelError::InvalidParameter {
            op: OP,
            reason: format!(
                "input channels {in_channels} not divisible by offset groups {offset_groups}"
            ),
        });
    }
    let expected_offset = vec![batch, offset_channels, out_h, out_w];
    if offset.shape() != expected_offset.as_slice() {
        return Err(KernelError::ShapeMismatch {
            op: OP,
            operand: "offset",
            expected: expected_offset,
            actual: offset.shape().to_vec(),
        });
    }
    if let Some(mask) = mask {
        let expected_mask = vec![batch, offset_groups * taps, out_h, out_w];
        if mask.shape() != expected_mask.as_slice() {
            return Err(KernelError::ShapeMismatch {
                op: OP,
                operand: "mask",
                expected: expected_mask,
                actual: mask.shape().to_vec(),
            });
        }
    }

    let x = input.values();
    let off = offset.values();
    let wv = weight.values();
    let channels_per_offset_group = in_channels / offset_groups;
    let mut out = vec![0.0; batch * out_channels * spatial];
    let mut columns = vec![0.0; in_channels * taps * spatial];

    for b in 0..batch {
        for g in 0..offset_groups {
            for ky in 0..kernel_h {
                for kx in 0..kernel_w {
                    let tap = ky * kernel_w + kx;
                    let dy_plane = ((b * offset_channels) + g * 2 * taps + 2 * tap) * spatial;
                    let dx_plane = dy_plane + spatial;
                    for oy in 0..out_h {
                        for ox in 0..out_w {
                            let pos = oy * out_w + ox;
                            let modulation = match mask {
                                Some(mask) => {
                                    mask.values()[((b * offset_groups * taps) + g * taps + tap)
                                        * spatial
                                        + pos]
                                }
                                None => 1.0,
                            };
                            let y = (oy * params.stride[0]) as f64 - params.padding[0] as f64
                                + (ky * params.dilation[0]) as f64
                                + off[dy_plane + pos];
                            let xf = (ox * params.stride[1]) as f64 - params.padding[1] as f64
                                + (kx * params.dilation[1]) as f64
                                + off[dx_plane + pos];
                            for ci in g * channels_per_offset_group
                                ..(g + 1) * channels_per_offset_group
                            {
                                let plane_start = (b * in_channels + ci) * in_h * in_w;
                                let plane = &x[plane_start..plane_start + in_h * in_w];
                                columns[(ci * taps + tap) * spatial + pos] =
                                    modulation * bilinear(plane, in_h, in_w, y, xf);
                            }
                        }
                    }
                }
            }
        }

        for co in 0..out_channels {
            let group = co / out_per_group;
            let out_start = (b * out_channels + co) * spatial;
            let acc = &mut out[out_start..out_start + spatial];
            let bias_value = bias.map_or(0.0, |t| t.values()[co]);
            acc.fill(bias_value);
            for ci_local in 0..in_per_group {
                let ci = group * in_per_group + ci_local;
                for tap in 0..taps {
                    let w = wv[(co * in_per_group + ci_local) * taps + tap];
                    let row = &columns[(ci * taps + tap) * spatial..(ci * taps + tap + 1) * spatial];
                    for (slot, sample) in acc.iter_mut().zip(row.iter()) {
                        *slot += w * sample;
                    }
                }
            }
        }
    }

    Ok(DenseTensor::new(
        vec![batch, out_channels, out_h, out_w],
        out,
    )?)
}

#[must_use]
pub fn sigmoid(input: &DenseTensor) -> DenseTensor {
    input.map(|v| 1.0 / (1.0 + (-v).exp()))
}

#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    batch: usize,
    in_channels: usize,
    in_h: usize,
    in_w: usize,
    out_channels: usize,
    in_per_group: usize,
    out_per_group: usize,
    kernel_h: usize,
    kernel_w: usize,
    out_h: usize,
    out_w: usize,
}

impl ConvGeometry {
    fn resolve(
        op: &'static str,
        input: &DenseTensor,
        weight: &DenseTensor,
        bias: Option<&DenseTensor>,
        params: Conv2dParams,
    ) -> Result<Self, KernelError> {
        if input.rank() != 4 {
            return Err(KernelError::RankMismatch {
                op,
                operand: "input",
                expected: "rank 4 (NCHW)",
                shape: input.shape().to_vec(),
            });
        }
        if weight.rank() != 4 {
            return Err(KernelError::RankMismatch {
                op,
                operand: "weight",
                expected: "rank 4 (OIHW)",
                shape: weight.shape().to_vec(),
            });
        }
        if params.groups == 0 || params.stride.contains(&0) || params.dilation.contains(&0) {
            return Err(KernelError::InvalidParameter {
                op,
                reason: format!("groups, stride and dilation must be positive: {params:?}"),
            });
        }

        let (batch, in_channels, in_h, in_w) = (
            input.shape()[0],
            input.shape()[1],
            input.shape()[2],
            input.shape()[3],
        );
        let (out_channels, in_per_group, kernel_h, kernel_w) = (
            weight.shape()[0],
            weight.shape()[1],
            weight.shape()[2],
            weight.shape()[3],
        );
        if in_per_group * params.groups != in_channels || out_channels % params.groups != 0 {
            return Err(KernelError::InvalidParameter {
                op,
                reason: format!(
                    "weight {:?} incompatible with {in_channels} input channels and groups={}",
                    weight.shape(),
                    params.groups
                ),
            });
        }
        if let Some(bias) = bias {
            ensure_channel_vector(op, "bias", bias, out_channels)?;
        }

        let out_h = output_extent(op, in_h, kernel_h, params, 0)?;
        let out_w = output_extent(op, in_w, kernel_w, params, 1)?;
        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            in_per_group,
            out_per_group: out_channels / params.groups,
            kernel_h,
            kernel_w,
            out_h,
            out_w,
        })
    }
}

fn output_extent(
    op: &'static str,
    input: usize,
    kernel: usize,
    params: Conv2dParams,
    axis: usize,
) -> Result<usize, KernelError> {
    let padded = input + 2 * params.padding[axis];
    let effective = params.dilation[axis] * kernel.saturating_sub(1) + 1;
    if kernel == 0 || padded < effective {
        return Err(KernelError::InvalidParameter {
            op,
            reason: format!(
                "kernel extent {effective} exceeds padded input {padded} on axis {axis}"
            ),
        });
    }
    Ok((padded - effective) / params.stride[axis] + 1)
}

fn tap_coordinate(
    out_index: usize,
    kernel_index: usize,
    params: Conv2dParams,
    axis: usize,
    extent: usize,
) -> Option<usize> {
    let padded = out_index * params.stride[axis] + kernel_index * params.dilation[axis];
    let coordinate = padded.checked_sub(params.padding[axis])?;
    (coordinate < extent).then_some(coordinate)
}

fn ensure_channel_vector(
    op: &'static str,
    operand: &'static str,
    tensor: &DenseTensor,
    channels: usize,
) -> Result<(), KernelError> {
    if tensor.shape() != [channels] {
        return Err(KernelError::ShapeMismatch {
            op,
            operand,
            expected: vec![channels],
            actual: tensor.shape().to_vec(),
        });
    }
    Ok(())
}

fn bilinear(plane: &[f64], height: usize, width: usize, y: f64, x: f64) -> f64 {
    let (h, w) = (height as f64, width as f64);
    if y <= -1.0 || y >= h || x <= -1.0 || x >= w {
        return 0.0;
    }

    let y_low = y.floor();
    let x_low = x.floor();
    let ly = y - y_low;
    let lx = x - x_low;
    let hy = 1.0 - ly;
    let hx = 1.0 - lx;

    let sample = |yy: f64, xx: f64| -> f64 {
        if yy < 0.0 || xx < 0.0 || yy > h - 1.0 || xx > w - 1.0 {
            0.0
        } else {
            plane[yy as usize * width + xx as usize]
        }
    };

    hy * hx * sample(y_low, x_low)
        + hy * lx * sample(y_low, x_low + 1.0)
        + ly * hx * sample(y_low + 1.0, x_low)
        + ly * lx * sample(y_low + 1.0, x_low + 1.0)
}
