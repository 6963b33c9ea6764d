//! Parameter-owning layers that emit nodes into a [`ModelBuilder`].
//!
//! Each layer draws its parameters from the caller's [`SeededRng`] once, at
//! construction, and registers them as constants. `forward` only appends nodes.

use cp_core::SeededRng;

use crate::kernels::Conv2dParams;
use crate::{GraphError, ModelBuilder, Op};

pub const DEFAULT_BATCH_NORM_EPS: f64 = 1e-5;

/// Evaluation-mode batch normalization. Statistics and affine parameters are
/// drawn from `U[0, 1)`, so every channel carries a distinct value.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    name: String,
    running_mean: String,
    running_var: String,
    weight: Option<String>,
    bias: Option<String>,
    num_features: usize,
    eps: f64,
}

impl BatchNorm {
    pub fn new(
        builder: &mut ModelBuilder,
        rng: &mut SeededRng,
        name: &str,
        num_features: usize,
        eps: f64,
        affine: bool,
    ) -> Result<Self, GraphError> {
        if num_features == 0 {
            return Err(GraphError::InvalidModule {
                module: name.to_string(),
                reason: "batch norm requires num_features > 0".to_string(),
            });
        }
        if !eps.is_finite() || eps < 0.0 {
            return Err(GraphError::InvalidModule {
                module: name.to_string(),
                reason: format!("eps must be finite and non-negative, got {eps}"),
            });
        }

        let running_mean = builder.constant(
            format!("{name}.running_mean"),
            rng.rand_tensor(vec![num_features])?,
        );
        let running_var = builder.constant(
            format!("{name}.running_var"),
            rng.rand_tensor(vec![num_features])?,
        );
        let (weight, bias) = if affine {
            let weight =
                builder.constant(format!("{name}.weight"), rng.rand_tensor(vec![num_features])?);
            let bias =
                builder.constant(format!("{name}.bias"), rng.rand_tensor(vec![num_features])?);
            (Some(weight), Some(bias))
        } else {
            (None, None)
        };

        Ok(Self {
            name: name.to_string(),
            running_mean,
            running_var,
            weight,
            bias,
            num_features,
            eps,
        })
    }

    #[must_use]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    #[must_use]
    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn forward(&self, builder: &mut ModelBuilder, input: &str) -> String {
        builder.node(
            self.name.clone(),
            Op::BatchNorm {
                input: input.to_string(),
                running_mean: self.running_mean.clone(),
                running_var: self.running_var.clone(),
                weight: self.weight.clone(),
                bias: self.bias.clone(),
                eps: self.eps,
            },
        )
    }
}

/// Weight and optional bias shared by [`Conv2d`] and [`DeformConv2d`].
#[derive(Debug, Clone)]
struct ConvParameters {
    weight: String,
    bias: Option<String>,
}

impl ConvParameters {
    #[allow(clippy::too_many_arguments)]
    fn init(
        builder: &mut ModelBuilder,
        rng: &mut SeededRng,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        groups: usize,
        use_bias: bool,
    ) -> Result<Self, GraphError> {
        if in_channels == 0 || out_channels == 0 || kernel_size.contains(&0) {
            return Err(GraphError::InvalidModule {
                module: name.to_string(),
                reason: "convolution requires positive channels and kernel size".to_string(),
            });
        }
        if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(GraphError::InvalidModule {
                module: name.to_string(),
                reason: format!(
                    "groups={groups} must divide in_channels={in_channels} and out_channels={out_channels}"
                ),
            });
        }

        // PyTorch default init: U(-bound, bound) with bound = 1 / sqrt(fan_in)
        let fan_in = in_channels / groups * kernel_size[0] * kernel_size[1];
        let bound = 1.0 / (fan_in as f64).sqrt();
        let weight = builder.constant(
            format!("{name}.weight"),
            rng.uniform_tensor(
                vec![out_channels, in_channels / groups, kernel_size[0], kernel_size[1]],
                -bound,
                bound,
            )?,
        );
        let bias = if use_bias {
            Some(builder.constant(
                format!("{name}.bias"),
                rng.uniform_tensor(vec![out_channels], -bound, bound)?,
            ))
        } else {
            None
        };
        Ok(Self { weight, bias })
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    name: String,
    parameters: ConvParameters,
    params: Conv2dParams,
}

impl Conv2d {
    pub fn new(
        builder: &mut ModelBuilder,
        rng: &mut SeededRng,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        params: Conv2dParams,
    ) -> Result<Self, GraphError> {
        let parameters = ConvParameters::init(
            builder,
            rng,
            name,
            in_channels,
            out_channels,
            kernel_size,
            params.groups,
            true,
        )?;
        Ok(Self {
            name: name.to_string(),
            parameters,
            params,
        })
    }

    pub fn forward(&self, builder: &mut ModelBuilder, input: &str) -> String {
        builder.node(
            self.name.clone(),
            Op::Conv2d {
                input: input.to_string(),
                weight: self.parameters.weight.clone(),
                bias: self.parameters.bias.clone(),
                params: self.params,
            },
        )
    }
}

/// torchvision-style deformable convolution layer. The offset (and optional
/// mask) come from the graph at `forward` time rather than from parameters.
#[derive(Debug, Clone)]
pub struct DeformConv2d {
    name: String,
    parameters: ConvParameters,
    params: Conv2dParams,
}

impl DeformConv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builder: &mut ModelBuilder,
        rng: &mut SeededRng,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        params: Conv2dParams,
        use_bias: bool,
    ) -> Result<Self, GraphError> {
        let parameters = ConvParameters::init(
            builder,
            rng,
            name,
            in_channels,
            out_channels,
            kernel_size,
            params.groups,
            use_bias,
        )?;
        Ok(Self {
            name: name.to_string(),
            parameters,
            params,
        })
    }

    pub fn forward(
        &self,
        builder: &mut ModelBuilder,
        input: &str,
        offset: &str,
        mask: Option<&str>,
    ) -> String {
        builder.node(
            self.name.clone(),
            Op::DeformConv2d {
                input: input.to_string(),
                offset: offset.to_string(),
                mask: mask.map(str::to_string),
                weight: self.parameters.weight.clone(),
                bias: self.parameters.bias.clone(),
                params: self.params,
            },
        )
    }
}

pub fn sigmoid(builder: &mut ModelBuilder, name: &str, input: &str) -> String {
    builder.node(
        name,
        Op::Sigmoid {
            input: input.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use cp_core::SeededRng;

    use super::{BatchNorm, Conv2d, DEFAULT_BATCH_NORM_EPS, DeformConv2d, sigmoid};
    use crate::kernels::Conv2dParams;
    use crate::{GraphError, ModelBuilder, ReferenceExecutor};

    #[test]
    fn batch_norm_registers_affine_constants_only_when_requested() {
        let mut rng = SeededRng::new(0);
        let mut builder = ModelBuilder::new("bn");
        let x = builder.input("x", vec![1, 5]);
        let with = BatchNorm::new(&mut builder, &mut rng, "bn0", 5, DEFAULT_BATCH_NORM_EPS, true)
            .expect("affine");
        let without = BatchNorm::new(&mut builder, &mut rng, "bn1", 5, 1e-3, false)
            .expect("plain");
        let y0 = with.forward(&mut builder, &x);
        let y1 = without.forward(&mut builder, &y0);
        builder.output(y1);
        let spec = builder.finish().expect("model");

        assert_eq!(spec.constants().len(), 6);
        assert!(spec.constant("bn0.weight").is_some());
        assert!(spec.constant("bn1.weight").is_none());
        assert_eq!(without.eps(), 1e-3);
    }

    #[test]
    fn zero_feature_batch_norm_is_rejected() {
        let mut builder = ModelBuilder::new("bn");
        let err = BatchNorm::new(&mut builder, &mut SeededRng::new(0), "bn", 0, 1e-5, true)
            .expect_err("zero features");
        assert!(matches!(err, GraphError::InvalidModule { .. }));
    }

    #[test]
    fn conv_weights_respect_default_init_bound() {
        let mut rng = SeededRng::new(42);
        let mut builder = ModelBuilder::new("conv");
        let x = builder.input("x", vec![1, 4, 6, 6]);
        let conv = Conv2d::new(&mut builder, &mut rng, "conv", 4, 8, [3, 3], Conv2dParams::default())
            .expect("conv");
        let y = conv.forward(&mut builder, &x);
        builder.output(y);
        let spec = builder.finish().expect("model");

        let bound = 1.0 / 36f64.sqrt();
        let weight = spec.constant("conv.weight").expect("weight");
        assert_eq!(weight.shape(), &[8, 4, 3, 3]);
        assert!(weight.values().iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn deform_layer_wires_offset_and_mask_from_graph() {
        let mut rng = SeededRng::new(1);
        let mut builder = ModelBuilder::new("deform");
        let x = builder.input("x", vec![1, 2, 5, 5]);
        let padded = Conv2dParams {
            padding: [1, 1],
            ..Conv2dParams::default()
        };
        let offset_conv = Conv2d::new(&mut builder, &mut rng, "offset", 2, 18, [3, 3], padded)
            .expect("offset conv");
        let mask_conv =
            Conv2d::new(&mut builder, &mut rng, "mask", 2, 9, [3, 3], padded).expect("mask conv");
        let deform = DeformConv2d::new(&mut builder, &mut rng, "deform", 2, 3, [3, 3], padded, true)
            .expect("deform");

        let offset = offset_conv.forward(&mut builder, &x);
        let logits = mask_conv.forward(&mut builder, &x);
        let mask = sigmoid(&mut builder, "mask_sigmoid", &logits);
        let y = deform.forward(&mut builder, &x, &offset, Some(&mask));
        builder.output(y);
        let spec = builder.finish().expect("model");

        let input = rng.rand_tensor(vec![1, 2, 5, 5]).expect("input");
        let outputs = ReferenceExecutor::default()
            .run(&spec, &[input])
            .expect("run");
        assert_eq!(outputs.shapes(), vec![vec![1, 3, 5, 5]]);
    }
}
