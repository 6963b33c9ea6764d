//! Built-in operator-coverage matrix.
//!
//! Every scenario is a plain value: a name, a family, a seed, the coverage
//! axes it exercises and a builder function. Builders own their RNG streams,
//! so scenarios share no state and can run in any order or subset.

use std::collections::BTreeSet;

use cp_core::{DEFAULT_SCENARIO_SEED, DenseTensor, SeededRng};
use cp_graph::modules::{BatchNorm, Conv2d, DEFAULT_BATCH_NORM_EPS, DeformConv2d, sigmoid};
use cp_graph::{Conv2dParams, GraphError, ModelBuilder, ModelSpec};
use serde::Serialize;

use crate::canonical_case_name;

/// Stream for parameter draws; inputs come from [`INPUT_STREAM`].
const PARAMETER_STREAM: u64 = 0;
const INPUT_STREAM: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    BatchNorm,
    DeformConv2d,
}

impl ModelFamily {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchNorm => "batch_norm",
            Self::DeformConv2d => "deform_conv2d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageAxis {
    /// Per-channel parameter vectors of a distinct length.
    ParameterCardinality,
    /// A non-default numeric stability constant such as `eps`.
    StabilityConstant,
    /// An optional tensor either omitted or supplied.
    OptionalInput,
    MultiOutput,
    HalfPrecisionParameters,
}

impl CoverageAxis {
    /// Axes that on their own justify a scenario's place in the matrix.
    #[must_use]
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            Self::ParameterCardinality | Self::StabilityConstant | Self::OptionalInput
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParameterCardinality => "parameter_cardinality",
            Self::StabilityConstant => "stability_constant",
            Self::OptionalInput => "optional_input",
            Self::MultiOutput => "multi_output",
            Self::HalfPrecisionParameters => "half_precision_parameters",
        }
    }
}

/// Model plus the concrete inputs it is traced and executed with.
#[derive(Debug, Clone)]
pub struct ScenarioSetup {
    pub model: ModelSpec,
    pub inputs: Vec<DenseTensor>,
}

impl ScenarioSetup {
    #[must_use]
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.inputs
            .iter()
            .map(|tensor| tensor.shape().to_vec())
            .collect()
    }
}

type ScenarioBuilder = fn(u64) -> Result<ScenarioSetup, GraphError>;

#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    name: &'static str,
    family: ModelFamily,
    seed: u64,
    axes: &'static [CoverageAxis],
    build: ScenarioBuilder,
}

impl Scenario {
    #[must_use]
    pub fn new(
        name: &'static str,
        family: ModelFamily,
        seed: u64,
        axes: &'static [CoverageAxis],
        build: ScenarioBuilder,
    ) -> Self {
        Self {
            name,
            family,
            seed,
            axes,
            build,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn family(&self) -> ModelFamily {
        self.family
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn axes(&self) -> &'static [CoverageAxis] {
        self.axes
    }

    pub fn setup(&self) -> Result<ScenarioSetup, String> {
        self.setup_with_seed(self.seed)
    }

    pub fn setup_with_seed(&self, seed: u64) -> Result<ScenarioSetup, String> {
        (self.build)(seed)
            .map_err(|error| format!("scenario '{}' setup failed: {error}", self.name))
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioRegistry {
    scenarios: Vec<Scenario>,
}

impl ScenarioRegistry {
    /// Validates and wraps `scenarios`.
    pub fn new(scenarios: Vec<Scenario>) -> Result<Self, String> {
        let registry = Self { scenarios };
        registry.validate()?;
        Ok(registry)
    }

    #[must_use]
    pub fn builtin() -> Self {
        Self {
            scenarios: vec![
                Scenario::new(
                    "f_batch_norm",
                    ModelFamily::BatchNorm,
                    DEFAULT_SCENARIO_SEED,
                    &[
                        CoverageAxis::ParameterCardinality,
                        CoverageAxis::StabilityConstant,
                        CoverageAxis::MultiOutput,
                    ],
                    build_f_batch_norm,
                ),
                Scenario::new(
                    "f_batch_norm_single_channel",
                    ModelFamily::BatchNorm,
                    DEFAULT_SCENARIO_SEED,
                    &[CoverageAxis::ParameterCardinality],
                    build_batch_norm_single_channel,
                ),
                Scenario::new(
                    "f_batch_norm_without_affine",
                    ModelFamily::BatchNorm,
                    DEFAULT_SCENARIO_SEED,
                    &[CoverageAxis::OptionalInput, CoverageAxis::StabilityConstant],
                    build_batch_norm_without_affine,
                ),
                Scenario::new(
                    "torchvision_deform_conv2d",
                    ModelFamily::DeformConv2d,
                    DEFAULT_SCENARIO_SEED,
                    &[
                        CoverageAxis::OptionalInput,
                        CoverageAxis::MultiOutput,
                        CoverageAxis::HalfPrecisionParameters,
                    ],
                    build_torchvision_deform_conv2d,
                ),
                Scenario::new(
                    "deform_conv2d_offset_only",
                    ModelFamily::DeformConv2d,
                    DEFAULT_SCENARIO_SEED,
                    &[CoverageAxis::OptionalInput],
                    build_deform_conv2d_offset_only,
                ),
                Scenario::new(
                    "deform_conv2d_with_mask",
                    ModelFamily::DeformConv2d,
                    DEFAULT_SCENARIO_SEED,
                    &[CoverageAxis::OptionalInput],
                    build_deform_conv2d_with_mask,
                ),
            ],
        }
    }

    #[must_use]
    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Scenario> {
        let wanted = canonical_case_name(name);
        self.scenarios
            .iter()
            .find(|scenario| canonical_case_name(scenario.name) == wanted)
    }

    /// Resolves `names` in registry order; an empty selection means all.
    pub fn select(&self, names: &[String]) -> Result<Vec<Scenario>, String> {
        if names.is_empty() {
            return Ok(self.scenarios.clone());
        }
        let mut wanted = BTreeSet::new();
        for name in names {
            let scenario = self.get(name).ok_or_else(|| {
                format!(
                    "unknown scenario '{name}'. known: {}",
                    self.scenarios
                        .iter()
                        .map(|scenario| scenario.name)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })?;
            wanted.insert(scenario.name);
        }
        Ok(self
            .scenarios
            .iter()
            .filter(|scenario| wanted.contains(scenario.name))
            .copied()
            .collect())
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for scenario in &self.scenarios {
            let canonical = canonical_case_name(scenario.name);
            if canonical.is_empty() {
                return Err("scenario name must not be empty".to_string());
            }
            if !seen.insert(canonical.clone()) {
                return Err(format!(
                    "scenario '{}' collides with another scenario as '{canonical}'",
                    scenario.name
                ));
            }
            if !scenario.axes.iter().any(|axis| axis.is_primary()) {
                return Err(format!(
                    "scenario '{}' must vary parameter cardinality, a stability constant or an optional input",
                    scenario.name
                ));
            }
        }
        Ok(())
    }
}

impl Default for ScenarioRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn streams(seed: u64) -> (SeededRng, SeededRng) {
    let root = SeededRng::new(seed);
    (root.derive(PARAMETER_STREAM), root.derive(INPUT_STREAM))
}

/// Three independent batch norms: lengths 16/2/3 with eps default/1e-3/1e-2.
fn build_f_batch_norm(seed: u64) -> Result<ScenarioSetup, GraphError> {
    let (mut params, mut data) = streams(seed);
    let mut builder = ModelBuilder::new("f_batch_norm");
    let x = builder.input("x", vec![1, 16]);
    let y = builder.input("y", vec![1, 2, 16]);
    let z = builder.input("z", vec![1, 3, 12, 16]);

    let bn_x = BatchNorm::new(&mut builder, &mut params, "bn_x", 16, DEFAULT_BATCH_NORM_EPS, true)?;
    let bn_y = BatchNorm::new(&mut builder, &mut params, "bn_y", 2, 1e-3, true)?;
    let bn_z = BatchNorm::new(&mut builder, &mut params, "bn_z", 3, 1e-2, true)?;
    for (layer, input) in [(&bn_x, &x), (&bn_y, &y), (&bn_z, &z)] {
        let output = layer.forward(&mut builder, input);
        builder.output(output);
    }

    let inputs = vec![
        data.rand_tensor(vec![1, 16])?,
        data.rand_tensor(vec![1, 2, 16])?,
        data.rand_tensor(vec![1, 3, 12, 16])?,
    ];
    Ok(ScenarioSetup {
        model: builder.finish()?,
        inputs,
    })
}

fn build_batch_norm_single_channel(seed: u64) -> Result<ScenarioSetup, GraphError> {
    let (mut params, mut data) = streams(seed);
    let mut builder = ModelBuilder::new("f_batch_norm_single_channel");
    let x = builder.input("x", vec![1, 1, 8]);
    let bn = BatchNorm::new(&mut builder, &mut params, "bn", 1, DEFAULT_BATCH_NORM_EPS, true)?;
    let y = bn.forward(&mut builder, &x);
    builder.output(y);
    Ok(ScenarioSetup {
        model: builder.finish()?,
        inputs: vec![data.rand_tensor(vec![1, 1, 8])?],
    })
}

fn build_batch_norm_without_affine(seed: u64) -> Result<ScenarioSetup, GraphError> {
    let (mut params, mut data) = streams(seed);
    let mut builder = ModelBuilder::new("f_batch_norm_without_affine");
    let x = builder.input("x", vec![1, 4, 6]);
    let bn = BatchNorm::new(&mut builder, &mut params, "bn", 4, 1e-4, false)?;
    let y = bn.forward(&mut builder, &x);
    builder.output(y);
    Ok(ScenarioSetup {
        model: builder.finish()?,
        inputs: vec![data.rand_tensor(vec![1, 4, 6])?],
    })
}

/// One offset feeds two deformable convolutions, the second also modulated
/// by a sigmoid mask. Parameters pass through binary16 before use.
fn build_torchvision_deform_conv2d(seed: u64) -> Result<ScenarioSetup, GraphError> {
    let (mut params, mut data) = streams(seed);
    let plain = Conv2dParams::default();
    let mut builder = ModelBuilder::new("torchvision_deform_conv2d");
    let x = builder.input("x", vec![1, 12, 64, 64]);

    let conv_0 = Conv2d::new(&mut builder, &mut params, "conv_0", 12, 2 * 3 * 3, [3, 3], plain)?;
    let conv_1 = DeformConv2d::new(&mut builder, &mut params, "conv_1", 12, 16, [3, 3], plain, true)?;
    let conv_2 = Conv2d::new(&mut builder, &mut params, "conv_2", 12, 3 * 3, [3, 3], plain)?;
    let conv_3 = DeformConv2d::new(&mut builder, &mut params, "conv_3", 12, 16, [3, 3], plain, true)?;

    let offset = conv_0.forward(&mut builder, &x);
    let x1 = conv_1.forward(&mut builder, &x, &offset, None);
    let logits = conv_2.forward(&mut builder, &x);
    let mask = sigmoid(&mut builder, "mask", &logits);
    let x2 = conv_3.forward(&mut builder, &x, &offset, Some(&mask));
    builder.output(x1);
    builder.output(x2);

    Ok(ScenarioSetup {
        model: builder.finish()?.with_constants_rounded_to_f16(),
        inputs: vec![data.rand_tensor(vec![1, 12, 64, 64])?],
    })
}

fn padded_3x3() -> Conv2dParams {
    Conv2dParams {
        padding: [1, 1],
        ..Conv2dParams::default()
    }
}

fn build_deform_conv2d_offset_only(seed: u64) -> Result<ScenarioSetup, GraphError> {
    let (mut params, mut data) = streams(seed);
    let mut builder = ModelBuilder::new("deform_conv2d_offset_only");
    let x = builder.input("x", vec![1, 4, 10, 10]);
    let offset_conv = Conv2d::new(&mut builder, &mut params, "offset", 4, 18, [3, 3], padded_3x3())?;
    let deform =
        DeformConv2d::new(&mut builder, &mut params, "deform", 4, 6, [3, 3], padded_3x3(), true)?;
    let offset = offset_conv.forward(&mut builder, &x);
    let y = deform.forward(&mut builder, &x, &offset, None);
    builder.output(y);
    Ok(ScenarioSetup {
        model: builder.finish()?,
        inputs: vec![data.rand_tensor(vec![1, 4, 10, 10])?],
    })
}

fn build_deform_conv2d_with_mask(seed: u64) -> Result<ScenarioSetup, GraphError> {
    let (mut params, mut data) = streams(seed);
    let mut builder = ModelBuilder::new("deform_conv2d_with_mask");
    let x = builder.input("x", vec![1, 4, 10, 10]);
    let offset_conv = Conv2d::new(&mut builder, &mut params, "offset", 4, 18, [3, 3], padded_3x3())?;
    let mask_conv = Conv2d::new(&mut builder, &mut params, "mask_logits", 4, 9, [3, 3], padded_3x3())?;
    let deform =
        DeformConv2d::new(&mut builder, &mut params, "deform", 4, 6, [3, 3], padded_3x3(), false)?;
    let offset = offset_conv.forward(&mut builder, &x);
    let logits = mask_conv.forward(&mut builder, &x);
    let mask = sigmoid(&mut builder, "mask", &logits);
    let y = deform.forward(&mut builder, &x, &offset, Some(&mask));
    builder.output(y);
    Ok(ScenarioSetup {
        model: builder.finish()?,
        inputs: vec![data.rand_tensor(vec![1, 4, 10, 10])?],
    })
}

#[cfg(test)]
mod tests {
    use cp_graph::ReferenceExecutor;

    use super::{CoverageAxis, ModelFamily, Scenario, ScenarioRegistry, build_batch_norm_single_channel};

    #[test]
    fn builtin_registry_is_valid_and_complete() {
        let registry = ScenarioRegistry::builtin();
        registry.validate().expect("builtin registry validates");
        assert_eq!(registry.len(), 6);
        for name in [
            "f_batch_norm",
            "f_batch_norm_single_channel",
            "f_batch_norm_without_affine",
            "torchvision_deform_conv2d",
            "deform_conv2d_offset_only",
            "deform_conv2d_with_mask",
        ] {
            assert!(registry.get(name).is_some(), "missing scenario {name}");
        }
    }

    #[test]
    fn batch_norm_scenario_declares_three_inputs_and_outputs() {
        let registry = ScenarioRegistry::builtin();
        let setup = registry
            .get("f_batch_norm")
            .expect("scenario")
            .setup()
            .expect("setup");
        assert_eq!(
            setup.input_shapes(),
            vec![vec![1, 16], vec![1, 2, 16], vec![1, 3, 12, 16]]
        );
        assert_eq!(setup.model.outputs().len(), 3);
        assert_eq!(
            setup.model.constant("bn_y.running_mean").map(|t| t.shape().to_vec()),
            Some(vec![2])
        );
    }

    #[test]
    fn torchvision_scenario_holds_half_precision_parameters() {
        let registry = ScenarioRegistry::builtin();
        let setup = registry
            .get("torchvision_deform_conv2d")
            .expect("scenario")
            .setup()
            .expect("setup");
        assert_eq!(setup.model.outputs().len(), 2);
        for tensor in setup.model.constants().values() {
            for value in tensor.values() {
                let narrowed = half::f16::from_f64(*value).to_f64();
                assert_eq!(narrowed, *value);
            }
        }
    }

    #[test]
    fn same_seed_gives_identical_reference_outputs() {
        let registry = ScenarioRegistry::builtin();
        let scenario = registry.get("deform_conv2d_with_mask").expect("scenario");
        let run = || {
            let setup = scenario.setup().expect("setup");
            ReferenceExecutor::default()
                .run(&setup.model, &setup.inputs)
                .expect("reference")
        };
        assert_eq!(run(), run());
        let other = scenario.setup_with_seed(99).expect("setup");
        assert_ne!(other.inputs, scenario.setup().expect("setup").inputs);
    }

    #[test]
    fn select_keeps_registry_order_and_rejects_unknown_names() {
        let registry = ScenarioRegistry::builtin();
        let picked = registry
            .select(&["deform_conv2d_with_mask".to_string(), "F_Batch_Norm".to_string()])
            .expect("select");
        let names: Vec<_> = picked.iter().map(Scenario::name).collect();
        assert_eq!(names, vec!["f_batch_norm", "deform_conv2d_with_mask"]);

        let err = registry
            .select(&["nope".to_string()])
            .expect_err("unknown scenario");
        assert!(err.contains("unknown scenario 'nope'"));
    }

    #[test]
    fn validation_rejects_colliding_names_and_missing_axes() {
        let axes: &'static [CoverageAxis] = &[CoverageAxis::ParameterCardinality];
        let a = Scenario::new("BN case", ModelFamily::BatchNorm, 0, axes, build_batch_norm_single_channel);
        let b = Scenario::new("bn_case", ModelFamily::BatchNorm, 0, axes, build_batch_norm_single_channel);
        let err = ScenarioRegistry::new(vec![a, b]).expect_err("collision");
        assert!(err.contains("collides"));

        let untagged = Scenario::new(
            "multi_only",
            ModelFamily::BatchNorm,
            0,
            &[CoverageAxis::MultiOutput],
            build_batch_norm_single_channel,
        );
        assert!(ScenarioRegistry::new(vec![untagged]).is_err());
    }
}
