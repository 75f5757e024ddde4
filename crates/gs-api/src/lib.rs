#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use gs_core::DenseTensor;
use gs_kernel_cpu::{
    ConfigError, GridSampleMode, GridSampleOptions, KernelError, PaddingMode, Parallelism,
    SampleFloat, grid_sample_with,
};
use gs_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MODE_ATTRIBUTE: &str = "mode";
pub const PADDING_MODE_ATTRIBUTE: &str = "padding_mode";
pub const ALIGN_CORNERS_ATTRIBUTE: &str = "align_corners";

/// A named operator attribute as it arrives from a graph description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Str(String),
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Resolves the attribute bag into typed options; absent keys keep their defaults.
pub fn resolve_options(attributes: &Attributes) -> Result<GridSampleOptions, ConfigError> {
    let mut options = GridSampleOptions::default();
    for (name, value) in attributes {
        match name.as_str() {
            MODE_ATTRIBUTE => {
                options.mode = expect_str(name, value)?.parse::<GridSampleMode>()?;
            }
            PADDING_MODE_ATTRIBUTE => {
                options.padding_mode = expect_str(name, value)?.parse::<PaddingMode>()?;
            }
            ALIGN_CORNERS_ATTRIBUTE => {
                options.align_corners = match expect_int(name, value)? {
                    0 => false,
                    1 => true,
                    other => return Err(ConfigError::InvalidAlignCorners { value: other }),
                };
            }
            _ => {
                return Err(ConfigError::UnknownAttribute { name: name.clone() });
            }
        }
    }
    Ok(options)
}

fn expect_str<'a>(name: &str, value: &'a AttributeValue) -> Result<&'a str, ConfigError> {
    match value {
        AttributeValue::Str(raw) => Ok(raw),
        AttributeValue::Int(_) => Err(ConfigError::AttributeType {
            name: name.to_string(),
            expected: "a string",
        }),
    }
}

fn expect_int(name: &str, value: &AttributeValue) -> Result<i64, ConfigError> {
    match value {
        AttributeValue::Int(raw) => Ok(*raw),
        AttributeValue::Str(_) => Err(ConfigError::AttributeType {
            name: name.to_string(),
            expected: "an integer",
        }),
    }
}

/// Attribute bag for `options`, the inverse of [`resolve_options`].
#[must_use]
pub fn options_to_attributes(options: &GridSampleOptions) -> Attributes {
    Attributes::from([
        (MODE_ATTRIBUTE.to_string(), options.mode.as_str().into()),
        (
            PADDING_MODE_ATTRIBUTE.to_string(),
            options.padding_mode.as_str().into(),
        ),
        (
            ALIGN_CORNERS_ATTRIBUTE.to_string(),
            i64::from(options.align_corners).into(),
        ),
    ])
}

/// Operator instance with its options resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSampler {
    options: GridSampleOptions,
}

impl GridSampler {
    #[must_use]
    pub fn new(options: GridSampleOptions) -> Self {
        Self { options }
    }

    pub fn from_attributes(attributes: &Attributes) -> Result<Self, KernelError> {
        Ok(Self::new(resolve_options(attributes)?))
    }

    #[must_use]
    pub fn options(&self) -> &GridSampleOptions {
        &self.options
    }

    pub fn run<T: SampleFloat>(
        &self,
        input: &DenseTensor<T>,
        grid: &DenseTensor<T>,
        parallelism: Parallelism,
    ) -> Result<DenseTensor<T>, KernelError> {
        grid_sample_with(input, grid, &self.options, parallelism)
    }
}

#[derive(Debug, Clone)]
pub struct GridSampleSession {
    runtime: RuntimeContext,
}

impl GridSampleSession {
    #[must_use]
    pub fn new(parallelism: Parallelism) -> Self {
        Self {
            runtime: RuntimeContext::new(parallelism),
        }
    }

    /// Session whose evidence ledger keeps at most `max_entries` entries.
    #[must_use]
    pub fn with_evidence_capacity(parallelism: Parallelism, max_entries: usize) -> Self {
        Self {
            runtime: RuntimeContext::with_ledger_capacity(parallelism, max_entries),
        }
    }

    #[must_use]
    pub fn parallelism(&self) -> Parallelism {
        self.runtime.parallelism()
    }

    pub fn set_parallelism(&mut self, parallelism: Parallelism) {
        self.runtime.set_parallelism(parallelism);
    }

    pub fn grid_sample<T: SampleFloat>(
        &mut self,
        input: &DenseTensor<T>,
        grid: &DenseTensor<T>,
        attributes: &Attributes,
    ) -> Result<DenseTensor<T>, KernelError> {
        let options = match resolve_options(attributes) {
            Ok(options) => options,
            Err(error) => {
                let error = KernelError::from(error);
                self.reject(&error);
                return Err(error);
            }
        };
        self.grid_sample_with_options(input, grid, &options)
    }

    pub fn grid_sample_with_options<T: SampleFloat>(
        &mut self,
        input: &DenseTensor<T>,
        grid: &DenseTensor<T>,
        options: &GridSampleOptions,
    ) -> Result<DenseTensor<T>, KernelError> {
        let parallelism = self.parallelism();
        match GridSampler::new(*options).run(input, grid, parallelism) {
            Ok(output) => {
                let summary = format!(
                    "op=grid_sample mode={} padding_mode={} align_corners={} dtype={:?} input={:?} input_meta=0x{:016x} grid={:?} output={:?} parallelism={}",
                    options.mode.as_str(),
                    options.padding_mode.as_str(),
                    options.align_corners,
                    T::DTYPE,
                    input.shape(),
                    input.meta().fingerprint64(),
                    grid.shape(),
                    output.shape(),
                    parallelism.as_str()
                );
                debug!("{summary}");
                self.runtime
                    .ledger_mut()
                    .record(EvidenceKind::Dispatch, summary);
                Ok(output)
            }
            Err(error) => {
                self.reject(&error);
                Err(error)
            }
        }
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    /// Takes the recorded evidence, leaving the session ledger empty.
    pub fn drain_evidence(&mut self) -> Vec<EvidenceEntry> {
        self.runtime.ledger_mut().drain()
    }

    fn reject(&mut self, error: &KernelError) {
        warn!(class = error.class_label(), "grid_sample rejected: {error}");
        self.runtime.record_rejection("grid_sample", error);
    }
}

impl Default for GridSampleSession {
    fn default() -> Self {
        Self::new(Parallelism::default())
    }
}

#[cfg(test)]
mod tests {
    use gs_core::{DenseTensor, Device};
    use gs_kernel_cpu::{
        ConfigError, GridSampleMode, GridSampleOptions, KernelError, PaddingMode, Parallelism,
    };
    use gs_runtime::EvidenceKind;
    use proptest::prelude::*;

    use super::{
        AttributeValue, Attributes, GridSampleSession, GridSampler, options_to_attributes,
        resolve_options,
    };

    fn attrs(pairs: &[(&str, AttributeValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    fn three_by_two() -> DenseTensor<f32> {
        DenseTensor::from_contiguous(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], vec![1, 1, 3, 2], Device::Cpu)
            .expect("input tensor")
    }

    fn corner_grid() -> DenseTensor<f32> {
        DenseTensor::from_contiguous(
            vec![-1.0, -1.0, 0.5, 0.5, 1.0, 1.0],
            vec![1, 1, 3, 2],
            Device::Cpu,
        )
        .expect("grid tensor")
    }

    #[test]
    fn empty_attributes_resolve_to_defaults() {
        let options = resolve_options(&Attributes::new()).expect("defaults should resolve");
        assert_eq!(options, GridSampleOptions::default());
    }

    #[test]
    fn attributes_resolve_every_key() {
        let options = resolve_options(&attrs(&[
            ("mode", "bicubic".into()),
            ("padding_mode", "reflection".into()),
            ("align_corners", AttributeValue::Int(1)),
        ]))
        .expect("full attribute set should resolve");
        assert_eq!(
            options,
            GridSampleOptions::new(GridSampleMode::Bicubic, PaddingMode::Reflection, true)
        );
    }

    #[test]
    fn unknown_mode_name_is_rejected() {
        let err = resolve_options(&attrs(&[("mode", "linear".into())]))
            .expect_err("unrecognised mode must fail");
        assert_eq!(
            err,
            ConfigError::UnknownMode {
                value: "linear".to_string()
            }
        );
    }

    #[test]
    fn align_corners_outside_flag_range_is_rejected() {
        let err = resolve_options(&attrs(&[("align_corners", AttributeValue::Int(2))]))
            .expect_err("align_corners=2 must fail");
        assert_eq!(err, ConfigError::InvalidAlignCorners { value: 2 });
    }

    #[test]
    fn wrongly_typed_attribute_is_rejected() {
        let err = resolve_options(&attrs(&[("align_corners", "true".into())]))
            .expect_err("string align_corners must fail");
        assert!(matches!(err, ConfigError::AttributeType { .. }));
        let err = resolve_options(&attrs(&[("padding_mode", AttributeValue::Int(0))]))
            .expect_err("integer padding_mode must fail");
        assert!(matches!(err, ConfigError::AttributeType { .. }));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let err = resolve_options(&attrs(&[("antialias", AttributeValue::Int(1))]))
            .expect_err("unknown key must fail");
        assert_eq!(
            err,
            ConfigError::UnknownAttribute {
                name: "antialias".to_string()
            }
        );
    }

    #[test]
    fn attribute_values_deserialize_untagged() {
        let parsed: Attributes =
            serde_json::from_str(r#"{"mode":"nearest","align_corners":1}"#).expect("attribute json");
        assert_eq!(parsed["mode"], AttributeValue::Str("nearest".to_string()));
        assert_eq!(parsed["align_corners"], AttributeValue::Int(1));
    }

    #[test]
    fn sampler_built_once_runs_repeatedly() {
        let sampler = GridSampler::from_attributes(&attrs(&[
            ("mode", "nearest".into()),
            ("align_corners", AttributeValue::Int(1)),
        ]))
        .expect("sampler should build");
        let first = sampler
            .run(&three_by_two(), &corner_grid(), Parallelism::Serial)
            .expect("first run");
        let second = sampler
            .run(&three_by_two(), &corner_grid(), Parallelism::Rayon)
            .expect("second run");
        assert_eq!(first.storage(), &[0.0, 5.0, 5.0]);
        assert_eq!(first, second);
    }

    #[test]
    fn sampler_from_bad_attributes_is_invalid_configuration() {
        let err = GridSampler::from_attributes(&attrs(&[("padding_mode", "wrap".into())]))
            .expect_err("bad padding must fail");
        assert_eq!(err.class_label(), "invalid_configuration");
    }

    #[test]
    fn session_records_dispatch_evidence() {
        let mut session = GridSampleSession::new(Parallelism::Serial);
        let out = session
            .grid_sample(&three_by_two(), &corner_grid(), &Attributes::new())
            .expect("default sample should succeed");
        assert_eq!(out.shape(), &[1, 1, 1, 3]);

        assert_eq!(session.evidence_len(), 2);
        let dispatch = &session.evidence()[1];
        assert_eq!(dispatch.kind, EvidenceKind::Dispatch);
        assert!(dispatch.summary.contains("mode=bilinear"));
        assert!(dispatch.summary.contains("padding_mode=zeros"));
        assert!(dispatch.summary.contains("parallelism=serial"));
    }

    #[test]
    fn session_records_rejection_for_bad_attributes() {
        let mut session = GridSampleSession::default();
        let err = session
            .grid_sample(&three_by_two(), &corner_grid(), &attrs(&[("mode", "area".into())]))
            .expect_err("unknown mode must be rejected");
        assert!(matches!(err, KernelError::InvalidConfiguration(_)));
        let last = session.evidence().last().expect("rejection entry");
        assert_eq!(last.kind, EvidenceKind::Rejection);
        assert!(last.summary.contains("unknown mode 'area'"));
    }

    #[test]
    fn session_records_rejection_for_shape_mismatch() {
        let mut session = GridSampleSession::new(Parallelism::Rayon);
        let grid = DenseTensor::from_contiguous(vec![0.0f32; 4], vec![2, 1, 1, 2], Device::Cpu)
            .expect("grid tensor");
        let err = session
            .grid_sample_with_options(&three_by_two(), &grid, &GridSampleOptions::default())
            .expect_err("batch mismatch must be rejected");
        assert_eq!(err.class_label(), "shape_mismatch");
        let last = session.evidence().last().expect("rejection entry");
        assert_eq!(last.kind, EvidenceKind::Rejection);
    }

    #[test]
    fn session_parallelism_switch_keeps_results() {
        let mut session = GridSampleSession::new(Parallelism::Serial);
        let attributes = attrs(&[("mode", "bicubic".into())]);
        let serial = session
            .grid_sample(&three_by_two(), &corner_grid(), &attributes)
            .expect("serial sample");
        session.set_parallelism(Parallelism::Rayon);
        let parallel = session
            .grid_sample(&three_by_two(), &corner_grid(), &attributes)
            .expect("rayon sample");
        assert_eq!(serial, parallel);
        assert_eq!(session.parallelism(), Parallelism::Rayon);
    }

    #[test]
    fn long_running_session_keeps_bounded_evidence() {
        let mut session = GridSampleSession::with_evidence_capacity(Parallelism::Serial, 4);
        for _ in 0..10 {
            session
                .grid_sample(&three_by_two(), &corner_grid(), &Attributes::new())
                .expect("default sample should succeed");
        }
        assert_eq!(session.evidence_len(), 4);
        assert!(
            session
                .evidence()
                .iter()
                .all(|entry| entry.kind == EvidenceKind::Dispatch)
        );

        let drained = session.drain_evidence();
        assert_eq!(drained.len(), 4);
        assert_eq!(session.evidence_len(), 0);
    }

    fn options_strategy() -> impl Strategy<Value = GridSampleOptions> {
        (
            prop_oneof![
                Just(GridSampleMode::Nearest),
                Just(GridSampleMode::Bilinear),
                Just(GridSampleMode::Bicubic),
            ],
            prop_oneof![
                Just(PaddingMode::Zeros),
                Just(PaddingMode::Border),
                Just(PaddingMode::Reflection),
            ],
            any::<bool>(),
        )
            .prop_map(|(mode, padding_mode, align_corners)| {
                GridSampleOptions::new(mode, padding_mode, align_corners)
            })
    }

    proptest! {
        #[test]
        fn prop_attribute_bag_round_trips_options(options in options_strategy()) {
            let resolved = resolve_options(&options_to_attributes(&options))
                .expect("rendered attributes resolve");
            prop_assert_eq!(resolved, options);
        }

        #[test]
        fn prop_align_corners_only_accepts_flags(value in any::<i64>()) {
            let result = resolve_options(&attrs(&[("align_corners", value.into())]));
            prop_assert_eq!(result.is_ok(), value == 0 || value == 1);
        }
    }
}
