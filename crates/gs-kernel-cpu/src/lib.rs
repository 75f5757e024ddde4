#![forbid(unsafe_code)]

mod sampling;

use std::fmt;
use std::str::FromStr;

use gs_core::{DType, DenseTensor, DenseTensorError, Device, TensorMeta};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use sampling::SampleGeometry;
pub use sampling::{
    SampleFloat, cubic_convolution_weights, denormalize_coordinate, reflect_coordinate,
    resolve_lattice_index,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSampleMode {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl GridSampleMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Bicubic => "bicubic",
        }
    }
}

impl FromStr for GridSampleMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "bicubic" => Ok(Self::Bicubic),
            _ => Err(ConfigError::UnknownMode {
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingMode {
    #[default]
    Zeros,
    Border,
    Reflection,
}

impl PaddingMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Zeros => "zeros",
            Self::Border => "border",
            Self::Reflection => "reflection",
        }
    }
}

impl FromStr for PaddingMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "zeros" => Ok(Self::Zeros),
            "border" => Ok(Self::Border),
            "reflection" => Ok(Self::Reflection),
            _ => Err(ConfigError::UnknownPaddingMode {
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSampleOptions {
    pub mode: GridSampleMode,
    pub padding_mode: PaddingMode,
    pub align_corners: bool,
}

impl GridSampleOptions {
    #[must_use]
    pub fn new(mode: GridSampleMode, padding_mode: PaddingMode, align_corners: bool) -> Self {
        Self {
            mode,
            padding_mode,
            align_corners,
        }
    }
}

/// How output elements are scheduled; never changes the numeric result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parallelism {
    Serial,
    #[default]
    Rayon,
}

impl Parallelism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Rayon => "rayon",
        }
    }
}

impl FromStr for Parallelism {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "serial" => Ok(Self::Serial),
            "rayon" => Ok(Self::Rayon),
            _ => Err(ConfigError::UnknownParallelism {
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownMode { value: String },
    UnknownPaddingMode { value: String },
    UnknownParallelism { value: String },
    InvalidAlignCorners { value: i64 },
    UnknownAttribute { name: String },
    AttributeType { name: String, expected: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMode { value } => write!(
                f,
                "unknown mode '{value}'; expected nearest|bilinear|bicubic"
            ),
            Self::UnknownPaddingMode { value } => write!(
                f,
                "unknown padding_mode '{value}'; expected zeros|border|reflection"
            ),
            Self::UnknownParallelism { value } => {
                write!(f, "unknown parallelism '{value}'; expected serial|rayon")
            }
            Self::InvalidAlignCorners { value } => {
                write!(f, "align_corners must be 0 or 1, got {value}")
            }
            Self::UnknownAttribute { name } => write!(f, "unknown attribute '{name}'"),
            Self::AttributeType { name, expected } => {
                write!(f, "attribute '{name}' must be {expected}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeMismatch {
    InputRank { actual: usize },
    GridRank { actual: usize },
    GridCoordinateDim { actual: usize },
    BatchSize { input: usize, grid: usize },
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputRank { actual } => {
                write!(f, "input must be rank 4 (N, C, H, W), got rank {actual}")
            }
            Self::GridRank { actual } => write!(
                f,
                "grid must be rank 4 (N, H_out, W_out, 2), got rank {actual}"
            ),
            Self::GridCoordinateDim { actual } => write!(
                f,
                "grid trailing dimension must be 2, got {actual}"
            ),
            Self::BatchSize { input, grid } => {
                write!(f, "batch size mismatch: input={input}, grid={grid}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ShapeMismatch(ShapeMismatch),
    InvalidConfiguration(ConfigError),
    DTypeMismatch {
        side: &'static str,
        expected: DType,
        actual: DType,
    },
    UnsupportedDevice {
        side: &'static str,
        device: Device,
    },
    UnsupportedLayout {
        side: &'static str,
    },
    StorageSpanOverflow {
        side: &'static str,
        storage_offset: usize,
        numel: usize,
    },
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
    Tensor(DenseTensorError),
}

impl KernelError {
    /// Stable snake_case label for the failure class.
    #[must_use]
    pub fn class_label(&self) -> &'static str {
        match self {
            Self::ShapeMismatch(_) => "shape_mismatch",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::DTypeMismatch { .. } => "dtype_mismatch",
            Self::UnsupportedDevice { .. } => "unsupported_device",
            Self::UnsupportedLayout { .. } => "unsupported_layout",
            Self::StorageSpanOverflow { .. } | Self::InsufficientStorage { .. } => {
                "storage_violation"
            }
            Self::Tensor(_) => "tensor_construction",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch(error) => write!(f, "shape mismatch: {error}"),
            Self::InvalidConfiguration(error) => write!(f, "invalid configuration: {error}"),
            Self::DTypeMismatch {
                side,
                expected,
                actual,
            } => write!(
                f,
                "dtype mismatch on {side}: expected={expected:?}, actual={actual:?}"
            ),
            Self::UnsupportedDevice { side, device } => {
                write!(f, "unsupported device {device:?} on {side}")
            }
            Self::UnsupportedLayout { side } => {
                write!(f, "unsupported non-contiguous layout on {side}")
            }
            Self::StorageSpanOverflow {
                side,
                storage_offset,
                numel,
            } => write!(
                f,
                "storage span overflow on {side}: storage_offset={storage_offset}, numel={numel}"
            ),
            Self::InsufficientStorage {
                side,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {side}: needed={needed}, available={available}"
            ),
            Self::Tensor(error) => write!(f, "output tensor construction failed: {error}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<ShapeMismatch> for KernelError {
    fn from(value: ShapeMismatch) -> Self {
        Self::ShapeMismatch(value)
    }
}

impl From<ConfigError> for KernelError {
    fn from(value: ConfigError) -> Self {
        Self::InvalidConfiguration(value)
    }
}

impl From<DenseTensorError> for KernelError {
    fn from(value: DenseTensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Extents of one grid-sample call, all taken from validated metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSampleDims {
    pub batch: usize,
    pub channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub out_height: usize,
    pub out_width: usize,
}

impl GridSampleDims {
    #[must_use]
    pub fn output_shape(&self) -> [usize; 4] {
        [self.batch, self.channels, self.out_height, self.out_width]
    }

    fn input_plane(&self) -> usize {
        self.in_height * self.in_width
    }

    fn output_plane(&self) -> usize {
        self.out_height * self.out_width
    }
}

/// Checks ranks, the coordinate dimension and batch agreement.
pub fn grid_sample_dims(
    input_meta: &TensorMeta,
    grid_meta: &TensorMeta,
) -> Result<GridSampleDims, KernelError> {
    let &[batch, channels, in_height, in_width] = input_meta.shape() else {
        return Err(ShapeMismatch::InputRank {
            actual: input_meta.rank(),
        }
        .into());
    };
    let &[grid_batch, out_height, out_width, coords] = grid_meta.shape() else {
        return Err(ShapeMismatch::GridRank {
            actual: grid_meta.rank(),
        }
        .into());
    };
    if coords != 2 {
        return Err(ShapeMismatch::GridCoordinateDim { actual: coords }.into());
    }
    if batch != grid_batch {
        return Err(ShapeMismatch::BatchSize {
            input: batch,
            grid: grid_batch,
        }
        .into());
    }

    Ok(GridSampleDims {
        batch,
        channels,
        in_height,
        in_width,
        out_height,
        out_width,
    })
}

/// Output shape `(N, C, H_out, W_out)` for a grid-sample call.
pub fn grid_sample_output_shape(
    input_meta: &TensorMeta,
    grid_meta: &TensorMeta,
) -> Result<[usize; 4], KernelError> {
    grid_sample_dims(input_meta, grid_meta).map(|dims| dims.output_shape())
}

fn ensure_meta_supported<T: SampleFloat>(
    meta: &TensorMeta,
    side: &'static str,
) -> Result<(), KernelError> {
    if meta.dtype() != T::DTYPE {
        return Err(KernelError::DTypeMismatch {
            side,
            expected: T::DTYPE,
            actual: meta.dtype(),
        });
    }
    if meta.device() != Device::Cpu {
        return Err(KernelError::UnsupportedDevice {
            side,
            device: meta.device(),
        });
    }
    if !meta.is_contiguous() {
        return Err(KernelError::UnsupportedLayout { side });
    }
    Ok(())
}

fn contiguous_required_len(meta: &TensorMeta, side: &'static str) -> Result<usize, KernelError> {
    let numel = meta.numel();
    if numel == 0 {
        return Ok(0);
    }

    meta.storage_offset()
        .checked_add(numel)
        .ok_or(KernelError::StorageSpanOverflow {
            side,
            storage_offset: meta.storage_offset(),
            numel,
        })
}

fn contiguous_window<'a, T>(
    buffer: &'a [T],
    meta: &TensorMeta,
    side: &'static str,
) -> Result<&'a [T], KernelError> {
    let needed = contiguous_required_len(meta, side)?;
    if buffer.len() < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: buffer.len(),
        });
    }
    if needed == 0 {
        return Ok(&[]);
    }
    Ok(&buffer[meta.storage_offset()..needed])
}

pub fn grid_sample_contiguous<T: SampleFloat>(
    input: &[T],
    grid: &[T],
    input_meta: &TensorMeta,
    grid_meta: &TensorMeta,
    options: &GridSampleOptions,
) -> Result<Vec<T>, KernelError> {
    grid_sample_contiguous_with(
        input,
        grid,
        input_meta,
        grid_meta,
        options,
        Parallelism::default(),
    )
}

/// Samples `input` (N, C, H_in, W_in) at the normalized points of `grid` (N, H_out, W_out, 2).
///
/// Every validation runs before the first output element is computed, so a
/// failure never leaves partial output behind.
pub fn grid_sample_contiguous_with<T: SampleFloat>(
    input: &[T],
    grid: &[T],
    input_meta: &TensorMeta,
    grid_meta: &TensorMeta,
    options: &GridSampleOptions,
    parallelism: Parallelism,
) -> Result<Vec<T>, KernelError> {
    let dims = grid_sample_dims(input_meta, grid_meta)?;
    ensure_meta_supported::<T>(input_meta, "input")?;
    ensure_meta_supported::<T>(grid_meta, "grid")?;
    let input = contiguous_window(input, input_meta, "input")?;
    let grid = contiguous_window(grid, grid_meta, "grid")?;

    let output_len = dims.output_shape().iter().product::<usize>();
    if output_len == 0 {
        return Ok(Vec::new());
    }
    if dims.input_plane() == 0 {
        // No pixel exists to read; every lattice point resolves to zero.
        return Ok(vec![T::ZERO; output_len]);
    }

    let geometry = SampleGeometry::<T>::new(dims.in_height, dims.in_width, options);
    let batch_in = dims.channels * dims.input_plane();
    let batch_grid = dims.output_plane() * 2;
    let batch_out = dims.channels * dims.output_plane();

    let mut output = vec![T::ZERO; output_len];
    match parallelism {
        Parallelism::Serial => {
            for ((out, src), coords) in output
                .chunks_mut(batch_out)
                .zip(input.chunks(batch_in))
                .zip(grid.chunks(batch_grid))
            {
                sample_batch(&geometry, &dims, src, coords, out);
            }
        }
        Parallelism::Rayon => {
            output
                .par_chunks_mut(batch_out)
                .zip(input.par_chunks(batch_in))
                .zip(grid.par_chunks(batch_grid))
                .for_each(|((out, src), coords)| {
                    sample_batch(&geometry, &dims, src, coords, out);
                });
        }
    }

    Ok(output)
}

/// Fills one batch element; stencils are built once per location and reused per channel.
fn sample_batch<T: SampleFloat>(
    geometry: &SampleGeometry<T>,
    dims: &GridSampleDims,
    input: &[T],
    grid: &[T],
    output: &mut [T],
) {
    let plane_in = dims.input_plane();
    let plane_out = dims.output_plane();
    for (location, point) in grid.chunks_exact(2).enumerate() {
        let stencil = geometry.stencil(point[0], point[1]);
        for (channel, plane) in input.chunks_exact(plane_in).enumerate() {
            output[channel * plane_out + location] = stencil.apply(plane, geometry.width());
        }
    }
}

pub fn grid_sample<T: SampleFloat>(
    input: &DenseTensor<T>,
    grid: &DenseTensor<T>,
    options: &GridSampleOptions,
) -> Result<DenseTensor<T>, KernelError> {
    grid_sample_with(input, grid, options, Parallelism::default())
}

pub fn grid_sample_with<T: SampleFloat>(
    input: &DenseTensor<T>,
    grid: &DenseTensor<T>,
    options: &GridSampleOptions,
    parallelism: Parallelism,
) -> Result<DenseTensor<T>, KernelError> {
    let values = grid_sample_contiguous_with(
        input.storage(),
        grid.storage(),
        input.meta(),
        grid.meta(),
        options,
        parallelism,
    )?;
    let shape = grid_sample_output_shape(input.meta(), grid.meta())?;
    Ok(DenseTensor::from_contiguous(
        values,
        shape.to_vec(),
        input.meta().device(),
    )?)
}
