#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

/// Floating element types a [`DenseTensor`] can hold.
pub trait Element: Copy + Send + Sync + PartialEq + fmt::Debug + 'static {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size - 1)
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )?;

        Ok(())
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions never move the cursor, so their stride is free.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenseTensorError {
    Meta(TensorMetaError),
    StorageLengthMismatch { expected: usize, actual: usize },
    DTypeMismatch { meta: DType, element: DType },
}

impl fmt::Display for DenseTensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(error) => write!(f, "invalid tensor metadata: {error}"),
            Self::StorageLengthMismatch { expected, actual } => write!(
                f,
                "storage length mismatch: expected={expected}, actual={actual}"
            ),
            Self::DTypeMismatch { meta, element } => write!(
                f,
                "metadata dtype {meta:?} does not match element dtype {element:?}"
            ),
        }
    }
}

impl std::error::Error for DenseTensorError {}

impl From<TensorMetaError> for DenseTensorError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

/// Owned value buffer plus the metadata that views it.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor<T: Element> {
    meta: TensorMeta,
    storage: Vec<T>,
}

impl<T: Element> DenseTensor<T> {
    pub fn from_contiguous(
        values: Vec<T>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        let meta = TensorMeta::from_shape(shape, T::DTYPE, device);
        meta.validate()?;
        if values.len() != meta.numel() {
            return Err(DenseTensorError::StorageLengthMismatch {
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        Ok(Self {
            meta,
            storage: values,
        })
    }

    /// Wraps a storage buffer viewed through arbitrary metadata.
    pub fn from_storage(meta: TensorMeta, storage: Vec<T>) -> Result<Self, DenseTensorError> {
        meta.validate()?;
        if meta.dtype() != T::DTYPE {
            return Err(DenseTensorError::DTypeMismatch {
                meta: meta.dtype(),
                element: T::DTYPE,
            });
        }
        let numel = meta.numel();
        if numel > 0 {
            let last = meta
                .shape()
                .iter()
                .map(|size| size - 1)
                .collect::<Vec<_>>();
            let needed = meta.storage_index_for(&last)? + 1;
            if storage.len() < needed {
                return Err(DenseTensorError::StorageLengthMismatch {
                    expected: needed,
                    actual: storage.len(),
                });
            }
        }
        Ok(Self { meta, storage })
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn storage(&self) -> &[T] {
        &self.storage
    }

    #[must_use]
    pub fn into_storage(self) -> Vec<T> {
        self.storage
    }
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

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DType, DenseTensor, DenseTensorError, Device, TensorMeta, TensorMetaError,
        contiguous_strides,
    };

    #[test]
    fn shape_builds_contiguous_strides() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4, 5], DType::F32, Device::Cpu);
        assert_eq!(meta.strides(), &[60, 20, 5, 1]);
        assert_eq!(meta.numel(), 120);
        assert_eq!(meta.rank(), 4);
        assert!(meta.is_contiguous());
    }

    #[test]
    fn zero_extent_shape_has_no_elements() {
        let meta = TensorMeta::from_shape(vec![1, 3, 0, 4], DType::F32, Device::Cpu);
        assert_eq!(meta.numel(), 0);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn singleton_dim_stride_variation_is_still_contiguous() {
        let meta = TensorMeta::from_shape_and_strides(
            vec![2, 1, 4],
            vec![4, 99, 1],
            0,
            DType::F32,
            Device::Cpu,
        )
        .expect("interior singleton stride should validate");
        assert!(meta.is_contiguous());
    }

    #[test]
    fn transposed_strides_are_not_contiguous() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 3], vec![1, 2], 0, DType::F32, Device::Cpu)
                .expect("meta should validate");
        assert!(!meta.is_contiguous());
    }

    #[test]
    fn custom_strides_index_into_storage() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![4, 1], 3, DType::F32, Device::Cpu)
                .expect("meta should validate");

        assert_eq!(meta.storage_index_for(&[0, 0]).expect("index 0,0"), 3);
        assert_eq!(meta.storage_index_for(&[1, 1]).expect("index 1,1"), 8);
    }

    #[test]
    fn index_rank_and_bounds_are_guarded() {
        let meta = TensorMeta::from_shape(vec![2, 3], DType::F32, Device::Cpu);

        let rank_err = meta
            .storage_index_for(&[1])
            .expect_err("rank mismatch should fail");
        assert!(matches!(
            rank_err,
            TensorMetaError::IndexRankMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let oob_err = meta
            .storage_index_for(&[2, 0])
            .expect_err("out-of-bounds index should fail");
        assert!(matches!(
            oob_err,
            TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: 2,
                size: 2
            }
        ));
    }

    #[test]
    fn meta_fingerprint_changes_when_offset_changes() {
        let a = TensorMeta::from_shape(vec![2, 2], DType::F32, Device::Cpu);
        let b = a.clone().with_storage_offset(1);
        assert_ne!(a.fingerprint64(), b.fingerprint64());
    }

    #[test]
    fn dense_tensor_rejects_wrong_storage_length() {
        let err = DenseTensor::<f32>::from_contiguous(vec![0.0; 5], vec![1, 1, 2, 3], Device::Cpu)
            .expect_err("length mismatch must fail closed");
        assert_eq!(
            err,
            DenseTensorError::StorageLengthMismatch {
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn dense_tensor_tracks_element_dtype() {
        let single = DenseTensor::<f32>::from_contiguous(vec![1.0], vec![1], Device::Cpu)
            .expect("f32 tensor");
        let double = DenseTensor::<f64>::from_contiguous(vec![1.0], vec![1], Device::Cpu)
            .expect("f64 tensor");
        assert_eq!(single.meta().dtype(), DType::F32);
        assert_eq!(double.meta().dtype(), DType::F64);
    }

    #[test]
    fn dense_tensor_from_storage_respects_offset_window() {
        let meta = TensorMeta::from_shape(vec![2], DType::F32, Device::Cpu).with_storage_offset(1);
        let tensor = DenseTensor::from_storage(meta, vec![9.0f32, 1.0, 2.0]).expect("window fits");
        let first = tensor.meta().storage_index_for(&[0]).expect("in bounds");
        assert_eq!(&tensor.storage()[first..first + 2], &[1.0, 2.0]);
    }

    #[test]
    fn dense_tensor_from_storage_rejects_short_buffer() {
        let meta = TensorMeta::from_shape(vec![3], DType::F32, Device::Cpu).with_storage_offset(1);
        let err = DenseTensor::from_storage(meta, vec![0.0f32; 3])
            .expect_err("window past the end must fail");
        assert_eq!(
            err,
            DenseTensorError::StorageLengthMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn dense_tensor_from_storage_rejects_dtype_mismatch() {
        let meta = TensorMeta::from_shape(vec![1], DType::F64, Device::Cpu);
        let err = DenseTensor::from_storage(meta, vec![0.0f32])
            .expect_err("dtype mismatch must fail");
        assert!(matches!(err, DenseTensorError::DTypeMismatch { .. }));
    }

    #[test]
    fn from_storage_accepts_strided_layouts() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![1, 2], 0, DType::F32, Device::Cpu)
                .expect("meta should validate");
        let tensor = DenseTensor::from_storage(meta, vec![0.0f32, 1.0, 2.0, 3.0]).expect("storage fits");
        assert!(!tensor.meta().is_contiguous());
        let index = tensor.meta().storage_index_for(&[0, 1]).expect("in bounds");
        assert_eq!(tensor.storage()[index], 2.0);
    }

    #[test]
    fn contiguous_stride_helper_handles_scalar() {
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
        }

        #[test]
        fn prop_contiguous_index_bounds(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let meta = TensorMeta::from_shape(shape.clone(), DType::F32, Device::Cpu);
            let max_index = shape.iter().map(|dim| dim - 1).collect::<Vec<_>>();
            let max_linear = meta.storage_index_for(max_index.as_slice()).expect("max index must be valid");
            prop_assert_eq!(max_linear + 1, meta.numel());
        }

        #[test]
        fn prop_rank_stride_mismatch_fail_closed(
            shape in prop::collection::vec(1usize..=4, 1..=4),
            extra in 1usize..=3,
        ) {
            let strides = vec![1usize; shape.len() + extra];
            let err = TensorMeta::from_shape_and_strides(shape, strides, 0, DType::F32, Device::Cpu)
                .expect_err("rank/stride mismatch must fail");
            prop_assert!(matches!(err, TensorMetaError::RankStrideMismatch { .. }), "got {err:?}");
        }
    }
}
