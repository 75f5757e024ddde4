use std::ops::{Add, Div, Mul, Rem, Sub};

use gs_core::Element;

use crate::{GridSampleMode, GridSampleOptions, PaddingMode};

/// Float arithmetic the sampling kernels need, implemented for `f32` and `f64`.
pub trait SampleFloat:
    Element
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Rem<Output = Self>
{
    const ZERO: Self;
    const ONE: Self;
    const TWO: Self;
    const HALF: Self;
    const NAN: Self;
    /// Keys cubic convolution coefficient.
    const CUBIC_A: Self;

    fn from_usize(value: usize) -> Self;
    fn from_lattice(index: i64) -> Self;
    /// Saturating conversion; NaN maps to 0.
    fn to_lattice(self) -> i64;
    fn floor(self) -> Self;
    fn trunc(self) -> Self;
    fn abs(self) -> Self;
    fn round_half_even(self) -> Self;
    fn is_finite(self) -> bool;
}

macro_rules! impl_sample_float {
    ($ty:ty) => {
        impl SampleFloat for $ty {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const TWO: Self = 2.0;
            const HALF: Self = 0.5;
            const NAN: Self = <$ty>::NAN;
            const CUBIC_A: Self = -0.75;

            fn from_usize(value: usize) -> Self {
                value as $ty
            }

            fn from_lattice(index: i64) -> Self {
                index as $ty
            }

            fn to_lattice(self) -> i64 {
                self as i64
            }

            fn floor(self) -> Self {
                <$ty>::floor(self)
            }

            fn trunc(self) -> Self {
                <$ty>::trunc(self)
            }

            fn abs(self) -> Self {
                <$ty>::abs(self)
            }

            fn round_half_even(self) -> Self {
                <$ty>::round_ties_even(self)
            }

            fn is_finite(self) -> bool {
                <$ty>::is_finite(self)
            }
        }
    };
}

impl_sample_float!(f32);
impl_sample_float!(f64);

/// Maps a normalized grid coordinate onto the pixel lattice of an axis with `size` samples.
///
/// With `align_corners` the extremes -1 and 1 land on the centers of the first
/// and last pixel; without it they land on the outer edges of those pixels.
#[must_use]
pub fn denormalize_coordinate<T: SampleFloat>(coord: T, size: usize, align_corners: bool) -> T {
    let extent = T::from_usize(size);
    if align_corners {
        (coord + T::ONE) / T::TWO * (extent - T::ONE)
    } else {
        ((coord + T::ONE) * extent - T::ONE) / T::TWO
    }
}

/// Folds a pixel-space coordinate back into the valid extent of the axis by mirroring.
#[must_use]
pub fn reflect_coordinate<T: SampleFloat>(x: T, size: usize, align_corners: bool) -> T {
    if align_corners {
        reflect_about_centers(x, size)
    } else {
        reflect_about_edges(x, size)
    }
}

/// Mirror axes at pixel centers 0 and size-1: period 2*size-2.
fn reflect_about_centers<T: SampleFloat>(x: T, size: usize) -> T {
    let lo = T::ZERO;
    let hi = T::from_usize(size) - T::ONE;
    triangle_wave(x, lo, hi)
}

/// Mirror axes at pixel edges -0.5 and size-0.5: period 2*size.
fn reflect_about_edges<T: SampleFloat>(x: T, size: usize) -> T {
    let lo = T::ZERO - T::HALF;
    let hi = T::from_usize(size) - T::HALF;
    triangle_wave(x, lo, hi)
}

fn triangle_wave<T: SampleFloat>(x: T, lo: T, hi: T) -> T {
    let span = hi - lo;
    if x < lo {
        let dx = lo - x;
        let flips = (dx / span).trunc();
        let rest = dx - flips * span;
        if is_even(flips) { lo + rest } else { hi - rest }
    } else if x > hi {
        let dx = x - hi;
        let flips = (dx / span).trunc();
        let rest = dx - flips * span;
        if is_even(flips) { hi - rest } else { lo + rest }
    } else {
        x
    }
}

fn is_even<T: SampleFloat>(value: T) -> bool {
    value % T::TWO == T::ZERO
}

/// Tap weights of the cubic convolution kernel for a fractional offset `t` in `[0, 1)`.
///
/// Taps sit at offsets -1, 0, 1, 2 from the floor of the sampling position.
#[must_use]
pub fn cubic_convolution_weights<T: SampleFloat>(t: T) -> [T; 4] {
    let a = T::CUBIC_A;
    let three = T::from_usize(3);
    let four = T::from_usize(4);
    let five = T::from_usize(5);
    let eight = T::from_usize(8);

    let x = t.abs();
    let outer_left = x + T::ONE;
    let inner_right = T::ONE - x;
    let outer_right = T::TWO - x;

    [
        ((a * outer_left - five * a) * outer_left + eight * a) * outer_left - four * a,
        ((a + T::TWO) * x - (a + three)) * x * x + T::ONE,
        ((a + T::TWO) * inner_right - (a + three)) * inner_right * inner_right + T::ONE,
        ((a * outer_right - five * a) * outer_right + eight * a) * outer_right - four * a,
    ]
}

#[derive(Debug, Clone, Copy)]
struct Axis<T> {
    size: usize,
    lo: T,
    hi: T,
}

impl<T: SampleFloat> Axis<T> {
    fn new(size: usize, align_corners: bool) -> Self {
        let extent = T::from_usize(size);
        if align_corners {
            Self {
                size,
                lo: T::ZERO,
                hi: extent - T::ONE,
            }
        } else {
            Self {
                size,
                lo: T::ZERO - T::HALF,
                hi: extent - T::HALF,
            }
        }
    }

    fn contains(&self, x: T) -> bool {
        !(x < self.lo || x > self.hi)
    }

    fn clamp_to_pixels(&self, x: T) -> T {
        let last = T::from_usize(self.size) - T::ONE;
        if x < T::ZERO {
            T::ZERO
        } else if x > last {
            last
        } else {
            x
        }
    }
}

/// Per-call sampling geometry: option variants resolved once, shared by every location.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SampleGeometry<T> {
    mode: GridSampleMode,
    padding_mode: PaddingMode,
    align_corners: bool,
    rows: Axis<T>,
    cols: Axis<T>,
}

impl<T: SampleFloat> SampleGeometry<T> {
    pub(crate) fn new(height: usize, width: usize, options: &GridSampleOptions) -> Self {
        Self {
            mode: options.mode,
            padding_mode: options.padding_mode,
            align_corners: options.align_corners,
            rows: Axis::new(height, options.align_corners),
            cols: Axis::new(width, options.align_corners),
        }
    }

    pub(crate) fn width(&self) -> usize {
        self.cols.size
    }

    /// Builds the interpolation stencil for one normalized grid point.
    pub(crate) fn stencil(&self, gx: T, gy: T) -> Stencil<T> {
        let (x, y) = self.locate(gx, gy);
        match self.mode {
            GridSampleMode::Nearest => {
                let weight = if x.is_finite() && y.is_finite() {
                    T::ONE
                } else {
                    T::NAN
                };
                Stencil::Nearest(Taps {
                    rows: [self.resolve(y.to_lattice(), &self.rows)],
                    cols: [self.resolve(x.to_lattice(), &self.cols)],
                    row_weights: [weight],
                    col_weights: [weight],
                })
            }
            GridSampleMode::Bilinear => {
                let x0 = x.floor().to_lattice();
                let y0 = y.floor().to_lattice();
                let x1 = x0.saturating_add(1);
                let y1 = y0.saturating_add(1);
                Stencil::Bilinear(Taps {
                    rows: [self.resolve(y0, &self.rows), self.resolve(y1, &self.rows)],
                    cols: [self.resolve(x0, &self.cols), self.resolve(x1, &self.cols)],
                    row_weights: [T::from_lattice(y1) - y, y - T::from_lattice(y0)],
                    col_weights: [T::from_lattice(x1) - x, x - T::from_lattice(x0)],
                })
            }
            GridSampleMode::Bicubic => {
                let x0 = x.floor().to_lattice().saturating_sub(1);
                let y0 = y.floor().to_lattice().saturating_sub(1);
                let dx = x - T::from_lattice(x0) - T::ONE;
                let dy = y - T::from_lattice(y0) - T::ONE;
                let rows = std::array::from_fn(|tap| {
                    self.resolve(y0.saturating_add(tap as i64), &self.rows)
                });
                let cols = std::array::from_fn(|tap| {
                    self.resolve(x0.saturating_add(tap as i64), &self.cols)
                });
                Stencil::Bicubic(Taps {
                    rows,
                    cols,
                    row_weights: cubic_convolution_weights(dy),
                    col_weights: cubic_convolution_weights(dx),
                })
            }
        }
    }

    /// Denormalizes the grid point and applies the coordinate-level boundary policy.
    fn locate(&self, gx: T, gy: T) -> (T, T) {
        let mut x = denormalize_coordinate(gx, self.cols.size, self.align_corners);
        let mut y = denormalize_coordinate(gy, self.rows.size, self.align_corners);
        if self.mode == GridSampleMode::Nearest {
            x = x.round_half_even();
            y = y.round_half_even();
        }

        if self.cols.contains(x) && self.rows.contains(y) {
            return (x, y);
        }

        match self.padding_mode {
            PaddingMode::Zeros => (x, y),
            PaddingMode::Border => (self.cols.clamp_to_pixels(x), self.rows.clamp_to_pixels(y)),
            PaddingMode::Reflection => (
                reflect_coordinate(x, self.cols.size, self.align_corners),
                reflect_coordinate(y, self.rows.size, self.align_corners),
            ),
        }
    }

    /// Resolves one lattice index against an axis; `None` reads as zero.
    fn resolve(&self, index: i64, axis: &Axis<T>) -> Option<usize> {
        resolve_lattice_index::<T>(index, axis.size, self.padding_mode, self.align_corners)
    }
}

/// Maps an integer lattice index onto a valid pixel index under `padding_mode`.
///
/// Returns `None` when the lattice point contributes a zero value.
#[must_use]
pub fn resolve_lattice_index<T: SampleFloat>(
    index: i64,
    size: usize,
    padding_mode: PaddingMode,
    align_corners: bool,
) -> Option<usize> {
    let last = i64::try_from(size).ok()? - 1;
    if last < 0 {
        return None;
    }
    match padding_mode {
        PaddingMode::Zeros => (0..=last).contains(&index).then_some(index as usize),
        PaddingMode::Border => Some(index.clamp(0, last) as usize),
        PaddingMode::Reflection => {
            let reflected: T = reflect_coordinate(T::from_lattice(index), size, align_corners);
            Some(reflected.to_lattice().clamp(0, last) as usize)
        }
    }
}

/// Separable tap set: `K` row indices times `K` column indices with per-axis weights.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Taps<T, const K: usize> {
    rows: [Option<usize>; K],
    cols: [Option<usize>; K],
    row_weights: [T; K],
    col_weights: [T; K],
}

impl<T: SampleFloat, const K: usize> Taps<T, K> {
    fn apply(&self, plane: &[T], width: usize) -> T {
        let row_value = |row: Option<usize>| {
            weighted_sum(&self.col_weights, |tap| fetch(plane, width, row, self.cols[tap]))
        };
        weighted_sum(&self.row_weights, |tap| row_value(self.rows[tap]))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stencil<T> {
    Nearest(Taps<T, 1>),
    Bilinear(Taps<T, 2>),
    Bicubic(Taps<T, 4>),
}

impl<T: SampleFloat> Stencil<T> {
    /// Evaluates the stencil over one `H_in x W_in` channel plane.
    pub(crate) fn apply(&self, plane: &[T], width: usize) -> T {
        match self {
            Self::Nearest(taps) => taps.apply(plane, width),
            Self::Bilinear(taps) => taps.apply(plane, width),
            Self::Bicubic(taps) => taps.apply(plane, width),
        }
    }
}

fn weighted_sum<T: SampleFloat, const K: usize>(
    weights: &[T; K],
    value_at: impl Fn(usize) -> T,
) -> T {
    let mut acc = weights[0] * value_at(0);
    for (tap, weight) in weights.iter().enumerate().skip(1) {
        acc = acc + *weight * value_at(tap);
    }
    acc
}

fn fetch<T: SampleFloat>(plane: &[T], width: usize, row: Option<usize>, col: Option<usize>) -> T {
    match (row, col) {
        (Some(row), Some(col)) => plane[row * width + col],
        _ => T::ZERO,
    }
}
