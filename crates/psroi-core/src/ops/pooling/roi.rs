//! ROI records, output-index decomposition and ROI-to-bin geometry
//!
//! Everything in this module is a pure function of its arguments. Forward and
//! backward kernels both call into it, which is what keeps the two passes
//! sampling exactly the same points.

use super::bilinear::to_float;
use num_traits::{Float, FromPrimitive, ToPrimitive};

/// Number of values per ROI row: `(batch_index, x1, y1, x2, y2)`
pub const ROI_WIDTH: usize = 5;

/// One region of interest in image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi<T> {
    pub batch_index: T,
    pub x1: T,
    pub y1: T,
    pub x2: T,
    pub y2: T,
}

impl<T: Float> Roi<T> {
    /// Read a ROI from a 5-wide row
    pub fn from_row(row: &[T]) -> Option<Self> {
        match *row {
            [batch_index, x1, y1, x2, y2] => Some(Self {
                batch_index,
                x1,
                y1,
                x2,
                y2,
            }),
            _ => None,
        }
    }

    /// Read ROI `index` from a flat `[N, 5]` buffer
    pub fn from_flat(rois: &[T], index: usize) -> Option<Self> {
        let start = index * ROI_WIDTH;
        rois.get(start..start + ROI_WIDTH).and_then(Self::from_row)
    }

    /// Batch index truncated toward zero, `None` when it is not a valid index
    pub fn batch_index(&self) -> Option<usize> {
        self.batch_index.trunc().to_usize()
    }
}

/// Coordinates of one pooled output element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputIndex {
    pub roi: usize,
    pub out_channel: usize,
    pub ph: usize,
    pub pw: usize,
}

/// Dimensions of the pooled output `[N, out_channels, pooled_height, pooled_width]`
/// minus the ROI count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledLayout {
    pub out_channels: usize,
    pub pooled_height: usize,
    pub pooled_width: usize,
}

impl PooledLayout {
    pub fn new(out_channels: usize, pooled_height: usize, pooled_width: usize) -> Self {
        Self {
            out_channels,
            pooled_height,
            pooled_width,
        }
    }

    /// Input channels consumed by this layout
    pub fn input_channels(&self) -> usize {
        self.out_channels * self.pooled_height * self.pooled_width
    }

    /// Output elements per ROI
    pub fn elements_per_roi(&self) -> usize {
        self.input_channels()
    }

    /// Split a row-major linear index over `(roi, out_channel, ph, pw)`.
    ///
    /// Both passes use this exact decomposition; `pw` varies fastest.
    pub fn decompose(&self, index: usize) -> OutputIndex {
        let pw = index % self.pooled_width;
        let ph = (index / self.pooled_width) % self.pooled_height;
        let out_channel = (index / self.pooled_width / self.pooled_height) % self.out_channels;
        let roi = index / self.pooled_width / self.pooled_height / self.out_channels;
        OutputIndex {
            roi,
            out_channel,
            ph,
            pw,
        }
    }

    /// Inverse of [`PooledLayout::decompose`]
    pub fn linear(&self, index: &OutputIndex) -> usize {
        ((index.roi * self.out_channels + index.out_channel) * self.pooled_height + index.ph)
            * self.pooled_width
            + index.pw
    }

    /// The position-sensitive input channel feeding output element `index`:
    /// `(out_channel * pooled_height + ph) * pooled_width + pw`.
    pub fn input_channel(&self, index: &OutputIndex) -> usize {
        (index.out_channel * self.pooled_height + index.ph) * self.pooled_width + index.pw
    }
}

/// Sampling geometry of one ROI for the align operator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiAlignGeometry<T> {
    pub start_h: T,
    pub start_w: T,
    pub bin_h: T,
    pub bin_w: T,
    pub grid_h: usize,
    pub grid_w: usize,
}

impl<T> RoiAlignGeometry<T>
where
    T: Float + FromPrimitive,
{
    /// Map `roi` into feature-map space and derive its sampling grid.
    ///
    /// Corners are scaled and shifted by half a pixel without rounding. The
    /// ROI size is not clamped, so inverted or empty ROIs produce bins that
    /// the sampler treats as out of range. A non-positive `sampling_ratio`
    /// selects `ceil(bin size)` samples per axis, which may be zero.
    pub fn new(
        roi: &Roi<T>,
        spatial_scale: T,
        pooled_height: usize,
        pooled_width: usize,
        sampling_ratio: i32,
    ) -> Self {
        let half = T::from_f64(0.5).unwrap_or_else(T::zero);
        let start_w = roi.x1 * spatial_scale - half;
        let start_h = roi.y1 * spatial_scale - half;
        let end_w = roi.x2 * spatial_scale - half;
        let end_h = roi.y2 * spatial_scale - half;

        let roi_width = end_w - start_w;
        let roi_height = end_h - start_h;
        let bin_h = roi_height / to_float(pooled_height);
        let bin_w = roi_width / to_float(pooled_width);

        let (grid_h, grid_w) = if sampling_ratio > 0 {
            let ratio = sampling_ratio as usize;
            (ratio, ratio)
        } else {
            (adaptive_grid(bin_h), adaptive_grid(bin_w))
        };

        Self {
            start_h,
            start_w,
            bin_h,
            bin_w,
            grid_h,
            grid_w,
        }
    }

    /// Samples averaged into each output bin
    pub fn sample_count(&self) -> usize {
        self.grid_h * self.grid_w
    }

    /// Sample points `(y, x)` of bin `(ph, pw)`, at the centre of each grid cell
    pub fn sample_points(&self, ph: usize, pw: usize) -> impl Iterator<Item = (T, T)> + '_ {
        let half = T::from_f64(0.5).unwrap_or_else(T::zero);
        let hstart = to_float::<T>(ph) * self.bin_h + self.start_h;
        let wstart = to_float::<T>(pw) * self.bin_w + self.start_w;
        let grid_h = to_float::<T>(self.grid_h);
        let grid_w = to_float::<T>(self.grid_w);
        (0..self.grid_h).flat_map(move |iy| {
            let y = hstart + (to_float::<T>(iy) + half) * self.bin_h / grid_h;
            (0..self.grid_w).map(move |ix| {
                let x = wstart + (to_float::<T>(ix) + half) * self.bin_w / grid_w;
                (y, x)
            })
        })
    }
}

fn adaptive_grid<T: Float>(bin_size: T) -> usize {
    // Negative or NaN bin sizes yield an empty grid.
    bin_size.ceil().to_usize().unwrap_or(0)
}

/// Integer pixel window of one pooling bin, half-open on both axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBin {
    pub hstart: usize,
    pub hend: usize,
    pub wstart: usize,
    pub wend: usize,
}

impl PoolBin {
    pub fn is_empty(&self) -> bool {
        self.hend <= self.hstart || self.wend <= self.wstart
    }

    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.hend - self.hstart) * (self.wend - self.wstart)
        }
    }

    /// Flat offsets of every pixel in the bin for a plane with `width` columns
    pub fn offsets(&self, width: usize) -> impl Iterator<Item = usize> + '_ {
        (self.hstart..self.hend)
            .flat_map(move |h| (self.wstart..self.wend).map(move |w| h * width + w))
    }
}

/// Quantised geometry of one ROI for the pool operator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiPoolGeometry<T> {
    pub start_h: i64,
    pub start_w: i64,
    pub bin_h: T,
    pub bin_w: T,
}

impl<T> RoiPoolGeometry<T>
where
    T: Float + FromPrimitive,
{
    /// Round the scaled corners to whole pixels; ROIs smaller than one pixel
    /// are widened to 1x1.
    pub fn new(roi: &Roi<T>, spatial_scale: T, pooled_height: usize, pooled_width: usize) -> Self {
        let start_w = round_to_i64(roi.x1 * spatial_scale);
        let start_h = round_to_i64(roi.y1 * spatial_scale);
        let end_w = round_to_i64(roi.x2 * spatial_scale);
        let end_h = round_to_i64(roi.y2 * spatial_scale);

        let roi_width = (end_w - start_w).max(1);
        let roi_height = (end_h - start_h).max(1);

        let bin_h = T::from_i64(roi_height).unwrap_or_else(T::one) / to_float(pooled_height);
        let bin_w = T::from_i64(roi_width).unwrap_or_else(T::one) / to_float(pooled_width);

        Self {
            start_h,
            start_w,
            bin_h,
            bin_w,
        }
    }

    /// Pixel window of bin `(ph, pw)` clipped to a `height` x `width` plane
    pub fn bin(&self, ph: usize, pw: usize, height: usize, width: usize) -> PoolBin {
        let hstart = (to_float::<T>(ph) * self.bin_h).floor();
        let wstart = (to_float::<T>(pw) * self.bin_w).floor();
        let hend = (to_float::<T>(ph + 1) * self.bin_h).ceil();
        let wend = (to_float::<T>(pw + 1) * self.bin_w).ceil();

        PoolBin {
            hstart: clip(to_i64(hstart) + self.start_h, height),
            hend: clip(to_i64(hend) + self.start_h, height),
            wstart: clip(to_i64(wstart) + self.start_w, width),
            wend: clip(to_i64(wend) + self.start_w, width),
        }
    }
}

fn round_to_i64<T: Float>(value: T) -> i64 {
    to_i64(value.round())
}

fn to_i64<T: ToPrimitive>(value: T) -> i64 {
    value.to_i64().unwrap_or(0)
}

fn clip(value: i64, extent: usize) -> usize {
    value.clamp(0, extent as i64) as usize
}
