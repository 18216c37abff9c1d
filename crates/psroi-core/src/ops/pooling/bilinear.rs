//! Bilinear sampling of a single feature-map plane
//!
//! [`bilinear_weights`] holds the whole boundary logic. The forward sampler
//! reads the four corners it names, and the backward kernels scatter into
//! the same four corners, so both passes always touch identical cells.

use num_traits::{Float, FromPrimitive};

/// Corner weights and coordinates of one bilinear sample.
///
/// Corners are `(y_low, x_low)`, `(y_low, x_high)`, `(y_high, x_low)` and
/// `(y_high, x_high)` for `w1`..`w4` respectively. All coordinates are valid
/// indices into the plane the weights were computed for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearWeights<T> {
    pub w1: T,
    pub w2: T,
    pub w3: T,
    pub w4: T,
    pub y_low: usize,
    pub y_high: usize,
    pub x_low: usize,
    pub x_high: usize,
}

impl<T: Copy> BilinearWeights<T> {
    /// `(weight, flat offset)` for each corner of a plane with `width` columns
    pub fn corners(&self, width: usize) -> [(T, usize); 4] {
        [
            (self.w1, self.y_low * width + self.x_low),
            (self.w2, self.y_low * width + self.x_high),
            (self.w3, self.y_high * width + self.x_low),
            (self.w4, self.y_high * width + self.x_high),
        ]
    }
}

/// Interpolation weights for the point `(y, x)` on a `height` x `width` plane.
///
/// Returns `None` when the point lies outside the one-pixel margin around the
/// plane (`y < -1`, `y > height`, `x < -1`, `x > width`) or the plane is
/// empty; such a sample contributes nothing. Coordinates in `[-1, 0)` are
/// clamped to 0 and coordinates on or past the last row/column collapse onto
/// that edge.
pub fn bilinear_weights<T>(height: usize, width: usize, y: T, x: T) -> Option<BilinearWeights<T>>
where
    T: Float + FromPrimitive,
{
    if height == 0 || width == 0 {
        return None;
    }
    let h = to_float::<T>(height);
    let w = to_float::<T>(width);
    let minus_one = -T::one();
    if y < minus_one || y > h || x < minus_one || x > w {
        return None;
    }

    let (y_low, y_high, y) = clamp_axis(y, height);
    let (x_low, x_high, x) = clamp_axis(x, width);

    let ly = y - to_float::<T>(y_low);
    let lx = x - to_float::<T>(x_low);
    let hy = T::one() - ly;
    let hx = T::one() - lx;

    Some(BilinearWeights {
        w1: hy * hx,
        w2: hy * lx,
        w3: ly * hx,
        w4: ly * lx,
        y_low,
        y_high,
        x_low,
        x_high,
    })
}

/// Bilinearly interpolated value of `plane` at `(y, x)`, or zero outside the margin.
///
/// `plane` holds `height * width` values in row-major order.
pub fn bilinear_interpolate<T>(plane: &[T], height: usize, width: usize, y: T, x: T) -> T
where
    T: Float + FromPrimitive,
{
    match bilinear_weights(height, width, y, x) {
        Some(weights) => weights
            .corners(width)
            .iter()
            .fold(T::zero(), |acc, &(weight, offset)| acc + weight * plane[offset]),
        None => T::zero(),
    }
}

/// Clamp one coordinate to the plane: returns `(low, high, coordinate)`.
fn clamp_axis<T>(coord: T, extent: usize) -> (usize, usize, T)
where
    T: Float + FromPrimitive,
{
    // NaN compares false against everything above and is replaced by 0 here.
    let coord = coord.max(T::zero());
    let low = coord.floor().to_usize().unwrap_or(0);
    if low >= extent - 1 {
        let edge = extent - 1;
        (edge, edge, to_float(edge))
    } else {
        (low, low + 1, coord)
    }
}

#[inline]
pub(crate) fn to_float<T: Float + FromPrimitive>(value: usize) -> T {
    T::from_usize(value).unwrap_or_else(T::infinity)
}
