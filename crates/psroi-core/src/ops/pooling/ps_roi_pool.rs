//! Position-sensitive ROI pooling (R-FCN)
//!
//! The quantised sibling of [`ps_roi_align`](super::ps_roi_align::ps_roi_align):
//! ROI corners are rounded to whole pixels and every output cell averages the
//! integer pixel window of its bin instead of sampling sub-pixel points.

use super::bilinear::to_float;
use super::dispatch::{self, BackwardPlan, FeatureDims, ForwardPlan};
use super::roi::{OutputIndex, PoolBin, PooledLayout, Roi, RoiPoolGeometry};
use crate::device::{get_launch_config, LaunchGeometry};
use crate::element::PoolElement;
use crate::{Result, Tensor};
use std::ops::Range;

const FORWARD_OP: &str = "ps_roi_pool";
const BACKWARD_OP: &str = "ps_roi_pool_backward";

/// Position-sensitive ROI pooling forward pass.
///
/// Same layout as `ps_roi_align`: returns the `[N, C / (ph * pw), ph, pw]`
/// output and its channel mapping. Bins that fall entirely outside the
/// feature map pool to zero.
pub fn ps_roi_pool<T: PoolElement>(
    input: &Tensor<T>,
    rois: &Tensor<T>,
    pooled_size: (usize, usize),
    spatial_scale: f64,
) -> Result<(Tensor<T>, Tensor<i32>)> {
    let plan = dispatch::plan_forward(FORWARD_OP, input, rois, pooled_size)?;
    let scale = dispatch::spatial_scale_as::<T>(FORWARD_OP, spatial_scale)?;
    let device = *input.device();
    let output_shape = plan.output_shape();
    let work_items = plan.work_items();

    let mut output = dispatch::allocate_filled(FORWARD_OP, work_items, T::zero())?;
    let mut mapping = dispatch::allocate_filled(FORWARD_OP, work_items, 0i32)?;

    if work_items == 0 {
        log::trace!(
            "{FORWARD_OP}: nothing to pool for input {} and {} rois",
            input.shape(),
            plan.num_rois
        );
    } else {
        let config = get_launch_config();
        let geometry = LaunchGeometry::for_work_items(work_items, &config);
        log::debug!(
            "{FORWARD_OP}: {}, {} rois, pooled {:?}, {}",
            input.summary(),
            plan.num_rois,
            pooled_size,
            geometry
        );

        let input_data = dispatch::contiguous(FORWARD_OP, "input", input)?;
        let roi_data = dispatch::contiguous(FORWARD_OP, "rois", rois)?;
        config.install(FORWARD_OP, || {
            geometry.for_each_block_mut(&mut output, &mut mapping, |first, out, map| {
                forward_block(&plan, input_data, roi_data, scale, first, out, map);
            })
        })?;
    }

    Ok((
        Tensor::from_vec_on(output, &output_shape, device)?,
        Tensor::from_vec_on(mapping, &output_shape, device)?,
    ))
}

/// Gradient of [`ps_roi_pool`] with respect to its input.
///
/// Each output gradient is spread evenly over the pixels of its bin in the
/// channel named by `channel_mapping`.
pub fn ps_roi_pool_backward<T: PoolElement>(
    grad_output: &Tensor<T>,
    rois: &Tensor<T>,
    channel_mapping: &Tensor<i32>,
    input_shape: [usize; 4],
    pooled_size: (usize, usize),
    spatial_scale: f64,
) -> Result<Tensor<T>> {
    let plan = dispatch::plan_backward(
        BACKWARD_OP,
        grad_output,
        rois,
        channel_mapping,
        pooled_size,
        input_shape,
    )?;
    let scale = dispatch::spatial_scale_as::<T>(BACKWARD_OP, spatial_scale)?;
    let device = *grad_output.device();
    let grad_input = dispatch::allocate_accumulators::<T>(BACKWARD_OP, plan.dims.numel())?;

    if plan.work_items == 0 {
        log::trace!(
            "{BACKWARD_OP}: empty grad_output {}, returning zeros",
            grad_output.shape()
        );
        return dispatch::accumulators_into_tensor(grad_input, plan.dims, device);
    }

    let config = get_launch_config();
    let geometry = LaunchGeometry::for_work_items(plan.work_items, &config);
    log::debug!(
        "{BACKWARD_OP}: grad_output {}, input {:?}, {}",
        grad_output.shape(),
        input_shape,
        geometry
    );

    let grad_data = dispatch::contiguous(BACKWARD_OP, "grad_output", grad_output)?;
    let roi_data = dispatch::contiguous(BACKWARD_OP, "rois", rois)?;
    let mapping = dispatch::contiguous(BACKWARD_OP, "channel_mapping", channel_mapping)?;
    config.install(BACKWARD_OP, || {
        geometry.for_each_block(|range| {
            backward_block(&plan, grad_data, roi_data, mapping, scale, range, &grad_input);
        })
    })?;

    dispatch::accumulators_into_tensor(grad_input, plan.dims, device)
}

/// Batch item and pixel window of output cell `index`
fn locate_bin<T: PoolElement>(
    rois: &[T],
    spatial_scale: T,
    layout: &PooledLayout,
    index: &OutputIndex,
    dims: &FeatureDims,
) -> Option<(usize, PoolBin)> {
    let roi = Roi::from_flat(rois, index.roi)?;
    let batch = roi.batch_index()?;
    let geometry = RoiPoolGeometry::new(
        &roi,
        spatial_scale,
        layout.pooled_height,
        layout.pooled_width,
    );
    Some((batch, geometry.bin(index.ph, index.pw, dims.height, dims.width)))
}

fn forward_block<T: PoolElement>(
    plan: &ForwardPlan,
    input: &[T],
    rois: &[T],
    spatial_scale: T,
    first: usize,
    output: &mut [T],
    mapping: &mut [i32],
) {
    let dims = plan.dims;
    let layout = plan.layout;

    for (offset, (out, map)) in output.iter_mut().zip(mapping.iter_mut()).enumerate() {
        let index = layout.decompose(first + offset);
        let c_in = layout.input_channel(&index);
        *map = c_in as i32;

        let Some((batch, bin)) = locate_bin(rois, spatial_scale, &layout, &index, &dims) else {
            continue;
        };
        if bin.is_empty() {
            continue;
        }

        let plane = &input[dims.plane_offset(batch, c_in)..][..dims.plane_size()];
        let sum = bin
            .offsets(dims.width)
            .fold(T::zero(), |acc, offset| acc + plane[offset]);
        *out = sum / to_float(bin.area());
    }
}

fn backward_block<T: PoolElement>(
    plan: &BackwardPlan,
    grad_output: &[T],
    rois: &[T],
    mapping: &[i32],
    spatial_scale: T,
    range: Range<usize>,
    grad_input: &[T::Atomic],
) {
    let dims = plan.dims;
    let layout = plan.layout;

    for i in range {
        let index = layout.decompose(i);
        let Some((batch, bin)) = locate_bin(rois, spatial_scale, &layout, &index, &dims) else {
            continue;
        };
        if bin.is_empty() {
            continue;
        }

        let share = grad_output[i] / to_float(bin.area());
        let c_in = mapping[i] as usize;
        let plane = &grad_input[dims.plane_offset(batch, c_in)..][..dims.plane_size()];
        for offset in bin.offsets(dims.width) {
            T::atomic_add(&plane[offset], share);
        }
    }
}
