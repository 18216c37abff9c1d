//! Position-sensitive ROI Align
//!
//! Every output cell `(roi, out_channel, ph, pw)` reads one input channel,
//! `(out_channel * pooled_height + ph) * pooled_width + pw`, and averages a
//! regular grid of bilinear samples over its bin. The backward pass replays
//! the same grid and scatters the gradient into the channel recorded in the
//! forward `channel_mapping`.

use super::bilinear::{bilinear_interpolate, bilinear_weights, to_float};
use super::dispatch::{self, BackwardPlan, ForwardPlan};
use super::roi::{Roi, RoiAlignGeometry};
use crate::device::{get_launch_config, LaunchGeometry};
use crate::element::PoolElement;
use crate::{Result, Tensor};
use std::ops::Range;

const FORWARD_OP: &str = "ps_roi_align";
const BACKWARD_OP: &str = "ps_roi_align_backward";

/// Position-sensitive ROI Align forward pass.
///
/// `input` is `[B, C, H, W]` and `rois` is `[N, 5]` with rows
/// `(batch_index, x1, y1, x2, y2)` in image coordinates. ROI corners are
/// multiplied by `spatial_scale`. A positive `sampling_ratio` fixes the
/// number of samples per bin axis; otherwise it adapts to the bin size.
///
/// Returns the pooled output `[N, C / (ph * pw), ph, pw]` and the input
/// channel each output cell was read from, which the backward pass needs.
pub fn ps_roi_align<T: PoolElement>(
    input: &Tensor<T>,
    rois: &Tensor<T>,
    pooled_size: (usize, usize),
    spatial_scale: f64,
    sampling_ratio: i32,
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
            "{FORWARD_OP}: {}, {} rois, pooled {:?}, sampling_ratio {}, {}",
            input.summary(),
            plan.num_rois,
            pooled_size,
            sampling_ratio,
            geometry
        );

        let input_data = dispatch::contiguous(FORWARD_OP, "input", input)?;
        let roi_data = dispatch::contiguous(FORWARD_OP, "rois", rois)?;
        config.install(FORWARD_OP, || {
            geometry.for_each_block_mut(&mut output, &mut mapping, |first, out, map| {
                let kernel = AlignKernel {
                    rois: roi_data,
                    spatial_scale: scale,
                    sampling_ratio,
                };
                kernel.forward(&plan, input_data, first, out, map);
            })
        })?;
    }

    Ok((
        Tensor::from_vec_on(output, &output_shape, device)?,
        Tensor::from_vec_on(mapping, &output_shape, device)?,
    ))
}

/// Gradient of [`ps_roi_align`] with respect to its input.
///
/// `grad_output` and `channel_mapping` are `[N, C / (ph * pw), ph, pw]`,
/// `channel_mapping` being the one returned by the forward call, and
/// `input_shape` is the `[B, C, H, W]` shape of the forward input. Returns a
/// fresh `[B, C, H, W]` gradient.
pub fn ps_roi_align_backward<T: PoolElement>(
    grad_output: &Tensor<T>,
    rois: &Tensor<T>,
    channel_mapping: &Tensor<i32>,
    input_shape: [usize; 4],
    pooled_size: (usize, usize),
    spatial_scale: f64,
    sampling_ratio: i32,
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
        "{BACKWARD_OP}: grad_output {}, input {:?}, sampling_ratio {}, {}",
        grad_output.shape(),
        input_shape,
        sampling_ratio,
        geometry
    );

    let grad_data = dispatch::contiguous(BACKWARD_OP, "grad_output", grad_output)?;
    let roi_data = dispatch::contiguous(BACKWARD_OP, "rois", rois)?;
    let mapping = dispatch::contiguous(BACKWARD_OP, "channel_mapping", channel_mapping)?;
    config.install(BACKWARD_OP, || {
        geometry.for_each_block(|range| {
            let kernel = AlignKernel {
                rois: roi_data,
                spatial_scale: scale,
                sampling_ratio,
            };
            kernel.backward(&plan, grad_data, mapping, range, &grad_input);
        })
    })?;

    dispatch::accumulators_into_tensor(grad_input, plan.dims, device)
}

/// Per-call parameters shared by every work item
struct AlignKernel<'a, T> {
    rois: &'a [T],
    spatial_scale: T,
    sampling_ratio: i32,
}

impl<T: PoolElement> AlignKernel<'_, T> {
    fn roi(&self, index: usize) -> Option<(Roi<T>, usize)> {
        let roi = Roi::from_flat(self.rois, index)?;
        Some((roi, roi.batch_index()?))
    }

    fn geometry(&self, roi: &Roi<T>, pooled_size: (usize, usize)) -> RoiAlignGeometry<T> {
        RoiAlignGeometry::new(
            roi,
            self.spatial_scale,
            pooled_size.0,
            pooled_size.1,
            self.sampling_ratio,
        )
    }

    fn forward(
        &self,
        plan: &ForwardPlan,
        input: &[T],
        first: usize,
        output: &mut [T],
        mapping: &mut [i32],
    ) {
        let dims = plan.dims;
        let layout = plan.layout;
        let pooled_size = (layout.pooled_height, layout.pooled_width);

        for (offset, (out, map)) in output.iter_mut().zip(mapping.iter_mut()).enumerate() {
            let index = layout.decompose(first + offset);
            let c_in = layout.input_channel(&index);
            *map = c_in as i32;

            let Some((roi, batch)) = self.roi(index.roi) else {
                continue;
            };
            let geometry = self.geometry(&roi, pooled_size);
            let count = geometry.sample_count();
            if count == 0 {
                continue;
            }

            let plane = &input[dims.plane_offset(batch, c_in)..][..dims.plane_size()];
            let sum = geometry
                .sample_points(index.ph, index.pw)
                .fold(T::zero(), |acc, (y, x)| {
                    acc + bilinear_interpolate(plane, dims.height, dims.width, y, x)
                });
            *out = sum / to_float(count);
        }
    }

    fn backward(
        &self,
        plan: &BackwardPlan,
        grad_output: &[T],
        mapping: &[i32],
        range: Range<usize>,
        grad_input: &[T::Atomic],
    ) {
        let dims = plan.dims;
        let layout = plan.layout;
        let pooled_size = (layout.pooled_height, layout.pooled_width);

        for i in range {
            let index = layout.decompose(i);
            let Some((roi, batch)) = self.roi(index.roi) else {
                continue;
            };
            let geometry = self.geometry(&roi, pooled_size);
            let count = geometry.sample_count();
            if count == 0 {
                continue;
            }

            let count = to_float::<T>(count);
            let grad = grad_output[i];
            let c_in = mapping[i] as usize;
            let plane = &grad_input[dims.plane_offset(batch, c_in)..][..dims.plane_size()];
            for (y, x) in geometry.sample_points(index.ph, index.pw) {
                let Some(weights) = bilinear_weights(dims.height, dims.width, y, x) else {
                    continue;
                };
                for (weight, offset) in weights.corners(dims.width) {
                    T::atomic_add(&plane[offset], grad * weight / count);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, TensorError};
    use approx::assert_abs_diff_eq;

    fn rois(rows: &[[f64; 5]]) -> Tensor<f64> {
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, &[rows.len(), 5]).unwrap()
    }

    /// `[1, C, H, W]` input where channel `c` holds `100 * c + 10 * row + col`
    fn ramp_input(channels: usize, height: usize, width: usize) -> Tensor<f64> {
        let data = (0..channels)
            .flat_map(move |c| {
                (0..height).flat_map(move |r| (0..width).map(move |w| (100 * c + 10 * r + w) as f64))
            })
            .collect();
        Tensor::from_vec(data, &[1, channels, height, width]).unwrap()
    }

    #[test]
    fn test_uniform_input_pools_to_constant() {
        let input = Tensor::<f32>::ones(&[1, 4, 4, 4]);
        let rois = Tensor::from_vec(vec![0.0f32, 0.0, 0.0, 4.0, 4.0], &[1, 5]).unwrap();
        let (output, mapping) = ps_roi_align(&input, &rois, (2, 2), 1.0, 2).unwrap();

        assert_eq!(output.shape().dims(), &[1, 1, 2, 2]);
        for value in output.as_slice().unwrap() {
            assert_abs_diff_eq!(*value, 1.0, epsilon = 1e-6);
        }
        assert_eq!(mapping.into_vec(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_each_bin_reads_its_own_channel() {
        let input = ramp_input(4, 4, 4);
        let (output, _) = ps_roi_align(&input, &rois(&[[0.0, 0.0, 0.0, 4.0, 4.0]]), (2, 2), 1.0, 2)
            .unwrap();
        // Bin (ph, pw) samples rows/cols {2ph, 2ph+1} x {2pw, 2pw+1} of channel 2ph+pw.
        let expected = [0.5 * 10.0 + 0.5, 100.0 + 5.0 + 2.5, 200.0 + 25.0 + 0.5, 300.0 + 25.0 + 2.5];
        for (value, expected) in output.as_slice().unwrap().iter().zip(expected) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_shape_and_mapping_law() {
        let input = Tensor::<f64>::zeros(&[2, 18, 6, 6]);
        let r = rois(&[[0.0, 0.0, 0.0, 3.0, 3.0], [1.0, 1.0, 1.0, 5.0, 4.0]]);
        let (output, mapping) = ps_roi_align(&input, &r, (3, 3), 1.0, -1).unwrap();
        assert_eq!(output.shape().dims(), &[2, 2, 3, 3]);
        assert_eq!(mapping.shape(), output.shape());

        for n in 0..2 {
            for co in 0..2 {
                for ph in 0..3 {
                    for pw in 0..3 {
                        let c = mapping.get(&[n, co, ph, pw]).unwrap();
                        assert_eq!(c as usize, (co * 3 + ph) * 3 + pw);
                    }
                }
            }
        }
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let input = ramp_input(8, 5, 5);
        let r = rois(&[[0.0, 0.3, 0.1, 4.2, 3.9], [0.0, 1.0, 2.0, 2.0, 3.0]]);
        let (a_out, a_map) = ps_roi_align(&input, &r, (2, 2), 1.0, 0).unwrap();
        let (b_out, b_map) = ps_roi_align(&input, &r, (2, 2), 1.0, 0).unwrap();
        assert_eq!(a_map, b_map);
        assert_eq!(a_out, b_out);
    }

    #[test]
    fn test_no_rois_yields_empty_output() {
        let input = Tensor::<f32>::ones(&[1, 8, 4, 4]);
        let empty = Tensor::<f32>::zeros(&[0, 5]);
        let (output, mapping) = ps_roi_align(&input, &empty, (2, 2), 1.0, 2).unwrap();
        assert_eq!(output.shape().dims(), &[0, 2, 2, 2]);
        assert_eq!(mapping.shape().dims(), &[0, 2, 2, 2]);
        assert!(output.is_empty());
    }

    #[test]
    fn test_degenerate_roi_with_adaptive_grid_is_zero() {
        let input = Tensor::<f64>::ones(&[1, 4, 4, 4]);
        let (output, mapping) =
            ps_roi_align(&input, &rois(&[[0.0, 2.0, 2.0, 2.0, 2.0]]), (2, 2), 1.0, -1).unwrap();
        assert_eq!(output.into_vec(), vec![0.0; 4]);
        assert_eq!(mapping.into_vec(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_degenerate_roi_with_fixed_grid_samples_a_point() {
        let input = ramp_input(1, 4, 4);
        let (output, _) =
            ps_roi_align(&input, &rois(&[[0.0, 2.5, 1.5, 2.5, 1.5]]), (1, 1), 1.0, 2).unwrap();
        // Every sample lands on (1.0, 2.0).
        assert_abs_diff_eq!(output.into_vec()[0], 12.0, epsilon = 1e-12);
    }

    #[test]
    fn test_roi_outside_map_pools_to_zero() {
        let input = Tensor::<f64>::ones(&[1, 1, 4, 4]);
        let (output, _) =
            ps_roi_align(&input, &rois(&[[0.0, 20.0, 20.0, 30.0, 30.0]]), (1, 1), 1.0, 2).unwrap();
        assert_eq!(output.into_vec(), vec![0.0]);
    }

    #[test]
    fn test_spatial_scale_maps_image_coordinates() {
        let input = ramp_input(1, 4, 4);
        let full = ps_roi_align(&input, &rois(&[[0.0, 0.0, 0.0, 4.0, 4.0]]), (1, 1), 1.0, 2)
            .unwrap()
            .0;
        let scaled = ps_roi_align(&input, &rois(&[[0.0, 0.0, 0.0, 16.0, 16.0]]), (1, 1), 0.25, 2)
            .unwrap()
            .0;
        assert_eq!(full, scaled);
    }

    #[test]
    fn test_forward_errors() {
        let input = Tensor::<f64>::zeros(&[1, 6, 4, 4]);
        let err = ps_roi_align(&input, &rois(&[]), (2, 2), 1.0, 2).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
        assert!(err.is_precondition_violation());

        let input = Tensor::<f64>::zeros(&[1, 4, 4, 4]);
        let err = ps_roi_align(&input, &rois(&[[3.0, 0.0, 0.0, 1.0, 1.0]]), (2, 2), 1.0, 2)
            .unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));

        let err = ps_roi_align(&input, &rois(&[]).to_device(Device::Gpu(1)), (2, 2), 1.0, 2)
            .unwrap_err();
        assert!(matches!(err, TensorError::DeviceMismatch { .. }));

        let err = ps_roi_align(&input, &rois(&[]), (0, 2), 1.0, 2).unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));
    }

    #[test]
    fn test_backward_distributes_whole_gradient() {
        // All samples fall inside the map, so every unit of gradient lands somewhere.
        let r = rois(&[[0.0, 0.0, 0.0, 4.0, 4.0]]);
        let grad = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let mapping = Tensor::from_vec(vec![0, 1, 2, 3], &[1, 1, 2, 2]).unwrap();
        let grad_input =
            ps_roi_align_backward(&grad, &r, &mapping, [1, 4, 4, 4], (2, 2), 1.0, 2).unwrap();

        assert_eq!(grad_input.shape().dims(), &[1, 4, 4, 4]);
        let data = grad_input.as_slice().unwrap();
        for c in 0..4 {
            let channel: f64 = data[c * 16..(c + 1) * 16].iter().sum();
            assert_abs_diff_eq!(channel, (c + 1) as f64, epsilon = 1e-12);
        }
        // Bin (0, 0) samples the four pixels (0..2, 0..2) of channel 0 with weight 1/4 each.
        assert_abs_diff_eq!(grad_input.get(&[0, 0, 0, 0]).unwrap(), 0.25);
        assert_abs_diff_eq!(grad_input.get(&[0, 0, 1, 1]).unwrap(), 0.25);
        assert_abs_diff_eq!(grad_input.get(&[0, 0, 2, 2]).unwrap(), 0.0);
    }

    #[test]
    fn test_backward_follows_channel_mapping() {
        let r = rois(&[[0.0, 0.0, 0.0, 2.0, 2.0]]);
        let grad = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[1, 3, 1, 1]).unwrap();
        let mapping = Tensor::from_vec(vec![2, 0, 1], &[1, 3, 1, 1]).unwrap();
        let grad_input =
            ps_roi_align_backward(&grad, &r, &mapping, [1, 3, 2, 2], (1, 1), 1.0, 2).unwrap();

        let data = grad_input.as_slice().unwrap();
        let per_channel: Vec<f64> = data.chunks(4).map(|plane| plane.iter().sum()).collect();
        assert_abs_diff_eq!(per_channel[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(per_channel[1], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(per_channel[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_backward_of_empty_gradient_is_zero() {
        let grad = Tensor::<f64>::zeros(&[0, 2, 2, 2]);
        let mapping = Tensor::<i32>::zeros(&[0, 2, 2, 2]);
        let grad_input =
            ps_roi_align_backward(&grad, &rois(&[]), &mapping, [2, 8, 3, 3], (2, 2), 1.0, 2)
                .unwrap();
        assert_eq!(grad_input.shape().dims(), &[2, 8, 3, 3]);
        assert!(grad_input.as_slice().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_backward_skips_samples_outside_map() {
        let r = rois(&[[0.0, 10.0, 10.0, 12.0, 12.0]]);
        let grad = Tensor::from_vec(vec![1.0], &[1, 1, 1, 1]).unwrap();
        let mapping = Tensor::from_vec(vec![0], &[1, 1, 1, 1]).unwrap();
        let grad_input =
            ps_roi_align_backward(&grad, &r, &mapping, [1, 1, 4, 4], (1, 1), 1.0, 2).unwrap();
        assert!(grad_input.into_vec().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_backward_errors() {
        let grad = Tensor::<f64>::zeros(&[1, 1, 2, 2]);
        let mapping = Tensor::<i32>::zeros(&[1, 1, 2, 2]);
        let r = rois(&[[0.0, 0.0, 0.0, 2.0, 2.0]]);

        let err = ps_roi_align_backward(&grad, &r, &mapping, [1, 8, 4, 4], (2, 2), 1.0, 2)
            .unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));

        let on_gpu = mapping.clone().to_device(Device::Gpu(0));
        let err = ps_roi_align_backward(&grad, &r, &on_gpu, [1, 4, 4, 4], (2, 2), 1.0, 2)
            .unwrap_err();
        assert!(matches!(err, TensorError::DeviceMismatch { .. }));

        let grad = grad.to_device(Device::Gpu(0));
        let r = r.to_device(Device::Gpu(0));
        let err = ps_roi_align_backward(&grad, &r, &on_gpu, [1, 4, 4, 4], (2, 2), 1.0, 2)
            .unwrap_err();
        assert!(matches!(err, TensorError::UnsupportedDevice { .. }));
    }

    #[test]
    fn test_backward_rejects_input_shape_that_overflows() {
        let grad = Tensor::<f64>::zeros(&[0, 1, 2, 2]);
        let mapping = Tensor::<i32>::zeros(&[0, 1, 2, 2]);
        let err = ps_roi_align_backward(
            &grad,
            &rois(&[]),
            &mapping,
            [usize::MAX / 2, 4, 4, 4],
            (2, 2),
            1.0,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));
        assert_eq!(err.operation(), "ps_roi_align_backward");
    }
}
