//! Argument validation and buffer allocation shared by the position-sensitive
//! pooling operators
//!
//! Every check here runs before a kernel is launched, so a call that fails
//! validation never produces partial output.

use super::roi::{PooledLayout, Roi, ROI_WIDTH};
use crate::element::{AtomicAccumulate, PoolElement};
use crate::{Device, ErrorContext, Result, Tensor, TensorError};

/// Feature-map dimensions `[batch, channels, height, width]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureDims {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FeatureDims {
    pub fn from_array(dims: [usize; 4]) -> Self {
        Self {
            batch: dims[0],
            channels: dims[1],
            height: dims[2],
            width: dims[3],
        }
    }

    pub fn to_array(self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    pub fn plane_size(&self) -> usize {
        self.height * self.width
    }

    pub fn numel(&self) -> usize {
        self.batch * self.channels * self.plane_size()
    }

    /// Element count, or `None` when it does not fit in `usize`
    pub fn checked_numel(&self) -> Option<usize> {
        self.to_array()
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// Offset of plane `(batch, channel)` in a contiguous NCHW buffer
    pub fn plane_offset(&self, batch: usize, channel: usize) -> usize {
        (batch * self.channels + channel) * self.plane_size()
    }
}

/// Validated forward call
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForwardPlan {
    pub dims: FeatureDims,
    pub num_rois: usize,
    pub layout: PooledLayout,
}

impl ForwardPlan {
    pub fn output_shape(&self) -> [usize; 4] {
        [
            self.num_rois,
            self.layout.out_channels,
            self.layout.pooled_height,
            self.layout.pooled_width,
        ]
    }

    pub fn work_items(&self) -> usize {
        self.num_rois * self.layout.elements_per_roi()
    }
}

/// Validated backward call
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackwardPlan {
    pub dims: FeatureDims,
    pub layout: PooledLayout,
    pub work_items: usize,
}

pub(crate) fn check_same_device(operation: &str, devices: &[&Device]) -> Result<Device> {
    let first = *devices[0];
    for device in &devices[1..] {
        if **device != first {
            return Err(TensorError::device_mismatch(
                operation,
                &first.to_string(),
                &device.to_string(),
            ));
        }
    }
    Ok(first)
}

/// Reject devices without compiled kernels
pub(crate) fn check_executable(operation: &str, device: Device) -> Result<()> {
    if device.is_cpu() {
        Ok(())
    } else {
        Err(TensorError::unsupported_device(
            operation,
            &device.to_string(),
        ))
    }
}

fn check_pooled_size(operation: &str, pooled_size: (usize, usize)) -> Result<()> {
    if pooled_size.0 == 0 || pooled_size.1 == 0 {
        return Err(TensorError::invalid_argument_op(
            operation,
            &format!(
                "pooled size must be positive, got ({}, {})",
                pooled_size.0, pooled_size.1
            ),
        ));
    }
    Ok(())
}

fn check_rois_shape<T>(operation: &str, rois: &Tensor<T>) -> Result<usize> {
    match rois.shape().dims() {
        &[num_rois, ROI_WIDTH] => Ok(num_rois),
        dims => Err(TensorError::invalid_shape(
            operation,
            &format!("rois must be [num_rois, {ROI_WIDTH}], got {:?}", dims),
            dims,
        )),
    }
}

/// Every ROI must name a batch item of the feature map
pub(crate) fn check_roi_batch_indices<T: PoolElement>(
    operation: &str,
    rois: &[T],
    batch_size: usize,
) -> Result<()> {
    for (i, row) in rois.chunks_exact(ROI_WIDTH).enumerate() {
        let valid = Roi::from_row(row)
            .and_then(|roi| roi.batch_index())
            .is_some_and(|b| b < batch_size);
        if !valid {
            return Err(TensorError::invalid_argument_op(
                operation,
                &format!(
                    "roi {} has batch index {:?} outside [0, {})",
                    i, row[0], batch_size
                ),
            ));
        }
    }
    Ok(())
}

pub(crate) fn contiguous<'a, U>(operation: &str, name: &str, tensor: &'a Tensor<U>) -> Result<&'a [U]> {
    tensor.as_slice().ok_or_else(|| {
        TensorError::invalid_argument_op(operation, &format!("{name} must be contiguous"))
    })
}

fn position_sensitive_layout(
    operation: &str,
    channels: usize,
    pooled_size: (usize, usize),
) -> Result<PooledLayout> {
    let (pooled_height, pooled_width) = pooled_size;
    if i32::try_from(channels).is_err() {
        return Err(TensorError::invalid_argument_op(
            operation,
            &format!("{channels} channels cannot be recorded in an i32 channel mapping"),
        ));
    }
    let bins = pooled_height.checked_mul(pooled_width).ok_or_else(|| {
        TensorError::invalid_argument_op(
            operation,
            &format!("pooled size ({pooled_height}, {pooled_width}) overflows"),
        )
    })?;
    if channels % bins != 0 {
        return Err(TensorError::shape_mismatch(
            operation,
            &format!("channels divisible by pooled_height * pooled_width = {bins}"),
            &format!("{channels} channels"),
        ));
    }
    Ok(PooledLayout::new(channels / bins, pooled_height, pooled_width))
}

pub(crate) fn plan_forward<T: PoolElement>(
    operation: &str,
    input: &Tensor<T>,
    rois: &Tensor<T>,
    pooled_size: (usize, usize),
) -> Result<ForwardPlan> {
    let device = check_same_device(operation, &[input.device(), rois.device()])?;
    check_pooled_size(operation, pooled_size)?;

    let dims = input.shape().as_4d().ok_or_else(|| {
        TensorError::invalid_shape(
            operation,
            &format!("input must be 4D [N, C, H, W], got {}D", input.rank()),
            input.shape().dims(),
        )
    })?;
    let dims = FeatureDims::from_array(dims);
    let num_rois = check_rois_shape(operation, rois)?;
    let layout = position_sensitive_layout(operation, dims.channels, pooled_size)
        .map_err(|e| e.with_context(call_context(input, rois)))?;
    check_roi_batch_indices(operation, contiguous(operation, "rois", rois)?, dims.batch)?;
    check_executable(operation, device)?;

    Ok(ForwardPlan {
        dims,
        num_rois,
        layout,
    })
}

pub(crate) fn plan_backward<T: PoolElement>(
    operation: &str,
    grad_output: &Tensor<T>,
    rois: &Tensor<T>,
    channel_mapping: &Tensor<i32>,
    pooled_size: (usize, usize),
    input_shape: [usize; 4],
) -> Result<BackwardPlan> {
    let device = check_same_device(
        operation,
        &[grad_output.device(), rois.device(), channel_mapping.device()],
    )?;
    check_pooled_size(operation, pooled_size)?;

    let dims = FeatureDims::from_array(input_shape);
    if dims.checked_numel().is_none() {
        return Err(TensorError::invalid_argument_op(
            operation,
            &format!("input_shape {input_shape:?} has more elements than fit in memory"),
        )
        .with_context(
            ErrorContext::new()
                .with_input_tensor(grad_output.shape().dims(), *grad_output.device(), T::dtype())
                .with_output_shape(&input_shape),
        ));
    }
    let num_rois = check_rois_shape(operation, rois)?;
    let layout = position_sensitive_layout(operation, dims.channels, pooled_size)?;

    let expected = [
        num_rois,
        layout.out_channels,
        layout.pooled_height,
        layout.pooled_width,
    ];
    if grad_output.shape().dims() != expected {
        return Err(TensorError::shape_mismatch(
            operation,
            &format!("grad_output of shape {:?}", expected),
            &format!("{}", grad_output.shape()),
        ));
    }
    if channel_mapping.shape() != grad_output.shape() {
        return Err(TensorError::shape_mismatch(
            operation,
            &format!("channel_mapping of shape {}", grad_output.shape()),
            &format!("{}", channel_mapping.shape()),
        ));
    }

    check_roi_batch_indices(operation, contiguous(operation, "rois", rois)?, dims.batch)?;
    let mapping = contiguous(operation, "channel_mapping", channel_mapping)?;
    if let Some(bad) = mapping
        .iter()
        .find(|&&c| c < 0 || c as usize >= dims.channels)
    {
        return Err(TensorError::invalid_argument_op(
            operation,
            &format!(
                "channel_mapping entry {} outside [0, {})",
                bad, dims.channels
            ),
        ));
    }
    check_executable(operation, device)?;

    Ok(BackwardPlan {
        dims,
        layout,
        work_items: grad_output.numel(),
    })
}

/// Convert the spatial scale to the element type of the call
pub(crate) fn spatial_scale_as<T: PoolElement>(operation: &str, spatial_scale: f64) -> Result<T> {
    T::from_f64(spatial_scale).ok_or_else(|| {
        TensorError::invalid_argument_op(
            operation,
            &format!("spatial_scale {spatial_scale} is not representable as {}", T::dtype()),
        )
    })
}

fn call_context<T: PoolElement>(input: &Tensor<T>, rois: &Tensor<T>) -> ErrorContext {
    ErrorContext::new()
        .with_input_tensor(input.shape().dims(), *input.device(), T::dtype())
        .with_input_tensor(rois.shape().dims(), *rois.device(), T::dtype())
}

/// Allocate a buffer of `len` copies of `value`, reporting exhaustion as an error
pub(crate) fn allocate_filled<U: Clone>(operation: &str, len: usize, value: U) -> Result<Vec<U>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|e| {
        TensorError::allocation_error(
            operation,
            &e.to_string(),
            Some(len.saturating_mul(std::mem::size_of::<U>())),
        )
    })?;
    buffer.resize(len, value);
    Ok(buffer)
}

/// Allocate `len` zeroed atomic accumulators
pub(crate) fn allocate_accumulators<T: PoolElement>(
    operation: &str,
    len: usize,
) -> Result<Vec<<T as AtomicAccumulate>::Atomic>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|e| {
        TensorError::allocation_error(
            operation,
            &e.to_string(),
            Some(len.saturating_mul(std::mem::size_of::<T>())),
        )
    })?;
    buffer.extend((0..len).map(|_| T::new_atomic(T::zero())));
    Ok(buffer)
}

/// Collapse accumulators into a `[batch, channels, height, width]` tensor
pub(crate) fn accumulators_into_tensor<T: PoolElement>(
    accumulators: Vec<<T as AtomicAccumulate>::Atomic>,
    dims: FeatureDims,
    device: Device,
) -> Result<Tensor<T>> {
    let values: Vec<T> = accumulators.into_iter().map(T::into_value).collect();
    Tensor::from_vec_on(values, &dims.to_array(), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rois(rows: &[[f32; 5]]) -> Tensor<f32> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, &[rows.len(), 5]).unwrap()
    }

    #[test]
    fn test_plan_forward_shapes() {
        let input = Tensor::<f32>::zeros(&[2, 18, 5, 5]);
        let plan = plan_forward("test", &input, &rois(&[[1.0, 0.0, 0.0, 2.0, 2.0]]), (3, 3)).unwrap();
        assert_eq!(plan.output_shape(), [1, 2, 3, 3]);
        assert_eq!(plan.work_items(), 18);
        assert_eq!(plan.dims.plane_offset(1, 2), (18 + 2) * 25);
    }

    #[test]
    fn test_plan_forward_rejects_indivisible_channels() {
        let input = Tensor::<f32>::zeros(&[1, 5, 4, 4]);
        let err = plan_forward("test", &input, &rois(&[]), (2, 2)).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_plan_forward_rejects_bad_rois() {
        let input = Tensor::<f32>::zeros(&[1, 4, 4, 4]);
        let bad_width = Tensor::<f32>::zeros(&[2, 4]);
        let err = plan_forward("test", &input, &bad_width, (2, 2)).unwrap_err();
        assert!(matches!(err, TensorError::InvalidShape { .. }));

        let err = plan_forward("test", &input, &rois(&[[1.0, 0.0, 0.0, 1.0, 1.0]]), (2, 2))
            .unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));
    }

    #[test]
    fn test_device_checks() {
        let input = Tensor::<f32>::zeros(&[1, 4, 4, 4]).to_device(Device::Gpu(0));
        let err = plan_forward("test", &input, &rois(&[]), (2, 2)).unwrap_err();
        assert!(matches!(err, TensorError::DeviceMismatch { .. }));

        let on_gpu = rois(&[]).to_device(Device::Gpu(0));
        let err = plan_forward("test", &input, &on_gpu, (2, 2)).unwrap_err();
        assert!(matches!(err, TensorError::UnsupportedDevice { .. }));
    }

    #[test]
    fn test_plan_backward_checks_mapping() {
        let grad = Tensor::<f32>::zeros(&[1, 1, 2, 2]);
        let r = rois(&[[0.0, 0.0, 0.0, 2.0, 2.0]]);
        let mapping = Tensor::<i32>::from_vec(vec![0, 1, 2, 4], &[1, 1, 2, 2]).unwrap();
        let err = plan_backward("test", &grad, &r, &mapping, (2, 2), [1, 4, 3, 3]).unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));

        let mapping = Tensor::<i32>::zeros(&[1, 1, 2, 1]);
        let err = plan_backward("test", &grad, &r, &mapping, (2, 2), [1, 4, 3, 3]).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));

        let mapping = Tensor::<i32>::from_vec(vec![0, 1, 2, 3], &[1, 1, 2, 2]).unwrap();
        let plan = plan_backward("test", &grad, &r, &mapping, (2, 2), [1, 4, 3, 3]).unwrap();
        assert_eq!(plan.work_items, 4);
    }

    #[test]
    fn test_plan_backward_rejects_oversized_input_shape() {
        let grad = Tensor::<f32>::zeros(&[0, 1, 2, 2]);
        let mapping = Tensor::<i32>::zeros(&[0, 1, 2, 2]);
        let huge = [usize::MAX / 2, 4, 4, 4];
        let err = plan_backward("test", &grad, &rois(&[]), &mapping, (2, 2), huge).unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));
        assert!(err.is_precondition_violation());
        let context = err.context().unwrap();
        assert_eq!(context.output_shape.as_deref(), Some(&huge[..]));

        assert_eq!(FeatureDims::from_array(huge).checked_numel(), None);
        assert_eq!(FeatureDims::from_array([2, 3, 4, 5]).checked_numel(), Some(120));
    }

    #[test]
    fn test_pooled_size_overflow_is_rejected() {
        let input = Tensor::<f32>::zeros(&[1, 4, 4, 4]);
        let err = plan_forward("test", &input, &rois(&[]), (usize::MAX, 2)).unwrap_err();
        assert!(matches!(err, TensorError::InvalidArgument { .. }));
    }

    #[test]
    fn test_allocation_helpers() {
        let buffer = allocate_filled("test", 3, 7i32).unwrap();
        assert_eq!(buffer, vec![7, 7, 7]);

        let acc = allocate_accumulators::<f32>("test", 4).unwrap();
        f32::atomic_add(&acc[2], 1.5);
        let dims = FeatureDims::from_array([1, 1, 2, 2]);
        let t = accumulators_into_tensor::<f32>(acc, dims, Device::Cpu).unwrap();
        assert_eq!(t.into_vec(), vec![0.0, 0.0, 1.5, 0.0]);
    }

    #[test]
    fn test_allocation_failure_is_execution_failure() {
        let err = allocate_filled("test", usize::MAX, 0u64).unwrap_err();
        assert!(err.is_execution_failure());
    }
}
