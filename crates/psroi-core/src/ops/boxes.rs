//! Conversion from per-image box lists to the ROI tensor layout

use crate::element::PoolElement;
use crate::ops::pooling::dispatch::{allocate_filled, check_same_device, contiguous};
use crate::ops::pooling::ROI_WIDTH;
use crate::{Device, Result, Tensor, TensorError};

const OPERATION: &str = "convert_boxes_to_roi_format";

/// Concatenate per-image boxes into a `[K, 5]` ROI tensor.
///
/// `boxes[i]` is a `[L_i, 4]` tensor of `(x1, y1, x2, y2)` rows belonging to
/// batch item `i`. Each row is prefixed with `i` and rows keep their order.
/// An empty list yields a `[0, 5]` tensor on the CPU.
pub fn convert_boxes_to_roi_format<T: PoolElement>(boxes: &[Tensor<T>]) -> Result<Tensor<T>> {
    if boxes.is_empty() {
        return Tensor::from_vec(Vec::new(), &[0, ROI_WIDTH]);
    }
    let devices: Vec<&Device> = boxes.iter().map(|b| b.device()).collect();
    let device = check_same_device(OPERATION, &devices)?;

    let mut total = 0;
    for (i, tensor) in boxes.iter().enumerate() {
        match tensor.shape().dims() {
            &[rows, 4] => total += rows,
            dims => {
                return Err(TensorError::invalid_shape(
                    OPERATION,
                    &format!("boxes[{i}] must be [num_boxes, 4], got {:?}", dims),
                    dims,
                ))
            }
        }
    }

    let mut rois = allocate_filled(OPERATION, total * ROI_WIDTH, T::zero())?;
    let mut offset = 0;
    for (i, tensor) in boxes.iter().enumerate() {
        let batch_index = T::from_usize(i).ok_or_else(|| {
            TensorError::invalid_argument_op(
                OPERATION,
                &format!("batch index {i} is not representable as {}", T::dtype()),
            )
        })?;
        for coords in contiguous(OPERATION, "boxes", tensor)?.chunks_exact(4) {
            let row = &mut rois[offset..offset + ROI_WIDTH];
            row[0] = batch_index;
            row[1..].copy_from_slice(coords);
            offset += ROI_WIDTH;
        }
    }

    log::trace!(
        "{OPERATION}: {} box tensors, {} rois on {}",
        boxes.len(),
        total,
        device
    );
    Tensor::from_vec_on(rois, &[total, ROI_WIDTH], device)
}
