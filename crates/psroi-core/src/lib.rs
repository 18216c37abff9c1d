//! Position-sensitive region-of-interest pooling on host tensors
//!
//! `psroi-core` provides a small owned tensor type together with the
//! position-sensitive ROI Align and ROI Pool operators used by R-FCN style
//! detection heads, including their backward passes.
//!
//! ```rust
//! use psroi_core::{ps_roi_align, Tensor};
//!
//! let input = Tensor::<f32>::ones(&[1, 4, 4, 4]);
//! let rois = Tensor::from_vec(vec![0.0, 0.0, 0.0, 4.0, 4.0], &[1, 5]).unwrap();
//! let (output, channel_mapping) = ps_roi_align(&input, &rois, (2, 2), 1.0, 2).unwrap();
//! assert_eq!(output.shape().dims(), &[1, 1, 2, 2]);
//! assert_eq!(channel_mapping.into_vec(), vec![0, 1, 2, 3]);
//! ```

#![allow(clippy::result_large_err)]

pub mod device;
pub mod dtype;
pub mod element;
pub mod error;
pub mod numerical_gradient;
pub mod ops;
pub mod shape;
pub mod tensor;

pub use device::{get_launch_config, set_launch_config, Device, LaunchConfig, LaunchGeometry};
pub use dtype::{dtype_from_type, DType};
pub use element::{bf16, f16, AtomicAccumulate, PoolElement};
pub use error::{ErrorContext, Result, TensorError};
pub use ops::{
    convert_boxes_to_roi_format, ps_roi_align, ps_roi_align_backward, ps_roi_pool,
    ps_roi_pool_backward,
};
pub use shape::Shape;
pub use tensor::Tensor;
