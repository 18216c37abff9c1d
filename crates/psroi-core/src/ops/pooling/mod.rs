//! Position-sensitive region-of-interest pooling
//!
//! - **ps_roi_align**: bilinear sub-pixel sampling (Light-Head R-CNN)
//! - **ps_roi_pool**: quantised pixel windows (R-FCN)
//!
//! Both operators share ROI decoding, output-index layout and argument
//! validation, and run one work item per output element.

pub mod bilinear;
pub mod dispatch;
pub mod ps_roi_align;
pub mod ps_roi_pool;
pub mod roi;

pub use bilinear::{bilinear_interpolate, bilinear_weights, BilinearWeights};
pub use dispatch::FeatureDims;
pub use ps_roi_align::{ps_roi_align, ps_roi_align_backward};
pub use ps_roi_pool::{ps_roi_pool, ps_roi_pool_backward};
pub use roi::{OutputIndex, PooledLayout, Roi, RoiAlignGeometry, ROI_WIDTH};
