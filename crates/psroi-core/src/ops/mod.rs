pub mod boxes;
pub mod pooling;

pub use boxes::convert_boxes_to_roi_format;
pub use pooling::{ps_roi_align, ps_roi_align_backward, ps_roi_pool, ps_roi_pool_backward};
