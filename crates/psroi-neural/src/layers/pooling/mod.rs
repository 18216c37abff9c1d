// Pooling layers organized by type

pub mod ps_roi;

pub use ps_roi::{
    ps_roi_align, ps_roi_pool, PooledSize, PsRoiAlign2D, PsRoiAlignContext, PsRoiPool2D,
    PsRoiPoolContext, Rois, DEFAULT_SAMPLING_RATIO, DEFAULT_SPATIAL_SCALE,
};
