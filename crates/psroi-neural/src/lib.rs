//! Layer wrappers around the `psroi-core` pooling operators
//!
//! Layers hold the pooling hyper-parameters, accept ROIs either as a `[K, 5]`
//! tensor or as per-image box lists, and return the context needed to run the
//! backward pass later.

#![allow(clippy::result_large_err)]

pub mod layers;

pub use layers::pooling::{
    ps_roi_align, ps_roi_pool, PooledSize, PsRoiAlign2D, PsRoiAlignContext, PsRoiPool2D,
    PsRoiPoolContext, Rois, DEFAULT_SAMPLING_RATIO, DEFAULT_SPATIAL_SCALE,
};
