//! Tensor container used by the pooling operators
//!
//! - **core**: tensor structure, properties and element access
//! - **creation**: constructors

pub mod core;
pub mod creation;

pub use self::core::Tensor;
