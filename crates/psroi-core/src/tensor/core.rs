//! Core Tensor Structure and Properties

use crate::{DType, Device, Shape};
use ndarray::ArrayD;

/// Owned, contiguous n-dimensional array tagged with a device.
///
/// Constructors always produce standard (row-major) layout, so
/// [`Tensor::as_slice`] is available for every tensor built through this API.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub(in crate::tensor) data: ArrayD<T>,
    pub(in crate::tensor) shape: Shape,
    pub(in crate::tensor) device: Device,
}

impl<T> Tensor<T> {
    /// Get the shape of the tensor
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Get the device where the tensor is located
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the data type of the tensor, if it is one the operators carry
    pub fn dtype(&self) -> Option<DType>
    where
        T: 'static,
    {
        crate::dtype_from_type::<T>()
    }

    /// Get the value at a specific multi-dimensional index
    pub fn get(&self, index: &[usize]) -> Option<T>
    where
        T: Clone,
    {
        if index.len() != self.data.ndim() {
            return None;
        }
        self.data.get(index).cloned()
    }

    /// Get the underlying data as a row-major slice
    pub fn as_slice(&self) -> Option<&[T]> {
        self.data.as_slice()
    }

    /// Borrow the underlying ndarray
    pub fn as_array(&self) -> &ArrayD<T> {
        &self.data
    }

    /// Consume the tensor and return its elements in row-major order
    pub fn into_vec(self) -> Vec<T> {
        self.data.into_raw_vec_and_offset().0
    }

    /// Retag the tensor with another device. The element buffer is kept as is.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Check if tensor is empty (has no elements)
    pub fn is_empty(&self) -> bool {
        self.shape.elements() == 0
    }

    /// Get memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.shape.elements() * std::mem::size_of::<T>()
    }

    /// Get the total number of elements
    pub fn numel(&self) -> usize {
        self.shape.size()
    }

    /// Get the number of dimensions (rank)
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Get tensor summary as a formatted string
    pub fn summary(&self) -> String {
        format!(
            "Tensor<{}>: shape={}, device={}, numel={}, memory={}B",
            std::any::type_name::<T>(),
            self.shape,
            self.device,
            self.shape.elements(),
            self.memory_usage(),
        )
    }
}
