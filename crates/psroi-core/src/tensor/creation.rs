//! Tensor Creation and Construction

use super::core::Tensor;
use crate::{Device, Result, Shape, TensorError};
use ndarray::{ArrayD, IxDyn};

impl<T: Clone> Tensor<T> {
    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize]) -> Self
    where
        T: num_traits::Zero,
    {
        Self::from_array(ArrayD::zeros(IxDyn(shape)))
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: &[usize]) -> Self
    where
        T: num_traits::One,
    {
        Self::from_array(ArrayD::ones(IxDyn(shape)))
    }

    /// Create a tensor filled with a specific value
    pub fn full(shape: &[usize], value: T) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Create a tensor from an existing ndarray.
    ///
    /// Arrays that are not in standard layout are copied into standard layout.
    pub fn from_array(array: ArrayD<T>) -> Self {
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Self {
            shape: Shape::from_slice(array.shape()),
            data: array,
            device: Device::Cpu,
        }
    }

    /// Create a tensor from a vector of data with specified shape
    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let total_size = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                TensorError::invalid_shape_simple(format!(
                    "Shape {:?} has more elements than fit in usize",
                    shape
                ))
            })?;
        if data.len() != total_size {
            return Err(TensorError::invalid_shape_simple(format!(
                "Data length {} doesn't match shape {:?} (size {})",
                data.len(),
                shape,
                total_size
            )));
        }

        let array = ArrayD::from_shape_vec(IxDyn(shape), data)?;
        Ok(Self::from_array(array))
    }

    /// Create a tensor on `device` from a vector of data with specified shape
    pub fn from_vec_on(data: Vec<T>, shape: &[usize], device: Device) -> Result<Self> {
        Ok(Self::from_vec(data, shape)?.to_device(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_constructors() {
        let zeros = Tensor::<f32>::zeros(&[2, 3]);
        assert_eq!(zeros.shape().dims(), &[2, 3]);
        assert_eq!(zeros.numel(), 6);

        let ones = Tensor::<f32>::ones(&[2, 2]);
        assert_eq!(ones.as_slice(), Some(&[1.0, 1.0, 1.0, 1.0][..]));

        let full = Tensor::<f64>::full(&[3], 5.0);
        assert_eq!(full.into_vec(), vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_from_vec_length_check() {
        assert!(Tensor::<f32>::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).is_err());

        let t = Tensor::<f32>::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        assert_eq!(t.get(&[1, 0]), Some(3.0));
        assert_eq!(t.get(&[2, 0]), None);
        assert_eq!(t.get(&[0]), None);
    }

    #[test]
    fn test_from_vec_rejects_overflowing_shape() {
        let err = Tensor::<f32>::from_vec(vec![], &[usize::MAX / 2, 4]).unwrap_err();
        assert!(matches!(err, TensorError::InvalidShape { .. }));
    }

    #[test]
    fn test_from_array_makes_contiguous() {
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1, 2, 3, 4, 5, 6])
            .unwrap()
            .reversed_axes();
        let t = Tensor::from_array(array);
        assert_eq!(t.shape().dims(), &[3, 2]);
        assert_eq!(t.as_slice(), Some(&[1, 4, 2, 5, 3, 6][..]));
    }

    #[test]
    fn test_empty_and_device() {
        let empty = Tensor::<f32>::zeros(&[0, 5]);
        assert!(empty.is_empty());
        assert_eq!(empty.rank(), 2);

        let t = Tensor::<f32>::from_vec_on(vec![1.0], &[1], Device::Gpu(0)).unwrap();
        assert_eq!(t.device(), &Device::Gpu(0));
        assert!(t.summary().contains("device=gpu:0"));
        assert_eq!(t.memory_usage(), 4);
        assert!(t.summary().contains("memory=4B"));
    }
}
