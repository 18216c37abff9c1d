//! Element types accepted by the pooling operators
//!
//! The kernels are generic over [`PoolElement`], implemented for `f32`, `f64`
//! and the half precision types `f16` and `bf16`. Besides ordinary float
//! arithmetic every element type provides a lock-free atomic add, used by the
//! backward kernels to scatter gradients into overlapping input cells.

use crate::DType;
pub use half::{bf16, f16};
use num_traits::{Float, FromPrimitive};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Lock-free additive accumulation for a float type.
///
/// The value is stored as its bit pattern in an unsigned atomic of the same
/// width and updated with a compare-exchange loop, so concurrent adds to the
/// same cell are never lost.
pub trait AtomicAccumulate: Copy + Send + Sync + 'static {
    type Atomic: Send + Sync;

    fn new_atomic(value: Self) -> Self::Atomic;

    fn atomic_add(cell: &Self::Atomic, value: Self);

    fn atomic_load(cell: &Self::Atomic) -> Self;

    fn into_value(cell: Self::Atomic) -> Self;
}

macro_rules! impl_atomic_accumulate {
    ($ty:ty, $atomic:ty, $bits:ty) => {
        impl AtomicAccumulate for $ty {
            type Atomic = $atomic;

            fn new_atomic(value: Self) -> $atomic {
                <$atomic>::new(bytemuck::cast::<$ty, $bits>(value))
            }

            fn atomic_add(cell: &$atomic, value: Self) {
                // The closure never declines, so fetch_update cannot fail.
                let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    let current = bytemuck::cast::<$bits, $ty>(bits);
                    Some(bytemuck::cast::<$ty, $bits>(current + value))
                });
            }

            fn atomic_load(cell: &$atomic) -> Self {
                bytemuck::cast::<$bits, $ty>(cell.load(Ordering::Relaxed))
            }

            fn into_value(cell: $atomic) -> Self {
                bytemuck::cast::<$bits, $ty>(cell.into_inner())
            }
        }
    };
}

impl_atomic_accumulate!(f32, AtomicU32, u32);
impl_atomic_accumulate!(f64, AtomicU64, u64);
impl_atomic_accumulate!(f16, AtomicU16, u16);
impl_atomic_accumulate!(bf16, AtomicU16, u16);

/// Floating point element type usable by the pooling kernels
pub trait PoolElement:
    Float
    + FromPrimitive
    + Default
    + std::fmt::Debug
    + Send
    + Sync
    + bytemuck::Pod
    + AtomicAccumulate
    + 'static
{
    /// Data type tag of this element type
    fn dtype() -> DType;
}

impl PoolElement for f32 {
    fn dtype() -> DType {
        DType::Float32
    }
}

impl PoolElement for f64 {
    fn dtype() -> DType {
        DType::Float64
    }
}

impl PoolElement for f16 {
    fn dtype() -> DType {
        DType::Float16
    }
}

impl PoolElement for bf16 {
    fn dtype() -> DType {
        DType::BFloat16
    }
}
