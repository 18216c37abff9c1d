#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum DType {
    Float16,  // Half precision IEEE 754-2008
    BFloat16, // Brain floating point
    Float32,
    Float64,
    Int32,
    Int64,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::Float16 => 2,
            DType::BFloat16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
            DType::Int32 => 4,
            DType::Int64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            DType::Float16 | DType::BFloat16 | DType::Float32 | DType::Float64
        )
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Get DType from Rust type, or `None` for element types the operators do not carry.
pub fn dtype_from_type<T: 'static>() -> Option<DType> {
    use half::{bf16, f16};
    use std::any::TypeId;

    let id = TypeId::of::<T>();
    if id == TypeId::of::<f16>() {
        Some(DType::Float16)
    } else if id == TypeId::of::<bf16>() {
        Some(DType::BFloat16)
    } else if id == TypeId::of::<f32>() {
        Some(DType::Float32)
    } else if id == TypeId::of::<f64>() {
        Some(DType::Float64)
    } else if id == TypeId::of::<i32>() {
        Some(DType::Int32)
    } else if id == TypeId::of::<i64>() {
        Some(DType::Int64)
    } else {
        None
    }
}
