use crate::{DType, Device};
use thiserror::Error;

/// Errors raised by tensor construction and the pooling operators.
///
/// Every variant carries the name of the operation that failed. Variants fall
/// into two families: precondition violations, detected before any parallel
/// work is launched, and execution failures, reported by the execution
/// substrate once validation has passed.
#[derive(Error, Debug, Clone)]
pub enum TensorError {
    #[error("Shape mismatch in operation '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
        context: Option<ErrorContext>,
    },

    #[error("Incompatible devices in operation '{operation}': {device1} and {device2}")]
    DeviceMismatch {
        operation: String,
        device1: String,
        device2: String,
        context: Option<ErrorContext>,
    },

    #[error("Operation '{operation}' not supported on device: {device}")]
    UnsupportedDevice {
        operation: String,
        device: String,
        context: Option<ErrorContext>,
    },

    #[error("Invalid shape in operation '{operation}': {reason}")]
    InvalidShape {
        operation: String,
        reason: String,
        shape: Option<Vec<usize>>,
        context: Option<ErrorContext>,
    },

    #[error("Invalid argument in operation '{operation}': {reason}")]
    InvalidArgument {
        operation: String,
        reason: String,
        context: Option<ErrorContext>,
    },

    #[error("Memory allocation failed in operation '{operation}': {details}")]
    AllocationError {
        operation: String,
        details: String,
        requested_bytes: Option<usize>,
        context: Option<ErrorContext>,
    },

    #[error("Device error in operation '{operation}': {details}")]
    DeviceError {
        operation: String,
        details: String,
        device: String,
        context: Option<ErrorContext>,
    },
}

/// Additional context information for errors
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Input tensor shapes
    pub input_shapes: Vec<Vec<usize>>,
    /// Input tensor devices
    pub input_devices: Vec<Device>,
    /// Input tensor data types
    pub input_dtypes: Vec<DType>,
    /// Output shape (if applicable)
    pub output_shape: Option<Vec<usize>>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add input tensor information
    pub fn with_input_tensor(mut self, shape: &[usize], device: Device, dtype: DType) -> Self {
        self.input_shapes.push(shape.to_vec());
        self.input_devices.push(device);
        self.input_dtypes.push(dtype);
        self
    }

    /// Add output shape information
    pub fn with_output_shape(mut self, shape: &[usize]) -> Self {
        self.output_shape = Some(shape.to_vec());
        self
    }
}

impl TensorError {
    pub fn shape_mismatch(operation: &str, expected: &str, got: &str) -> Self {
        Self::ShapeMismatch {
            operation: operation.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
            context: None,
        }
    }

    pub fn device_mismatch(operation: &str, device1: &str, device2: &str) -> Self {
        Self::DeviceMismatch {
            operation: operation.to_string(),
            device1: device1.to_string(),
            device2: device2.to_string(),
            context: None,
        }
    }

    pub fn unsupported_device(operation: &str, device: &str) -> Self {
        Self::UnsupportedDevice {
            operation: operation.to_string(),
            device: device.to_string(),
            context: None,
        }
    }

    /// Create an invalid shape error that records the offending shape
    pub fn invalid_shape(operation: &str, reason: &str, shape: &[usize]) -> Self {
        Self::InvalidShape {
            operation: operation.to_string(),
            reason: reason.to_string(),
            shape: Some(shape.to_vec()),
            context: None,
        }
    }

    pub fn invalid_shape_simple(reason: String) -> Self {
        Self::InvalidShape {
            operation: "tensor_creation".to_string(),
            reason,
            shape: None,
            context: None,
        }
    }

    pub fn invalid_argument_op(operation: &str, reason: &str) -> Self {
        Self::InvalidArgument {
            operation: operation.to_string(),
            reason: reason.to_string(),
            context: None,
        }
    }

    pub fn allocation_error(operation: &str, details: &str, requested: Option<usize>) -> Self {
        Self::AllocationError {
            operation: operation.to_string(),
            details: details.to_string(),
            requested_bytes: requested,
            context: None,
        }
    }

    pub fn device_error(operation: &str, details: &str, device: &str) -> Self {
        Self::DeviceError {
            operation: operation.to_string(),
            details: details.to_string(),
            device: device.to_string(),
            context: None,
        }
    }

    /// Add context to an existing error
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        match &mut self {
            Self::ShapeMismatch { context: ctx, .. } => *ctx = Some(context),
            Self::DeviceMismatch { context: ctx, .. } => *ctx = Some(context),
            Self::UnsupportedDevice { context: ctx, .. } => *ctx = Some(context),
            Self::InvalidShape { context: ctx, .. } => *ctx = Some(context),
            Self::InvalidArgument { context: ctx, .. } => *ctx = Some(context),
            Self::AllocationError { context: ctx, .. } => *ctx = Some(context),
            Self::DeviceError { context: ctx, .. } => *ctx = Some(context),
        }
        self
    }

    /// Get the context attached to this error, if any
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::ShapeMismatch { context, .. }
            | Self::DeviceMismatch { context, .. }
            | Self::UnsupportedDevice { context, .. }
            | Self::InvalidShape { context, .. }
            | Self::InvalidArgument { context, .. }
            | Self::AllocationError { context, .. }
            | Self::DeviceError { context, .. } => context.as_ref(),
        }
    }

    /// Get the operation name for this error
    pub fn operation(&self) -> &str {
        match self {
            Self::ShapeMismatch { operation, .. } => operation,
            Self::DeviceMismatch { operation, .. } => operation,
            Self::UnsupportedDevice { operation, .. } => operation,
            Self::InvalidShape { operation, .. } => operation,
            Self::InvalidArgument { operation, .. } => operation,
            Self::AllocationError { operation, .. } => operation,
            Self::DeviceError { operation, .. } => operation,
        }
    }

    /// True for errors raised while validating a call, before any work is launched.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. }
                | Self::DeviceMismatch { .. }
                | Self::UnsupportedDevice { .. }
                | Self::InvalidShape { .. }
                | Self::InvalidArgument { .. }
        )
    }

    /// True for failures reported by the execution substrate after validation.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::AllocationError { .. } | Self::DeviceError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

impl From<ndarray::ShapeError> for TensorError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::InvalidShape {
            operation: "tensor_creation".to_string(),
            reason: format!("Shape error: {err}"),
            shape: None,
            context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families() {
        let err = TensorError::shape_mismatch("ps_roi_align", "[N, 5]", "[3, 4]");
        assert!(err.is_precondition_violation());
        assert!(!err.is_execution_failure());
        assert_eq!(err.operation(), "ps_roi_align");

        let err = TensorError::allocation_error("ps_roi_align", "out of memory", Some(64));
        assert!(err.is_execution_failure());
        assert!(!err.is_precondition_violation());
    }

    #[test]
    fn test_error_display() {
        let err = TensorError::device_mismatch("ps_roi_pool", "cpu", "gpu:0");
        assert_eq!(
            err.to_string(),
            "Incompatible devices in operation 'ps_roi_pool': cpu and gpu:0"
        );
    }

    #[test]
    fn test_with_context() {
        let ctx = ErrorContext::new()
            .with_input_tensor(&[1, 4, 4, 4], Device::Cpu, DType::Float32)
            .with_output_shape(&[1, 1, 2, 2]);
        let err = TensorError::invalid_argument_op("ps_roi_align", "bad").with_context(ctx);
        let ctx = err.context().expect("context was attached");
        assert_eq!(ctx.input_shapes, vec![vec![1, 4, 4, 4]]);
        assert_eq!(ctx.output_shape, Some(vec![1, 1, 2, 2]));
    }
}
