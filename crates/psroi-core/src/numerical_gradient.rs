//! Numerical Gradient Validation Utilities
//!
//! Validates hand-written backward kernels against finite differences.
//! The function under test maps an input tensor to a scalar objective,
//! typically `sum(weights * forward(input))`; the analytical side is the
//! backward kernel applied to `weights`.
//!
//! ```text
//! df/dx_i ≈ [f(x + ε e_i) - f(x - ε e_i)] / (2ε)
//! ```
//!
//! # Example
//!
//! ```rust
//! use psroi_core::numerical_gradient::{check_gradients, GradientCheckConfig};
//! use psroi_core::Tensor;
//!
//! let x = Tensor::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
//!
//! // f(x) = sum(x^2), df/dx = 2x
//! let objective = |t: &Tensor<f64>| -> psroi_core::Result<f64> {
//!     Ok(t.as_slice().unwrap().iter().map(|v| v * v).sum())
//! };
//! let gradient = |t: &Tensor<f64>| {
//!     Tensor::from_vec(t.as_slice().unwrap().iter().map(|v| 2.0 * v).collect(), &[3])
//! };
//!
//! let result = check_gradients(&x, objective, gradient, &GradientCheckConfig::default()).unwrap();
//! assert!(result.is_ok(), "{}", result.summary());
//! ```

use crate::{Result, Tensor, TensorError};
use num_traits::{Float, FromPrimitive};
use std::marker::PhantomData;

const OPERATION: &str = "numerical_gradient";

/// Configuration for numerical gradient checking
#[derive(Debug, Clone)]
pub struct GradientCheckConfig {
    /// Epsilon for finite difference computation
    pub epsilon: f64,
    /// Relative tolerance for gradient comparison
    pub rtol: f64,
    /// Absolute tolerance for gradient comparison
    pub atol: f64,
    /// Record the indices of failing elements
    pub check_elementwise: bool,
    /// Use central differences (more accurate but 2x slower)
    pub use_central_difference: bool,
    /// Maximum number of input cells to perturb, evenly strided over the input
    pub max_samples: Option<usize>,
}

impl Default for GradientCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            rtol: 1e-3,
            atol: 1e-5,
            check_elementwise: false,
            use_central_difference: true,
            max_samples: None,
        }
    }
}

impl GradientCheckConfig {
    /// Create a configuration for strict checking (tighter tolerances)
    pub fn strict() -> Self {
        Self {
            epsilon: 1e-6,
            rtol: 1e-4,
            atol: 1e-6,
            check_elementwise: true,
            use_central_difference: true,
            max_samples: None,
        }
    }

    /// Create a configuration for relaxed checking (looser tolerances)
    pub fn relaxed() -> Self {
        Self {
            epsilon: 1e-3,
            rtol: 1e-2,
            atol: 1e-4,
            check_elementwise: false,
            use_central_difference: true,
            max_samples: Some(100),
        }
    }

    /// Create a configuration for fast checking (forward differences, sampling)
    pub fn fast() -> Self {
        Self {
            epsilon: 1e-5,
            rtol: 1e-3,
            atol: 1e-5,
            check_elementwise: false,
            use_central_difference: false,
            max_samples: Some(50),
        }
    }
}

/// Result of gradient checking
#[derive(Debug, Clone)]
pub struct GradientCheckResult {
    /// Whether the gradient check passed
    pub passed: bool,
    /// Maximum relative error found
    pub max_relative_error: f64,
    /// Maximum absolute error found
    pub max_absolute_error: f64,
    /// Number of elements checked
    pub num_elements_checked: usize,
    /// Number of elements that failed tolerance check
    pub num_failures: usize,
    /// Indices of failed elements (if check_elementwise is true)
    pub failed_indices: Vec<usize>,
    /// Detailed error message if check failed
    pub error_message: Option<String>,
}

impl GradientCheckResult {
    pub fn is_ok(&self) -> bool {
        self.passed
    }

    /// Get failure rate (percentage of elements that failed)
    pub fn failure_rate(&self) -> f64 {
        if self.num_elements_checked == 0 {
            0.0
        } else {
            (self.num_failures as f64 / self.num_elements_checked as f64) * 100.0
        }
    }

    /// Generate a summary report
    pub fn summary(&self) -> String {
        if self.passed {
            format!(
                "Gradient check passed\n\
                 Elements checked: {}\n\
                 Max relative error: {:.2e}\n\
                 Max absolute error: {:.2e}",
                self.num_elements_checked, self.max_relative_error, self.max_absolute_error
            )
        } else {
            format!(
                "Gradient check FAILED\n\
                 Elements checked: {}\n\
                 Failures: {} ({:.2}%)\n\
                 Max relative error: {:.2e}\n\
                 Max absolute error: {:.2e}\n\
                 {}",
                self.num_elements_checked,
                self.num_failures,
                self.failure_rate(),
                self.max_relative_error,
                self.max_absolute_error,
                self.error_message.as_deref().unwrap_or("")
            )
        }
    }
}

/// Numerical gradient checker
pub struct NumericalGradientChecker<T> {
    config: GradientCheckConfig,
    _phantom: PhantomData<T>,
}

impl<T> NumericalGradientChecker<T>
where
    T: Float + FromPrimitive + Clone + Send + Sync + Default + 'static,
{
    pub fn new(config: GradientCheckConfig) -> Self {
        Self {
            config,
            _phantom: PhantomData,
        }
    }

    /// Input cells perturbed by this configuration
    pub fn sample_indices(&self, len: usize) -> Vec<usize> {
        match self.config.max_samples {
            Some(max) if max > 0 && max < len => {
                let stride = len.div_ceil(max);
                (0..len).step_by(stride).collect()
            }
            _ => (0..len).collect(),
        }
    }

    /// Finite-difference gradient of `objective` at the sampled input cells.
    ///
    /// Returns `(index, derivative)` pairs in index order.
    pub fn compute_numerical_gradient<F>(
        &self,
        input: &Tensor<T>,
        objective: F,
    ) -> Result<Vec<(usize, f64)>>
    where
        F: Fn(&Tensor<T>) -> Result<T>,
    {
        let data = input.as_slice().ok_or_else(|| {
            TensorError::invalid_argument_op(OPERATION, "input must be contiguous")
        })?;
        let dims = input.shape().dims();
        let epsilon = T::from_f64(self.config.epsilon).ok_or_else(|| {
            TensorError::invalid_argument_op(OPERATION, "Failed to convert epsilon")
        })?;
        let perturbed = |i: usize, delta: T| -> Result<T> {
            let mut values = data.to_vec();
            values[i] = values[i] + delta;
            let tensor = Tensor::from_vec_on(values, dims, *input.device())?;
            objective(&tensor)
        };

        let baseline = if self.config.use_central_difference {
            None
        } else {
            Some(objective(input)?)
        };

        let mut gradient = Vec::new();
        for i in self.sample_indices(data.len()) {
            let derivative = match baseline {
                None => {
                    // Central difference: [f(x + ε) - f(x - ε)] / (2ε)
                    let diff = perturbed(i, epsilon)? - perturbed(i, -epsilon)?;
                    diff / (epsilon + epsilon)
                }
                // Forward difference: [f(x + ε) - f(x)] / ε
                Some(f_x) => (perturbed(i, epsilon)? - f_x) / epsilon,
            };
            gradient.push((i, derivative.to_f64().unwrap_or(f64::NAN)));
        }
        Ok(gradient)
    }

    /// Compare numerical derivatives against an analytical gradient tensor
    pub fn compare_gradients(
        &self,
        numerical: &[(usize, f64)],
        analytical: &Tensor<T>,
    ) -> Result<GradientCheckResult> {
        let ana_data = analytical.as_slice().ok_or_else(|| {
            TensorError::invalid_argument_op(OPERATION, "analytical gradient must be contiguous")
        })?;

        let rtol = self.config.rtol;
        let atol = self.config.atol;

        let mut max_rel_error = 0.0f64;
        let mut max_abs_error = 0.0f64;
        let mut num_failures = 0;
        let mut failed_indices = Vec::new();

        for &(i, num_val) in numerical {
            let ana_val = ana_data
                .get(i)
                .ok_or_else(|| {
                    TensorError::shape_mismatch(
                        OPERATION,
                        &format!("analytical gradient with more than {i} elements"),
                        &format!("{}", analytical.shape()),
                    )
                })?
                .to_f64()
                .unwrap_or(f64::NAN);

            let abs_error = (num_val - ana_val).abs();
            let rel_error = if ana_val.abs() > 1e-10 {
                abs_error / ana_val.abs()
            } else {
                abs_error
            };

            max_rel_error = max_rel_error.max(rel_error);
            max_abs_error = max_abs_error.max(abs_error);

            if !(rel_error <= rtol || abs_error <= atol) {
                num_failures += 1;
                if self.config.check_elementwise {
                    failed_indices.push(i);
                }
            }
        }

        let passed = num_failures == 0;
        let error_message = if !passed {
            Some(format!(
                "Gradient mismatch: {} of {} elements exceed tolerance (rtol={}, atol={})",
                num_failures,
                numerical.len(),
                rtol,
                atol
            ))
        } else {
            None
        };

        Ok(GradientCheckResult {
            passed,
            max_relative_error: max_rel_error,
            max_absolute_error: max_abs_error,
            num_elements_checked: numerical.len(),
            num_failures,
            failed_indices,
            error_message,
        })
    }

    /// Full gradient check: compute numerical gradient and compare
    pub fn check<F, G>(
        &self,
        input: &Tensor<T>,
        objective: F,
        gradient: G,
    ) -> Result<GradientCheckResult>
    where
        F: Fn(&Tensor<T>) -> Result<T>,
        G: Fn(&Tensor<T>) -> Result<Tensor<T>>,
    {
        let analytical = gradient(input)?;
        if analytical.shape() != input.shape() {
            return Err(TensorError::shape_mismatch(
                OPERATION,
                &format!("analytical gradient of shape {}", input.shape()),
                &format!("{}", analytical.shape()),
            ));
        }
        let numerical = self.compute_numerical_gradient(input, objective)?;
        self.compare_gradients(&numerical, &analytical)
    }
}

/// `sum(weights * values)`, the usual scalar objective for checking a backward pass
pub fn weighted_sum<T: Float>(values: &Tensor<T>, weights: &Tensor<T>) -> Result<T> {
    if values.shape() != weights.shape() {
        return Err(TensorError::shape_mismatch(
            "weighted_sum",
            &format!("{}", values.shape()),
            &format!("{}", weights.shape()),
        ));
    }
    Ok(values
        .as_array()
        .iter()
        .zip(weights.as_array().iter())
        .fold(T::zero(), |acc, (&v, &w)| acc + v * w))
}

/// Convenience function for quick gradient checking
pub fn check_gradients<T, F, G>(
    input: &Tensor<T>,
    objective: F,
    gradient: G,
    config: &GradientCheckConfig,
) -> Result<GradientCheckResult>
where
    T: Float + FromPrimitive + Clone + Send + Sync + Default + 'static,
    F: Fn(&Tensor<T>) -> Result<T>,
    G: Fn(&Tensor<T>) -> Result<Tensor<T>>,
{
    let checker = NumericalGradientChecker::new(config.clone());
    checker.check(input, objective, gradient)
}

/// Convenience function with default configuration
pub fn quick_check_gradients<T, F, G>(
    input: &Tensor<T>,
    objective: F,
    gradient: G,
) -> Result<GradientCheckResult>
where
    T: Float + FromPrimitive + Clone + Send + Sync + Default + 'static,
    F: Fn(&Tensor<T>) -> Result<T>,
    G: Fn(&Tensor<T>) -> Result<Tensor<T>>,
{
    check_gradients(input, objective, gradient, &GradientCheckConfig::default())
}
