//! Error kinds raised by the jet engine.
//!
//! All of them are programmer or configuration errors: they are reported at the
//! point of misuse and never silently defaulted. Dropping terms above the
//! environment order is the defined truncation behaviour and is not an error.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DaError {
    /// Operands were built on different environment instances.
    #[error("operands belong to different jet environments")]
    EnvironmentMismatch,

    /// The constant (weight zero) term of a denominator, or of the argument of
    /// a function singular at zero, vanishes.
    #[error("{operation}: the constant term of the argument is zero")]
    DivisionByZeroConstant { operation: &'static str },

    #[error("{operation} did not converge within {iterations} iterations")]
    NonConvergence {
        operation: &'static str,
        iterations: usize,
    },

    /// A derivative or monomial was requested beyond the environment order, or
    /// beyond the accuracy a jet has left after earlier differentiation.
    #[error("requested weight {requested} exceeds the available order {order}")]
    OrderExceeded { requested: u32, order: u32 },

    /// Arithmetic was attempted on a default-constructed (void) jet.
    #[error("arithmetic on an uninitialized jet")]
    UninitializedJet,

    #[error("invalid variable: {0}")]
    InvalidVariable(String),

    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),

    /// The linear part of a map cannot be inverted.
    #[error("the jacobian of the map is singular")]
    SingularJacobian,
}

pub type Result<T> = std::result::Result<T, DaError>;

#[cfg(test)]
mod tests {
    use super::DaError;

    #[test]
    fn messages_name_the_failing_operation() {
        let err = DaError::DivisionByZeroConstant { operation: "log" };
        assert_eq!(format!("{err}"), "log: the constant term of the argument is zero");

        let err = DaError::NonConvergence {
            operation: "map inversion",
            iterations: 7,
        };
        assert!(format!("{err}").contains("7 iterations"));
    }

    #[test]
    fn order_exceeded_reports_both_weights() {
        let err = DaError::OrderExceeded {
            requested: 5,
            order: 3,
        };
        let message = format!("{err}");
        assert!(message.contains('5') && message.contains('3'));
    }
}
