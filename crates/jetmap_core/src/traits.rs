use nalgebra::ComplexField;
use std::fmt::{Debug, Display};

/// A trait for types that can be used as jet coefficients.
/// Real (`f64`) and complex (`Complex<f64>`) coefficients run through the same
/// algorithms; magnitudes and tolerances are always measured in `f64`.
pub trait Coefficient: ComplexField<RealField = f64> + Copy + Debug + Display + 'static {}

impl<T: ComplexField<RealField = f64> + Copy + Debug + Display + 'static> Coefficient for T {}

/// Lifts a real constant (a factorial, a series index, ...) into the coefficient type.
#[inline]
pub(crate) fn real<T: Coefficient>(value: f64) -> T {
    T::from_real(value)
}
