//! Jet environments: the shared descriptor every interoperating jet points at.
//!
//! An environment fixes the number of variables, the truncation order and the
//! reference point (the expansion point). It is opened with an
//! [`EnvironmentBuilder`], which declares the phase-space coordinates first and
//! any parameters after them, and closed with [`EnvironmentBuilder::build`],
//! which hands back an immutable `Arc<Environment<T>>`. Two jets may be combined
//! only when they hold the *same* `Arc` (pointer identity, not equal fields).

use log::debug;
use num_complex::Complex;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{DaError, Result};
use crate::jet::Jet;
use crate::term::{Monomial, Term};
use crate::traits::Coefficient;

pub struct Environment<T: Coefficient> {
    order: u32,
    space_dim: usize,
    reference: Vec<T>,
    scale: Vec<f64>,
    // Complex companion of a real environment, built on first request.
    complex: OnceLock<Arc<Environment<Complex<f64>>>>,
}

/// Scoped construction of an [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder<T: Coefficient> {
    order: u32,
    coordinates: Vec<T>,
    parameters: Vec<T>,
    scale: Vec<(usize, f64)>,
}

impl<T: Coefficient> EnvironmentBuilder<T> {
    pub fn new(order: u32) -> Self {
        Self {
            order,
            coordinates: Vec::new(),
            parameters: Vec::new(),
            scale: Vec::new(),
        }
    }

    /// Declares a phase-space coordinate expanded about `reference` and returns
    /// its variable index. Coordinates must precede parameters.
    pub fn coordinate(&mut self, reference: T) -> Result<usize> {
        if !self.parameters.is_empty() {
            return Err(DaError::InvalidEnvironment(
                "coordinates must be declared before parameters".to_string(),
            ));
        }
        self.coordinates.push(reference);
        Ok(self.coordinates.len() - 1)
    }

    /// Declares a parameter with nominal value `value` and returns its variable index.
    pub fn parameter(&mut self, value: T) -> usize {
        self.parameters.push(value);
        self.coordinates.len() + self.parameters.len() - 1
    }

    /// Sets the scale factor of one variable. Validated by [`Self::build`].
    pub fn scale(&mut self, index: usize, factor: f64) -> &mut Self {
        self.scale.push((index, factor));
        self
    }

    pub fn num_vars(&self) -> usize {
        self.coordinates.len() + self.parameters.len()
    }

    /// Closes the scope and produces the shared environment handle.
    pub fn build(self) -> Result<Arc<Environment<T>>> {
        let num_vars = self.num_vars();
        if num_vars == 0 {
            return Err(DaError::InvalidEnvironment(
                "an environment needs at least one variable".to_string(),
            ));
        }

        let mut scale = vec![1.0; num_vars];
        for (index, factor) in self.scale {
            if index >= num_vars {
                return Err(DaError::InvalidEnvironment(format!(
                    "scale factor given for variable {index}, but only {num_vars} were declared"
                )));
            }
            if !(factor.is_finite() && factor > 0.0) {
                return Err(DaError::InvalidEnvironment(format!(
                    "scale factor {factor} for variable {index} must be positive"
                )));
            }
            scale[index] = factor;
        }

        let space_dim = self.coordinates.len();
        let mut reference = self.coordinates;
        reference.extend(self.parameters);

        let env = Environment {
            order: self.order,
            space_dim,
            reference,
            scale,
            complex: OnceLock::new(),
        };
        debug!(
            "Built jet environment: order {}, {} coordinates, {} parameters",
            env.order,
            env.space_dim,
            num_vars - space_dim
        );
        Ok(Arc::new(env))
    }
}

impl<T: Coefficient> Environment<T> {
    /// Environment whose variables are all coordinates, expanded about `reference`.
    pub fn with_reference(order: u32, reference: &[T]) -> Result<Arc<Self>> {
        let mut builder = EnvironmentBuilder::new(order);
        for &value in reference {
            builder.coordinate(value)?;
        }
        builder.build()
    }

    /// Environment of `num_vars` coordinates expanded about the origin.
    pub fn at_origin(order: u32, num_vars: usize) -> Result<Arc<Self>> {
        Self::with_reference(order, &vec![T::zero(); num_vars])
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn num_vars(&self) -> usize {
        self.reference.len()
    }

    /// Number of phase-space coordinates; the remaining variables are parameters.
    pub fn space_dim(&self) -> usize {
        self.space_dim
    }

    pub fn num_parameters(&self) -> usize {
        self.reference.len() - self.space_dim
    }

    pub fn reference(&self) -> &[T] {
        &self.reference
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    /// Number of monomials of weight at most `order`: C(num_vars + order, order).
    /// Saturates at `usize::MAX`.
    pub fn max_terms(&self) -> usize {
        let n = self.num_vars() as u128;
        let mut count: u128 = 1;
        for k in 1..=u128::from(self.order) {
            // count * (n + k) is divisible by k at every step
            let Some(next) = count.checked_mul(n + k) else {
                return usize::MAX;
            };
            count = next / k;
        }
        usize::try_from(count).unwrap_or(usize::MAX)
    }

    /// An environment with the same order, coordinate/parameter split and scale
    /// factors, expanded about `reference` instead.
    pub fn expanded_about(&self, reference: &[T]) -> Result<Arc<Self>> {
        self.check_len(reference.len(), "reference point")?;
        let mut builder = EnvironmentBuilder::new(self.order);
        let (coordinates, parameters) = reference.split_at(self.space_dim);
        for &value in coordinates {
            builder.coordinate(value)?;
        }
        for &value in parameters {
            builder.parameter(value);
        }
        for (index, &factor) in self.scale.iter().enumerate() {
            builder.scale(index, factor);
        }
        builder.build()
    }

    /// Size of `exponents` in units of the variable scales: `Π scale_i^e_i`.
    pub fn scaled_size(&self, exponents: &[u32]) -> f64 {
        exponents
            .iter()
            .zip(&self.scale)
            .map(|(&e, &s)| s.powi(e as i32))
            .product()
    }

    pub fn ensure_same(self: &Arc<Self>, other: &Arc<Self>) -> Result<()> {
        if Arc::ptr_eq(self, other) {
            Ok(())
        } else {
            Err(DaError::EnvironmentMismatch)
        }
    }

    pub(crate) fn check_index(&self, index: usize) -> Result<()> {
        if index < self.num_vars() {
            Ok(())
        } else {
            Err(DaError::InvalidVariable(format!(
                "index {index} out of range for {} variables",
                self.num_vars()
            )))
        }
    }

    pub(crate) fn check_len(&self, len: usize, what: &str) -> Result<()> {
        if len == self.num_vars() {
            Ok(())
        } else {
            Err(DaError::InvalidVariable(format!(
                "{what} has {len} entries, environment has {} variables",
                self.num_vars()
            )))
        }
    }

    /// Generator jet of variable `index`: `reference[index] + dx_index`.
    pub fn variable(self: &Arc<Self>, index: usize) -> Result<Jet<T>> {
        self.check_index(index)?;
        let n = self.num_vars();
        let mut terms = Vec::with_capacity(2);
        let value = self.reference[index];
        if !value.is_zero() {
            terms.push(Term::from_monomial(Monomial::one(n), value));
        }
        if self.order >= 1 {
            terms.push(Term::from_monomial(Monomial::unit(n, index), T::one()));
        }
        Ok(Jet::from_sorted(self.clone(), terms))
    }

    /// Generator of a phase-space coordinate.
    pub fn coordinate(self: &Arc<Self>, index: usize) -> Result<Jet<T>> {
        if index >= self.space_dim {
            return Err(DaError::InvalidVariable(format!(
                "coordinate {index} out of range for {} coordinates",
                self.space_dim
            )));
        }
        self.variable(index)
    }

    /// Generator of the `index`-th parameter (counted from zero after the coordinates).
    pub fn parameter(self: &Arc<Self>, index: usize) -> Result<Jet<T>> {
        self.variable(self.space_dim + index)
    }

    /// All generators, coordinates first.
    pub fn variables(self: &Arc<Self>) -> Vec<Jet<T>> {
        (0..self.num_vars())
            .filter_map(|i| self.variable(i).ok())
            .collect()
    }

    /// Generators of the phase-space coordinates only.
    pub fn coordinates(self: &Arc<Self>) -> Vec<Jet<T>> {
        (0..self.space_dim)
            .filter_map(|i| self.variable(i).ok())
            .collect()
    }

    pub fn constant(self: &Arc<Self>, value: T) -> Jet<T> {
        Jet::constant(self, value)
    }

    pub fn zero(self: &Arc<Self>) -> Jet<T> {
        Jet::constant(self, T::zero())
    }

    pub fn one(self: &Arc<Self>) -> Jet<T> {
        Jet::constant(self, T::one())
    }

    /// Single-term jet `coefficient * dx^exponents`.
    pub fn monomial(self: &Arc<Self>, exponents: &[u32], coefficient: T) -> Result<Jet<T>> {
        Jet::from_terms(self, [Term::new(exponents, coefficient)])
    }
}

impl Environment<f64> {
    /// The complex companion of this environment. Built once and cached, so
    /// every complexified jet of one real environment shares a single handle.
    pub fn complexified(&self) -> Arc<Environment<Complex<f64>>> {
        self.complex
            .get_or_init(|| {
                debug!("Deriving complex companion of an order {} environment", self.order);
                Arc::new(Environment {
                    order: self.order,
                    space_dim: self.space_dim,
                    reference: self
                        .reference
                        .iter()
                        .map(|&r| Complex::new(r, 0.0))
                        .collect(),
                    scale: self.scale.clone(),
                    complex: OnceLock::new(),
                })
            })
            .clone()
    }
}

impl<T: Coefficient> fmt::Debug for Environment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("order", &self.order)
            .field("space_dim", &self.space_dim)
            .field("reference", &self.reference)
            .field("scale", &self.scale)
            .finish()
    }
}

impl<T: Coefficient> fmt::Display for Environment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Environment(order = {}, coordinates = {}, parameters = {}, reference = [",
            self.order,
            self.space_dim,
            self.num_parameters()
        )?;
        for (i, value) in self.reference.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "])")
    }
}
