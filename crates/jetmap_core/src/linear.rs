//! First-order jets: a value and a dense gradient.
//!
//! `LinearJet` carries the same arithmetic contract as [`Jet`] restricted to
//! weight one, without any term bookkeeping. It is the cheap choice when only
//! value and jacobian are needed, e.g. for linear stability work.

use nalgebra::DMatrix;
use std::ops::{Add, Div, Index, Mul, Neg, Sub};
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{DaError, Result};
use crate::jet::Jet;
use crate::mapping::Mapping;
use crate::term::{Monomial, Term};
use crate::traits::{real, Coefficient};

#[derive(Debug, Clone)]
pub struct LinearJet<T: Coefficient> {
    env: Option<Arc<Environment<T>>>,
    value: T,
    gradient: Vec<T>,
}

impl<T: Coefficient> Default for LinearJet<T> {
    fn default() -> Self {
        Self {
            env: None,
            value: T::zero(),
            gradient: Vec::new(),
        }
    }
}

impl<T: Coefficient> LinearJet<T> {
    pub fn new(env: &Arc<Environment<T>>, value: T, gradient: Vec<T>) -> Result<Self> {
        env.check_len(gradient.len(), "gradient")?;
        Ok(Self {
            env: Some(env.clone()),
            value,
            gradient,
        })
    }

    pub fn constant(env: &Arc<Environment<T>>, value: T) -> Self {
        Self {
            env: Some(env.clone()),
            value,
            gradient: vec![T::zero(); env.num_vars()],
        }
    }

    /// Generator of variable `index`.
    pub fn variable(env: &Arc<Environment<T>>, index: usize) -> Result<Self> {
        env.check_index(index)?;
        let mut out = Self::constant(env, env.reference()[index]);
        out.gradient[index] = T::one();
        Ok(out)
    }

    /// Keeps the weight 0 and weight 1 terms of `jet`.
    pub fn from_jet(jet: &Jet<T>) -> Result<Self> {
        let env = jet.env()?;
        Ok(Self {
            env: Some(env.clone()),
            value: jet.standard_part(),
            gradient: jet.linear_part(),
        })
    }

    pub fn to_jet(&self) -> Result<Jet<T>> {
        let env = self.env()?;
        let n = env.num_vars();
        let mut terms = vec![Term::from_monomial(Monomial::one(n), self.value)];
        let slope = self.gradient.iter().any(|g| !g.is_zero());
        if slope && env.order() == 0 {
            return Err(DaError::OrderExceeded {
                requested: 1,
                order: 0,
            });
        }
        terms.extend(
            self.gradient
                .iter()
                .enumerate()
                .map(|(i, &g)| Term::from_monomial(Monomial::unit(n, i), g)),
        );
        Jet::from_terms(env, terms)
    }

    pub fn env(&self) -> Result<&Arc<Environment<T>>> {
        self.env.as_ref().ok_or(DaError::UninitializedJet)
    }

    pub fn is_void(&self) -> bool {
        self.env.is_none()
    }

    pub fn value(&self) -> T {
        self.value
    }

    pub fn gradient(&self) -> &[T] {
        &self.gradient
    }

    fn shared_env(&self, other: &Self) -> Result<&Arc<Environment<T>>> {
        let env = self.env()?;
        env.ensure_same(other.env()?)?;
        Ok(env)
    }

    fn zip_with<F>(&self, other: &Self, value: T, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T,
    {
        let env = self.shared_env(other)?;
        Ok(Self {
            env: Some(env.clone()),
            value,
            gradient: self
                .gradient
                .iter()
                .zip(&other.gradient)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    // f(u) with f'(u) = slope
    fn chain(&self, value: T, slope: T) -> Result<Self> {
        let env = self.env()?;
        Ok(Self {
            env: Some(env.clone()),
            value,
            gradient: self.gradient.iter().map(|&g| g * slope).collect(),
        })
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, self.value + other.value, |a, b| a + b)
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, self.value - other.value, |a, b| a - b)
    }

    pub fn checked_mul(&self, other: &Self) -> Result<Self> {
        let (u, v) = (self.value, other.value);
        self.zip_with(other, u * v, |a, b| a * v + u * b)
    }

    pub fn checked_div(&self, other: &Self) -> Result<Self> {
        let v = other.value;
        if v.is_zero() {
            return Err(DaError::DivisionByZeroConstant {
                operation: "division",
            });
        }
        let q = self.value / v;
        self.zip_with(other, q, |a, b| (a - q * b) / v)
    }

    pub fn checked_neg(&self) -> Result<Self> {
        self.chain(-self.value, -T::one())
    }

    pub fn add_scalar(&self, c: T) -> Result<Self> {
        self.chain(self.value + c, T::one())
    }

    pub fn mul_scalar(&self, c: T) -> Result<Self> {
        self.chain(self.value * c, c)
    }

    pub fn exp(&self) -> Result<Self> {
        let e = self.value.exp();
        self.chain(e, e)
    }

    pub fn ln(&self) -> Result<Self> {
        if self.value.is_zero() {
            return Err(DaError::DivisionByZeroConstant { operation: "log" });
        }
        self.chain(self.value.ln(), T::one() / self.value)
    }

    pub fn sin(&self) -> Result<Self> {
        self.chain(self.value.sin(), self.value.cos())
    }

    pub fn cos(&self) -> Result<Self> {
        self.chain(self.value.cos(), -self.value.sin())
    }

    pub fn sqrt(&self) -> Result<Self> {
        if self.value.is_zero() {
            return Err(DaError::DivisionByZeroConstant { operation: "sqrt" });
        }
        let root = self.value.sqrt();
        self.chain(root, T::one() / (root + root))
    }

    pub fn powf(&self, s: f64) -> Result<Self> {
        if self.value.is_zero() && s < 1.0 && s != 0.0 {
            return Err(DaError::DivisionByZeroConstant { operation: "pow" });
        }
        let slope = if s == 0.0 {
            T::zero()
        } else {
            real::<T>(s) * self.value.powf(s - 1.0)
        };
        self.chain(self.value.powf(s), slope)
    }

    pub fn atan(&self) -> Result<Self> {
        let v = self.value;
        self.chain(v.atan(), T::one() / (T::one() + v * v))
    }

    /// Value of the affine form at `point`.
    pub fn evaluate(&self, point: &[T]) -> Result<T> {
        let env = self.env()?;
        env.check_len(point.len(), "evaluation point")?;
        Ok(self
            .gradient
            .iter()
            .zip(point.iter().zip(env.reference()))
            .fold(self.value, |acc, (&g, (&p, &r))| acc + g * (p - r)))
    }

    /// Chain rule: substitutes `substitutes[i]` for variable `i`.
    pub fn compose(&self, substitutes: &[LinearJet<T>]) -> Result<LinearJet<T>> {
        let env = self.env()?;
        env.check_len(substitutes.len(), "substitution")?;
        let target = substitutes[0].env()?.clone();
        let mut value = self.value;
        let mut gradient = vec![T::zero(); target.num_vars()];
        for ((&g, s), &r) in self.gradient.iter().zip(substitutes).zip(env.reference()) {
            target.ensure_same(s.env()?)?;
            value += g * (s.value - r);
            for (out, &ds) in gradient.iter_mut().zip(&s.gradient) {
                *out += g * ds;
            }
        }
        Ok(LinearJet {
            env: Some(target),
            value,
            gradient,
        })
    }
}

fn expect_op<U>(result: Result<U>, operation: &str) -> U {
    match result {
        Ok(value) => value,
        Err(err) => panic!("linear jet {operation} failed: {err}"),
    }
}

macro_rules! linear_binop {
    ($trait:ident, $method:ident, $checked:ident, $name:literal) => {
        impl<'a, 'b, T: Coefficient> $trait<&'b LinearJet<T>> for &'a LinearJet<T> {
            type Output = LinearJet<T>;
            fn $method(self, rhs: &'b LinearJet<T>) -> LinearJet<T> {
                expect_op(self.$checked(rhs), $name)
            }
        }

        impl<T: Coefficient> $trait<LinearJet<T>> for LinearJet<T> {
            type Output = LinearJet<T>;
            fn $method(self, rhs: LinearJet<T>) -> LinearJet<T> {
                expect_op(self.$checked(&rhs), $name)
            }
        }
    };
}

linear_binop!(Add, add, checked_add, "addition");
linear_binop!(Sub, sub, checked_sub, "subtraction");
linear_binop!(Mul, mul, checked_mul, "multiplication");
linear_binop!(Div, div, checked_div, "division");

impl<T: Coefficient> Neg for &LinearJet<T> {
    type Output = LinearJet<T>;
    fn neg(self) -> LinearJet<T> {
        expect_op(self.checked_neg(), "negation")
    }
}

impl<T: Coefficient> Neg for LinearJet<T> {
    type Output = LinearJet<T>;
    fn neg(self) -> LinearJet<T> {
        -&self
    }
}

/// A vector of first-order jets sharing one environment.
#[derive(Debug, Clone)]
pub struct LinearMapping<T: Coefficient> {
    env: Arc<Environment<T>>,
    components: Vec<LinearJet<T>>,
}

impl<T: Coefficient> LinearMapping<T> {
    pub fn new(env: &Arc<Environment<T>>, components: Vec<LinearJet<T>>) -> Result<Self> {
        for component in &components {
            env.ensure_same(component.env()?)?;
        }
        Ok(Self {
            env: env.clone(),
            components,
        })
    }

    pub fn identity(env: &Arc<Environment<T>>) -> Result<Self> {
        let components = (0..env.num_vars())
            .map(|i| LinearJet::variable(env, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: env.clone(),
            components,
        })
    }

    pub fn from_mapping(mapping: &Mapping<T>) -> Result<Self> {
        let components = mapping
            .iter()
            .map(LinearJet::from_jet)
            .collect::<Result<Vec<_>>>()?;
        Self::new(mapping.env(), components)
    }

    pub fn to_mapping(&self) -> Result<Mapping<T>> {
        let components = self
            .components
            .iter()
            .map(LinearJet::to_jet)
            .collect::<Result<Vec<_>>>()?;
        Mapping::new(&self.env, components)
    }

    pub fn env(&self) -> &Arc<Environment<T>> {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LinearJet<T>> {
        self.components.iter()
    }

    pub fn values(&self) -> Vec<T> {
        self.components.iter().map(LinearJet::value).collect()
    }

    pub fn jacobian(&self) -> DMatrix<T> {
        let n = self.env.num_vars();
        DMatrix::from_fn(self.components.len(), n, |r, c| self.components[r].gradient[c])
    }

    pub fn compose(&self, inner: &LinearMapping<T>) -> Result<LinearMapping<T>> {
        let components = self
            .components
            .iter()
            .map(|c| c.compose(&inner.components))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: inner.env.clone(),
            components,
        })
    }

    /// Inverse affine map: `g(y) = x0 + M⁻¹ (y - f(x0))`, expanded about `x0`.
    pub fn inverse(&self) -> Result<LinearMapping<T>> {
        let n = self.env.num_vars();
        self.env.check_len(self.components.len(), "mapping")?;
        let inverse = self
            .jacobian()
            .try_inverse()
            .ok_or(DaError::SingularJacobian)?;
        let reference = self.env.reference();
        let shift: Vec<T> = reference
            .iter()
            .zip(&self.values())
            .map(|(&r, &v)| r - v)
            .collect();
        let components = (0..n)
            .map(|i| {
                let offset = (0..n).fold(T::zero(), |acc, j| acc + inverse[(i, j)] * shift[j]);
                LinearJet {
                    env: Some(self.env.clone()),
                    value: reference[i] + offset,
                    gradient: (0..n).map(|j| inverse[(i, j)]).collect(),
                }
            })
            .collect();
        Ok(Self {
            env: self.env.clone(),
            components,
        })
    }
}

impl<T: Coefficient> Index<usize> for LinearMapping<T> {
    type Output = LinearJet<T>;

    fn index(&self, index: usize) -> &LinearJet<T> {
        &self.components[index]
    }
}
