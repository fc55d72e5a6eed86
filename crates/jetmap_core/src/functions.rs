//! Division and elementary functions of jets.
//!
//! Every function is computed weight by weight from the homogeneous parts
//! `x_0, x_1, ..., x_N` of its argument. The Euler operator `E = Σ x_i ∂_i`
//! multiplies a part of weight `k` by `k` and is a derivation, so a relation
//! such as `E exp(u) = exp(u) E u` turns into a recurrence that gives the
//! weight-`k` part of the result from lower parts only. Each product in a
//! recurrence is between parts whose weights add up to `k <= N`, so nothing
//! is ever lost to truncation before the end. `N` is the argument's accuracy,
//! which the result inherits.

use log::trace;
use std::collections::BTreeMap;
use std::f64::consts::{FRAC_2_SQRT_PI, LN_10};
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{DaError, Result};
use crate::jet::{accumulate_product, Jet};
use crate::term::Monomial;
use crate::traits::{real, Coefficient};

// Σ_{j in range} factor(j) · a_j · b_{k-j}
fn graded_sum<T, F>(
    env: &Arc<Environment<T>>,
    k: usize,
    a: &[Jet<T>],
    b: &[Jet<T>],
    range: RangeInclusive<usize>,
    factor: F,
) -> Jet<T>
where
    T: Coefficient,
    F: Fn(usize) -> T,
{
    let mut acc: BTreeMap<Monomial, T> = BTreeMap::new();
    for j in range {
        let f = factor(j);
        if !f.is_zero() {
            accumulate_product(&mut acc, &a[j], &b[k - j], f, env.order());
        }
    }
    Jet::from_accumulator(env.clone(), acc)
}

// Concatenating homogeneous parts in weight order yields canonical order.
// Parts `0..len` are exact, so the result is accurate to `len - 1`.
fn assemble<T: Coefficient>(env: &Arc<Environment<T>>, parts: &[Jet<T>]) -> Jet<T> {
    let terms = parts
        .iter()
        .flat_map(|part| part.term_slice().iter().cloned())
        .collect();
    let accuracy = u32::try_from(parts.len().saturating_sub(1)).unwrap_or(u32::MAX);
    Jet::from_sorted(env.clone(), terms).limited_to(accuracy)
}

fn scalar<T: Coefficient>(k: usize) -> T {
    real(k as f64)
}

// Maclaurin series 2/√π Σ (-1)^n a^(2n+1) / (n! (2n+1)) at a single point.
fn erf_value<T: Coefficient>(a: T) -> Result<T> {
    const MAX_TERMS: usize = 500;
    let minus_square = -(a * a);
    let mut power = a;
    let mut sum = a;
    for n in 1..MAX_TERMS {
        power = power * minus_square / scalar(n);
        let term = power / scalar(2 * n + 1);
        sum += term;
        if term.modulus() <= f64::EPSILON * sum.modulus() {
            return Ok(sum * real(FRAC_2_SQRT_PI));
        }
    }
    Err(DaError::NonConvergence {
        operation: "erf",
        iterations: MAX_TERMS,
    })
}

impl<T: Coefficient> Jet<T> {
    fn graded(&self) -> Result<(Arc<Environment<T>>, Vec<Jet<T>>)> {
        let env = self.env()?.clone();
        let parts = self.graded_to(self.accuracy())?;
        Ok((env, parts))
    }

    // Homogeneous parts of weight 0..=accuracy.
    fn graded_to(&self, accuracy: u32) -> Result<Vec<Jet<T>>> {
        let mut parts = self.homogeneous_parts()?;
        parts.truncate(accuracy as usize + 1);
        Ok(parts)
    }

    /// Solves `k y_k = Σ_{j=1..k} j x_j r_{k-j}` for `y = ∫ r dx`, the shape
    /// shared by every function whose derivative is a jet `r` of the argument.
    fn integrate_against(&self, r: &Jet<T>, y0: T) -> Result<Jet<T>> {
        let (env, x) = self.graded()?;
        let r = r.graded_to(r.accuracy())?;
        // y_k needs r up to weight k - 1
        let len = x.len().min(r.len() + 1);
        let mut y = Vec::with_capacity(len);
        y.push(Jet::constant(&env, y0));
        for k in 1..len {
            let sum = graded_sum(&env, k, &x, &r, 1..=k, scalar);
            y.push(sum.mul_scalar(real(1.0 / k as f64))?);
        }
        Ok(assemble(&env, &y))
    }

    /// Quotient `self / other`. The constant term of `other` must not vanish.
    pub fn checked_div(&self, other: &Self) -> Result<Self> {
        let env = self.shared_env(other)?.clone();
        let u0 = other.standard_part();
        if u0.is_zero() {
            return Err(DaError::DivisionByZeroConstant {
                operation: "division",
            });
        }
        let accuracy = self.accuracy().min(other.accuracy());
        if let [only] = other.term_slice() {
            if only.is_constant() {
                return Ok(self.div_scalar(u0)?.limited_to(accuracy));
            }
        }
        let w = self.graded_to(accuracy)?;
        let u = other.graded_to(accuracy)?;
        let inv = T::one() / u0;
        let mut q = Vec::with_capacity(w.len());
        q.push(w[0].mul_scalar(inv)?);
        for k in 1..w.len() {
            let sum = graded_sum(&env, k, &u, &q, 1..=k, |_| T::one());
            q.push(w[k].checked_sub(&sum)?.mul_scalar(inv)?);
        }
        Ok(assemble(&env, &q))
    }

    pub fn recip(&self) -> Result<Self> {
        let env = self.env()?;
        env.one().checked_div(self)
    }

    pub fn exp(&self) -> Result<Self> {
        let (env, x) = self.graded()?;
        let mut y = Vec::with_capacity(x.len());
        y.push(Jet::constant(&env, x[0].standard_part().exp()));
        for k in 1..x.len() {
            let sum = graded_sum(&env, k, &x, &y, 1..=k, scalar);
            y.push(sum.mul_scalar(real(1.0 / k as f64))?);
        }
        Ok(assemble(&env, &y))
    }

    /// Natural logarithm.
    pub fn ln(&self) -> Result<Self> {
        let (env, x) = self.graded()?;
        let a = x[0].standard_part();
        if a.is_zero() {
            return Err(DaError::DivisionByZeroConstant { operation: "log" });
        }
        let inv = T::one() / a;
        let mut y = Vec::with_capacity(x.len());
        y.push(Jet::constant(&env, a.ln()));
        for k in 1..x.len() {
            // k a y_k = k x_k - Σ_{j=1..k-1} j y_j x_{k-j}
            let sum = graded_sum(&env, k, &y, &x, 1..=k - 1, scalar)
                .mul_scalar(real(1.0 / k as f64))?;
            y.push(x[k].checked_sub(&sum)?.mul_scalar(inv)?);
        }
        Ok(assemble(&env, &y))
    }

    pub fn log10(&self) -> Result<Self> {
        self.ln()?.mul_scalar(real(1.0 / LN_10))
    }

    pub fn sqrt(&self) -> Result<Self> {
        let (env, x) = self.graded()?;
        let a = x[0].standard_part();
        if a.is_zero() {
            return Err(DaError::DivisionByZeroConstant { operation: "sqrt" });
        }
        let y0 = a.sqrt();
        let inv = T::one() / (y0 + y0);
        let mut y = Vec::with_capacity(x.len());
        y.push(Jet::constant(&env, y0));
        for k in 1..x.len() {
            let sum = graded_sum(&env, k, &y, &y, 1..=k - 1, |_| T::one());
            y.push(x[k].checked_sub(&sum)?.mul_scalar(inv)?);
        }
        Ok(assemble(&env, &y))
    }

    /// Integer power by repeated squaring. Negative powers go through `recip`,
    /// so they need a non-zero constant term; non-negative ones never do.
    pub fn powi(&self, n: i32) -> Result<Self> {
        let env = self.env()?;
        let mut base = if n < 0 { self.recip()? } else { self.clone() };
        let mut result = env.one().limited_to(self.accuracy());
        let mut e = n.unsigned_abs();
        while e > 0 {
            if e & 1 == 1 {
                result = result.checked_mul(&base)?;
            }
            e >>= 1;
            if e > 0 {
                base = base.checked_mul(&base)?;
            }
        }
        Ok(result)
    }

    /// Real power. Integral exponents are dispatched to [`Self::powi`].
    pub fn powf(&self, s: f64) -> Result<Self> {
        if s.fract() == 0.0 && s.abs() <= f64::from(i32::MAX) {
            return self.powi(s as i32);
        }
        let (env, x) = self.graded()?;
        let a = x[0].standard_part();
        if a.is_zero() {
            return Err(DaError::DivisionByZeroConstant { operation: "pow" });
        }
        let inv = T::one() / a;
        let mut y = Vec::with_capacity(x.len());
        y.push(Jet::constant(&env, a.powf(s)));
        for k in 1..x.len() {
            // a k y_k = Σ_{i=1..k} (s i - (k - i)) x_i y_{k-i}
            let sum = graded_sum(&env, k, &x, &y, 1..=k, |i| {
                real(s * i as f64 - (k - i) as f64)
            });
            y.push(sum.mul_scalar(inv * real(1.0 / k as f64))?);
        }
        Ok(assemble(&env, &y))
    }

    /// Sine and cosine together; `hyperbolic` flips the sign that couples them.
    fn sin_cos_pair(&self, hyperbolic: bool) -> Result<(Self, Self)> {
        let (env, x) = self.graded()?;
        let a = x[0].standard_part();
        let (s0, c0) = if hyperbolic {
            (a.sinh(), a.cosh())
        } else {
            (a.sin(), a.cos())
        };
        let sign = if hyperbolic { 1.0 } else { -1.0 };
        let mut s = Vec::with_capacity(x.len());
        let mut c = Vec::with_capacity(x.len());
        s.push(Jet::constant(&env, s0));
        c.push(Jet::constant(&env, c0));
        for k in 1..x.len() {
            let inv_k = real(1.0 / k as f64);
            let next_s = graded_sum(&env, k, &x, &c, 1..=k, scalar).mul_scalar(inv_k)?;
            let next_c = graded_sum(&env, k, &x, &s, 1..=k, scalar)
                .mul_scalar(inv_k * real(sign))?;
            s.push(next_s);
            c.push(next_c);
        }
        trace!("sin/cos recurrence ran to weight {}", x.len() - 1);
        Ok((assemble(&env, &s), assemble(&env, &c)))
    }

    pub fn sin_cos(&self) -> Result<(Self, Self)> {
        self.sin_cos_pair(false)
    }

    pub fn sin(&self) -> Result<Self> {
        Ok(self.sin_cos_pair(false)?.0)
    }

    pub fn cos(&self) -> Result<Self> {
        Ok(self.sin_cos_pair(false)?.1)
    }

    pub fn tan(&self) -> Result<Self> {
        let (s, c) = self.sin_cos_pair(false)?;
        s.checked_div(&c)
    }

    pub fn sinh(&self) -> Result<Self> {
        Ok(self.sin_cos_pair(true)?.0)
    }

    pub fn cosh(&self) -> Result<Self> {
        Ok(self.sin_cos_pair(true)?.1)
    }

    pub fn tanh(&self) -> Result<Self> {
        let (s, c) = self.sin_cos_pair(true)?;
        s.checked_div(&c)
    }

    pub fn atan(&self) -> Result<Self> {
        let r = self.checked_mul(self)?.add_scalar(T::one())?.recip()?;
        self.integrate_against(&r, self.standard_part().atan())
    }

    pub fn asin(&self) -> Result<Self> {
        let r = self.checked_mul(self)?.checked_neg()?.add_scalar(T::one())?.powf(-0.5)?;
        self.integrate_against(&r, self.standard_part().asin())
    }

    pub fn acos(&self) -> Result<Self> {
        let a = self.standard_part();
        let mut y = self.asin()?.checked_neg()?;
        y.set_standard_part(a.acos())?;
        Ok(y)
    }

    /// Error function, integrated from `erf'(u) = 2/√π exp(-u²)`.
    pub fn erf(&self) -> Result<Self> {
        let r = self
            .checked_mul(self)?
            .checked_neg()?
            .exp()?
            .mul_scalar(real(FRAC_2_SQRT_PI))?;
        self.integrate_against(&r, erf_value(self.standard_part())?)
    }

    /// Complementary error function `1 - erf`.
    pub fn erfc(&self) -> Result<Self> {
        self.erf()?.checked_neg()?.add_scalar(T::one())
    }
}
