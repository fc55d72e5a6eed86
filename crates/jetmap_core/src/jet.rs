//! The jet: a truncated multivariate Taylor series bound to one environment.
//!
//! A jet stores the non-zero terms of its polynomial in canonical order
//! (see [`crate::term`]) behind an `Arc`, so copies share storage and any
//! in-place change clones first. A jet represents
//! `f(x) = Σ c_a (x - x0)^a` where `x0` is the environment's reference point.
//!
//! Truncation rule: a product of two terms whose combined weight exceeds the
//! environment order is discarded. Every product, composition, inverse and
//! function evaluation goes through this rule.
//!
//! Each jet also records its accuracy, the highest weight whose coefficients
//! are known exactly. It starts at the order and drops with differentiation,
//! since `∂f` of weight `N` would need terms of `f` above `N`. Results of
//! arithmetic carry the accuracy of their least accurate operand. Sums keep
//! the heavier terms of the more accurate operand; products, functions and
//! compositions are truncated at the accuracy, so untrusted terms never leak
//! into trusted weights.

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{DaError, Result};
use crate::term::{Monomial, Term};
use crate::traits::{real, Coefficient};

#[derive(Clone)]
pub struct Jet<T: Coefficient> {
    env: Option<Arc<Environment<T>>>,
    terms: Arc<Vec<Term<T>>>,
    accuracy: u32,
}

/// Plain-data dump of a jet, for debugging and inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JetSnapshot<T> {
    pub order: u32,
    pub accuracy: u32,
    pub num_vars: usize,
    pub terms: Vec<(Vec<u32>, T)>,
}

impl<T: Coefficient> Default for Jet<T> {
    /// The void jet. Any arithmetic on it fails with `UninitializedJet`.
    fn default() -> Self {
        Self {
            env: None,
            terms: Arc::new(Vec::new()),
            accuracy: 0,
        }
    }
}

impl<T: Coefficient> Jet<T> {
    // Caller guarantees canonical order, no duplicates, no zeros, weights <= order.
    pub(crate) fn from_sorted(env: Arc<Environment<T>>, terms: Vec<Term<T>>) -> Self {
        let accuracy = env.order();
        Self {
            env: Some(env),
            terms: Arc::new(terms),
            accuracy,
        }
    }

    /// Caps the accuracy at `accuracy` and drops every term above the result.
    pub(crate) fn limited_to(mut self, accuracy: u32) -> Self {
        self.accuracy = self.accuracy.min(accuracy);
        if self.weight() > self.accuracy {
            let accuracy = self.accuracy;
            Arc::make_mut(&mut self.terms).retain(|t| t.weight() <= accuracy);
        }
        self
    }

    // Same terms, with the accuracy of `source`.
    fn trusted_as(mut self, source: &Self) -> Self {
        self.accuracy = self.accuracy.min(source.accuracy);
        self
    }

    // Same coefficients, read as deviations from `env`'s reference point.
    // `env` must have as many variables as the current environment.
    pub(crate) fn moved_to(&self, env: &Arc<Environment<T>>) -> Self {
        Self {
            env: Some(env.clone()),
            terms: self.terms.clone(),
            accuracy: self.accuracy.min(env.order()),
        }
    }

    pub(crate) fn from_accumulator(env: Arc<Environment<T>>, acc: BTreeMap<Monomial, T>) -> Self {
        let terms = acc
            .into_iter()
            .filter(|(_, c)| !c.is_zero())
            .map(|(m, c)| Term::from_monomial(m, c))
            .collect();
        Self::from_sorted(env, terms)
    }

    pub fn constant(env: &Arc<Environment<T>>, value: T) -> Self {
        let terms = if value.is_zero() {
            Vec::new()
        } else {
            vec![Term::from_monomial(Monomial::one(env.num_vars()), value)]
        };
        Self::from_sorted(env.clone(), terms)
    }

    /// Builds a jet from arbitrary terms: duplicates are summed, zeros dropped.
    pub fn from_terms<I>(env: &Arc<Environment<T>>, terms: I) -> Result<Self>
    where
        I: IntoIterator<Item = Term<T>>,
    {
        let mut acc = BTreeMap::new();
        for term in terms {
            env.check_len(term.exponents().len(), "term multi-index")?;
            if term.weight() > env.order() {
                return Err(DaError::OrderExceeded {
                    requested: term.weight(),
                    order: env.order(),
                });
            }
            let coefficient = term.coefficient();
            *acc.entry(term.monomial().clone()).or_insert_with(T::zero) += coefficient;
        }
        Ok(Self::from_accumulator(env.clone(), acc))
    }

    pub fn is_void(&self) -> bool {
        self.env.is_none()
    }

    pub fn environment(&self) -> Option<&Arc<Environment<T>>> {
        self.env.as_ref()
    }

    pub fn env(&self) -> Result<&Arc<Environment<T>>> {
        self.env.as_ref().ok_or(DaError::UninitializedJet)
    }

    pub(crate) fn shared_env(&self, other: &Self) -> Result<&Arc<Environment<T>>> {
        let env = self.env()?;
        env.ensure_same(other.env()?)?;
        Ok(env)
    }

    pub(crate) fn term_slice(&self) -> &[Term<T>] {
        &self.terms
    }

    /// Highest weight whose coefficients are exact. Zero for the void jet.
    pub fn accuracy(&self) -> u32 {
        self.accuracy
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty()
    }

    /// Highest weight actually stored.
    pub fn weight(&self) -> u32 {
        self.terms.last().map_or(0, Term::weight)
    }

    pub fn lowest_weight(&self) -> Option<u32> {
        self.terms.first().map(Term::weight)
    }

    pub fn standard_part(&self) -> T {
        match self.terms.first() {
            Some(term) if term.is_constant() => term.coefficient(),
            _ => T::zero(),
        }
    }

    /// Replaces the constant term, cloning shared storage first.
    pub fn set_standard_part(&mut self, value: T) -> Result<()> {
        let env = self.env()?.clone();
        let terms = Arc::make_mut(&mut self.terms);
        let has_constant = terms.first().is_some_and(Term::is_constant);
        match (has_constant, value.is_zero()) {
            (true, true) => {
                terms.remove(0);
            }
            (true, false) => {
                terms[0] = Term::from_monomial(Monomial::one(env.num_vars()), value);
            }
            (false, false) => {
                terms.insert(0, Term::from_monomial(Monomial::one(env.num_vars()), value));
            }
            (false, true) => {}
        }
        Ok(())
    }

    /// Coefficient of `dx^exponents`, zero when absent.
    pub fn coefficient(&self, exponents: &[u32]) -> T {
        let key = Monomial::new(exponents);
        self.terms
            .binary_search_by(|t| t.monomial().cmp(&key))
            .map_or(T::zero(), |i| self.terms[i].coefficient())
    }

    /// Dense weight-one coefficients, one per variable: a row of the jacobian.
    pub fn linear_part(&self) -> Vec<T> {
        let n = self.env.as_ref().map_or(0, |env| env.num_vars());
        let mut gradient = vec![T::zero(); n];
        for term in self.terms.iter().filter(|t| t.weight() == 1) {
            if let Some(index) = term.exponents().iter().position(|&e| e == 1) {
                gradient[index] = term.coefficient();
            }
        }
        gradient
    }

    /// True when the standard part vanishes.
    pub fn is_nilpotent(&self) -> bool {
        self.standard_part().is_zero()
    }

    pub fn max_magnitude(&self) -> f64 {
        self.terms
            .iter()
            .map(|t| t.coefficient().modulus())
            .fold(0.0, f64::max)
    }

    /// True when every term is at most `tolerance` in size, where `c dx^a`
    /// measures `|c| Π scale_i^a_i` with the environment's scale factors.
    pub fn is_negligible(&self, tolerance: f64) -> bool {
        self.terms.iter().all(|t| {
            let size = self
                .env
                .as_ref()
                .map_or(1.0, |env| env.scaled_size(t.exponents()));
            t.coefficient().modulus() * size <= tolerance
        })
    }

    /// Coefficient-wise comparison within an absolute tolerance, sized as in
    /// [`Self::is_negligible`], up to the lower of the two accuracies.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        match self.checked_sub(other) {
            Ok(diff) => {
                let accuracy = diff.accuracy;
                diff.filter(0, accuracy).is_negligible(tolerance)
            }
            Err(_) => false,
        }
    }

    fn merge(&self, other: &Self, negate_rhs: bool) -> Result<Self> {
        let env = self.shared_env(other)?;
        let rhs = |c: T| if negate_rhs { -c } else { c };
        let (a, b) = (&self.terms, &other.terms);
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].monomial().cmp(b[j].monomial()) {
                std::cmp::Ordering::Less => {
                    out.push(a[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(Term::from_monomial(
                        b[j].monomial().clone(),
                        rhs(b[j].coefficient()),
                    ));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let c = a[i].coefficient() + rhs(b[j].coefficient());
                    if !c.is_zero() {
                        out.push(Term::from_monomial(a[i].monomial().clone(), c));
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend(a[i..].iter().cloned());
        out.extend(
            b[j..]
                .iter()
                .map(|t| Term::from_monomial(t.monomial().clone(), rhs(t.coefficient()))),
        );
        let mut sum = Self::from_sorted(env.clone(), out);
        sum.accuracy = self.accuracy.min(other.accuracy);
        Ok(sum)
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        self.merge(other, false)
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self> {
        self.merge(other, true)
    }

    /// Truncated Cauchy product.
    pub fn checked_mul(&self, other: &Self) -> Result<Self> {
        let env = self.shared_env(other)?;
        let accuracy = self.product_accuracy(other).min(env.order());
        if let [only] = other.terms.as_slice() {
            if only.is_constant() {
                return Ok(self.mul_scalar(only.coefficient())?.limited_to(accuracy));
            }
        }
        let mut acc = BTreeMap::new();
        accumulate_product(&mut acc, self, other, T::one(), accuracy);
        Ok(Self::from_accumulator(env.clone(), acc).limited_to(accuracy))
    }

    // The weight-k product coefficient needs a_j and b_(k-j). Below its lowest
    // stored weight a factor is exactly zero, which extends how far the other
    // factor's coefficients reach.
    fn product_accuracy(&self, other: &Self) -> u32 {
        let reach = |a: &Self, b: &Self| {
            let untrusted = b.accuracy.saturating_add(1);
            let lowest = b.lowest_weight().map_or(untrusted, |w| w.min(untrusted));
            a.accuracy.saturating_add(lowest)
        };
        reach(self, other).min(reach(other, self))
    }

    pub fn checked_neg(&self) -> Result<Self> {
        let env = self.env()?;
        let terms = self.terms.iter().map(|t| t.scaled(-T::one())).collect();
        Ok(Self::from_sorted(env.clone(), terms).trusted_as(self))
    }

    pub fn add_scalar(&self, value: T) -> Result<Self> {
        let mut out = self.clone();
        out.set_standard_part(self.standard_part() + value)?;
        Ok(out)
    }

    pub fn sub_scalar(&self, value: T) -> Result<Self> {
        self.add_scalar(-value)
    }

    pub fn mul_scalar(&self, value: T) -> Result<Self> {
        let env = self.env()?;
        if value.is_zero() {
            return Ok(Self::constant(env, T::zero()).trusted_as(self));
        }
        let terms = self
            .terms
            .iter()
            .map(|t| t.scaled(value))
            .filter(|t| !t.coefficient().is_zero())
            .collect();
        Ok(Self::from_sorted(env.clone(), terms).trusted_as(self))
    }

    pub fn div_scalar(&self, value: T) -> Result<Self> {
        if value.is_zero() {
            return Err(DaError::DivisionByZeroConstant {
                operation: "scalar division",
            });
        }
        self.mul_scalar(T::one() / value)
    }

    /// Terms whose weight lies in the closed range `[low, high]`.
    pub fn filter(&self, low: u32, high: u32) -> Self {
        self.filter_by(|exponents, _| {
            let w: u32 = exponents.iter().sum();
            w >= low && w <= high
        })
    }

    pub fn filter_by<F>(&self, keep: F) -> Self
    where
        F: Fn(&[u32], T) -> bool,
    {
        let terms = self
            .terms
            .iter()
            .filter(|t| keep(t.exponents(), t.coefficient()))
            .cloned()
            .collect();
        Self {
            env: self.env.clone(),
            terms: Arc::new(terms),
            accuracy: self.accuracy,
        }
    }

    // A derivative of total order `requested` is exact only up to
    // `accuracy - requested`.
    fn check_derivative_order(&self, multi_index: &[u32]) -> Result<u32> {
        let env = self.env()?;
        env.check_len(multi_index.len(), "derivative multi-index")?;
        let requested: u32 = multi_index.iter().sum();
        if requested > self.accuracy {
            return Err(DaError::OrderExceeded {
                requested,
                order: self.accuracy,
            });
        }
        Ok(requested)
    }

    /// The `D` operator: exact partial derivative by `multi_index`, without any
    /// factorial normalisation.
    /// The result is exact up to weight `accuracy() - |multi_index|`; asking for
    /// more than the accuracy fails with `OrderExceeded`.
    pub fn differentiate(&self, multi_index: &[u32]) -> Result<Self> {
        let requested = self.check_derivative_order(multi_index)?;
        let env = self.env()?;
        if requested == 0 {
            return Ok(self.clone());
        }
        // Subtracting one fixed multi-index keeps the canonical order intact.
        let terms = self
            .terms
            .iter()
            .filter_map(|t| {
                let reduced = t.monomial().reduced_by(multi_index)?;
                let factor = t.monomial().falling_factorial(multi_index);
                Some(Term::from_monomial(reduced, t.coefficient() * real(factor)))
            })
            .collect();
        Ok(Self::from_sorted(env.clone(), terms).limited_to(self.accuracy - requested))
    }

    pub fn derivative_wrt(&self, index: usize) -> Result<Self> {
        let env = self.env()?;
        env.check_index(index)?;
        let mut multi_index = vec![0; env.num_vars()];
        multi_index[index] = 1;
        self.differentiate(&multi_index)
    }

    /// Raw Taylor coefficient of `multi_index`, checked against the accuracy.
    pub fn weighted_derivative(&self, multi_index: &[u32]) -> Result<T> {
        self.check_derivative_order(multi_index)?;
        Ok(self.coefficient(multi_index))
    }

    /// Value of the partial derivative `multi_index` at the reference point.
    pub fn derivative(&self, multi_index: &[u32]) -> Result<T> {
        let raw = self.weighted_derivative(multi_index)?;
        Ok(raw * real(Monomial::new(multi_index).multi_factorial()))
    }

    /// Exact polynomial evaluation at `point`.
    pub fn evaluate(&self, point: &[T]) -> Result<T> {
        let env = self.env()?;
        env.check_len(point.len(), "evaluation point")?;
        let deviation: Vec<T> = point
            .iter()
            .zip(env.reference())
            .map(|(&p, &r)| p - r)
            .collect();
        Ok(self
            .terms
            .iter()
            .fold(T::zero(), |acc, t| acc + t.evaluate(&deviation)))
    }

    /// Substitutes `substitutes[i]` for variable `i`. The result lives in the
    /// substitutes' environment, which may differ from this jet's.
    pub fn compose(&self, substitutes: &[Jet<T>]) -> Result<Jet<T>> {
        let env = self.env()?;
        env.check_len(substitutes.len(), "substitution")?;
        let target = substitutes[0].env()?.clone();
        let mut accuracy = self.accuracy;
        for substitute in substitutes {
            target.ensure_same(substitute.env()?)?;
            accuracy = accuracy.min(substitute.accuracy);
        }

        let deviations = substitutes
            .iter()
            .zip(env.reference())
            .map(|(s, &r)| s.sub_scalar(r))
            .collect::<Result<Vec<_>>>()?;
        let one = target.one();
        let mut powers: HashMap<Monomial, Jet<T>> = HashMap::new();
        let mut acc = BTreeMap::new();
        let trusted = self.terms.iter().take_while(|t| t.weight() <= self.accuracy);
        for term in trusted {
            let power = power_product(&mut powers, term.monomial(), &deviations, &one)?;
            for p in power.terms.iter() {
                *acc.entry(p.monomial().clone()).or_insert_with(T::zero) +=
                    term.coefficient() * p.coefficient();
            }
        }
        Ok(Self::from_accumulator(target, acc).limited_to(accuracy))
    }

    /// Homogeneous components indexed by weight, `0..=order`.
    pub fn homogeneous_parts(&self) -> Result<Vec<Jet<T>>> {
        let env = self.env()?;
        let mut parts = vec![Vec::new(); env.order() as usize + 1];
        for term in self.terms.iter() {
            parts[term.weight() as usize].push(term.clone());
        }
        Ok(parts
            .into_iter()
            .map(|terms| Self::from_sorted(env.clone(), terms).trusted_as(self))
            .collect())
    }

    pub fn snapshot(&self) -> JetSnapshot<T> {
        JetSnapshot {
            order: self.env.as_ref().map_or(0, |env| env.order()),
            accuracy: self.accuracy,
            num_vars: self.env.as_ref().map_or(0, |env| env.num_vars()),
            terms: self
                .terms
                .iter()
                .map(|t| (t.exponents().to_vec(), t.coefficient()))
                .collect(),
        }
    }
}

/// Adds `factor * a * b` into `acc`, skipping pairs heavier than `limit`.
pub(crate) fn accumulate_product<T: Coefficient>(
    acc: &mut BTreeMap<Monomial, T>,
    a: &Jet<T>,
    b: &Jet<T>,
    factor: T,
    limit: u32,
) {
    for p in a.terms.iter() {
        let scaled = p.coefficient() * factor;
        for q in b.terms.iter() {
            if p.weight() + q.weight() > limit {
                // b is sorted by weight, nothing further fits
                break;
            }
            *acc.entry(p.monomial().product(q.monomial()))
                .or_insert_with(T::zero) += scaled * q.coefficient();
        }
    }
}

// Builds u^m by one multiplication from u^(m - e_i), memoised per monomial.
fn power_product<T: Coefficient>(
    powers: &mut HashMap<Monomial, Jet<T>>,
    monomial: &Monomial,
    deviations: &[Jet<T>],
    one: &Jet<T>,
) -> Result<Jet<T>> {
    if let Some(found) = powers.get(monomial) {
        return Ok(found.clone());
    }
    let Some(index) = monomial.exponents().iter().position(|&e| e > 0) else {
        return Ok(one.clone());
    };
    let lower = power_product(powers, &monomial.lowered(index), deviations, one)?;
    let value = lower.checked_mul(&deviations[index])?;
    powers.insert(monomial.clone(), value.clone());
    Ok(value)
}

impl Jet<f64> {
    /// Lifts the jet onto the cached complex companion of its environment.
    pub fn to_complex(&self) -> Result<Jet<Complex<f64>>> {
        let env = self.env()?.complexified();
        let terms = self
            .terms
            .iter()
            .map(|t| Term::from_monomial(t.monomial().clone(), Complex::new(t.coefficient(), 0.0)))
            .collect();
        let mut out = Jet::from_sorted(env, terms);
        out.accuracy = self.accuracy;
        Ok(out)
    }
}

impl Jet<Complex<f64>> {
    /// Real part, placed back on `real_env`, whose companion this jet must live on.
    pub fn real_part(&self, real_env: &Arc<Environment<f64>>) -> Result<Jet<f64>> {
        self.project(real_env, |c| c.re)
    }

    pub fn imag_part(&self, real_env: &Arc<Environment<f64>>) -> Result<Jet<f64>> {
        self.project(real_env, |c| c.im)
    }

    fn project<F>(&self, real_env: &Arc<Environment<f64>>, part: F) -> Result<Jet<f64>>
    where
        F: Fn(Complex<f64>) -> f64,
    {
        real_env.complexified().ensure_same(self.env()?)?;
        let terms = self
            .terms
            .iter()
            .map(|t| Term::from_monomial(t.monomial().clone(), part(t.coefficient())))
            .filter(|t| t.coefficient() != 0.0)
            .collect();
        let mut out = Jet::from_sorted(real_env.clone(), terms);
        out.accuracy = self.accuracy;
        Ok(out)
    }
}

impl<T: Coefficient> PartialEq for Jet<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.env, &other.env) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                Arc::ptr_eq(a, b)
                    && self.accuracy == other.accuracy
                    && (Arc::ptr_eq(&self.terms, &other.terms) || self.terms == other.terms)
            }
            _ => false,
        }
    }
}

impl<T: Coefficient> fmt::Debug for Jet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jet")
            .field("order", &self.env.as_ref().map(|env| env.order()))
            .field("accuracy", &self.accuracy)
            .field("terms", &self.terms)
            .finish()
    }
}

impl<T: Coefficient> fmt::Display for Jet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(env) = &self.env else {
            return writeln!(f, "Jet(void)");
        };
        writeln!(
            f,
            "Jet(order = {}, accuracy = {}, variables = {}, terms = {})",
            env.order(),
            self.accuracy,
            env.num_vars(),
            self.terms.len()
        )?;
        for term in self.terms.iter() {
            writeln!(f, "  {:?}  {}", term.exponents(), term.coefficient())?;
        }
        Ok(())
    }
}

// Operator forms panic on misuse; the checked_* methods report the error instead.
fn expect_op<U>(result: Result<U>, operation: &str) -> U {
    match result {
        Ok(value) => value,
        Err(err) => panic!("jet {operation} failed: {err}"),
    }
}

macro_rules! jet_binop {
    ($trait:ident, $method:ident, $checked:ident, $name:literal) => {
        impl<'a, 'b, T: Coefficient> $trait<&'b Jet<T>> for &'a Jet<T> {
            type Output = Jet<T>;
            fn $method(self, rhs: &'b Jet<T>) -> Jet<T> {
                expect_op(self.$checked(rhs), $name)
            }
        }

        impl<T: Coefficient> $trait<Jet<T>> for Jet<T> {
            type Output = Jet<T>;
            fn $method(self, rhs: Jet<T>) -> Jet<T> {
                expect_op(self.$checked(&rhs), $name)
            }
        }

        impl<'b, T: Coefficient> $trait<&'b Jet<T>> for Jet<T> {
            type Output = Jet<T>;
            fn $method(self, rhs: &'b Jet<T>) -> Jet<T> {
                expect_op(self.$checked(rhs), $name)
            }
        }

        impl<'a, T: Coefficient> $trait<Jet<T>> for &'a Jet<T> {
            type Output = Jet<T>;
            fn $method(self, rhs: Jet<T>) -> Jet<T> {
                expect_op(self.$checked(&rhs), $name)
            }
        }
    };
}

jet_binop!(Add, add, checked_add, "addition");
jet_binop!(Sub, sub, checked_sub, "subtraction");
jet_binop!(Mul, mul, checked_mul, "multiplication");
jet_binop!(Div, div, checked_div, "division");

impl<T: Coefficient> Neg for &Jet<T> {
    type Output = Jet<T>;
    fn neg(self) -> Jet<T> {
        expect_op(self.checked_neg(), "negation")
    }
}

impl<T: Coefficient> Neg for Jet<T> {
    type Output = Jet<T>;
    fn neg(self) -> Jet<T> {
        expect_op(self.checked_neg(), "negation")
    }
}

macro_rules! jet_scalar_ops {
    ($scalar:ty) => {
        impl Add<$scalar> for &Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn add(self, rhs: $scalar) -> Jet<$scalar> {
                expect_op(self.add_scalar(rhs), "scalar addition")
            }
        }
        impl Add<$scalar> for Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn add(self, rhs: $scalar) -> Jet<$scalar> {
                &self + rhs
            }
        }
        impl Add<&Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn add(self, rhs: &Jet<$scalar>) -> Jet<$scalar> {
                rhs + self
            }
        }
        impl Add<Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn add(self, rhs: Jet<$scalar>) -> Jet<$scalar> {
                &rhs + self
            }
        }
        impl Sub<$scalar> for &Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn sub(self, rhs: $scalar) -> Jet<$scalar> {
                expect_op(self.sub_scalar(rhs), "scalar subtraction")
            }
        }
        impl Sub<$scalar> for Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn sub(self, rhs: $scalar) -> Jet<$scalar> {
                &self - rhs
            }
        }
        impl Sub<&Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn sub(self, rhs: &Jet<$scalar>) -> Jet<$scalar> {
                -rhs + self
            }
        }
        impl Sub<Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn sub(self, rhs: Jet<$scalar>) -> Jet<$scalar> {
                self - &rhs
            }
        }
        impl Mul<$scalar> for &Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn mul(self, rhs: $scalar) -> Jet<$scalar> {
                expect_op(self.mul_scalar(rhs), "scalar multiplication")
            }
        }
        impl Mul<$scalar> for Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn mul(self, rhs: $scalar) -> Jet<$scalar> {
                &self * rhs
            }
        }
        impl Mul<&Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn mul(self, rhs: &Jet<$scalar>) -> Jet<$scalar> {
                rhs * self
            }
        }
        impl Mul<Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn mul(self, rhs: Jet<$scalar>) -> Jet<$scalar> {
                &rhs * self
            }
        }
        impl Div<$scalar> for &Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn div(self, rhs: $scalar) -> Jet<$scalar> {
                expect_op(self.div_scalar(rhs), "scalar division")
            }
        }
        impl Div<$scalar> for Jet<$scalar> {
            type Output = Jet<$scalar>;
            fn div(self, rhs: $scalar) -> Jet<$scalar> {
                &self / rhs
            }
        }
        impl Div<&Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn div(self, rhs: &Jet<$scalar>) -> Jet<$scalar> {
                expect_op(rhs.recip().and_then(|r| r.mul_scalar(self)), "division")
            }
        }
        impl Div<Jet<$scalar>> for $scalar {
            type Output = Jet<$scalar>;
            fn div(self, rhs: Jet<$scalar>) -> Jet<$scalar> {
                self / &rhs
            }
        }
    };
}

jet_scalar_ops!(f64);
jet_scalar_ops!(Complex<f64>);

#[cfg(test)]
mod tests {
    use super::Jet;
    use crate::environment::{Environment, EnvironmentBuilder};
    use crate::error::DaError;
    use crate::term::Term;
    use std::sync::Arc;

    fn xy(order: u32) -> (Arc<Environment<f64>>, Jet<f64>, Jet<f64>) {
        let env = Environment::at_origin(order, 2).expect("environment");
        let x = env.coordinate(0).expect("x");
        let y = env.coordinate(1).expect("y");
        (env, x, y)
    }

    #[test]
    fn addition_merges_and_drops_cancelled_terms() {
        let (_env, x, y) = xy(3);
        let a = &x + &y;
        let b = &y - &x;
        let sum = &a + &b;
        assert_eq!(sum.term_count(), 1);
        assert_eq!(sum.coefficient(&[0, 1]), 2.0);
        assert_eq!(sum.coefficient(&[1, 0]), 0.0);
    }

    #[test]
    fn product_truncates_above_order_and_keeps_boundary() {
        let (_env, x, y) = xy(2);
        let p = &(&x + &y) * &(&x + &y);
        assert_eq!(p.coefficient(&[2, 0]), 1.0);
        assert_eq!(p.coefficient(&[1, 1]), 2.0);
        assert_eq!(p.coefficient(&[0, 2]), 1.0);

        let cube = &p * &x;
        assert!(cube.is_zero(), "weight 3 terms must be dropped at order 2");
        assert!(p.term_slice().iter().all(|t| t.weight() <= 2));
    }

    #[test]
    fn composition_matches_hand_expansion() {
        // f = x + x*y, g = y - x; order 2 about the origin.
        let (_env, x, y) = xy(2);
        let f = &x + &(&x * &y);
        let g = &y - &x;

        // x <- g, y <- y: (y - x) + (y - x) y = -x + y - xy + y^2
        let h = f.compose(&[g.clone(), y.clone()]).expect("composition");
        assert_eq!(h.term_count(), 4);
        assert_eq!(h.coefficient(&[1, 0]), -1.0);
        assert_eq!(h.coefficient(&[0, 1]), 1.0);
        assert_eq!(h.coefficient(&[1, 1]), -1.0);
        assert_eq!(h.coefficient(&[0, 2]), 1.0);

        // x <- g, y <- g: g + g^2 = -x + y + x^2 - 2xy + y^2
        let k = f.compose(&[g.clone(), g]).expect("composition");
        assert_eq!(k.coefficient(&[1, 0]), -1.0);
        assert_eq!(k.coefficient(&[0, 1]), 1.0);
        assert_eq!(k.coefficient(&[2, 0]), 1.0);
        assert_eq!(k.coefficient(&[1, 1]), -2.0);
        assert_eq!(k.coefficient(&[0, 2]), 1.0);
        assert_eq!(k.standard_part(), 0.0);
    }

    #[test]
    fn composition_subtracts_the_reference_point() {
        let env = Environment::with_reference(3, &[2.0]).expect("environment");
        let x = env.coordinate(0).expect("x");
        // f = x^2 expanded about 2; substituting the generator is the identity.
        let f = &x * &x;
        let same = f.compose(&[x.clone()]).expect("composition");
        assert_eq!(same, f);
        assert_eq!(f.standard_part(), 4.0);
        assert_eq!(f.coefficient(&[1]), 4.0);
        assert_eq!(f.coefficient(&[2]), 1.0);
    }

    #[test]
    fn composition_rejects_mixed_substitutes() {
        let (_a, x, _) = xy(2);
        let (_b, u, v) = xy(2);
        let err = x.compose(&[u, x.clone()]).expect_err("environments differ");
        assert_eq!(err, DaError::EnvironmentMismatch);
        assert!(x.compose(&[v]).is_err());
    }

    #[test]
    fn differentiation_is_exact_and_bounded() {
        let (_env, x, y) = xy(4);
        // x^3 y
        let f = &(&(&x * &x) * &x) * &y;
        let d = f.differentiate(&[2, 1]).expect("derivative");
        assert_eq!(d.term_count(), 1);
        assert_eq!(d.coefficient(&[1, 0]), 6.0);
        assert_eq!(f.derivative(&[3, 1]).expect("value"), 6.0);

        let err = f.differentiate(&[3, 2]).expect_err("beyond order");
        assert_eq!(
            err,
            DaError::OrderExceeded {
                requested: 5,
                order: 4
            }
        );
        assert!(f.differentiate(&[1]).is_err());
    }

    #[test]
    fn chained_derivatives_spend_the_accuracy() {
        let env = Environment::<f64>::at_origin(2, 1).expect("environment");
        let f = env.coordinate(0).expect("x").exp().expect("exp");
        assert_eq!(f.accuracy(), 2);

        let second = f.differentiate(&[2]).expect("second derivative");
        assert_eq!(second.accuracy(), 0);
        assert_eq!(second.standard_part(), 1.0);
        assert_eq!(
            second.differentiate(&[1]).expect_err("nothing left to differentiate"),
            DaError::OrderExceeded {
                requested: 1,
                order: 0
            }
        );
        assert!(second.weighted_derivative(&[1]).is_err());
        assert_eq!(f.derivative_wrt(0).expect("first").accuracy(), 1);
    }

    #[test]
    fn products_of_derivatives_drop_untrusted_weights() {
        let env = Environment::<f64>::at_origin(2, 1).expect("environment");
        let x = env.coordinate(0).expect("x");
        let df = x.exp().expect("exp").differentiate(&[1]).expect("derivative");
        // exp(x)² = exp(2x) = 1 + 2x + 2x², but only weights up to 1 are known.
        let square = &df * &df;
        assert_eq!(square.accuracy(), 1);
        assert_eq!(square.coefficient(&[0]), 1.0);
        assert_eq!(square.coefficient(&[1]), 2.0);
        assert_eq!(square.term_count(), 2);

        // Sums keep the heavier term but not its trust.
        let sum = &df + &(&x * &x);
        assert_eq!(sum.accuracy(), 1);
        assert_eq!(sum.coefficient(&[2]), 1.0);
        assert!(sum.approx_eq(&df, 0.0));

        // A nilpotent factor makes up for the missing weight.
        let shifted = &x * &df;
        assert_eq!(shifted.accuracy(), 2);
        assert_eq!(shifted.coefficient(&[2]), 1.0);
    }

    #[test]
    fn evaluation_uses_deviation_from_reference() {
        let env = Environment::<f64>::with_reference(3, &[1.0, -1.0]).expect("environment");
        let x = env.coordinate(0).expect("x");
        let y = env.coordinate(1).expect("y");
        let f = &(&x * &y) + &x;
        // f(x, y) = x y + x, exact for a polynomial of weight <= order
        let value = f.evaluate(&[3.0, 2.0]).expect("evaluation");
        assert!((value - 9.0).abs() < 1e-12);
        assert!(f.evaluate(&[1.0]).is_err());
    }

    #[test]
    fn filter_isolates_linear_part() {
        let (_env, x, y) = xy(3);
        let f = &(&(&x * &y) + &x) + 2.0;
        let linear = f.filter(1, 1);
        assert_eq!(linear.term_count(), 1);
        assert_eq!(f.linear_part(), vec![1.0, 0.0]);
        assert_eq!(f.filter(0, 0).standard_part(), 2.0);
        let no_x = f.filter_by(|e, _| e[0] == 0);
        assert_eq!(no_x.term_count(), 1);
    }

    #[test]
    fn negligibility_is_measured_in_variable_scales() {
        let mut builder = EnvironmentBuilder::<f64>::new(3);
        builder.coordinate(0.0).expect("x");
        builder.coordinate(0.0).expect("y");
        builder.scale(0, 1e-3);
        let scaled = builder.build().expect("environment");
        let x = scaled.coordinate(0).expect("x");
        let y = scaled.coordinate(1).expect("y");

        let small = &(&x * &x) * 1e-2;
        assert!(small.is_negligible(1e-6));
        assert!(!(&y * 1e-2).is_negligible(1e-6));
        assert!(small.approx_eq(&scaled.zero(), 1e-6));

        let (_plain, u, _) = xy(3);
        assert!(!(&(&u * &u) * 1e-2).is_negligible(1e-6));
    }

    #[test]
    fn copies_share_storage_until_written() {
        let (_env, x, _) = xy(2);
        let mut copy = x.clone();
        assert!(Arc::ptr_eq(&copy.terms, &x.terms));
        copy.set_standard_part(5.0).expect("set");
        assert!(!Arc::ptr_eq(&copy.terms, &x.terms));
        assert_eq!(x.standard_part(), 0.0);
        assert_eq!(copy.standard_part(), 5.0);
        copy.set_standard_part(0.0).expect("set");
        assert_eq!(copy, x);
    }

    #[test]
    fn void_jets_refuse_arithmetic() {
        let (_env, x, _) = xy(2);
        let void = Jet::<f64>::default();
        assert_eq!(void.checked_add(&x), Err(DaError::UninitializedJet));
        assert_eq!(x.checked_mul(&void), Err(DaError::UninitializedJet));
        assert_eq!(void.add_scalar(1.0), Err(DaError::UninitializedJet));
        assert!(void.evaluate(&[]).is_err());
        assert_eq!(void, Jet::default());
    }

    #[test]
    fn mismatched_environments_are_rejected() {
        let (_a, x, _) = xy(2);
        let (_b, u, _) = xy(2);
        assert_eq!(x.checked_add(&u), Err(DaError::EnvironmentMismatch));
        assert_ne!(x, u);
    }

    #[test]
    #[should_panic(expected = "different jet environments")]
    fn operators_panic_on_mismatch() {
        let (_a, x, _) = xy(2);
        let (_b, u, _) = xy(2);
        let _ = &x + &u;
    }

    #[test]
    fn from_terms_merges_duplicates_and_checks_order() {
        let env = Environment::at_origin(2, 2).expect("environment");
        let jet = Jet::from_terms(
            &env,
            [
                Term::new(&[1, 0], 1.0),
                Term::new(&[1, 0], 2.0),
                Term::new(&[0, 1], 0.0),
            ],
        )
        .expect("terms");
        assert_eq!(jet.term_count(), 1);
        assert_eq!(jet.coefficient(&[1, 0]), 3.0);
        assert!(Jet::from_terms(&env, [Term::new(&[3, 0], 1.0)]).is_err());
        assert!(Jet::from_terms(&env, [Term::new(&[1], 1.0)]).is_err());
    }

    #[test]
    fn complex_round_trip_through_companion() {
        let (env, x, y) = xy(2);
        let f = &(&x * &y) + 1.5;
        let z = f.to_complex().expect("complex");
        assert!(Arc::ptr_eq(z.env().expect("env"), &env.complexified()));
        let i = num_complex::Complex::new(0.0, 1.0);
        let rotated = &z * i;
        let re = rotated.real_part(&env).expect("real part");
        let im = rotated.imag_part(&env).expect("imaginary part");
        assert!(re.is_zero());
        assert_eq!(im, f);

        let other = Environment::at_origin(2, 2).expect("environment");
        assert!(z.real_part(&other).is_err());
    }

    #[test]
    fn snapshot_lists_terms_in_canonical_order() {
        let (_env, x, y) = xy(2);
        let f = &(&y + &x) + 1.0;
        let snapshot = f.snapshot();
        assert_eq!(snapshot.order, 2);
        assert_eq!(snapshot.accuracy, 2);
        assert_eq!(
            snapshot.terms,
            vec![(vec![0, 0], 1.0), (vec![1, 0], 1.0), (vec![0, 1], 1.0)]
        );
        let text = format!("{f}");
        assert!(text.starts_with("Jet(order = 2"));
    }
}

#[cfg(test)]
mod properties {
    use super::Jet;
    use crate::environment::Environment;
    use crate::iter::MultiIndexIter;
    use crate::term::Term;
    use proptest::prelude::*;
    use std::sync::Arc;

    const ORDER: u32 = 3;

    fn monomials(order: u32) -> Vec<Vec<u32>> {
        (0..=order)
            .flat_map(|w| MultiIndexIter::new(2, w))
            .map(|m| m.to_vec())
            .collect()
    }

    fn jet_from(env: &Arc<Environment<f64>>, coefficients: &[f64]) -> Jet<f64> {
        let terms = monomials(ORDER)
            .into_iter()
            .zip(coefficients)
            .map(|(e, &c)| Term::new(&e, c));
        Jet::from_terms(env, terms).expect("jet from terms")
    }

    fn coefficients() -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(
            prop_oneof![Just(0.0), -2.0..2.0f64],
            monomials(ORDER).len(),
        )
    }

    proptest! {
        #[test]
        fn product_is_truncated_untruncated_product(a in coefficients(), b in coefficients()) {
            let env = Environment::at_origin(ORDER, 2).expect("environment");
            let wide = Environment::at_origin(2 * ORDER, 2).expect("environment");
            let product = &jet_from(&env, &a) * &jet_from(&env, &b);
            let exact = &jet_from(&wide, &a) * &jet_from(&wide, &b);

            prop_assert!(product.term_slice().iter().all(|t| t.weight() <= ORDER));
            for exponents in monomials(ORDER) {
                let expected = exact.coefficient(&exponents);
                prop_assert!((product.coefficient(&exponents) - expected).abs() < 1e-12);
            }
        }

        #[test]
        fn additive_inverse_is_structurally_zero(a in coefficients()) {
            let env = Environment::at_origin(ORDER, 2).expect("environment");
            let f = jet_from(&env, &a);
            let sum = &f + &(-&f);
            prop_assert!(sum.is_zero());
            prop_assert_eq!(sum, env.zero());
        }

        #[test]
        fn evaluation_matches_term_sum(
            a in coefficients(),
            p in prop::collection::vec(-1.5..1.5f64, 2),
        ) {
            let env = Environment::with_reference(ORDER, &[0.25, -0.5]).expect("environment");
            let f = jet_from(&env, &a);
            let u = [p[0] - 0.25, p[1] + 0.5];
            let expected: f64 = monomials(ORDER)
                .iter()
                .zip(&a)
                .map(|(e, c)| c * u[0].powi(e[0] as i32) * u[1].powi(e[1] as i32))
                .sum();
            let value = f.evaluate(&p).expect("evaluation");
            prop_assert!((value - expected).abs() < 1e-10);
        }

        #[test]
        fn linear_part_is_the_numerical_gradient(a in coefficients()) {
            let env = Environment::with_reference(ORDER, &[0.3, -0.2]).expect("environment");
            let f = jet_from(&env, &a);
            let gradient = f.filter(1, 1).linear_part();
            let h = 1e-5;
            for i in 0..2 {
                let mut plus = vec![0.3, -0.2];
                let mut minus = plus.clone();
                plus[i] += h;
                minus[i] -= h;
                let numeric = (f.evaluate(&plus).expect("f+") - f.evaluate(&minus).expect("f-")) / (2.0 * h);
                prop_assert!((numeric - gradient[i]).abs() < 1e-6);
            }
        }
    }
}
