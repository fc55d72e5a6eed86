//! Monomials and terms: the atomic entries of a jet's sparse polynomial.
//!
//! Every merge-based algorithm in the jet layer relies on one canonical order
//! of monomials: ascending weight (total degree), ties broken by descending
//! lexicographic comparison of the exponents. Under this order the linear
//! monomials of a jet appear as `x0, x1, x2, ...`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;

use crate::traits::Coefficient;

/// Exponent multi-index, one non-negative entry per environment variable.
pub type MultiIndex = SmallVec<[u32; 6]>;

/// An exponent multi-index together with its cached weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Monomial {
    weight: u32,
    exponents: MultiIndex,
}

impl Monomial {
    pub fn new(exponents: &[u32]) -> Self {
        Self {
            weight: exponents.iter().sum(),
            exponents: MultiIndex::from_slice(exponents),
        }
    }

    /// The constant monomial `1` over `num_vars` variables.
    pub fn one(num_vars: usize) -> Self {
        Self {
            weight: 0,
            exponents: smallvec::smallvec![0; num_vars],
        }
    }

    /// The linear monomial `x_index`.
    pub fn unit(num_vars: usize, index: usize) -> Self {
        let mut exponents: MultiIndex = smallvec::smallvec![0; num_vars];
        exponents[index] = 1;
        Self {
            weight: 1,
            exponents,
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn exponents(&self) -> &[u32] {
        &self.exponents
    }

    pub fn num_vars(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_constant(&self) -> bool {
        self.weight == 0
    }

    /// Monomial product: exponents add.
    pub fn product(&self, other: &Self) -> Self {
        let exponents = self
            .exponents
            .iter()
            .zip(other.exponents.iter())
            .map(|(a, b)| a + b)
            .collect();
        Self {
            weight: self.weight + other.weight,
            exponents,
        }
    }

    /// Removes the exponents in `by`, or `None` when some entry would go negative.
    pub fn reduced_by(&self, by: &[u32]) -> Option<Self> {
        let mut exponents = MultiIndex::with_capacity(self.exponents.len());
        for (&e, &n) in self.exponents.iter().zip(by.iter()) {
            exponents.push(e.checked_sub(n)?);
        }
        Some(Self {
            weight: self.weight - by.iter().sum::<u32>(),
            exponents,
        })
    }

    /// Lowers the exponent of `index` by one. The exponent must be positive.
    pub(crate) fn lowered(&self, index: usize) -> Self {
        let mut exponents = self.exponents.clone();
        exponents[index] -= 1;
        Self {
            weight: self.weight - 1,
            exponents,
        }
    }

    /// Product of falling factorials `e_k! / (e_k - n_k)!`, the factor picked up
    /// when this monomial is differentiated by the multi-index `n`.
    pub(crate) fn falling_factorial(&self, n: &[u32]) -> f64 {
        let mut factor = 1.0;
        for (&e, &k) in self.exponents.iter().zip(n.iter()) {
            for step in 0..k {
                factor *= f64::from(e - step);
            }
        }
        factor
    }

    /// `Π e_k!`, relating a Taylor coefficient to the plain derivative value.
    pub(crate) fn multi_factorial(&self) -> f64 {
        self.exponents
            .iter()
            .map(|&e| (1..=e).map(f64::from).product::<f64>())
            .product()
    }
}

impl Ord for Monomial {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.exponents.cmp(&self.exponents))
    }
}

impl PartialOrd for Monomial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One coefficient attached to one monomial. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term<T> {
    monomial: Monomial,
    coefficient: T,
}

impl<T: Coefficient> Term<T> {
    pub fn new(exponents: &[u32], coefficient: T) -> Self {
        Self {
            monomial: Monomial::new(exponents),
            coefficient,
        }
    }

    pub fn from_monomial(monomial: Monomial, coefficient: T) -> Self {
        Self {
            monomial,
            coefficient,
        }
    }

    pub fn monomial(&self) -> &Monomial {
        &self.monomial
    }

    pub fn exponents(&self) -> &[u32] {
        self.monomial.exponents()
    }

    pub fn weight(&self) -> u32 {
        self.monomial.weight()
    }

    pub fn coefficient(&self) -> T {
        self.coefficient
    }

    pub fn is_constant(&self) -> bool {
        self.monomial.is_constant()
    }

    pub fn scaled(&self, factor: T) -> Self {
        Self {
            monomial: self.monomial.clone(),
            coefficient: self.coefficient * factor,
        }
    }

    /// Value of `c * u^e` at the deviation `u`.
    pub fn evaluate(&self, deviation: &[T]) -> T {
        let mut value = self.coefficient;
        for (&e, &u) in self.exponents().iter().zip(deviation.iter()) {
            if e > 0 {
                value *= u.powi(e as i32);
            }
        }
        value
    }
}
