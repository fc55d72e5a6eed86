//! Iteration over jet terms and over exponent multi-indices.

use std::iter::FusedIterator;
use std::slice;

use crate::jet::Jet;
use crate::term::{MultiIndex, Term};
use crate::traits::Coefficient;

/// Terms of one jet in canonical order.
#[derive(Debug, Clone)]
pub struct TermIter<'a, T> {
    inner: slice::Iter<'a, Term<T>>,
}

impl<'a, T> Iterator for TermIter<'a, T> {
    type Item = &'a Term<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> DoubleEndedIterator for TermIter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl<T> ExactSizeIterator for TermIter<'_, T> {}
impl<T> FusedIterator for TermIter<'_, T> {}

impl<T: Coefficient> Jet<T> {
    /// A fresh iterator over the stored terms, lowest weight first.
    pub fn terms(&self) -> TermIter<'_, T> {
        TermIter {
            inner: self.term_slice().iter(),
        }
    }

    pub fn terms_of_weight(&self, weight: u32) -> impl Iterator<Item = &Term<T>> + '_ {
        self.terms()
            .skip_while(move |t| t.weight() < weight)
            .take_while(move |t| t.weight() == weight)
    }
}

impl<'a, T: Coefficient> IntoIterator for &'a Jet<T> {
    type Item = &'a Term<T>;
    type IntoIter = TermIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.terms()
    }
}

/// Every exponent multi-index of `num_vars` entries summing to `weight`, in
/// canonical (descending lexicographic) order.
#[derive(Debug, Clone)]
pub struct MultiIndexIter {
    current: Option<MultiIndex>,
}

impl MultiIndexIter {
    pub fn new(num_vars: usize, weight: u32) -> Self {
        if num_vars == 0 {
            return Self {
                current: (weight == 0).then(MultiIndex::new),
            };
        }
        let mut first: MultiIndex = smallvec::smallvec![0; num_vars];
        first[0] = weight;
        Self {
            current: Some(first),
        }
    }

    fn successor(exponents: &MultiIndex) -> Option<MultiIndex> {
        let n = exponents.len();
        let mut next = exponents.clone();
        let tail = next[n - 1];
        next[n - 1] = 0;
        let pivot = (0..n - 1).rev().find(|&i| next[i] > 0)?;
        next[pivot] -= 1;
        next[pivot + 1] = tail + 1;
        Some(next)
    }
}

impl Iterator for MultiIndexIter {
    type Item = MultiIndex;

    fn next(&mut self) -> Option<MultiIndex> {
        let current = self.current.take()?;
        if !current.is_empty() {
            self.current = Self::successor(&current);
        }
        Some(current)
    }
}

impl FusedIterator for MultiIndexIter {}
