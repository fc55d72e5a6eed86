//! Mappings: ordered vectors of jets on one environment, read as a map from
//! the environment's variable space into some space of jets.
//!
//! A mapping with one component per coordinate of an environment that also
//! declares parameters is a phase-space map: composition and inversion treat
//! the parameters as fixed and pass them through unchanged.

use log::{debug, trace, warn};
use nalgebra::DMatrix;
use std::ops::Index;
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{DaError, Result};
use crate::jet::Jet;
use crate::settings::InversionSettings;
use crate::term::Term;
use crate::traits::Coefficient;

#[derive(Debug, Clone)]
pub struct Mapping<T: Coefficient> {
    env: Arc<Environment<T>>,
    components: Vec<Jet<T>>,
}

impl<T: Coefficient> Mapping<T> {
    pub fn new(env: &Arc<Environment<T>>, components: Vec<Jet<T>>) -> Result<Self> {
        for component in &components {
            env.ensure_same(component.env()?)?;
        }
        Ok(Self {
            env: env.clone(),
            components,
        })
    }

    /// The generators: component `i` is variable `i`.
    pub fn identity(env: &Arc<Environment<T>>) -> Self {
        Self {
            env: env.clone(),
            components: env.variables(),
        }
    }

    pub fn constant(env: &Arc<Environment<T>>, values: &[T]) -> Self {
        Self {
            env: env.clone(),
            components: values.iter().map(|&v| Jet::constant(env, v)).collect(),
        }
    }

    /// Linear map about the reference point: component `i` is
    /// `x0_i + Σ_j M_ij dx_j`.
    pub fn from_linear(env: &Arc<Environment<T>>, matrix: &DMatrix<T>) -> Result<Self> {
        let n = env.num_vars();
        if matrix.nrows() != n || matrix.ncols() != n {
            return Err(DaError::InvalidVariable(format!(
                "linear map is {}x{}, environment has {n} variables",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        let components = (0..n)
            .map(|i| {
                let mut terms = Vec::with_capacity(n + 1);
                terms.push(Term::new(&vec![0; n], env.reference()[i]));
                for j in 0..n {
                    let mut exponents = vec![0; n];
                    exponents[j] = 1;
                    terms.push(Term::new(&exponents, matrix[(i, j)]));
                }
                Jet::from_terms(env, terms)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: env.clone(),
            components,
        })
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

    pub fn iter(&self) -> std::slice::Iter<'_, Jet<T>> {
        self.components.iter()
    }

    pub fn components(&self) -> &[Jet<T>] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Jet<T>> {
        self.components
    }

    /// Weight-one coefficients: rows are components, columns variables.
    pub fn jacobian(&self) -> DMatrix<T> {
        let n = self.env.num_vars();
        let mut matrix = DMatrix::zeros(self.components.len(), n);
        for (r, component) in self.components.iter().enumerate() {
            for (c, value) in component.linear_part().into_iter().enumerate() {
                matrix[(r, c)] = value;
            }
        }
        matrix
    }

    /// `self ∘ inner`: every component of `self` with `inner` substituted.
    pub fn compose(&self, inner: &Mapping<T>) -> Result<Mapping<T>> {
        let substitutes = self.substitutes(inner)?;
        let components = self
            .components
            .iter()
            .map(|c| c.compose(&substitutes))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: inner.env.clone(),
            components,
        })
    }

    // A phase-space `inner` is completed with the generators of its own
    // environment's parameters.
    fn substitutes(&self, inner: &Mapping<T>) -> Result<Vec<Jet<T>>> {
        let mut substitutes = inner.components.clone();
        if inner.len() == self.env.space_dim() && inner.len() < self.env.num_vars() {
            for j in 0..self.env.num_parameters() {
                substitutes.push(inner.env.parameter(j)?);
            }
        }
        Ok(substitutes)
    }

    // Number of variables the map acts on: all of them, or only the coordinates.
    fn square_dim(&self) -> Result<usize> {
        let len = self.len();
        if len == self.env.num_vars() || len == self.env.space_dim() {
            Ok(len)
        } else {
            Err(DaError::InvalidVariable(format!(
                "cannot invert a map of {len} components on {} coordinates and {} parameters",
                self.env.space_dim(),
                self.env.num_parameters()
            )))
        }
    }

    pub fn evaluate(&self, point: &[T]) -> Result<Vec<T>> {
        self.components.iter().map(|c| c.evaluate(point)).collect()
    }

    pub fn filter(&self, low: u32, high: u32) -> Self {
        self.map_components(|c| c.filter(low, high))
    }

    fn map_components<F>(&self, f: F) -> Self
    where
        F: Fn(&Jet<T>) -> Jet<T>,
    {
        Self {
            env: self.env.clone(),
            components: self.components.iter().map(f).collect(),
        }
    }

    fn zip_components<F>(&self, other: &Self, f: F) -> Result<Self>
    where
        F: Fn(&Jet<T>, &Jet<T>) -> Result<Jet<T>>,
    {
        self.env.ensure_same(&other.env)?;
        if self.len() != other.len() {
            return Err(DaError::InvalidVariable(format!(
                "mappings have {} and {} components",
                self.len(),
                other.len()
            )));
        }
        let components = self
            .components
            .iter()
            .zip(&other.components)
            .map(|(a, b)| f(a, b))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: self.env.clone(),
            components,
        })
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self> {
        self.zip_components(other, Jet::checked_add)
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self> {
        self.zip_components(other, Jet::checked_sub)
    }

    pub fn scale(&self, factor: T) -> Result<Self> {
        let components = self
            .components
            .iter()
            .map(|c| c.mul_scalar(factor))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: self.env.clone(),
            components,
        })
    }

    /// `M · f` with the components of `f` as a column of jets.
    pub fn apply_matrix(&self, matrix: &DMatrix<T>) -> Result<Self> {
        if matrix.ncols() != self.len() {
            return Err(DaError::InvalidVariable(format!(
                "matrix has {} columns, mapping has {} components",
                matrix.ncols(),
                self.len()
            )));
        }
        let components = (0..matrix.nrows())
            .map(|i| {
                self.components
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| !matrix[(i, *j)].is_zero())
                    .try_fold(self.env.zero(), |acc, (j, c)| {
                        acc.checked_add(&c.mul_scalar(matrix[(i, j)])?)
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            env: self.env.clone(),
            components,
        })
    }

    pub fn max_magnitude(&self) -> f64 {
        self.components
            .iter()
            .map(Jet::max_magnitude)
            .fold(0.0, f64::max)
    }

    pub fn is_negligible(&self, tolerance: f64) -> bool {
        self.components.iter().all(|c| c.is_negligible(tolerance))
    }

    /// True when component `i` matches variable `i` within `tolerance`. A
    /// phase-space map is compared against the coordinates only.
    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.square_dim().is_ok()
            && self
                .components
                .iter()
                .zip(self.env.variables())
                .all(|(c, v)| c.approx_eq(&v, tolerance))
    }

    pub fn inverse(&self) -> Result<Mapping<T>> {
        self.inverse_with(InversionSettings::default())
    }

    /// Inverse of a square map, or of a phase-space map with the parameters
    /// held fixed.
    ///
    /// A map that moves the reference point `x0` to `y0 = f(x0)` is first
    /// centred as `f - y0 + x0`. That map is inverted about `x0`, and the
    /// result is handed back on an environment expanded about `y0`, so its
    /// standard parts are `x0` and both `f∘g` and `g∘f` compose directly.
    pub fn inverse_with(&self, settings: InversionSettings) -> Result<Mapping<T>> {
        settings.validate()?;
        let dim = self.square_dim()?;
        let reference = self.env.reference();
        let mut image = reference.to_vec();
        for (y, c) in image.iter_mut().zip(&self.components) {
            *y = c.standard_part();
        }
        let moved = image
            .iter()
            .zip(reference)
            .any(|(&y, &r)| (y - r).modulus() > settings.tolerance * (1.0 + r.modulus()));
        if !moved {
            return self.invert_centred(dim, settings);
        }

        let mut centred = self.components.clone();
        for (c, &r) in centred.iter_mut().zip(reference) {
            c.set_standard_part(r)?;
        }
        let local = Self {
            env: self.env.clone(),
            components: centred,
        }
        .invert_centred(dim, settings)?;
        let image_env = self.env.expanded_about(&image)?;
        debug!("Inverse re-expanded about the image of the reference point");
        Ok(Self {
            components: local.iter().map(|c| c.moved_to(&image_env)).collect(),
            env: image_env,
        })
    }

    // Starts from the inverse of the linear part, then repeats
    // `z <- z - M (f∘z - id)`, each round fixing the next weight, until the
    // residual is negligible next to the size of `f∘z`.
    fn invert_centred(&self, dim: usize, settings: InversionSettings) -> Result<Mapping<T>> {
        let env = &self.env;
        let linear_inverse = self
            .jacobian()
            .columns(0, dim)
            .into_owned()
            .try_inverse()
            .ok_or(DaError::SingularJacobian)?;
        let identity = Self {
            env: env.clone(),
            components: env.variables().into_iter().take(dim).collect(),
        };
        let mut z = identity.linear_start(&linear_inverse)?;
        let limit = settings.iteration_limit(env.order());

        for round in 1..=limit {
            let image = self.compose(&z)?;
            let residual = image.checked_sub(&identity)?;
            let threshold = settings.tolerance * (1.0 + image.max_magnitude());
            if residual.is_negligible(threshold) {
                debug!("Map inversion converged after {round} rounds (order {})", env.order());
                return Ok(z);
            }
            trace!(
                "Inversion round {round}: residual {:.3e}",
                residual.max_magnitude()
            );
            z = z.checked_sub(&residual.apply_matrix(&linear_inverse)?)?;
        }

        warn!("Map inversion did not converge within {limit} rounds");
        Err(DaError::NonConvergence {
            operation: "map inversion",
            iterations: limit,
        })
    }

    // `x0 + M (x - x0)` on the first `M.ncols()` variables of `self`, which
    // holds their generators.
    fn linear_start(&self, matrix: &DMatrix<T>) -> Result<Self> {
        let deviations = self
            .components
            .iter()
            .zip(self.env.reference())
            .map(|(x, &r)| x.sub_scalar(r))
            .collect::<Result<Vec<_>>>()?;
        let mut start = Self {
            env: self.env.clone(),
            components: deviations,
        }
        .apply_matrix(matrix)?;
        for (z, &r) in start.components.iter_mut().zip(self.env.reference()) {
            z.set_standard_part(r)?;
        }
        Ok(start)
    }
}

impl<T: Coefficient> Jet<T> {
    /// Substitutes the components of `mapping` for the variables.
    pub fn compose_mapping(&self, mapping: &Mapping<T>) -> Result<Jet<T>> {
        self.compose(mapping.components())
    }
}

impl<T: Coefficient> PartialEq for Mapping<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.env, &other.env) && self.components == other.components
    }
}

impl<T: Coefficient> Index<usize> for Mapping<T> {
    type Output = Jet<T>;

    fn index(&self, index: usize) -> &Jet<T> {
        &self.components[index]
    }
}

impl<'a, T: Coefficient> IntoIterator for &'a Mapping<T> {
    type Item = &'a Jet<T>;
    type IntoIter = std::slice::Iter<'a, Jet<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.components.iter()
    }
}
