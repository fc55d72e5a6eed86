//! Linear analysis of real maps: spectrum and symplecticity of the jacobian.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, SVD};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::mapping::Mapping;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: Complex<f64>,
    /// Unit-norm eigenvector.
    pub vector: Vec<Complex<f64>>,
}

/// Eigenvalues and eigenvectors of the linear part of `map`.
///
/// A phase-space map (one component per coordinate) is analysed on its
/// coordinate block, at the environment's parameter values.
pub fn linear_spectrum(map: &Mapping<f64>) -> Result<Vec<EigenPair>> {
    let env = map.env();
    let dim = map.len();
    if dim != env.space_dim() && dim != env.num_vars() {
        bail!(
            "Spectrum needs one component per coordinate or per variable, got {dim} for {} coordinates and {} parameters.",
            env.space_dim(),
            env.num_parameters()
        );
    }
    let block = map.jacobian().columns(0, dim).into_owned();
    compute_eigenpairs(&block).context("Failed to compute the spectrum of the linear part")
}

/// `max |Mᵀ J M - J|` over the coordinate block of the jacobian, with `J` the
/// canonical form for coordinates ordered `(q_1..q_n, p_1..p_n)`.
pub fn symplectic_error(map: &Mapping<f64>) -> Result<f64> {
    let dim = map.env().space_dim();
    if dim == 0 || dim % 2 != 0 {
        bail!("Symplectic form needs an even, non-zero coordinate count, got {dim}.");
    }
    if map.len() < dim {
        bail!(
            "Map has {} components but {dim} coordinates.",
            map.len()
        );
    }
    let block = map.jacobian().view((0, 0), (dim, dim)).into_owned();
    let half = dim / 2;
    let form = DMatrix::from_fn(dim, dim, |r, c| {
        if c == r + half {
            1.0
        } else if r == c + half {
            -1.0
        } else {
            0.0
        }
    });
    let defect = block.transpose() * &form * &block - &form;
    Ok(defect.abs().max())
}

fn compute_eigenpairs(matrix: &DMatrix<f64>) -> Result<Vec<EigenPair>> {
    let dim = matrix.nrows();
    let eigenvalues = matrix.complex_eigenvalues();
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for idx in 0..dim {
        let lambda = eigenvalues[idx];

        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= lambda;
        }

        let svd = SVD::new(shifted, true, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| anyhow!("Failed to compute eigenvector for eigenvalue index {}", idx))?;
        // Null direction: right singular vector of the smallest singular value.
        let row_index = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        let mut vector: Vec<Complex<f64>> = v_t.row(row_index).iter().map(|c| c.conj()).collect();
        normalize_complex_vector(&mut vector);

        pairs.push(EigenPair {
            value: lambda,
            vector,
        });
    }
    Ok(pairs)
}

fn normalize_complex_vector(vec: &mut [Complex<f64>]) {
    let norm = vec.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        for entry in vec {
            *entry /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{linear_spectrum, symplectic_error};
    use crate::environment::{Environment, EnvironmentBuilder};
    use crate::lie::LieOperator;
    use crate::mapping::Mapping;
    use nalgebra::DMatrix;
    use num_complex::Complex;

    #[test]
    fn rotation_spectrum_lies_on_the_unit_circle() {
        let env = Environment::at_origin(3, 2).expect("environment");
        let q = env.coordinate(0).expect("q");
        let p = env.coordinate(1).expect("p");
        let field = Mapping::new(&env, vec![p, -&q]).expect("field");
        let flow = LieOperator::new(field).expect("operator").flow(0.7).expect("flow");

        let pairs = linear_spectrum(&flow).expect("spectrum");
        assert_eq!(pairs.len(), 2);
        let jacobian = flow.jacobian().map(|v| Complex::new(v, 0.0));
        for pair in &pairs {
            assert!((pair.value.norm() - 1.0).abs() < 1e-12);
            assert!((pair.value.im.abs() - 0.7f64.sin()).abs() < 1e-12);
            let v = nalgebra::DVector::from_vec(pair.vector.clone());
            let residual = &jacobian * &v - &v * pair.value;
            assert!(residual.norm() < 1e-10);
        }
        assert!(symplectic_error(&flow).expect("symplectic") < 1e-12);
    }

    #[test]
    fn dilation_is_not_symplectic() {
        let env = Environment::at_origin(2, 2).expect("environment");
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]);
        let map = Mapping::from_linear(&env, &m).expect("map");
        let error = symplectic_error(&map).expect("symplectic");
        assert!((error - 3.0).abs() < 1e-12);
        let spectrum = linear_spectrum(&map).expect("spectrum");
        assert!(spectrum.iter().all(|p| (p.value.re - 2.0).abs() < 1e-12));
    }

    #[test]
    fn odd_coordinate_counts_are_rejected() {
        let mut builder = EnvironmentBuilder::<f64>::new(2);
        builder.coordinate(0.0).expect("coordinate");
        builder.parameter(1.0);
        let env = builder.build().expect("environment");
        let map = Mapping::identity(&env);
        assert!(symplectic_error(&map).is_err());

        let q = env.coordinate(0).expect("q");
        let three = Mapping::new(&env, vec![q.clone(), q.clone(), q]).expect("map");
        assert!(linear_spectrum(&three).is_err());
    }

    #[test]
    fn parameter_dependent_maps_use_the_coordinate_block() {
        let mut builder = EnvironmentBuilder::<f64>::new(2);
        builder.coordinate(0.0).expect("q");
        builder.coordinate(0.0).expect("p");
        builder.parameter(0.25);
        let env = builder.build().expect("environment");
        let q = env.coordinate(0).expect("q");
        let p = env.coordinate(1).expect("p");
        let k = env.parameter(0).expect("k");
        // drift then kick: trace 2 - k, determinant 1
        let drifted = &q + &p;
        let map = Mapping::new(&env, vec![drifted.clone(), &p - &(&k * &drifted)]).expect("map");

        let pairs = linear_spectrum(&map).expect("spectrum");
        assert_eq!(pairs.len(), 2);
        let trace: Complex<f64> = pairs.iter().map(|p| p.value).sum();
        let det = pairs[0].value * pairs[1].value;
        assert!((trace.re - 1.75).abs() < 1e-12);
        assert!((det.re - 1.0).abs() < 1e-12);
        assert!(symplectic_error(&map).expect("symplectic") < 1e-12);
    }
}
