//! Vector fields as first-order differential operators, and their
//! exponential series.
//!
//! A field `v` acts on a jet `f` as `v·f = Σ v_i ∂f/∂x_i`. The exponential
//! `exp(t v) f = f + t v·f + t²/2! v·(v·f) + ...` transports `f` along the
//! flow of `v` for time `t`; applied to the identity mapping it gives the
//! flow map itself.
//!
//! A field with one component per coordinate leaves the parameters alone, so
//! its flow is a phase-space map.

use log::{trace, warn};
use std::sync::Arc;

use crate::environment::Environment;
use crate::error::{DaError, Result};
use crate::jet::Jet;
use crate::mapping::Mapping;
use crate::settings::SeriesSettings;
use crate::traits::{real, Coefficient};

#[derive(Debug, Clone)]
pub struct LieOperator<T: Coefficient> {
    field: Mapping<T>,
    settings: SeriesSettings,
}

impl<T: Coefficient> LieOperator<T> {
    pub fn new(field: Mapping<T>) -> Result<Self> {
        Self::with_settings(field, SeriesSettings::default())
    }

    pub fn with_settings(field: Mapping<T>, settings: SeriesSettings) -> Result<Self> {
        settings.validate()?;
        let env = field.env();
        if field.len() != env.space_dim() {
            env.check_len(field.len(), "vector field")?;
        }
        Ok(Self { field, settings })
    }

    pub fn field(&self) -> &Mapping<T> {
        &self.field
    }

    pub fn env(&self) -> &Arc<Environment<T>> {
        self.field.env()
    }

    pub fn settings(&self) -> &SeriesSettings {
        &self.settings
    }

    /// `Σ v_i ∂f/∂x_i`
    pub fn apply(&self, f: &Jet<T>) -> Result<Jet<T>> {
        let env = self.env();
        env.ensure_same(f.env()?)?;
        let mut out = env.zero();
        for (i, component) in self.field.iter().enumerate() {
            if component.is_zero() {
                continue;
            }
            let slope = f.derivative_wrt(i)?;
            if !slope.is_zero() {
                out = out.checked_add(&component.checked_mul(&slope)?)?;
            }
        }
        Ok(out)
    }

    /// Sums `Σ t^k/k! v^k f` until the next increment is negligible.
    pub fn exp_map(&self, t: T, f: &Jet<T>) -> Result<Jet<T>> {
        self.env().ensure_same(f.env()?)?;
        if t.is_zero() {
            return Ok(f.clone());
        }
        let SeriesSettings {
            max_terms,
            tolerance,
        } = self.settings;

        let mut answer = f.clone();
        let mut increment = f.clone();
        for k in 1..=max_terms {
            if increment.accuracy() == 0 {
                trace!("Exponential series used up the accuracy after {k} terms");
                return Ok(answer);
            }
            increment = self.apply(&increment)?.mul_scalar(t / real(k as f64))?;
            if increment.is_zero() {
                trace!("Exponential series terminated exactly after {k} terms");
                return Ok(answer);
            }
            answer = answer.checked_add(&increment)?;
            let scale = answer.max_magnitude().max(1.0);
            if increment.is_negligible(tolerance * scale) {
                trace!("Exponential series converged after {k} terms");
                return Ok(answer);
            }
        }

        warn!("Exponential series did not converge within {max_terms} terms");
        Err(DaError::NonConvergence {
            operation: "exponential map",
            iterations: max_terms,
        })
    }

    pub fn exp_map_mapping(&self, t: T, mapping: &Mapping<T>) -> Result<Mapping<T>> {
        let components = mapping
            .iter()
            .map(|c| self.exp_map(t, c))
            .collect::<Result<Vec<_>>>()?;
        Mapping::new(mapping.env(), components)
    }

    /// The time-`t` flow map of the field.
    pub fn flow(&self, t: T) -> Result<Mapping<T>> {
        let env = self.env();
        let start = env.variables().into_iter().take(self.field.len()).collect();
        self.exp_map_mapping(t, &Mapping::new(env, start)?)
    }
}

#[cfg(test)]
mod tests {
    use super::LieOperator;
    use crate::environment::{Environment, EnvironmentBuilder};
    use crate::error::DaError;
    use crate::mapping::Mapping;
    use crate::settings::SeriesSettings;
    use std::f64::consts::PI;
    use std::sync::Arc;

    fn rotation(env: &Arc<Environment<f64>>) -> LieOperator<f64> {
        let x = env.coordinate(0).expect("x");
        let y = env.coordinate(1).expect("y");
        LieOperator::new(Mapping::new(env, vec![y, -&x]).expect("field")).expect("operator")
    }

    #[test]
    fn apply_is_the_directional_derivative() {
        let env = Environment::at_origin(3, 2).expect("environment");
        let x = env.coordinate(0).expect("x");
        let y = env.coordinate(1).expect("y");
        let op = rotation(&env);
        assert_eq!(op.apply(&x).expect("apply"), y);
        // v·(x² + y²) = 2xy - 2yx = 0
        let r2 = &(&x * &x) + &(&y * &y);
        assert!(op.apply(&r2).expect("apply").is_zero());
        assert_eq!(op.exp_map(1.3, &r2).expect("exp"), r2);
    }

    #[test]
    fn zero_time_is_the_identity() {
        let env = Environment::at_origin(4, 2).expect("environment");
        let x = env.coordinate(0).expect("x");
        let f = &(&x * &x).sin().expect("sin") + 0.5;
        assert_eq!(rotation(&env).exp_map(0.0, &f).expect("exp"), f);
    }

    #[test_log::test]
    fn rotation_by_a_full_turn_returns_home() {
        let env = Environment::at_origin(3, 2).expect("environment");
        let op = rotation(&env);
        assert!(op.flow(2.0 * PI).expect("flow").is_identity(1e-10));

        let quarter = op.flow(PI / 2.0).expect("flow");
        assert!((quarter[0].coefficient(&[0, 1]) - 1.0).abs() < 1e-12);
        assert!(quarter[0].coefficient(&[1, 0]).abs() < 1e-12);
    }

    #[test]
    fn forward_then_backward_flow_cancels() {
        let env = Environment::at_origin(5, 2).expect("environment");
        let q = env.coordinate(0).expect("q");
        let p = env.coordinate(1).expect("p");
        // Hamiltonian H = p²/2 + q²/2 - q³/3
        let field = Mapping::new(&env, vec![p.clone(), &(&q * &q) - &q]).expect("field");
        let op = LieOperator::new(field).expect("operator");
        let forward = op.flow(0.3).expect("forward");
        let backward = op.flow(-0.3).expect("backward");
        assert!(forward.compose(&backward).expect("compose").is_identity(1e-12));
        assert!(backward.compose(&forward).expect("compose").is_identity(1e-12));
    }

    #[test]
    fn parameters_ride_along_unchanged() {
        let mut builder = EnvironmentBuilder::<f64>::new(4);
        builder.coordinate(0.0).expect("q");
        builder.coordinate(0.0).expect("p");
        builder.parameter(0.5);
        let env = builder.build().expect("environment");
        let q = env.coordinate(0).expect("q");
        let p = env.coordinate(1).expect("p");
        let k = env.parameter(0).expect("k");
        // Oscillator with stiffness k: q' = p, p' = -k q
        let field = Mapping::new(&env, vec![p.clone(), -&(&k * &q)]).expect("field");
        let op = LieOperator::new(field).expect("operator");

        let forward = op.flow(0.4).expect("forward");
        let backward = op.flow(-0.4).expect("backward");
        assert_eq!(forward.len(), 2);
        assert!(forward.compose(&backward).expect("compose").is_identity(1e-12));

        let t: f64 = 0.4;
        let omega = 0.5f64.sqrt();
        assert!((forward[0].coefficient(&[1, 0, 0]) - (omega * t).cos()).abs() < 1e-3);
        assert!((forward[0].coefficient(&[0, 1, 0]) - (omega * t).sin() / omega).abs() < 1e-3);
        assert!(op.apply(&k).expect("apply").is_zero());
        assert_eq!(op.exp_map(0.4, &k).expect("exp"), k);
    }

    #[test]
    fn translation_stops_when_the_accuracy_runs_out() {
        let env = Environment::<f64>::at_origin(3, 1).expect("environment");
        let x = env.coordinate(0).expect("x");
        let op = LieOperator::new(Mapping::new(&env, vec![env.one()]).expect("field"))
            .expect("operator");
        let shifted = op.exp_map(0.25, &x).expect("exp");
        assert!((shifted.standard_part() - 0.25).abs() < 1e-15);
        assert!((shifted.coefficient(&[1]) - 1.0).abs() < 1e-15);
        assert_eq!(shifted.term_count(), 2);

        let cube = &(&x * &x) * &x;
        let moved = op.exp_map(0.5, &cube).expect("exp");
        assert_eq!(moved.accuracy(), 0);
        assert!((moved.standard_part() - 0.125).abs() < 1e-15);
    }

    #[test_log::test]
    fn series_limits_are_enforced() {
        let env = Environment::at_origin(2, 2).expect("environment");
        let x = env.coordinate(0).expect("x");
        let y = env.coordinate(1).expect("y");
        let field = Mapping::new(&env, vec![y.clone(), -&x]).expect("field");
        let settings = SeriesSettings {
            max_terms: 2,
            ..SeriesSettings::default()
        };
        let op = LieOperator::with_settings(field, settings).expect("operator");
        assert_eq!(
            op.exp_map(1.0, &x).expect_err("two terms cannot converge"),
            DaError::NonConvergence {
                operation: "exponential map",
                iterations: 2
            }
        );

        let short = Mapping::new(&env, vec![y]).expect("field");
        assert!(LieOperator::new(short).is_err());

        let other = Environment::at_origin(2, 2).expect("environment");
        let foreign = other.coordinate(0).expect("x");
        assert_eq!(
            op.apply(&foreign).expect_err("mismatch"),
            DaError::EnvironmentMismatch
        );
    }
}
