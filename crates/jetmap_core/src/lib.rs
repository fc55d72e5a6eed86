//! `jetmap_core` is a differential algebra engine: truncated multivariate
//! Taylor series ("jets") with exact arithmetic up to a fixed order.
//!
//! Key components:
//! - **Environment**: order, variables and reference point shared by every
//!   interoperating jet, built with [`EnvironmentBuilder`].
//! - **Jet**: sparse polynomial arithmetic with truncation, differentiation,
//!   evaluation, composition and elementary functions.
//! - **LinearJet**: value plus gradient, for first-order work.
//! - **Mapping**: vectors of jets with composition, jacobians and inversion.
//! - **LieOperator**: exponential series and flow maps of vector fields.
//! - **Analysis**: spectrum and symplecticity of a map's linear part.
pub mod analysis;
pub mod environment;
pub mod error;
pub mod functions;
pub mod iter;
pub mod jet;
pub mod lie;
pub mod linear;
pub mod mapping;
pub mod settings;
pub mod term;
pub mod traits;

pub use environment::{Environment, EnvironmentBuilder};
pub use error::{DaError, Result};
pub use iter::{MultiIndexIter, TermIter};
pub use jet::{Jet, JetSnapshot};
pub use lie::LieOperator;
pub use linear::{LinearJet, LinearMapping};
pub use mapping::Mapping;
pub use settings::{InversionSettings, SeriesSettings};
pub use term::{Monomial, MultiIndex, Term};
pub use traits::Coefficient;
