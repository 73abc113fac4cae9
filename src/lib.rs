#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! Reweighting of replica exchange Monte Carlo output with the multistate Bennett acceptance
//! ratio (MBAR) method.
//!
//! A simulation samples a set of thermodynamic states, the conditions: temperatures, staple
//! concentrations and bias potentials. The output of every run is read, stripped of its
//! equilibration segment and subsampled to uncorrelated samples, and the samples of every
//! condition are pooled and reweighted to compute free energies, expectation values and
//! potentials of mean force at any condition.
//!
//! # Examples
//!
//! ```no_run
//! use remc_mbar::conditions::*;
//! use remc_mbar::report::*;
//!
//! # fn main() -> remc_mbar::errors::Result<()> {
//! let space = ConditionSpace::new(
//!     vec![ConditionAxis::new(TEMP_AXIS, vec![300.0, 310.0, 320.0])],
//!     ConditionsFileformatter::new(vec![FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain)]),
//! )?;
//! let config = AnalysisConfigBuilder::default()
//!     .filebase("inputs/origami")
//!     .output_filebase("outputs/origami")
//!     .pmf_tags(vec!["numstackedpairs".to_string()])
//!     .build()?;
//! let report = Analysis::new(space, config).run()?;
//! println!("{}", report.offsets.f_k);
//! # Ok(())
//! # }
//! ```
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
//! equilibrium states. J. Chem. Phys. 129:124105, 2008. <http://dx.doi.org/10.1063/1.2978177>

#[macro_use]
extern crate derive_builder;

pub mod biases;
pub mod conditions;
pub mod decorrelate;
pub mod errors;
pub mod mbar;
pub mod outputs;
pub mod report;
pub mod reweight;
pub mod testsystems;

pub use errors::{AnalysisError, Result};
pub use mbar::{MBar, PmfUncertainties};
