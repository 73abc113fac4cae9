//! Synthetic systems with analytically known free energies, for testing the estimators.

use crate::errors::*;
use crate::outputs::{run_filepath, SimRun, ENERGY_KIND, ORDER_PARAMS_KIND};
use ndarray::{array, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal};
use std::path::Path;

/// Test cases using harmonic oscillators.
///
/// State $k$ has reduced potential $u_k(x) = \frac{\beta K_k}{2} (x - O_k)^2$, so samples are
/// normally distributed about $O_k$ with variance $1 / (\beta K_k)$.
///
/// # Examples
///
/// Generate energy samples with default parameters.
///
/// ```
/// use remc_mbar::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::default();
/// let Sample {x_n, u_kn, n_k, s_n} = testcase.sample(array![10, 20, 30, 40, 50]).unwrap();
/// assert_eq!(x_n.len(), 150);
/// assert_eq!(u_kn.shape(), &[5, 150]);
/// assert_eq!(s_n[10], 1);
/// ```
///
/// Retrieve analytical properties.
///
/// ```
/// # use remc_mbar::testsystems::*;
/// let testcase = HarmonicOscillator::default();
/// let analytical_means = testcase.analytical_means();
/// let analytical_free_energies = testcase.analytical_free_energies();
/// assert_eq!(analytical_means[2], 2.0);
/// ```
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state.
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(o_k), Some(k_k)) = (&self.o_k, &self.k_k) {
            if o_k.len() != k_k.len() {
                return Err(format!(
                    "o_k and k_k must have equal lengths (not {} and {})",
                    o_k.len(),
                    k_k.len()
                ));
            }
        }
        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| k <= 0.0) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(beta) = self.beta {
            if beta <= 0.0 {
                return Err(format!("beta must be positive (not {})", beta));
            }
        }

        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<HarmonicOscillator> {
        Ok(self.build_inner()?)
    }
}

impl HarmonicOscillator {
    /// Get a new builder for the `HarmonicOscillator` struct.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// Number of states
    pub fn k(&self) -> usize {
        self.o_k.len()
    }

    /// Dimensionless free energy of every state, $-\frac{1}{2} \ln \frac{2 \pi}{\beta K_k}$
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        self.k_k
            .mapv(|k| -0.5 * (2.0 * std::f64::consts::PI / (self.beta * k)).ln())
    }

    /// Mean position at every state
    pub fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    /// Variance of the position at every state
    pub fn analytical_variances(&self) -> Array1<f64> {
        self.k_k.mapv(|k| 1.0 / (self.beta * k))
    }

    /// Reduced potential of position `x` at state `k`
    pub fn reduced_potential(&self, k: usize, x: f64) -> f64 {
        0.5 * self.beta * self.k_k[k] * (x - self.o_k[k]).powi(2)
    }

    /// Draw samples from the distribution with a random seed
    pub fn sample(&self, n_k: Array1<usize>) -> Result<Sample> {
        self.sample_inner(n_k, StdRng::from_entropy())
    }

    /// Draw samples from the distribution with a specified seed
    pub fn sample_with_seed(&self, n_k: Array1<usize>, seed: u64) -> Result<Sample> {
        self.sample_inner(n_k, StdRng::seed_from_u64(seed))
    }

    fn sample_inner(&self, n_k: Array1<usize>, mut rng: StdRng) -> Result<Sample> {
        if n_k.len() != self.k() {
            return Err(AnalysisError::ArrayLengthMismatch(n_k.len(), self.k()));
        }

        let n_tot = n_k.sum();
        let mut x_n = Array1::zeros(n_tot);
        let mut s_n = Array1::zeros(n_tot);
        let mut n = 0;
        for (k, &count) in n_k.iter().enumerate() {
            let sigma = (1.0 / (self.beta * self.k_k[k])).sqrt();
            let normal = Normal::new(self.o_k[k], sigma)
                .map_err(|e| AnalysisError::Configuration(e.to_string()))?;
            for _ in 0..count {
                x_n[n] = normal.sample(&mut rng);
                s_n[n] = k;
                n += 1;
            }
        }

        let u_kn = Array2::from_shape_fn((self.k(), n_tot), |(k, n)| {
            self.reduced_potential(k, x_n[n])
        });

        Ok(Sample {
            x_n,
            u_kn,
            n_k,
            s_n,
        })
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("HarmonicOscillator should not fail with default params")
    }
}

/// A sample from a test case
#[derive(Debug)]
pub struct Sample {
    /// `x_n[n]` is sample n (in concatenated indexing)
    pub x_n: Array1<f64>,
    /// `u_kn[k,n]` is the reduced potential of sample n (in concatenated indexing) evaluated at state k.
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
    /// `s_n[k]` is the state of origin of `x_n[k]`
    pub s_n: Array1<usize>,
}

/// A system whose density of states is $\Omega(E) \propto E^{a - 1}$
///
/// At temperature $T$ the energy is gamma distributed with shape $a$ and scale $T$, and the
/// dimensionless free energy is $f(T) = -a \ln T$ up to a constant. Energies are in units of
/// $k_B K$, matching the total energies of the lattice engine.
///
/// Each sample also records an energy level, $\lfloor E / w \rfloor$ for a level width $w$, as a
/// discrete order parameter that depends on the configuration alone.
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct GammaDensityOfStates {
    /// Shape $a$ of the energy distribution
    #[builder(default = "4.0")]
    shape: f64,

    /// Width of the energy levels recorded as an order parameter
    #[builder(default = "500.0")]
    level_width: f64,

    /// Tag the energy is written under
    #[builder(setter(into), default = "\"tenergy\".to_string()")]
    energy_tag: String,

    /// Tag the energy level is written under
    #[builder(setter(into), default = "\"energylevel\".to_string()")]
    level_tag: String,

    /// Monte Carlo steps between samples
    #[builder(default = "1000")]
    step_interval: i64,
}

impl GammaDensityOfStatesBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(shape) = self.shape {
            if shape <= 0.0 {
                return Err(format!("shape must be positive (not {})", shape));
            }
        }
        if let Some(level_width) = self.level_width {
            if level_width <= 0.0 {
                return Err(format!("level_width must be positive (not {})", level_width));
            }
        }

        Ok(())
    }

    /// Build the test system
    pub fn build(&self) -> Result<GammaDensityOfStates> {
        Ok(self.build_inner()?)
    }
}

impl Default for GammaDensityOfStates {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("GammaDensityOfStates should not fail with default params")
    }
}

impl GammaDensityOfStates {
    /// Get a new builder for the `GammaDensityOfStates` struct.
    pub fn builder() -> GammaDensityOfStatesBuilder {
        GammaDensityOfStatesBuilder::default()
    }

    #[allow(missing_docs)]
    pub fn shape(&self) -> f64 {
        self.shape
    }

    /// Dimensionless free energy at `temp`, relative to an arbitrary constant
    pub fn analytical_free_energy(&self, temp: f64) -> f64 {
        -self.shape * temp.ln()
    }

    /// Mean energy at `temp`
    pub fn analytical_mean_energy(&self, temp: f64) -> f64 {
        self.shape * temp
    }

    /// Energy level of a configuration with energy `energy`
    pub fn level(&self, energy: f64) -> f64 {
        (energy / self.level_width).floor()
    }

    /// Draw `n` independent energies at `temp`
    pub fn sample_energies<R: Rng>(&self, temp: f64, n: usize, rng: &mut R) -> Result<Array1<f64>> {
        let gamma =
            Gamma::new(self.shape, temp).map_err(|e| AnalysisError::Configuration(e.to_string()))?;
        Ok((0..n).map(|_| gamma.sample(rng)).collect())
    }

    /// Simulate one run at `temp`, recording the energy and energy level of every sample
    pub fn simulate(
        &self,
        condition: usize,
        token: &str,
        rep: usize,
        temp: f64,
        n: usize,
        seed: u64,
    ) -> Result<SimRun> {
        let mut rng = StdRng::seed_from_u64(seed);
        let energies = self.sample_energies(temp, n, &mut rng)?;
        let steps: Vec<i64> = (0..n as i64).map(|i| i * self.step_interval).collect();
        let values = Array2::from_shape_fn((n, 2), |(i, j)| match j {
            0 => energies[i],
            _ => self.level(energies[i]),
        });

        SimRun::new(
            condition,
            token,
            rep,
            steps,
            vec![self.energy_tag.clone(), self.level_tag.clone()],
            values,
        )
    }

    /// Simulate one run and write its energy and order parameter tables where the output
    /// reader looks for them
    #[allow(clippy::too_many_arguments)]
    pub fn write_outputs(
        &self,
        filebase: &Path,
        condition: usize,
        token: &str,
        rep: usize,
        temp: f64,
        n: usize,
        seed: u64,
    ) -> Result<()> {
        let run = self.simulate(condition, token, rep, temp, n, seed)?;
        for (kind, tag) in [(ENERGY_KIND, &self.energy_tag), (ORDER_PARAMS_KIND, &self.level_tag)] {
            let table = SimRun::new(
                condition,
                token,
                rep,
                run.steps().to_vec(),
                vec![tag.clone()],
                run.series(tag)?.values.to_owned().insert_axis(Axis(1)),
            )?;
            table.write(&run_filepath(filebase, token, rep, kind))?;
        }

        Ok(())
    }
}
