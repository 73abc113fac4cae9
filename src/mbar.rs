use crate::errors::*;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Define the initial guess for free energies
///
/// `InitialFreeEnergies::BAR` works best when the states are ordered such that adjacent states
/// maximize the overlap between states. Its up to the user to arrange the states in such an
/// order, or at least close to such an order. If you are uncertain what the order of states
/// should be, or if it does not make sense to think of states as adjacent, then choose
/// `InitialFreeEnergies::Zeros`.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
    /// Use BAR between each pair of adjacent states to initialize the free energies.
    BAR,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of multiple equilibrium
/// samples.
///
/// The dimensionless free energies $f_k$ are the solution of the self-consistent equations
///
/// $$
///     f_i = -\ln \sum_{n=1}^{N} \frac{\exp(-u_i(x_n))}{\sum_{k=1}^{K} N_k \exp(f_k - u_k(x_n))}
/// $$
///
/// which are solved when the builder is built, fixing $f_0 = 0$. Each iteration takes either a
/// self-consistent step or a Newton-Raphson step on the MBAR likelihood, whichever leaves the
/// smaller gradient. Building fails if the free energies have not converged within
/// `maximum_iterations` iterations.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
/// equilibrium states. J. Chem. Phys. 129:124105, 2008 <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct MBar {
    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    ///
    /// We assume that the states are ordered such that the first `n_k` are from the first state, the
    /// 2nd `n_k` the second state, and so forth. This only becomes important for BAR --- MBAR does
    /// not care which samples are from which state.
    n_k: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Set to determine the relative tolerance convergence criteria
    #[builder(default = "1.0e-6")]
    relative_tolerance: f64,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// Which state is each x from?
    ///
    /// Usually doesn’t matter, but does for BAR. If unset, we assume the samples are in K order
    /// (the first `n_k[0]` samples are from the 0th state, the next `n_k[1]` samples from the
    /// 1st state, and so forth.
    #[builder(setter(strip_option), default)]
    x_kindices: Option<Array1<usize>>,

    /// Set to True if solver progress should be logged at info level
    #[builder(setter(skip), default = "false")]
    verbose: bool,

    /// Solved dimensionless free energies
    #[builder(setter(skip), default)]
    f_k: Array1<f64>,

    /// $\ln \sum_k N_k \exp(f_k - u_k(x_n))$ at the solved free energies
    #[builder(setter(skip), default)]
    log_denominator_n: Array1<f64>,

    /// Number of iterations the solver took
    #[builder(setter(skip), default)]
    iterations: usize,
}

impl MBarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(u_kn), Some(n_k)) = (&self.u_kn, &self.n_k) {
            let k = u_kn.len_of(Axis(0));
            let n_tot = u_kn.len_of(Axis(1));

            if n_tot != n_k.iter().sum() {
                return Err(format!(
                    "n_k.sum() must equal the total number of samples ({})",
                    n_tot
                ));
            }

            if k != n_k.len() {
                return Err(format!(
                    "n_k's length must equal the number of states ({})",
                    k
                ));
            }

            if k == 0 || n_tot == 0 {
                return Err("MBAR needs at least one state and one sample".to_string());
            }

            if let Some(((k, n), _)) = u_kn.indexed_iter().find(|(_, u)| !u.is_finite()) {
                return Err(format!("u_kn[{}, {}] is not finite", k, n));
            }

            if let Some(Some(x_kindices)) = &self.x_kindices {
                if x_kindices.len() != n_tot {
                    return Err(format!(
                        "x_kindices' length must equal the total number of samples ({})",
                        n_tot
                    ));
                }
                if x_kindices.iter().any(|&i| i >= k) {
                    return Err(format!("x_kindices must index the {} states", k));
                }
            }
        }

        Ok(())
    }

    /// Build and solve the MBAR equations, logging progress at info level
    pub fn build_verbose(&self) -> Result<MBar> {
        let mut new = self.build_inner()?;
        new.verbose = true;
        new.init()
    }

    /// Build and solve the MBAR equations
    pub fn build(&self) -> Result<MBar> {
        let mut new = self.build_inner()?;
        new.verbose = false;
        new.init()
    }
}

/// $\ln \sum_i \exp(x_i)$ without overflow
pub(crate) fn logsumexp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.map(|x| (x - max).exp()).sum::<f64>().ln()
}

impl MBar {
    /// Solve the MBAR equations; called by build methods
    fn init(mut self) -> Result<Self> {
        let k = self.k();
        let mut f_k = match &self.initial_free_energies {
            InitialFreeEnergies::Specified(energies) => {
                if energies.len() != k {
                    return Err(AnalysisError::ArrayLengthMismatch(energies.len(), k));
                }
                Array1::from(energies.clone())
            }
            InitialFreeEnergies::Zeros => Array1::zeros(k),
            InitialFreeEnergies::BAR => self.bar_initial_free_energies()?,
        };
        let f_0 = f_k[0];
        f_k.mapv_inplace(|f| f - f_0);

        let level = if self.verbose {
            log::Level::Info
        } else {
            log::Level::Debug
        };

        let mut relative_change = f64::INFINITY;
        for iteration in 1..=self.maximum_iterations {
            let log_denominator_n = self.log_denominator(&f_k);
            let mut f_new = self.self_consistent_update(&log_denominator_n);
            let mut step = "self-consistent";
            if let Some(f_nr) = self.newton_update(&f_k, &log_denominator_n) {
                if self.gradient_norm(&f_nr) < self.gradient_norm(&f_new) {
                    f_new = f_nr;
                    step = "Newton-Raphson";
                }
            }

            if f_new.iter().any(|f| !f.is_finite()) {
                return Err(AnalysisError::Estimation {
                    iterations: iteration,
                    delta: f64::NAN,
                });
            }

            let max_change = (&f_new - &f_k).fold(0.0_f64, |acc, d| acc.max(d.abs()));
            let scale = f_new.fold(1.0_f64, |acc, f| acc.max(f.abs()));
            relative_change = max_change / scale;
            log::log!(
                level,
                "MBAR iteration {}: {} step, relative change {:e}",
                iteration,
                step,
                relative_change
            );

            f_k = f_new;
            if relative_change <= self.relative_tolerance {
                self.log_denominator_n = self.log_denominator(&f_k);
                self.f_k = f_k;
                self.iterations = iteration;
                log::log!(level, "MBAR converged after {} iterations", iteration);
                return Ok(self);
            }
        }

        Err(AnalysisError::Estimation {
            iterations: self.maximum_iterations,
            delta: relative_change,
        })
    }

    /// $\ln \sum_k N_k \exp(f_k - u_k(x_n))$ for every sample
    fn log_denominator(&self, f_k: &Array1<f64>) -> Array1<f64> {
        let log_n_k: Vec<(usize, f64)> = self
            .n_k
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(k, &n)| (k, (n as f64).ln()))
            .collect();

        Array1::from_shape_fn(self.n_tot(), |n| {
            logsumexp(
                log_n_k
                    .iter()
                    .map(|&(k, log_n)| log_n + f_k[k] - self.u_kn[[k, n]]),
            )
        })
    }

    /// One step of the self-consistent iteration, with $f_0 = 0$
    fn self_consistent_update(&self, log_denominator_n: &Array1<f64>) -> Array1<f64> {
        let mut f_k = Array1::from_shape_fn(self.k(), |k| {
            let u_n = self.u_kn.index_axis(Axis(0), k);
            -logsumexp(
                u_n.iter()
                    .zip(log_denominator_n.iter())
                    .map(|(u, log_d)| -u - log_d),
            )
        });
        let f_0 = f_k[0];
        f_k.mapv_inplace(|f| f - f_0);
        f_k
    }

    /// `sum_w[k]` is $\sum_n W_{nk}$ at the free energies `f_k`
    fn weight_sums(&self, f_k: &Array1<f64>, log_denominator_n: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.k(), |k| {
            let u_n = self.u_kn.index_axis(Axis(0), k);
            logsumexp(
                u_n.iter()
                    .zip(log_denominator_n.iter())
                    .map(|(u, log_d)| f_k[k] - u - log_d),
            )
            .exp()
        })
    }

    /// Squared norm of the gradient of the MBAR objective, $N_k (\sum_n W_{nk} - 1)$
    fn gradient_norm(&self, f_k: &Array1<f64>) -> f64 {
        let log_denominator_n = self.log_denominator(f_k);
        self.weight_sums(f_k, &log_denominator_n)
            .iter()
            .zip(self.n_k.iter())
            .map(|(w, &n)| (n as f64 * (w - 1.0)).powi(2))
            .sum()
    }

    /// One Newton-Raphson step with $f_0$ held fixed
    ///
    /// Only taken when every state is sampled; otherwise the Hessian is singular in the
    /// unsampled states and `None` is returned, as it is if the Hessian cannot be inverted.
    fn newton_update(
        &self,
        f_k: &Array1<f64>,
        log_denominator_n: &Array1<f64>,
    ) -> Option<Array1<f64>> {
        let k = self.k();
        if k < 2 || self.n_k.iter().any(|&n| n == 0) {
            return None;
        }

        let n_k = self.n_k.mapv(|n| n as f64);
        let w_kn = Array2::from_shape_fn((k, self.n_tot()), |(k, n)| {
            (f_k[k] - self.u_kn[[k, n]] - log_denominator_n[n]).exp()
        });
        let sum_w = w_kn.sum_axis(Axis(1));
        let gradient = &n_k * &(&sum_w - 1.0);

        let overlap = w_kn.dot(&w_kn.t());
        let hessian = Array2::from_shape_fn((k - 1, k - 1), |(i, j)| {
            let (i, j) = (i + 1, j + 1);
            let diagonal = if i == j { n_k[i] * sum_w[i] } else { 0.0 };
            diagonal - n_k[i] * n_k[j] * overlap[[i, j]]
        });
        let step = solve(hessian, gradient.slice(ndarray::s![1..]).to_owned()).ok()?;

        let mut f_nr = f_k.clone();
        for (i, delta) in step.iter().enumerate() {
            f_nr[i + 1] -= delta;
        }
        Some(f_nr)
    }

    /// The state each sample was drawn from
    fn sample_states(&self) -> Vec<usize> {
        match &self.x_kindices {
            Some(x_kindices) => x_kindices.to_vec(),
            None => self
                .n_k
                .iter()
                .enumerate()
                .flat_map(|(k, &n)| std::iter::repeat(k).take(n))
                .collect(),
        }
    }

    /// Free energies from BAR between each pair of adjacent states
    fn bar_initial_free_energies(&self) -> Result<Array1<f64>> {
        let states = self.sample_states();
        let mut f_k = Array1::zeros(self.k());
        for i in 1..self.k() {
            let work = |from: usize, to: usize| -> Vec<f64> {
                states
                    .iter()
                    .enumerate()
                    .filter(|(_, &k)| k == from)
                    .map(|(n, _)| self.u_kn[[to, n]] - self.u_kn[[from, n]])
                    .collect()
            };
            let w_f = work(i - 1, i);
            let w_r = work(i, i - 1);
            let delta_f = if w_f.is_empty() || w_r.is_empty() {
                0.0
            } else {
                bar(&w_f, &w_r)?
            };
            f_k[i] = f_k[i - 1] + delta_f;
        }

        log::debug!("BAR initial free energies: {}", f_k);
        Ok(f_k)
    }

    /// Get a new builder for the `MBar` struct. `MBar` can only be constructed via the builder.
    pub fn builder() -> MBarBuilder {
        MBarBuilder::default()
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    pub fn u_kn(&self) -> &Array2<f64> {
        &self.u_kn
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// Which state is each x from?
    pub fn x_kindices(&self) -> &Option<Array1<usize>> {
        &self.x_kindices
    }

    /// Number of iterations taken to solve the MBAR equations
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Retrieve a copy of the relative dimensionless free energy $f_k$ of states $k$
    pub fn f_k(&self) -> Array1<f64> {
        self.f_k.clone()
    }

    /// `log_w_kn[[k, n]]` is $\ln W_{nk}$, stored state-major like `u_kn`
    fn log_w_kn(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.k(), self.n_tot()), |(k, n)| {
            self.f_k[k] - self.u_kn[[k, n]] - self.log_denominator_n[n]
        })
    }

    /// Retrieve a copy of the log weight matrix $\ln(W_nk)$
    pub fn log_w_nk(&self) -> Array2<f64> {
        self.log_w_kn().reversed_axes()
    }

    /// Retrieve a copy of the weight matrix $W_nk$
    pub fn w_nk(&self) -> Array2<f64> {
        self.log_w_nk().mapv(f64::exp)
    }

    /// Compute the effective sample number of each state
    ///
    /// The effective sample number $n_\mathrm{eff}(k)$ is an estimate of how many samples are
    /// contributing to the average at a given state.
    ///
    /// # Returns
    ///
    /// `n_eff[k]` is the estimated number of samples contributing to estimates at each
    /// state k. An estimate to how many samples collected just at state k would result
    /// in similar statistical efficiency as the MBAR simulation. Valid for both sampled
    /// states, in which the weight will be greater than `N_k[k]`, and unsampled states.
    ///
    /// # Notes
    ///
    /// Using Kish (1965) formula (Kish, Leslie (1965). Survey Sampling. New York: Wiley)
    ///
    /// As the weights become more concentrated in fewer observations, the effective sample size
    /// shrinks (<http://healthcare-economist.com/2013/08/22/effective-sample-size/>):
    ///
    /// $$
    ///     n_\mathrm{eff}(k)
    ///         =  \frac{(\sum_{n=1}^N w_k n)^2}{\sum_{n=1}^N w_k n^2}
    ///         =  \frac{1}{\sum_{n=1}^N w_k n^2}
    /// $$
    ///
    /// the effective sample number is most useful to diagnose when there are only a few samples
    /// contributing to the averages.
    pub fn n_eff(&self) -> Array1<f64> {
        let w_kn = self.log_w_kn().mapv(f64::exp);
        let n_eff: Array1<f64> = w_kn
            .outer_iter()
            .map(|w_n| w_n.sum().powi(2) / w_n.dot(&w_n))
            .collect();
        for (k, n) in n_eff.iter().enumerate() {
            log::debug!(
                "Effective number of samples at state {}: {:.1} ({} sampled)",
                k,
                n,
                self.n_k[k]
            );
        }
        n_eff
    }

    /// Normalised log weights of every sample at a state with reduced potentials `u_n`
    ///
    /// Also returns the dimensionless free energy of that state relative to $f_0$.
    pub fn log_weights_at(&self, u_n: ArrayView1<'_, f64>) -> Result<(Array1<f64>, f64)> {
        if u_n.len() != self.n_tot() {
            return Err(AnalysisError::ArrayLengthMismatch(u_n.len(), self.n_tot()));
        }

        let mut log_w_n = &u_n.mapv(|u| -u) - &self.log_denominator_n;
        let log_norm = logsumexp(log_w_n.iter().copied());
        log_w_n.mapv_inplace(|w| w - log_norm);
        Ok((log_w_n, -log_norm))
    }

    /// Compute the free energy differences between every pair of states with uncertainties
    ///
    /// `delta_f[[i, j]]` is $f_j - f_i$ and `d_delta_f[[i, j]]` is its uncertainty at one
    /// standard deviation.
    pub fn compute_free_energy_differences(
        &self,
        uncertainty_method: ExpectationsUncertaintyMethod,
    ) -> Result<FreeEnergyDifferences> {
        let k = self.k();
        let w_kn = self.log_w_kn().mapv(f64::exp);
        let covariance = Covariance::new(self, uncertainty_method)?;

        let coordinates: Vec<Array1<f64>> = w_kn
            .outer_iter()
            .map(|w_n| covariance.coordinates(w_n))
            .collect();
        let dots = w_kn.dot(&w_kn.t());
        let theta = Array2::from_shape_fn((k, k), |(i, j)| {
            covariance.theta(dots[[i, j]], &coordinates[i], &coordinates[j])
        });

        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| self.f_k[j] - self.f_k[i]);
        let d_delta_f = Array2::from_shape_fn((k, k), |(i, j)| {
            checked_sqrt(theta[[i, i]] + theta[[j, j]] - 2.0 * theta[[i, j]], 1.0e-10)
        });

        Ok(FreeEnergyDifferences { delta_f, d_delta_f })
    }

    /// Compute the expectation of an observable of a phase space function.
    ///
    /// Compute the expectation of an observable of a single phase space
    /// function A(x) at all states where potentials are generated.
    ///
    /// # Parameters
    ///
    /// `a_n[n]` is $A(x_n)$
    ///
    /// # References
    ///
    /// See Section IV of [1].
    pub fn expectations(
        &self,
        a_n: ArrayView1<'_, f64>,
        params: ExpectationsParams,
    ) -> Result<Expectations> {
        let ExpectationsParams {
            u_kn,
            uncertainty_method,
            warning_cutoff,
        } = params;
        let u_kn = u_kn.as_ref().unwrap_or(&self.u_kn);
        if u_kn.len_of(Axis(1)) != self.n_tot() {
            return Err(AnalysisError::ArrayLengthMismatch(
                u_kn.len_of(Axis(1)),
                self.n_tot(),
            ));
        }
        if a_n.len() != self.n_tot() {
            return Err(AnalysisError::ArrayLengthMismatch(a_n.len(), self.n_tot()));
        }

        let covariance = Covariance::new(self, uncertainty_method)?;
        let mut mu = Array1::zeros(u_kn.len_of(Axis(0)));
        let mut sigma = Array1::zeros(u_kn.len_of(Axis(0)));
        for (l, u_n) in u_kn.outer_iter().enumerate() {
            let (value, uncertainty) =
                self.expectation_inner(a_n, u_n, &covariance, warning_cutoff)?;
            mu[l] = value;
            sigma[l] = uncertainty;
        }

        Ok(Expectations { mu, sigma })
    }

    fn expectation_inner(
        &self,
        a_n: ArrayView1<'_, f64>,
        u_n: ArrayView1<'_, f64>,
        covariance: &Covariance,
        warning_cutoff: f64,
    ) -> Result<(f64, f64)> {
        let (log_w_n, _) = self.log_weights_at(u_n)?;
        let w_n = log_w_n.mapv(f64::exp);

        // Shift A to be strictly positive so it can weight a state
        let a_min = a_n.fold(f64::INFINITY, |acc, &a| acc.min(a));
        let shift = a_min - 1.0;
        let a_shifted = a_n.mapv(|a| a - shift);
        let mean_shifted = w_n.dot(&a_shifted);
        let w_a = &w_n * &a_shifted / mean_shifted;

        let c_t = covariance.coordinates(w_n.view());
        let c_a = covariance.coordinates(w_a.view());
        let theta_tt = covariance.theta(w_n.dot(&w_n), &c_t, &c_t);
        let theta_aa = covariance.theta(w_a.dot(&w_a), &c_a, &c_a);
        let theta_ta = covariance.theta(w_n.dot(&w_a), &c_t, &c_a);

        let variance = mean_shifted.powi(2) * (theta_aa + theta_tt - 2.0 * theta_ta);
        Ok((
            mean_shifted + shift,
            checked_sqrt(variance, warning_cutoff),
        ))
    }

    /// Compute the free energy of occupying a number of bins.
    ///
    /// This implementation computes the expectation of an indicator-function observable for each bin.
    ///
    /// # Parameters
    ///
    /// * `u_n[n]` is the reduced potential energy of snapshot `n` of state `k`
    /// for which the PMF is to be computed.
    ///
    /// * `bin_n[n]` is the bin index of snapshot `n` of state `k` and is in `0..n_bins`
    ///
    /// * `n_bins` is the number of bins
    ///
    /// * `uncertainties` is the method for reporting uncertainties
    ///
    /// # Notes
    ///
    /// - Bins that no sample falls in have no defined free energy; their entries are `None`.
    /// - This method works by computing the free energy of localizing the system to each bin for
    ///   the given potential by aggregating the log weights for the given potential.
    /// - To estimate uncertainties, the N×K weight matrix $W_nk$ is augmented to be N×(K+`n_bins`)
    ///   in order to accomodate the normalized weights of states where the potential is given by
    ///   `u_kn` within each bin and infinite potential outside the bin. The uncertainties with
    ///   respect to the bin of lowest free energy are then computed in the standard way.
    pub fn compute_pmf(
        &self,
        u_n: &[f64],
        bin_n: &[usize],
        n_bins: usize,
        uncertainties: PmfUncertainties,
    ) -> Result<Pmf> {
        if u_n.len() != self.n_tot() {
            return Err(AnalysisError::ArrayLengthMismatch(u_n.len(), self.n_tot()));
        }
        if bin_n.len() != self.n_tot() {
            return Err(AnalysisError::ArrayLengthMismatch(bin_n.len(), self.n_tot()));
        }
        if let Some(&bin) = bin_n.iter().find(|&&bin| bin >= n_bins) {
            return Err(AnalysisError::ArrayLengthMismatch(bin + 1, n_bins));
        }

        let (log_w_n, _) = self.log_weights_at(ArrayView1::from(u_n))?;
        let w_n = log_w_n.mapv(f64::exp);

        let mut p_i = vec![0.0; n_bins];
        let mut occupied = vec![false; n_bins];
        for (&bin, &w) in bin_n.iter().zip(w_n.iter()) {
            p_i[bin] += w;
            occupied[bin] = true;
        }

        let f_raw: Vec<Option<f64>> = p_i
            .iter()
            .zip(occupied.iter())
            .map(|(&p, &occupied)| if occupied && p > 0.0 { Some(-p.ln()) } else { None })
            .collect();
        let f_min = f_raw
            .iter()
            .flatten()
            .fold(f64::INFINITY, |acc, &f| acc.min(f));
        let f_i: Vec<Option<f64>> = f_raw.iter().map(|f| f.map(|f| f - f_min)).collect();

        // Weights of the bin states, augmenting W with one column per bin
        let covariance = Covariance::new(self, ExpectationsUncertaintyMethod::SvdEw)?;
        let s = covariance.w_sn.len_of(Axis(0));
        let mut wt_w_bins = Array2::<f64>::zeros((n_bins, s));
        let mut self_dots = vec![0.0; n_bins];
        let mut target_dots = vec![0.0; n_bins];
        for (n, (&bin, &w)) in bin_n.iter().zip(w_n.iter()).enumerate() {
            if f_raw[bin].is_none() {
                continue;
            }
            let w_bin = w / p_i[bin];
            for j in 0..s {
                wt_w_bins[[bin, j]] += covariance.w_sn[[j, n]] * w_bin;
            }
            self_dots[bin] += w_bin * w_bin;
            target_dots[bin] += w * w_bin;
        }
        let c_bins: Vec<Array1<f64>> = wt_w_bins
            .outer_iter()
            .map(|row| covariance.project(row))
            .collect();
        let theta = |i: usize, j: usize| -> f64 {
            let dot = if i == j { self_dots[i] } else { 0.0 };
            covariance.theta(dot, &c_bins[i], &c_bins[j])
        };
        let d_between = |i: usize, j: usize| -> Option<f64> {
            match (f_raw[i], f_raw[j]) {
                (Some(_), Some(_)) => Some(checked_sqrt(
                    theta(i, i) + theta(j, j) - 2.0 * theta(i, j),
                    1.0e-10,
                )),
                _ => None,
            }
        };

        let mut pmf = Pmf {
            f_i,
            df_i: None,
            df_ij: None,
            p_i,
        };
        match uncertainties {
            PmfUncertainties::FromLowest => {
                let lowest = pmf.f_i.iter().position(|f| *f == Some(0.0));
                pmf.df_i = Some(
                    (0..n_bins)
                        .map(|i| lowest.and_then(|j| d_between(i, j)))
                        .collect(),
                );
            }
            PmfUncertainties::FromSpecified(reference) => {
                if reference >= n_bins || pmf.f_i[reference].is_none() {
                    return Err(AnalysisError::Configuration(format!(
                        "PMF reference bin {} is empty or out of range",
                        reference
                    )));
                }
                pmf.df_i = Some((0..n_bins).map(|i| d_between(i, reference)).collect());
            }
            PmfUncertainties::FromNormalization => {
                let c_t = covariance.coordinates(w_n.view());
                let theta_tt = covariance.theta(w_n.dot(&w_n), &c_t, &c_t);
                pmf.df_i = Some(
                    (0..n_bins)
                        .map(|i| {
                            f_raw[i].map(|_| {
                                let theta_ti = covariance.theta(target_dots[i], &c_t, &c_bins[i]);
                                checked_sqrt(theta(i, i) + theta_tt - 2.0 * theta_ti, 1.0e-10)
                            })
                        })
                        .collect(),
                );
            }
            PmfUncertainties::AllDifferences => {
                pmf.df_ij = Some(
                    (0..n_bins)
                        .map(|i| (0..n_bins).map(|j| d_between(i, j)).collect())
                        .collect(),
                );
            }
        }

        Ok(pmf)
    }
}

/// Square root of a variance, clamping small negative round-off to zero
fn checked_sqrt(variance: f64, warning_cutoff: f64) -> f64 {
    if variance < 0.0 {
        if -variance > warning_cutoff {
            log::warn!(
                "Squared uncertainty is negative and larger in magnitude than {:e}: {:e}",
                warning_cutoff,
                variance
            );
        }
        0.0
    } else {
        variance.sqrt()
    }
}

/// Asymptotic covariance $\Theta$ of the log normalisation constants of weighted states
///
/// For states with weight vectors $w_a$ and $w_b$ over the samples,
///
/// $$
///     \Theta_{ab} = w_a^T \left(I - W N W^T\right)^+ w_b
/// $$
///
/// where $W$ holds the weights of the sampled states. With the eigen decomposition
/// $W^T W = V \Sigma^2 V^T$ this is
/// $w_a \cdot w_b + c_a^T \left[(I - \Sigma V^T N V \Sigma)^+ - I\right] c_b$ with
/// $c = \Sigma^{-1} V^T W^T w$, which only ever decomposes $K \times K$ matrices however many
/// states are added to $W$. See Appendix D.1, Eqs. D4 and D5 of [1].
struct Covariance {
    /// `w_sn[[s, n]]` is the weight of sample `n` in the `s`th sampled state
    w_sn: Array2<f64>,
    /// $\Sigma^{-1} V^T$ over the nonzero singular values
    projection: Array2<f64>,
    /// $(I - \Sigma V^T N V \Sigma)^+ - I$
    kernel: Array2<f64>,
}

impl Covariance {
    fn new(mbar: &MBar, method: ExpectationsUncertaintyMethod) -> Result<Self> {
        let sampled: Vec<usize> = (0..mbar.k()).filter(|&k| mbar.n_k[k] > 0).collect();
        let log_w_kn = mbar.log_w_kn();
        let w_sn = Array2::from_shape_fn((sampled.len(), mbar.n_tot()), |(s, n)| {
            log_w_kn[[sampled[s], n]].exp()
        });

        match method {
            ExpectationsUncertaintyMethod::Approximate => Ok(Self {
                projection: Array2::zeros((0, sampled.len())),
                kernel: Array2::zeros((0, 0)),
                w_sn,
            }),
            ExpectationsUncertaintyMethod::SvdEw => {
                let gram = w_sn.dot(&w_sn.t());
                let (s2, v) = symmetric_eigen(&gram);
                let s2_max = s2.fold(0.0_f64, |acc, &x| acc.max(x));
                let kept: Vec<usize> = (0..s2.len())
                    .filter(|&i| s2[i] > s2_max * 1.0e-12)
                    .collect();
                let r = kept.len();
                let sigma: Vec<f64> = kept.iter().map(|&i| s2[i].sqrt()).collect();
                let n_s: Vec<f64> = sampled.iter().map(|&k| mbar.n_k[k] as f64).collect();

                let inner = Array2::from_shape_fn((r, r), |(i, j)| {
                    let vnv: f64 = (0..sampled.len())
                        .map(|a| v[[a, kept[i]]] * n_s[a] * v[[a, kept[j]]])
                        .sum();
                    let identity = if i == j { 1.0 } else { 0.0 };
                    identity - sigma[i] * sigma[j] * vnv
                });
                let kernel = pseudoinverse(&inner)? - Array2::<f64>::eye(r);
                let projection =
                    Array2::from_shape_fn((r, sampled.len()), |(i, a)| v[[a, kept[i]]] / sigma[i]);

                Ok(Self {
                    w_sn,
                    projection,
                    kernel,
                })
            }
        }
    }

    /// $c = \Sigma^{-1} V^T (W^T w)$ given $W^T w$
    fn project(&self, wt_w: ArrayView1<'_, f64>) -> Array1<f64> {
        self.projection.dot(&wt_w)
    }

    /// $c$ of a state with weight vector `w_n`
    fn coordinates(&self, w_n: ArrayView1<'_, f64>) -> Array1<f64> {
        self.project(self.w_sn.dot(&w_n).view())
    }

    /// $\Theta_{ab}$ given $w_a \cdot w_b$ and the coordinates of both states
    fn theta(&self, dot: f64, c_a: &Array1<f64>, c_b: &Array1<f64>) -> f64 {
        dot + c_a.dot(&self.kernel.dot(c_b))
    }
}

fn to_dmatrix(matrix: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
}

fn from_dmatrix(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(matrix.shape(), |(i, j)| matrix[(i, j)])
}

/// Eigen decomposition of a symmetric matrix
///
/// Returns the eigenvalues, in no particular order, and a matrix whose columns are the matching
/// eigenvectors.
pub(crate) fn symmetric_eigen(matrix: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let eigen = SymmetricEigen::new(to_dmatrix(matrix));
    (
        eigen.eigenvalues.iter().copied().collect(),
        from_dmatrix(&eigen.eigenvectors),
    )
}

/// Pseudo-inverse of a matrix, dropping singular values below `1e-10`
fn pseudoinverse(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let inverse = to_dmatrix(matrix)
        .pseudo_inverse(1.0e-10)
        .map_err(|_| AnalysisError::Singular("pseudo-inverting the covariance kernel"))?;
    Ok(from_dmatrix(&inverse))
}

/// Solve `a x = b` by LU decomposition with partial pivoting
fn solve(a: Array2<f64>, b: Array1<f64>) -> Result<Array1<f64>> {
    let b = DVector::from_iterator(b.len(), b.iter().copied());
    let x = to_dmatrix(&a)
        .lu()
        .solve(&b)
        .ok_or(AnalysisError::Singular("solving for the Newton-Raphson step"))?;
    Ok(x.iter().copied().collect())
}

/// Bennett acceptance ratio estimate of the free energy difference between two states
///
/// `w_f` holds the forward work $u_1(x) - u_0(x)$ of samples from state 0 and `w_r` the
/// reverse work $u_0(x) - u_1(x)$ of samples from state 1. The root of the BAR equation is
/// found by bisection.
///
/// # References
///
/// 1. Bennett CH. Efficient estimation of free energy differences from Monte Carlo data.
/// J. Comput. Phys. 22:245, 1976.
pub fn bar(w_f: &[f64], w_r: &[f64]) -> Result<f64> {
    if w_f.is_empty() || w_r.is_empty() {
        return Err(AnalysisError::ArrayLengthMismatch(0, 1));
    }
    let m = (w_f.len() as f64 / w_r.len() as f64).ln();

    // Fermi function 1 / (1 + e^x) without overflow
    let fermi = |x: f64| {
        if x > 0.0 {
            let e = (-x).exp();
            e / (1.0 + e)
        } else {
            1.0 / (1.0 + x.exp())
        }
    };
    // Increasing in delta_f
    let imbalance = |delta_f: f64| -> f64 {
        w_f.iter().map(|w| fermi(m + w - delta_f)).sum::<f64>()
            - w_r.iter().map(|w| fermi(-m + w + delta_f)).sum::<f64>()
    };

    let mut lo = -1.0;
    let mut hi = 1.0;
    let mut expansions = 0;
    while imbalance(lo) > 0.0 || imbalance(hi) < 0.0 {
        if expansions == 64 {
            return Err(AnalysisError::Estimation {
                iterations: expansions,
                delta: f64::NAN,
            });
        }
        lo *= 2.0;
        hi *= 2.0;
        expansions += 1;
    }

    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if imbalance(mid) < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1.0e-12 * mid.abs().max(1.0) {
            break;
        }
    }

    Ok(0.5 * (lo + hi))
}

/// Method for reporting uncertainties for PMFs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PmfUncertainties {
    /// The uncertainties in the free energy difference with lowest point on PMF are reported
    FromLowest,
    /// The uncertainties in the free energy difference with the specified bin are reported
    FromSpecified(usize),
    /// The normalization $\sum_i p_i = 1$ is used to determine uncertainties spread out through the
    /// PMF
    FromNormalization,
    /// The nbins × nbins matrix $df_ij$ of uncertainties in free energy differences is returned
    /// instead of $df_i$.
    AllDifferences,
}

impl Default for PmfUncertainties {
    fn default() -> Self {
        Self::FromLowest
    }
}

/// A Potential of Mean Force
#[derive(Debug, Clone, PartialEq)]
pub struct Pmf {
    /// `f_i[i]` is the dimensionless free energy of bin `i`, relative to the bin of lowest free
    /// energy, or `None` if no sample fell in the bin
    pub f_i: Vec<Option<f64>>,
    /// `df_i[i]` is the uncertainty in the difference of `f_i` for uncertainty options other than AllDifferences
    pub df_i: Option<Vec<Option<f64>>>,
    /// `df_ij[i][j]` is the uncertainty in the difference of `f_i` for AllDifferences
    pub df_ij: Option<Vec<Vec<Option<f64>>>>,
    /// `p_i[i]` is the reweighted probability of bin `i`; the probabilities sum to one
    pub p_i: Vec<f64>,
}

/// Method to use to compute uncertainty for expectations
///
/// Method used to compute the asymptotic covariance matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpectationsUncertaintyMethod {
    /// Use fast approximate expression from Kong et al.
    ///
    /// This underestimates the true covariance, but may be a good approximation in some cases and
    /// requires no matrix inversions
    Approximate,
    /// Use eigenvalue decomposition of W'W in a SVD-based approach to efficiently compute uncertainty
    ///
    /// The eigenvalue decomposition of W'W is used to forego computing the SVD.
    /// See Appendix D.1, Eqs. D4 and D5 of [1].
    SvdEw,
}

/// Parameters for computing expectation values
#[derive(Debug)]
pub struct ExpectationsParams {
    /// `u_kn[k, n]` is the reduced potential of configuration n at state k
    ///
    /// If None (the default) use MBar.u_kn
    pub u_kn: Option<Array2<f64>>,
    /// How to compute uncertainties. Default is SvdEw
    pub uncertainty_method: ExpectationsUncertaintyMethod,
    /// Warn if squared-uncertainty is negative and larger in magnitude than this number (default: 1.0e-10)
    pub warning_cutoff: f64,
}

impl Default for ExpectationsParams {
    fn default() -> Self {
        Self {
            u_kn: None,
            uncertainty_method: ExpectationsUncertaintyMethod::SvdEw,
            warning_cutoff: 1.0e-10,
        }
    }
}

/// Expectations for a value
#[derive(Debug)]
pub struct Expectations {
    /// `mu[i]` is the estimate for the expectation of $A(x)$ for thermodynamic state `i`.
    pub mu: Array1<f64>,
    /// `sigma[i]` is the uncertainty estimate at one standard deviation for mu[i]
    pub sigma: Array1<f64>,
}

/// Free energy differences between every pair of states
#[derive(Debug)]
pub struct FreeEnergyDifferences {
    /// `delta_f[i, j]` is the dimensionless free energy difference $f_j - f_i$
    pub delta_f: Array2<f64>,
    /// `d_delta_f[i, j]` is the uncertainty in the dimensionless free energy difference $f_j - f_i$
    pub d_delta_f: Array2<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsystems::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn small_mbar() -> MBar {
        MBar::builder()
            .u_kn(array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ])
            .n_k(array![2, 2, 2])
            .build()
            .unwrap()
    }

    #[test]
    fn build_mbar() {
        let mbar = MBar::builder()
            .u_kn(array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ])
            .n_k(array![2, 2, 2])
            .build_inner()
            .unwrap();

        assert_eq!(
            mbar.u_kn,
            array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ]
        );
        assert_eq!(mbar.n_k, array![2, 2, 2]);
        assert_eq!(mbar.maximum_iterations, 1000);
        assert_eq!(mbar.relative_tolerance, 1.0e-6);
        assert_eq!(mbar.verbose, false);
        assert_eq!(mbar.initial_free_energies, InitialFreeEnergies::Zeros);
        assert_eq!(mbar.x_kindices, None);
    }

    #[test]
    fn builder_rejects_inconsistent_counts() {
        let result = MBar::builder()
            .u_kn(array![[1.0, 2.0, 3.0], [1.5, 2.5, 3.5]])
            .n_k(array![2, 2])
            .build();
        assert!(matches!(result, Err(AnalysisError::BuilderError(_))));

        let result = MBar::builder()
            .u_kn(array![[1.0, f64::NAN], [1.5, 2.5]])
            .n_k(array![1, 1])
            .build();
        assert!(matches!(result, Err(AnalysisError::BuilderError(_))));
    }

    #[test]
    fn solution_satisfies_self_consistent_equations() {
        let mbar = small_mbar();
        let f_k = mbar.f_k();
        assert_eq!(f_k[0], 0.0);

        let log_denominator_n = mbar.log_denominator(&f_k);
        let f_sc = mbar.self_consistent_update(&log_denominator_n);
        for (f, f_sc) in f_k.iter().zip(f_sc.iter()) {
            assert_abs_diff_eq!(f, f_sc, epsilon = 1.0e-5);
        }

        // Weights of every state are normalised
        let w_nk = mbar.w_nk();
        for sum in w_nk.sum_axis(Axis(0)).iter() {
            assert_abs_diff_eq!(*sum, 1.0, epsilon = 1.0e-5);
        }
    }

    #[test]
    fn identical_states_have_equal_free_energies() {
        let u_n = array![0.3, 1.2, 2.2, 0.7, 1.9, 0.1];
        let mut u_kn = Array2::zeros((3, 6));
        for mut row in u_kn.outer_iter_mut() {
            row.assign(&u_n);
        }
        let mbar = MBar::builder()
            .u_kn(u_kn)
            .n_k(array![2, 2, 2])
            .build()
            .unwrap();
        for f in mbar.f_k().iter() {
            assert_abs_diff_eq!(*f, 0.0, epsilon = 1.0e-8);
        }
    }

    #[test]
    fn harmonic_oscillator_free_energies() {
        let testcase = HarmonicOscillator::default();
        let Sample { u_kn, n_k, .. } = testcase
            .sample_with_seed(array![500, 500, 500, 500, 500], 1)
            .unwrap();
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();

        let analytical = testcase.analytical_free_energies();
        let differences = mbar
            .compute_free_energy_differences(ExpectationsUncertaintyMethod::SvdEw)
            .unwrap();
        for k in 1..mbar.k() {
            let expected = analytical[k] - analytical[0];
            let error = differences.delta_f[[0, k]] - expected;
            let sigma = differences.d_delta_f[[0, k]];
            assert!(sigma > 0.0 && sigma < 0.2);
            assert!(error.abs() < 5.0 * sigma, "state {}: error {}", k, error);
        }
        assert_eq!(differences.d_delta_f[[2, 2]], 0.0);
    }

    #[test]
    fn many_nearly_identical_states() {
        let k = 30;
        let testcase = HarmonicOscillatorBuilder::default()
            .o_k(Array1::from_shape_fn(k, |i| i as f64 * 1.0e-3))
            .k_k(Array1::from_elem(k, 1.0))
            .build()
            .unwrap();
        let Sample { u_kn, n_k, .. } = testcase
            .sample_with_seed(Array1::from_elem(k, 50), 11)
            .unwrap();
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();

        let differences = mbar
            .compute_free_energy_differences(ExpectationsUncertaintyMethod::SvdEw)
            .unwrap();
        for j in 0..k {
            assert!(differences.d_delta_f[[0, j]].is_finite());
            assert!(differences.d_delta_f[[0, j]] < 0.1);
            assert_abs_diff_eq!(differences.delta_f[[0, j]], 0.0, epsilon = 0.1);
        }
    }

    #[test]
    fn initial_guesses_reach_the_same_solution() {
        let testcase = HarmonicOscillator::default();
        let Sample { u_kn, n_k, s_n, .. } = testcase
            .sample_with_seed(array![100, 100, 100, 100, 100], 4)
            .unwrap();

        let zeros = MBar::builder()
            .u_kn(u_kn.clone())
            .n_k(n_k.clone())
            .build()
            .unwrap();
        let bar = MBar::builder()
            .u_kn(u_kn.clone())
            .n_k(n_k.clone())
            .x_kindices(s_n)
            .initial_free_energies(InitialFreeEnergies::BAR)
            .build()
            .unwrap();
        let specified = MBar::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .initial_free_energies(InitialFreeEnergies::from(&[0.0, 0.3, 0.6, 0.9, 1.2][..]))
            .build()
            .unwrap();

        for k in 0..5 {
            assert_abs_diff_eq!(zeros.f_k()[k], bar.f_k()[k], epsilon = 1.0e-4);
            assert_abs_diff_eq!(zeros.f_k()[k], specified.f_k()[k], epsilon = 1.0e-4);
        }
    }

    #[test]
    fn unconverged_solutions_are_errors() {
        let result = MBar::builder()
            .u_kn(array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ])
            .n_k(array![2, 2, 2])
            .maximum_iterations(1)
            .relative_tolerance(1.0e-14)
            .build();
        assert!(matches!(result, Err(AnalysisError::Estimation { .. })));
    }

    #[test]
    fn bar_recovers_shifted_gaussians() {
        // Work distributions of two harmonic wells with equal force constants are symmetric
        // about the free energy difference, which is zero here.
        let w_f = [0.5, 1.0, -0.2, 0.8, 0.1];
        let w_r = [0.5, 1.0, -0.2, 0.8, 0.1];
        assert_abs_diff_eq!(bar(&w_f, &w_r).unwrap(), 0.0, epsilon = 1.0e-9);

        // Shifting the reduced potential of state 1 by a constant shifts the free energy
        let w_f: Vec<f64> = w_f.iter().map(|w| w + 2.0).collect();
        let w_r: Vec<f64> = w_r.iter().map(|w| w - 2.0).collect();
        assert_abs_diff_eq!(bar(&w_f, &w_r).unwrap(), 2.0, epsilon = 1.0e-9);
    }

    #[test]
    fn expectations_of_positions() {
        let testcase = HarmonicOscillator::default();
        let Sample { x_n, u_kn, n_k, .. } = testcase
            .sample_with_seed(array![400, 400, 400, 400, 400], 9)
            .unwrap();
        let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();

        let expectations = mbar
            .expectations(x_n.view(), ExpectationsParams::default())
            .unwrap();
        let approximate = mbar
            .expectations(
                x_n.view(),
                ExpectationsParams {
                    uncertainty_method: ExpectationsUncertaintyMethod::Approximate,
                    ..Default::default()
                },
            )
            .unwrap();
        let means = testcase.analytical_means();
        for k in 0..mbar.k() {
            let sigma = expectations.sigma[k];
            assert!(sigma > 0.0 && sigma < 0.2);
            assert!((expectations.mu[k] - means[k]).abs() < 5.0 * sigma);
            assert_abs_diff_eq!(expectations.mu[k], approximate.mu[k], epsilon = 1.0e-12);
        }
    }

    #[test]
    fn expectation_at_an_extra_state() {
        let mbar = small_mbar();
        let a_n = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let u_n = mbar.u_kn().index_axis(Axis(0), 1).to_owned();
        let extra = mbar
            .expectations(
                a_n.view(),
                ExpectationsParams {
                    u_kn: Some(u_n.insert_axis(Axis(0))),
                    ..Default::default()
                },
            )
            .unwrap();
        let all = mbar
            .expectations(a_n.view(), ExpectationsParams::default())
            .unwrap();
        assert_eq!(extra.mu.len(), 1);
        assert_abs_diff_eq!(extra.mu[0], all.mu[1], epsilon = 1.0e-12);
        assert_abs_diff_eq!(extra.sigma[0], all.sigma[1], epsilon = 1.0e-9);
    }

    #[test]
    fn pmf_marks_empty_bins_undefined() {
        let mbar = small_mbar();
        let u_n = mbar.u_kn().index_axis(Axis(0), 0).to_vec();
        let bin_n = [0, 1, 0, 3, 1, 0];

        let pmf = mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::FromLowest)
            .unwrap();
        assert_eq!(pmf.f_i[2], None);
        assert!(pmf.f_i.iter().flatten().all(|f| f.is_finite() && *f >= 0.0));
        assert!(pmf.f_i.contains(&Some(0.0)));
        assert_abs_diff_eq!(pmf.p_i.iter().sum::<f64>(), 1.0, epsilon = 1.0e-12);
        let df_i = pmf.df_i.unwrap();
        assert_eq!(df_i[2], None);
        let lowest = pmf.f_i.iter().position(|f| *f == Some(0.0)).unwrap();
        assert_eq!(df_i[lowest], Some(0.0));

        let pmf = mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::AllDifferences)
            .unwrap();
        let df_ij = pmf.df_ij.unwrap();
        assert_eq!(df_ij[0][2], None);
        assert_eq!(df_ij[0][1], df_ij[1][0]);

        assert!(mbar
            .compute_pmf(&u_n, &bin_n, 4, PmfUncertainties::FromSpecified(2))
            .is_err());
        assert!(mbar
            .compute_pmf(&u_n, &bin_n, 3, PmfUncertainties::FromLowest)
            .is_err());
    }

    #[test]
    fn eigen_decomposition_reconstructs_matrix() {
        let matrix = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]];
        let (lambda, v) = symmetric_eigen(&matrix);
        let reconstructed = v.dot(&Array2::from_diag(&lambda)).dot(&v.t());
        for (a, b) in matrix.iter().zip(reconstructed.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1.0e-10);
        }
        let identity = v.t().dot(&v);
        for ((i, j), x) in identity.indexed_iter() {
            assert_abs_diff_eq!(*x, if i == j { 1.0 } else { 0.0 }, epsilon = 1.0e-10);
        }
    }

    #[test]
    fn linear_solve() {
        let a = array![[0.0, 2.0], [3.0, 1.0]];
        let x = solve(a, array![4.0, 5.0]).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1.0e-12);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1.0e-12);
        assert!(solve(array![[1.0, 2.0], [2.0, 4.0]], array![1.0, 2.0]).is_err());
    }
}
