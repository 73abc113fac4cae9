//! Reweighting the pooled samples of every condition to any target condition.
//!
//! The decorrelated runs of all conditions are pooled in condition order, the reduced potential
//! of every sample is evaluated at every condition, and MBAR combines them into free energies,
//! expectations and potentials of mean force.

use crate::conditions::{staple_chemical_potential, Condition, ConditionSpace};
use crate::decorrelate::{DecorrelatedRun, Decorrelation};
use crate::errors::*;
use crate::mbar::{
    ExpectationsParams, ExpectationsUncertaintyMethod, InitialFreeEnergies, MBar, Pmf,
    PmfUncertainties,
};
use itertools::Itertools;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};

/// How the reduced potential of a sample is evaluated at a condition
///
/// $$
///     u_k(x_n) = \frac{E_n + b_k(x_n)}{T_k} - N_n \ln\left(c_k N_A V \cdot 10^3\right)
/// $$
///
/// where $E_n$ is the energy under `energy_tag`, $b_k$ the bias of condition $k$ and $N_n$ the
/// number of staples under `staple_tag`. The staple term is only included when both
/// `staple_tag` and `lattice_site_volume` are set.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct PotentialSettings {
    /// Tag of the total energy, in units of $k_B K$
    #[builder(setter(into), default = "\"tenergy\".to_string()")]
    pub energy_tag: String,

    /// Tag of the number of bound staples
    #[builder(setter(into, strip_option), default)]
    pub staple_tag: Option<String>,

    /// Volume of a lattice site (m³)
    #[builder(setter(strip_option), default)]
    pub lattice_site_volume: Option<f64>,
}

impl PotentialSettingsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        let staple_tag = self.staple_tag.as_ref().and_then(Option::as_ref);
        let volume = self.lattice_site_volume.flatten();
        match (staple_tag, volume) {
            (Some(_), None) | (None, Some(_)) => Err(
                "staple_tag and lattice_site_volume must be given together".to_string(),
            ),
            (_, Some(volume)) if volume <= 0.0 => Err(format!(
                "lattice_site_volume must be positive (not {})",
                volume
            )),
            _ => Ok(()),
        }
    }
}

impl Default for PotentialSettings {
    fn default() -> Self {
        PotentialSettingsBuilder::default()
            .build()
            .expect("PotentialSettings should not fail with default params")
    }
}

impl PotentialSettings {
    /// Reduced potential of every pooled sample at `condition`
    ///
    /// Entries may be non-finite if the recorded values are; callers check.
    pub fn reduced_potentials(
        &self,
        condition: &Condition,
        pooled: &PooledSamples,
    ) -> Result<Array1<f64>> {
        let temp = condition.temp();
        let mut u_n = pooled.series(&self.energy_tag)?.mapv(|e| e / temp);

        let bias = condition.bias();
        if let Some(tag) = bias.order_parameter_tag() {
            let op_n = pooled.series(tag)?;
            u_n.zip_mut_with(&op_n, |u, &op| *u += bias.energy(op) / temp);
        }

        if let (Some(tag), Some(volume)) = (&self.staple_tag, self.lattice_site_volume) {
            let staple_m = condition.staple_m().ok_or_else(|| {
                AnalysisError::Configuration(format!(
                    "condition {} has no staple concentration for the staple term",
                    condition
                ))
            })?;
            let mu = staple_chemical_potential(staple_m, volume);
            let staples_n = pooled.series(tag)?;
            u_n.zip_mut_with(&staples_n, |u, &staples| *u -= staples * mu);
        }

        Ok(u_n)
    }
}

/// Where the samples of one run ended up in the pool
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Index of the condition in its space
    pub condition: usize,
    /// File token of the condition
    pub token: String,
    #[allow(missing_docs)]
    pub rep: usize,
    /// Cutoff and inefficiency the run was subsampled with
    pub decorrelation: Decorrelation,
    /// Number of samples the run contributed
    pub retained: usize,
}

/// The decorrelated samples of every run, concatenated in condition then rep order
#[derive(Debug, Clone)]
pub struct PooledSamples {
    tags: Vec<String>,
    values: Array2<f64>,
    n_k: Array1<usize>,
    origin: Array1<usize>,
    runs: Vec<RunSummary>,
}

impl PooledSamples {
    /// Pool decorrelated runs of the conditions of `space`
    ///
    /// The tags of the first run (after ordering) are pooled; every other run must record them
    /// too. Conditions without runs contribute no samples.
    pub fn pool(space: &ConditionSpace, mut runs: Vec<DecorrelatedRun>) -> Result<Self> {
        if runs.is_empty() {
            return Err(AnalysisError::Configuration(
                "no runs to pool".to_string(),
            ));
        }
        runs.sort_by_key(|run| (run.condition(), run.rep()));
        if let Some(run) = runs.iter().find(|run| run.condition() >= space.len()) {
            return Err(AnalysisError::Configuration(format!(
                "run of condition {} is not in a space of {} conditions",
                run.condition(),
                space.len()
            )));
        }
        if let Some((_, run)) = runs
            .iter()
            .tuple_windows()
            .find(|(a, b)| a.condition() == b.condition() && a.rep() == b.rep())
        {
            return Err(AnalysisError::Configuration(format!(
                "rep {} of condition {} was given twice",
                run.rep(),
                run.token()
            )));
        }

        let tags = runs[0].tags().to_vec();
        let n_tot = runs.iter().map(DecorrelatedRun::len).sum();
        let mut values = Array2::zeros((n_tot, tags.len()));
        let mut origin = Array1::zeros(n_tot);
        let mut n_k = Array1::zeros(space.len());
        let mut summaries = Vec::with_capacity(runs.len());

        let mut start = 0;
        for run in &runs {
            let end = start + run.len();
            for (j, tag) in tags.iter().enumerate() {
                values
                    .slice_mut(s![start..end, j])
                    .assign(&run.series(tag)?);
            }
            origin.slice_mut(s![start..end]).fill(run.condition());
            n_k[run.condition()] += run.len();
            summaries.push(RunSummary {
                condition: run.condition(),
                token: run.token().to_string(),
                rep: run.rep(),
                decorrelation: *run.decorrelation(),
                retained: run.len(),
            });
            start = end;
        }

        log::info!(
            "Pooled {} samples of {} tags from {} runs",
            n_tot,
            tags.len(),
            summaries.len()
        );

        Ok(Self {
            tags,
            values,
            n_k,
            origin,
            runs: summaries,
        })
    }

    /// Pooled tags, in column order
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// `values()[[n, j]]` is pooled sample `n` of tag `j`
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// `n_k()[k]` is the number of samples drawn at condition `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// `origin()[n]` is the condition sample `n` was drawn at
    pub fn origin(&self) -> &Array1<usize> {
        &self.origin
    }

    /// Total number of pooled samples
    pub fn n_tot(&self) -> usize {
        self.origin.len()
    }

    #[allow(missing_docs)]
    pub fn runs(&self) -> &[RunSummary] {
        &self.runs
    }

    /// Pooled samples of `tag`
    pub fn series(&self, tag: &str) -> Result<ArrayView1<'_, f64>> {
        match self.tags.iter().position(|t| t == tag) {
            Some(j) => Ok(self.values.index_axis(Axis(1), j)),
            None => {
                let first = &self.runs[0];
                Err(AnalysisError::MissingTag {
                    tag: tag.to_string(),
                    condition: first.token.clone(),
                    rep: first.rep,
                })
            }
        }
    }
}

fn check_finite(k: usize, u_n: ArrayView1<'_, f64>) -> Result<()> {
    match u_n.iter().position(|u| !u.is_finite()) {
        Some(n) => Err(AnalysisError::IncompletePotential { k, n }),
        None => Ok(()),
    }
}

/// Reduced potential of every pooled sample at every condition of a space
#[derive(Debug, Clone)]
pub struct ReducedPotentialMatrix {
    u_kn: Array2<f64>,
    settings: PotentialSettings,
}

impl ReducedPotentialMatrix {
    /// Evaluate `u_kn[[k, n]]`, the reduced potential of sample `n` at condition `k`
    pub fn build(
        space: &ConditionSpace,
        pooled: &PooledSamples,
        settings: &PotentialSettings,
    ) -> Result<Self> {
        let mut u_kn = Array2::zeros((space.len(), pooled.n_tot()));
        for (k, condition) in space.iter().enumerate() {
            let u_n = settings.reduced_potentials(condition, pooled)?;
            check_finite(k, u_n.view())?;
            u_kn.row_mut(k).assign(&u_n);
        }

        Ok(Self {
            u_kn,
            settings: settings.clone(),
        })
    }

    #[allow(missing_docs)]
    pub fn u_kn(&self) -> &Array2<f64> {
        &self.u_kn
    }

    /// Settings the matrix was evaluated with
    pub fn settings(&self) -> &PotentialSettings {
        &self.settings
    }
}

/// Dimensionless free energy of every condition relative to the first
#[derive(Debug, Clone, PartialEq)]
pub struct FreeEnergyOffsets {
    /// `f_k[k]` is $f_k - f_0$
    pub f_k: Array1<f64>,
    /// `d_f_k[k]` is the uncertainty of `f_k[k]`
    pub d_f_k: Array1<f64>,
}

impl FreeEnergyOffsets {
    /// $f_j - f_i$
    pub fn difference(&self, i: usize, j: usize) -> f64 {
        self.f_k[j] - self.f_k[i]
    }
}

/// Solver settings for fitting a `Reweighter`
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct ReweightParams {
    /// Iteration limit of the MBAR solver
    #[builder(default = "1000")]
    pub maximum_iterations: usize,

    /// Relative tolerance of the MBAR solver
    #[builder(default = "1.0e-6")]
    pub relative_tolerance: f64,

    #[allow(missing_docs)]
    #[builder(default)]
    pub initial_free_energies: InitialFreeEnergies,

    /// How uncertainties of expectations and free energies are computed
    #[builder(default = "ExpectationsUncertaintyMethod::SvdEw")]
    pub uncertainty_method: ExpectationsUncertaintyMethod,

    /// Log solver progress at info level
    #[builder(default = "false")]
    pub verbose: bool,
}

impl Default for ReweightParams {
    fn default() -> Self {
        ReweightParamsBuilder::default()
            .build()
            .expect("ReweightParams should not fail with default params")
    }
}

/// Something to take the expectation of
#[derive(Debug, Clone)]
pub enum Observable<'a> {
    /// A pooled tag
    Tag(&'a str),
    /// An arbitrary function of the pooled samples, one value per sample
    Values(ArrayView1<'a, f64>),
}

impl<'a> From<&'a str> for Observable<'a> {
    fn from(tag: &'a str) -> Self {
        Self::Tag(tag)
    }
}

/// A reweighted estimate with its uncertainty at one standard deviation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    #[allow(missing_docs)]
    pub value: f64,
    #[allow(missing_docs)]
    pub uncertainty: f64,
}

/// How the values of an order parameter are assigned to bins
#[derive(Debug, Clone, PartialEq)]
pub enum Bins {
    /// One bin for every distinct value observed in the pool
    Discrete,
    /// `count` bins of equal width spanning `[min, max]`
    ///
    /// Samples outside the range are kept in the estimate but fall in no reported bin.
    Uniform {
        #[allow(missing_docs)]
        min: f64,
        #[allow(missing_docs)]
        max: f64,
        #[allow(missing_docs)]
        count: usize,
    },
}

/// Bin of every sample; `bin_n[n] == values.len()` for samples outside every bin
#[derive(Debug)]
struct Binning {
    values: Vec<f64>,
    bin_n: Vec<usize>,
}

impl Binning {
    fn n_bins(&self) -> usize {
        self.values.len()
    }

    fn has_outliers(&self) -> bool {
        self.bin_n.iter().any(|&bin| bin == self.n_bins())
    }
}

impl Bins {
    fn assign(&self, tag: &str, x_n: ArrayView1<'_, f64>) -> Result<Binning> {
        if let Some(n) = x_n.iter().position(|x| !x.is_finite()) {
            return Err(AnalysisError::Configuration(format!(
                "pooled sample {} of {} is not finite and cannot be binned",
                n, tag
            )));
        }

        match *self {
            Self::Discrete => {
                // Adding zero folds -0.0 into 0.0
                let values: Vec<f64> = x_n
                    .iter()
                    .map(|&x| x + 0.0)
                    .sorted_by(f64::total_cmp)
                    .dedup()
                    .collect();
                let bin_n = x_n
                    .iter()
                    .map(|&x| {
                        values
                            .binary_search_by(|v| v.total_cmp(&(x + 0.0)))
                            .unwrap_or(values.len())
                    })
                    .collect();

                Ok(Binning { values, bin_n })
            }
            Self::Uniform { min, max, count } => {
                if count == 0 || max.partial_cmp(&min) != Some(std::cmp::Ordering::Greater) {
                    return Err(AnalysisError::Configuration(format!(
                        "{} uniform bins over [{}, {}] for {} are not a valid binning",
                        count, min, max, tag
                    )));
                }
                let width = (max - min) / count as f64;
                let values = (0..count).map(|i| min + (i as f64 + 0.5) * width).collect();
                let bin_n = x_n
                    .iter()
                    .map(|&x| {
                        if x < min || x > max {
                            count
                        } else {
                            (((x - min) / width).floor() as usize).min(count - 1)
                        }
                    })
                    .collect();

                Ok(Binning { values, bin_n })
            }
        }
    }
}

/// One bin of a potential of mean force
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PmfBin {
    /// Dimensionless free energy relative to the lowest bin; `None` if the bin is empty
    pub free_energy: Option<f64>,
    /// Uncertainty of the free energy difference to the lowest bin
    pub uncertainty: Option<f64>,
    /// Reweighted number of samples in the bin
    pub population: f64,
}

/// Potential of mean force along one order parameter at one condition
#[derive(Debug, Clone, PartialEq)]
pub struct Pmf1d {
    /// Tag of the order parameter
    pub tag: String,
    /// Bin value (the centre of uniform bins) with the free energy of the bin
    pub bins: Vec<(f64, PmfBin)>,
}

/// Potential of mean force along two order parameters at one condition
#[derive(Debug, Clone, PartialEq)]
pub struct Pmf2d {
    /// Tags of the two order parameters
    pub tags: (String, String),
    /// Values of both order parameters with the free energy of the bin, first tag outermost
    pub bins: Vec<((f64, f64), PmfBin)>,
}

/// MBAR fitted to the pooled samples of a condition space
#[derive(Debug)]
pub struct Reweighter {
    mbar: MBar,
    pooled: PooledSamples,
    settings: PotentialSettings,
    uncertainty_method: ExpectationsUncertaintyMethod,
}

impl Reweighter {
    /// Solve for the free energies of every condition of the space the potentials were built on
    pub fn fit(
        pooled: PooledSamples,
        potentials: ReducedPotentialMatrix,
        params: &ReweightParams,
    ) -> Result<Self> {
        let ReducedPotentialMatrix { u_kn, settings } = potentials;
        if u_kn.len_of(Axis(1)) != pooled.n_tot() {
            return Err(AnalysisError::ArrayLengthMismatch(
                u_kn.len_of(Axis(1)),
                pooled.n_tot(),
            ));
        }

        let mut builder = MBar::builder();
        builder
            .u_kn(u_kn)
            .n_k(pooled.n_k().clone())
            .x_kindices(pooled.origin().clone())
            .maximum_iterations(params.maximum_iterations)
            .relative_tolerance(params.relative_tolerance)
            .initial_free_energies(params.initial_free_energies.clone());
        let mbar = if params.verbose {
            builder.build_verbose()?
        } else {
            builder.build()?
        };
        log::info!(
            "MBAR converged in {} iterations over {} conditions",
            mbar.iterations(),
            mbar.k()
        );

        Ok(Self {
            mbar,
            pooled,
            settings,
            uncertainty_method: params.uncertainty_method,
        })
    }

    #[allow(missing_docs)]
    pub fn mbar(&self) -> &MBar {
        &self.mbar
    }

    #[allow(missing_docs)]
    pub fn pooled(&self) -> &PooledSamples {
        &self.pooled
    }

    /// Free energy of every condition relative to the first, with uncertainties
    pub fn free_energies(&self) -> Result<FreeEnergyOffsets> {
        let differences = self
            .mbar
            .compute_free_energy_differences(self.uncertainty_method)?;

        Ok(FreeEnergyOffsets {
            f_k: differences.delta_f.row(0).to_owned(),
            d_f_k: differences.d_delta_f.row(0).to_owned(),
        })
    }

    /// Effective number of samples contributing at every condition
    pub fn n_eff(&self) -> Array1<f64> {
        self.mbar.n_eff()
    }

    /// Reduced potentials of the pooled samples at each target, one row per target
    pub fn target_potentials(&self, targets: &[Condition]) -> Result<Array2<f64>> {
        let mut u_ln = Array2::zeros((targets.len(), self.pooled.n_tot()));
        for (l, target) in targets.iter().enumerate() {
            let u_n = self.settings.reduced_potentials(target, &self.pooled)?;
            check_finite(l, u_n.view())?;
            u_ln.row_mut(l).assign(&u_n);
        }

        Ok(u_ln)
    }

    /// Expectation of `observable` at each target condition
    pub fn expectations(
        &self,
        observable: &Observable<'_>,
        targets: &[Condition],
    ) -> Result<Vec<Estimate>> {
        let a_n = match observable {
            Observable::Tag(tag) => self.pooled.series(tag)?,
            Observable::Values(a_n) => a_n.view(),
        };
        let expectations = self.mbar.expectations(
            a_n,
            ExpectationsParams {
                u_kn: Some(self.target_potentials(targets)?),
                uncertainty_method: self.uncertainty_method,
                ..Default::default()
            },
        )?;

        Ok(expectations
            .mu
            .iter()
            .zip(expectations.sigma.iter())
            .map(|(&value, &uncertainty)| Estimate { value, uncertainty })
            .collect())
    }

    /// Expectation of `observable` at `target`
    pub fn expectation(&self, observable: &Observable<'_>, target: &Condition) -> Result<Estimate> {
        let mut estimates = self.expectations(observable, std::slice::from_ref(target))?;
        estimates
            .pop()
            .ok_or(AnalysisError::ArrayLengthMismatch(0, 1))
    }

    /// PMF over bins, with out-of-range samples in an unreported extra bin
    fn binned_pmf(&self, u_n: &[f64], binning: &Binning) -> Result<Vec<PmfBin>> {
        let n_bins = binning.n_bins();
        let n_tot = self.pooled.n_tot() as f64;
        let pmf = if binning.has_outliers() {
            // Free energies are relative to the most probable reported bin
            let (log_w_n, _) = self.mbar.log_weights_at(ArrayView1::from(u_n))?;
            let mut p_i = vec![0.0; n_bins];
            for (&bin, &log_w) in binning.bin_n.iter().zip(log_w_n.iter()) {
                if bin < n_bins {
                    p_i[bin] += log_w.exp();
                }
            }
            let lowest = p_i
                .iter()
                .enumerate()
                .filter(|(_, &p)| p > 0.0)
                .min_by(|a, b| b.1.total_cmp(a.1))
                .map(|(i, _)| i);
            let uncertainties = match lowest {
                Some(lowest) => PmfUncertainties::FromSpecified(lowest),
                None => PmfUncertainties::FromNormalization,
            };

            let mut pmf = self
                .mbar
                .compute_pmf(u_n, &binning.bin_n, n_bins + 1, uncertainties)?;
            let f_lowest = lowest.and_then(|i| pmf.f_i[i]).unwrap_or(0.0);
            pmf.f_i = pmf.f_i[..n_bins]
                .iter()
                .map(|f| f.map(|f| f - f_lowest))
                .collect();
            pmf
        } else {
            self.mbar
                .compute_pmf(u_n, &binning.bin_n, n_bins, PmfUncertainties::FromLowest)?
        };

        let Pmf { f_i, df_i, p_i, .. } = pmf;
        let df_i = df_i.unwrap_or_default();
        Ok((0..n_bins)
            .map(|i| PmfBin {
                free_energy: f_i.get(i).copied().flatten(),
                uncertainty: f_i
                    .get(i)
                    .copied()
                    .flatten()
                    .and(df_i.get(i).copied().flatten()),
                population: p_i[i] * n_tot,
            })
            .collect())
    }

    /// Potential of mean force along `tag` at each target condition
    pub fn pmf_1d(&self, tag: &str, bins: &Bins, targets: &[Condition]) -> Result<Vec<Pmf1d>> {
        let binning = bins.assign(tag, self.pooled.series(tag)?)?;
        let u_ln = self.target_potentials(targets)?;

        u_ln.outer_iter()
            .map(|u_n| {
                let pmf = self.binned_pmf(&u_n.to_vec(), &binning)?;
                Ok(Pmf1d {
                    tag: tag.to_string(),
                    bins: binning.values.iter().copied().zip(pmf).collect(),
                })
            })
            .collect()
    }

    /// Potential of mean force along `tag_a` and `tag_b` at each target condition
    pub fn pmf_2d(
        &self,
        (tag_a, tag_b): (&str, &str),
        (bins_a, bins_b): (&Bins, &Bins),
        targets: &[Condition],
    ) -> Result<Vec<Pmf2d>> {
        let binning_a = bins_a.assign(tag_a, self.pooled.series(tag_a)?)?;
        let binning_b = bins_b.assign(tag_b, self.pooled.series(tag_b)?)?;
        let (n_a, n_b) = (binning_a.n_bins(), binning_b.n_bins());

        let values: Vec<(f64, f64)> = binning_a
            .values
            .iter()
            .copied()
            .cartesian_product(binning_b.values.iter().copied())
            .collect();
        let bin_n = binning_a
            .bin_n
            .iter()
            .zip(binning_b.bin_n.iter())
            .map(|(&a, &b)| {
                if a == n_a || b == n_b {
                    n_a * n_b
                } else {
                    a * n_b + b
                }
            })
            .collect();
        let binning = Binning {
            values: vec![0.0; n_a * n_b],
            bin_n,
        };

        let u_ln = self.target_potentials(targets)?;
        u_ln.outer_iter()
            .map(|u_n| {
                let pmf = self.binned_pmf(&u_n.to_vec(), &binning)?;
                Ok(Pmf2d {
                    tags: (tag_a.to_string(), tag_b.to_string()),
                    bins: values.iter().copied().zip(pmf).collect(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biases::*;
    use crate::conditions::*;
    use crate::decorrelate::*;
    use crate::outputs::SimRun;
    use crate::testsystems::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn temp_space(temps: &[f64]) -> ConditionSpace {
        ConditionSpace::new(
            vec![ConditionAxis::new(TEMP_AXIS, temps.to_vec())],
            ConditionsFileformatter::new(vec![FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain)]),
        )
        .unwrap()
    }

    fn gamma_pool(space: &ConditionSpace, n: usize) -> PooledSamples {
        let system = GammaDensityOfStates::default();
        let params = DecorrelationParamsBuilder::default().nskip(10).build().unwrap();
        let runs = space
            .iter()
            .enumerate()
            .map(|(k, condition)| {
                let run = system
                    .simulate(k, space.token(k), 0, condition.temp(), n, 17 + k as u64)
                    .unwrap();
                decorrelate_run(&run, "tenergy", &params).unwrap()
            })
            .collect();
        PooledSamples::pool(space, runs).unwrap()
    }

    fn fit(space: &ConditionSpace, pooled: PooledSamples) -> Reweighter {
        let settings = PotentialSettings::default();
        let potentials = ReducedPotentialMatrix::build(space, &pooled, &settings).unwrap();
        Reweighter::fit(pooled, potentials, &ReweightParams::default()).unwrap()
    }

    #[test]
    fn pooling_is_in_condition_order() {
        let space = temp_space(&[300.0, 320.0]);
        let pooled = gamma_pool(&space, 200);
        assert_eq!(pooled.tags(), &["tenergy", "energylevel"]);
        assert_eq!(pooled.n_k().sum(), pooled.n_tot());
        assert_eq!(pooled.origin()[0], 0);
        assert_eq!(pooled.origin()[pooled.n_tot() - 1], 1);
        assert_eq!(pooled.origin().iter().filter(|&&k| k == 1).count(), pooled.n_k()[1]);
        assert_eq!(pooled.runs()[1].token, "320");
        assert!(matches!(
            pooled.series("numstackedpairs"),
            Err(AnalysisError::MissingTag { .. })
        ));
    }

    #[test]
    fn identical_conditions_have_equal_offsets() {
        // Without a staple term the staple axis does not change the potential
        let space = ConditionSpace::new(
            vec![
                ConditionAxis::new(TEMP_AXIS, vec![300.0]),
                ConditionAxis::new(STAPLE_AXIS, vec![1.0, 2.0]),
            ],
            ConditionsFileformatter::new(vec![
                FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain),
                FileformatSpec::new(STAPLE_AXIS, ValueFormat::Plain),
            ]),
        )
        .unwrap();
        let pooled = gamma_pool(&space, 300);
        let reweighter = fit(&space, pooled);

        let offsets = reweighter.free_energies().unwrap();
        assert_eq!(offsets.f_k[0], 0.0);
        assert_abs_diff_eq!(offsets.f_k[1], 0.0, epsilon = 1.0e-8);
        assert_abs_diff_eq!(offsets.d_f_k[1], 0.0, epsilon = 1.0e-3);
    }

    #[test]
    fn temperature_offsets_match_density_of_states() {
        let space = temp_space(&[300.0, 320.0]);
        let pooled = gamma_pool(&space, 3000);
        let reweighter = fit(&space, pooled);

        let offsets = reweighter.free_energies().unwrap();
        let expected = -4.0 * (320.0f64 / 300.0).ln();
        assert!(offsets.d_f_k[1] > 0.0);
        assert!((offsets.difference(0, 1) - expected).abs() < 0.05);
    }

    fn raw_mean(pooled: &PooledSamples, tag: &str, k: usize) -> f64 {
        let values = pooled.series(tag).unwrap();
        values
            .iter()
            .zip(pooled.origin().iter())
            .filter(|(_, &origin)| origin == k)
            .map(|(x, _)| x)
            .sum::<f64>()
            / pooled.n_k()[k] as f64
    }

    #[test]
    fn expectation_at_sampled_condition_is_close_to_raw_mean() {
        // A lone condition weights its own samples uniformly
        let space = temp_space(&[300.0]);
        let pooled = gamma_pool(&space, 500);
        let raw = raw_mean(&pooled, "tenergy", 0);
        let reweighter = fit(&space, pooled);
        let estimate = reweighter
            .expectation(&Observable::from("tenergy"), &space.conditions()[0])
            .unwrap();
        assert_abs_diff_eq!(estimate.value, raw, epsilon = 1.0e-6 * raw.abs());

        let space = temp_space(&[300.0, 320.0]);
        let pooled = gamma_pool(&space, 2000);
        let raw = raw_mean(&pooled, "tenergy", 0);
        let energies = pooled.series("tenergy").unwrap().to_owned();
        let reweighter = fit(&space, pooled);

        let target = &space.conditions()[0];
        let estimate = reweighter
            .expectation(&Observable::from("tenergy"), target)
            .unwrap();
        assert!(estimate.uncertainty > 0.0);
        assert!((estimate.value - raw).abs() < 3.0 * estimate.uncertainty);

        // Expectations of arbitrary functions of the samples
        let doubled = energies.mapv(|e| 2.0 * e);
        let estimate_doubled = reweighter
            .expectation(&Observable::Values(doubled.view()), target)
            .unwrap();
        assert_abs_diff_eq!(estimate_doubled.value, 2.0 * estimate.value, epsilon = 1.0e-6);
    }

    #[test]
    fn many_close_temperatures() {
        let temps: Vec<f64> = (0..40).map(|i| 300.0 + 0.5 * i as f64).collect();
        let space = temp_space(&temps);
        let pooled = gamma_pool(&space, 200);
        let levels = pooled.series("energylevel").unwrap().to_owned();
        let reweighter = fit(&space, pooled);

        let system = GammaDensityOfStates::default();
        let expected =
            system.analytical_free_energy(temps[39]) - system.analytical_free_energy(temps[0]);
        let offsets = reweighter.free_energies().unwrap();
        assert!(offsets.d_f_k.iter().all(|df| df.is_finite()));
        assert!(
            (offsets.difference(0, 39) - expected).abs() < 5.0 * offsets.d_f_k[39] + 0.01,
            "delta f = {}, expected {}",
            offsets.difference(0, 39),
            expected
        );

        // Tags and borrowed values reweight alike
        let by_tag = reweighter
            .expectations(&Observable::from("energylevel"), space.conditions())
            .unwrap();
        let by_values = reweighter
            .expectations(&Observable::Values(levels.view()), space.conditions())
            .unwrap();
        assert_eq!(by_tag.len(), 40);
        for (a, b) in by_tag.iter().zip(by_values.iter()) {
            assert_abs_diff_eq!(a.value, b.value, epsilon = 1.0e-12);
        }
    }

    #[test]
    fn pmf_populations_sum_to_sample_count() {
        let space = temp_space(&[300.0, 320.0]);
        let pooled = gamma_pool(&space, 1000);
        let n_tot = pooled.n_tot() as f64;
        let reweighter = fit(&space, pooled);
        let targets = space.conditions().to_vec();

        let bins = Bins::Uniform {
            min: -0.5,
            max: 49.5,
            count: 50,
        };
        let pmfs = reweighter.pmf_1d("energylevel", &bins, &targets).unwrap();
        assert_eq!(pmfs.len(), 2);
        for pmf in &pmfs {
            assert_eq!(pmf.bins.len(), 50);
            assert_eq!(pmf.bins[3].0, 3.0);
            let total: f64 = pmf.bins.iter().map(|(_, bin)| bin.population).sum();
            assert_abs_diff_eq!(total, n_tot, epsilon = 1.0e-6);
            // Energies are nowhere near 25 000
            assert_eq!(pmf.bins[49].1.free_energy, None);
            assert_eq!(pmf.bins[49].1.uncertainty, None);
            assert_eq!(pmf.bins[49].1.population, 0.0);
            assert!(pmf.bins.iter().any(|(_, bin)| bin.free_energy == Some(0.0)));
        }

        let discrete = reweighter
            .pmf_1d("energylevel", &Bins::Discrete, &targets[..1])
            .unwrap();
        assert_eq!(discrete[0].bins[0].0, 0.0);
        assert!(discrete[0].bins.iter().all(|(_, bin)| bin.free_energy.is_some()));
    }

    #[test]
    fn out_of_range_samples_fall_in_no_bin() {
        let space = temp_space(&[300.0]);
        let pooled = gamma_pool(&space, 1000);
        let n_tot = pooled.n_tot() as f64;
        let reweighter = fit(&space, pooled);

        let bins = Bins::Uniform {
            min: -0.5,
            max: 1.5,
            count: 2,
        };
        let pmf = &reweighter
            .pmf_1d("energylevel", &bins, space.conditions())
            .unwrap()[0];
        let total: f64 = pmf.bins.iter().map(|(_, bin)| bin.population).sum();
        assert!(total < n_tot);
        let lowest = pmf
            .bins
            .iter()
            .position(|(_, bin)| bin.free_energy == Some(0.0))
            .unwrap();
        assert_eq!(pmf.bins[lowest].1.uncertainty, Some(0.0));
        for (_, bin) in &pmf.bins {
            assert!(bin.free_energy.map_or(true, |f| f >= 0.0));
            assert!(bin.population <= pmf.bins[lowest].1.population);
        }

        // No sample in range leaves every bin undefined
        let empty = Bins::Uniform {
            min: 1.0e3,
            max: 1.1e3,
            count: 4,
        };
        let pmf = &reweighter
            .pmf_1d("energylevel", &empty, space.conditions())
            .unwrap()[0];
        assert_eq!(pmf.bins.len(), 4);
        for (_, bin) in &pmf.bins {
            assert_eq!(bin.free_energy, None);
            assert_eq!(bin.uncertainty, None);
            assert_eq!(bin.population, 0.0);
        }
    }

    #[test]
    fn pmf_2d_covers_the_bin_grid() {
        let space = temp_space(&[300.0, 320.0]);
        let pooled = gamma_pool(&space, 500);
        let reweighter = fit(&space, pooled);

        let pmfs = reweighter
            .pmf_2d(
                ("energylevel", "energylevel"),
                (&Bins::Discrete, &Bins::Discrete),
                &space.conditions()[1..],
            )
            .unwrap();
        let pmf = &pmfs[0];
        let n = (pmf.bins.len() as f64).sqrt() as usize;
        assert_eq!(n * n, pmf.bins.len());
        for ((a, b), bin) in &pmf.bins {
            // A tag paired with itself only populates the diagonal
            assert_eq!(bin.free_energy.is_some(), a == b);
        }
    }

    #[test]
    fn biased_conditions_need_their_order_parameter() {
        let stacking: Bias = StackingBias::new(-1000.0, 0.5).into();
        let space = ConditionSpace::new(
            vec![
                ConditionAxis::new(TEMP_AXIS, vec![300.0]),
                ConditionAxis::new(BIAS_AXIS, vec![stacking]),
            ],
            ConditionsFileformatter::new(vec![
                FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain),
                FileformatSpec::new(BIAS_AXIS, ValueFormat::Fixed(1)),
            ]),
        )
        .unwrap();
        let pooled = gamma_pool(&space, 100);
        let result = ReducedPotentialMatrix::build(&space, &pooled, &PotentialSettings::default());
        match result {
            Err(AnalysisError::MissingTag { tag, .. }) => assert_eq!(tag, STACKED_PAIRS_TAG),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn reduced_potentials_include_bias_and_staple_terms() {
        let stacking: Bias = StackingBias::new(-1000.0, 0.5).into();
        let space = ConditionSpace::new(
            vec![
                ConditionAxis::new(TEMP_AXIS, vec![350.0]),
                ConditionAxis::new(STAPLE_AXIS, vec![1.0e-6]),
                ConditionAxis::new(BIAS_AXIS, vec![stacking]),
            ],
            ConditionsFileformatter::new(vec![
                FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain),
                FileformatSpec::new(BIAS_AXIS, ValueFormat::Fixed(1)),
            ]),
        )
        .unwrap();

        let n = 12;
        let values = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => -2000.0 - 10.0 * i as f64,
            1 => (i % 3) as f64,
            _ => (i % 4) as f64,
        });
        let run = SimRun::new(
            0,
            space.token(0),
            0,
            (0..n as i64).collect(),
            vec![
                "tenergy".to_string(),
                STACKED_PAIRS_TAG.to_string(),
                "numstaples".to_string(),
            ],
            values,
        )
        .unwrap();
        let decorrelated =
            decorrelate_run(&run, "tenergy", &DecorrelationParams::default()).unwrap();
        let pooled = PooledSamples::pool(&space, vec![decorrelated]).unwrap();

        let settings = PotentialSettingsBuilder::default()
            .staple_tag("numstaples")
            .lattice_site_volume(4.0e-28)
            .build()
            .unwrap();
        let matrix = ReducedPotentialMatrix::build(&space, &pooled, &settings).unwrap();

        let mu = staple_chemical_potential(1.0e-6, 4.0e-28);
        for n in 0..pooled.n_tot() {
            let row = pooled.values().row(n);
            let expected = (row[0] - 500.0 * row[1]) / 350.0 - row[2] * mu;
            assert_abs_diff_eq!(matrix.u_kn()[[0, n]], expected, epsilon = 1.0e-9);
        }
    }

    #[test]
    fn staple_settings_come_in_pairs() {
        assert!(PotentialSettingsBuilder::default()
            .staple_tag("numstaples")
            .build()
            .is_err());
        assert!(PotentialSettingsBuilder::default()
            .staple_tag("numstaples")
            .lattice_site_volume(-1.0)
            .build()
            .is_err());
        assert_eq!(PotentialSettings::default().energy_tag, "tenergy");
    }

    #[test]
    fn non_finite_potentials_are_rejected() {
        assert!(check_finite(0, array![1.0, -2.0].view()).is_ok());
        assert!(matches!(
            check_finite(2, array![1.0, f64::NAN, f64::INFINITY].view()),
            Err(AnalysisError::IncompletePotential { k: 2, n: 1 })
        ));
    }
}
