//! Removing the equilibration segment and the time correlation from simulation series.
//!
//! # References
//!
//! 1. Chodera JD. A simple method for automated equilibration detection in molecular
//! simulations. J. Chem. Theory Comput. 12:1799, 2016. <http://dx.doi.org/10.1021/acs.jctc.5b00784>

use crate::errors::*;
use crate::outputs::{RawSeries, SeriesId, SimRun};
use ndarray::{s, Array1, Array2, ArrayView1, Axis};

/// Parameters of equilibration detection and subsampling
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct DecorrelationParams {
    /// Candidate equilibration cutoffs are spaced this many samples apart
    #[builder(default = "1")]
    pub nskip: usize,

    /// Grow the lag increment by one after every term of the autocorrelation sum
    ///
    /// Much faster for long correlation times, at some cost in accuracy.
    #[builder(default = "false")]
    pub fast: bool,

    /// The autocorrelation sum is not truncated before this lag
    #[builder(default = "3")]
    pub mintime: usize,

    /// Series with fewer samples than this are rejected
    #[builder(default = "10")]
    pub min_samples: usize,
}

impl DecorrelationParamsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.nskip == Some(0) {
            return Err("nskip must be at least 1".to_string());
        }
        if let Some(min_samples) = self.min_samples {
            if min_samples < 2 {
                return Err("min_samples must be at least 2".to_string());
            }
        }

        Ok(())
    }
}

impl Default for DecorrelationParams {
    fn default() -> Self {
        DecorrelationParamsBuilder::default()
            .build()
            .expect("DecorrelationParams should not fail with default params")
    }
}

/// Statistical inefficiency $g$ of a series
///
/// $$
///     g = 1 + 2 \sum_{t=1}^{N-1} C(t) \left(1 - \frac{t}{N}\right)
/// $$
///
/// where $C(t)$ is the normalised autocorrelation function. The sum is truncated at the first
/// lag beyond `mintime` where $C(t) \leq 0$. A series without fluctuations has $g = 1$.
pub fn statistical_inefficiency(series: ArrayView1<'_, f64>, params: &DecorrelationParams) -> f64 {
    let n = series.len();
    if n < 2 || series.iter().all(|&x| x == series[0]) {
        return 1.0;
    }

    let mean = series.sum() / n as f64;
    let da = series.mapv(|x| x - mean);
    let sigma2 = da.dot(&da) / n as f64;
    if sigma2 == 0.0 {
        return 1.0;
    }

    let mut g = 1.0;
    let mut t = 1;
    let mut increment = 1;
    while t < n - 1 {
        let c = da.slice(s![..n - t]).dot(&da.slice(s![t..])) / ((n - t) as f64 * sigma2);
        if c <= 0.0 && t > params.mintime {
            break;
        }
        g += 2.0 * c * (1.0 - t as f64 / n as f64) * increment as f64;
        t += increment;
        if params.fast {
            increment += 1;
        }
    }

    g.max(1.0)
}

/// Equilibration cutoff and statistical inefficiency of a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decorrelation {
    /// Samples before this index are discarded as equilibration
    pub cutoff: usize,
    /// Statistical inefficiency of the samples from `cutoff` on
    pub g: f64,
    /// Length of the series this was estimated from
    pub n_raw: usize,
}

impl Decorrelation {
    /// Every `stride`th sample after the cutoff is kept, $\lceil g \rceil$
    pub fn stride(&self) -> usize {
        (self.g.ceil() as usize).max(1)
    }

    /// Number of samples kept
    pub fn retained(&self) -> usize {
        let remaining = self.n_raw.saturating_sub(self.cutoff);
        (remaining + self.stride() - 1) / self.stride()
    }

    /// Effective number of uncorrelated samples, $(N - t_0) / g$
    pub fn n_eff(&self) -> f64 {
        self.n_raw.saturating_sub(self.cutoff) as f64 / self.g
    }

    /// Subsample another series of the same run with this cutoff and inefficiency
    pub fn apply(&self, raw: &RawSeries<'_>) -> Result<DecorrelatedSeries> {
        if raw.values.len() != self.n_raw {
            return Err(AnalysisError::ArrayLengthMismatch(
                raw.values.len(),
                self.n_raw,
            ));
        }

        let (cutoff, stride) = (self.cutoff, self.stride());
        Ok(DecorrelatedSeries {
            id: raw.id.clone(),
            cutoff,
            g: self.g,
            values: raw.values.slice(s![cutoff..;stride]).to_owned(),
        })
    }
}

/// Choose the equilibration cutoff that maximises the number of uncorrelated samples
///
/// Every `nskip`th cutoff $t_0$ is tried; the statistical inefficiency $g_{t_0}$ of the rest of
/// the series is computed and the cutoff maximising $(N - t_0) / g_{t_0}$ is kept. Ties go to
/// the earliest cutoff.
pub fn detect_equilibration(
    series: ArrayView1<'_, f64>,
    params: &DecorrelationParams,
) -> Decorrelation {
    let n = series.len();
    let mut best = Decorrelation {
        cutoff: 0,
        g: 1.0,
        n_raw: n,
    };
    let mut best_n_eff = f64::NEG_INFINITY;

    for t in (0..n.saturating_sub(1)).step_by(params.nskip) {
        let g = statistical_inefficiency(series.slice(s![t..]), params);
        let n_eff = (n - t) as f64 / g;
        if n_eff > best_n_eff {
            best_n_eff = n_eff;
            best = Decorrelation {
                cutoff: t,
                g,
                n_raw: n,
            };
        }
    }

    best
}

/// A series with its equilibration segment removed and subsampled to independence
#[derive(Debug, Clone, PartialEq)]
pub struct DecorrelatedSeries {
    #[allow(missing_docs)]
    pub id: SeriesId,
    #[allow(missing_docs)]
    pub cutoff: usize,
    #[allow(missing_docs)]
    pub g: f64,
    #[allow(missing_docs)]
    pub values: Array1<f64>,
}

impl DecorrelatedSeries {
    /// The cutoff and inefficiency this series was subsampled with
    pub fn decorrelation(&self, n_raw: usize) -> Decorrelation {
        Decorrelation {
            cutoff: self.cutoff,
            g: self.g,
            n_raw,
        }
    }
}

/// Detect equilibration in a series and subsample it
///
/// Deterministic: the same series always gives the same cutoff, inefficiency and samples.
pub fn decorrelate(
    raw: &RawSeries<'_>,
    params: &DecorrelationParams,
) -> Result<DecorrelatedSeries> {
    let len = raw.values.len();
    if len < params.min_samples {
        return Err(AnalysisError::InsufficientData {
            condition: raw.id.condition.clone(),
            rep: raw.id.rep,
            tag: raw.id.tag.clone(),
            len,
            min: params.min_samples,
        });
    }

    detect_equilibration(raw.values, params).apply(raw)
}

/// Every series of a run, subsampled with the decorrelation of its energy series
#[derive(Debug, Clone)]
pub struct DecorrelatedRun {
    condition: usize,
    token: String,
    rep: usize,
    decorrelation: Decorrelation,
    tags: Vec<String>,
    values: Array2<f64>,
}

impl DecorrelatedRun {
    /// Index of the condition in its space
    pub fn condition(&self) -> usize {
        self.condition
    }

    /// File token of the condition
    pub fn token(&self) -> &str {
        &self.token
    }

    #[allow(missing_docs)]
    pub fn rep(&self) -> usize {
        self.rep
    }

    /// Cutoff and inefficiency of the energy series, applied to every tag
    pub fn decorrelation(&self) -> &Decorrelation {
        &self.decorrelation
    }

    #[allow(missing_docs)]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// `values()[[n, j]]` is retained sample `n` of tag `j`
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Number of retained samples
    pub fn len(&self) -> usize {
        self.values.len_of(Axis(0))
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained samples of `tag`
    pub fn series(&self, tag: &str) -> Result<ArrayView1<'_, f64>> {
        let j = self
            .tags
            .iter()
            .position(|t| t == tag)
            .ok_or_else(|| AnalysisError::MissingTag {
                tag: tag.to_string(),
                condition: self.token.clone(),
                rep: self.rep,
            })?;

        Ok(self.values.index_axis(Axis(1), j))
    }
}

/// Decorrelate a run on its energy series and subsample every other tag identically
///
/// Reusing the energy series' cutoff and inefficiency keeps the samples of different tags
/// aligned in time.
pub fn decorrelate_run(
    run: &SimRun,
    energy_tag: &str,
    params: &DecorrelationParams,
) -> Result<DecorrelatedRun> {
    let energy = run.series(energy_tag)?;
    let decorrelation = decorrelate(&energy, params)?.decorrelation(run.len());

    let (cutoff, stride) = (decorrelation.cutoff, decorrelation.stride());
    let values = run.values().slice(s![cutoff..;stride, ..]).to_owned();

    log::debug!(
        "Condition {}, rep {}: cutoff {}, g {:.2}, {} of {} samples kept",
        run.token(),
        run.rep(),
        decorrelation.cutoff,
        decorrelation.g,
        values.len_of(Axis(0)),
        run.len()
    );

    Ok(DecorrelatedRun {
        condition: run.condition(),
        token: run.token().to_string(),
        rep: run.rep(),
        decorrelation,
        tags: run.tags().to_vec(),
        values,
    })
}
