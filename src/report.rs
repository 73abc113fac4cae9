//! Running the whole analysis and writing its tables.
//!
//! Every table is a plain text file with one header line and space separated columns. Undefined
//! values are written as `nan`.

use crate::conditions::ConditionSpace;
use crate::decorrelate::{decorrelate_run, DecorrelatedRun, DecorrelationParams};
use crate::errors::*;
use crate::outputs::{
    read_condition_runs, table_writer, RepSelection, ENERGY_KIND, ORDER_PARAMS_KIND,
};
use crate::reweight::*;
use ndarray::Array1;
use rayon::prelude::*;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything an analysis of one condition space needs besides the space itself
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct AnalysisConfig {
    /// Simulation outputs are read from `{filebase}-{token}_{rep}.{kind}`
    #[builder(setter(into))]
    pub filebase: PathBuf,

    /// Tables are written to `{output_filebase}-...` and `{output_filebase}.{ext}`
    #[builder(setter(into))]
    pub output_filebase: PathBuf,

    #[allow(missing_docs)]
    #[builder(default)]
    pub reps: RepSelection,

    /// File kinds read for every run
    #[builder(default = "vec![ENERGY_KIND.to_string(), ORDER_PARAMS_KIND.to_string()]")]
    pub kinds: Vec<String>,

    /// Tags to report expectations of; every pooled tag if empty
    #[builder(default)]
    pub tags: Vec<String>,

    /// Tags to compute one-dimensional PMFs along; every pooled tag but the energy tag if empty
    #[builder(default)]
    pub pmf_tags: Vec<String>,

    /// Pairs of tags to compute two-dimensional PMFs along
    #[builder(default)]
    pub tag_pairs: Vec<(String, String)>,

    /// Binning of every PMF axis
    #[builder(default = "Bins::Discrete")]
    pub bins: Bins,

    #[allow(missing_docs)]
    #[builder(default)]
    pub decorrelation: DecorrelationParams,

    #[allow(missing_docs)]
    #[builder(default)]
    pub potential: PotentialSettings,

    #[allow(missing_docs)]
    #[builder(default)]
    pub reweight: ReweightParams,
}

impl AnalysisConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(kinds) = &self.kinds {
            if kinds.is_empty() {
                return Err("at least one output file kind must be read".to_string());
            }
        }
        if let Some(RepSelection::Explicit(reps)) = &self.reps {
            if reps.is_empty() {
                return Err("an explicit rep selection must name at least one rep".to_string());
            }
        }

        Ok(())
    }
}

/// Everything an analysis estimated
#[derive(Debug)]
pub struct Report {
    /// Free energy of every condition relative to the first
    pub offsets: FreeEnergyOffsets,
    /// Effective number of samples at every condition
    pub n_eff: Array1<f64>,
    /// Decorrelation of every run that was pooled
    pub runs: Vec<RunSummary>,
    /// Expectations of every reported tag, one estimate per condition
    pub expectations: Vec<(String, Vec<Estimate>)>,
    /// One-dimensional PMFs of every PMF tag, one per condition
    pub pmfs_1d: Vec<Vec<Pmf1d>>,
    /// Two-dimensional PMFs of every tag pair, one per condition
    pub pmfs_2d: Vec<Vec<Pmf2d>>,
    /// Every table that was written
    pub written: Vec<PathBuf>,
}

/// Loads, decorrelates and reweights the output of a condition space
#[derive(Debug)]
pub struct Analysis {
    space: ConditionSpace,
    config: AnalysisConfig,
}

impl Analysis {
    #[allow(missing_docs)]
    pub fn new(space: ConditionSpace, config: AnalysisConfig) -> Self {
        Self { space, config }
    }

    #[allow(missing_docs)]
    pub fn space(&self) -> &ConditionSpace {
        &self.space
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Read and decorrelate every run of every condition
    ///
    /// Conditions are processed in parallel; runs come back in condition then rep order.
    pub fn load(&self) -> Result<Vec<DecorrelatedRun>> {
        let config = &self.config;
        let per_condition = (0..self.space.len())
            .into_par_iter()
            .map(|k| {
                let runs = read_condition_runs(
                    &config.filebase,
                    &self.space,
                    k,
                    &config.reps,
                    &config.kinds,
                )?;
                runs.iter()
                    .map(|run| {
                        decorrelate_run(run, &config.potential.energy_tag, &config.decorrelation)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let runs: Vec<DecorrelatedRun> = per_condition.into_iter().flatten().collect();
        log::info!(
            "Loaded and decorrelated {} runs of {} conditions",
            runs.len(),
            self.space.len()
        );
        Ok(runs)
    }

    /// Pool the decorrelated runs and fit MBAR to them
    pub fn fit(&self, runs: Vec<DecorrelatedRun>) -> Result<Reweighter> {
        let pooled = PooledSamples::pool(&self.space, runs)?;
        let potentials =
            ReducedPotentialMatrix::build(&self.space, &pooled, &self.config.potential)?;
        Reweighter::fit(pooled, potentials, &self.config.reweight)
    }

    /// Estimate everything the config asks for from a fitted reweighter
    pub fn estimate(&self, reweighter: &Reweighter) -> Result<Report> {
        let config = &self.config;
        let targets = self.space.conditions();

        let tags = if config.tags.is_empty() {
            reweighter.pooled().tags().to_vec()
        } else {
            config.tags.clone()
        };
        let expectations = tags
            .into_iter()
            .map(|tag| {
                let estimates = reweighter.expectations(&Observable::Tag(tag.as_str()), targets)?;
                Ok((tag, estimates))
            })
            .collect::<Result<Vec<_>>>()?;

        let pmf_tags = if config.pmf_tags.is_empty() {
            reweighter
                .pooled()
                .tags()
                .iter()
                .filter(|&tag| *tag != config.potential.energy_tag)
                .cloned()
                .collect()
        } else {
            config.pmf_tags.clone()
        };
        let pmfs_1d = pmf_tags
            .iter()
            .map(|tag| reweighter.pmf_1d(tag, &config.bins, targets))
            .collect::<Result<Vec<_>>>()?;

        let pmfs_2d = config
            .tag_pairs
            .iter()
            .map(|(tag_a, tag_b)| {
                reweighter.pmf_2d(
                    (tag_a.as_str(), tag_b.as_str()),
                    (&config.bins, &config.bins),
                    targets,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Report {
            offsets: reweighter.free_energies()?,
            n_eff: reweighter.n_eff(),
            runs: reweighter.pooled().runs().to_vec(),
            expectations,
            pmfs_1d,
            pmfs_2d,
            written: Vec::new(),
        })
    }

    /// Write every table of a report
    pub fn write(&self, report: &mut Report) -> Result<()> {
        let out = &self.config.output_filebase;
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AnalysisError::io(parent, e))?;
        }

        let mut written = Vec::new();

        let path = output_filepath(out, ".fes");
        write_free_energies(&path, &self.space, &report.offsets, &report.n_eff)?;
        written.push(path);

        let path = output_filepath(out, ".decor");
        write_decorrelation(&path, &report.runs)?;
        written.push(path);

        for (tag, estimates) in &report.expectations {
            let path = output_filepath(out, &format!("-{}.aves", tag));
            write_expectations(&path, &self.space, estimates)?;
            written.push(path);
        }

        for pmfs in &report.pmfs_1d {
            for (k, pmf) in pmfs.iter().enumerate() {
                let path = output_filepath(
                    out,
                    &format!("-{}-{}.lfes", self.space.token(k), pmf.tag),
                );
                write_pmf_1d(&path, pmf)?;
                written.push(path);
            }
        }

        for pmfs in &report.pmfs_2d {
            for (k, pmf) in pmfs.iter().enumerate() {
                let path = output_filepath(
                    out,
                    &format!("-{}-{}-{}.lfes", self.space.token(k), pmf.tags.0, pmf.tags.1),
                );
                write_pmf_2d(&path, pmf)?;
                written.push(path);
            }
        }

        report.written = written;
        Ok(())
    }

    /// Load, fit, estimate and write
    pub fn run(&self) -> Result<Report> {
        let runs = self.load()?;
        let reweighter = self.fit(runs)?;
        let mut report = self.estimate(&reweighter)?;
        self.write(&mut report)?;
        Ok(report)
    }
}

/// `{base}{suffix}`, appending to the file name rather than replacing an extension
pub fn output_filepath(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn format_option(value: Option<f64>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "nan".to_string(),
    }
}

/// Write a table whole: a header record, then one record per row
fn write_table<R, I>(path: &Path, header: &[&str], rows: R) -> Result<()>
where
    R: IntoIterator<Item = I>,
    I: IntoIterator<Item = String>,
{
    let mut writer = table_writer(path)?;
    writer
        .write_record(header)
        .map_err(|e| AnalysisError::table(path, e))?;
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| AnalysisError::table(path, e))?;
    }
    writer.flush().map_err(|e| AnalysisError::io(path, e))?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

fn write_free_energies(
    path: &Path,
    space: &ConditionSpace,
    offsets: &FreeEnergyOffsets,
    n_eff: &Array1<f64>,
) -> Result<()> {
    write_table(
        path,
        &["condition", "f", "df", "n_eff"],
        (0..space.len()).map(|k| {
            vec![
                space.token(k).to_string(),
                offsets.f_k[k].to_string(),
                offsets.d_f_k[k].to_string(),
                n_eff[k].to_string(),
            ]
        }),
    )
}

fn write_decorrelation(path: &Path, runs: &[RunSummary]) -> Result<()> {
    write_table(
        path,
        &["condition", "rep", "cutoff", "g", "retained"],
        runs.iter().map(|run| {
            vec![
                run.token.clone(),
                run.rep.to_string(),
                run.decorrelation.cutoff.to_string(),
                run.decorrelation.g.to_string(),
                run.retained.to_string(),
            ]
        }),
    )
}

fn write_expectations(path: &Path, space: &ConditionSpace, estimates: &[Estimate]) -> Result<()> {
    write_table(
        path,
        &["condition", "value", "uncertainty"],
        estimates.iter().enumerate().map(|(k, estimate)| {
            vec![
                space.token(k).to_string(),
                estimate.value.to_string(),
                estimate.uncertainty.to_string(),
            ]
        }),
    )
}

fn bin_fields(bin: &PmfBin) -> [String; 3] {
    [
        format_option(bin.free_energy),
        format_option(bin.uncertainty),
        bin.population.to_string(),
    ]
}

fn write_pmf_1d(path: &Path, pmf: &Pmf1d) -> Result<()> {
    write_table(
        path,
        &[pmf.tag.as_str(), "f", "df", "population"],
        pmf.bins
            .iter()
            .map(|(value, bin)| std::iter::once(value.to_string()).chain(bin_fields(bin))),
    )
}

fn write_pmf_2d(path: &Path, pmf: &Pmf2d) -> Result<()> {
    write_table(
        path,
        &[pmf.tags.0.as_str(), pmf.tags.1.as_str(), "f", "df", "population"],
        pmf.bins.iter().map(|((a, b), bin)| {
            [a.to_string(), b.to_string()]
                .into_iter()
                .chain(bin_fields(bin))
        }),
    )
}
