use anyhow::{Context, Result};
use clap::Parser;
use remc_mbar::biases::{Bias, DistanceBias, StackingBias};
use remc_mbar::conditions::*;
use remc_mbar::decorrelate::DecorrelationParamsBuilder;
use remc_mbar::outputs::RepSelection;
use remc_mbar::report::{Analysis, AnalysisConfigBuilder};
use remc_mbar::reweight::{PotentialSettingsBuilder, ReweightParamsBuilder};
use std::path::PathBuf;

/// Carry out MBAR analysis on replica exchange Monte Carlo output
///
/// The exchange variables are temperature and, if stacking or distance bias multipliers are
/// given, the bias multiplier, in that order.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Base name for files
    filebase: String,

    /// Directory of inputs
    input_dir: PathBuf,

    /// Directory to output to
    output_dir: PathBuf,

    /// Staple molarity (mol/L)
    staple_m: f64,

    /// Stacking energy (kb K)
    #[arg(allow_negative_numbers = true)]
    stack_ene: f64,

    /// Temperatures (K)
    #[arg(long, num_args = 1.., required = true)]
    temps: Vec<f64>,

    /// Stacking energy multipliers; no bias if omitted
    #[arg(long, num_args = 1.., conflicts_with = "distance_mults")]
    stack_mults: Vec<f64>,

    /// Ramp of the distance bias on the summed domain distance
    #[arg(
        long,
        num_args = 3,
        value_names = ["MIN_DIST", "MAX_DIST", "MAX_BIAS"],
        requires = "distance_mults"
    )]
    distance_bias: Vec<f64>,

    /// Distance bias multipliers
    #[arg(long, num_args = 1.., requires = "distance_bias")]
    distance_mults: Vec<f64>,

    /// Reps to read for every condition; discovered if omitted
    #[arg(long, num_args = 1..)]
    reps: Vec<usize>,

    /// Order parameter tags to compute expectations and PMFs of; if omitted, expectations of
    /// every tag and PMFs of every tag but the energy
    #[arg(long, num_args = 1..)]
    tags: Vec<String>,

    /// Tag pairs to calculate 2D PMFs for (comma delimited)
    #[arg(long, num_args = 1.., value_parser = parse_tag_pair)]
    tag_pairs: Vec<(String, String)>,

    /// Tag of the total energy
    #[arg(long, default_value = "tenergy")]
    energy_tag: String,

    /// Output file kinds to read for every run
    #[arg(long, num_args = 1.., default_values_t = ["ene".to_string(), "ops".to_string()])]
    kinds: Vec<String>,

    /// Spacing of candidate equilibration cutoffs
    #[arg(long, default_value_t = 1)]
    nskip: usize,

    /// Lattice site volume (m³); with --staple-tag adds the staple chemical potential
    #[arg(long, requires = "staple_tag")]
    lattice_site_volume: Option<f64>,

    /// Tag of the number of bound staples
    #[arg(long, requires = "lattice_site_volume")]
    staple_tag: Option<String>,

    /// Iteration limit of the MBAR solver
    #[arg(long, default_value_t = 1000)]
    max_iterations: usize,

    /// Relative tolerance of the MBAR solver
    #[arg(long, default_value_t = 1.0e-6)]
    tolerance: f64,
}

fn parse_tag_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split(',').collect::<Vec<_>>().as_slice() {
        [a, b] if !a.is_empty() && !b.is_empty() => Ok((a.to_string(), b.to_string())),
        _ => Err(format!("expected two comma delimited tags, not {}", s)),
    }
}

fn construct_condition_space(args: &Args) -> remc_mbar::Result<ConditionSpace> {
    let mut axes = vec![
        ConditionAxis::new(TEMP_AXIS, args.temps.clone()),
        ConditionAxis::new(STAPLE_AXIS, vec![args.staple_m]),
    ];
    let mut specs = vec![FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain)];

    let biases: Vec<Bias> = match args.distance_bias.as_slice() {
        &[min_dist, max_dist, max_bias] => args
            .distance_mults
            .iter()
            .map(|&mult| DistanceBias::new(min_dist, max_dist, max_bias, mult).into())
            .collect(),
        _ => args
            .stack_mults
            .iter()
            .map(|&mult| StackingBias::new(args.stack_ene, mult).into())
            .collect(),
    };
    if !biases.is_empty() {
        axes.push(ConditionAxis::new(BIAS_AXIS, biases));
        specs.push(FileformatSpec::new(BIAS_AXIS, ValueFormat::Fixed(1)));
    }

    ConditionSpace::new(axes, ConditionsFileformatter::new(specs))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let space = construct_condition_space(&args)?;
    log::info!("Analysing {} conditions", space.len());
    let tokens: Vec<String> = (0..space.len())
        .map(|k| space.token(k).to_string())
        .collect();

    let reps = if args.reps.is_empty() {
        RepSelection::Discover
    } else {
        RepSelection::Explicit(args.reps.clone())
    };

    let mut potential = PotentialSettingsBuilder::default();
    potential.energy_tag(args.energy_tag.clone());
    if let (Some(tag), Some(volume)) = (&args.staple_tag, args.lattice_site_volume) {
        potential.staple_tag(tag.clone()).lattice_site_volume(volume);
    }

    let config = AnalysisConfigBuilder::default()
        .filebase(args.input_dir.join(&args.filebase))
        .output_filebase(args.output_dir.join(&args.filebase))
        .reps(reps)
        .kinds(args.kinds.clone())
        .tags(args.tags.clone())
        .pmf_tags(args.tags.clone())
        .tag_pairs(args.tag_pairs.clone())
        .decorrelation(
            DecorrelationParamsBuilder::default()
                .nskip(args.nskip)
                .build()
                .map_err(anyhow::Error::msg)?,
        )
        .potential(potential.build().map_err(anyhow::Error::msg)?)
        .reweight(
            ReweightParamsBuilder::default()
                .maximum_iterations(args.max_iterations)
                .relative_tolerance(args.tolerance)
                .build()
                .map_err(anyhow::Error::msg)?,
        )
        .build()
        .map_err(anyhow::Error::msg)?;

    let report = Analysis::new(space, config)
        .run()
        .with_context(|| format!("analysis of {} failed", args.filebase))?;

    for (k, f) in report.offsets.f_k.iter().enumerate() {
        log::info!(
            "Condition {}: f = {:.4} +- {:.4}, n_eff = {:.1}",
            tokens[k],
            f,
            report.offsets.d_f_k[k],
            report.n_eff[k]
        );
    }
    log::info!("Wrote {} tables", report.written.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remc_mbar::biases::DISTANCE_SUM_TAG;

    fn args(extra: &[&str]) -> Args {
        let base = ["remc-mbar", "sim", "in", "out", "1.0", "-1000", "--temps", "300", "310"];
        Args::parse_from(base.iter().chain(extra))
    }

    #[test]
    fn temperatures_alone_are_unbiased() {
        let space = construct_condition_space(&args(&[])).unwrap();
        assert_eq!(space.len(), 2);
        assert_eq!(space.token(1), "310");
        assert_eq!(*space.conditions()[0].bias(), Bias::NoBias);
    }

    #[test]
    fn stacking_multipliers_add_a_bias_axis() {
        let space = construct_condition_space(&args(&["--stack-mults", "0.5", "1.0"])).unwrap();
        assert_eq!(space.len(), 4);
        assert_eq!(space.token(1), "300-1.0");
        assert_eq!(
            *space.conditions()[0].bias(),
            Bias::from(StackingBias::new(-1000.0, 0.5))
        );
    }

    #[test]
    fn distance_bias_multipliers_add_a_bias_axis() {
        let space = construct_condition_space(&args(&[
            "--distance-bias",
            "2",
            "6",
            "100",
            "--distance-mults",
            "0.0",
            "2.0",
        ]))
        .unwrap();
        assert_eq!(space.len(), 4);
        assert_eq!(space.token(3), "310-2.0");
        let bias = space.conditions()[3].bias();
        assert_eq!(*bias, Bias::from(DistanceBias::new(2.0, 6.0, 100.0, 2.0)));
        assert_eq!(bias.order_parameter_tag(), Some(DISTANCE_SUM_TAG));
    }

    #[test]
    fn distance_bias_needs_multipliers_and_excludes_stacking() {
        let base = ["remc-mbar", "sim", "in", "out", "1.0", "-1000", "--temps", "300"];
        let parse = |extra: &[&str]| Args::try_parse_from(base.iter().chain(extra));
        assert!(parse(&["--distance-bias", "2", "6", "100"]).is_err());
        assert!(parse(&[
            "--distance-bias",
            "2",
            "6",
            "100",
            "--distance-mults",
            "1.0",
            "--stack-mults",
            "1.0"
        ])
        .is_err());
    }
}
