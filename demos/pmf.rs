use anyhow::Result;
use remc_mbar::conditions::*;
use remc_mbar::decorrelate::DecorrelationParamsBuilder;
use remc_mbar::report::*;
use remc_mbar::reweight::Observable;
use remc_mbar::testsystems::GammaDensityOfStates;
use std::fs;
use tempfile::TempDir;

const TEMPS: [f64; 4] = [300.0, 310.0, 320.0, 330.0];
const REPS: usize = 2;
const SAMPLES: usize = 5000;

fn temp_space(temps: &[f64]) -> remc_mbar::Result<ConditionSpace> {
    ConditionSpace::new(
        vec![ConditionAxis::new(TEMP_AXIS, temps.to_vec())],
        ConditionsFileformatter::new(vec![FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain)]),
    )
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Simulated output of every rep at every temperature
    let dir = TempDir::new()?;
    fs::create_dir_all(dir.path().join("inputs"))?;
    let system = GammaDensityOfStates::default();
    let space = temp_space(&TEMPS)?;
    for (k, condition) in space.iter().enumerate() {
        for rep in 0..REPS {
            system.write_outputs(
                &dir.path().join("inputs/gamma"),
                k,
                space.token(k),
                rep,
                condition.temp(),
                SAMPLES,
                (REPS * k + rep) as u64,
            )?;
        }
    }

    let config = AnalysisConfigBuilder::default()
        .filebase(dir.path().join("inputs/gamma"))
        .output_filebase(dir.path().join("outputs/gamma"))
        .pmf_tags(vec!["energylevel".to_string()])
        .decorrelation(
            DecorrelationParamsBuilder::default()
                .nskip(10)
                .build()
                .map_err(anyhow::Error::msg)?,
        )
        .build()
        .map_err(anyhow::Error::msg)?;
    let analysis = Analysis::new(space, config);
    let report = analysis.run()?;

    println!("condition f analytical df");
    for (k, &temp) in TEMPS.iter().enumerate() {
        let analytical =
            system.analytical_free_energy(temp) - system.analytical_free_energy(TEMPS[0]);
        println!(
            "{} {:.4} {:.4} {:.4}",
            analysis.space().token(k),
            report.offsets.f_k[k],
            analytical,
            report.offsets.d_f_k[k]
        );
    }

    for (tag, estimates) in &report.expectations {
        println!("<{}>: {:?}", tag, estimates);
    }

    // PMF along the energy level at the lowest temperature
    for (level, bin) in &report.pmfs_1d[0][0].bins {
        println!("{} {:?} {:?} {:.1}", level, bin.free_energy, bin.uncertainty, bin.population);
    }

    // Reweight to a temperature that was never simulated
    let reweighter = analysis.fit(analysis.load()?)?;
    let unsampled = temp_space(&[315.0])?;
    let energy =
        reweighter.expectation(&Observable::from("tenergy"), &unsampled.conditions()[0])?;
    println!(
        "<tenergy> at 315 K: {:.1} +- {:.1} (analytical {:.1})",
        energy.value,
        energy.uncertainty,
        system.analytical_mean_energy(315.0)
    );

    for path in &report.written {
        println!("Wrote {}", path.display());
    }

    Ok(())
}
