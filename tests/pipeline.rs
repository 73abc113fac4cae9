use remc_mbar::conditions::*;
use remc_mbar::decorrelate::DecorrelationParamsBuilder;
use remc_mbar::outputs::RepSelection;
use remc_mbar::report::*;
use remc_mbar::testsystems::GammaDensityOfStates;
use remc_mbar::AnalysisError;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

const TEMPS: [f64; 2] = [300.0, 320.0];
const SAMPLES: usize = 10_000;

fn temp_space() -> ConditionSpace {
    ConditionSpace::new(
        vec![ConditionAxis::new(TEMP_AXIS, TEMPS.to_vec())],
        ConditionsFileformatter::new(vec![FileformatSpec::new(TEMP_AXIS, ValueFormat::Plain)]),
    )
    .unwrap()
}

/// Write one rep of i.i.d. gamma distributed energies for every temperature
fn write_inputs(dir: &Path) -> GammaDensityOfStates {
    let system = GammaDensityOfStates::default();
    let space = temp_space();
    fs::create_dir_all(dir.join("inputs")).unwrap();
    for (k, condition) in space.iter().enumerate() {
        system
            .write_outputs(
                &dir.join("inputs/sim"),
                k,
                space.token(k),
                0,
                condition.temp(),
                SAMPLES,
                42 + k as u64,
            )
            .unwrap();
    }
    system
}

fn config(dir: &Path) -> AnalysisConfigBuilder {
    let mut builder = AnalysisConfigBuilder::default();
    builder
        .filebase(dir.join("inputs/sim"))
        .output_filebase(dir.join("outputs/sim"))
        .reps(RepSelection::Explicit(vec![0]))
        .decorrelation(DecorrelationParamsBuilder::default().nskip(50).build().unwrap());
    builder
}

#[test]
fn two_temperature_free_energy_difference() {
    let dir = TempDir::new().unwrap();
    let system = write_inputs(dir.path());

    let config = config(dir.path())
        .tags(vec!["tenergy".to_string(), "energylevel".to_string()])
        .pmf_tags(vec!["energylevel".to_string()])
        .build()
        .unwrap();
    let report = Analysis::new(temp_space(), config).run().unwrap();

    // Independent samples are not thinned
    for run in &report.runs {
        assert!(run.decorrelation.g < 1.5, "g = {}", run.decorrelation.g);
        assert!(run.retained > SAMPLES / 2);
    }

    let expected =
        system.analytical_free_energy(TEMPS[1]) - system.analytical_free_energy(TEMPS[0]);
    let delta_f = report.offsets.difference(0, 1);
    assert!(
        (delta_f - expected).abs() < 0.05,
        "delta f = {}, expected {}",
        delta_f,
        expected
    );

    // Mean energies follow the temperature
    let (tag, energies) = &report.expectations[0];
    assert_eq!(tag, "tenergy");
    for (estimate, &temp) in energies.iter().zip(TEMPS.iter()) {
        let mean = system.analytical_mean_energy(temp);
        assert!((estimate.value - mean).abs() < 5.0 * estimate.uncertainty + 1.0);
    }

    let out = dir.path().join("outputs");
    for name in &[
        "sim.fes",
        "sim.decor",
        "sim-tenergy.aves",
        "sim-energylevel.aves",
        "sim-300-energylevel.lfes",
        "sim-320-energylevel.lfes",
    ] {
        assert!(out.join(name).is_file(), "{} was not written", name);
    }

    let lfes = fs::read_to_string(out.join("sim-300-energylevel.lfes")).unwrap();
    let population: f64 = lfes
        .lines()
        .skip(1)
        .map(|line| line.split_whitespace().last().unwrap().parse::<f64>().unwrap())
        .sum();
    let n_tot: usize = report.runs.iter().map(|run| run.retained).sum();
    assert!((population - n_tot as f64).abs() < 1.0e-6 * n_tot as f64);
}

#[test]
fn missing_rep_aborts_the_analysis() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());

    let config = config(dir.path())
        .reps(RepSelection::Explicit(vec![0, 1]))
        .build()
        .unwrap();
    match Analysis::new(temp_space(), config).run() {
        Err(AnalysisError::DataUnavailable { condition, rep, path }) => {
            assert!(condition == "300" || condition == "320");
            assert_eq!(rep, 1);
            assert!(path.to_string_lossy().ends_with(&format!("sim-{}_1.ene", condition)));
        }
        other => panic!("unexpected result {:?}", other.map(|report| report.written)),
    }
    assert!(!dir.path().join("outputs").exists());
}

#[test]
fn command_line_driver() {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());

    let status = Command::new(env!("CARGO_BIN_EXE_remc-mbar"))
        .arg("sim")
        .arg(dir.path().join("inputs"))
        .arg(dir.path().join("outputs"))
        .args(["1.0", "-1000"])
        .args(["--temps", "300", "320"])
        .args(["--tags", "energylevel"])
        .args(["--tag-pairs", "energylevel,energylevel"])
        .args(["--nskip", "50"])
        .status()
        .unwrap();
    assert!(status.success());

    let out = dir.path().join("outputs");
    assert!(out.join("sim.fes").is_file());
    assert!(out.join("sim-energylevel.aves").is_file());
    assert!(out.join("sim-320-energylevel-energylevel.lfes").is_file());

    // Without tags, every order parameter gets a PMF
    let status = Command::new(env!("CARGO_BIN_EXE_remc-mbar"))
        .arg("sim")
        .arg(dir.path().join("inputs"))
        .arg(dir.path().join("all"))
        .args(["1.0", "-1000"])
        .args(["--temps", "300", "320"])
        .args(["--nskip", "50"])
        .status()
        .unwrap();
    assert!(status.success());

    let all = dir.path().join("all");
    assert!(all.join("sim-tenergy.aves").is_file());
    assert!(all.join("sim-energylevel.aves").is_file());
    for token in ["300", "320"] {
        assert!(all.join(format!("sim-{}-energylevel.lfes", token)).is_file());
        assert!(!all.join(format!("sim-{}-tenergy.lfes", token)).exists());
    }

    // A missing rep is reported with a failing exit status
    let status = Command::new(env!("CARGO_BIN_EXE_remc-mbar"))
        .arg("sim")
        .arg(dir.path().join("inputs"))
        .arg(dir.path().join("outputs"))
        .args(["1.0", "-1000"])
        .args(["--temps", "300", "320"])
        .args(["--reps", "0", "3"])
        .status()
        .unwrap();
    assert!(!status.success());
}
