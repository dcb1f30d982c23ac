use std::fs::File;

use approx::assert_relative_eq;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use rand_isaac::Isaac64Rng;
use serde::Serialize;
use tempdir::TempDir;

use isocal::config::PipelinePlan;
use isocal::{Config, Error, Pipeline, PeakTable, Result, StandardsTable};

const SLOPE: f64 = 0.98;
const OFFSET: f64 = 0.5;
const DRIFT_PER_PEAK: f64 = 0.01;
const NOISE: f64 = 0.02;
const REFERENCE: f64 = -30.;

const PLAN: &str = r#"
[config]
parallel = true

[config.propagation]
method = "delta_method"

[[stages]]
name = "drift"
select = "lin"
use_in_calibration = { groups = ["drift"] }

[[stages.models]]
label = "mean"
response = "d13C"
form = "constant"

[[stages.models]]
label = "lin"
response = "d13C"
form = "linear"
predictor = "time"

[[stages]]
name = "scale"
select = "two_point"
target = "true_d13C"
range = ["d13C_dev"]
use_in_calibration = { groups = ["std"], require = ["is_std_peak"] }

[[stages.outliers]]
rule = "deviation"
column = "d13C_dev"
k = 3.0

[[stages.models]]
label = "two_point"
response = "d13C_dev"
form = "linear"
predictor = "true_d13C"
"#;

#[derive(Serialize)]
struct Peak {
    analysis: String,
    peak_nr: usize,
    #[serde(rename = "type")]
    kind: String,
    compound: String,
    time: f64,
    #[serde(rename = "d13C")]
    d13c: f64,
}

#[derive(Serialize)]
struct Standard {
    compound: &'static str,
    #[serde(rename = "true_d13C")]
    true_d13c: f64,
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn measured<R: Rng>(true_value: f64, time: f64, rng: &mut R) -> f64 {
    let noise: f64 = rng.sample(StandardNormal);
    SLOPE.mul_add(true_value, OFFSET) + DRIFT_PER_PEAK * time + NOISE * noise
}

/// A sequence of reference gas, three standards, reference gas and one sample, five times over
fn generate_run<R: Rng>(rng: &mut R) -> (Vec<Peak>, Vec<Standard>) {
    let standards = vec![
        Standard {
            compound: "C16",
            true_d13c: -30.,
        },
        Standard {
            compound: "C18",
            true_d13c: -25.,
        },
        Standard {
            compound: "C20",
            true_d13c: -20.,
        },
    ];
    let samples = [-27., -22., -35., -27., -22.];

    let mut peaks = vec![];
    for (cycle, sample) in samples.iter().enumerate() {
        let mut layout = vec![("drift", "ref".to_owned(), REFERENCE)];
        layout.extend(
            standards
                .iter()
                .map(|s| ("std", s.compound.to_owned(), s.true_d13c)),
        );
        layout.push(("drift", "ref".to_owned(), REFERENCE));
        layout.push(("sample", format!("s{cycle}"), *sample));

        for (peak_nr, (kind, compound, true_value)) in layout.into_iter().enumerate() {
            let time = peaks.len() as f64;
            peaks.push(Peak {
                analysis: format!("run{cycle}"),
                peak_nr,
                kind: kind.to_owned(),
                compound,
                time,
                d13c: measured(true_value, time, rng),
            });
        }
    }
    (peaks, standards)
}

fn write_csv<T: Serialize>(path: &std::path::Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn prepare_run(test_name: &str) -> Result<(TempDir, PeakTable, StandardsTable)> {
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let (peaks, standards) = generate_run(&mut rng);

    let tmp_dir = TempDir::new(test_name)?;
    let peaks_path = tmp_dir.path().join("peaks.csv");
    let standards_path = tmp_dir.path().join("standards.csv");
    write_csv(&peaks_path, &peaks)?;
    write_csv(&standards_path, &standards)?;

    let table = PeakTable::from_csv(
        File::open(peaks_path)?,
        &["analysis", "peak_nr"],
        "type",
        &["time", "d13C"],
    )?;
    let standards = StandardsTable::from_csv(File::open(standards_path)?, "compound")?;
    Ok((tmp_dir, table, standards))
}

#[test]
fn drift_then_scale_calibration_recovers_sample_values() -> Result<()> {
    init_logging();
    let (tmp_dir, table, standards) = prepare_run("drift_then_scale_calibration")?;
    let plan_path = tmp_dir.path().join("plan.toml");
    std::fs::write(&plan_path, PLAN)?;
    let plan = PipelinePlan::from_file(&plan_path)?;

    let mut pipeline = Pipeline::new(table, plan.config.clone());
    assert_eq!(pipeline.match_standards(&standards, "compound")?, 15);
    pipeline.run(&plan)?;

    // the drifting model explains the reference gas better than a constant
    let summary = pipeline.stage("drift")?.summary();
    let aic = |label: &str| {
        summary
            .iter()
            .find(|s| s.label == label)
            .and_then(|s| s.diagnostics.aic)
            .unwrap()
    };
    assert!(aic("lin") < aic("mean"));

    let scale = &pipeline.select("scale", "two_point")?[0];
    assert_relative_eq!(scale.coefficients().unwrap()[1], SLOPE, epsilon = 0.01);

    let table = pipeline.table();
    let kinds = table.text("type").unwrap();
    let predicted = table.numeric("true_d13C_pred").unwrap();
    let errors = table.numeric("true_d13C_pred_se").unwrap();
    let in_range = table.flag("scale_d13C_dev_in_range").unwrap();
    let compounds = table.text("compound").unwrap();

    let expected = [-27., -22., -35., -27., -22.];
    let sample_rows = (0..table.num_rows())
        .filter(|&row| kinds[row].as_deref() == Some("sample"))
        .collect::<Vec<_>>();
    assert_eq!(sample_rows.len(), expected.len());
    for (&row, &truth) in sample_rows.iter().zip(&expected) {
        assert!(compounds[row].as_deref().unwrap().starts_with('s'));
        assert_relative_eq!(predicted[row].unwrap(), truth, epsilon = 0.15);
        let se = errors[row].unwrap();
        assert!(se > 0. && se < 0.2, "standard error {se}");
        assert_eq!(in_range[row], Some(truth > -30.));
    }

    // samples have no true value to compare against
    let deviations = table.numeric("true_d13C_dev").unwrap();
    assert!(sample_rows.iter().all(|&row| deviations[row].is_none()));
    assert_eq!(
        table.flag("is_outlier").unwrap().iter().filter(|f| **f == Some(true)).count(),
        0
    );
    Ok(())
}

#[test]
fn recomputing_a_run_is_reproducible() -> Result<()> {
    init_logging();
    let (tmp_dir, table, standards) = prepare_run("recomputing_a_run_is_reproducible")?;
    let plan: PipelinePlan = toml::from_str(PLAN)?;

    let mut first = Pipeline::new(table.clone(), plan.config.clone());
    first.match_standards(&standards, "compound")?;
    first.run(&plan)?;

    let mut serial = Pipeline::new(
        table,
        Config {
            parallel: false,
            ..plan.config.clone()
        },
    );
    serial.match_standards(&standards, "compound")?;
    serial.run(&plan)?;
    assert_eq!(first.table(), serial.table());

    // a second pass over the same table refreshes each stage's own columns with equal values
    let before = first.table().clone();
    first.run(&plan)?;
    assert_eq!(first.table(), &before);
    drop(tmp_dir);
    Ok(())
}

#[test]
fn selecting_an_unfitted_label_aborts_the_run() -> Result<()> {
    init_logging();
    let (_tmp_dir, table, standards) = prepare_run("selecting_an_unfitted_label")?;
    let mut plan: PipelinePlan = toml::from_str(PLAN)?;
    plan.stages[0].select = Some("quadratic".into());

    let mut pipeline = Pipeline::new(table, Config::default());
    pipeline.match_standards(&standards, "compound")?;
    match pipeline.run(&plan) {
        Err(Error::UnknownCalibration { stage, label }) => {
            assert_eq!(stage, "drift");
            assert_eq!(label, "quadratic");
        }
        other => panic!("expected an unknown calibration, got {other:?}"),
    }
    assert!(pipeline.stage("scale").is_err());
    Ok(())
}
