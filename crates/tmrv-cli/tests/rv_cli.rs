use serde_json::json;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

const SPEED_OF_LIGHT_KMS: f64 = 299_792.458;

fn run_tmrv(args: &[&str]) -> std::process::Output {
    let binary_path = env!("CARGO_BIN_EXE_tmrv");
    let mut command = Command::new(binary_path);
    command.args(args);
    command.output().expect("tmrv should run")
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir should be created");
    }
    fs::write(path, content).expect("file should be written");
}

/// One single-order exposure with three absorption lines. `line_width`
/// controls how narrow the lines are in log-wavelength.
fn write_exposure(dir: &Path, name: &str, id: &str, bjd: f64, line_width: f64) {
    let base = 8.50;
    let wavelength: Vec<f64> = (0..400).map(|i| base + 4.0e-6 * i as f64).collect();
    let flux: Vec<f64> = wavelength
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let mut t = 1.0;
            for (offset, depth) in [(4.0e-4, 0.45), (9.0e-4, 0.60), (1.4e-3, 0.50)] {
                let z = (w - (base + offset)) / line_width;
                t -= depth * (-0.5 * z * z).exp();
            }
            let bump = ((i * 97 + 13) % 23) as f64 / 23.0 - 0.5;
            1000.0 * t * (1.0 + bump / 800.0)
        })
        .collect();
    let record = json!({
        "id": id,
        "bjd": bjd,
        "orders": [{
            "wavelength": wavelength,
            "flux": flux,
            "error": vec![4.0; 400],
        }],
    });
    write_file(
        &dir.join(name),
        &serde_json::to_string_pretty(&record).expect("encode exposure"),
    );
}

fn write_star_dataset(dir: &Path) {
    write_exposure(dir, "exp_01.json", "e1", 2459000.1, 2.6e-5);
    write_exposure(dir, "exp_02.json", "e2", 2459001.1, 2.6e-5);
    write_exposure(dir, "exp_03.json", "e3", 2459002.1, 2.6e-5);
}

const BASE_CONFIG: &str = r#"
{
  "pixel_window": { "min_px": 20, "max_px": 380 },
  "snr_limits": { "min": 10.0, "max": 2000.0 }
}
"#;

#[test]
fn rv_run_writes_tables_and_a_template() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_star_dataset(&data_dir);
    let config_path = temp.path().join("run.json");
    write_file(&config_path, BASE_CONFIG);
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "rv",
        "--config",
        config_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
        "--store-template",
    ]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "rv run should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("least-squares run over 3 exposures (3 usable)."),
        "stdout should summarize the run: {stdout}"
    );
    assert!(stdout.contains("e1") && stdout.contains("BJD"));
    assert!(stdout.contains("Artifacts:"));

    for name in ["rvo.dat", "rv.dat", "rvc.dat", "diagnostics.dat", "template.json"] {
        assert!(out_dir.join(name).is_file(), "missing artifact {name}");
    }
    let rv_table = fs::read_to_string(out_dir.join("rv.dat")).expect("rv table");
    assert!(rv_table.starts_with("# "));
    assert_eq!(rv_table.lines().filter(|l| !l.starts_with('#')).count(), 3);
}

#[test]
fn template_subcommand_reports_seeding() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_star_dataset(&data_dir);
    let config_path = temp.path().join("run.json");
    write_file(&config_path, BASE_CONFIG);
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "template",
        "--config",
        config_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "template run should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Template coadded from 3 exposures"),
        "stdout should report the coadd: {stdout}"
    );
    assert!(out_dir.join("template.json").is_file());
    assert!(out_dir.join("prerv.dat").is_file());
}

#[test]
fn indices_run_measures_configured_windows() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_star_dataset(&data_dir);
    let config_path = temp.path().join("run.json");
    // The middle line of the order sits near 4919.2 A in linear wavelength.
    write_file(
        &config_path,
        r#"
{
  "pixel_window": { "min_px": 20, "max_px": 380 },
  "snr_limits": { "min": 10.0, "max": 2000.0 },
  "index_windows": [{
    "name": "fe4919",
    "line": [4918.8, 4919.6],
    "reference_low": [4917.3, 4918.3],
    "reference_high": [4920.1, 4921.1]
  }]
}
"#,
    );
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "indices",
        "--config",
        config_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "indices run should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Indices over 3 exposures (3 usable)."),
        "stdout should summarize the indices: {stdout}"
    );
    assert!(stdout.contains("fe4919"));
    assert!(out_dir.join("indices.dat").is_file());
}

#[test]
fn indices_without_windows_are_rejected() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_star_dataset(&data_dir);
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "indices",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("ERROR: [INDEX_WINDOWS]"),
        "stderr should name the missing windows: {stderr}"
    );
    assert!(stderr.contains("FATAL EXIT CODE: 2"));
}

#[test]
fn ccf_run_consumes_a_line_mask() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    // Narrow lines, a couple of km/s wide, suit the ccf grid.
    write_exposure(&data_dir, "exp_01.json", "e1", 2459000.1, 8.5e-6);
    write_exposure(&data_dir, "exp_02.json", "e2", 2459001.1, 8.5e-6);
    write_exposure(&data_dir, "exp_03.json", "e3", 2459002.1, 8.5e-6);

    let config_path = temp.path().join("run.json");
    write_file(
        &config_path,
        r#"
{
  "grid": { "start_kms": -12.0, "stop_kms": 12.05, "step_kms": 0.25 },
  "pixel_window": { "min_px": 20, "max_px": 380 },
  "snr_limits": { "min": 10.0, "max": 2000.0 }
}
"#,
    );

    let half = 1.5 / SPEED_OF_LIGHT_KMS;
    let lines: Vec<serde_json::Value> = [8.5004, 8.5009, 8.5014]
        .iter()
        .map(|&center: &f64| {
            json!({ "begin": center - half, "end": center + half, "weight": 1.0 })
        })
        .collect();
    let mask_path = temp.path().join("mask.json");
    write_file(
        &mask_path,
        &serde_json::to_string(&lines).expect("encode mask"),
    );
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "ccf",
        "--config",
        config_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
        "--line-mask",
        mask_path.to_str().unwrap(),
    ]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "ccf run should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("ccf-box run over 3 exposures"),
        "stdout should summarize the run: {stdout}"
    );
    let rvo = fs::read_to_string(out_dir.join("rvo.dat")).expect("order table");
    assert!(rvo.contains("ccf-box"));
}

#[test]
fn ccf_without_a_line_mask_is_rejected() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_star_dataset(&data_dir);
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "ccf",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("ERROR: [CCF_MASK]"),
        "stderr should name the missing mask: {stderr}"
    );
}

#[test]
fn drift_run_against_a_named_reference() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_exposure(&data_dir, "exp_01.json", "e1", 2459000.1, 2.6e-5);
    write_exposure(&data_dir, "exp_02.json", "e2", 2459001.1, 2.6e-5);
    let config_path = temp.path().join("run.json");
    write_file(&config_path, BASE_CONFIG);
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "drift",
        "--config",
        config_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
        "--reference",
        "e1",
    ]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "drift run should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("drift run over 2 exposures"),
        "stdout should summarize the run: {stdout}"
    );
    let rvo = fs::read_to_string(out_dir.join("rvo.dat")).expect("order table");
    assert!(rvo.contains("drift"));
}

#[test]
fn empty_dataset_exits_with_input_validation() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    fs::create_dir_all(&data_dir).expect("data dir should be created");
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "rv",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--pattern",
        "exp_*.json",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(
        output.status.code(),
        Some(2),
        "empty dataset should map to the input-validation exit code"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("ERROR: [DATA_EMPTY]"),
        "stderr should carry the diagnostic: {stderr}"
    );
    assert!(stderr.contains("FATAL EXIT CODE: 2"));
}

#[test]
fn unknown_config_field_is_rejected() {
    let temp = TempDir::new().expect("tempdir should be created");
    let data_dir = temp.path().join("data");
    write_star_dataset(&data_dir);
    let config_path = temp.path().join("run.json");
    write_file(&config_path, r#"{ "grid_step": 0.1 }"#);
    let out_dir = temp.path().join("out");

    let output = run_tmrv(&[
        "rv",
        "--config",
        config_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("CONFIG_PARSE"),
        "stderr should point at the configuration: {stderr}"
    );
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let output = run_tmrv(&["rv", "--no-such-flag"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("ERROR: [CLI_USAGE]"),
        "stderr should carry the usage diagnostic: {stderr}"
    );
}

#[test]
fn help_exits_cleanly() {
    let output = run_tmrv(&["--help"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage"), "help should print usage: {stdout}");
}
