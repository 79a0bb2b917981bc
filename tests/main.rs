use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::*;
use std::process::Command;
use tempfile::{tempdir, TempDir};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join(name)
}

/// Input tree with one category holding the given fixtures.
fn input_dir(models: &[&str]) -> Result<TempDir, Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let category = dir.path().join("boxes");
    fs::create_dir_all(&category)?;
    for model in models {
        fs::copy(fixture(model), category.join(model))?;
    }
    Ok(dir)
}

fn generate(input: &Path, output: &Path, extra: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("generate")
        .arg(input)
        .arg(output)
        .args(&["--variations", "2", "--width", "32", "--height", "24", "--quiet"])
        .args(extra);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Rendering complete"));
    Ok(())
}

#[test]
fn generate_cube() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("generate")
        .arg(input.path())
        .arg(output.path())
        .args(&["--variations", "2", "--width", "32", "--height", "24", "--quiet"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Successfully rendered:   1"))
        .stdout(predicate::str::contains("Frames:                  10"));

    for view in &["front_left", "front_right", "back_left", "back_right", "top"] {
        for k in 1..=2 {
            let path = output.path().join(view).join("boxes").join(format!("cube_v{}.png", k));
            assert!(path.exists(), "missing {}", path.display());
        }
    }
    let manifest = fs::read_to_string(output.path().join("config.json"))?;
    assert!(manifest.contains("\"ENCLOSURE_SIZE\""));
    assert!(manifest.contains("\"VARIATIONS_PER_MODEL\": 2"));

    Ok(())
}

#[test]
fn generate_category_major() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &["--layout", "category-major", "--engine", "flat"])?;
    assert!(output.path().join("boxes/top/cube_v1.png").exists());
    assert!(!output.path().join("top").exists());
    Ok(())
}

#[test]
fn empty_model_fails_run_continues() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj", "empty.obj"])?;
    let output = tempdir()?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("generate")
        .arg(input.path())
        .arg(output.path())
        .args(&["--variations", "1", "--width", "16", "--height", "16", "--quiet"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Total models:            2"))
        .stdout(predicate::str::contains("Failed:                  1"));
    assert!(output.path().join("top/boxes/cube_v1.png").exists());
    assert!(!output.path().join("top/boxes/empty_v1.png").exists());
    Ok(())
}

#[test]
fn filter_removes_every_view() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &[])?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("filter")
        .arg(output.path())
        .args(&["--threshold", "0", "--quiet"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Deleted:     10"));
    assert!(!output.path().join("front_left/boxes/cube_v1.png").exists());
    assert!(!output.path().join("top/boxes/cube_v2.png").exists());
    Ok(())
}

#[test]
fn filter_dry_run() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &[])?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("filter")
        .arg(output.path())
        .args(&["--threshold", "0", "--debug", "--quiet"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Dry run"));
    assert!(output.path().join("top/boxes/cube_v1.png").exists());
    Ok(())
}

#[test]
fn analyze_and_calibrate() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &[])?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("analyze").arg(output.path()).args(&["--samples", "2"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Images:  2"))
        .stdout(predicate::str::contains("Median:"));

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("calibrate")
        .arg(output.path().join("top/boxes/cube_v1.png"))
        .arg(output.path().join("top/boxes/cube_v2.png"));
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Upper threshold"))
        .stdout(predicate::str::contains("Lower threshold"));

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("calibrate").arg(output.path().join("missing.png"));
    cmd.assert().failure();
    Ok(())
}

#[test]
fn boxfilter_keeps_dark_images() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &[])?;

    let mut cmd = Command::cargo_bin("boxfilter")?;
    cmd.arg(output.path()).args(&["--threshold", "255"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Examined:    2"))
        .stdout(predicate::str::contains("Deleted:     0"));
    Ok(())
}

#[test]
fn boxfilter_removes_whole_set() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &[])?;

    let mut cmd = Command::cargo_bin("boxfilter")?;
    cmd.arg(output.path()).args(&["--threshold", "0"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Deleted:     10"));
    for view in &["front_left", "front_right", "back_left", "back_right", "top"] {
        assert!(!output.path().join(view).join("boxes/cube_v1.png").exists());
    }
    Ok(())
}

#[test]
fn filter_debug_from_config() -> Result<(), Box<dyn std::error::Error>> {
    let input = input_dir(&["cube.obj"])?;
    let output = tempdir()?;
    generate(input.path(), output.path(), &[])?;
    let config = output.path().join("filter.json");
    fs::write(&config, r#"{"debug": true, "filter": {"reference_view": "front_left"}}"#)?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("filter")
        .arg(output.path())
        .arg("--config")
        .arg(&config)
        .args(&["--threshold", "0", "--quiet"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Dry run"))
        .stdout(predicate::str::contains("Examined:    2"))
        .stdout(predicate::str::contains("Deleted:     10"));
    assert!(output.path().join("top/boxes/cube_v1.png").exists());
    Ok(())
}

#[test]
fn print_manifest() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"enclosure": {"size": 1.5}}"#)?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("config").arg("--config").arg(&config).arg("--manifest");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"ENCLOSURE_SIZE\": 1.5"))
        .stdout(predicate::str::contains("CAMERA_FOCAL_RANGE"));
    Ok(())
}

#[test]
fn invalid_config_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let config = dir.path().join("config.json");
    fs::write(&config, r#"{"camera": {"focal_range": [10.0, 4.0]}}"#)?;

    let mut cmd = Command::cargo_bin("boxdrop")?;
    cmd.arg("config").arg("--config").arg(&config);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("camera.focal_range"));
    Ok(())
}
