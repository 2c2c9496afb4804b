use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[test]
fn runs_a_pipeline_from_a_yaml_config() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let work_dir = dir.path().join("work");

    let mut config_file = tempfile::NamedTempFile::new()?;
    writeln!(
        config_file,
        "working_directory: {}\nstages: [uppercase]\ntext: hello from the cli\n",
        work_dir.display()
    )?;

    let mut cmd = Command::cargo_bin("pipeline")?;
    cmd.arg(config_file.path());
    cmd.assert().success();

    Ok(())
}

#[test]
fn missing_config_argument_exits_nonzero() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("pipeline")?;
    cmd.assert().failure().code(2).stderr(predicate::str::contains("usage:"));
    Ok(())
}

#[test]
fn unreadable_config_path_exits_nonzero() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("pipeline")?;
    cmd.arg("/nonexistent/path/to/config.yml");
    cmd.assert().failure().stderr(predicate::str::contains("failed to read config"));
    Ok(())
}
