use assert_cmd::prelude::*; // Add methods on commands
use assert_fs::prelude::*;
use predicates::prelude::*; // Used for writing assertions
use std::process::Command;

#[test]
fn cannot_run_cli_without_subcommand() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("fleetcheck")?;
    cmd.assert().failure().stderr(predicate::str::contains("Usage"));
    Ok(())
}

#[test]
#[serial_test::serial(config)]
fn missing_config_file_exits_before_any_check() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("fleetcheck")?;
    cmd.arg("run").arg("--config").arg("/nonexistent/config.yaml");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
    Ok(())
}

#[test]
#[serial_test::serial(config)]
fn malformed_config_is_a_config_error() -> Result<(), Box<dyn std::error::Error>> {
    let temp = assert_fs::TempDir::new()?;
    let config = temp.child("config.yaml");
    config.write_str("technology: kafka\nhost: [this is not a string\n")?;

    let mut cmd = Command::cargo_bin("fleetcheck")?;
    cmd.arg("run").arg("--config").arg(config.path());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("could not parse config"));
    Ok(())
}

#[test]
#[serial_test::serial(config)]
fn invalid_settings_are_rejected_before_connecting() -> Result<(), Box<dyn std::error::Error>> {
    // SSH hosts without a user must fail validation, not start a run.
    let temp = assert_fs::TempDir::new()?;
    let config = temp.child("config.yaml");
    config.write_str(
        "technology: kafka\nhost: broker-1\nport: 9092\ncompany_name: Acme\nssh_hosts: [b-1]\n",
    )?;

    let mut cmd = Command::cargo_bin("fleetcheck")?;
    cmd.arg("run").arg("--config").arg(config.path());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("ssh_user"));
    Ok(())
}
