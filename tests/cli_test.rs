mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("commission-ledger"));
    cmd.arg("tests/fixtures/commands.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "account,status,level,level_name,commission_rate,total_sales,total_commission,available_commission,team_size,team_sales,referral_code,agent_id",
        ))
        // Team commission plus the referral bonus
        .stdout(predicate::str::contains("root,active,1,Bronze,5,0,30,30,1,1000,"))
        // 50 earned, 20 paid out, the failed payout restored
        .stdout(predicate::str::contains("alice,active,1,Bronze,5,1000,50,30,0,0,"))
        // The expired order cannot be confirmed
        .stderr(predicate::str::contains("Error processing command on row 15"))
        .stderr(predicate::str::contains("Error processing command on row 16"));

    Ok(())
}

#[test]
fn test_malformed_rows_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.csv");
    common::write_commands(
        &path,
        &[
            "register,alice,,,",
            "explode,alice,,,",
            "order,alice,o-1,not-a-number,",
            "order,ghost,o-2,100,",
            "order,alice,o-3,1000,",
            "confirm,,o-3,,",
        ],
    )
    .unwrap();

    let mut cmd = Command::new(cargo_bin!("commission-ledger"));
    cmd.arg(&path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error reading command on row 3"))
        .stderr(predicate::str::contains("Error reading command on row 4"))
        .stderr(predicate::str::contains("Error processing command on row 5"))
        .stdout(predicate::str::contains("alice,active,1,Bronze,5,1000,50,50,0,0,"));
}

#[test]
fn test_config_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.csv");
    common::write_commands(
        &path,
        &[
            "register,alice,,,",
            "order,alice,o-1,1000,",
            "confirm,,o-1,,2",
        ],
    )
    .unwrap();
    let config_path = dir.path().join("ledger.json");
    let mut config = std::fs::File::create(&config_path).unwrap();
    write!(
        config,
        r#"{{"required_confirmations": 2, "tiers": [{{"level": 1, "name": "Starter", "min_sales": "0", "min_team_size": 0, "commission_rate": "7"}}]}}"#
    )
    .unwrap();

    let mut cmd = Command::new(cargo_bin!("commission-ledger"));
    cmd.arg(&path).arg("--config").arg(&config_path);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("alice,active,1,Starter,7,1000,70,70,0,0,"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.csv");
    common::write_commands(&path, &["register,alice,,,"]).unwrap();
    let config_path = dir.path().join("ledger.json");
    std::fs::write(&config_path, r#"{"tiers": []}"#).unwrap();

    let mut cmd = Command::new(cargo_bin!("commission-ledger"));
    cmd.arg(&path).arg("--config").arg(&config_path);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("tier table is empty"));
}

#[test]
fn test_refund_unwinds_commissions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.csv");
    common::write_commands(
        &path,
        &[
            "register,root,,,",
            "register,alice,,,root",
            "order,alice,o-1,1000,",
            "confirm,,o-1,,",
            "refund,,o-1,,returned",
            "refund,,o-1,,returned",
        ],
    )
    .unwrap();

    let mut cmd = Command::new(cargo_bin!("commission-ledger"));
    cmd.arg(&path);

    // The second refund finds no confirmed payment left for the order
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("alice,active,1,Bronze,5,0,0,0,0,0,"))
        .stdout(predicate::str::contains("root,active,1,Bronze,5,0,0,0,1,0,"))
        .stderr(predicate::str::contains("Error processing command on row 7"));
}
