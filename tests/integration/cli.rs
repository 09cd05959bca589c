//! End-to-end exercises of the `helm` binary itself: exit codes and
//! stdout format for the non-resident (no daemon running) CLI path,
//! per spec.md §6.
#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::Fixture;
use predicates::prelude::*;
use std::fs;

fn helm_cmd(root: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("helm").unwrap();
    cmd.env("HELM_INSTALL_ROOT", root);
    cmd.env_remove("DEV_MODE");
    cmd
}

fn write_sleeper_manifest(fixture: &Fixture, name: &str, port: u16) {
    let dir = fixture.service_dir(name);
    fs::write(dir.join("run.py"), "import time\nwhile True:\n    time.sleep(1)\n").unwrap();
    fixture.write_manifest(&serde_json::json!({
        "core_required": [common::managed_python_entry(name, &dir, Some(port), 0, &[])],
        "default_optional": [],
        "system_dependencies": [],
    }));
}

#[test]
fn list_prints_empty_catalog_with_no_services() {
    let fixture = Fixture::new();
    fixture.write_manifest(&serde_json::json!({
        "core_required": [],
        "default_optional": [],
        "system_dependencies": [],
    }));

    helm_cmd(&fixture.root())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn start_stop_round_trip_via_direct_bootstrap() {
    let fixture = Fixture::new();
    write_sleeper_manifest(&fixture, "hivematrix-sleeper", 20001);

    helm_cmd(&fixture.root())
        .args(["start", "hivematrix-sleeper"])
        .assert()
        .success();

    helm_cmd(&fixture.root())
        .args(["status", "hivematrix-sleeper"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Running"));

    helm_cmd(&fixture.root())
        .args(["stop", "hivematrix-sleeper"])
        .assert()
        .success();

    helm_cmd(&fixture.root())
        .args(["status", "hivematrix-sleeper"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped"));
}

#[test]
fn start_of_unknown_service_exits_non_zero() {
    let fixture = Fixture::new();
    fixture.write_manifest(&serde_json::json!({
        "core_required": [],
        "default_optional": [],
        "system_dependencies": [],
    }));

    helm_cmd(&fixture.root())
        .args(["start", "no-such-service"])
        .assert()
        .failure();
}

#[test]
fn status_of_unknown_service_exits_non_zero() {
    let fixture = Fixture::new();
    fixture.write_manifest(&serde_json::json!({
        "core_required": [],
        "default_optional": [],
        "system_dependencies": [],
    }));

    helm_cmd(&fixture.root())
        .args(["status", "no-such-service"])
        .assert()
        .failure();
}

#[test]
fn list_prints_catalog_entries_sorted_by_name() {
    let fixture = Fixture::new();
    let a_dir = fixture.service_dir("hivematrix-aardvark");
    let b_dir = fixture.service_dir("hivematrix-zebra");
    fixture.write_manifest(&serde_json::json!({
        "core_required": [
            common::managed_python_entry("hivematrix-zebra", &b_dir, Some(20010), 0, &[]),
            common::managed_python_entry("hivematrix-aardvark", &a_dir, Some(20011), 0, &[]),
        ],
        "default_optional": [],
        "system_dependencies": [],
    }));

    helm_cmd(&fixture.root())
        .arg("list")
        .assert()
        .success()
        .stdout("hivematrix-aardvark\nhivematrix-zebra\n");
}

#[test]
fn status_json_emits_machine_readable_output() {
    let fixture = Fixture::new();
    write_sleeper_manifest(&fixture, "hivematrix-sleeper", 20002);

    helm_cmd(&fixture.root())
        .args(["start", "hivematrix-sleeper"])
        .assert()
        .success();

    let output = helm_cmd(&fixture.root())
        .args(["status", "hivematrix-sleeper", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed[0]["name"], "hivematrix-sleeper");

    helm_cmd(&fixture.root()).args(["stop", "hivematrix-sleeper"]).assert().success();
}
