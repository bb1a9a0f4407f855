use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn fleet_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fleet"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1");
    cmd
}

fn init_store(home: &TempDir) {
    fleet_cmd(home.path()).arg("init").assert().success();
}

fn put_object(home: &TempDir, file_name: &str, yaml: &str) {
    let path = home.path().join(file_name);
    fs::write(&path, yaml).expect("write draft");
    fleet_cmd(home.path())
        .args(["object", "put"])
        .arg(&path)
        .assert()
        .success()
        .stdout(contains("Saved object"));
}

#[test]
fn init_seeds_root_object() {
    let home = TempDir::new().expect("home");
    fleet_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("1 object(s)"));

    fleet_cmd(home.path())
        .args(["object", "list"])
        .assert()
        .success()
        .stdout(contains("root"));
}

#[test]
fn object_list_filters_by_class() {
    let home = TempDir::new().expect("home");
    init_store(&home);
    put_object(
        &home,
        "nginx.yaml",
        "name: nginx\ncontent:\n  class: package\n",
    );

    fleet_cmd(home.path())
        .args(["object", "list", "--class", "package"])
        .assert()
        .success()
        .stdout(contains("nginx"))
        .stdout(contains("root").not());
}

#[test]
fn object_show_prints_newest_version() {
    let home = TempDir::new().expect("home");
    init_store(&home);
    put_object(
        &home,
        "nginx.yaml",
        "name: nginx\ncontent:\n  class: package\n",
    );
    let v2 = home.path().join("nginx-v2.yaml");
    fs::write(
        &v2,
        "name: nginx\ncomment: pinned\ncontent:\n  class: package\n  name: nginx-full\n",
    )
    .expect("write draft");

    fleet_cmd(home.path())
        .args(["object", "put"])
        .arg(&v2)
        .args(["--id", "10000"])
        .assert()
        .success()
        .stdout(contains("version 2"));

    fleet_cmd(home.path())
        .args(["object", "show", "10000"])
        .assert()
        .success()
        .stdout(contains("nginx-full"))
        .stdout(contains("pinned"));
}

#[test]
fn plan_lists_new_package_as_add() {
    let home = TempDir::new().expect("home");
    init_store(&home);
    put_object(
        &home,
        "nginx.yaml",
        "name: nginx\ncontent:\n  class: package\n",
    );
    put_object(
        &home,
        "web1.yaml",
        "name: web1\ncontent:\n  class: host\n  contains: [10000]\n",
    );

    let output = fleet_cmd(home.path())
        .args(["plan", "--json"])
        .output()
        .expect("run plan");
    assert!(output.status.success(), "plan failed: {output:?}");

    let units: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("plan emits JSON");
    let units = units.as_array().expect("unit array");
    let nginx = units
        .iter()
        .find(|u| u["name"] == "nginx")
        .expect("nginx unit planned");
    assert_eq!(nginx["class"], "package");
    assert_eq!(nginx["host"], "web1");
    assert_eq!(nginx["action"], "add");
    assert_eq!(nginx["enabled"], true);
}

#[test]
fn plan_rejects_package_inside_user() {
    let home = TempDir::new().expect("home");
    init_store(&home);
    put_object(
        &home,
        "nginx.yaml",
        "name: nginx\ncontent:\n  class: package\n",
    );
    put_object(
        &home,
        "alice.yaml",
        "name: alice\ncontent:\n  class: user\n  contains: [10000]\n",
    );
    put_object(
        &home,
        "web1.yaml",
        "name: web1\ncontent:\n  class: host\n  contains: [10001]\n",
    );

    fleet_cmd(home.path())
        .arg("plan")
        .assert()
        .failure()
        .stderr(contains("only files and collections are allowed"))
        .stderr(contains("object tree is invalid"));
}

#[test]
fn daemon_status_reports_not_running() {
    let home = TempDir::new().expect("home");
    fleet_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}

#[test]
fn deploy_start_without_daemon_fails() {
    let home = TempDir::new().expect("home");
    fleet_cmd(home.path())
        .args(["deploy", "start"])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}

#[test]
fn deploy_toggle_requires_enabled_value() {
    let home = TempDir::new().expect("home");
    fleet_cmd(home.path())
        .args(["deploy", "toggle", "0"])
        .assert()
        .failure()
        .stderr(contains("--enabled"));
}
