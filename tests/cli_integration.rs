//! CLI surface tests
//!
//! These avoid depending on network reachability or probe privileges: they
//! exercise argument handling and the fatal error paths.

use assert_cmd::Command;
use predicates::prelude::*;

fn hoptrace() -> Command {
    Command::cargo_bin("hoptrace").expect("binary should build")
}

#[test]
fn help_names_the_flags() {
    hoptrace()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-hops"))
        .stdout(predicate::str::contains("--queries"))
        .stdout(predicate::str::contains("--probe-timeout-ms"))
        .stdout(predicate::str::contains("--no-enrich"));
}

#[test]
fn version_is_reported() {
    hoptrace()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_target_is_an_error() {
    hoptrace()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn unresolvable_target_exits_nonzero() {
    // The .invalid TLD never resolves (RFC 2606), with or without network.
    hoptrace()
        .arg("host.does.not.exist.invalid")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn udp_protocol_is_reported_unimplemented() {
    hoptrace()
        .args(["--protocol", "udp", "192.0.2.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not implemented"));
}

#[test]
fn zero_probe_timeout_is_rejected() {
    hoptrace()
        .args(["--probe-timeout-ms", "0", "192.0.2.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("probe_timeout"));
}
