// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod common;

use std::{
    fs,
    path::Path,
    process::{Child, Command},
    thread, time,
};

use assert_cmd::prelude::*;
use predicates::prelude::*;

use lvmcsi::{
    engine::GIB,
    lvmd::{LvService, LvmdClient, SIM_VG_SIZE_GB},
};

fn write_config(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = format!(
        "socket-name: {}\n\
         device-classes:\n  \
           - name: ssd\n    \
             volume-group: vg1\n    \
             default: true\n    \
             spare-gb: 4\n",
        dir.join("lvmd.socket").display()
    );
    fs::write(dir.join("lvmd.yaml"), config)?;
    Ok(())
}

fn start_lvmd_sim(dir: &Path) -> Result<Child, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("lvmd")?;
    let child = cmd
        .arg("--sim")
        .arg("--config")
        .arg(dir.join("lvmd.yaml"))
        .arg("--pid-file")
        .arg(dir.join("lvmd.pid"))
        .spawn()?;
    for _ in 0..50 {
        if dir.join("lvmd.socket").exists() {
            break;
        }
        thread::sleep(time::Duration::from_millis(100));
    }
    Ok(child)
}

#[test]
fn test_lvmd_bad_loglevel() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("lvmd")?;
    let assert = cmd.arg("--log-level").arg("nosuchlevel").assert();
    assert.failure().code(2);
    Ok(())
}

#[test]
fn test_lvmd_bad_option() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("lvmd")?;
    let assert = cmd.arg("--nosim").assert();
    assert.failure().code(2);
    Ok(())
}

#[test]
fn test_lvmd_missing_config() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("lvmd")?;
    cmd.arg("--sim")
        .arg("--config")
        .arg(dir.path().join("absent.yaml"))
        .arg("--pid-file")
        .arg(dir.path().join("lvmd.pid"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file"));
    Ok(())
}

#[test]
fn test_lvmd_sim_serves_socket() -> Result<(), Box<dyn std::error::Error>> {
    common::logger::init_logger();
    let dir = tempfile::tempdir()?;
    write_config(dir.path())?;
    let mut daemon = start_lvmd_sim(dir.path())?;

    // A second instance must not start while the first holds the PID file.
    let mut cmd = Command::cargo_bin("lvmd")?;
    let second = cmd
        .arg("--sim")
        .arg("--config")
        .arg(dir.path().join("lvmd.yaml"))
        .arg("--pid-file")
        .arg(dir.path().join("lvmd.pid"))
        .assert();

    let runtime = tokio::runtime::Runtime::new()?;
    let free = runtime.block_on(LvmdClient::new(dir.path().join("lvmd.socket")).get_free_bytes(""));

    daemon.kill()?;
    daemon.wait()?;

    second
        .failure()
        .stderr(predicate::str::contains("already running"));
    assert_eq!(free.ok(), Some((SIM_VG_SIZE_GB - 4) * GIB));
    Ok(())
}
