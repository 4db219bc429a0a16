// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    env,
    error::Error,
    fs::{create_dir_all, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::{Arg, ArgAction, Command};
use env_logger::Builder;
use log::LevelFilter;
use nix::{
    fcntl::{Flock, FlockArg},
    unistd::getpid,
};

use lvmcsi::lvmcsi::{run, LvmCsiError, LvmCsiResult, VERSION};

const LVMD_PID_PATH: &str = "/run/lvmd/lvmd.pid";
const LVMD_CONFIG_PATH: &str = "/etc/lvmd/lvmd.yaml";

fn parse_args() -> Command {
    Command::new("lvmd")
        .version(VERSION)
        .about("Node-local LVM volume service")
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(LVMD_CONFIG_PATH)
                .help("Path to the device class configuration file"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Sets level for generation of log messages."),
        )
        .arg(
            Arg::new("pid_file")
                .long("pid-file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(LVMD_PID_PATH)
                .help("Path of the file that keeps a second instance from starting"),
        )
        .arg(
            Arg::new("sim")
                .long("sim")
                .action(ArgAction::SetTrue)
                .help("Keep volumes in memory instead of in LVM"),
        )
}

/// To ensure only one instance of lvmd runs at a time, acquire an
/// exclusive lock. Return an error if lock attempt fails.
fn trylock_pid_file(path: &Path) -> LvmCsiResult<Flock<File>> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| {
            LvmCsiError::Chained(
                format!(
                    "Failed to create or open the lvmd PID file at {}",
                    path.display()
                ),
                Box::new(LvmCsiError::from(err)),
            )
        })?;
    match Flock::lock(f, FlockArg::LockExclusiveNonblock) {
        Ok(mut locked) => {
            locked.set_len(0)?;
            locked.write_all(getpid().to_string().as_bytes())?;
            Ok(locked)
        }
        Err((mut f, _)) => {
            let mut buf = String::new();

            if f.read_to_string(&mut buf).is_err() {
                buf = "<unreadable>".to_string();
            }

            Err(LvmCsiError::Msg(format!(
                "Daemon already running with supposed pid: {buf}"
            )))
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args().get_matches();

    let mut builder = Builder::new();
    if let Some(log_level) = args.get_one::<String>("log_level") {
        let level = LevelFilter::from_str(log_level)?;
        builder.filter(Some("lvmcsi"), level);
        builder.filter(Some("lvmd"), level);
    } else if let Ok(s) = env::var("RUST_LOG") {
        builder.parse_filters(&s);
    }
    builder.init();

    let pid_file = args
        .get_one::<PathBuf>("pid_file")
        .map(PathBuf::as_path)
        .unwrap_or_else(|| Path::new(LVMD_PID_PATH));
    let _lvmd_file = trylock_pid_file(pid_file)?;

    let config = args
        .get_one::<PathBuf>("config")
        .map(PathBuf::as_path)
        .unwrap_or_else(|| Path::new(LVMD_CONFIG_PATH));
    run(config, args.get_flag("sim"))?;
    Ok(())
}
