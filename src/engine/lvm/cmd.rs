// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking the lvm binary.
// This module assumes that, for a given machine, there is only one place
// where the lvm executable might be installed. The location is resolved once
// when an LvmBinary is constructed, and lvmd exits immediately if it can not
// be found. The binary may still be uninstalled while lvmd is running, so its
// existence is checked again before every invocation.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    process::Command,
};

use itertools::Itertools;

use crate::lvmcsi::{LvmCsiError, LvmCsiResult};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

const LVM: &str = "lvm";
const NSENTER: &str = "nsenter";

/// Arguments that make nsenter run the command in the namespaces of the
/// host's init process, used when lvmd itself runs inside a container.
const NSENTER_ARGS: [&str; 7] = ["-m", "-u", "-i", "-n", "-p", "-t", "1"];

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
/// Search an explicit list of directories rather than the user's PATH
/// environment variable. lvmd may be running when there is no PATH
/// variable set.
fn find_binary(name: &str) -> Option<PathBuf> {
    BINARIES_PATHS
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

/// Runs lvm subcommands. All state mutation of volume groups and logical
/// volumes goes through an implementation of this trait.
pub trait LvmExecutor: Debug + Send + Sync {
    /// Invoke `lvm` with the given arguments and return its standard output.
    /// The first argument is the lvm subcommand, e.g. "lvcreate".
    fn call(&self, args: &[String]) -> LvmCsiResult<Vec<u8>>;
}

/// Runs the real lvm binary installed on the host.
#[derive(Debug)]
pub struct LvmBinary {
    lvm: PathBuf,
    nsenter: Option<PathBuf>,
}

impl LvmBinary {
    /// Locate the binaries required to manage LVM. If containerized is true,
    /// every invocation is wrapped with nsenter so that it runs in the host
    /// namespaces.
    pub fn new(containerized: bool) -> LvmCsiResult<LvmBinary> {
        let mut missing = Vec::new();
        let lvm = find_binary(LVM);
        if lvm.is_none() {
            missing.push(LVM);
        }
        let nsenter = if containerized {
            let nsenter = find_binary(NSENTER);
            if nsenter.is_none() {
                missing.push(NSENTER);
            }
            nsenter
        } else {
            None
        };

        match lvm {
            Some(lvm) if missing.is_empty() => Ok(LvmBinary { lvm, nsenter }),
            _ => Err(LvmCsiError::Msg(format!(
                "Executables {} could not be found in any of {}",
                missing.iter().join(", "),
                BINARIES_PATHS.iter().join(", ")
            ))),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        match self.nsenter {
            Some(ref nsenter) => {
                let mut cmd = Command::new(nsenter.as_os_str());
                cmd.args(NSENTER_ARGS).arg(&self.lvm).args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new(self.lvm.as_os_str());
                cmd.args(args);
                cmd
            }
        }
    }
}

fn check_executable(path: &Path) -> LvmCsiResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(LvmCsiError::Msg(format!(
            "Executable previously located at {} seems to have been removed",
            path.display()
        )))
    }
}

/// Invoke the specified command. Return an error if invoking the command
/// fails or if the command itself fails.
fn execute_cmd(cmd: &mut Command) -> LvmCsiResult<Vec<u8>> {
    cmd.env("LC_ALL", "C");
    debug!("Invoking {cmd:?}");
    match cmd.output() {
        Err(err) => Err(LvmCsiError::Chained(
            format!("Failed to execute command {cmd:?}"),
            Box::new(LvmCsiError::Io(err)),
        )),
        Ok(result) => {
            if result.status.success() {
                Ok(result.stdout)
            } else {
                Err(LvmCsiError::Command {
                    cmd: format!("{cmd:?}"),
                    exit_code: result.status.code(),
                    stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                })
            }
        }
    }
}

impl LvmExecutor for LvmBinary {
    fn call(&self, args: &[String]) -> LvmCsiResult<Vec<u8>> {
        check_executable(&self.lvm)?;
        if let Some(ref nsenter) = self.nsenter {
            check_executable(nsenter)?;
        }
        execute_cmd(&mut self.command(args))
    }
}
