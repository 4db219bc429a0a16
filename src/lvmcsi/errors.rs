// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, num::ParseIntError, string::FromUtf8Error};

use serde::{Deserialize, Serialize};

pub type LvmCsiResult<T> = Result<T, LvmCsiError>;

/// The closed set of result codes carried in a LogicalVolume record's
/// status and in every lvmd response.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
pub enum ErrorCode {
    #[default]
    #[strum(serialize = "OK")]
    #[serde(rename = "OK")]
    Ok,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    Internal,
    DeadlineExceeded,
    Aborted,
    Unavailable,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// A terminal code will not change by retrying the same request; the
    /// controller gives up as soon as it observes one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidArgument
                | ErrorCode::NotFound
                | ErrorCode::AlreadyExists
                | ErrorCode::ResourceExhausted
                | ErrorCode::Internal
        )
    }
}

#[derive(Debug)]
pub enum LvmCsiError {
    Msg(String),
    Chained(String, Box<LvmCsiError>),
    Code(ErrorCode, String),
    Command {
        cmd: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    Io(io::Error),
    Serde(serde_json::Error),
    Yaml(serde_yaml::Error),
    Utf8(FromUtf8Error),
    ParseInt(ParseIntError),
    Join(tokio::task::JoinError),
    Regex(regex::Error),
    Nix(nix::Error),
}

impl LvmCsiError {
    pub fn invalid<S: Into<String>>(msg: S) -> LvmCsiError {
        LvmCsiError::Code(ErrorCode::InvalidArgument, msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> LvmCsiError {
        LvmCsiError::Code(ErrorCode::NotFound, msg.into())
    }

    pub fn already_exists<S: Into<String>>(msg: S) -> LvmCsiError {
        LvmCsiError::Code(ErrorCode::AlreadyExists, msg.into())
    }

    pub fn exhausted<S: Into<String>>(msg: S) -> LvmCsiError {
        LvmCsiError::Code(ErrorCode::ResourceExhausted, msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> LvmCsiError {
        LvmCsiError::Code(ErrorCode::Aborted, msg.into())
    }

    pub fn unavailable<S: Into<String>>(msg: S) -> LvmCsiError {
        LvmCsiError::Code(ErrorCode::Unavailable, msg.into())
    }

    /// The code that represents this error on the wire and in record
    /// status. Chained errors report the code of their cause.
    pub fn code(&self) -> ErrorCode {
        match self {
            LvmCsiError::Code(code, _) => *code,
            LvmCsiError::Chained(_, inner) => inner.code(),
            LvmCsiError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                ErrorCode::Unavailable
            }
            LvmCsiError::Io(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                ErrorCode::Unavailable
            }
            LvmCsiError::Yaml(_) | LvmCsiError::Regex(_) => ErrorCode::InvalidArgument,
            _ => ErrorCode::Internal,
        }
    }

    /// The error text without the leading code, for transports that carry
    /// the code separately.
    pub fn message(&self) -> String {
        match self {
            LvmCsiError::Code(_, s) => s.clone(),
            err => err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.code() == ErrorCode::Aborted
    }
}

impl fmt::Display for LvmCsiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LvmCsiError::Msg(s) => write!(f, "{s}"),
            LvmCsiError::Chained(s, inner) => write!(f, "{s}; caused by: {inner}"),
            LvmCsiError::Code(code, s) => write!(f, "{code}: {s}"),
            LvmCsiError::Command {
                cmd,
                exit_code,
                stderr,
            } => match exit_code {
                Some(c) => write!(
                    f,
                    "command {cmd} failed with exit code {c}: {}",
                    stderr.trim_end()
                ),
                None => write!(
                    f,
                    "command {cmd} was terminated by a signal: {}",
                    stderr.trim_end()
                ),
            },
            LvmCsiError::Io(err) => write!(f, "IO error: {err}"),
            LvmCsiError::Serde(err) => write!(f, "Serde error: {err}"),
            LvmCsiError::Yaml(err) => write!(f, "YAML error: {err}"),
            LvmCsiError::Utf8(err) => write!(f, "Utf8 error: {err}"),
            LvmCsiError::ParseInt(err) => write!(f, "Integer parsing error: {err}"),
            LvmCsiError::Join(err) => write!(f, "Thread joining error: {err}"),
            LvmCsiError::Regex(err) => write!(f, "Regex error: {err}"),
            LvmCsiError::Nix(err) => write!(f, "Nix error: {err}"),
        }
    }
}

impl Error for LvmCsiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LvmCsiError::Msg(_) | LvmCsiError::Code(_, _) | LvmCsiError::Command { .. } => None,
            LvmCsiError::Chained(_, inner) => Some(inner.as_ref()),
            LvmCsiError::Io(err) => Some(err),
            LvmCsiError::Serde(err) => Some(err),
            LvmCsiError::Yaml(err) => Some(err),
            LvmCsiError::Utf8(err) => Some(err),
            LvmCsiError::ParseInt(err) => Some(err),
            LvmCsiError::Join(err) => Some(err),
            LvmCsiError::Regex(err) => Some(err),
            LvmCsiError::Nix(err) => Some(err),
        }
    }
}

impl From<io::Error> for LvmCsiError {
    fn from(err: io::Error) -> LvmCsiError {
        LvmCsiError::Io(err)
    }
}

impl From<serde_json::Error> for LvmCsiError {
    fn from(err: serde_json::Error) -> LvmCsiError {
        LvmCsiError::Serde(err)
    }
}

impl From<serde_yaml::Error> for LvmCsiError {
    fn from(err: serde_yaml::Error) -> LvmCsiError {
        LvmCsiError::Yaml(err)
    }
}

impl From<FromUtf8Error> for LvmCsiError {
    fn from(err: FromUtf8Error) -> LvmCsiError {
        LvmCsiError::Utf8(err)
    }
}

impl From<ParseIntError> for LvmCsiError {
    fn from(err: ParseIntError) -> LvmCsiError {
        LvmCsiError::ParseInt(err)
    }
}

impl From<tokio::task::JoinError> for LvmCsiError {
    fn from(err: tokio::task::JoinError) -> LvmCsiError {
        LvmCsiError::Join(err)
    }
}

impl From<regex::Error> for LvmCsiError {
    fn from(err: regex::Error) -> LvmCsiError {
        LvmCsiError::Regex(err)
    }
}

impl From<nix::Error> for LvmCsiError {
    fn from(err: nix::Error) -> LvmCsiError {
        LvmCsiError::Nix(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for LvmCsiError {
    fn from(err: std::sync::PoisonError<T>) -> LvmCsiError {
        LvmCsiError::Msg(err.to_string())
    }
}
