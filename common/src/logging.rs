// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Root logger construction shared by the daemons in this workspace.

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;

/// How log records are rendered.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Unstructured, human-readable lines.
    Human,
    /// Bunyan-formatted JSON records.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Build the root logger for the daemon `name`.
///
/// Records go to `log_file` when one is given, appending to any existing
/// contents, and to stdout otherwise.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            match log_format {
                LogFormat::Human => {
                    let decorator = slog_term::PlainDecorator::new(file);
                    let drain =
                        slog_term::FullFormat::new(decorator).build().fuse();
                    slog_async::Async::new(drain).build().fuse()
                }
                LogFormat::Json => {
                    let drain =
                        slog_bunyan::with_name(name, file).build().fuse();
                    slog_async::Async::new(drain).build().fuse()
                }
            }
        }
        None => match log_format {
            LogFormat::Human => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                slog_async::Async::new(drain).build().fuse()
            }
            LogFormat::Json => {
                let drain =
                    slog_bunyan::with_name(name, std::io::stdout())
                        .build()
                        .fuse();
                slog_async::Async::new(drain).build().fuse()
            }
        },
    };

    Ok(slog::Logger::root(drain, slog::o!("name" => name)))
}
