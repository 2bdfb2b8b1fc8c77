// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;

use crate::harvest::StartAt;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Config file, TOML when it ends in .toml, YAML otherwise
    #[arg(long, short = 'c', env = "ROUTEBEAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Glob pattern of files to harvest, may be repeated. Replaces the configured paths
    #[arg(long = "path", value_name = "GLOB")]
    pub paths: Vec<String>,

    /// Glob pattern of files to skip, may be repeated
    #[arg(long = "exclude", value_name = "GLOB")]
    pub exclude: Vec<String>,

    /// Registry directory
    #[arg(long, env = "ROUTEBEAT_REGISTRY_PATH")]
    pub registry_path: Option<PathBuf>,

    /// Where to start reading files found at startup
    #[arg(value_enum, long, env = "ROUTEBEAT_START_AT")]
    pub start_at: Option<StartAtArg>,

    /// Where harvested records go
    #[arg(value_enum, long, env = "ROUTEBEAT_OUTPUT", default_value = "console")]
    pub output: Output,
}

impl Default for AgentRun {
    fn default() -> Self {
        AgentRun {
            config: None,
            paths: vec![],
            exclude: vec![],
            registry_path: None,
            start_at: None,
            output: Output::Console,
        }
    }
}

/// Where to start reading files
#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum StartAtArg {
    /// Start at the beginning of the file
    Beginning,
    /// Start at the end of the file (tail mode)
    End,
}

impl From<StartAtArg> for StartAt {
    fn from(s: StartAtArg) -> Self {
        match s {
            StartAtArg::Beginning => StartAt::Beginning,
            StartAtArg::End => StartAt::End,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum Output {
    /// One JSON object per record on stdout
    Console,
    /// Accept and discard
    Discard,
}
