// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `nvd`.

use serde::Deserialize;
use structopt::StructOpt;

use crate::routing::RoutingStrategy;
use crate::types::NvdError;
use crate::types::NvdResult;

const DEFAULT_TENANT_PREFIX_BITS: u8 = 8;
const DEFAULT_BUFFER_MAP_SIZE: usize = 256;
const DEFAULT_XID_TABLE_SIZE: usize = 1024;

#[derive(Debug, Default, StructOpt)]
#[structopt(name = "nvd", about = "OpenFlow network virtualization daemon")]
pub struct Opt {
    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    pub log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    pub log_format: Option<common::logging::LogFormat>,

    #[structopt(long, help = "TOML file with daemon settings")]
    pub config: Option<String>,

    #[structopt(
        long,
        help = "number of high-order address bits identifying a tenant"
    )]
    pub tenant_prefix_bits: Option<u8>,

    #[structopt(
        long,
        help = "buffer ids remembered per virtual switch"
    )]
    pub buffer_map_size: Option<usize>,

    #[structopt(
        long,
        help = "unanswered requests remembered per physical switch"
    )]
    pub xid_table_size: Option<usize>,

    #[structopt(
        long,
        help = "routing for big switches: 'manual' or 'shortest-path'"
    )]
    pub default_routing: Option<RoutingStrategy>,

    #[structopt(
        long,
        help = "file describing the physical topology to assume at startup"
    )]
    pub topology_file: Option<String>,
}

/// The run-time settings of the daemon.  Defaults are overridden first by the
/// config file, if any, and then by command-line options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: common::logging::LogFormat,

    /// High-order bits of a physical IPv4 address that carry the tenant id.
    pub tenant_prefix_bits: u8,

    /// Maximum number of buffer id mappings kept per virtual switch.
    pub buffer_map_size: usize,

    /// Maximum number of outstanding transactions kept per physical switch.
    /// Requests that never get a reply age out oldest first.
    pub xid_table_size: usize,

    /// Routing strategy for big switches created without an explicit one.
    pub default_routing: RoutingStrategy,

    /// Physical topology to seed at startup.
    pub topology_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: common::logging::LogFormat::Json,
            tenant_prefix_bits: DEFAULT_TENANT_PREFIX_BITS,
            buffer_map_size: DEFAULT_BUFFER_MAP_SIZE,
            xid_table_size: DEFAULT_XID_TABLE_SIZE,
            default_routing: RoutingStrategy::default(),
            topology_file: None,
        }
    }
}

/// The subset of settings that may be given in a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    log_file: Option<String>,
    log_format: Option<common::logging::LogFormat>,
    tenant_prefix_bits: Option<u8>,
    buffer_map_size: Option<usize>,
    xid_table_size: Option<usize>,
    default_routing: Option<RoutingStrategy>,
    topology_file: Option<String>,
}

fn update_from_file(contents: &str, config: &mut Config) -> NvdResult<()> {
    let file: ConfigFile = toml::from_str(contents)?;
    if let Some(log_file) = file.log_file {
        config.log_file = Some(log_file);
    }
    if let Some(log_format) = file.log_format {
        config.log_format = log_format;
    }
    if let Some(bits) = file.tenant_prefix_bits {
        config.tenant_prefix_bits = bits;
    }
    if let Some(size) = file.buffer_map_size {
        config.buffer_map_size = size;
    }
    if let Some(size) = file.xid_table_size {
        config.xid_table_size = size;
    }
    if let Some(routing) = file.default_routing {
        config.default_routing = routing;
    }
    if let Some(topology_file) = file.topology_file {
        config.topology_file = Some(topology_file);
    }
    Ok(())
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &Opt, config: &mut Config) {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(bits) = opts.tenant_prefix_bits {
        config.tenant_prefix_bits = bits;
    }

    if let Some(size) = opts.buffer_map_size {
        config.buffer_map_size = size;
    }

    if let Some(size) = opts.xid_table_size {
        config.xid_table_size = size;
    }

    if let Some(routing) = opts.default_routing {
        config.default_routing = routing;
    }

    if let Some(topology_file) = &opts.topology_file {
        config.topology_file = Some(topology_file.to_string());
    }
}

fn validate(config: &Config) -> NvdResult<()> {
    if !(1..=24).contains(&config.tenant_prefix_bits) {
        return Err(NvdError::Other(format!(
            "tenant_prefix_bits must be between 1 and 24, not {}",
            config.tenant_prefix_bits
        )));
    }
    if config.buffer_map_size == 0 {
        return Err(NvdError::Other("buffer_map_size must be non-zero".into()));
    }
    if config.xid_table_size == 0 {
        return Err(NvdError::Other("xid_table_size must be non-zero".into()));
    }
    Ok(())
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior.
pub fn build_config(opts: &Opt) -> NvdResult<Config> {
    let mut config = Config::default();
    if let Some(path) = &opts.config {
        let contents = std::fs::read_to_string(path)?;
        update_from_file(&contents, &mut config)?;
    }
    update_from_cli(opts, &mut config);
    validate(&config)?;
    Ok(config)
}
