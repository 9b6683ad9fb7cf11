use std::ffi::OsString;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::error::VhostError;
use crate::reactor::{parse_core_mask, CoreMask};
use crate::registry::{normalize_socket_dir, RegistryConfig, MAX_VHOST_DEVICES};

const DEFAULT_CORE_MASK: &str = "0x1";
const DEFAULT_POLL_INTERVAL_US: u64 = 100;

#[derive(Debug, Clone, Parser)]
#[command(name = "vhostd", version, about)]
struct Args {
    /// Directory the controller endpoint sockets are created in.
    ///
    /// Environment variable: `VHOST_SOCKET_DIR`.
    #[arg(long, env = "VHOST_SOCKET_DIR")]
    socket_dir: Option<String>,

    /// Hexadecimal mask of the cores reactors may run on (default `0x1`).
    ///
    /// Environment variable: `VHOST_CORE_MASK`.
    #[arg(long, env = "VHOST_CORE_MASK")]
    core_mask: Option<String>,

    /// Controller to create at startup, as `NAME[@HEXMASK]`. May be repeated.
    ///
    /// The mask must be a subset of `--core-mask`; it defaults to the whole application mask.
    ///
    /// Environment variable: `VHOST_CONTROLLERS` (comma separated).
    #[arg(long = "controller", env = "VHOST_CONTROLLERS", value_delimiter = ',')]
    controllers: Vec<String>,

    /// Number of controller slots (default 15).
    ///
    /// Environment variable: `VHOST_MAX_CONTROLLERS`.
    #[arg(long, env = "VHOST_MAX_CONTROLLERS")]
    max_controllers: Option<usize>,

    /// Period of the queue drain cycle, in microseconds (default 100).
    ///
    /// Environment variable: `VHOST_POLL_INTERVAL_US`.
    #[arg(long, env = "VHOST_POLL_INTERVAL_US")]
    poll_interval_us: Option<u64>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `VHOST_LOG_LEVEL`.
    #[arg(long, env = "VHOST_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub name: String,
    pub cpumask: CoreMask,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Normalized endpoint directory (empty, or ending in `/`).
    pub socket_dir: String,
    pub app_mask: CoreMask,
    pub controllers: Vec<ControllerConfig>,
    pub max_controllers: usize,
    pub poll_interval: Duration,
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Args(#[from] clap::Error),

    #[error("invalid socket directory")]
    SocketDir(#[source] VhostError),

    #[error("invalid application core mask")]
    CoreMask(#[source] VhostError),

    #[error("controller entry {0:?} has no name")]
    EmptyControllerName(String),

    #[error("controller {name:?} has an invalid core mask")]
    ControllerMask {
        name: String,
        #[source]
        source: VhostError,
    },

    #[error("controller {0:?} is listed more than once")]
    DuplicateController(String),

    #[error("{count} controllers configured but only {max} slots available")]
    TooManyControllers { count: usize, max: usize },

    #[error("max controllers must be at least 1")]
    ZeroCapacity,

    #[error("poll interval must be non-zero")]
    ZeroPollInterval,
}

impl Config {
    /// Parses the process command line and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = Args::try_parse_from(args)?;

        let socket_dir = normalize_socket_dir(args.socket_dir.as_deref().unwrap_or(""))
            .map_err(ConfigError::SocketDir)?;

        let core_mask = args.core_mask.as_deref().unwrap_or(DEFAULT_CORE_MASK);
        let app_mask = parse_core_mask(core_mask, CoreMask::from_bits(u64::MAX))
            .map_err(ConfigError::CoreMask)?;

        let max_controllers = args.max_controllers.unwrap_or(MAX_VHOST_DEVICES);
        if max_controllers == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        let poll_interval_us = args.poll_interval_us.unwrap_or(DEFAULT_POLL_INTERVAL_US);
        if poll_interval_us == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }

        let mut controllers: Vec<ControllerConfig> = Vec::new();
        for entry in args.controllers.iter().map(|entry| entry.trim()) {
            if entry.is_empty() {
                continue;
            }
            let controller = parse_controller(entry, app_mask)?;
            if controllers.iter().any(|c| c.name == controller.name) {
                return Err(ConfigError::DuplicateController(controller.name));
            }
            controllers.push(controller);
        }
        if controllers.len() > max_controllers {
            return Err(ConfigError::TooManyControllers {
                count: controllers.len(),
                max: max_controllers,
            });
        }

        let log_level = args
            .log_level
            .map(|level| level.trim().to_string())
            .filter(|level| !level.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            socket_dir,
            app_mask,
            controllers,
            max_controllers,
            poll_interval: Duration::from_micros(poll_interval_us),
            log_level,
        })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            socket_dir: self.socket_dir.clone(),
            capacity: self.max_controllers,
            app_mask: self.app_mask,
        }
    }
}

fn parse_controller(entry: &str, app_mask: CoreMask) -> Result<ControllerConfig, ConfigError> {
    let (name, mask) = match entry.split_once('@') {
        Some((name, mask)) => (name.trim(), Some(mask)),
        None => (entry, None),
    };
    if name.is_empty() {
        return Err(ConfigError::EmptyControllerName(entry.to_string()));
    }

    let cpumask = match mask {
        Some(mask) => parse_core_mask(mask, app_mask).map_err(|source| {
            ConfigError::ControllerMask {
                name: name.to_string(),
                source,
            }
        })?,
        None => app_mask,
    };
    Ok(ControllerConfig {
        name: name.to_string(),
        cpumask,
    })
}
