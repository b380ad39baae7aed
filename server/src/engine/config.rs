/*
 * Created on Wed Jan 10 2024
 *
 * This file is a part of Scened
 * Scened is a free and open-source replicated scene-graph store that
 * provides ACID multi-shard transactions over a tree of nodes without
 * compromising on consistency or recoverability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    core::fmt,
    serde::Deserialize,
    std::{collections::HashMap, env, fs},
};

/*
    misc
*/

/// CLI arguments parsed into option name -> values (an option may repeat)
pub type ParsedRawArgs = HashMap<String, Vec<String>>;

/*
    configuration
*/

#[derive(Debug, PartialEq, Clone)]
/// The final configuration that can be used to start up the cluster
pub struct Configuration {
    /// number of shards (each shard is a replication group with its own consensus log)
    pub shards: u16,
    /// replicas hosting each shard
    pub replicas_per_shard: u16,
    /// HLC drift window (in ticks) tolerated while a transaction is committing
    pub max_latency: u64,
    /// highest usable node id; the node space is `1..=node_space_cap`
    pub node_space_cap: u16,
    pub mode: ConfigMode,
}

impl Configuration {
    pub const DEFAULT_SHARDS: u16 = 2;
    pub const DEFAULT_REPLICAS_PER_SHARD: u16 = 3;
    pub const DEFAULT_MAX_LATENCY: u64 = 16;
    pub const DEFAULT_NODE_SPACE_CAP: u16 = 1000;
    /// The bitset carrying participant shards in txn records caps the shard count
    pub const MAX_SHARDS: u16 = u16::BITS as u16;
    pub fn default_dev_mode() -> Self {
        Self {
            shards: Self::DEFAULT_SHARDS,
            replicas_per_shard: Self::DEFAULT_REPLICAS_PER_SHARD,
            max_latency: Self::DEFAULT_MAX_LATENCY,
            node_space_cap: Self::DEFAULT_NODE_SPACE_CAP,
            mode: ConfigMode::Dev,
        }
    }
    fn validate(self) -> Result<Self, ConfigError> {
        if self.shards == 0 || self.shards > Self::MAX_SHARDS {
            return Err(ConfigError::BadShardCount(self.shards));
        }
        if self.mode == ConfigMode::Prod && self.replicas_per_shard < 3 {
            return Err(ConfigError::InsufficientReplicas(self.replicas_per_shard));
        }
        if self.replicas_per_shard == 0 {
            return Err(ConfigError::InsufficientReplicas(self.replicas_per_shard));
        }
        if self.max_latency == 0 {
            return Err(ConfigError::BadMaxLatency);
        }
        if self.node_space_cap < 3 {
            return Err(ConfigError::BadNodeSpace(self.node_space_cap));
        }
        Ok(self)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    /// a mode for local development: no replica-loss tolerance requirements
    Dev,
    /// the production mode: every shard must have at least three replicas
    Prod,
}

#[derive(Debug, PartialEq)]
/// Errors raised while resolving the startup configuration
pub enum ConfigError {
    /// the configuration file could not be read
    FileUnreadable(String),
    /// the configuration file could not be parsed
    FileParse(String),
    /// an environment variable carried a non-numeric value
    BadEnvValue(&'static str),
    /// a command-line option was malformed, unknown or repeated
    BadCliArg(String),
    /// illegal shard count
    BadShardCount(u16),
    /// too few replicas for the selected mode
    InsufficientReplicas(u16),
    /// the HLC drift window must be nonzero
    BadMaxLatency,
    /// the node space must admit at least three nodes
    BadNodeSpace(u16),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileUnreadable(p) => write!(f, "unable to read config file `{p}`"),
            Self::FileParse(e) => write!(f, "unable to parse config file: {e}"),
            Self::BadEnvValue(v) => write!(f, "environment variable `{v}` has an illegal value"),
            Self::BadCliArg(a) => write!(f, "bad command-line option `{a}`"),
            Self::BadShardCount(n) => write!(
                f,
                "illegal shard count {n} (expected 1..={})",
                Configuration::MAX_SHARDS
            ),
            Self::InsufficientReplicas(n) => {
                write!(f, "{n} replica(s) per shard is below the tolerated minimum")
            }
            Self::BadMaxLatency => write!(f, "max latency must be at least one tick"),
            Self::BadNodeSpace(n) => write!(f, "node space cap {n} is too small (minimum 3)"),
        }
    }
}

/*
    sources
    ---
    Precedence: CLI options override environment variables, environment variables
    override the config file, the config file overrides the built-in defaults. The file
    path comes from `--config` or SCENED_CONFIG.
*/

/// Hand-parse `--option value` / `--option=value` pairs. Anything that does not start
/// with `--` (or repeats) is an error
pub fn parse_cli_args(
    mut args: impl Iterator<Item = String>,
) -> Result<ParsedRawArgs, ConfigError> {
    let mut parsed = ParsedRawArgs::new();
    while let Some(arg) = args.next() {
        let Some(body) = arg.strip_prefix("--") else {
            return Err(ConfigError::BadCliArg(arg));
        };
        let (key, value) = match body.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => match args.next() {
                Some(value) => (body.to_owned(), value),
                None => return Err(ConfigError::BadCliArg(arg)),
            },
        };
        parsed.entry(key).or_default().push(value);
    }
    Ok(parsed)
}

fn cli_u64(args: &ParsedRawArgs, key: &str) -> Result<Option<u64>, ConfigError> {
    match args.get(key).map(|v| v.as_slice()) {
        Some([value]) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::BadCliArg(format!("--{key} {value}"))),
        Some(_) => Err(ConfigError::BadCliArg(format!("--{key}"))),
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize, Default)]
/// The on-disk (YAML) representation of [`Configuration`]
struct ConfigFile {
    shards: Option<u16>,
    replicas_per_shard: Option<u16>,
    max_latency: Option<u64>,
    node_space_cap: Option<u16>,
    mode: Option<ConfigMode>,
}

fn env_u64(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::BadEnvValue(key)),
        Err(_) => Ok(None),
    }
}

/// Resolve the startup configuration from the defaults, the optional YAML file, the
/// `SCENED_*` environment variables and the process arguments
pub fn resolve() -> Result<Configuration, ConfigError> {
    resolve_with(parse_cli_args(env::args().skip(1))?)
}

fn resolve_with(cli: ParsedRawArgs) -> Result<Configuration, ConfigError> {
    const KNOWN: [&str; 6] = [
        "config",
        "shards",
        "replicas",
        "max-latency",
        "node-space",
        "mode",
    ];
    if let Some(unknown) = cli.keys().find(|k| !KNOWN.contains(&k.as_str())) {
        return Err(ConfigError::BadCliArg(format!("--{unknown}")));
    }
    let mut cfg = Configuration::default_dev_mode();
    let file_path = match cli.get("config").map(|v| v.as_slice()) {
        Some([path]) => Some(path.clone()),
        Some(_) => return Err(ConfigError::BadCliArg("--config".to_owned())),
        None => env::var("SCENED_CONFIG").ok(),
    };
    if let Some(path) = file_path {
        let raw = fs::read_to_string(&path).map_err(|_| ConfigError::FileUnreadable(path))?;
        let file: ConfigFile =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::FileParse(e.to_string()))?;
        if let Some(shards) = file.shards {
            cfg.shards = shards;
        }
        if let Some(replicas) = file.replicas_per_shard {
            cfg.replicas_per_shard = replicas;
        }
        if let Some(window) = file.max_latency {
            cfg.max_latency = window;
        }
        if let Some(cap) = file.node_space_cap {
            cfg.node_space_cap = cap;
        }
        if let Some(mode) = file.mode {
            cfg.mode = mode;
        }
    }
    if let Some(shards) = env_u64("SCENED_SHARDS")? {
        cfg.shards = shards as u16;
    }
    if let Some(replicas) = env_u64("SCENED_REPLICAS")? {
        cfg.replicas_per_shard = replicas as u16;
    }
    if let Some(window) = env_u64("SCENED_MAX_LATENCY")? {
        cfg.max_latency = window;
    }
    if let Some(cap) = env_u64("SCENED_NODE_SPACE")? {
        cfg.node_space_cap = cap as u16;
    }
    match env::var("SCENED_MODE").as_deref() {
        Ok("dev") => cfg.mode = ConfigMode::Dev,
        Ok("prod") => cfg.mode = ConfigMode::Prod,
        Ok(_) => return Err(ConfigError::BadEnvValue("SCENED_MODE")),
        Err(_) => {}
    }
    if let Some(shards) = cli_u64(&cli, "shards")? {
        cfg.shards = shards as u16;
    }
    if let Some(replicas) = cli_u64(&cli, "replicas")? {
        cfg.replicas_per_shard = replicas as u16;
    }
    if let Some(window) = cli_u64(&cli, "max-latency")? {
        cfg.max_latency = window;
    }
    if let Some(cap) = cli_u64(&cli, "node-space")? {
        cfg.node_space_cap = cap as u16;
    }
    match cli.get("mode").map(|v| v.as_slice()) {
        Some([mode]) if mode == "dev" => cfg.mode = ConfigMode::Dev,
        Some([mode]) if mode == "prod" => cfg.mode = ConfigMode::Prod,
        Some(_) => return Err(ConfigError::BadCliArg("--mode".to_owned())),
        None => {}
    }
    cfg.validate()
}

#[cfg(test)]
mod tests {
    use super::{parse_cli_args, resolve_with, ConfigError, ConfigMode, Configuration};

    fn args(raw: &[&str]) -> super::ParsedRawArgs {
        parse_cli_args(raw.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn cli_overrides_the_defaults() {
        let cfg = resolve_with(args(&["--shards", "4", "--max-latency=32", "--mode", "prod"]))
            .unwrap();
        assert_eq!(cfg.shards, 4);
        assert_eq!(cfg.max_latency, 32);
        assert_eq!(cfg.mode, ConfigMode::Prod);
        // untouched knobs keep their defaults
        assert_eq!(cfg.node_space_cap, Configuration::DEFAULT_NODE_SPACE_CAP);
    }

    #[test]
    fn bad_cli_options_are_rejected() {
        assert!(matches!(
            parse_cli_args(["shards".to_owned()].into_iter()),
            Err(ConfigError::BadCliArg(_))
        ));
        assert!(matches!(
            parse_cli_args(["--shards".to_owned()].into_iter()),
            Err(ConfigError::BadCliArg(_))
        ));
        assert!(matches!(
            resolve_with(args(&["--no-such-option", "1"])),
            Err(ConfigError::BadCliArg(_))
        ));
        assert!(matches!(
            resolve_with(args(&["--shards", "one"])),
            Err(ConfigError::BadCliArg(_))
        ));
    }

    #[test]
    fn defaults_match_reference_configuration() {
        let cfg = Configuration::default_dev_mode();
        assert_eq!(cfg.shards, 2);
        assert_eq!(cfg.max_latency, 16);
        assert_eq!(cfg.node_space_cap, 1000);
        assert_eq!(cfg.replicas_per_shard, 3);
    }

    #[test]
    fn validation_rejects_thin_prod_clusters() {
        let cfg = Configuration {
            shards: 2,
            replicas_per_shard: 2,
            max_latency: 16,
            node_space_cap: 1000,
            mode: ConfigMode::Prod,
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            ConfigError::InsufficientReplicas(2)
        );
    }

    #[test]
    fn validation_rejects_zero_window() {
        let cfg = Configuration {
            max_latency: 0,
            ..Configuration::default_dev_mode()
        };
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::BadMaxLatency);
    }
}
