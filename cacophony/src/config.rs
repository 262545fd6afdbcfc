//! Configuration for a local cacophony client.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, ensure, Context, Result};
use config::{Environment, File, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the optional config file in the config directory.
pub const CONFIG_FILE_NAME: &str = "cacophony.config.toml";

/// Prefix of environment variables setting config fields.
///
/// For example `CACOPHONY_KEY_NAME=other` sets [`Config::key_name`].
pub const ENV_PREFIX: &str = "CACOPHONY";

/// Name of the directory wrapping all cacophony files in an application directory.
const CACOPHONY_DIR: &str = "cacophony";

/// The configuration of a local client.
#[derive(PartialEq, Eq, Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Directory holding the local data model.
    pub data_dir: PathBuf,
    /// API address of the storage node.
    pub api_host: String,
    /// Name of the key the home channel publishes under.
    pub key_name: String,
    /// Workers running user commands.
    pub command_threads: usize,
    /// Workers issuing network calls.
    pub network_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: data_root().unwrap_or_else(|_| PathBuf::from(CACOPHONY_DIR)),
            api_host: "/ip4/127.0.0.1/tcp/5001".to_string(),
            key_name: "cacophony".to_string(),
            command_threads: 4,
            network_threads: 4,
        }
    }
}

impl Config {
    /// Make a config from the default config file and environment variables.
    ///
    /// Optionally provide an additional configuration file.
    pub fn from_env(additional_config_source: Option<&Path>) -> Result<Self> {
        let config_path = config_root()
            .context("invalid config path")?
            .join(CONFIG_FILE_NAME);
        if let Some(path) = additional_config_source {
            ensure!(
                path.is_file(),
                "Config file does not exist: {}",
                path.display()
            );
        }
        let sources = [Some(config_path.as_path()), additional_config_source];
        Self::load(&sources, ENV_PREFIX, HashMap::<String, String>::new())
    }

    /// Make a config using defaults, files, environment variables and explicit overrides.
    ///
    /// Later items in `file_paths` have a higher priority than earlier ones. Missing files
    /// are skipped. Environment variables start with `env_prefix` and use `__` to reach
    /// nested fields.
    pub fn load<S, V>(
        file_paths: &[Option<&Path>],
        env_prefix: &str,
        overrides: HashMap<S, V>,
    ) -> Result<Config>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let mut builder = config::Config::builder();

        for path in file_paths.iter().flatten() {
            if path.exists() {
                let p = path.to_str().ok_or_else(|| anyhow!("empty path"))?;
                builder = builder.add_source(File::with_name(p));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        for (key, val) in overrides.into_iter() {
            builder = builder.set_override(key, val)?;
        }

        let cfg = builder.build()?;
        debug!("make_config:\n{:#?}\n", cfg);
        let cfg: Config = cfg.try_deserialize()?;
        ensure!(cfg.command_threads > 0, "command_threads must be at least 1");
        ensure!(cfg.network_threads > 0, "network_threads must be at least 1");
        Ok(cfg)
    }
}

/// Returns the path to the user's cacophony config directory.
///
/// `CACOPHONY_CONFIG_DIR` is used unconditionally when set, otherwise the platform config
/// directory joined with `cacophony`.
pub fn config_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os("CACOPHONY_CONFIG_DIR") {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for configuration"))?;
    Ok(cfg.join(CACOPHONY_DIR))
}

/// Returns the path to the user's cacophony data directory.
///
/// `CACOPHONY_DATA_DIR` is used unconditionally when set, otherwise the platform data
/// directory joined with `cacophony`. Relative paths are resolved against the current
/// directory.
pub fn data_root() -> Result<PathBuf> {
    let path = if let Some(val) = env::var_os("CACOPHONY_DATA_DIR") {
        PathBuf::from(val)
    } else {
        let path = dirs_next::data_dir().ok_or_else(|| {
            anyhow!("operating environment provides no directory for application data")
        })?;
        path.join(CACOPHONY_DIR)
    };
    let path = if !path.is_absolute() {
        env::current_dir()?.join(path)
    } else {
        path
    };
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_settings() {
        let config = Config::load(&[][..], "__FOO", HashMap::<String, String>::new()).unwrap();
        assert_eq!(config.api_host, "/ip4/127.0.0.1/tcp/5001");
        assert_eq!(config.key_name, "cacophony");
        assert_eq!(config.command_threads, 4);
        assert_eq!(config.network_threads, 4);
    }

    #[test]
    fn file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "key_name = \"from-file\"\ncommand_threads = 2").unwrap();

        let config = Config::load(
            &[Some(file.path())],
            "__FOO",
            HashMap::from([("command_threads", 7i64)]),
        )
        .unwrap();
        assert_eq!(config.key_name, "from-file");
        assert_eq!(config.command_threads, 7);
    }

    #[test]
    fn zero_threads_rejected() {
        let res = Config::load(&[][..], "__FOO", HashMap::from([("network_threads", 0i64)]));
        assert!(res.is_err());
    }
}
