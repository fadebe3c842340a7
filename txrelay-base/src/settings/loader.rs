use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use eyre::{bail, Context, Result};
use serde::de::DeserializeOwned;

/// Load a settings object from the config locations described in the
/// `settings` module.
pub fn load_settings_object<T>(env_prefix: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let config_file_paths: Vec<PathBuf> = env::var("CONFIG_FILES")
        .map(|s| s.split(',').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default();
    let env_vars: HashMap<String, String> = env::vars().collect();
    load_settings_from(Path::new("./config"), &config_file_paths, env_prefix, env_vars)
}

/// Load a settings object from an explicit config directory, extra files and
/// environment.
pub fn load_settings_from<T>(
    config_dir: &Path,
    config_file_paths: &[PathBuf],
    env_prefix: &str,
    env_vars: HashMap<String, String>,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut config_sources = vec![];
    let mut builder = Config::builder();

    // Always load the default config files, sorted so the order is stable
    if config_dir.is_dir() {
        let mut defaults = vec![];
        for entry in config_dir
            .read_dir()
            .with_context(|| format!("Failed to open config directory {config_dir:?}"))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension() == Some("json".as_ref()) {
                defaults.push(path);
            }
        }
        defaults.sort();
        for path in defaults {
            config_sources.push(format!("{path:?}"));
            builder = builder.add_source(File::from(path));
        }
    }

    // Load a set of additional user specified config files
    for path in config_file_paths {
        if !path.is_file() {
            bail!("Provided config path via CONFIG_FILES is not a file ({path:?})");
        }
        config_sources.push(format!("{path:?}"));
        builder = builder.add_source(File::from(path.clone()));
    }

    let config_deserializer = builder
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(Some(env_vars)),
        )
        .build()
        .context("Failed to load config sources")?;

    match config_deserializer.try_deserialize::<T>() {
        Ok(settings) => Ok(settings),
        Err(err) => {
            let mut err = if let Some(source_err) = err.source() {
                let source = format!("Config error source: {source_err}");
                Err(err).context(source)
            } else {
                Err(err.into())
            };
            for cfg_path in &config_sources {
                err = err.with_context(|| format!("Config loaded: {cfg_path}"));
            }
            err.context("Config deserialization error")
        }
    }
}
