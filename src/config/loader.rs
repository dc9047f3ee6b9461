use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "LOADER_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file("plugin-loader.toml"))
        .merge(Json::file("plugin-loader.json"))
        // Override with environment variables (LOADER_ prefix, `__` for nesting)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;

    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let base = Figment::from(Serialized::defaults(Config::default()));

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => base.merge(Toml::file(path)),
        Some("json") => base.merge(Json::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml or .json".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.plugin_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("plugin_path must not be empty".into()).into());
    }

    if config.server.port == 0 {
        return Err(ConfigError::Validation("server port must be greater than 0".into()).into());
    }

    if config.sandbox.connect_retries == 0 {
        return Err(ConfigError::Validation(
            "sandbox connect_retries must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.plugin_path = substitute_path(&config.plugin_path)?;
    config.homebrew_path = substitute_path(&config.homebrew_path)?;
    config.sandbox.socket_dir = substitute_path(&config.sandbox.socket_dir)?;

    if let Some(dir) = &config.log_dir {
        config.log_dir = Some(substitute_path(dir)?);
    }
    if let Some(exe) = &config.sandbox.executable {
        config.sandbox.executable = Some(substitute_path(exe)?);
    }
    if let Some(user) = &config.user {
        config.user = Some(substitute_env_vars(user)?);
    }

    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(substitute_env_vars(&path.to_string_lossy())?))
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
