use serde::de::DeserializeOwned;

pub mod cluster;
pub mod compaction;
pub mod database;
pub mod repair;
pub mod storage;
#[cfg(test)]
pub(crate) mod utils;

pub fn envy_load<T: DeserializeOwned>(name: &str, prefix: &str) -> T {
    envy_try_load(prefix).unwrap_or_else(|_| {
        panic!("Cannot load config <{}>: {}", name, prefix);
    })
}

pub fn envy_try_load<T: DeserializeOwned>(prefix: &str) -> Result<T, envy::Error> {
    envy::prefixed(prefix).from_env()
}

/// Loads a config group from an optional file, letting prefixed environment
/// variables override file values.
pub fn load_config<T: DeserializeOwned>(
    path: &str,
    env_prefix: &str,
) -> Result<T, config::ConfigError> {
    let mut settings = config::Config::default();
    settings.merge(config::File::with_name(path).required(false))?;
    settings.merge(config::Environment::with_prefix(env_prefix))?;
    settings.try_into()
}
