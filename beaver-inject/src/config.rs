use std::{
    env,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use config::{ConfigError, File, ValueKind};
use serde::Deserialize;
use typed_builder::TypedBuilder;

static DEFAULT_CONFIG_FOLDER: LazyLock<PathBuf> = LazyLock::new(|| {
    match env::var("BEAVER_CONFIG") {
        Ok(dir) => PathBuf::from(dir), // get config path from env
        Err(_) => {
            // get config path from current executable file path
            let mut folder = env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf))
                .unwrap_or_default();
            folder.push("etc");
            folder
        }
    }
});

/// Config is the configuration of the application.
///
/// It is loaded from the `config.toml` file in the `etc` folder next to the
/// executable (or `$BEAVER_CONFIG`), overridden by environment variables.
///
/// # Example
/// ```no_run
/// use beaver_inject::config::{Config, InjectorConfig};
/// let config = Config::load(None, "_").unwrap();
/// let injector_config = config.get::<InjectorConfig>().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    inner: config::Config,
}

impl Config {
    pub fn new(inner: config::Config) -> Self {
        Self { inner }
    }

    pub fn load(
        env_config_prefix: Option<&str>,
        env_config_split: &str,
    ) -> Result<Self, ConfigError> {
        Self::from_folder(
            DEFAULT_CONFIG_FOLDER.as_path(),
            env_config_prefix,
            env_config_split,
        )
    }

    pub fn from_folder(
        path: &Path,
        env_config_prefix: Option<&str>,
        env_config_split: &str,
    ) -> Result<Self, ConfigError> {
        let cfg = path.join("config.toml");
        let mut builder = config::Config::builder();

        if cfg.exists() {
            builder = builder.add_source(File::from(cfg))
        } else {
            tracing::warn!("not found config `{}`", cfg.display());
        }
        // add environment variables to config
        if let Some(prefix) = env_config_prefix {
            builder = builder
                .add_source(config::Environment::with_prefix(prefix).separator(env_config_split));
        } else {
            builder =
                builder.add_source(config::Environment::default().separator(env_config_split));
        }
        let config = builder.build()?;

        Ok(Self { inner: config })
    }

    /// Reads the section named by `T::PREFIX`; a missing section yields the
    /// section's defaults.
    pub fn get<'de, T>(&self) -> Result<T, ConfigError>
    where
        T: ConfigPrefix + Deserialize<'de>,
    {
        match self.inner.get::<T>(T::PREFIX) {
            Ok(o) => Ok(o),
            Err(e) => {
                let ConfigError::NotFound(_) = &e else {
                    return Err(e);
                };
                // get a map
                let v = config::Value::new(None, ValueKind::Table(Default::default()));

                match T::deserialize(v) {
                    Ok(o) => Ok(o),
                    Err(_) => Err(e),
                }
            }
        }
    }
}

/// ConfigPrefix is a trait that is used to identify the prefix of a configuration.
pub trait ConfigPrefix {
    const PREFIX: &'static str;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Singletons are evaluated on first request.
    #[default]
    Development,
    /// Every singleton is evaluated while the injector is built.
    Production,
}

/// Options of [`Injector::create`](crate::Injector::create), read from the
/// `injector` section.
///
/// ```toml
/// [injector]
/// stage = "production"
/// log_bindings = true
/// ```
#[derive(Debug, Default, Clone, Deserialize, TypedBuilder)]
#[serde(default, deny_unknown_fields)]
pub struct InjectorConfig {
    #[builder(default)]
    stage: Stage,
    #[builder(default = false)]
    log_bindings: bool,
}

impl InjectorConfig {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn log_bindings(&self) -> bool {
        self.log_bindings
    }
}

impl ConfigPrefix for InjectorConfig {
    const PREFIX: &'static str = "injector";
}
