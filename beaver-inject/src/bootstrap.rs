use std::path::PathBuf;

use di::{Ref, ServiceCollection, singleton_as_self};
use typed_builder::TypedBuilder;

use crate::{
    config::{Config, InjectorConfig},
    error::Result,
    injector::Injector,
    log::{self, AppenderGuard, LoggingConfig},
    module::ModuleSource,
};

/// Bootstrap is the entry point of the application.
///
/// It loads the configuration, initializes logging, and builds the injector
/// from the given modules.
///
/// # Example
/// ```no_run
/// use beaver_inject::Bootstrap;
/// let application = Bootstrap::builder().build().initialize().unwrap();
/// let injector = application.injector();
/// ```
#[derive(TypedBuilder)]
pub struct Bootstrap {
    /// Whether need to initialize logging.
    #[builder(default = true)]
    initialize_logging: bool,

    /// Prefix of environment variables to override config values.
    #[builder(default = Some("BEAVER_".to_string()))]
    env_config_prefix: Option<String>,
    /// Separator of environment variables to override config values.
    #[builder(default = "_".to_string())]
    env_config_split: String,
    /// Folder holding `config.toml`; defaults to `etc` next to the executable.
    #[builder(default, setter(strip_option, into))]
    config_folder: Option<PathBuf>,

    /// a collection of module sources, in registration order.
    #[builder(default = vec![])]
    modules: Vec<ModuleSource>,
}

impl Bootstrap {
    pub fn initialize(self) -> Result<Application> {
        // first we try to initialize config
        let config = self.initialize_config()?;
        // then we try to initialize logging by logger config
        let logger = if self.initialize_logging {
            Some(log::init(&config.get::<LoggingConfig>()?)?)
        } else {
            None
        };
        let injector_config = config.get::<InjectorConfig>()?;
        let injector = Injector::create(self.modules, &injector_config)?;
        tracing::info!(
            "injector initialized with {} binding(s)",
            injector.keys().count()
        );
        Ok(Application::new(config, injector, logger))
    }

    fn initialize_config(&self) -> Result<Config> {
        let env_config_prefix: Option<&str> = self.env_config_prefix.as_deref();
        let env_config_split: &str = self.env_config_split.as_str();
        let config = match &self.config_folder {
            Some(folder) => Config::from_folder(folder, env_config_prefix, env_config_split)?,
            None => Config::load(env_config_prefix, env_config_split)?,
        };
        Ok(config)
    }
}

/// The initialized application: config, injector and the host service
/// collection both are registered in.
pub struct Application {
    config: Ref<Config>,
    injector: Ref<Injector>,
    services: ServiceCollection,
    _logger: Option<AppenderGuard>,
}

impl Application {
    fn new(config: Config, injector: Injector, logger: Option<AppenderGuard>) -> Self {
        let config = Ref::new(config);
        let injector = Ref::new(injector);
        let mut services = ServiceCollection::new();
        register_service(&config, &mut services);
        register_service(&injector, &mut services);
        Self {
            config,
            injector,
            services,
            _logger: logger,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    pub fn services(&self) -> &ServiceCollection {
        &self.services
    }

    /// The host container, for registering services of its own.
    pub fn services_mut(&mut self) -> &mut ServiceCollection {
        &mut self.services
    }
}

/// register a service to the service collection as a singleton.
fn register_service<T: Send + Sync + 'static>(service: &Ref<T>, binder: &mut ServiceCollection) {
    let service = service.clone();
    binder.add(singleton_as_self::<T>().from(move |_| service.clone()));
}
