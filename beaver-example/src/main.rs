use std::sync::atomic::{AtomicUsize, Ordering};

use beaver_inject::{
    Binder, Bootstrap, InjectError, Key, Module, ModuleSource, Multibound, Qualifier,
};

trait Greeter {}

/// Qualifies the rendered greeting.
struct Greeting;

fn greeting_key() -> Key {
    Key::of::<String>().qualified(Qualifier::marker::<Greeting>())
}

#[derive(Default)]
struct GreetingModule {
    served: AtomicUsize,
}

impl Module for GreetingModule {
    fn configure(&self, binder: &mut Binder<'_, Self>) {
        binder
            .provides::<String>("name")
            .singleton()
            .to(|_, _| Ok("beaver".to_string()));
        binder
            .provides::<String>("greeting")
            .qualified(Qualifier::marker::<Greeting>())
            .depends_on(Key::of::<String>())
            .to(|module, deps| {
                let served = module.served.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("hello {} (#{})", deps.get::<String>(0)?, served))
            });
        binder
            .binds::<dyn Greeter>("greeter")
            .into_set()
            .from(greeting_key());
    }
}

fn main() -> Result<(), InjectError> {
    let application = Bootstrap::builder()
        .initialize_logging(true)
        .modules(vec![ModuleSource::of::<GreetingModule>()])
        .build()
        .initialize()?;
    let injector = application.injector();

    let greeting = injector.instance(&greeting_key())?;
    if let Some(greeting) = greeting.downcast_ref::<String>() {
        tracing::info!("{}", greeting);
    }

    let greeters = injector.binding(&Key::set_of(&Key::of::<dyn Greeter>()))?;
    for declaration in greeters.provenance() {
        tracing::info!("greeters declared by {}", declaration);
    }
    let greeters = greeters.provided_value()?;
    if let Some(values) = greeters
        .downcast_ref::<Multibound>()
        .and_then(Multibound::values::<String>)
    {
        tracing::info!("{} greeter(s): {:?}", values.len(), values);
    }
    Ok(())
}
