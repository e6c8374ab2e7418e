//! Binding resolution for module-declared providers and aliases.
//!
//! Modules declare providers (factories with dependencies), aliases (a key
//! exposing another key's value) and set/map multibinding contributions.
//! [`build_injector`] normalizes those declarations, validates the resulting
//! graph once, and returns an [`Injector`] that resolves values by [`Key`].
//!
//! ```
//! use beaver_inject::{Binder, Key, Module, ModuleSource, build_injector};
//!
//! #[derive(Default)]
//! struct Greetings;
//!
//! impl Module for Greetings {
//!     fn configure(&self, binder: &mut Binder<'_, Self>) {
//!         binder.provides::<String>("greeting").to(|_, _| Ok("hello".to_string()));
//!     }
//! }
//!
//! let injector = build_injector([ModuleSource::of::<Greetings>()]).unwrap();
//! let greeting = injector.instance(&Key::of::<String>()).unwrap();
//! assert_eq!(greeting.downcast_ref::<String>().unwrap(), "hello");
//! ```

pub mod bootstrap;
pub mod config;
pub mod descriptor;
pub mod error;
mod graph;
pub mod injector;
pub mod key;
pub mod log;
pub mod module;
pub mod multibinding;
mod serde;

pub use crate::bootstrap::{Application, Bootstrap};
pub use crate::config::{InjectorConfig, Stage};
pub use crate::descriptor::{Declaration, DescriptorSet, ModuleId, Scope};
pub use crate::error::{InjectError, Result};
pub use crate::injector::{Binding, Dependencies, Injector, Instance, Lazy, build_injector};
pub use crate::key::{Key, Qualifier};
pub use crate::module::{Binder, Module, ModuleSource};
pub use crate::multibinding::{CollectionKind, Multibound};
