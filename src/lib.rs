//! Shared informers for Kubernetes resources.
//!
//! `InformerRegistry` keeps one informer per resource and watch options,
//! starts them together and waits until their caches are filled.

pub mod errors;
pub mod informer;
pub mod key;
pub mod reflector;
pub mod registry;
pub mod wait;

pub use self::{
    errors::RegistryError,
    informer::Informer,
    key::{GroupVersionResource, InformerKey, InformerOptions, InformerType},
    reflector::ReflectorInformer,
    registry::{InformerRegistry, RegistryParams, StartableInformer},
};
