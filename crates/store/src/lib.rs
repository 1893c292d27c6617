//! Mirra store: delta queue, indexed cache, dispatcher and the informer loops.

#![forbid(unsafe_code)]

mod backoff;
mod dispatch;
mod index;
mod informer;
mod lister;
mod queue;
mod reflector;

pub use backoff::ExponentialBackoff;
pub use dispatch::{Dispatcher, EventHandler, HandlerFuncs, Notification};
pub use index::Store;
pub use informer::{Informer, InformerHandle};
pub use lister::{Lister, NamespaceLister};
pub use queue::DeltaQueue;
pub use reflector::Reflector;

pub mod prelude {
    pub use super::{EventHandler, HandlerFuncs, Informer, InformerHandle, Lister};
    pub use mirra_core::prelude::*;
}
