//! Producer descriptors and the topic registry.

pub mod descriptor;
pub mod registry;

pub use self::descriptor::{Producer, Publication};
pub use self::registry::ProducerRegistry;
