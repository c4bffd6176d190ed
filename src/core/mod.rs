//! The in-memory data model: classes, hosts, and the registry that owns
//! them. Classes and hosts reference each other by name and resolve through
//! the registry.

mod class;
mod host;
mod registry;

pub use class::{ALL, Class, FARM, class_order, valid_class_name};
pub use host::{DEATH, Host, canon, host_order, valid_host_name};
pub use registry::{Registry, UnknownClass};
