mod catalog;
pub mod registry;

pub use catalog::{Catalog, IndexDescriptor, CATALOG_CONTAINER, CATALOG_META_PAGE};
pub use registry::{IndexLease, IndexRegistry};
