pub mod descriptor;
pub mod store;

pub use descriptor::{validate, ModelDescriptor, ParameterKind, ParameterSpec, ValidationReport};
pub use store::{CatalogError, CatalogLoad, ModelCatalog};
