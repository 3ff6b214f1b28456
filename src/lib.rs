pub mod check;
pub mod config;
pub mod containers;
pub mod digest;
pub mod drivers;
pub mod errors;
pub mod idset;
pub mod images;
pub mod layers;
pub mod lockfile;
pub mod metadata;
pub mod store;
pub mod userns;

#[cfg(test)]
mod test_tar;

pub use check::{CheckOptions, CheckReport, RepairOptions};
pub use config::StoreOptions;
pub use containers::{Container, ContainerOptions};
pub use errors::{Result, StoreError};
pub use idset::IdMap;
pub use images::{Image, ImageOptions};
pub use layers::{Layer, LayerOptions};
pub use store::{ContainerCreateOptions, Store, StoreRegistry};
