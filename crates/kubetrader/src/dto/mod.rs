pub mod builder;
pub mod entities;
pub mod types;

pub use builder::BuildError;
pub use builder::FrequencyConverter;
pub use builder::GeneralBuilder;
pub use entities::seed_capacity_samples;
pub use entities::validate_snapshot;
pub use entities::SnapshotBuilder;
pub use entities::SnapshotError;
pub use types::CommodityDto;
pub use types::CommodityType;
pub use types::EntityDto;
pub use types::Snapshot;
