pub mod sink;
pub mod types;

pub use sink::EntityMetricSink;
pub use types::EntityKind;
pub use types::Point;
pub use types::ResourceKind;
pub use types::SampleKind;
pub use types::SampleValue;
pub use types::ThrottlingCumulative;
