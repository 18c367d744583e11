pub mod client;
pub mod groups;
pub mod indexer;
pub mod quantity;
pub mod topology;

pub use client::init_kube_client;
pub use client::ClusterError;
pub use groups::ControllerGroupVersions;
pub use indexer::ClusterIndexer;
pub use indexer::IndexError;
pub use indexer::IndexedCluster;
pub use topology::TopologySnapshot;
