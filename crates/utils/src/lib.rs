pub mod logging;
pub mod retry;
pub mod version;

pub use retry::retry_during;
pub use version::compare_kube_aware_versions;
