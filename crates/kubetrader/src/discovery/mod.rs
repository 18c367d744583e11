pub mod orchestrator;
pub mod worker;

pub use orchestrator::CyclePhase;
pub use orchestrator::DiscoveryConfig;
pub use orchestrator::DiscoveryOrchestrator;
pub use orchestrator::DiscoveryStatus;
pub use worker::run_worker_pool;
pub use worker::PoolStats;
