pub mod client;
pub mod cpufreq;
pub mod scraper;
pub mod stats;

pub use client::KubeletClient;
pub use client::KubeletClientConfig;
pub use client::KubeletError;
pub use cpufreq::CpuFreqJob;
pub use scraper::NodeScraper;
