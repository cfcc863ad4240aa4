//! Backend descriptor reported by `/info` and `/version`.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sockerless_core::config::DescriptorConfig;

/// Identity of this backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    /// Stable backend id.
    pub id: String,
    /// Backend name.
    pub name: String,
    /// Reported server version.
    pub server_version: String,
    /// Driver name.
    pub driver: String,
    /// Operating system description.
    pub os: String,
    /// Operating system family.
    pub os_type: String,
    /// CPU architecture.
    pub architecture: String,
    /// Logical CPUs.
    pub ncpu: i64,
    /// Total memory in bytes.
    pub mem_total: i64,
    /// Instance id tagging launched jobs.
    pub instance_id: String,
}

impl BackendDescriptor {
    /// Builds a descriptor, filling unset fields from the host.
    #[must_use]
    pub fn from_host(config: &DescriptorConfig, driver: &str, instance_id: &str) -> Self {
        Self {
            id: deterministic_id(instance_id),
            name: config.name.clone().unwrap_or_else(hostname),
            server_version: config
                .server_version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            driver: config.driver.clone().unwrap_or_else(|| driver.to_string()),
            os: std::env::consts::OS.to_string(),
            os_type: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            ncpu: num_cpus(),
            mem_total: total_memory(),
            instance_id: instance_id.to_string(),
        }
    }
}

fn num_cpus() -> i64 {
    std::thread::available_parallelism()
        .map(|n| i64::try_from(n.get()).unwrap_or(i64::MAX))
        .unwrap_or(1)
}

fn total_memory() -> i64 {
    let sys = sysinfo::System::new_all();
    i64::try_from(sys.total_memory()).unwrap_or(i64::MAX)
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "sockerless".to_string())
}

fn deterministic_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(&digest[..12])
}
