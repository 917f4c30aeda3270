//! Resource limits and tier presets.

use serde::{Deserialize, Serialize};

/// Resource ceilings for one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_millicores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_bps: u64,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub io_bps: u64,
    pub io_iops: u32,
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Billing tiers, each mapping to a limits preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxTier {
    Free,
    Standard,
    Pro,
    Enterprise,
}

impl SandboxTier {
    pub fn limits(&self) -> ResourceLimits {
        match self {
            SandboxTier::Free => ResourceLimits {
                cpu_millicores: 500,
                memory_bytes: 512 * MIB,
                disk_bytes: GIB,
                network_bps: 10 * MIB,
                max_processes: 64,
                max_open_files: 256,
                io_bps: 20 * MIB,
                io_iops: 500,
            },
            SandboxTier::Standard => ResourceLimits {
                cpu_millicores: 1000,
                memory_bytes: 2 * GIB,
                disk_bytes: 10 * GIB,
                network_bps: 50 * MIB,
                max_processes: 256,
                max_open_files: 1024,
                io_bps: 100 * MIB,
                io_iops: 2000,
            },
            SandboxTier::Pro => ResourceLimits {
                cpu_millicores: 2000,
                memory_bytes: 4 * GIB,
                disk_bytes: 50 * GIB,
                network_bps: 100 * MIB,
                max_processes: 512,
                max_open_files: 4096,
                io_bps: 250 * MIB,
                io_iops: 5000,
            },
            SandboxTier::Enterprise => ResourceLimits {
                cpu_millicores: 4000,
                memory_bytes: 16 * GIB,
                disk_bytes: 200 * GIB,
                network_bps: 500 * MIB,
                max_processes: 2048,
                max_open_files: 16384,
                io_bps: 1000 * MIB,
                io_iops: 20000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_scale_monotonically() {
        let tiers = [
            SandboxTier::Free,
            SandboxTier::Standard,
            SandboxTier::Pro,
            SandboxTier::Enterprise,
        ];
        for pair in tiers.windows(2) {
            let lower = pair[0].limits();
            let upper = pair[1].limits();
            assert!(upper.cpu_millicores > lower.cpu_millicores);
            assert!(upper.memory_bytes > lower.memory_bytes);
            assert!(upper.disk_bytes > lower.disk_bytes);
        }
    }
}
