//! Host metrics collection for workers
//!
//! Produces the three telemetry shapes a worker sends: the one-off
//! registration snapshot, the cheap heartbeat and the detailed metrics
//! report. Every probe is best-effort; anything that cannot be read is
//! reported as zero (or an empty GPU list) rather than failing the send.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sysinfo::{Disks, Networks, System};

use crate::protocol::{
    ContainerRuntime, CpuMetrics, DiskMetrics, GpuDevice, GpuStatusSummary, HeartbeatPayload,
    MemoryMetrics, MetricsPayload, NetworkMetrics, NodeRegisterPayload, NodeStatus, OsInfo,
    PROTOCOL_VERSION,
};

const MB: u64 = 1024 * 1024;

/// Static identity of the worker included in its registration
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub name: String,
    pub ip_address: String,
    pub public_ip_address: Option<String>,
    pub container_runtime: ContainerRuntime,
    pub gpu_devices: Vec<GpuDevice>,
}

pub struct MetricsCollector {
    system: System,
    disks: Disks,
    networks: Networks,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.networks.refresh(true);
    }

    pub fn uptime_seconds(&self) -> u64 {
        System::uptime()
    }

    /// Full hardware snapshot for `node.register`
    pub fn registration(&mut self, node: &NodeDescriptor) -> NodeRegisterPayload {
        self.refresh();

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let cpu_model = self
            .system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();

        NodeRegisterPayload {
            node_id: node.node_id.clone(),
            name: node.name.clone(),
            hostname,
            ip_address: node.ip_address.clone(),
            public_ip_address: node.public_ip_address.clone(),
            os: os_info(),
            cpu_cores: self.system.cpus().len() as u32,
            cpu_model,
            ram_total: self.system.total_memory() / MB,
            disk_total: self.disk().total,
            gpu_devices: node.gpu_devices.clone(),
            daemon_version: PROTOCOL_VERSION.to_string(),
            node_status: NodeStatus::Ready,
            uptime_seconds: self.uptime_seconds(),
            container_runtime: node.container_runtime.clone(),
        }
    }

    /// Cheap liveness report
    pub fn heartbeat(&mut self, node_id: &str, active_deployments: u32) -> HeartbeatPayload {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let gpu_status = gpu_devices()
            .into_iter()
            .map(|gpu| {
                let utilization = gpu.utilization.unwrap_or(0.0);
                GpuStatusSummary {
                    device_id: gpu.device_id,
                    utilization,
                    status: if utilization > 0.0 { "busy" } else { "idle" }.to_string(),
                }
            })
            .collect();

        HeartbeatPayload {
            node_id: node_id.to_string(),
            status: NodeStatus::Healthy,
            uptime_seconds: self.uptime_seconds(),
            active_deployments,
            cpu_usage: percent(self.system.global_cpu_usage() as f64),
            ram_usage: ratio(self.system.used_memory(), self.system.total_memory()),
            gpu_status,
        }
    }

    /// Detailed utilization report
    pub fn metrics(&mut self, node_id: &str) -> MetricsPayload {
        self.refresh();

        let load = System::load_average();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let free = self.system.free_memory();
        let cached = self.system.available_memory().saturating_sub(free);

        MetricsPayload {
            node_id: node_id.to_string(),
            cpu: CpuMetrics {
                usage: percent(self.system.global_cpu_usage() as f64),
                cores: self.system.cpus().len() as u32,
                load_average: [finite(load.one), finite(load.five), finite(load.fifteen)],
            },
            memory: MemoryMetrics {
                total: total / MB,
                used: used / MB,
                free: free / MB,
                cached: cached / MB,
                usage: ratio(used, total),
            },
            disk: self.disk(),
            network: self.network(),
            gpu_devices: gpu_devices(),
        }
    }

    fn disk(&self) -> DiskMetrics {
        let (total, available) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.available_space()))
            .fold((0u64, 0u64), |(t, a), (dt, da)| (t + dt, a + da));
        let used = total.saturating_sub(available);
        DiskMetrics {
            total: total / MB,
            used: used / MB,
            free: available / MB,
            usage: ratio(used, total),
        }
    }

    fn network(&self) -> NetworkMetrics {
        self.networks
            .iter()
            .fold(NetworkMetrics::default(), |mut acc, (_, data)| {
                acc.bytes_received += data.total_received();
                acc.bytes_sent += data.total_transmitted();
                acc.packets_received += data.total_packets_received();
                acc.packets_sent += data.total_packets_transmitted();
                acc
            })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics collector for use across async tasks
pub type SharedMetricsCollector = Arc<tokio::sync::RwLock<MetricsCollector>>;

pub fn new_shared_collector() -> SharedMetricsCollector {
    Arc::new(tokio::sync::RwLock::new(MetricsCollector::new()))
}

fn os_info() -> OsInfo {
    OsInfo {
        platform: std::env::consts::OS.to_string(),
        distro: System::name().unwrap_or_default(),
        version: System::os_version().unwrap_or_default(),
        arch: std::env::consts::ARCH.to_string(),
        kernel: System::kernel_version().unwrap_or_default(),
    }
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn percent(value: f64) -> f64 {
    finite(value).clamp(0.0, 100.0)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    percent(part as f64 / whole as f64 * 100.0)
}

/// NVIDIA devices visible through NVML, keyed by index
#[cfg(feature = "gpu")]
pub fn gpu_devices() -> Vec<GpuDevice> {
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
    use nvml_wrapper::Nvml;

    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => {
            tracing::debug!("NVML unavailable: {}", e);
            return vec![];
        }
    };

    let driver_version = nvml.sys_driver_version().unwrap_or_default();
    let cuda_version = nvml
        .sys_cuda_driver_version()
        .map(|v| format!("{}.{}", v / 1000, (v % 1000) / 10))
        .unwrap_or_default();
    let count = nvml.device_count().unwrap_or(0);

    (0..count)
        .filter_map(|index| {
            let device = nvml.device_by_index(index).ok()?;
            let memory = device.memory_info().ok();
            let utilization = device.utilization_rates().ok().map(|u| u.gpu as f64);
            Some(GpuDevice {
                device_id: index.to_string(),
                model: device.name().unwrap_or_default(),
                memory_total: memory.as_ref().map(|m| m.total / MB).unwrap_or(0),
                memory_used: memory.as_ref().map(|m| m.used / MB),
                memory_usage: memory.as_ref().map(|m| ratio(m.used, m.total)),
                pcie_bus_id: device.pci_info().map(|p| p.bus_id).unwrap_or_default(),
                cuda_version: cuda_version.clone(),
                driver_version: driver_version.clone(),
                utilization,
                temperature: device
                    .temperature(TemperatureSensor::Gpu)
                    .ok()
                    .map(|t| t as f64),
                power_draw: device.power_usage().ok().map(|mw| mw as f64 / 1000.0),
                power_limit: device.enforced_power_limit().ok().map(|mw| mw as f64 / 1000.0),
                processes: vec![],
                status: Some(
                    if utilization.unwrap_or(0.0) > 0.0 { "busy" } else { "idle" }.to_string(),
                ),
                errors: vec![],
            })
        })
        .collect()
}

/// GPU discovery - stub when GPU feature is disabled
#[cfg(not(feature = "gpu"))]
pub fn gpu_devices() -> Vec<GpuDevice> {
    vec![]
}

/// Address of the interface used for outbound traffic
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Ask an echo service for this host's public address
pub async fn probe_public_ip(url: &str) -> anyhow::Result<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    body.trim()
        .parse()
        .with_context(|| format!("'{}' returned a non-address body", url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor {
            node_id: "gpu-node-1".to_string(),
            name: "GPU Node 1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            public_ip_address: None,
            container_runtime: ContainerRuntime {
                runtime_type: "docker".to_string(),
                version: "27.0.3".to_string(),
                root_dir: String::new(),
            },
            gpu_devices: vec![],
        }
    }

    #[test]
    fn test_registration_snapshot() {
        let mut collector = MetricsCollector::new();
        let snapshot = collector.registration(&descriptor());

        assert_eq!(snapshot.node_id, "gpu-node-1");
        assert_eq!(snapshot.name, "GPU Node 1");
        assert_eq!(snapshot.node_status, NodeStatus::Ready);
        assert_eq!(snapshot.daemon_version, PROTOCOL_VERSION);
        assert_eq!(snapshot.os.arch, std::env::consts::ARCH);
        assert!(snapshot.cpu_cores > 0);
        assert_eq!(snapshot.container_runtime.runtime_type, "docker");
    }

    #[test]
    fn test_heartbeat_within_bounds() {
        let mut collector = MetricsCollector::new();
        let heartbeat = collector.heartbeat("gpu-node-1", 2);

        assert_eq!(heartbeat.active_deployments, 2);
        assert!((0.0..=100.0).contains(&heartbeat.cpu_usage));
        assert!((0.0..=100.0).contains(&heartbeat.ram_usage));
        assert!(heartbeat.validate().is_ok());
    }

    #[test]
    fn test_metrics_report() {
        let mut collector = MetricsCollector::new();
        let metrics = collector.metrics("gpu-node-1");

        assert_eq!(metrics.node_id, "gpu-node-1");
        assert!(metrics.memory.total >= metrics.memory.used);
        assert!(metrics.disk.total >= metrics.disk.used);
        assert!((0.0..=100.0).contains(&metrics.memory.usage));
        assert!(metrics.cpu.load_average.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_ratio_zero_fills() {
        assert_eq!(ratio(10, 0), 0.0);
        assert_eq!(ratio(50, 100), 50.0);
        assert_eq!(percent(f64::NAN), 0.0);
        assert_eq!(percent(140.0), 100.0);
    }
}
