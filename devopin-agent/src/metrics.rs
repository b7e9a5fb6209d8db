use std::collections::BTreeMap;

use devopin_proto::{DiskUsage, HostInfo, InterfaceIo, NetworkIo, SystemMetricsSnapshot};
use log::debug;
use sysinfo::{Disks, Networks, System};
use time::OffsetDateTime;

/// Host resource sampler. Sampling never fails; a sub-probe that is
/// unavailable yields zeros or an empty section.
#[derive(Debug)]
pub struct MetricsCollector {
    system: System,
    disks: Disks,
    networks: Networks,
    net_interface: Option<netdev::Interface>,
    cpu_primed: bool,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let net_interface = netdev::get_default_interface()
            .inspect_err(|e| debug!("no default network interface: {e}"))
            .ok();
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            net_interface,
            cpu_primed: false,
        }
    }

    fn sample_cpu(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        if !self.cpu_primed {
            // usage is a delta between two refreshes
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            self.system.refresh_cpu_usage();
            self.cpu_primed = true;
        }
        self.system.global_cpu_usage()
    }

    fn sample_disks(&mut self) -> BTreeMap<String, DiskUsage> {
        self.disks.refresh(true);
        self.disks
            .list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let total = disk.total_space();
                let free = disk.available_space().min(total);
                let used = total - free;
                (
                    disk.mount_point().to_string_lossy().into_owned(),
                    DiskUsage {
                        total,
                        used,
                        free,
                        percent: used as f64 / total as f64 * 100.0,
                    },
                )
            })
            .collect()
    }

    fn sample_network(&mut self) -> NetworkIo {
        self.networks.refresh(true);
        let mut io = self
            .networks
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .fold(NetworkIo::default(), |mut io, (_, data)| {
                io.bytes_sent += data.total_transmitted();
                io.bytes_recv += data.total_received();
                io.packets_sent += data.total_packets_transmitted();
                io.packets_recv += data.total_packets_received();
                io
            });

        io.default_interface = self.net_interface.as_mut().map(|iface| {
            let _ = iface.update_stats();
            InterfaceIo {
                name: iface.name.clone(),
                rx_bytes: iface.stats.as_ref().map(|stats| stats.rx_bytes),
                tx_bytes: iface.stats.as_ref().map(|stats| stats.tx_bytes),
            }
        });
        io
    }

    pub fn sample(&mut self) -> SystemMetricsSnapshot {
        let cpu_percent = self.sample_cpu();

        self.system.refresh_memory();
        let memory_total = self.system.total_memory();
        let memory_available = self.system.available_memory().min(memory_total);
        let memory_percent = if memory_total == 0 {
            0.0
        } else {
            ((memory_total - memory_available) as f64 / memory_total as f64 * 100.0) as f32
        };

        let load = System::load_average();
        SystemMetricsSnapshot {
            timestamp: OffsetDateTime::now_utc(),
            cpu_percent,
            memory_percent,
            memory_available,
            memory_total,
            disk_usage: self.sample_disks(),
            network_io: self.sample_network(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }

    /// Placeholder used when sampling could not run at all.
    pub fn empty_snapshot() -> SystemMetricsSnapshot {
        SystemMetricsSnapshot {
            timestamp: OffsetDateTime::now_utc(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_available: 0,
            memory_total: 0,
            disk_usage: BTreeMap::new(),
            network_io: NetworkIo::default(),
            load_average: [0.0; 3],
        }
    }

    pub fn host_info() -> HostInfo {
        HostInfo {
            host_name: System::host_name(),
            system_name: System::name(),
            kernel_version: System::kernel_version(),
            os_version: System::os_version(),
            cpu_arch: System::cpu_arch(),
        }
    }
}
