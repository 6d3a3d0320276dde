//! System and per-agent resource metrics.

use crate::agent::{Agent, AgentStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use sysinfo::{Disks, Networks, Pid, System};

/// System-wide resource metrics.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_percent: f32,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    pub load_avg_1min: f64,
    pub load_avg_5min: f64,
    pub load_avg_15min: f64,
    pub network_sent_mbps: f64,
    pub network_recv_mbps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuMetrics {
    pub name: String,
    pub utilization: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub temperature: f32,
}

/// Per-agent resource metrics, aggregated over the session's process tree.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub process_count: usize,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Complete snapshot of system and agent metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: i64,
    pub system: SystemMetrics,
    pub agents: HashMap<String, AgentMetrics>,
    pub total_agents_running: usize,
    pub total_agent_memory_mb: f64,
}

pub struct MetricsCollector {
    system: System,
    networks: Networks,
    enable_gpu: bool,
    last_net: Option<(Instant, u64, u64)>,
}

impl MetricsCollector {
    pub fn new(enable_gpu: bool) -> Self {
        Self {
            system: System::new_all(),
            networks: Networks::new_with_refreshed_list(),
            enable_gpu,
            last_net: None,
        }
    }

    pub fn collect_system(&mut self) -> SystemMetrics {
        self.system.refresh_all();

        let memory_total = self.system.total_memory();
        let memory_used = self.system.used_memory();
        let memory_percent = if memory_total > 0 {
            (memory_used as f64 / memory_total as f64 * 100.0) as f32
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .iter()
            .fold((0u64, 0u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        let disk_used = disk_total.saturating_sub(disk_available);
        let disk_percent = if disk_total > 0 {
            (disk_used as f64 / disk_total as f64 * 100.0) as f32
        } else {
            0.0
        };

        let load = System::load_average();

        // Network throughput as a delta from the previous collection.
        self.networks.refresh(true);
        let (total_sent, total_recv) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (sent + data.total_transmitted(), recv + data.total_received())
            });
        let now = Instant::now();
        let (network_sent_mbps, network_recv_mbps) = match self.last_net {
            Some((last_time, last_sent, last_recv)) => {
                let elapsed = now.duration_since(last_time).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        (total_sent.saturating_sub(last_sent)) as f64 / elapsed / (1024.0 * 1024.0),
                        (total_recv.saturating_sub(last_recv)) as f64 / elapsed / (1024.0 * 1024.0),
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.last_net = Some((now, total_sent, total_recv));

        SystemMetrics {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent,
            memory_used_mb: memory_used as f64 / (1024.0 * 1024.0),
            memory_total_mb: memory_total as f64 / (1024.0 * 1024.0),
            disk_percent,
            disk_used_gb: disk_used as f64 / (1024.0 * 1024.0 * 1024.0),
            disk_total_gb: disk_total as f64 / (1024.0 * 1024.0 * 1024.0),
            load_avg_1min: load.one,
            load_avg_5min: load.five,
            load_avg_15min: load.fifteen,
            network_sent_mbps,
            network_recv_mbps,
            gpu: None,
        }
    }

    /// Aggregate CPU/memory for every process whose command line mentions the
    /// agent's session name, plus their descendants.
    pub fn collect_agent(&self, agent: &Agent) -> AgentMetrics {
        let mut matching: HashSet<Pid> = HashSet::new();
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();

        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
            let in_cmdline = process
                .cmd()
                .iter()
                .any(|arg| arg.to_string_lossy().contains(&agent.session_name));
            if in_cmdline {
                matching.insert(*pid);
            }
        }

        // Pull in descendants of every matched process.
        let mut queue: Vec<Pid> = matching.iter().copied().collect();
        while let Some(pid) = queue.pop() {
            if let Some(kids) = children.get(&pid) {
                for kid in kids {
                    if matching.insert(*kid) {
                        queue.push(*kid);
                    }
                }
            }
        }

        let mut cpu = 0.0f32;
        let mut memory = 0u64;
        let mut count = 0usize;
        for pid in &matching {
            if let Some(process) = self.system.process(*pid) {
                cpu += process.cpu_usage();
                memory += process.memory();
                count += 1;
            }
        }

        AgentMetrics {
            agent_id: agent.id.clone(),
            process_count: count,
            cpu_percent: cpu,
            memory_mb: memory as f64 / (1024.0 * 1024.0),
        }
    }

    /// Collect system metrics plus per-agent metrics for non-stopped agents.
    pub async fn collect_all(&mut self, agents: &[Agent], per_agent: bool) -> MetricsSnapshot {
        let mut system = self.collect_system();
        if self.enable_gpu {
            system.gpu = collect_gpu().await;
        }

        let mut agent_metrics = HashMap::new();
        let mut total_memory = 0.0;
        let mut running = 0;

        if per_agent {
            for agent in agents {
                if agent.status == AgentStatus::Stopped {
                    continue;
                }
                let metrics = self.collect_agent(agent);
                total_memory += metrics.memory_mb;
                running += 1;
                agent_metrics.insert(agent.id.clone(), metrics);
            }
        }

        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            system,
            agents: agent_metrics,
            total_agents_running: running,
            total_agent_memory_mb: total_memory,
        }
    }
}

/// GPU metrics via nvidia-smi; absence of the binary silently disables them.
async fn collect_gpu() -> Option<GpuMetrics> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,utilization.gpu,memory.used,memory.total,temperature.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_gpu_line(stdout.lines().next()?)
}

fn parse_gpu_line(line: &str) -> Option<GpuMetrics> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != 5 {
        return None;
    }
    Some(GpuMetrics {
        name: parts[0].to_string(),
        utilization: parts[1].parse().ok()?,
        memory_used_mb: parts[2].parse().ok()?,
        memory_total_mb: parts[3].parse().ok()?,
        temperature: parts[4].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_line() {
        let gpu = parse_gpu_line("NVIDIA GeForce RTX 4090, 37, 8123, 24564, 51").unwrap();
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpu.utilization, 37.0);
        assert_eq!(gpu.memory_total_mb, 24564.0);
        assert_eq!(gpu.temperature, 51.0);
    }

    #[test]
    fn rejects_malformed_gpu_lines() {
        assert!(parse_gpu_line("").is_none());
        assert!(parse_gpu_line("name only").is_none());
        assert!(parse_gpu_line("a, b, c, d, e").is_none());
    }

    #[tokio::test]
    async fn snapshot_counts_only_running_agents() {
        let mut collector = MetricsCollector::new(false);
        let mut stopped = Agent::new("s1", "api", "forge__api__s1", "/wt", "agent/s1/task");
        stopped.status = AgentStatus::Stopped;
        let running = Agent::new("r1", "api", "forge__api__r1", "/wt", "agent/r1/task");

        let snapshot = collector.collect_all(&[stopped, running], true).await;
        assert_eq!(snapshot.total_agents_running, 1);
        assert!(snapshot.agents.contains_key("r1"));
        assert!(!snapshot.agents.contains_key("s1"));
        assert!(snapshot.system.memory_total_mb > 0.0);
    }
}
