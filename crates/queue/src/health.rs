//! System health monitor: battery and disk-space gating for the queue.
//!
//! A periodic tick reads power and free-space conditions through a
//! [`SystemProbe`] and pauses or resumes the [`QueueOrchestrator`]. A power
//! pause resumes automatically when AC power returns; a storage pause only
//! clears its flag and waits for an explicit start.

use crate::job::JobStatus;
use crate::orchestrator::{PauseReason, QueueOrchestrator};
use encode_queue_config::Config;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Battery state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    /// True when running on battery power (no AC).
    pub on_battery: bool,
    /// Charge level, 0 to 100.
    pub percent: u8,
}

/// Source of power and storage readings.
pub trait SystemProbe: Send + Sync {
    /// Battery state, or `None` when the host has no battery.
    fn battery(&self) -> Option<BatteryStatus>;

    /// Free bytes available at `dir`, or `None` when unknown.
    fn free_space(&self, dir: &Path) -> Option<u64>;
}

/// Probe reading Linux sysfs for power and `sysinfo` for disks.
#[derive(Debug, Clone)]
pub struct HostProbe {
    power_supply_dir: PathBuf,
}

impl Default for HostProbe {
    fn default() -> Self {
        Self {
            power_supply_dir: PathBuf::from(POWER_SUPPLY_DIR),
        }
    }
}

impl HostProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe reading power supplies from a custom sysfs-like directory.
    pub fn with_power_supply_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            power_supply_dir: dir.into(),
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

impl SystemProbe for HostProbe {
    fn battery(&self) -> Option<BatteryStatus> {
        let entries = fs::read_dir(&self.power_supply_dir).ok()?;

        let mut mains_online = false;
        let mut discharging = false;
        let mut percents = Vec::new();

        for entry in entries.flatten() {
            let dir = entry.path();
            match read_trimmed(&dir.join("type")).as_deref() {
                Some("Battery") => {
                    if let Some(percent) =
                        read_trimmed(&dir.join("capacity")).and_then(|c| c.parse::<u8>().ok())
                    {
                        percents.push(percent.min(100));
                    }
                    if read_trimmed(&dir.join("status")).as_deref() == Some("Discharging") {
                        discharging = true;
                    }
                }
                Some("Mains") => {
                    if read_trimmed(&dir.join("online")).as_deref() == Some("1") {
                        mains_online = true;
                    }
                }
                _ => {}
            }
        }

        if percents.is_empty() {
            return None;
        }
        let percent = (percents.iter().map(|&p| u32::from(p)).sum::<u32>()
            / percents.len() as u32) as u8;

        Some(BatteryStatus {
            on_battery: discharging && !mains_online,
            percent,
        })
    }

    fn free_space(&self, dir: &Path) -> Option<u64> {
        use sysinfo::Disks;

        // The directory may not exist yet; measure its closest existing ancestor.
        let target = dir
            .ancestors()
            .find_map(|p| p.canonicalize().ok())
            .unwrap_or_else(|| dir.to_path_buf());

        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Thresholds and switches for the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSettings {
    pub pause_on_low_battery: bool,
    pub battery_threshold_percent: u8,
    pub pause_on_low_disk: bool,
    pub min_free_disk_bytes: u64,
    pub poll_interval: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pause_on_low_battery: config.health.pause_on_low_battery,
            battery_threshold_percent: config.health.battery_threshold_percent,
            pause_on_low_disk: config.health.pause_on_low_disk,
            min_free_disk_bytes: config.health.min_free_disk_bytes,
            poll_interval: Duration::from_secs(config.health.poll_interval_secs.max(1)),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Periodic battery and disk-space poller.
pub struct SystemHealthMonitor {
    orchestrator: QueueOrchestrator,
    probe: Arc<dyn SystemProbe>,
    settings: HealthSettings,
    paused_for_power: AtomicBool,
    paused_for_storage: AtomicBool,
}

impl SystemHealthMonitor {
    pub fn new(
        orchestrator: QueueOrchestrator,
        probe: Arc<dyn SystemProbe>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            orchestrator,
            probe,
            settings,
            paused_for_power: AtomicBool::new(false),
            paused_for_storage: AtomicBool::new(false),
        }
    }

    /// Whether the queue is currently paused because of low battery.
    pub fn paused_for_power(&self) -> bool {
        self.paused_for_power.load(Ordering::SeqCst)
    }

    /// Whether the queue is currently paused because of low disk space.
    pub fn paused_for_storage(&self) -> bool {
        self.paused_for_storage.load(Ordering::SeqCst)
    }

    /// Runs a single health tick.
    pub async fn check_once(&self) {
        if self.settings.pause_on_low_battery {
            self.check_power().await;
        }
        if self.settings.pause_on_low_disk {
            self.check_storage();
        }
    }

    async fn check_power(&self) {
        let Some(battery) = self.probe.battery() else {
            return;
        };

        let low = battery.on_battery && battery.percent <= self.settings.battery_threshold_percent;
        if low && !self.paused_for_power() && self.orchestrator.is_processing() {
            warn!(percent = battery.percent, "Battery low; pausing queue");
            self.orchestrator.pause_with(PauseReason::LowBattery);
            self.orchestrator.host().allow_sleep();
            self.paused_for_power.store(true, Ordering::SeqCst);
            return;
        }

        if !battery.on_battery && self.paused_for_power.swap(false, Ordering::SeqCst) {
            if self.orchestrator.pause_reason() == Some(PauseReason::LowBattery) {
                info!("AC power restored; resuming queue");
                if let Err(e) = self.orchestrator.start().await {
                    warn!(error = %e, "Failed to resume queue after power restore");
                }
            } else {
                debug!("AC power restored but the queue was paused for another reason");
            }
        }
    }

    fn check_storage(&self) {
        let dirs: BTreeSet<PathBuf> = self
            .orchestrator
            .queue()
            .jobs()
            .iter()
            .filter(|job| job.status == JobStatus::InProgress)
            .map(|job| job.destination_dir().to_path_buf())
            .collect();

        let low_dir = dirs.iter().find(|dir| {
            self.probe
                .free_space(dir)
                .map(|free| free < self.settings.min_free_disk_bytes)
                .unwrap_or(false)
        });

        match low_dir {
            Some(dir) => {
                if !self.paused_for_storage() && self.orchestrator.is_processing() {
                    warn!(dir = ?dir, "Free disk space low; pausing queue");
                    self.orchestrator.pause_with(PauseReason::LowDisk);
                    self.paused_for_storage.store(true, Ordering::SeqCst);
                }
            }
            None => {
                if self.paused_for_storage.swap(false, Ordering::SeqCst) {
                    info!("Free disk space recovered; queue stays paused until started");
                }
            }
        }
    }

    /// Runs ticks every poll interval until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.check_once().await,
                }
            }
            debug!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{EncodeExecutor, EncodeOutcome};
    use crate::host::HostControl;
    use crate::job::Job;
    use crate::orchestrator::{OrchestratorSettings, QueueState};
    use crate::queue::JobQueue;
    use crate::testing::{MockExecutor, MockProbe, RecordingHost};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        executor: Arc<MockExecutor>,
        host: Arc<RecordingHost>,
        probe: Arc<MockProbe>,
        orchestrator: QueueOrchestrator,
        monitor: SystemHealthMonitor,
    }

    async fn running_harness() -> Harness {
        let queue = Arc::new(JobQueue::new());
        queue.submit(Job::new("/in/a.mkv", "/media/out/a.mp4", json!(null))).unwrap();
        queue.submit(Job::new("/in/b.mkv", "/media/out/b.mp4", json!(null))).unwrap();

        let executor = Arc::new(MockExecutor::new());
        let host = Arc::new(RecordingHost::new());
        let probe = Arc::new(MockProbe::new());
        let orchestrator = QueueOrchestrator::new(
            queue,
            executor.clone(),
            host.clone(),
            probe.clone(),
            OrchestratorSettings::default(),
        );
        orchestrator.start().await.unwrap();

        let monitor = SystemHealthMonitor::new(
            orchestrator.clone(),
            probe.clone(),
            HealthSettings::default(),
        );
        Harness {
            executor,
            host,
            probe,
            orchestrator,
            monitor,
        }
    }

    #[tokio::test]
    async fn test_low_battery_pauses_and_ac_resumes() {
        let h = running_harness().await;
        h.host.inhibit_sleep();
        h.probe.set_battery(Some(BatteryStatus {
            on_battery: true,
            percent: 10,
        }));

        h.monitor.check_once().await;
        assert_eq!(h.orchestrator.pause_reason(), Some(PauseReason::LowBattery));
        assert!(h.monitor.paused_for_power());
        assert!(!h.host.is_inhibited());

        // Still low: no duplicate pause bookkeeping.
        h.monitor.check_once().await;
        assert!(h.monitor.paused_for_power());

        h.probe.set_battery(Some(BatteryStatus {
            on_battery: false,
            percent: 11,
        }));
        h.monitor.check_once().await;
        assert_eq!(h.orchestrator.state(), QueueState::Processing);
        assert!(!h.monitor.paused_for_power());
    }

    #[tokio::test]
    async fn test_battery_above_threshold_keeps_running() {
        let h = running_harness().await;
        h.probe.set_battery(Some(BatteryStatus {
            on_battery: true,
            percent: 16,
        }));
        h.monitor.check_once().await;
        assert_eq!(h.orchestrator.state(), QueueState::Processing);
    }

    #[tokio::test]
    async fn test_ac_restore_does_not_override_manual_pause() {
        let h = running_harness().await;
        h.probe.set_battery(Some(BatteryStatus {
            on_battery: true,
            percent: 5,
        }));
        h.monitor.check_once().await;

        // Operator takes over while on battery.
        h.orchestrator.start().await.unwrap();
        h.orchestrator.pause();

        h.probe.set_battery(Some(BatteryStatus {
            on_battery: false,
            percent: 6,
        }));
        h.monitor.check_once().await;
        assert_eq!(h.orchestrator.pause_reason(), Some(PauseReason::Manual));
        assert!(!h.monitor.paused_for_power());
    }

    #[tokio::test]
    async fn test_low_disk_pauses_without_auto_resume() {
        let h = running_harness().await;
        h.probe.set_free_space("/media/out", 100);

        h.monitor.check_once().await;
        assert_eq!(h.orchestrator.pause_reason(), Some(PauseReason::LowDisk));
        assert!(h.monitor.paused_for_storage());

        h.probe.set_free_space("/media/out", u64::MAX);
        h.monitor.check_once().await;
        assert!(!h.monitor.paused_for_storage());
        assert_eq!(h.orchestrator.pause_reason(), Some(PauseReason::LowDisk));
        assert!(h.executor.is_encoding());

        h.executor.complete(EncodeOutcome::Success);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_cancel() {
        let h = running_harness().await;
        let monitor = Arc::new(h.monitor);
        let cancel = CancellationToken::new();
        let handle = monitor.clone().spawn(cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
    }

    #[test]
    fn test_host_probe_reads_sysfs_battery() {
        let temp = TempDir::new().unwrap();
        let bat = temp.path().join("BAT0");
        let ac = temp.path().join("AC");
        fs::create_dir_all(&bat).unwrap();
        fs::create_dir_all(&ac).unwrap();
        fs::write(bat.join("type"), "Battery\n").unwrap();
        fs::write(bat.join("capacity"), "42\n").unwrap();
        fs::write(bat.join("status"), "Discharging\n").unwrap();
        fs::write(ac.join("type"), "Mains\n").unwrap();
        fs::write(ac.join("online"), "0\n").unwrap();

        let probe = HostProbe::with_power_supply_dir(temp.path());
        assert_eq!(
            probe.battery(),
            Some(BatteryStatus {
                on_battery: true,
                percent: 42
            })
        );

        fs::write(ac.join("online"), "1\n").unwrap();
        assert!(!probe.battery().unwrap().on_battery);
    }

    #[test]
    fn test_host_probe_without_battery() {
        let temp = TempDir::new().unwrap();
        let probe = HostProbe::with_power_supply_dir(temp.path());
        assert_eq!(probe.battery(), None);
        assert_eq!(
            HostProbe::with_power_supply_dir(temp.path().join("missing")).battery(),
            None
        );
    }
}
