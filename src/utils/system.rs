// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Detects physical cores and the current global CPU load.
///
/// # Returns
///
/// (physical cores, cpu usage in percent)
pub async fn detect_cores_and_load() -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    sleep(Duration::from_millis(100)).await;
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    (physical_cores, system.global_cpu_usage())
}


/// Message for a thread request the machine cannot serve in parallel.
/// The tools still get the requested count.
pub fn oversubscription_warning(requested: usize, physical_cores: usize) -> Option<String> {
    if requested > physical_cores {
        Some(format!(
            "--threads {} exceeds the {} physical cores; external tools will oversubscribe the CPU",
            requested, physical_cores
        ))
    } else {
        None
    }
}
