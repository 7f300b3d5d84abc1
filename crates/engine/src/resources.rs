//! Resource-aware stage parallelism.
//!
//! [`width`] is pure and deterministic given its inputs; logging is its
//! only side effect. It never hard-fails: an operator that does not fit
//! the available capacity runs at width 1 with a warning.

use serde::Serialize;
use tracing::warn;

use curator_core::config::EngineConfig;

use crate::operator::OperatorSpec;

/// Capacity available to one worker process.
#[derive(Debug, Clone, Serialize)]
pub struct Capacity {
    pub cpu_cores: usize,
    /// Available memory in GiB (0 = unknown, memory is not intersected).
    pub mem_gib: f64,
    pub accelerator_count: usize,
    /// Free accelerator memory per device in GiB.
    pub accelerator_mem_gib: f64,
}

impl Capacity {
    /// Detect capacity from the host, with accelerator and memory figures
    /// taken from config (the core has no device driver dependency).
    pub fn detect(config: &EngineConfig) -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            cpu_cores,
            mem_gib: config.host_mem_gib,
            accelerator_count: config.accelerator_count as usize,
            accelerator_mem_gib: config.accelerator_mem_gib,
        }
    }
}

/// Decide how many parallel workers a stage gets.
///
/// CPU path: `min(configured_or_all_cores, floor(cpu / cpu_required))`,
/// intersected with `floor(mem / mem_required)` when a memory hint exists.
/// Accelerator path: workers share each device's free memory, summed
/// across devices. The result is clamped to at least 1.
pub fn width(spec: &OperatorSpec, available: &Capacity) -> usize {
    let ceiling = spec
        .configured_parallelism
        .unwrap_or(available.cpu_cores)
        .max(1);

    let computed = if spec.resources.uses_accelerator {
        accelerator_width(spec, available, ceiling)
    } else {
        cpu_width(spec, available, ceiling)
    };

    if computed < 1 {
        warn!(
            operator = %spec.name,
            stage = spec.stage_index,
            "insufficient resources for one worker; clamping width to 1"
        );
        1
    } else {
        computed
    }
}

fn cpu_width(spec: &OperatorSpec, available: &Capacity, ceiling: usize) -> usize {
    let mut w = ceiling;

    if spec.resources.cpu_required > 0.0 {
        let by_cpu = (available.cpu_cores as f64 / spec.resources.cpu_required).floor() as usize;
        w = w.min(by_cpu);
    }

    if spec.resources.mem_required_gib > 0.0 && available.mem_gib > 0.0 {
        let by_mem = (available.mem_gib / spec.resources.mem_required_gib).floor() as usize;
        w = w.min(by_mem);
    }

    w
}

fn accelerator_width(spec: &OperatorSpec, available: &Capacity, ceiling: usize) -> usize {
    if spec.resources.mem_required_gib <= 0.0 {
        warn!(
            operator = %spec.name,
            stage = spec.stage_index,
            "accelerator operator carries no resource hint; one worker per device"
        );
        return ceiling.min(available.accelerator_count);
    }

    let per_device_share =
        (available.accelerator_mem_gib / spec.resources.mem_required_gib).floor() as usize;
    ceiling.min(per_device_share * available.accelerator_count)
}
