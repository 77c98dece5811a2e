use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

pub const NUM_PASSES: usize = 3;

/// Shared progress state of the conversion, updated by the pipeline
/// workers and read by the monitor thread.
#[derive(Default)]
pub struct Status {
    pub points_total: AtomicU64,
    pub points_processed: AtomicU64,
    pub bytes_processed: AtomicU64,
    /// 1-based pass index, see [NUM_PASSES].
    pub current_pass: AtomicUsize,
}

impl Status {
    pub fn new(points_total: u64) -> Self {
        let status = Status::default();
        status.points_total.store(points_total, Ordering::Relaxed);
        status
    }

    pub fn begin_pass(&self, pass: usize, label: &str) {
        self.current_pass.store(pass, Ordering::Relaxed);
        self.points_processed.store(0, Ordering::Relaxed);
        info!("pass {pass}/{NUM_PASSES}: {label}");
    }

    pub fn add_points(&self, count: u64) {
        self.points_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, count: u64) {
        self.bytes_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn progress(&self) -> f64 {
        let total = self.points_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.points_processed.load(Ordering::Relaxed) as f64 / total as f64
    }
}

struct SystemProbe {
    system: System,
}

impl SystemProbe {
    fn refresh_kind() -> RefreshKind {
        RefreshKind::nothing()
            .with_memory(MemoryRefreshKind::nothing().with_ram().with_swap())
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
    }

    fn new() -> Self {
        SystemProbe {
            system: System::new_with_specifics(Self::refresh_kind()),
        }
    }

    /// (cpu usage %, used memory bytes, total memory bytes, process memory bytes)
    fn sample(&mut self) -> (f32, u64, u64, u64) {
        self.system.refresh_specifics(Self::refresh_kind());
        let process_memory = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                self.system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_memory(),
                );
                self.system.process(pid).map(|p| p.memory())
            })
            .unwrap_or(0);
        (
            self.system.global_cpu_usage(),
            self.system.used_memory(),
            self.system.total_memory(),
            process_memory,
        )
    }
}

/// Blocks the calling worker while the process uses more memory than the
/// given limit. Level-triggered with 10 ms polls, like the writer
/// backpressure.
pub fn wait_for_memory_below(max_mb: u64) {
    let mut probe = SystemProbe::new();
    loop {
        let (_, _, _, process) = probe.sample();
        if process / (1024 * 1024) <= max_mb {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// One-line memory summary for resource-error diagnostics.
pub fn memory_report() -> String {
    let mut probe = SystemProbe::new();
    let (_, used, total, process) = probe.sample();
    format!(
        "memory: {} MB used of {} MB total, {} MB used by this process",
        used / (1024 * 1024),
        total / (1024 * 1024),
        process / (1024 * 1024)
    )
}

/// Periodically reports progress, throughput and resource usage.
/// The reporting thread samples once per second and stops when the
/// monitor is dropped.
pub struct Monitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn start(status: Arc<Status>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut probe = SystemProbe::new();
            let started = Instant::now();
            let mut last_bytes = 0u64;
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(1));
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let (cpu, used, total, process) = probe.sample();
                let bytes = status.bytes_processed.load(Ordering::Relaxed);
                let throughput = (bytes - last_bytes) / (1024 * 1024);
                last_bytes = bytes;

                info!(
                    "[{:>6.1}s] pass {}: {:>5.1}%, {} MB/s, cpu {:.0}%, mem {}/{} MB (process {} MB)",
                    started.elapsed().as_secs_f64(),
                    status.current_pass.load(Ordering::Relaxed),
                    status.progress() * 100.0,
                    throughput,
                    cpu,
                    used / (1024 * 1024),
                    total / (1024 * 1024),
                    process / (1024 * 1024),
                );
            }
        });

        Monitor {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
