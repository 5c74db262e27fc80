use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use nix::fcntl::{flock, FlockArg};
use std::fs::File;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ptpdisc::clockadj::{self, ClockId};
use ptpdisc::dynconfig::{DynamicConfig, Publisher};
use ptpdisc::ethtool;
use ptpdisc::filter::FilterConfig;
use ptpdisc::monitor::{self, Counters};
use ptpdisc::phc::PhcHandle;
use ptpdisc::pipeline::Pipeline;
use ptpdisc::quality::{self, Aggregator, Baselines, ClockAccuracy, ClockClass, DataPoint};
use ptpdisc::servo::{PiServo, PiServoConfig};
use ptpdisc::sysoff;
use ptpdisc::traits::{DeviceController, Timestamper};

#[derive(Parser, Debug)]
#[command(author, version, about = "PI-servo clock discipline for PTP hardware clock fleets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Interface whose PHC is disciplined (resolved via ethtool_ts_info).
    #[arg(short, long)]
    interface: Option<String>,

    /// Interface whose PHC is the time source for phc-to-phc discipline.
    #[arg(long)]
    source_interface: Option<String>,

    /// Path to the dynamic config file published for the PTP server to consume.
    #[arg(long, default_value = "/etc/ptpdisc/dynamic-config.yaml")]
    config: PathBuf,

    /// PID file of the PTP server process to SIGHUP after a config change.
    #[arg(long, default_value = "/var/run/ptp4u.pid")]
    ptp4u_pid: PathBuf,

    /// Actually write the published config and signal the consumer.
    /// Without this flag the aggregator computes quality but never touches
    /// the on-disk file, useful for dry-running a new expression.
    #[arg(long, default_value_t = false)]
    apply: bool,

    /// Clock-quality ring buffer size (number of ticks retained).
    #[arg(long, default_value_t = 600)]
    quality_window: usize,

    /// Expression reduced to a nanosecond offset for the published clockAccuracy.
    #[arg(long, default_value = "max(abs(phcoffset))")]
    accuracy_expr: String,

    /// Expression reduced to a clockClass code for the published config.
    #[arg(long, default_value = "mean(oscillatorclass)")]
    class_expr: String,

    /// Floor, in nanoseconds, below which a Locked reading isn't trusted.
    #[arg(long, default_value_t = 100.0)]
    lock_baseline_ns: f64,

    /// Floor, in nanoseconds, below which a Holdover reading isn't trusted.
    #[arg(long, default_value_t = 100_000.0)]
    holdover_baseline_ns: f64,

    /// Floor, in nanoseconds, below which a Calibrating reading isn't trusted.
    #[arg(long, default_value_t = 1_000_000.0)]
    calibrating_baseline_ns: f64,

    /// Run a single correction cycle and exit, instead of looping forever.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Address for the /status monitoring endpoint.
    #[arg(long, default_value = "127.0.0.1:8879")]
    monitor_addr: SocketAddr,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print resolved interface/PHC mapping and clock capabilities, then exit.
    Diagnose,
}

/// Disciplines one PHC's frequency/phase from another PHC's time, both
/// read via the best-of-N extended sysoff ioctl.
struct PhcToPhcTimestamper {
    source: PhcHandle,
    target: PhcHandle,
    n_samples: u32,
}

impl Timestamper for PhcToPhcTimestamper {
    fn next_offset(&mut self) -> ptpdisc::error::Result<Option<(i64, u64)>> {
        let source_ext = self.source.get_sys_offset_extended(self.n_samples)?;
        let target_ext = self.target.get_sys_offset_extended(self.n_samples)?;
        let Some(offset_ns) = sysoff::cross_device_offset(&target_ext, &source_ext) else {
            return Ok(None);
        };
        let Some((_, local_ts)) = sysoff::best_sample(&target_ext) else {
            return Ok(None);
        };
        Ok(Some((offset_ns, local_ts)))
    }
}

struct PhcDeviceController {
    clock_id: ClockId,
    clock_desc: String,
}

impl DeviceController for PhcDeviceController {
    fn adjust_frequency(&mut self, ppb: f64) -> ptpdisc::error::Result<()> {
        clockadj::adj_freq(self.clock_id, ppb, &self.clock_desc)
    }

    fn step(&mut self, offset_ns: i64) -> ptpdisc::error::Result<()> {
        let sign = if offset_ns < 0 { -1 } else { 1 };
        let magnitude = Duration::from_nanos(offset_ns.unsigned_abs());
        clockadj::step(self.clock_id, magnitude, sign, &self.clock_desc)
    }
}

/// One `ptpdisc` instance per host: a PHC handle is exclusively owned
/// (§4.2), so a second instance racing the first for the same device
/// would corrupt servo state rather than merely duplicate work. The
/// flock/EAGAIN mechanics are generic OS primitives, not specific to
/// clock discipline, so they're reused as-is; only the lock path and
/// the failure message are domain-specific.
fn acquire_singleton_lock() -> Result<File> {
    let lock_path = "/var/run/ptpdisc.lock";
    let file = File::create(lock_path).map_err(|e| anyhow!("creating lock file {lock_path}: {e}"))?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(file),
        Err(nix::errno::Errno::EAGAIN) => Err(anyhow!("another ptpdisc instance is already running ({lock_path})")),
        Err(e) => Err(e.into()),
    }
}

/// Correction jitter comes from scheduling latency as much as from
/// oscillator noise, so the discipline loop asks for SCHED_FIFO the same
/// way any latency-sensitive control loop on Linux would; there is
/// nothing PTP-specific about the call itself, only about why jitter
/// here translates directly into fleet-wide offset error.
fn enable_realtime_priority() {
    unsafe {
        let policy = libc::SCHED_FIFO;
        let param = libc::sched_param { sched_priority: 50 };
        if libc::sched_setscheduler(0, policy, &param) == 0 {
            info!("realtime priority (SCHED_FIFO, 50) enabled");
        } else {
            warn!(
                "failed to set realtime priority: {}; correction jitter may increase",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn run_diagnose(cli: &Cli) -> Result<()> {
    let Some(ifname) = &cli.interface else {
        return Err(anyhow!("--interface is required for diagnose"));
    };
    let phc_path = ethtool::phc_path_for_interface(ifname)?;
    println!("interface {ifname} -> {phc_path}");

    let phc = PhcHandle::open(&phc_path)?;
    let caps = phc.get_caps()?;
    println!(
        "max_adj={} n_alarm={} n_ext_ts={} n_per_out={} pps={} n_pins={}",
        caps.max_adj, caps.n_alarm, caps.n_ext_ts, caps.n_per_out, caps.pps, caps.n_pins
    );
    Ok(())
}

fn run_discipline_loop(cli: &Cli, running: Arc<AtomicBool>) -> Result<()> {
    let target_ifname = cli
        .interface
        .as_ref()
        .ok_or_else(|| anyhow!("--interface is required"))?;
    let source_ifname = cli
        .source_interface
        .as_ref()
        .ok_or_else(|| anyhow!("--source-interface is required for phc-to-phc discipline"))?;

    let target_path = ethtool::phc_path_for_interface(target_ifname)?;
    let source_path = ethtool::phc_path_for_interface(source_ifname)?;
    info!("disciplining {target_path} ({target_ifname}) from {source_path} ({source_ifname})");

    let target = PhcHandle::open(&target_path)?;
    let source = PhcHandle::open(&source_path)?;
    let clock_id = target.clock_id();

    let counters = Arc::new(Counters::default());
    let bound = monitor::spawn_status_server(cli.monitor_addr, counters.clone())
        .map_err(|e| anyhow!("starting monitor server: {e}"))?;
    info!("monitor listening on {bound}");

    let servo = PiServo::new(0.0, PiServoConfig::default(), FilterConfig::default());
    let timestamper = PhcToPhcTimestamper { source, target, n_samples: 5 };
    let device = PhcDeviceController { clock_id, clock_desc: target_path.clone() };
    let mut pipeline = Pipeline::new(timestamper, servo, device);

    let baselines = Baselines {
        lock: ClockAccuracy::bucket_for_ns(cli.lock_baseline_ns),
        holdover: ClockAccuracy::bucket_for_ns(cli.holdover_baseline_ns),
        calibrating: ClockAccuracy::bucket_for_ns(cli.calibrating_baseline_ns),
    };
    let mut quality = Aggregator::with_baselines(cli.quality_window, baselines);
    let sync_interval = Duration::from_secs(1);
    let mut last_spikes_seen = 0u64;

    let published_defaults = DynamicConfig::default();
    let mut publisher = Publisher::new(&cli.config, &cli.ptp4u_pid, cli.apply);

    loop {
        match pipeline.tick() {
            Ok(Some(state)) => {
                let offset_ns = pipeline.last_offset_ns();
                let freq_ppb = pipeline.last_freq_ppb();
                counters.record_correction(offset_ns, freq_ppb);

                let (osc_class, osc_offset_ns) = quality::probe_oscillatord().unwrap_or_else(|e| {
                    warn!("oscillatord probe failed: {e}; treating as uncalibrated");
                    (ClockClass::Uncalibrated, 0)
                });
                quality.record(DataPoint { phc_offset_ns: offset_ns, osc_offset_ns, osc_class });

                match quality.evaluate(&cli.accuracy_expr, &cli.class_expr) {
                    Ok(Some(output)) => {
                        let pending = DynamicConfig {
                            clockaccuracy: output.accuracy.code(),
                            clockclass: output.class.code(),
                            ..published_defaults.clone()
                        };
                        match publisher.publish(&pending) {
                            Ok(true) => info!(
                                "published clockclass={} clockaccuracy={} (reload #{})",
                                pending.clockclass,
                                pending.clockaccuracy,
                                publisher.reload_count()
                            ),
                            Ok(false) => {}
                            Err(e) => warn!("publishing dynamic config failed: {e}"),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(
                        "quality expressions {:?}/{:?} failed: {e}",
                        cli.accuracy_expr, cli.class_expr
                    ),
                }
                log::debug!("servo state: {state:?}");
            }
            Ok(None) => {}
            Err(e) => {
                error!("pipeline tick failed: {e}");
                counters.record_reset();
                pipeline.unlock();
            }
        }
        if pipeline.spikes_rejected() > last_spikes_seen {
            counters.record_spike();
            last_spikes_seen = pipeline.spikes_rejected();
        }

        if cli.once || !running.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(sync_interval);
    }

    Ok(())
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    info!("ptpdisc v{}", env!("CARGO_PKG_VERSION"));

    if let Some(Command::Diagnose) = &cli.command {
        return run_diagnose(&cli);
    }

    let _lock_file = acquire_singleton_lock().map_err(|e| {
        error!("{e}");
        e
    })?;
    enable_realtime_priority();

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        running_for_handler.store(false, Ordering::SeqCst);
    })?;

    run_discipline_loop(&cli, running)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_defaults_round_trip_through_yaml() {
        let cfg = DynamicConfig::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let restored: DynamicConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(restored, cfg);
    }
}
