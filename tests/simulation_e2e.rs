use ptpdisc::error::Result;
use ptpdisc::filter::FilterConfig;
use ptpdisc::pipeline::Pipeline;
use ptpdisc::servo::{PiServo, PiServoConfig};
use ptpdisc::traits::{DeviceController, Timestamper};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

// ============================================================================
// PHYSICS-SIMULATED PHC PAIR
// ============================================================================
// Models a target PHC drifting against a source PHC at `natural_drift_ppb`,
// with Gaussian measurement jitter. `current_adj_ppb` is whatever the servo
// last commanded; `step_offset_ns` absorbs any ADJ_SETOFFSET jumps. This
// lets the full Pipeline<Timestamper, ServoController, DeviceController>
// stack run end to end without a real /dev/ptpN device.
// ============================================================================

struct PhysicsEngine {
    time_ns: f64,
    offset_ns: f64,
    natural_drift_ppb: f64,
    current_adj_ppb: f64,
    step_offset_ns: f64,
}

impl PhysicsEngine {
    fn new(drift_ppb: f64) -> Self {
        PhysicsEngine {
            time_ns: 0.0,
            offset_ns: 0.0,
            natural_drift_ppb: drift_ppb,
            current_adj_ppb: 0.0,
            step_offset_ns: 0.0,
        }
    }

    fn advance(&mut self, dt_s: f64) {
        self.time_ns += dt_s * 1e9;
        let rate_ppb = self.natural_drift_ppb + self.current_adj_ppb;
        self.offset_ns += rate_ppb * dt_s;
    }

    fn total_offset(&self) -> f64 {
        self.offset_ns + self.step_offset_ns
    }
}

struct SimTimestamper {
    physics: Rc<RefCell<PhysicsEngine>>,
    interval_s: f64,
    jitter_sigma_ns: f64,
}

fn gaussian_noise(sigma: f64) -> f64 {
    let u1: f64 = rand::random::<f64>().max(1e-12);
    let u2: f64 = rand::random();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    z0 * sigma
}

impl Timestamper for SimTimestamper {
    fn next_offset(&mut self) -> Result<Option<(i64, u64)>> {
        let mut phys = self.physics.borrow_mut();
        phys.advance(self.interval_s);
        let noisy_offset = phys.total_offset() + gaussian_noise(self.jitter_sigma_ns);
        let local_ts = phys.time_ns as u64;
        Ok(Some((noisy_offset as i64, local_ts)))
    }
}

struct SimDevice {
    physics: Rc<RefCell<PhysicsEngine>>,
}

impl DeviceController for SimDevice {
    fn adjust_frequency(&mut self, ppb: f64) -> Result<()> {
        self.physics.borrow_mut().current_adj_ppb = ppb;
        Ok(())
    }

    fn step(&mut self, offset_ns: i64) -> Result<()> {
        self.physics.borrow_mut().step_offset_ns -= offset_ns as f64;
        Ok(())
    }
}

fn run_simulation(
    drift_ppb: f64,
    jitter_sigma_ns: f64,
    step_threshold: i64,
    ticks: usize,
) -> (f64, Vec<f64>) {
    let physics = Rc::new(RefCell::new(PhysicsEngine::new(drift_ppb)));
    let source = SimTimestamper {
        physics: physics.clone(),
        interval_s: 1.0,
        jitter_sigma_ns,
    };
    let device = SimDevice { physics: physics.clone() };

    let servo_cfg = PiServoConfig {
        max_freq: 500_000.0,
        first_step_threshold: 0,
        step_threshold,
        first_update: false,
        freq_est_margin: 0.0,
    };
    let mut servo = PiServo::new(0.0, servo_cfg, FilterConfig::default());
    servo.sync_interval(1.0);

    let mut pipeline = Pipeline::new(source, servo, device);
    let mut steady_offsets = Vec::new();
    let steady_start = ticks / 2;

    for i in 0..ticks {
        pipeline.tick().unwrap();
        if i >= steady_start {
            steady_offsets.push(physics.borrow().total_offset());
        }
    }

    let final_offset = physics.borrow().total_offset();
    (final_offset, steady_offsets)
}

#[test]
fn servo_converges_under_low_jitter_drift() {
    let (final_offset, steady) = run_simulation(5_000.0, 50.0, 0, 400);
    let max_abs = steady.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    println!("low jitter: final_offset={final_offset:.1}ns max_steady={max_abs:.1}ns");
    assert!(max_abs < 50_000.0, "offset failed to settle: max_steady={max_abs}");
}

#[test]
fn servo_tolerates_moderate_jitter() {
    let (_, steady) = run_simulation(20_000.0, 2_000.0, 0, 600);
    let mean: f64 = steady.iter().sum::<f64>() / steady.len() as f64;
    println!("moderate jitter: mean_steady_offset={mean:.1}ns");
    assert!(mean.abs() < 100_000.0, "servo biased away from zero: mean={mean}");
}

#[test]
fn large_initial_offset_triggers_a_step_then_locks() {
    let physics = Rc::new(RefCell::new(PhysicsEngine::new(0.0)));
    physics.borrow_mut().offset_ns = 5_000_000.0; // 5ms initial offset
    let source = SimTimestamper { physics: physics.clone(), interval_s: 1.0, jitter_sigma_ns: 10.0 };
    let device = SimDevice { physics: physics.clone() };

    let servo_cfg = PiServoConfig {
        max_freq: 500_000.0,
        first_step_threshold: 0,
        step_threshold: 1_000_000,
        first_update: false,
        freq_est_margin: 0.0,
    };
    let mut servo = PiServo::new(0.0, servo_cfg, FilterConfig::default());
    servo.sync_interval(1.0);
    let mut pipeline = Pipeline::new(source, servo, device);

    for _ in 0..5 {
        pipeline.tick().unwrap();
    }
    // A step_threshold breach must have produced at least one jump.
    assert!(physics.borrow().step_offset_ns.abs() > 0.0, "expected a step correction to fire");

    for _ in 0..300 {
        pipeline.tick().unwrap();
    }
    assert!(
        physics.borrow().total_offset().abs() < 50_000.0,
        "did not settle after stepping: {}",
        physics.borrow().total_offset()
    );
}
