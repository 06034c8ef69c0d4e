//! Tests for the flow-matching UniPC scheduler
//!
//! Covers:
//! - Timestep generation and both shift knobs
//! - Cursor discipline (exactly one step per timestep, in order)
//! - Solver accuracy under an exact velocity field
//! - Determinism and state reset

use candle_core::{DType, Device, Result, Tensor};
use candle_wan::config::{SchedulerConfig, SolverType};
use candle_wan::scheduler::{FlowUniPcScheduler, SchedulerError};

fn scheduler(shift: f64) -> FlowUniPcScheduler {
    FlowUniPcScheduler::new(SchedulerConfig {
        shift,
        ..Default::default()
    })
    .expect("valid scheduler config")
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

// ============================================================================
// Timestep Generation Tests
// ============================================================================

#[test]
fn test_timesteps_count_and_strictly_decreasing() {
    for steps in [1usize, 2, 10, 20, 50] {
        for shift in [1.0, 3.0, 5.0, 14.5] {
            let mut s = scheduler(1.0);
            let ts = s.set_timesteps(steps, &Device::Cpu, Some(shift)).unwrap().to_vec();
            assert_eq!(ts.len(), steps, "steps={steps} shift={shift}");
            for w in ts.windows(2) {
                assert!(w[0] > w[1], "not decreasing: {ts:?} (shift {shift})");
            }
            assert!(ts[0] <= 999 && *ts.last().unwrap() >= 0);
        }
    }
}

#[test]
fn test_sigmas_end_with_zero() {
    let mut s = scheduler(1.0);
    s.set_timesteps(20, &Device::Cpu, Some(1.0)).unwrap();
    assert_eq!(s.sigmas().len(), 21);
    assert_eq!(*s.sigmas().last().unwrap(), 0.0);
    assert!((s.sigmas()[0] - 0.999).abs() < 1e-9);
}

#[test]
fn test_discrete_shift_moves_schedule_toward_noise() {
    let mut plain = scheduler(1.0);
    let mut shifted = scheduler(1.0);
    let a = plain.set_timesteps(10, &Device::Cpu, Some(1.0)).unwrap().to_vec();
    let b = shifted.set_timesteps(10, &Device::Cpu, Some(5.0)).unwrap().to_vec();
    for i in 1..10 {
        assert!(b[i] > a[i], "step {i}: {} <= {}", b[i], a[i]);
    }
}

#[test]
fn test_construction_shift_is_separate_from_discrete_shift() {
    let mut a = scheduler(1.0);
    let mut b = scheduler(3.0);
    let ta = a.set_timesteps(10, &Device::Cpu, Some(3.0)).unwrap().to_vec();
    let tb = b.set_timesteps(10, &Device::Cpu, Some(3.0)).unwrap().to_vec();
    assert_ne!(ta, tb);

    // `None` falls back to the construction shift
    let mut c = scheduler(3.0);
    let tc = c.set_timesteps(10, &Device::Cpu, None).unwrap().to_vec();
    let mut d = scheduler(3.0);
    let td = d.set_timesteps(10, &Device::Cpu, Some(3.0)).unwrap().to_vec();
    assert_eq!(tc, td);
}

#[test]
fn test_timesteps_tensor_on_device() -> Result<()> {
    let mut s = scheduler(1.0);
    let ts = s.set_timesteps(4, &Device::Cpu, Some(3.0)).unwrap().to_vec();
    let t = s.timesteps_tensor().expect("tensor after set_timesteps");
    let expected: Vec<f32> = ts.iter().map(|&t| t as f32).collect();
    assert_eq!(t.to_vec1::<f32>()?, expected);
    Ok(())
}

// ============================================================================
// Cursor Tests
// ============================================================================

#[test]
fn test_step_before_set_timesteps_fails() -> Result<()> {
    let mut s = scheduler(1.0);
    let x = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
    assert!(matches!(s.step(&x, 999, &x), Err(SchedulerError::NotConfigured)));
    Ok(())
}

#[test]
fn test_step_exactly_num_steps_times() -> Result<()> {
    let dev = Device::Cpu;
    let mut s = scheduler(1.0);
    let ts = s.set_timesteps(6, &dev, Some(5.0)).unwrap().to_vec();
    let mut x = Tensor::ones(8, DType::F32, &dev)?;
    let v = Tensor::full(0.3f32, 8, &dev)?;
    for &t in &ts {
        assert!(!s.is_finished());
        assert_eq!(s.next_timestep(), Some(t));
        x = s.step(&v, t, &x).unwrap();
    }
    assert!(s.is_finished());
    assert!(matches!(s.step(&v, ts[5], &x), Err(SchedulerError::Exhausted(6))));
    Ok(())
}

#[test]
fn test_out_of_order_timestep_is_rejected() -> Result<()> {
    let dev = Device::Cpu;
    let mut s = scheduler(1.0);
    let ts = s.set_timesteps(5, &dev, Some(3.0)).unwrap().to_vec();
    let x = Tensor::ones(4, DType::F32, &dev)?;
    let err = s.step(&x, ts[1], &x).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::OutOfOrder { index: 0, expected, got } if expected == ts[0] && got == ts[1]
    ));
    // A rejected call does not advance the cursor
    assert_eq!(s.step_index(), Some(0));
    Ok(())
}

#[test]
fn test_zero_steps_rejected() {
    let mut s = scheduler(1.0);
    assert!(matches!(
        s.set_timesteps(0, &Device::Cpu, None),
        Err(SchedulerError::ZeroSteps)
    ));
}

#[test]
fn test_invalid_config_rejected() {
    assert!(matches!(
        FlowUniPcScheduler::new(SchedulerConfig {
            shift: 0.0,
            ..Default::default()
        }),
        Err(SchedulerError::InvalidShift(_))
    ));
    assert!(matches!(
        FlowUniPcScheduler::new(SchedulerConfig {
            solver_order: 0,
            ..Default::default()
        }),
        Err(SchedulerError::InvalidOrder(0))
    ));
}

// ============================================================================
// Solver Tests
// ============================================================================

/// Straight-line flow from `noise` to `x0`: the velocity is `noise - x0` everywhere.
fn run_exact_flow(config: SchedulerConfig, steps: usize, shift: f64) -> Result<(Tensor, Tensor)> {
    let dev = Device::Cpu;
    let x0 = Tensor::new(&[0.5f32, -1.25, 2.0, 0.0], &dev)?;
    let noise = Tensor::new(&[1.0f32, 0.3, -0.7, -1.5], &dev)?;
    let v = noise.sub(&x0)?;

    let mut s = FlowUniPcScheduler::new(config).unwrap();
    let ts = s.set_timesteps(steps, &dev, Some(shift)).unwrap().to_vec();
    let sigma0 = s.sigmas()[0];
    let mut x = x0.affine(1.0 - sigma0, 0.0)?.add(&noise.affine(sigma0, 0.0)?)?;
    for &t in &ts {
        x = s.step(&v, t, &x).unwrap();
    }
    Ok((x, x0))
}

#[test]
fn test_recovers_clean_sample_under_exact_velocity() -> Result<()> {
    for steps in [1, 2, 5, 20] {
        let (x, x0) = run_exact_flow(SchedulerConfig::default(), steps, 5.0)?;
        let diff = max_abs_diff(&x, &x0)?;
        assert!(diff < 1e-4, "steps={steps}: max diff {diff}");
    }
    Ok(())
}

#[test]
fn test_bh1_and_corrector_off_also_converge() -> Result<()> {
    let bh1 = SchedulerConfig {
        solver_type: SolverType::Bh1,
        ..Default::default()
    };
    let (x, x0) = run_exact_flow(bh1, 10, 3.0)?;
    assert!(max_abs_diff(&x, &x0)? < 1e-4);

    let no_corrector = SchedulerConfig {
        disable_corrector: (0..10).collect(),
        ..Default::default()
    };
    let (x, x0) = run_exact_flow(no_corrector, 10, 3.0)?;
    assert!(max_abs_diff(&x, &x0)? < 1e-4);
    Ok(())
}

#[test]
fn test_deterministic_and_reset_by_set_timesteps() -> Result<()> {
    let dev = Device::Cpu;
    let sample = Tensor::new(&[0.1f32, -0.2, 0.9], &dev)?;
    let run = |s: &mut FlowUniPcScheduler| -> Result<Vec<f32>> {
        let ts = s.set_timesteps(8, &dev, Some(5.0)).unwrap().to_vec();
        let mut x = sample.clone();
        for &t in &ts {
            // Velocity depends on the state so history matters
            let v = x.affine(0.7, 0.1)?;
            x = s.step(&v, t, &x).unwrap();
        }
        x.to_vec1::<f32>()
    };

    let mut a = scheduler(1.0);
    let mut b = scheduler(1.0);
    let first = run(&mut a)?;
    assert_eq!(first, run(&mut b)?);
    // Reusing the same scheduler after set_timesteps gives the same trajectory
    assert_eq!(first, run(&mut a)?);
    Ok(())
}

#[test]
fn test_output_keeps_sample_dtype() -> Result<()> {
    let dev = Device::Cpu;
    let mut s = scheduler(1.0);
    let ts = s.set_timesteps(2, &dev, Some(3.0)).unwrap().to_vec();
    let x = Tensor::ones((1, 2, 2), DType::BF16, &dev)?;
    let v = Tensor::zeros((1, 2, 2), DType::F32, &dev)?;
    let out = s.step(&v, ts[0], &x).unwrap();
    assert_eq!(out.dtype(), DType::BF16);
    assert_eq!(out.dims(), &[1, 2, 2]);
    Ok(())
}
