//! Tests for scoped device placement
//!
//! The guard must return a component to host memory on every exit path:
//! normal scope end, early error return and panic unwinding.

use candle_core::{Device, Result};
use candle_wan::models::wan::placement::{DevicePlacement, PlacementError};
use candle_wan::models::wan::{Offload, Residency};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

/// Records every move it is asked to make.
struct Probe {
    name: &'static str,
    residency: Residency,
    refuse_compute: bool,
    moves: Vec<Residency>,
}

impl Probe {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            residency: Residency::Host,
            refuse_compute: false,
            moves: Vec::new(),
        }
    }

    fn refusing() -> Self {
        Self {
            refuse_compute: true,
            ..Self::new("oversized")
        }
    }
}

impl Offload for Probe {
    fn component_name(&self) -> &str {
        self.name
    }

    fn residency(&self) -> Residency {
        self.residency
    }

    fn place(&mut self, residency: Residency, _device: &Device) -> Result<()> {
        self.moves.push(residency);
        if self.refuse_compute && residency == Residency::Compute {
            candle_core::bail!("out of device memory");
        }
        self.residency = residency;
        Ok(())
    }
}

fn counting_placement() -> (DevicePlacement, Rc<Cell<usize>>) {
    let reclaims = Rc::new(Cell::new(0));
    let counter = reclaims.clone();
    let placement = DevicePlacement::new(Device::Cpu).with_reclaim_hook(move |_| {
        counter.set(counter.get() + 1);
        Ok(())
    });
    (placement, reclaims)
}

// ============================================================================
// Scope Tests
// ============================================================================

#[test]
fn test_guard_holds_component_on_compute() {
    let (placement, reclaims) = counting_placement();
    let mut vae = Probe::new("vae");
    {
        let guard = placement.acquire(&mut vae).unwrap();
        assert_eq!(guard.residency(), Residency::Compute);
        assert_eq!(placement.held().as_deref(), Some("vae"));
        assert_eq!(reclaims.get(), 0);
    }
    assert_eq!(vae.residency, Residency::Host);
    assert_eq!(vae.moves, vec![Residency::Compute, Residency::Host]);
    assert_eq!(placement.held(), None);
    assert_eq!(placement.release_count(), 1);
    assert_eq!(reclaims.get(), 1);
}

#[test]
fn test_release_on_early_error_return() {
    fn encode_then_fail(placement: &DevicePlacement, vae: &mut Probe) -> Result<()> {
        let _guard = placement.acquire(vae).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        candle_core::bail!("encode failed")
    }

    let (placement, _) = counting_placement();
    let mut vae = Probe::new("vae");
    assert!(encode_then_fail(&placement, &mut vae).is_err());
    assert_eq!(vae.residency, Residency::Host);
    assert_eq!(placement.held(), None);
}

#[test]
fn test_release_on_panic() {
    let (placement, reclaims) = counting_placement();
    let mut vae = Probe::new("vae");
    let result = catch_unwind(AssertUnwindSafe(|| {
        let _guard = placement.acquire(&mut vae).unwrap();
        panic!("decode blew up");
    }));
    assert!(result.is_err());
    assert_eq!(vae.residency, Residency::Host);
    assert_eq!(placement.held(), None);
    assert_eq!(reclaims.get(), 1);
}

#[test]
fn test_reacquire_after_release() {
    let (placement, _) = counting_placement();
    let mut vae = Probe::new("vae");
    for _ in 0..3 {
        let guard = placement.acquire(&mut vae).unwrap();
        drop(guard);
    }
    assert_eq!(placement.release_count(), 3);
    assert_eq!(vae.residency, Residency::Host);
}

// ============================================================================
// Error Tests
// ============================================================================

#[test]
fn test_second_component_rejected_while_one_is_held() {
    let (placement, _) = counting_placement();
    let mut vae = Probe::new("vae");
    let mut clip = Probe::new("clip");

    let _guard = placement.acquire(&mut vae).unwrap();
    let err = placement.acquire(&mut clip).err().expect("second acquire fails");
    match err {
        PlacementError::AlreadyHeld { requested, held } => {
            assert_eq!(requested, "clip");
            assert_eq!(held, "vae");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(clip.moves.is_empty());
}

#[test]
fn test_failed_acquire_evicts_partial_move() {
    let (placement, reclaims) = counting_placement();
    let mut model = Probe::refusing();
    let err = placement.acquire(&mut model).err().expect("acquire fails");
    assert!(matches!(err, PlacementError::Acquire { ref component, .. } if component == "oversized"));
    assert_eq!(model.moves, vec![Residency::Compute, Residency::Host]);
    assert_eq!(model.residency, Residency::Host);
    assert_eq!(placement.held(), None);
    assert_eq!(placement.release_count(), 0);
    assert_eq!(reclaims.get(), 1);
}

#[test]
fn test_default_reclaim_hook_synchronizes() {
    let placement = DevicePlacement::new(Device::Cpu);
    let mut vae = Probe::new("vae");
    drop(placement.acquire(&mut vae).unwrap());
    assert_eq!(placement.release_count(), 1);
    assert!(placement.host_device().is_cpu());
}

#[test]
fn test_failing_reclaim_hook_still_releases() {
    let placement =
        DevicePlacement::new(Device::Cpu).with_reclaim_hook(|_| candle_core::bail!("no cache"));
    let mut vae = Probe::new("vae");
    drop(placement.acquire(&mut vae).unwrap());
    assert_eq!(vae.residency, Residency::Host);
    assert_eq!(placement.held(), None);
}
