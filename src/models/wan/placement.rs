//! Scoped device placement for heavy sub-models.
//!
//! `DevicePlacement::acquire` moves a component onto the compute device and
//! returns a guard; dropping the guard moves it back to host memory and runs the
//! memory reclamation hook. Release therefore happens on every exit path,
//! including `?` early returns and panics unwinding through the pipeline.

use crate::models::wan::components::{Offload, Residency};
use candle_core::Device;
use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("cannot acquire {requested}: {held} is still held on the compute device")]
    AlreadyHeld { requested: String, held: String },
    #[error("failed to move {component} to the compute device")]
    Acquire {
        component: String,
        #[source]
        source: candle_core::Error,
    },
}

/// Best-effort cache reclamation run after every release.
pub type ReclaimHook = Box<dyn Fn(&Device) -> candle_core::Result<()>>;

pub struct DevicePlacement {
    compute: Device,
    host: Device,
    held: RefCell<Option<String>>,
    reclaim: ReclaimHook,
    releases: Cell<usize>,
}

impl std::fmt::Debug for DevicePlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePlacement")
            .field("compute", &self.compute)
            .field("held", &self.held.borrow())
            .field("releases", &self.releases.get())
            .finish()
    }
}

impl DevicePlacement {
    pub fn new(compute: Device) -> Self {
        Self {
            compute,
            host: Device::Cpu,
            held: RefCell::new(None),
            reclaim: Box::new(|device: &Device| device.synchronize()),
            releases: Cell::new(0),
        }
    }

    /// Replaces the default reclamation (device synchronize).
    pub fn with_reclaim_hook(
        mut self,
        hook: impl Fn(&Device) -> candle_core::Result<()> + 'static,
    ) -> Self {
        self.reclaim = Box::new(hook);
        self
    }

    pub fn compute_device(&self) -> &Device {
        &self.compute
    }

    pub fn host_device(&self) -> &Device {
        &self.host
    }

    /// Name of the component currently on the compute device, if any.
    pub fn held(&self) -> Option<String> {
        self.held.borrow().clone()
    }

    pub fn release_count(&self) -> usize {
        self.releases.get()
    }

    pub fn acquire<'a, M: Offload + ?Sized>(
        &'a self,
        model: &'a mut M,
    ) -> Result<PlacementGuard<'a, M>, PlacementError> {
        let name = model.component_name().to_string();
        if let Some(held) = self.held.borrow().as_ref() {
            return Err(PlacementError::AlreadyHeld {
                requested: name,
                held: held.clone(),
            });
        }

        if let Err(source) = model.place(Residency::Compute, &self.compute) {
            // A partial move may have left some weights on the device.
            self.evict(model);
            return Err(PlacementError::Acquire {
                component: name,
                source,
            });
        }

        debug!(component = %name, device = ?self.compute, "acquired");
        *self.held.borrow_mut() = Some(name);
        Ok(PlacementGuard {
            controller: self,
            model,
        })
    }

    fn release<M: Offload + ?Sized>(&self, model: &mut M) {
        self.evict(model);
        *self.held.borrow_mut() = None;
        self.releases.set(self.releases.get() + 1);
        debug!(component = model.component_name(), "released to host");
    }

    fn evict<M: Offload + ?Sized>(&self, model: &mut M) {
        if let Err(e) = model.place(Residency::Host, &self.host) {
            warn!(component = model.component_name(), error = %e, "failed to move to host");
        }
        if let Err(e) = (self.reclaim)(&self.compute) {
            warn!(error = %e, "memory reclamation failed");
        }
    }
}

/// Keeps a component on the compute device for its lifetime.
pub struct PlacementGuard<'a, M: Offload + ?Sized> {
    controller: &'a DevicePlacement,
    model: &'a mut M,
}

impl<M: Offload + ?Sized> Deref for PlacementGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: Offload + ?Sized> DerefMut for PlacementGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: Offload + ?Sized> Drop for PlacementGuard<'_, M> {
    fn drop(&mut self) {
        self.controller.release(&mut *self.model);
    }
}
