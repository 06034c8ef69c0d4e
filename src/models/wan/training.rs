//! Training-side forward construction: timestep sampling and noisy inputs.
//!
//! Flow matching interpolates linearly, `x_t = (1 - t) * x_0 + t * noise`, and
//! the transformer regresses the velocity `noise - x_0`.

use crate::config::{ConfigError, SchedulerConfig};
use crate::models::wan::packager::{InputPackager, TrainingBatch, TrainingPackage};
use crate::models::wan::scheduler::{FlowUniPcScheduler, apply_shift};
use crate::utils::deterministic_rng::Pcg32;
use candle_core::{DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestepSampling {
    /// `t ~ U(0, 1)`
    Uniform,
    /// `t = sigmoid(scale * n)`, `n ~ N(0, 1)`
    #[default]
    Sigmoid,
    /// Sigmoid sample reshaped by the discrete flow shift
    Shift,
    /// Uniform index into the shifted training sigma table
    Sigma,
}

impl FromStr for TimestepSampling {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "sigmoid" => Ok(Self::Sigmoid),
            "shift" => Ok(Self::Shift),
            "sigma" => Ok(Self::Sigma),
            other => Err(ConfigError::UnknownTimestepSampling(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimestepSampler {
    mode: TimestepSampling,
    sigmoid_scale: f64,
    discrete_flow_shift: f64,
    num_train_timesteps: usize,
    sigma_table: Vec<f64>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl TimestepSampler {
    pub fn new(
        mode: TimestepSampling,
        sigmoid_scale: f64,
        discrete_flow_shift: f64,
    ) -> std::result::Result<Self, ConfigError> {
        if !discrete_flow_shift.is_finite() || discrete_flow_shift <= 0.0 {
            return Err(ConfigError::InvalidShift(discrete_flow_shift));
        }
        let scheduler_config = SchedulerConfig {
            shift: discrete_flow_shift,
            ..Default::default()
        };
        let num_train_timesteps = scheduler_config.num_train_timesteps;
        let sigma_table = match mode {
            TimestepSampling::Sigma => FlowUniPcScheduler::new(scheduler_config)
                .map_err(|_| ConfigError::InvalidShift(discrete_flow_shift))?
                .train_sigmas()
                .to_vec(),
            _ => Vec::new(),
        };
        Ok(Self {
            mode,
            sigmoid_scale,
            discrete_flow_shift,
            num_train_timesteps,
            sigma_table,
        })
    }

    pub fn mode(&self) -> TimestepSampling {
        self.mode
    }

    /// Draws one noise level in `[0, 1]` per sample.
    pub fn sample_t(&self, batch: usize, rng: &mut Pcg32) -> Vec<f64> {
        (0..batch)
            .map(|_| match self.mode {
                TimestepSampling::Uniform => rng.next_f32() as f64,
                TimestepSampling::Sigmoid => {
                    sigmoid(self.sigmoid_scale * rng.next_gaussian_pair().0 as f64)
                }
                TimestepSampling::Shift => {
                    let t = sigmoid(self.sigmoid_scale * rng.next_gaussian_pair().0 as f64);
                    apply_shift(t, self.discrete_flow_shift)
                }
                TimestepSampling::Sigma => {
                    let idx = rng.next_u32() as usize % self.sigma_table.len();
                    self.sigma_table[idx]
                }
            })
            .collect()
    }

    /// Model timesteps for noise levels `t`: `t * 1000 + 1`, or `t * 1000` for table draws.
    pub fn timesteps_for(&self, t: &[f64], device: &Device) -> Result<Tensor> {
        let offset = match self.mode {
            TimestepSampling::Sigma => 0.0,
            _ => 1.0,
        };
        let n = self.num_train_timesteps as f64;
        let ts: Vec<f32> = t.iter().map(|t| (t * n + offset) as f32).collect();
        Tensor::from_vec(ts, t.len(), device)
    }

    /// `(1 - t) * latents + t * noise` with one `t` per batch entry.
    pub fn noisy_input(&self, latents: &Tensor, noise: &Tensor, t: &[f64]) -> Result<Tensor> {
        let batch = latents.dim(0)?;
        if t.len() != batch {
            candle_core::bail!("got {} noise levels for a batch of {batch}", t.len());
        }
        let noise = noise.to_dtype(latents.dtype())?;
        let rows = (0..batch)
            .map(|i| {
                let x0 = latents.get(i)?;
                let n = noise.get(i)?;
                x0.affine(1.0 - t[i], 0.0)?.add(&n.affine(t[i], 0.0)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&rows, 0)
    }

    /// Draws noise and timesteps for `batch` and packages the forward call.
    pub fn prepare_step(
        &self,
        packager: &InputPackager,
        batch: &TrainingBatch,
        rng: &mut Pcg32,
        gradient_checkpointing: bool,
    ) -> Result<TrainingPackage> {
        let latents = batch.latents.to_dtype(DType::F32)?;
        let noise = rng.randn(latents.dims(), latents.device())?;
        let t = self.sample_t(latents.dim(0)?, rng);
        let noisy = self.noisy_input(&latents, &noise, &t)?;
        let timesteps = self.timesteps_for(&t, packager.device())?;
        packager.pack_for_training(batch, &noise, &noisy, &timesteps, gradient_checkpointing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_stays_in_unit_interval() {
        for mode in [
            TimestepSampling::Uniform,
            TimestepSampling::Sigmoid,
            TimestepSampling::Shift,
            TimestepSampling::Sigma,
        ] {
            let sampler = TimestepSampler::new(mode, 1.0, 3.0).unwrap();
            let mut rng = Pcg32::seeded(5);
            for t in sampler.sample_t(256, &mut rng) {
                assert!((0.0..=1.0).contains(&t), "{mode:?} produced {t}");
            }
        }
    }

    #[test]
    fn shift_pushes_mass_toward_noise() {
        let mut a = Pcg32::seeded(3);
        let mut b = Pcg32::seeded(3);
        let plain = TimestepSampler::new(TimestepSampling::Sigmoid, 1.0, 3.0).unwrap();
        let shifted = TimestepSampler::new(TimestepSampling::Shift, 1.0, 3.0).unwrap();
        let p: f64 = plain.sample_t(512, &mut a).iter().sum();
        let s: f64 = shifted.sample_t(512, &mut b).iter().sum();
        assert!(s > p);
    }

    #[test]
    fn noisy_input_endpoints() -> Result<()> {
        let dev = Device::Cpu;
        let sampler = TimestepSampler::new(TimestepSampling::Uniform, 1.0, 1.0).unwrap();
        let x = Tensor::ones((2, 1, 1, 1, 2), DType::F32, &dev)?;
        let n = Tensor::zeros((2, 1, 1, 1, 2), DType::F32, &dev)?;
        let noisy = sampler.noisy_input(&x, &n, &[0.0, 1.0])?;
        let v = noisy.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v, vec![1.0, 1.0, 0.0, 0.0]);

        let ts = sampler.timesteps_for(&[0.0, 0.5], &dev)?.to_vec1::<f32>()?;
        assert_eq!(ts, vec![1.0, 501.0]);
        Ok(())
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!("shift".parse::<TimestepSampling>().unwrap(), TimestepSampling::Shift);
        assert!("logit".parse::<TimestepSampling>().is_err());
    }
}
