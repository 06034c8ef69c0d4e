//! Flow-matching UniPC multistep scheduler.
//!
//! Predictor UniP and corrector UniC (B(h) variants bh1/bh2) running on the
//! flow-matching sigma table. The model predicts a velocity `v`; the solver works
//! on the data prediction `x0 = sample - sigma * v`.
//!
//! The scheduler keeps a cursor over its timesteps. `step` must be called once
//! per timestep, in the order returned by `set_timesteps`.

use crate::config::{SchedulerConfig, SolverType};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("set_timesteps must be called before step")]
    NotConfigured,
    #[error("number of inference steps must be at least 1")]
    ZeroSteps,
    #[error("invalid shift {0}: must be finite and positive")]
    InvalidShift(f64),
    #[error("unsupported solver order {0}")]
    InvalidOrder(usize),
    #[error("timestep {got} passed at step {index}, expected {expected}")]
    OutOfOrder { index: usize, expected: i64, got: i64 },
    #[error("scheduler exhausted: all {0} timesteps have been stepped")]
    Exhausted(usize),
    #[error("singular coefficient system for UniPC order {0}")]
    Singular(usize),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Flow UniPC multistep scheduler (Wan sampling default)
#[derive(Debug, Clone)]
pub struct FlowUniPcScheduler {
    config: SchedulerConfig,
    /// Training sigma table after the construction shift, descending
    train_sigmas: Vec<f64>,
    sigma_max: f64,
    sigma_min: f64,

    /// Inference sigmas, `num_inference_steps + 1` entries ending in 0
    sigmas: Vec<f64>,
    timesteps: Vec<i64>,
    timesteps_tensor: Option<Tensor>,

    model_outputs: Vec<Option<Tensor>>,
    timestep_list: Vec<Option<i64>>,
    lower_order_nums: usize,
    this_order: usize,
    last_sample: Option<Tensor>,
    step_index: Option<usize>,
}

impl FlowUniPcScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        if !config.shift.is_finite() || config.shift <= 0.0 {
            return Err(SchedulerError::InvalidShift(config.shift));
        }
        if !(1..=3).contains(&config.solver_order) {
            return Err(SchedulerError::InvalidOrder(config.solver_order));
        }

        let n = config.num_train_timesteps;
        let mut alphas = linspace(1.0, 1.0 / n as f64, n);
        alphas.reverse();
        let train_sigmas: Vec<f64> = alphas
            .iter()
            .map(|a| apply_shift(1.0 - a, config.shift))
            .collect();

        let sigma_max = train_sigmas.first().copied().unwrap_or(1.0);
        let sigma_min = train_sigmas.last().copied().unwrap_or(0.0);
        let order = config.solver_order;

        Ok(Self {
            config,
            train_sigmas,
            sigma_max,
            sigma_min,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
            timesteps_tensor: None,
            model_outputs: vec![None; order],
            timestep_list: vec![None; order],
            lower_order_nums: 0,
            this_order: 0,
            last_sample: None,
            step_index: None,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Builds the inference schedule and resets the solver state.
    ///
    /// `shift` is the discrete flow shift for this call; `None` reuses the
    /// construction shift.
    pub fn set_timesteps(
        &mut self,
        num_inference_steps: usize,
        device: &Device,
        shift: Option<f64>,
    ) -> Result<&[i64]> {
        if num_inference_steps == 0 {
            return Err(SchedulerError::ZeroSteps);
        }
        let shift = shift.unwrap_or(self.config.shift);
        if !shift.is_finite() || shift <= 0.0 {
            return Err(SchedulerError::InvalidShift(shift));
        }

        let mut sigmas = linspace(self.sigma_max, self.sigma_min, num_inference_steps + 1);
        sigmas.truncate(num_inference_steps);
        for s in sigmas.iter_mut() {
            *s = apply_shift(*s, shift);
        }

        let num_train = self.config.num_train_timesteps as f64;
        self.timesteps = sigmas.iter().map(|s| (s * num_train) as i64).collect();
        sigmas.push(0.0);
        self.sigmas = sigmas;

        let ts: Vec<f32> = self.timesteps.iter().map(|&t| t as f32).collect();
        self.timesteps_tensor = Some(Tensor::from_vec(ts, num_inference_steps, device)?);

        let order = self.config.solver_order;
        self.model_outputs = vec![None; order];
        self.timestep_list = vec![None; order];
        self.lower_order_nums = 0;
        self.this_order = 0;
        self.last_sample = None;
        self.step_index = Some(0);

        debug!(
            num_inference_steps,
            shift,
            first = self.timesteps[0],
            "flow unipc schedule"
        );
        Ok(&self.timesteps)
    }

    pub fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    /// Timesteps as an `f32` tensor on the device given to `set_timesteps`.
    pub fn timesteps_tensor(&self) -> Option<&Tensor> {
        self.timesteps_tensor.as_ref()
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn train_sigmas(&self) -> &[f64] {
        &self.train_sigmas
    }

    pub fn step_index(&self) -> Option<usize> {
        self.step_index
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Timestep expected by the next `step` call, if any.
    pub fn next_timestep(&self) -> Option<i64> {
        self.step_index.and_then(|i| self.timesteps.get(i).copied())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.step_index, Some(i) if i >= self.timesteps.len())
    }

    /// Advances the sample by one timestep.
    pub fn step(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<Tensor> {
        let step_index = self.step_index.ok_or(SchedulerError::NotConfigured)?;
        let expected = *self
            .timesteps
            .get(step_index)
            .ok_or(SchedulerError::Exhausted(self.timesteps.len()))?;
        if expected != timestep {
            return Err(SchedulerError::OutOfOrder {
                index: step_index,
                expected,
                got: timestep,
            });
        }

        let out_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;

        let x0 = sample.sub(&model_output.affine(self.sigmas[step_index], 0.0)?)?;

        let use_corrector = step_index > 0
            && !self.config.disable_corrector.contains(&(step_index - 1))
            && self.last_sample.is_some();

        let sample = match (&self.last_sample, use_corrector) {
            (Some(last), true) => self.uni_c_update(&x0, last, &sample, step_index)?,
            _ => sample,
        };

        let order = self.config.solver_order;
        self.model_outputs.rotate_left(1);
        self.timestep_list.rotate_left(1);
        self.model_outputs[order - 1] = Some(x0);
        self.timestep_list[order - 1] = Some(timestep);

        let this_order = if self.config.lower_order_final {
            order.min(self.timesteps.len() - step_index)
        } else {
            order
        };
        self.this_order = this_order.min(self.lower_order_nums + 1);
        self.last_sample = Some(sample.clone());

        let prev = self.uni_p_update(&sample, step_index, self.this_order)?;

        if self.lower_order_nums < order {
            self.lower_order_nums += 1;
        }
        self.step_index = Some(step_index + 1);

        Ok(prev.to_dtype(out_dtype)?)
    }

    fn history(&self, back: usize) -> Result<&Tensor> {
        let len = self.model_outputs.len();
        self.model_outputs
            .get(len - 1 - back)
            .and_then(Option::as_ref)
            .ok_or(SchedulerError::InvalidOrder(back + 1))
    }

    fn b_h(&self, hh: f64) -> f64 {
        match self.config.solver_type {
            SolverType::Bh1 => hh,
            SolverType::Bh2 => hh.exp_m1(),
        }
    }

    /// UniP predictor from `sigmas[idx]` to `sigmas[idx + 1]`.
    fn uni_p_update(&self, sample: &Tensor, idx: usize, order: usize) -> Result<Tensor> {
        let m0 = self.history(0)?;
        let (alpha_t, sigma_t) = alpha_sigma(self.sigmas[idx + 1]);
        let (alpha_s0, sigma_s0) = alpha_sigma(self.sigmas[idx]);
        let lambda_t = lambda(alpha_t, sigma_t);
        let lambda_s0 = lambda(alpha_s0, sigma_s0);
        let h = lambda_t - lambda_s0;

        let mut rks = Vec::with_capacity(order);
        let mut d1s = Vec::with_capacity(order);
        for i in 1..order {
            let mi = self.history(i)?;
            let (alpha_si, sigma_si) = alpha_sigma(self.sigmas[idx - i]);
            let rk = (lambda(alpha_si, sigma_si) - lambda_s0) / h;
            rks.push(rk);
            d1s.push(mi.sub(m0)?.affine(1.0 / rk, 0.0)?);
        }
        rks.push(1.0);

        let hh = -h;
        let h_phi_1 = hh.exp_m1();
        let b_h = self.b_h(hh);
        let (r, b) = unipc_system(&rks, hh, h_phi_1, b_h, order);

        let x_t_ = sample
            .affine(sigma_t / sigma_s0, 0.0)?
            .sub(&m0.affine(alpha_t * h_phi_1, 0.0)?)?;

        if d1s.is_empty() {
            return Ok(x_t_);
        }
        let rhos_p = if order == 2 {
            vec![0.5]
        } else {
            let k = order - 1;
            let r_sub: Vec<Vec<f64>> = r[..k].iter().map(|row| row[..k].to_vec()).collect();
            solve(r_sub, b[..k].to_vec()).ok_or(SchedulerError::Singular(order))?
        };
        let pred_res = weighted_sum(&rhos_p, &d1s)?;
        Ok(x_t_.sub(&pred_res.affine(alpha_t * b_h, 0.0)?)?)
    }

    /// UniC corrector refining `this_sample` (at `sigmas[idx]`) using the fresh x0.
    fn uni_c_update(
        &self,
        this_x0: &Tensor,
        last_sample: &Tensor,
        this_sample: &Tensor,
        idx: usize,
    ) -> Result<Tensor> {
        let order = self.this_order.max(1);
        let m0 = self.history(0)?;
        let (alpha_t, sigma_t) = alpha_sigma(self.sigmas[idx]);
        let (alpha_s0, sigma_s0) = alpha_sigma(self.sigmas[idx - 1]);
        let lambda_t = lambda(alpha_t, sigma_t);
        let lambda_s0 = lambda(alpha_s0, sigma_s0);
        let h = lambda_t - lambda_s0;

        let mut rks = Vec::with_capacity(order);
        let mut d1s = Vec::with_capacity(order);
        for i in 1..order {
            let mi = self.history(i)?;
            let (alpha_si, sigma_si) = alpha_sigma(self.sigmas[idx - (i + 1)]);
            let rk = (lambda(alpha_si, sigma_si) - lambda_s0) / h;
            rks.push(rk);
            d1s.push(mi.sub(m0)?.affine(1.0 / rk, 0.0)?);
        }
        rks.push(1.0);

        let hh = -h;
        let h_phi_1 = hh.exp_m1();
        let b_h = self.b_h(hh);
        let (r, b) = unipc_system(&rks, hh, h_phi_1, b_h, order);

        let rhos_c = if order == 1 {
            vec![0.5]
        } else {
            solve(r, b).ok_or(SchedulerError::Singular(order))?
        };

        let x_t_ = last_sample
            .affine(sigma_t / sigma_s0, 0.0)?
            .sub(&m0.affine(alpha_t * h_phi_1, 0.0)?)?;
        let d1_t = this_x0.sub(m0)?;
        let last_rho = rhos_c[rhos_c.len() - 1];
        let mut corr = d1_t.affine(last_rho, 0.0)?;
        if !d1s.is_empty() {
            corr = corr.add(&weighted_sum(&rhos_c[..rhos_c.len() - 1], &d1s)?)?;
        }
        Ok(x_t_.sub(&corr.affine(alpha_t * b_h, 0.0)?)?)
    }
}

/// `shift * s / (1 + (shift - 1) * s)`
pub fn apply_shift(sigma: f64, shift: f64) -> f64 {
    shift * sigma / (1.0 + (shift - 1.0) * sigma)
}

fn alpha_sigma(sigma: f64) -> (f64, f64) {
    (1.0 - sigma, sigma)
}

/// Half log-SNR. `+inf` at sigma 0, which turns the final update into `x0`.
fn lambda(alpha: f64, sigma: f64) -> f64 {
    alpha.ln() - sigma.ln()
}

/// Vandermonde rows `rks^(i-1)` and right-hand side `b` of the UniPC system.
fn unipc_system(
    rks: &[f64],
    hh: f64,
    h_phi_1: f64,
    b_h: f64,
    order: usize,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut h_phi_k = h_phi_1 / hh - 1.0;
    let mut factorial_i = 1.0;
    let mut r = Vec::with_capacity(order);
    let mut b = Vec::with_capacity(order);
    for i in 1..=order {
        r.push(rks.iter().map(|rk| rk.powi(i as i32 - 1)).collect());
        b.push(h_phi_k * factorial_i / b_h);
        factorial_i *= (i + 1) as f64;
        h_phi_k = h_phi_k / hh - 1.0 / factorial_i;
    }
    (r, b)
}

fn weighted_sum(weights: &[f64], terms: &[Tensor]) -> candle_core::Result<Tensor> {
    let mut acc = terms[0].affine(weights[0], 0.0)?;
    for (w, t) in weights.iter().zip(terms.iter()).skip(1) {
        acc = acc.add(&t.affine(*w, 0.0)?)?;
    }
    Ok(acc)
}

/// Gaussian elimination with partial pivoting on a small dense system.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let s: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - s) / a[row][row];
    }
    Some(x)
}

/// Linear spacing including both endpoints.
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + step * i as f64).collect()
        }
    }
}
