//! # Agent
//!
//! The optimization loop around the preconditioned denoiser: batch
//! processing, noise-level sampling, gradient steps, EMA tracking, periodic
//! evaluation through the DDIM sampler, simulation rollouts and
//! checkpointing. Single logical thread of control; batches are consumed
//! strictly sequentially.

use crate::context::ContextBuffer;
use crate::dataset::{DataLoader, TrajectoryBatch};
use crate::ema::ExponentialMovingAverage;
use crate::env::Environment;
use crate::models::denoiser::Denoiser;
use crate::models::{ConditionalNetwork, Conditioning, NO_WEIGHT_DECAY_GROUP, WEIGHT_DECAY_GROUP};
use crate::scaler::MinMaxScaler;
use crate::schedulers::ddim::{DDIMSampler, DDIMSamplerConfig, GuidanceMode};
use crate::schedulers::rand_log_logistic;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tch::nn::OptimizerConfig;
use tch::{nn, Device, IndexOp, Kind, Reduction, Tensor};

/// The configuration for the agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    pub max_train_steps: usize,
    pub eval_every_n_steps: usize,
    pub sim_every_n_steps: usize,
    pub update_ema_every_n_steps: usize,
    /// Evaluate and predict with the EMA shadow weights instead of the live
    /// ones.
    pub use_ema: bool,
    /// EMA decay rate.
    pub decay: f64,
    pub num_sampling_steps: usize,
    pub sigma_data: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
    /// Location of the training noise-level density; `ln(sigma_data)` when
    /// unset.
    pub density_loc: Option<f64>,
    /// Scale of the training noise-level density.
    pub density_scale: f64,
    /// Classifier-free guidance strength at inference.
    pub cond_lambda: f64,
    /// Training-time conditioning dropout probability; guidance is only used
    /// at inference when this is positive.
    pub cond_mask_prob: f64,
    /// Prediction horizon length.
    pub t: i64,
    /// Observation-history length.
    pub t_cond: i64,
    /// Number of predicted actions actually executed per `predict` call.
    pub t_action: i64,
    pub obs_dim: i64,
    pub pred_obs_dim: i64,
    pub action_dim: i64,
    pub num_envs: i64,
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_train_steps: 100_000,
            eval_every_n_steps: 5_000,
            sim_every_n_steps: 20_000,
            update_ema_every_n_steps: 10,
            use_ema: true,
            decay: 0.999,
            num_sampling_steps: 10,
            sigma_data: 0.5,
            sigma_min: 0.001,
            sigma_max: 80.,
            density_loc: None,
            density_scale: 0.5,
            cond_lambda: 1.,
            cond_mask_prob: 0.1,
            t: 8,
            t_cond: 4,
            t_action: 4,
            obs_dim: 33,
            pred_obs_dim: 33,
            action_dim: 12,
            num_envs: 1,
            lr: 1e-4,
            min_lr: 1e-6,
            weight_decay: 1e-3,
        }
    }
}

/// Per-segment reconstruction errors of an evaluation pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalMetrics {
    pub total_mse: f64,
    pub state_mse: f64,
    pub action_mse: f64,
    pub first_mse: f64,
    pub last_mse: f64,
}

/// The result of one `predict` call, in physical units.
#[derive(Debug)]
pub struct Prediction {
    /// The first `t_action` predicted actions, `(num_envs, t_action, act_dim)`.
    pub action: Tensor,
    /// The full predicted trajectory, `(num_envs, t, pred_obs_dim + act_dim)`.
    pub trajectory: Tensor,
}

/// A diffusion behavior-cloning agent.
pub struct Agent {
    model: Denoiser,
    vs: nn::VarStore,
    ema: ExponentialMovingAverage,
    ema_model: Denoiser,
    optimizer: nn::Optimizer,
    train_loader: DataLoader,
    test_loader: DataLoader,
    scaler: MinMaxScaler,
    context: ContextBuffer,
    steps: usize,
    config: AgentConfig,
}

impl Agent {
    /// Builds the live and EMA shadow copies of the network (the builder is
    /// invoked once per parameter store) together with the optimizer and the
    /// inference context buffer.
    pub fn new<F>(
        build_network: F,
        train_loader: DataLoader,
        test_loader: DataLoader,
        scaler: MinMaxScaler,
        config: AgentConfig,
        device: Device,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&nn::Path) -> Box<dyn ConditionalNetwork>,
    {
        let vs = nn::VarStore::new(device);
        let model = Denoiser::new(build_network(&vs.root()), config.sigma_data);

        let num_params: i64 =
            vs.trainable_variables().iter().map(|t| t.size().iter().product::<i64>()).sum();
        tracing::info!(num_params, "network built");

        let mut optimizer = nn::AdamW::default().build(&vs, config.lr)?;
        optimizer.set_weight_decay_group(WEIGHT_DECAY_GROUP, config.weight_decay);
        optimizer.set_weight_decay_group(NO_WEIGHT_DECAY_GROUP, 0.);

        let shadow_vs = nn::VarStore::new(device);
        let ema_model = Denoiser::new(build_network(&shadow_vs.root()), config.sigma_data);
        let ema = ExponentialMovingAverage::new(shadow_vs, &vs, config.decay)?;

        let context = ContextBuffer::new(config.t_cond as usize);
        Ok(Self {
            model,
            vs,
            ema,
            ema_model,
            optimizer,
            train_loader,
            test_loader,
            scaler,
            context,
            steps: 0,
            config,
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// The next shuffled training batch; the underlying epoch restarts
    /// transparently when exhausted.
    pub fn next_train_batch(&mut self) -> TrajectoryBatch {
        self.train_loader.next_batch()
    }

    pub fn scaler(&self) -> &MinMaxScaler {
        &self.scaler
    }

    fn device(&self) -> Device {
        self.vs.device()
    }

    fn eval_denoiser(&self) -> &Denoiser {
        if self.config.use_ema {
            &self.ema_model
        } else {
            &self.model
        }
    }

    fn sampler_config(&self) -> DDIMSamplerConfig {
        DDIMSamplerConfig { sigma_min: self.config.sigma_min, sigma_max: self.config.sigma_max }
    }

    /// Cosine annealing from `lr` to `min_lr` over the training run.
    fn scheduled_lr(&self) -> f64 {
        let config = &self.config;
        let progress = (self.steps as f64 / config.max_train_steps.max(1) as f64).min(1.);
        config.min_lr
            + 0.5 * (config.lr - config.min_lr) * (1. + (std::f64::consts::PI * progress).cos())
    }

    /// Per-example training sigmas drawn from the truncated log-logistic
    /// density.
    fn sample_density(&self, batch_size: i64) -> Tensor {
        let config = &self.config;
        let loc = config.density_loc.unwrap_or_else(|| config.sigma_data.ln());
        rand_log_logistic(
            &[batch_size],
            loc,
            config.density_scale,
            config.sigma_min,
            config.sigma_max,
            self.device(),
        )
    }

    /// Re-centers positions on the last context step, scales everything, and
    /// splits the window into conditioning and diffusion target.
    fn process_batch(&self, batch: &TrajectoryBatch) -> (Conditioning, Tensor) {
        let t_cond = self.config.t_cond;

        // All downstream quantities live in the robot-relative frame: the
        // first two (position) dimensions are taken relative to the last
        // context timestep.
        let ref_pos = batch.obs.i((.., t_cond - 1..t_cond, 0..2));
        let positions = batch.obs.i((.., .., 0..2)) - ref_pos;
        let obs = Tensor::cat(&[positions, batch.obs.i((.., .., 2..))], -1);

        let cond = Conditioning {
            obs: self.scaler.scale_input(&obs.i((.., 0..t_cond, ..))),
            vel_cmd: self.scaler.scale_command(&batch.vel_cmd),
            skill: batch.skill.shallow_clone(),
        };

        let state = obs.i((.., t_cond.., 0..self.config.pred_obs_dim));
        let action = batch.action.i((.., t_cond.., ..));
        let target = self.scaler.scale_output(&Tensor::cat(&[state, action], -1));
        (cond, target)
    }

    /// One gradient step: noise the target at a random sigma, regress the
    /// denoiser, step the optimizer and the LR schedule, and track the EMA.
    pub fn train_step(&mut self, batch: &TrajectoryBatch) -> anyhow::Result<f64> {
        let (cond, target) = self.process_batch(batch);
        let noise = Tensor::randn_like(&target);
        let sigma = self.sample_density(target.size()[0]);
        let loss = self.model.loss(&target, &noise, &sigma, &cond);

        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();
        self.steps += 1;
        self.optimizer.set_lr(self.scheduled_lr());

        if self.steps % self.config.update_ema_every_n_steps == 0 {
            self.ema.update(&self.vs);
        }
        Ok(loss.double_value(&[]))
    }

    /// Reconstructs one batch from pure noise with the evaluation weights and
    /// reports per-segment errors against the ground truth.
    pub fn evaluate(&self, batch: &TrajectoryBatch) -> EvalMetrics {
        let _no_grad = tch::no_grad_guard();
        let (cond, target) = self.process_batch(batch);

        let sampler = DDIMSampler::new(self.config.num_sampling_steps, self.sampler_config());
        let noise = Tensor::randn_like(&target) * self.config.sigma_max;
        let x_0 = sampler.sample(self.eval_denoiser(), noise, &cond, &GuidanceMode::None);

        let mse = x_0.mse_loss(&target, Reduction::None);
        let pred_obs_dim = self.config.pred_obs_dim;
        EvalMetrics {
            total_mse: mse.mean(Kind::Float).double_value(&[]),
            state_mse: mse.i((.., .., 0..pred_obs_dim)).mean(Kind::Float).double_value(&[]),
            action_mse: mse.i((.., .., pred_obs_dim..)).mean(Kind::Float).double_value(&[]),
            first_mse: mse.i((.., 0, ..)).mean(Kind::Float).double_value(&[]),
            last_mse: mse.i((.., -1, ..)).mean(Kind::Float).double_value(&[]),
        }
    }

    /// Averages [`Self::evaluate`] over the whole test split.
    pub fn evaluate_epoch(&self) -> EvalMetrics {
        let num_batches = self.test_loader.num_batches();
        let mut sum = EvalMetrics::default();
        for index in 0..num_batches {
            let metrics = self.evaluate(&self.test_loader.batch(index));
            sum.total_mse += metrics.total_mse;
            sum.state_mse += metrics.state_mse;
            sum.action_mse += metrics.action_mse;
            sum.first_mse += metrics.first_mse;
            sum.last_mse += metrics.last_mse;
        }
        let n = num_batches.max(1) as f64;
        EvalMetrics {
            total_mse: sum.total_mse / n,
            state_mse: sum.state_mse / n,
            action_mse: sum.action_mse / n,
            first_mse: sum.first_mse / n,
            last_mse: sum.last_mse / n,
        }
    }

    /// Clears the observation history, e.g. when the environment resets.
    pub fn reset(&mut self) {
        self.context.reset();
    }

    /// Samples a trajectory conditioned on the rolling observation history
    /// and returns the executable slice of actions in physical units.
    pub fn predict(
        &mut self,
        observation: &Tensor,
        vel_cmd: &Tensor,
        skill: &Tensor,
        new_sampling_steps: Option<usize>,
    ) -> Prediction {
        let _no_grad = tch::no_grad_guard();
        let device = self.device();
        self.context.push(observation.to_device(device));
        let obs_hist = self.context.stacked();

        let t_cond = self.config.t_cond;
        let ref_pos = obs_hist.i((.., t_cond - 1..t_cond, 0..2));
        let positions = obs_hist.i((.., .., 0..2)) - ref_pos;
        let obs = Tensor::cat(&[positions, obs_hist.i((.., .., 2..))], -1);

        let cond = Conditioning {
            obs: self.scaler.scale_input(&obs),
            vel_cmd: self.scaler.scale_command(&vel_cmd.to_device(device)),
            skill: skill.to_device(device),
        };

        let num_sampling_steps = new_sampling_steps.unwrap_or(self.config.num_sampling_steps);
        let sampler = DDIMSampler::new(num_sampling_steps, self.sampler_config());

        let sa_dim = self.config.pred_obs_dim + self.config.action_dim;
        let noise = Tensor::randn(
            [self.config.num_envs, self.config.t, sa_dim],
            (Kind::Float, device),
        ) * self.config.sigma_max;

        let guidance = if self.config.cond_mask_prob > 0. {
            GuidanceMode::ClassifierFree { cond_lambda: self.config.cond_lambda }
        } else {
            GuidanceMode::None
        };
        let x_0 = sampler.sample(self.eval_denoiser(), noise, &cond, &guidance);

        let trajectory = self.scaler.inverse_scale_output(&self.scaler.clip(&x_0));
        let action = trajectory.i((.., 0..self.config.t_action, self.config.pred_obs_dim..));
        Prediction { action, trajectory }
    }

    /// The main training loop: evaluation epochs, gradient steps and
    /// simulation rollouts interleaved on the step counter.
    pub fn train_agent(
        &mut self,
        mut env: Option<&mut dyn Environment>,
        work_dir: &Path,
    ) -> anyhow::Result<()> {
        let mut best_test_mse = f64::INFINITY;
        let progress = ProgressBar::new(self.config.max_train_steps as u64);
        progress.set_style(ProgressStyle::default_bar().template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?);

        for _ in 0..self.config.max_train_steps {
            if self.steps % self.config.eval_every_n_steps == 0 {
                let metrics = self.evaluate_epoch();
                tracing::info!(
                    step = self.steps,
                    total_mse = metrics.total_mse,
                    state_mse = metrics.state_mse,
                    action_mse = metrics.action_mse,
                    first_mse = metrics.first_mse,
                    last_mse = metrics.last_mse,
                    lr = self.scheduled_lr(),
                    "evaluation"
                );
                if metrics.total_mse < best_test_mse {
                    best_test_mse = metrics.total_mse;
                    self.store_model_weights(work_dir)?;
                    tracing::info!("new best test loss, stored weights updated");
                }
            }

            let batch = self.next_train_batch();
            let loss = self.train_step(&batch)?;
            if self.steps % 100 == 0 {
                progress.set_message(format!("loss {loss:.4}"));
            }
            progress.inc(1);

            if self.steps % self.config.sim_every_n_steps == 0 {
                if let Some(env) = env.as_mut() {
                    let summary = env.simulate(self)?;
                    tracing::info!(
                        step = self.steps,
                        avrg_reward = summary.avrg_reward,
                        std_reward = summary.std_reward,
                        total_done = summary.total_done,
                        "simulation"
                    );
                }
            }
        }

        progress.finish_with_message("training done");
        self.store_model_weights(work_dir)
    }

    /// Persists the EMA weights, the live weights and the scaler statistics.
    /// Optimizer state is not persisted.
    pub fn store_model_weights<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        if self.config.use_ema {
            self.ema.var_store().save(dir.join("model.ot"))?;
        } else {
            self.vs.save(dir.join("model.ot"))?;
        }
        self.vs.save(dir.join("non_ema_model.ot"))?;
        self.scaler.save(dir.join("scaler.ot"))?;
        Ok(())
    }

    /// Loads checkpointed weights and scaler statistics. Matching is
    /// non-strict: variables absent from the file keep their initialization
    /// and are only logged. The EMA shadow is re-seeded from the loaded
    /// weights.
    pub fn load_pretrained_model<P: AsRef<Path>>(&mut self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        let missing = self.vs.load_partial(dir.join("model.ot"))?;
        if !missing.is_empty() {
            tracing::warn!(?missing, "variables missing from checkpoint, left at initialization");
        }
        self.ema.reset_to(&self.vs)?;
        self.scaler = MinMaxScaler::load(dir.join("scaler.ot"), self.device())?;
        tracing::info!("loaded pre-trained model parameters and scaler");
        Ok(())
    }
}
