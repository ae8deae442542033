//! # Diffusion-based locomotion policies
//!
//! This crate trains and runs a diffusion-based behavior-cloning policy for
//! legged-robot locomotion using Torch via the
//! [tch-rs](https://github.com/LaurentMazare/tch-rs) bindings.
//!
//! The policy denoises a trajectory of future (state, action) pairs conditioned
//! on an observation history, a velocity command and a skill label. Training
//! uses the Karras et al. preconditioning and a log-logistic noise-level
//! density; inference uses a deterministic DDIM sampler over an exponential
//! sigma schedule.
//!
//! This library includes:
//! - A min-max scaler mapping physical units to and from network space.
//! - The Karras denoiser wrapper and the DDIM exponential-integrator sampler.
//! - A conditional transformer operating on noisy trajectories.
//! - Expert-dataset loading and the training/evaluation loop.

pub mod agent;
pub mod context;
pub mod dataset;
pub mod ema;
pub mod env;
pub mod models;
pub mod scaler;
pub mod schedulers;
pub mod utils;
