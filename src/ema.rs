//! # Exponential moving average of model parameters
//!
//! The shadow parameters live in their own `VarStore`, giving two
//! independently addressable snapshots (live and shadow) that callers select
//! explicitly. Evaluation and inference read a network instance built over
//! the shadow store, so training never has to swap parameters in place.

use tch::nn;

/// EMA shadow parameters.
///
/// The shadow store starts as a copy of the live store and thereafter only
/// changes through [`Self::update`] (or [`Self::reset_to`] after a checkpoint
/// reload). It is frozen: gradients never flow into it.
pub struct ExponentialMovingAverage {
    vs: nn::VarStore,
    decay: f64,
}

impl ExponentialMovingAverage {
    /// Wraps `vs` (which must already contain the same variables as `live`,
    /// i.e. the same network was built on both stores) and initializes it
    /// from the live parameters.
    pub fn new(mut vs: nn::VarStore, live: &nn::VarStore, decay: f64) -> anyhow::Result<Self> {
        vs.copy(live)?;
        vs.freeze();
        Ok(Self { vs, decay })
    }

    /// One decay step: `shadow <- decay * shadow + (1 - decay) * live`.
    pub fn update(&mut self, live: &nn::VarStore) {
        let live_vars = live.variables();
        tch::no_grad(|| {
            for (name, mut shadow) in self.vs.variables() {
                if let Some(live_var) = live_vars.get(&name) {
                    let blended = &shadow * self.decay + live_var.detach() * (1. - self.decay);
                    shadow.copy_(&blended);
                }
            }
        });
    }

    /// Re-seeds the shadow from freshly loaded live parameters. This is the
    /// only sanctioned shadow reset besides construction.
    pub fn reset_to(&mut self, live: &nn::VarStore) -> anyhow::Result<()> {
        self.vs.copy(live)?;
        Ok(())
    }

    /// The shadow parameter store.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Tensor};

    #[test]
    fn update_follows_the_decay_rule_exactly() {
        let live = nn::VarStore::new(Device::Cpu);
        let shadow = nn::VarStore::new(Device::Cpu);
        let live_param = live.root().zeros("param", &[1]);
        let _shadow_param = shadow.root().zeros("param", &[1]);

        let mut ema = ExponentialMovingAverage::new(shadow, &live, 0.9).unwrap();
        tch::no_grad(|| {
            let mut live_param = live_param;
            live_param.copy_(&Tensor::from_slice(&[2f32]));
        });
        ema.update(&live);

        // shadow = 0.9 * 0.0 + 0.1 * 2.0
        let shadow_value: f64 =
            ema.var_store().variables().get("param").unwrap().try_into().unwrap();
        assert!((shadow_value - 0.2).abs() < 1e-6, "shadow {shadow_value}");
    }

    #[test]
    fn repeated_updates_converge_to_the_live_value() {
        let live = nn::VarStore::new(Device::Cpu);
        let shadow = nn::VarStore::new(Device::Cpu);
        let live_param = live.root().zeros("param", &[1]);
        let _shadow_param = shadow.root().zeros("param", &[1]);

        let mut ema = ExponentialMovingAverage::new(shadow, &live, 0.5).unwrap();
        tch::no_grad(|| {
            let mut live_param = live_param;
            live_param.copy_(&Tensor::from_slice(&[1f32]));
        });
        for _ in 0..30 {
            ema.update(&live);
        }
        let shadow_value: f64 =
            ema.var_store().variables().get("param").unwrap().try_into().unwrap();
        assert!((shadow_value - 1.).abs() < 1e-6);
    }
}
