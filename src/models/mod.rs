//! # Models
//!
//! The conditional denoising network contract, the Karras preconditioner
//! wrapping it, and a transformer implementation of the contract.

use tch::Tensor;

pub mod denoiser;
pub mod transformer;

/// Optimizer group for parameters that experience weight decay (e.g. linear
/// weights). Networks tag each parameter with one of the two groups at
/// creation time via `nn::Path::set_group`; the training loop then sets the
/// per-group decay on the optimizer.
pub const WEIGHT_DECAY_GROUP: usize = 0;
/// Optimizer group for parameters that must not be decayed (biases,
/// layer-norm parameters, positional embeddings).
pub const NO_WEIGHT_DECAY_GROUP: usize = 1;

/// Everything the denoising network is conditioned on besides the noisy
/// trajectory itself: the scaled observation history, the scaled velocity
/// command and the skill label.
#[derive(Debug)]
pub struct Conditioning {
    /// Scaled observation history, `(batch, t_cond, obs_dim)`.
    pub obs: Tensor,
    /// Scaled velocity command, `(batch, cmd_dim)`.
    pub vel_cmd: Tensor,
    /// Skill label, `(batch, skill_dim)`.
    pub skill: Tensor,
}

/// The conditional denoising network contract.
///
/// Implementations map a noisy trajectory, a per-example noise level and the
/// conditioning to a prediction of the same shape as the trajectory. `uncond`
/// requests the null-conditioned branch used by classifier-free guidance;
/// `train` enables dropout and training-time conditioning masking.
pub trait ConditionalNetwork {
    fn forward(
        &self,
        x: &Tensor,
        sigma: &Tensor,
        cond: &Conditioning,
        uncond: bool,
        train: bool,
    ) -> Tensor;
}
