//! # Conditional diffusion transformer
//!
//! A causal transformer decoder denoising trajectories of state-action pairs.
//! The noise level, velocity command, skill label and observation history are
//! embedded into a conditioning memory which every decoder block attends to.

use super::{ConditionalNetwork, Conditioning, NO_WEIGHT_DECAY_GROUP, WEIGHT_DECAY_GROUP};
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// A linear layer with its weight tagged for decay and its bias tagged
/// against it, so the optimizer groups are declared where the parameters are
/// created.
fn linear(vs: &nn::Path, in_dim: i64, out_dim: i64) -> nn::Linear {
    let ws = vs.set_group(WEIGHT_DECAY_GROUP).randn("weight", &[out_dim, in_dim], 0., 0.02);
    let bs = vs.set_group(NO_WEIGHT_DECAY_GROUP).zeros("bias", &[out_dim]);
    nn::Linear { ws, bs: Some(bs) }
}

fn layer_norm(vs: &nn::Path, dim: i64) -> nn::LayerNorm {
    nn::layer_norm(vs.set_group(NO_WEIGHT_DECAY_GROUP), vec![dim], Default::default())
}

/// Fixed sinusoidal positional code, `(1, length, dim)`.
fn sinusoidal_positions(length: i64, dim: i64, device: Device) -> Tensor {
    let half_dim = dim / 2;
    let exponent =
        Tensor::arange(half_dim, (Kind::Float, device)) * -(10000f64.ln()) / (half_dim as f64 - 1.);
    let freqs = exponent.exp();
    let positions = Tensor::arange(length, (Kind::Float, device));
    let angles = positions.unsqueeze(-1) * freqs.unsqueeze(0);
    Tensor::cat(&[angles.sin(), angles.cos()], -1).unsqueeze(0)
}

/// Additive causal mask: zero on and below the diagonal, -inf above it.
fn causal_mask(size: i64, device: Device) -> Tensor {
    let visible = Tensor::ones([size, size], (Kind::Float, device)).tril(0);
    Tensor::zeros([size, size], (Kind::Float, device))
        .masked_fill(&visible.eq(0.), f64::NEG_INFINITY)
}

#[derive(Debug)]
struct Attention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: i64,
    scale: f64,
    dropout: f64,
}

impl Attention {
    fn new(vs: &nn::Path, d_model: i64, heads: i64, dropout: f64) -> Self {
        let to_q = linear(&(vs / "to_q"), d_model, d_model);
        let to_k = linear(&(vs / "to_k"), d_model, d_model);
        let to_v = linear(&(vs / "to_v"), d_model, d_model);
        let to_out = linear(&(vs / "to_out"), d_model, d_model);
        let scale = 1. / f64::sqrt((d_model / heads) as f64);
        Self { to_q, to_k, to_v, to_out, heads, scale, dropout }
    }

    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Tensor {
        let (batch_size, seq_len, dim) = xs.size3().unwrap();
        xs.reshape([batch_size, seq_len, self.heads, dim / self.heads])
            .permute([0, 2, 1, 3])
            .reshape([batch_size * self.heads, seq_len, dim / self.heads])
    }

    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Tensor {
        let (batch_size, seq_len, dim) = xs.size3().unwrap();
        xs.reshape([batch_size / self.heads, self.heads, seq_len, dim])
            .permute([0, 2, 1, 3])
            .reshape([batch_size / self.heads, seq_len, dim * self.heads])
    }

    /// Self-attention when `context` is `None`, cross-attention otherwise.
    fn forward(&self, xs: &Tensor, context: Option<&Tensor>, mask: Option<&Tensor>, train: bool) -> Tensor {
        let context = context.unwrap_or(xs);
        let query = self.reshape_heads_to_batch_dim(&xs.apply(&self.to_q));
        let key = self.reshape_heads_to_batch_dim(&context.apply(&self.to_k));
        let value = self.reshape_heads_to_batch_dim(&context.apply(&self.to_v));

        let mut scores = query.matmul(&(key.transpose(-1, -2) * self.scale));
        if let Some(mask) = mask {
            scores = scores + mask;
        }
        let attn = scores.softmax(-1, Kind::Float).dropout(self.dropout, train);
        self.reshape_batch_dim_to_heads(&attn.matmul(&value))
            .apply(&self.to_out)
            .dropout(self.dropout, train)
    }
}

#[derive(Debug)]
struct FeedForward {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    fn new(vs: &nn::Path, dim: i64, mult: i64, dropout: f64) -> Self {
        let linear_1 = linear(&(vs / "linear_1"), dim, dim * mult);
        let linear_2 = linear(&(vs / "linear_2"), dim * mult, dim);
        Self { linear_1, linear_2, dropout }
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.linear_1).gelu("none").apply(&self.linear_2).dropout(self.dropout, train)
    }
}

/// Pre-norm decoder block: masked self-attention over the noisy trajectory,
/// cross-attention into the conditioning memory, then a feed-forward layer.
#[derive(Debug)]
struct DecoderLayer {
    norm_1: nn::LayerNorm,
    norm_2: nn::LayerNorm,
    norm_3: nn::LayerNorm,
    self_attn: Attention,
    cross_attn: Attention,
    ff: FeedForward,
}

impl DecoderLayer {
    fn new(vs: &nn::Path, d_model: i64, heads: i64, dropout: f64) -> Self {
        Self {
            norm_1: layer_norm(&(vs / "norm_1"), d_model),
            norm_2: layer_norm(&(vs / "norm_2"), d_model),
            norm_3: layer_norm(&(vs / "norm_3"), d_model),
            self_attn: Attention::new(&(vs / "self_attn"), d_model, heads, dropout),
            cross_attn: Attention::new(&(vs / "cross_attn"), d_model, heads, dropout),
            ff: FeedForward::new(&(vs / "ff"), d_model, 4, dropout),
        }
    }

    fn forward(&self, xs: &Tensor, memory: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let xs = xs + self.self_attn.forward(&xs.apply(&self.norm_1), None, Some(mask), train);
        let xs = &xs + self.cross_attn.forward(&xs.apply(&self.norm_2), Some(memory), None, train);
        &xs + self.ff.forward(&xs.apply(&self.norm_3), train)
    }
}

/// The configuration for the conditional diffusion transformer.
#[derive(Debug, Clone, Copy)]
pub struct DiffusionTransformerConfig {
    /// Dimension of a raw observation.
    pub obs_dim: i64,
    /// Dimension of the predicted state slice.
    pub pred_obs_dim: i64,
    /// Dimension of an action.
    pub act_dim: i64,
    /// Dimension of the velocity command.
    pub cmd_dim: i64,
    /// Dimension of the skill label.
    pub skill_dim: i64,
    /// Width of the transformer.
    pub d_model: i64,
    /// Number of attention heads.
    pub n_heads: i64,
    /// Number of decoder blocks.
    pub num_layers: i64,
    /// Prediction horizon length.
    pub t: i64,
    /// Observation-history length.
    pub t_cond: i64,
    pub dropout: f64,
    /// Probability of masking the command/skill conditioning of a training
    /// example, enabling classifier-free guidance at inference.
    pub cond_mask_prob: f64,
}

impl Default for DiffusionTransformerConfig {
    fn default() -> Self {
        Self {
            obs_dim: 33,
            pred_obs_dim: 33,
            act_dim: 12,
            cmd_dim: 3,
            skill_dim: 1,
            d_model: 256,
            n_heads: 4,
            num_layers: 4,
            t: 8,
            t_cond: 4,
            dropout: 0.1,
            cond_mask_prob: 0.1,
        }
    }
}

/// The conditional diffusion transformer.
#[derive(Debug)]
pub struct DiffusionTransformer {
    state_action_emb: nn::Linear,
    cond_state_emb: nn::Linear,
    sigma_emb: nn::Linear,
    vel_cmd_emb: nn::Linear,
    skill_emb: nn::Linear,
    encoder_1: nn::Linear,
    encoder_2: nn::Linear,
    layers: Vec<DecoderLayer>,
    final_norm: nn::LayerNorm,
    state_action_pred: nn::Linear,
    pos_emb: Tensor,
    cond_pos_emb: Tensor,
    mask: Tensor,
    cond_mask_prob: f64,
}

impl DiffusionTransformer {
    pub fn new(vs: &nn::Path, config: DiffusionTransformerConfig) -> Self {
        let d_model = config.d_model;
        let sa_dim = config.pred_obs_dim + config.act_dim;
        let device = vs.device();

        let state_action_emb = linear(&(vs / "state_action_emb"), sa_dim, d_model);
        let cond_state_emb = linear(&(vs / "cond_state_emb"), config.obs_dim, d_model);
        let sigma_emb = linear(&(vs / "sigma_emb"), 1, d_model);
        let vel_cmd_emb = linear(&(vs / "vel_cmd_emb"), config.cmd_dim, d_model);
        let skill_emb = linear(&(vs / "skill_emb"), config.skill_dim, d_model);
        let encoder_1 = linear(&(vs / "encoder_1"), d_model, 4 * d_model);
        let encoder_2 = linear(&(vs / "encoder_2"), 4 * d_model, d_model);
        let decoder = vs / "decoder";
        let layers = (0..config.num_layers)
            .map(|i| DecoderLayer::new(&(&decoder / i), d_model, config.n_heads, config.dropout))
            .collect();
        let final_norm = layer_norm(&(vs / "final_norm"), d_model);
        let state_action_pred = linear(&(vs / "state_action_pred"), d_model, sa_dim);

        // The conditioning memory has three extra tokens: sigma, command, skill.
        let pos_emb = sinusoidal_positions(config.t, d_model, device);
        let cond_pos_emb = sinusoidal_positions(config.t_cond + 3, d_model, device);
        let mask = causal_mask(config.t, device);

        Self {
            state_action_emb,
            cond_state_emb,
            sigma_emb,
            vel_cmd_emb,
            skill_emb,
            encoder_1,
            encoder_2,
            layers,
            final_norm,
            state_action_pred,
            pos_emb,
            cond_pos_emb,
            mask,
            cond_mask_prob: config.cond_mask_prob,
        }
    }

    /// Zeroes the command/skill conditioning: always when forced (the
    /// classifier-free null branch), randomly per example during training.
    fn mask_cond(&self, cond: &Tensor, force_mask: bool, train: bool) -> Tensor {
        if force_mask {
            cond.zeros_like()
        } else if train && self.cond_mask_prob > 0. {
            let batch_size = cond.size()[0];
            let keep = Tensor::rand([batch_size, 1], (Kind::Float, cond.device()))
                .ge(self.cond_mask_prob)
                .to_kind(Kind::Float);
            cond * keep
        } else {
            cond.shallow_clone()
        }
    }
}

impl ConditionalNetwork for DiffusionTransformer {
    fn forward(
        &self,
        x: &Tensor,
        sigma: &Tensor,
        cond: &Conditioning,
        uncond: bool,
        train: bool,
    ) -> Tensor {
        let input_emb = x.apply(&self.state_action_emb) + &self.pos_emb;

        let sigma_emb = (sigma.view([-1, 1, 1]).log() / 4.).apply(&self.sigma_emb);
        let vel_cmd_emb =
            self.mask_cond(&cond.vel_cmd, uncond, train).apply(&self.vel_cmd_emb).unsqueeze(1);
        let skill_emb = self.mask_cond(&cond.skill, uncond, train).apply(&self.skill_emb).unsqueeze(1);
        let obs_emb = cond.obs.apply(&self.cond_state_emb);
        let memory = Tensor::cat(&[sigma_emb, vel_cmd_emb, skill_emb, obs_emb], 1) + &self.cond_pos_emb;
        let memory = memory.apply(&self.encoder_1).mish().apply(&self.encoder_2);

        let mut xs = input_emb;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, &memory, &self.mask, train);
        }
        xs.apply(&self.final_norm).apply(&self.state_action_pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> DiffusionTransformerConfig {
        DiffusionTransformerConfig {
            obs_dim: 5,
            pred_obs_dim: 5,
            act_dim: 3,
            cmd_dim: 3,
            skill_dim: 1,
            d_model: 16,
            n_heads: 2,
            num_layers: 2,
            t: 4,
            t_cond: 3,
            dropout: 0.,
            cond_mask_prob: 0.1,
        }
    }

    fn conditioning(batch_size: i64, config: &DiffusionTransformerConfig) -> Conditioning {
        let opts = (Kind::Float, Device::Cpu);
        Conditioning {
            obs: Tensor::randn([batch_size, config.t_cond, config.obs_dim], opts),
            vel_cmd: Tensor::randn([batch_size, config.cmd_dim], opts),
            skill: Tensor::ones([batch_size, config.skill_dim], opts),
        }
    }

    #[test]
    fn output_shape_matches_input() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = small_config();
        let net = DiffusionTransformer::new(&vs.root(), config);
        let x = Tensor::randn([2, config.t, config.pred_obs_dim + config.act_dim],
            (Kind::Float, Device::Cpu));
        let sigma = Tensor::from_slice(&[1f32, 2.]);
        let out = net.forward(&x, &sigma, &conditioning(2, &config), false, false);
        assert_eq!(out.size(), x.size());
    }

    #[test]
    fn null_conditioning_changes_the_output() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = small_config();
        let net = DiffusionTransformer::new(&vs.root(), config);
        let cond = conditioning(2, &config);
        let x = Tensor::randn([2, config.t, config.pred_obs_dim + config.act_dim],
            (Kind::Float, Device::Cpu));
        let sigma = Tensor::from_slice(&[1f32, 1.]);
        let out = net.forward(&x, &sigma, &cond, false, false);
        let out_uncond = net.forward(&x, &sigma, &cond, true, false);
        let diff: f64 = (&out - &out_uncond).abs().max().try_into().unwrap();
        assert!(diff > 1e-6, "uncond branch should differ, diff {diff}");
    }

    #[test]
    fn parameters_land_in_both_optimizer_groups() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = DiffusionTransformer::new(&vs.root(), small_config());
        let trainable = vs.trainable_variables();
        assert!(!trainable.is_empty());
        // Every weight matrix decays, every bias and norm parameter does not;
        // both kinds must be present.
        let n_matrices = trainable.iter().filter(|t| t.size().len() == 2).count();
        let n_vectors = trainable.iter().filter(|t| t.size().len() == 1).count();
        assert!(n_matrices > 0 && n_vectors > 0);
    }
}
