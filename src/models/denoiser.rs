//! # Karras preconditioner
//!
//! Wraps the raw conditional network with the input/output scalings of
//! Karras et al. 2022 (https://arxiv.org/abs/2206.00364) so training stays
//! well conditioned across the whole range of noise levels.

use super::{ConditionalNetwork, Conditioning};
use crate::utils::append_dims;
use tch::{Reduction, Tensor};

/// A preconditioned denoiser.
///
/// The per-example `sigma` handed to [`Self::loss`] and [`Self::forward`]
/// must be strictly positive: `c_in` and `c_out` divide by terms that vanish
/// at `sigma == 0`. This is a precondition, not a runtime check.
pub struct Denoiser {
    inner: Box<dyn ConditionalNetwork>,
    sigma_data: f64,
}

impl Denoiser {
    pub fn new(inner: Box<dyn ConditionalNetwork>, sigma_data: f64) -> Self {
        Self { inner, sigma_data }
    }

    /// The Karras scalings for the skip connection, the network output and
    /// the network input, broadcast like `sigma`.
    pub fn scalings(&self, sigma: &Tensor) -> (Tensor, Tensor, Tensor) {
        debug_assert!(
            f64::try_from(sigma.min()).map_or(true, |min| min > 0.),
            "sigma must be strictly positive"
        );
        let sigma_data_sq = self.sigma_data * self.sigma_data;
        let denom = sigma * sigma + sigma_data_sq;
        let c_skip = denom.reciprocal() * sigma_data_sq;
        let c_in = denom.rsqrt();
        let c_out = sigma * self.sigma_data * &c_in;
        (c_skip, c_out, c_in)
    }

    /// The training loss for a clean target `x`, unit noise and per-example
    /// noise levels `sigma` of shape `(batch,)`.
    ///
    /// Of the two algebraically equal parameterizations, the residual target
    /// `(x - c_skip * noised) / c_out` is regressed directly; the combined
    /// reconstruction `c_skip * noised + c_out * output` is never formed here.
    pub fn loss(&self, x: &Tensor, noise: &Tensor, sigma: &Tensor, cond: &Conditioning) -> Tensor {
        let sigma_b = append_dims(sigma, x.dim());
        let noised = x + noise * &sigma_b;
        let (c_skip, c_out, c_in) = self.scalings(&sigma_b);
        let output = self.inner.forward(&(&noised * c_in), sigma, cond, false, true);
        let target = (x - c_skip * &noised) / c_out;
        output.mse_loss(&target, Reduction::Mean)
    }

    /// The fully reconstructed denoised estimate of `x_t` at noise level
    /// `sigma`, i.e. `network(x_t * c_in) * c_out + x_t * c_skip`.
    pub fn forward(&self, x_t: &Tensor, sigma: &Tensor, cond: &Conditioning, uncond: bool) -> Tensor {
        let sigma_b = append_dims(sigma, x_t.dim());
        let (c_skip, c_out, c_in) = self.scalings(&sigma_b);
        self.inner.forward(&(x_t * c_in), sigma, cond, uncond, false) * c_out + x_t * c_skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    struct ZeroNetwork;

    impl ConditionalNetwork for ZeroNetwork {
        fn forward(&self, x: &Tensor, _: &Tensor, _: &Conditioning, _: bool, _: bool) -> Tensor {
            x.zeros_like()
        }
    }

    fn dummy_conditioning() -> Conditioning {
        let opts = (Kind::Float, Device::Cpu);
        Conditioning {
            obs: Tensor::zeros([2, 4, 3], opts),
            vel_cmd: Tensor::zeros([2, 3], opts),
            skill: Tensor::zeros([2, 1], opts),
        }
    }

    #[test]
    fn scalings_boundary_limits() {
        let sigma_data = 0.5;
        let denoiser = Denoiser::new(Box::new(ZeroNetwork), sigma_data);

        let tiny = Tensor::from_slice(&[1e-8f64]);
        let (c_skip, c_out, _) = denoiser.scalings(&tiny);
        let c_skip: f64 = c_skip.try_into().unwrap();
        let c_out: f64 = c_out.try_into().unwrap();
        assert!((c_skip - 1.).abs() < 1e-6, "c_skip -> 1 as sigma -> 0, got {c_skip}");
        assert!(c_out.abs() < 1e-6, "c_out -> 0 as sigma -> 0, got {c_out}");

        let huge = Tensor::from_slice(&[1e8f64]);
        let (c_skip, c_out, _) = denoiser.scalings(&huge);
        let c_skip: f64 = c_skip.try_into().unwrap();
        let c_out: f64 = c_out.try_into().unwrap();
        assert!(c_skip.abs() < 1e-6, "c_skip -> 0 as sigma -> inf, got {c_skip}");
        assert!((c_out - sigma_data).abs() < 1e-6, "c_out -> sigma_data, got {c_out}");
    }

    #[test]
    fn forward_of_zero_network_is_the_skip_branch() {
        tch::manual_seed(0);
        let denoiser = Denoiser::new(Box::new(ZeroNetwork), 0.5);
        let cond = dummy_conditioning();
        let x_t = Tensor::randn([2, 4, 6], (Kind::Float, Device::Cpu));
        let sigma = Tensor::from_slice(&[1f32, 2.]);
        let out = denoiser.forward(&x_t, &sigma, &cond, false);

        let sigma_b = crate::utils::append_dims(&sigma, 3);
        let (c_skip, _, _) = denoiser.scalings(&sigma_b);
        let err: f64 = (&out - &x_t * c_skip).abs().max().try_into().unwrap();
        assert!(err < 1e-6);
    }

    #[test]
    fn loss_is_finite_for_valid_sigmas() {
        tch::manual_seed(0);
        let denoiser = Denoiser::new(Box::new(ZeroNetwork), 0.5);
        let cond = dummy_conditioning();
        let x = Tensor::randn([2, 4, 6], (Kind::Float, Device::Cpu));
        let noise = Tensor::randn_like(&x);
        let sigma = Tensor::from_slice(&[0.05f32, 3.]);
        let loss: f64 = denoiser.loss(&x, &noise, &sigma, &cond).try_into().unwrap();
        assert!(loss.is_finite());
    }
}
