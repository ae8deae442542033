//! # Noise schedules
//!
//! Two distinct sigma distributions drive the diffusion process and must not
//! be confused: training draws one random noise level per example from a
//! truncated log-logistic density, while inference walks a deterministic
//! exponential ladder from `sigma_max` down to `sigma_min`.
//!
//! Elucidating the Design Space of Diffusion-Based Generative Models,
//! T. Karras et al., 2022. https://arxiv.org/abs/2206.00364

use tch::{Device, Kind, Tensor};

pub mod ddim;

/// The deterministic inference schedule: `n + 1` noise levels spaced as a
/// geometric progression in log-space, strictly decreasing from `sigma_max`
/// to `sigma_min`.
///
/// The spacing is exponential rather than linear because denoising error
/// accumulates multiplicatively at low sigma.
pub fn sigmas_exponential(n: usize, sigma_min: f64, sigma_max: f64, device: Device) -> Tensor {
    Tensor::linspace(sigma_max.ln(), sigma_min.ln(), n as i64 + 1, (Kind::Float, device)).exp()
}

/// Draws training noise levels from a log-logistic density truncated to
/// `[min_value, max_value]` by inverse-CDF sampling, one independent draw per
/// element of `shape`.
///
/// `loc` is typically `ln(sigma_data)` and `scale` 0.5. Sampling runs in f64
/// so the CDF endpoints stay exact near the truncation bounds.
pub fn rand_log_logistic(
    shape: &[i64],
    loc: f64,
    scale: f64,
    min_value: f64,
    max_value: f64,
    device: Device,
) -> Tensor {
    let cdf = |v: f64| {
        let z = (v.ln() - loc) / scale;
        1. / (1. + (-z).exp())
    };
    let (min_cdf, max_cdf) = (cdf(min_value), cdf(max_value));
    let u = Tensor::rand(shape, (Kind::Double, device)) * (max_cdf - min_cdf) + min_cdf;
    ((&u / (1f64 - &u)).log() * scale + loc).exp().to_kind(Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_endpoints_and_monotonicity() {
        let sigmas = sigmas_exponential(10, 0.001, 80., Device::Cpu);
        let sigmas = Vec::<f64>::try_from(sigmas).unwrap();
        assert_eq!(sigmas.len(), 11);
        assert!((sigmas[0] - 80.).abs() < 1e-4);
        assert!((sigmas[10] - 0.001).abs() < 1e-7);
        for w in sigmas.windows(2) {
            assert!(w[1] < w[0], "schedule must be strictly decreasing: {w:?}");
        }
    }

    #[test]
    fn log_logistic_draws_respect_truncation() {
        tch::manual_seed(0);
        let sigmas = rand_log_logistic(&[1000], 0.5f64.ln(), 0.5, 0.001, 80., Device::Cpu);
        let min: f64 = sigmas.min().try_into().unwrap();
        let max: f64 = sigmas.max().try_into().unwrap();
        assert!(min >= 0.001 && max <= 80., "out of range: [{min}, {max}]");
        assert_eq!(sigmas.size(), vec![1000]);
    }

    #[test]
    fn log_logistic_concentrates_around_loc() {
        tch::manual_seed(1);
        let sigmas = rand_log_logistic(&[4000], 0.5f64.ln(), 0.5, 0.001, 80., Device::Cpu);
        let median: f64 = sigmas.median().try_into().unwrap();
        assert!((median.ln() - 0.5f64.ln()).abs() < 0.1, "median {median}");
    }
}
