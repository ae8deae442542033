//! # Min-max scaling
//!
//! Maps observations, prediction targets and velocity commands between
//! physical units and the bounded network space `[-1, 1]`.

use std::path::Path;
use tch::{Device, Tensor};

// Constant features would otherwise divide by zero.
const MIN_RANGE: f64 = 1e-12;

/// Per-feature min/max statistics for the observation, output and command
/// spaces, fitted once on the training split.
///
/// The statistics are part of the model's serialized state: they are stored
/// next to the network weights and must not be mutated once fitted, otherwise
/// a loaded checkpoint decodes to the wrong physical units.
#[derive(Debug)]
pub struct MinMaxScaler {
    x_min: Tensor,
    x_max: Tensor,
    y_min: Tensor,
    y_max: Tensor,
    cmd_min: Tensor,
    cmd_max: Tensor,
}

impl MinMaxScaler {
    /// Fits the statistics on flattened `(num_steps, feature_dim)` training
    /// data: observations, prediction targets and velocity commands.
    pub fn fit(x_data: &Tensor, y_data: &Tensor, cmd_data: &Tensor) -> Self {
        let (x_min, _) = x_data.min_dim(0, false);
        let (x_max, _) = x_data.max_dim(0, false);
        let (y_min, _) = y_data.min_dim(0, false);
        let (y_max, _) = y_data.max_dim(0, false);
        let (cmd_min, _) = cmd_data.min_dim(0, false);
        let (cmd_max, _) = cmd_data.max_dim(0, false);
        Self { x_min, x_max, y_min, y_max, cmd_min, cmd_max }
    }

    fn scale(xs: &Tensor, min: &Tensor, max: &Tensor) -> Tensor {
        (xs - min) / (max - min).clamp_min(MIN_RANGE) * 2. - 1.
    }

    /// Scales raw observations to `[-1, 1]`.
    pub fn scale_input(&self, xs: &Tensor) -> Tensor {
        Self::scale(xs, &self.x_min, &self.x_max)
    }

    /// Scales raw prediction targets (state slice + action) to `[-1, 1]`.
    pub fn scale_output(&self, ys: &Tensor) -> Tensor {
        Self::scale(ys, &self.y_min, &self.y_max)
    }

    /// Scales raw velocity commands to `[-1, 1]`.
    pub fn scale_command(&self, cmds: &Tensor) -> Tensor {
        Self::scale(cmds, &self.cmd_min, &self.cmd_max)
    }

    /// Exact inverse of [`Self::scale_output`] for values inside the fitted
    /// range. Outside it the round-trip is only approximate because of
    /// [`Self::clip`], which is intentional.
    pub fn inverse_scale_output(&self, ys: &Tensor) -> Tensor {
        (ys + 1.) / 2. * (&self.y_max - &self.y_min).clamp_min(MIN_RANGE) + &self.y_min
    }

    /// Clamps sampled outputs to the valid scaled range before inversion, so
    /// sampler overshoot cannot decode to out-of-distribution physical values.
    pub fn clip(&self, ys: &Tensor) -> Tensor {
        ys.clamp(-1., 1.)
    }

    /// Persists the six statistics tensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        Tensor::save_multi(
            &[
                ("x_min", &self.x_min),
                ("x_max", &self.x_max),
                ("y_min", &self.y_min),
                ("y_max", &self.y_max),
                ("cmd_min", &self.cmd_min),
                ("cmd_max", &self.cmd_max),
            ],
            path.as_ref(),
        )?;
        Ok(())
    }

    /// Restores statistics saved by [`Self::save`].
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> anyhow::Result<Self> {
        let named = Tensor::load_multi_with_device(path.as_ref(), device)?;
        let lookup = |name: &str| -> anyhow::Result<Tensor> {
            named
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.shallow_clone())
                .ok_or_else(|| anyhow::anyhow!("tensor {name} missing from scaler file"))
        };
        Ok(Self {
            x_min: lookup("x_min")?,
            x_max: lookup("x_max")?,
            y_min: lookup("y_min")?,
            y_max: lookup("y_max")?,
            cmd_min: lookup("cmd_min")?,
            cmd_max: lookup("cmd_max")?,
        })
    }
}
