//! # Expert dataset
//!
//! Loads recorded expert trajectories from an `.npz` archive holding parallel
//! 2-D arrays (`obs`, `action`, `vel_cmd`, `skill`, `terminal`), recovers
//! episode boundaries from the terminal flags, and serves shuffled windows of
//! `t_cond + t` consecutive steps.
//!
//! Episodes are zero-padded: trailing padding makes all episodes the same
//! length, and `t_cond - 1` zero rows are prepended so windows that begin at
//! an episode start see the same cold-start history the policy sees at
//! deployment. The prepended padding is deliberately left visible to the
//! network rather than masked.

use crate::scaler::MinMaxScaler;
use std::path::Path;
use std::rc::Rc;
use tch::{Device, IndexOp, Kind, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("array {0} missing from the dataset archive")]
    MissingArray(&'static str),
    #[error("array {name} has {rows} rows but {expected} were expected")]
    RowCountMismatch { name: &'static str, rows: i64, expected: i64 },
    #[error("dataset contains no episodes")]
    NoEpisodes,
    #[error("no episode is long enough for a window of {0} steps")]
    NoWindows(i64),
}

/// The configuration for dataset loading.
#[derive(Debug, Clone, Copy)]
pub struct DatasetConfig {
    /// Observations are truncated to this many leading features.
    pub obs_dim: i64,
    /// Prediction horizon length.
    pub t: i64,
    /// Observation-history length.
    pub t_cond: i64,
    /// Fraction of episodes used for training; the rest form the test split.
    pub train_fraction: f64,
    pub train_batch_size: i64,
    pub test_batch_size: i64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            obs_dim: 33,
            t: 8,
            t_cond: 4,
            train_fraction: 0.9,
            train_batch_size: 256,
            test_batch_size: 256,
        }
    }
}

/// Expert trajectories, padded per episode.
///
/// Temporal tensors are `(episodes, t_cond - 1 + max_len, dim)`; the velocity
/// command and skill are one row per episode since they are constant within
/// an episode. `lengths` counts the valid rows of each episode including the
/// prepended padding.
#[derive(Debug)]
pub struct ExpertDataset {
    obs: Tensor,
    action: Tensor,
    vel_cmd: Tensor,
    skill: Tensor,
    lengths: Vec<i64>,
}

fn named_tensor(archive: &[(String, Tensor)], name: &'static str) -> Result<Tensor, DatasetError> {
    archive
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, t)| t.to_kind(Kind::Float))
        .ok_or(DatasetError::MissingArray(name))
}

/// Splits flattened rows into episodes: a terminal flag of one marks the last
/// step of an episode, and any trailing rows after the final flag form one
/// more (truncated) episode.
fn episode_ranges(terminals: &[f32]) -> Vec<(i64, i64)> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    for (i, &flag) in terminals.iter().enumerate() {
        if flag >= 0.5 {
            ranges.push((start as i64, (i + 1) as i64));
            start = i + 1;
        }
    }
    if start < terminals.len() {
        ranges.push((start as i64, terminals.len() as i64));
    }
    ranges
}

impl ExpertDataset {
    /// Loads and episode-splits an `.npz` archive.
    pub fn load<P: AsRef<Path>>(
        path: P,
        config: &DatasetConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let archive = Tensor::read_npz(path.as_ref())?;
        let obs = named_tensor(&archive, "obs")?;
        let action = named_tensor(&archive, "action")?;
        let vel_cmd = named_tensor(&archive, "vel_cmd")?;
        let skill = named_tensor(&archive, "skill")?;
        let terminal = named_tensor(&archive, "terminal")?;

        let num_rows = obs.size()[0];
        for (name, tensor) in
            [("action", &action), ("vel_cmd", &vel_cmd), ("skill", &skill), ("terminal", &terminal)]
        {
            let rows = tensor.size()[0];
            if rows != num_rows {
                return Err(DatasetError::RowCountMismatch { name, rows, expected: num_rows }.into());
            }
        }
        let obs = obs.narrow(1, 0, config.obs_dim.min(obs.size()[1]));

        let terminals = Vec::<f32>::try_from(terminal.reshape([-1]))?;
        let ranges = episode_ranges(&terminals);
        if ranges.is_empty() {
            return Err(DatasetError::NoEpisodes.into());
        }
        let max_len = ranges.iter().map(|(s, e)| e - s).max().unwrap_or(0);
        let prepad = config.t_cond - 1;

        let pad_episodes = |rows: &Tensor| -> Tensor {
            let dim = rows.size()[1];
            let mut episodes = Vec::with_capacity(ranges.len());
            for &(start, end) in ranges.iter() {
                let padded = Tensor::zeros([prepad + max_len, dim], (Kind::Float, Device::Cpu));
                let _ = padded.narrow(0, prepad, end - start).copy_(&rows.i(start..end));
                episodes.push(padded);
            }
            Tensor::stack(&episodes, 0)
        };

        let lengths = ranges.iter().map(|(s, e)| prepad + e - s).collect();
        let per_episode = |rows: &Tensor| -> Tensor {
            let firsts: Vec<Tensor> = ranges.iter().map(|&(start, _)| rows.get(start)).collect();
            Tensor::stack(&firsts, 0)
        };

        tracing::info!(
            episodes = ranges.len(),
            max_len,
            obs_dim = obs.size()[1],
            act_dim = action.size()[1],
            "dataset loaded"
        );

        Ok(Self {
            obs: pad_episodes(&obs).to_device(device),
            action: pad_episodes(&action).to_device(device),
            vel_cmd: per_episode(&vel_cmd).to_device(device),
            skill: per_episode(&skill).to_device(device),
            lengths,
        })
    }

    pub fn num_episodes(&self) -> usize {
        self.lengths.len()
    }

    /// The valid observation rows of the given episodes, concatenated.
    pub fn observations(&self, episodes: &[i64]) -> Tensor {
        let rows: Vec<Tensor> =
            episodes.iter().map(|&e| self.obs.i((e, 0..self.lengths[e as usize], ..))).collect();
        Tensor::cat(&rows, 0)
    }

    /// The valid `[state slice | action]` rows of the given episodes,
    /// concatenated; this is the space the diffusion target lives in.
    pub fn targets(&self, episodes: &[i64], pred_obs_dim: i64) -> Tensor {
        let rows: Vec<Tensor> = episodes
            .iter()
            .map(|&e| {
                let len = self.lengths[e as usize];
                let state = self.obs.i((e, 0..len, 0..pred_obs_dim));
                let action = self.action.i((e, 0..len, ..));
                Tensor::cat(&[state, action], -1)
            })
            .collect();
        Tensor::cat(&rows, 0)
    }

    /// One velocity-command row per given episode.
    pub fn commands(&self, episodes: &[i64]) -> Tensor {
        let rows: Vec<Tensor> = episodes.iter().map(|&e| self.vel_cmd.get(e)).collect();
        Tensor::stack(&rows, 0)
    }
}

/// One shuffled batch of raw (unscaled) trajectory windows.
#[derive(Debug)]
pub struct TrajectoryBatch {
    /// `(batch, t_cond + t, obs_dim)`
    pub obs: Tensor,
    /// `(batch, t_cond + t, act_dim)`
    pub action: Tensor,
    /// `(batch, cmd_dim)`
    pub vel_cmd: Tensor,
    /// `(batch, skill_dim)`
    pub skill: Tensor,
}

/// Serves fixed-length windows over a subset of episodes.
///
/// `next_batch` shuffles lazily and restarts transparently once the epoch is
/// exhausted, so training can run for an arbitrary number of steps;
/// `batch` gives deterministic access for evaluation epochs.
#[derive(Debug)]
pub struct DataLoader {
    data: Rc<ExpertDataset>,
    windows: Vec<(i64, i64)>,
    window_len: i64,
    batch_size: i64,
    order: Vec<i64>,
    cursor: usize,
}

impl DataLoader {
    fn new(
        data: Rc<ExpertDataset>,
        episodes: &[i64],
        window_len: i64,
        batch_size: i64,
    ) -> Result<Self, DatasetError> {
        let mut windows = Vec::new();
        for &e in episodes {
            let length = data.lengths[e as usize];
            if length >= window_len {
                for start in 0..=(length - window_len) {
                    windows.push((e, start));
                }
            }
        }
        if windows.is_empty() {
            return Err(DatasetError::NoWindows(window_len));
        }
        Ok(Self { data, windows, window_len, batch_size, order: Vec::new(), cursor: 0 })
    }

    pub fn num_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn num_batches(&self) -> usize {
        (self.windows.len() + self.batch_size as usize - 1) / self.batch_size as usize
    }

    fn gather(&self, indices: impl Iterator<Item = i64>) -> TrajectoryBatch {
        let mut obs = Vec::new();
        let mut action = Vec::new();
        let mut vel_cmd = Vec::new();
        let mut skill = Vec::new();
        for i in indices {
            let (e, start) = self.windows[i as usize];
            obs.push(self.data.obs.i((e, start..start + self.window_len, ..)));
            action.push(self.data.action.i((e, start..start + self.window_len, ..)));
            vel_cmd.push(self.data.vel_cmd.get(e));
            skill.push(self.data.skill.get(e));
        }
        TrajectoryBatch {
            obs: Tensor::stack(&obs, 0),
            action: Tensor::stack(&action, 0),
            vel_cmd: Tensor::stack(&vel_cmd, 0),
            skill: Tensor::stack(&skill, 0),
        }
    }

    /// The `index`-th batch in window order, for evaluation passes.
    pub fn batch(&self, index: usize) -> TrajectoryBatch {
        let start = index * self.batch_size as usize;
        let end = (start + self.batch_size as usize).min(self.windows.len());
        self.gather(start as i64..end as i64)
    }

    /// The next shuffled training batch; reshuffles and restarts once all
    /// windows have been served.
    pub fn next_batch(&mut self) -> TrajectoryBatch {
        if self.cursor >= self.order.len() {
            let perm = Tensor::randperm(self.windows.len() as i64, (Kind::Int64, Device::Cpu));
            self.order = Vec::<i64>::try_from(perm).unwrap();
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size as usize).min(self.order.len());
        let indices: Vec<i64> = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        self.gather(indices.into_iter())
    }
}

/// Loads the dataset, splits episodes into train/test, fits the scaler on the
/// training split and builds both loaders.
pub fn load_dataset<P: AsRef<Path>>(
    path: P,
    config: &DatasetConfig,
    pred_obs_dim: i64,
    device: Device,
) -> anyhow::Result<(DataLoader, DataLoader, MinMaxScaler)> {
    let data = Rc::new(ExpertDataset::load(path, config, device)?);
    let num_episodes = data.num_episodes() as i64;

    let perm = Tensor::randperm(num_episodes, (Kind::Int64, Device::Cpu));
    let perm = Vec::<i64>::try_from(perm)?;
    let num_train = ((num_episodes as f64 * config.train_fraction).round() as i64)
        .clamp(1, (num_episodes - 1).max(1));
    let train_eps: Vec<i64> = perm[..num_train as usize].to_vec();
    let test_eps: Vec<i64> =
        if num_episodes > 1 { perm[num_train as usize..].to_vec() } else { perm.clone() };

    let scaler = MinMaxScaler::fit(
        &data.observations(&train_eps),
        &data.targets(&train_eps, pred_obs_dim),
        &data.commands(&train_eps),
    );

    let window_len = config.t_cond + config.t;
    let train_loader =
        DataLoader::new(data.clone(), &train_eps, window_len, config.train_batch_size)?;
    let test_loader = DataLoader::new(data, &test_eps, window_len, config.test_batch_size)?;
    tracing::info!(
        train_windows = train_loader.num_windows(),
        test_windows = test_loader.num_windows(),
        "dataset split"
    );
    Ok((train_loader, test_loader, scaler))
}
