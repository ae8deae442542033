// Trains the diffusion locomotion policy on a recorded expert dataset.
//
// The dataset is a single .npz archive holding parallel 2-D arrays `obs`,
// `action`, `vel_cmd`, `skill` and `terminal`, each shaped
// (episodes-flattened, feature-dim). Run with e.g.:
//
//   cargo run --release --features cli --bin train -- --dataset data/expert.npz

use clap::Parser;
use locodiff::agent::{Agent, AgentConfig};
use locodiff::dataset::{load_dataset, DatasetConfig};
use locodiff::models::transformer::{DiffusionTransformer, DiffusionTransformerConfig};
use locodiff::utils::device_setup;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the expert dataset archive (.npz).
    #[arg(long, value_name = "FILE")]
    dataset: String,

    /// Directory where checkpoints are stored.
    #[arg(long, default_value = "runs")]
    output_dir: String,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// The number of gradient steps to run.
    #[arg(long, default_value_t = 100_000)]
    steps: usize,

    /// The number of denoising steps used at evaluation time.
    #[arg(long, default_value_t = 10)]
    n_sampling_steps: usize,

    /// Random seed.
    #[arg(long, default_value_t = 42)]
    seed: i64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    tch::manual_seed(args.seed);
    let device = device_setup(args.cpu);

    let agent_config = AgentConfig {
        max_train_steps: args.steps,
        num_sampling_steps: args.n_sampling_steps,
        ..Default::default()
    };
    let dataset_config = DatasetConfig {
        obs_dim: agent_config.obs_dim,
        t: agent_config.t,
        t_cond: agent_config.t_cond,
        ..Default::default()
    };
    let (train_loader, test_loader, scaler) =
        load_dataset(&args.dataset, &dataset_config, agent_config.pred_obs_dim, device)?;

    let net_config = DiffusionTransformerConfig {
        obs_dim: agent_config.obs_dim,
        pred_obs_dim: agent_config.pred_obs_dim,
        act_dim: agent_config.action_dim,
        t: agent_config.t,
        t_cond: agent_config.t_cond,
        cond_mask_prob: agent_config.cond_mask_prob,
        ..Default::default()
    };
    let mut agent = Agent::new(
        |vs| Box::new(DiffusionTransformer::new(vs, net_config)),
        train_loader,
        test_loader,
        scaler,
        agent_config,
        device,
    )?;
    agent.train_agent(None, std::path::Path::new(&args.output_dir))
}
