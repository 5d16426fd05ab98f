//! TOML config loading for the diffpolicy CLI.
//!
//! Deserializes `configs/policy.toml`, whose top-level keys and tables form a
//! [`PolicyConfig`] plus an optional `[train]` table, then merges training
//! settings with CLI overrides.

use std::path::Path;

use diffpolicy::training::trainer::TrainingConfig;
use diffpolicy::PolicyConfig;
use serde::Deserialize;

/// Top-level structure matching `configs/policy.toml`.
#[derive(Debug, Deserialize)]
pub struct PolicyToml {
    /// Model, scheduler and loss settings.
    #[serde(flatten)]
    pub policy: PolicyConfig,
    /// Training loop overrides.
    #[serde(default)]
    pub train: TrainOverrides,
}

/// Optional overrides for [`TrainingConfig`] fields.
#[derive(Debug, Default, Deserialize)]
pub struct TrainOverrides {
    pub lr: Option<f64>,
    pub min_lr: Option<f64>,
    pub backbone_lr_scale: Option<f64>,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub total_steps: Option<usize>,
    pub warmup_steps: Option<usize>,
    pub batch_size: Option<usize>,
    pub log_interval: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    pub checkpoint_dir: Option<String>,
    pub seed: Option<u64>,
}

/// Training flags given on the command line.
#[derive(Debug, Default)]
pub struct TrainCli {
    pub checkpoint_dir: Option<String>,
    pub total_steps: Option<usize>,
    pub lr: Option<f64>,
    pub batch_size: Option<usize>,
    pub seed: Option<u64>,
}

/// Parse a `PolicyToml` from TOML text and validate the policy part.
pub fn parse_policy_toml(contents: &str) -> anyhow::Result<PolicyToml> {
    let config: PolicyToml = toml::from_str(contents)?;
    config.policy.validate()?;
    Ok(config)
}

/// Load and deserialize a `PolicyToml` from a TOML file.
pub fn load_policy_toml(path: &Path) -> anyhow::Result<PolicyToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let config = parse_policy_toml(&contents)?;
    tracing::info!(
        path = %path.display(),
        rot_pred_type = %config.policy.action.rot_pred_type,
        "Loaded policy config"
    );
    Ok(config)
}

/// Build a `TrainingConfig` from defaults, TOML overrides, and CLI flags.
///
/// Priority chain: `TrainingConfig::new()` defaults < TOML values < CLI flags.
pub fn build_training_config(overrides: &TrainOverrides, cli: &TrainCli) -> TrainingConfig {
    let mut config = TrainingConfig::new();

    // Apply TOML overrides
    if let Some(v) = overrides.lr {
        config.lr = v;
    }
    if let Some(v) = overrides.min_lr {
        config.min_lr = v;
    }
    if let Some(v) = overrides.backbone_lr_scale {
        config.backbone_lr_scale = v;
    }
    if let Some(v) = overrides.weight_decay {
        config.weight_decay = v;
    }
    if let Some(v) = overrides.max_grad_norm {
        config.max_grad_norm = v;
    }
    if let Some(v) = overrides.total_steps {
        config.total_steps = v;
    }
    if let Some(v) = overrides.warmup_steps {
        config.warmup_steps = v;
    }
    if let Some(v) = overrides.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = overrides.log_interval {
        config.log_interval = v;
    }
    if let Some(v) = overrides.checkpoint_interval {
        config.checkpoint_interval = v;
    }
    if let Some(v) = &overrides.checkpoint_dir {
        config.checkpoint_dir = v.clone();
    }
    if overrides.seed.is_some() {
        config.seed = overrides.seed;
    }

    // CLI overrides take highest priority
    if let Some(v) = &cli.checkpoint_dir {
        config.checkpoint_dir = v.clone();
    }
    if let Some(v) = cli.total_steps {
        config.total_steps = v;
    }
    if let Some(v) = cli.lr {
        config.lr = v;
    }
    if let Some(v) = cli.batch_size {
        config.batch_size = v;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    config
}
