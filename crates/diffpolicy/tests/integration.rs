//! Integration tests for the diffusion policy crate.
//!
//! These tests exercise cross-module interactions: batch -> context ->
//! backbone -> scheduler -> action assembly, the backbone cache lifecycle
//! observed through an instrumented backbone, and a short training run with a
//! checkpoint round trip. All use the NdArray backend and synthetic data.

use std::cell::{Cell, RefCell};

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use diffpolicy::batch::{repeat_rows, ObservationBatch, Offsets, PointBatch, PointFeatures};
use diffpolicy::config::{PolicyConfig, RotPredType};
use diffpolicy::model::bridge::{tensor_to_rows, tensor_to_vec};
use diffpolicy::model::{
    PointBackbone, PointMlpBackbone, PointMlpBackboneConfig, PointMlpCache,
    SinusoidalTimestepEmbedding,
};
use diffpolicy::training::data::SyntheticSampler;
use diffpolicy::training::trainer::{resume_from_checkpoint, train, TrainingConfig};
use diffpolicy::{
    DdpmScheduler, DiffusionPolicy, InferenceMode, PolicyError, ACTION_WIDTH, DATASET_ACTION_WIDTH,
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

fn small_config() -> PolicyConfig {
    let mut config = PolicyConfig::default();
    config.action.txt_ft_size = 8;
    config.action.context_channels = 8;
    config.backbone.enc_channels = vec![8];
    config.backbone.hidden_size = 8;
    config.diffusion.total_timesteps = 10;
    config
}

/// Two samples with 5 and 7 points, 1 and 2 text tokens, all features zero.
fn zero_batch(device: &<TestBackend as Backend>::Device) -> ObservationBatch<TestBackend> {
    let poses = vec![
        0.1, 0.2, 0.3, 0.0, 0.0, 0.0, 1.0, 1.0, //
        -0.1, 0.0, 0.4, 0.0, 0.0, 0.7071068, 0.7071068, 0.0,
    ];
    ObservationBatch {
        pc_fts: Tensor::zeros([12, 6], device),
        offset: Offsets::from_counts(&[5, 7]).unwrap(),
        txt_embeds: Tensor::zeros([3, 8], device),
        txt_lens: vec![1, 2],
        ee_poses: Some(Tensor::from_data(TensorData::new(poses, [2, 8]), device)),
        step_ids: None,
        gt_actions: None,
    }
}

#[test]
fn test_end_to_end_actions_from_zero_features() {
    let device = Default::default();
    TestBackend::seed(0);
    let mut config = small_config();
    config.mini_batches = 1;
    config.action.rot_pred_type = RotPredType::Quat;
    let mut policy = DiffusionPolicy::<TestBackend, _, _>::reference(config, &device).unwrap();

    let actions = policy
        .forward_n_steps(&zero_batch(&device), InferenceMode::Deploy)
        .unwrap();
    assert_eq!(actions.dims(), [2, ACTION_WIDTH]);

    for row in tensor_to_rows::<TestBackend, ACTION_WIDTH>(actions).unwrap() {
        let norm = row[3..7].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "quaternion norm {norm}");
        assert!(row[7].is_finite(), "openness logit {}", row[7]);
        assert!(row[..3].iter().all(|v| v.is_finite()));
    }
}

/// Backbone observation recorded by [`InstrumentedBackbone`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum BackboneCall {
    Train { samples: usize, anchors: usize },
    Inference { samples: usize },
    Neck { samples: usize, points: usize },
    Clear,
}

/// Reference backbone that records every call made through the trait.
struct InstrumentedBackbone {
    inner: PointMlpBackbone<TestBackend>,
    calls: RefCell<Vec<BackboneCall>>,
    /// Fail every neck call once this many have succeeded.
    fail_neck_after: Cell<Option<usize>>,
    /// Anchor batch of the most recent training call.
    last_anchor: RefCell<Option<PointBatch<TestBackend>>>,
}

impl PointBackbone<TestBackend> for InstrumentedBackbone {
    type Cache = PointMlpCache<TestBackend>;

    fn forward_train(
        &self,
        primary: &PointBatch<TestBackend>,
        anchor: &PointBatch<TestBackend>,
    ) -> diffpolicy::Result<(Vec<PointFeatures<TestBackend>>, PointFeatures<TestBackend>)> {
        self.calls.borrow_mut().push(BackboneCall::Train {
            samples: primary.offset.num_samples(),
            anchors: anchor.num_points(),
        });
        *self.last_anchor.borrow_mut() = Some(anchor.clone());
        self.inner.forward_train(primary, anchor)
    }

    fn forward_inference(
        &self,
        primary: &PointBatch<TestBackend>,
    ) -> diffpolicy::Result<(Vec<PointFeatures<TestBackend>>, Self::Cache)> {
        self.calls.borrow_mut().push(BackboneCall::Inference {
            samples: primary.offset.num_samples(),
        });
        self.inner.forward_inference(primary)
    }

    fn neck_inference(
        &self,
        cache: &Self::Cache,
        anchor: &PointBatch<TestBackend>,
    ) -> diffpolicy::Result<PointFeatures<TestBackend>> {
        let done = self
            .calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, BackboneCall::Neck { .. }))
            .count();
        self.calls.borrow_mut().push(BackboneCall::Neck {
            samples: anchor.offset.num_samples(),
            points: anchor.num_points(),
        });
        if self.fail_neck_after.get().is_some_and(|n| done >= n) {
            return Err(PolicyError::MalformedBatch("injected neck failure".into()));
        }
        self.inner.neck_inference(cache, anchor)
    }

    fn clear_cache(&self, cache: Self::Cache) {
        self.calls.borrow_mut().push(BackboneCall::Clear);
        self.inner.clear_cache(cache);
    }

    fn num_params(&self) -> usize {
        PointBackbone::num_params(&self.inner)
    }
}

fn instrumented_policy(
    config: &PolicyConfig,
    device: &<TestBackend as Backend>::Device,
) -> DiffusionPolicy<TestBackend, InstrumentedBackbone, DdpmScheduler> {
    let inner = PointMlpBackboneConfig::new(config.backbone.in_channels, config.action.context_channels)
        .with_enc_channels(config.backbone.enc_channels.clone())
        .with_hidden_size(config.backbone.hidden_size)
        .init(device);
    let backbone = InstrumentedBackbone {
        inner,
        calls: RefCell::new(Vec::new()),
        fail_neck_after: Cell::new(None),
        last_anchor: RefCell::new(None),
    };
    let scheduler = DdpmScheduler::new(&config.diffusion).unwrap();
    DiffusionPolicy::new(config.clone(), backbone, scheduler, device).unwrap()
}

#[test]
fn test_cache_lifecycle_during_inference() {
    let device = Default::default();
    let mut config = small_config();
    config.diffusion.inference_steps = Some(4);
    let mut policy = instrumented_policy(&config, &device);

    policy
        .forward_n_steps(&zero_batch(&device), InferenceMode::Deploy)
        .unwrap();

    let calls = policy.backbone().calls.borrow().clone();
    assert_eq!(calls.first(), Some(&BackboneCall::Inference { samples: 2 }));
    assert_eq!(calls.last(), Some(&BackboneCall::Clear));
    assert_eq!(calls.iter().filter(|c| **c == BackboneCall::Clear).count(), 1);
    let necks: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, BackboneCall::Neck { .. }))
        .collect();
    assert_eq!(necks.len(), 4);
    assert!(necks
        .iter()
        .all(|c| **c == BackboneCall::Neck { samples: 2, points: 2 }));
}

#[test]
fn test_training_replicates_anchors_per_sample() {
    let device = Default::default();
    let mut config = small_config();
    config.mini_batches = 3;
    let policy = instrumented_policy(&config, &device);
    let mut rng = StdRng::seed_from_u64(8);
    let batch = SyntheticSampler::new(&config)
        .unwrap()
        .sample_batch::<TestBackend>(4, &mut rng, &device)
        .unwrap();

    let (action, losses) = policy.forward_train(&batch, &mut rng).unwrap();
    assert!(action.is_none());
    assert!(losses.values().is_finite());
    assert_eq!(
        policy.backbone().calls.borrow().as_slice(),
        &[BackboneCall::Train { samples: 4, anchors: 12 }]
    );
}

#[test]
fn test_training_context_rows_follow_their_sample() {
    let device = Default::default();
    let k = 3;
    let mut config = small_config();
    config.mini_batches = k;
    let policy = instrumented_policy(&config, &device);
    let mut rng = StdRng::seed_from_u64(17);
    let mut batch = SyntheticSampler::new(&config)
        .unwrap()
        .sample_batch::<TestBackend>(4, &mut rng, &device)
        .unwrap();
    let b = batch.num_samples();

    // Every token of sample s carries a value unique to s.
    let token_sample = Offsets::from_counts(&batch.txt_lens).unwrap().batch_index();
    let txt: Vec<f32> = token_sample
        .iter()
        .flat_map(|&s| (0..8).map(move |c| (s as f32 + 1.0) * 0.5 + c as f32 * 0.01))
        .collect();
    batch.txt_embeds = Tensor::from_data(TensorData::new(txt, [token_sample.len(), 8]), &device);

    let pooled_tensor = policy.net().context.pooled_context(&batch).unwrap();
    let pooled = tensor_to_rows::<TestBackend, 8>(pooled_tensor.clone()).unwrap();
    for pair in pooled.windows(2) {
        assert_ne!(pair[0], pair[1], "samples must pool to distinct context rows");
    }
    let replicated = tensor_to_rows::<TestBackend, 8>(repeat_rows(pooled_tensor, k)).unwrap();
    assert_eq!(replicated.len(), b * k);
    for (row, values) in replicated.iter().enumerate() {
        assert_eq!(values, &pooled[row / k], "context row {row}");
    }

    let gt_pos = batch.gt_actions.clone().unwrap().slice([0..b, 0..3]);
    let gt_rows = tensor_to_rows::<TestBackend, 3>(gt_pos.clone()).unwrap();
    let gt_rep = tensor_to_rows::<TestBackend, 3>(repeat_rows(gt_pos, k)).unwrap();
    for (row, values) in gt_rep.iter().enumerate() {
        assert_eq!(values, &gt_rows[row / k], "target row {row}");
    }

    // Timesteps are the first draws forward_train makes from its rng.
    let mut replay = rng.clone();
    let total = config.diffusion.total_timesteps;
    let timesteps: Vec<usize> = (0..b * k).map(|_| replay.gen_range(0..total)).collect();
    policy.forward_train(&batch, &mut rng).unwrap();

    let anchor = policy.backbone().last_anchor.borrow().clone().unwrap();
    let expected_owner: Vec<i64> = (0..b * k).map(|row| (row / k) as i64).collect();
    assert_eq!(anchor.offset.batch_index(), expected_owner);
    let temb = SinusoidalTimestepEmbedding::new(8).embed_steps::<TestBackend>(&timesteps, &device);
    let anchor_ctx = tensor_to_rows::<TestBackend, 8>(anchor.context.unwrap() - temb).unwrap();
    for (row, values) in anchor_ctx.iter().enumerate() {
        for (got, want) in values.iter().zip(&pooled[row / k]) {
            assert!((got - want).abs() < 1e-5, "anchor {row}: {got} vs {want}");
        }
    }
}

#[test]
fn test_cache_released_when_denoising_fails() {
    let device = Default::default();
    let mut config = small_config();
    config.diffusion.inference_steps = Some(3);
    let mut policy = instrumented_policy(&config, &device);
    policy.backbone().fail_neck_after.set(Some(1));

    let result = policy.forward_n_steps(&zero_batch(&device), InferenceMode::Deploy);
    assert!(matches!(result, Err(PolicyError::MalformedBatch(_))));

    let calls = policy.backbone().calls.borrow().clone();
    assert_eq!(calls.last(), Some(&BackboneCall::Clear));
    assert_eq!(calls.iter().filter(|c| **c == BackboneCall::Clear).count(), 1);
    assert_eq!(
        calls.iter().filter(|c| matches!(c, BackboneCall::Neck { .. })).count(),
        2
    );
}

#[test]
fn test_dataset_inspection_appends_conditioned_rotation() {
    let device = Default::default();
    let config = small_config();
    let mut policy = DiffusionPolicy::<TestBackend, _, _>::reference(config.clone(), &device).unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let batch = SyntheticSampler::new(&config)
        .unwrap()
        .sample_batch::<TestBackend>(2, &mut rng, &device)
        .unwrap();

    let actions = policy
        .forward_n_steps(&batch, InferenceMode::DatasetInspection)
        .unwrap();
    assert_eq!(actions.dims(), [2, DATASET_ACTION_WIDTH]);
    for row in tensor_to_rows::<TestBackend, DATASET_ACTION_WIDTH>(actions).unwrap() {
        let norm = row[8..12].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "ground-truth conditioned quaternion norm {norm}");
        assert!(row[12].is_finite());
    }
}

/// Denoise head output for a fixed input, to compare weights across runs.
fn denoise_output<B: Backend, N: PointBackbone<B>>(policy: &DiffusionPolicy<B, N>) -> Vec<f32> {
    let device = Default::default();
    let input = Tensor::<B, 2>::from_data(
        TensorData::new((0..16).map(|i| i as f32 / 16.0).collect::<Vec<_>>(), [2, 8]),
        &device,
    );
    tensor_to_vec(policy.net().head.denoise(input)).unwrap()
}

#[test]
fn test_training_updates_and_checkpoint_round_trip() {
    let device = Default::default();
    let tmp = TempDir::new().unwrap();
    let config = small_config();
    let policy = DiffusionPolicy::<TestAutodiffBackend, _, _>::reference(config.clone(), &device).unwrap();
    let before = denoise_output(&policy);

    let train_config = TrainingConfig::new()
        .with_lr(1e-2)
        .with_total_steps(4)
        .with_warmup_steps(1)
        .with_batch_size(2)
        .with_log_interval(1)
        .with_checkpoint_interval(2)
        .with_checkpoint_dir(tmp.path().to_string_lossy().into_owned())
        .with_seed(Some(13));
    let sampler = SyntheticSampler::new(&config).unwrap().with_points(8, 12);
    let trained = train(&train_config, policy, &sampler, &device, None).unwrap();
    let after = denoise_output(&trained);
    assert_ne!(before, after, "optimizer step left the denoise head unchanged");

    let final_dir = tmp.path().join("final");
    assert!(final_dir.join("meta.json").exists());
    assert!(tmp.path().join("step_2").join("meta.json").exists());

    let loaded = resume_from_checkpoint::<TestAutodiffBackend>(&final_dir, &config, &device).unwrap();
    let reloaded = denoise_output(&loaded);
    for (a, b) in after.iter().zip(&reloaded) {
        assert!((a - b).abs() < 1e-6, "loaded weights differ: {a} vs {b}");
    }
}

#[test]
fn test_training_resumes_from_step_checkpoint() {
    let device = Default::default();
    let tmp = TempDir::new().unwrap();
    let config = small_config();
    let sampler = SyntheticSampler::new(&config).unwrap().with_points(8, 12);
    let train_config = TrainingConfig::new()
        .with_total_steps(3)
        .with_warmup_steps(0)
        .with_batch_size(2)
        .with_checkpoint_interval(1)
        .with_checkpoint_dir(tmp.path().to_string_lossy().into_owned())
        .with_seed(Some(1));
    let policy = DiffusionPolicy::<TestAutodiffBackend, _, _>::reference(config.clone(), &device).unwrap();
    train(&train_config, policy, &sampler, &device, None).unwrap();

    let step_dir = tmp.path().join("step_1");
    let resumed = resume_from_checkpoint::<TestAutodiffBackend>(&step_dir, &config, &device).unwrap();
    let longer = train_config.clone().with_total_steps(5);
    train(&longer, resumed, &sampler, &device, Some(1)).unwrap();

    let meta: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(tmp.path().join("final/meta.json")).unwrap()).unwrap();
    assert_eq!(meta["step"], 5);
}
