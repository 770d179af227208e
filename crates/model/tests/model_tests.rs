use std::collections::HashMap;

use anyhow::Result;
use attention::AttentionKind;
use candle_core::{DType, Device, Tensor};
use model::{DecodeState, Model, ModelConfig, WeightLoadError, WeightMap};

fn build_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        context_length: 32,
        hidden_dim: 8,
        intermediate_size: 16,
        n_layers: 2,
        n_heads: 2,
        n_kv_groups: 1,
        head_dim: 4,
        layer_types: vec![AttentionKind::Sliding, AttentionKind::Full],
        sliding_window: 2,
        rope_local_base: 10_000.0,
        rope_base: 1_000_000.0,
        norm_eps: 1e-6,
        query_pre_attn_scalar: None,
        qk_norm: true,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

fn ids(device: &Device, tokens: &[i64]) -> Result<Tensor> {
    Ok(Tensor::from_slice(tokens, (1, tokens.len()), device)?)
}

fn assert_all_finite(logits: &Tensor) -> Result<()> {
    let values = logits.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}

fn max_row_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()?)
}

/// Random tensors for every name the loader expects.
fn weight_tensors(cfg: &ModelConfig) -> Result<HashMap<String, Tensor>> {
    let device = &cfg.device;
    let q_dim = cfg.n_heads * cfg.head_dim;
    let kv_dim = cfg.n_kv_groups * cfg.head_dim;
    let mut map = HashMap::new();

    let add = |map: &mut HashMap<String, Tensor>, name: String, dims: Vec<usize>| -> Result<()> {
        map.insert(name, Tensor::randn(0f32, 0.05, dims, device)?);
        Ok(())
    };

    add(&mut map, "token_embd.weight".into(), vec![cfg.vocab_size, cfg.hidden_dim])?;
    add(&mut map, "output_norm.weight".into(), vec![cfg.hidden_dim])?;
    for layer in 0..cfg.n_layers {
        let p = format!("blk.{layer}");
        add(&mut map, format!("{p}.attn_q.weight"), vec![q_dim, cfg.hidden_dim])?;
        add(&mut map, format!("{p}.attn_k.weight"), vec![kv_dim, cfg.hidden_dim])?;
        add(&mut map, format!("{p}.attn_v.weight"), vec![kv_dim, cfg.hidden_dim])?;
        add(&mut map, format!("{p}.attn_output.weight"), vec![cfg.hidden_dim, q_dim])?;
        add(&mut map, format!("{p}.attn_q_norm.weight"), vec![cfg.head_dim])?;
        add(&mut map, format!("{p}.attn_k_norm.weight"), vec![cfg.head_dim])?;
        add(&mut map, format!("{p}.attn_norm.weight"), vec![cfg.hidden_dim])?;
        add(&mut map, format!("{p}.post_attention_norm.weight"), vec![cfg.hidden_dim])?;
        add(&mut map, format!("{p}.ffn_norm.weight"), vec![cfg.hidden_dim])?;
        add(&mut map, format!("{p}.post_ffw_norm.weight"), vec![cfg.hidden_dim])?;
        add(&mut map, format!("{p}.ffn_gate.weight"), vec![cfg.intermediate_size, cfg.hidden_dim])?;
        add(&mut map, format!("{p}.ffn_up.weight"), vec![cfg.intermediate_size, cfg.hidden_dim])?;
        add(&mut map, format!("{p}.ffn_down.weight"), vec![cfg.hidden_dim, cfg.intermediate_size])?;
    }
    Ok(map)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = Model::new(build_config())?;
    let token_ids = Tensor::from_slice(&[0i64, 1, 2, 3, 4, 5], (2, 3), &Device::Cpu)?;

    let logits = model.forward(&token_ids)?;

    assert_eq!(logits.dims(), &[2, 3, 16]);
    assert_eq!(logits.dtype(), DType::F32);
    assert_all_finite(&logits)
}

#[test]
fn construction_rejects_invalid_configurations() {
    let mut cfg = build_config();
    cfg.layer_types.pop();
    assert!(Model::new(cfg).is_err());

    let mut cfg = build_config();
    cfg.n_heads = 3;
    assert!(Model::new(cfg).is_err());

    let mut cfg = build_config();
    cfg.head_dim = 5;
    assert!(Model::new(cfg).is_err());
}

#[test]
fn chunked_incremental_decode_matches_the_full_pass() -> Result<()> {
    let device = Device::Cpu;
    let model = Model::new(build_config())?;

    let full = model.forward(&ids(&device, &[3, 7, 1, 9])?)?;
    assert_eq!(full.dims(), &[1, 4, 16]);
    assert_all_finite(&full)?;

    let mut state = model.new_state();
    model.forward_with_state(&ids(&device, &[3, 7])?, &mut state)?;
    model.forward_with_state(&ids(&device, &[1])?, &mut state)?;
    let last = model.forward_with_state(&ids(&device, &[9])?, &mut state)?;

    assert_eq!(last.dims(), &[1, 1, 16]);
    let expected = full.narrow(1, 3, 1)?;
    let diff = max_row_diff(&last, &expected)?;
    assert!(diff < 1e-3, "final row diverged by {diff}");
    Ok(())
}

#[test]
fn token_by_token_decode_matches_every_row() -> Result<()> {
    let device = Device::Cpu;
    let model = Model::new(build_config())?;
    let tokens = [5i64, 2, 11, 0, 9, 14, 3];

    let full = model.forward(&ids(&device, &tokens)?)?;

    let mut state = model.new_state();
    for (t, token) in tokens.iter().enumerate() {
        let step = model.forward_with_state(&ids(&device, &[*token])?, &mut state)?;
        let expected = full.narrow(1, t, 1)?;
        let diff = max_row_diff(&step, &expected)?;
        assert!(diff < 1e-3, "row {t} diverged by {diff}");
    }
    assert_eq!(state.pos(), tokens.len());
    Ok(())
}

#[test]
fn sliding_caches_stay_bounded_while_full_caches_grow() -> Result<()> {
    let device = Device::Cpu;
    let cfg = build_config();
    let window = cfg.sliding_window;
    let model = Model::new(cfg)?;

    let mut state = model.new_state();
    for step in 0..6 {
        model.forward_with_state(&ids(&device, &[(step % 16) as i64])?, &mut state)?;

        let sliding_len = state.layer_cache(0).expect("sliding cache").seq_len();
        let full_len = state.layer_cache(1).expect("full cache").seq_len();
        assert!(
            sliding_len <= window,
            "sliding cache holds {sliding_len} after step {step}"
        );
        assert_eq!(sliding_len, (step + 1).min(window));
        assert_eq!(full_len, step + 1);
    }
    Ok(())
}

#[test]
fn reset_starts_an_independent_episode() -> Result<()> {
    let device = Device::Cpu;
    let model = Model::new(build_config())?;
    let tokens = ids(&device, &[4, 12])?;

    let mut state = DecodeState::new(model.config().n_layers);
    let first = model.forward_with_state(&tokens, &mut state)?;
    model.forward_with_state(&ids(&device, &[1])?, &mut state)?;

    state.reset();
    assert_eq!(state.pos(), 0);
    let again = model.forward_with_state(&tokens, &mut state)?;

    assert!(max_row_diff(&first, &again)? < 1e-6);
    Ok(())
}

#[test]
fn positions_beyond_the_context_length_are_fatal() -> Result<()> {
    let device = Device::Cpu;
    let mut cfg = build_config();
    cfg.context_length = 4;
    let model = Model::new(cfg)?;

    assert!(model.forward(&ids(&device, &[0, 1, 2, 3, 4])?).is_err());

    let mut state = model.new_state();
    model.forward_with_state(&ids(&device, &[0, 1, 2])?, &mut state)?;
    model.forward_with_state(&ids(&device, &[3])?, &mut state)?;
    assert!(model
        .forward_with_state(&ids(&device, &[4])?, &mut state)
        .is_err());
    Ok(())
}

#[test]
fn missing_output_weight_ties_the_readout() -> Result<()> {
    let device = Device::Cpu;
    let cfg = build_config();
    let tensors = weight_tensors(&cfg)?;

    let tied = Model::from_weights(cfg.clone(), tensors.clone().into_iter().collect::<WeightMap>())?;

    let mut explicit_tensors = tensors;
    explicit_tensors.insert(
        "output.weight".into(),
        explicit_tensors["token_embd.weight"].clone(),
    );
    let explicit = Model::from_weights(cfg, explicit_tensors.into_iter().collect::<WeightMap>())?;

    let tokens = ids(&device, &[2, 9, 13])?;
    let a = tied.forward(&tokens)?;
    let b = explicit.forward(&tokens)?;
    assert!(max_row_diff(&a, &b)? < 1e-6);
    Ok(())
}

#[test]
fn shape_mismatches_name_the_offending_tensor() -> Result<()> {
    let cfg = build_config();
    let mut tensors = weight_tensors(&cfg)?;
    tensors.insert(
        "blk.1.attn_q.weight".into(),
        Tensor::zeros((3, 3), DType::F32, &cfg.device)?,
    );

    let err = Model::from_weights(cfg, tensors.into_iter().collect::<WeightMap>()).unwrap_err();
    match &err {
        WeightLoadError::ShapeMismatch { name, .. } => {
            assert_eq!(name, "blk.1.attn_q.weight");
        }
        other => panic!("expected a shape mismatch, got {other}"),
    }
    assert!(err.to_string().contains("blk.1.attn_q.weight"));
    Ok(())
}

#[test]
fn missing_tensors_are_name_identified() -> Result<()> {
    let cfg = build_config();
    let mut tensors = weight_tensors(&cfg)?;
    tensors.remove("blk.0.ffn_down.weight");

    let err = Model::from_weights(cfg, tensors.into_iter().collect::<WeightMap>()).unwrap_err();
    assert!(matches!(err, WeightLoadError::MissingTensor { ref name } if name == "blk.0.ffn_down.weight"));
    Ok(())
}

#[test]
fn unassigned_tensors_are_ignored() -> Result<()> {
    let device = Device::Cpu;
    let cfg = build_config();
    let mut tensors = weight_tensors(&cfg)?;
    tensors.insert(
        "rope_freqs.weight".into(),
        Tensor::zeros(4, DType::F32, &device)?,
    );

    let model = Model::from_weights(cfg, tensors.into_iter().collect::<WeightMap>())?;
    let logits = model.forward(&ids(&device, &[1, 2])?)?;
    assert_all_finite(&logits)
}

#[test]
fn reduced_precision_forward_stays_finite() -> Result<()> {
    let device = Device::Cpu;
    let mut cfg = build_config();
    cfg.dtype = DType::BF16;
    let model = Model::new(cfg)?;

    let logits = model.forward(&ids(&device, &[3, 7, 1])?)?;
    assert_eq!(logits.dtype(), DType::BF16);
    let values = logits
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}
