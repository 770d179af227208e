use anyhow::Result;
use candle_core::{Device, Tensor, D};
use embedding::RopeTable;

/// Applies the inverse rotation (negated sine) using the public tables.
fn inverse_rotate(table: &RopeTable, x: &Tensor, offset: usize) -> Result<Tensor> {
    let (_b, _h, seq, head_dim) = x.dims4()?;
    let cos = table
        .cos()
        .narrow(0, offset, seq)?
        .reshape((1, 1, seq, head_dim))?;
    let sin = table
        .sin()
        .narrow(0, offset, seq)?
        .reshape((1, 1, seq, head_dim))?;

    let half = head_dim / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

    Ok(x.broadcast_mul(&cos)?
        .sub(&rotated.broadcast_mul(&sin)?)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()?)
}

#[test]
fn rotation_round_trips_within_tolerance() -> Result<()> {
    let device = Device::Cpu;
    let table = RopeTable::new(8, 10_000.0, 64, &device)?;

    for offset in [0usize, 1, 7, 32, 57] {
        let seq = (64 - offset).min(6);
        let x = Tensor::randn(0f32, 1.0, (2, 3, seq, 8), &device)?;
        let rotated = table.rotate(&x, offset)?;
        let recovered = inverse_rotate(&table, &rotated, offset)?;
        assert!(
            max_diff(&x, &recovered)? < 1e-5,
            "round trip failed at offset {offset}"
        );
    }
    Ok(())
}

#[test]
fn rotating_a_concatenation_matches_per_chunk_offsets() -> Result<()> {
    // Keys are cached unrotated and re-rotated as one concatenated sequence;
    // the result must match rotating each chunk at its own absolute offset.
    let device = Device::Cpu;
    let table = RopeTable::new(4, 10_000.0, 32, &device)?;

    let first = Tensor::randn(0f32, 1.0, (1, 2, 3, 4), &device)?;
    let second = Tensor::randn(0f32, 1.0, (1, 2, 2, 4), &device)?;
    let combined = Tensor::cat(&[&first, &second], 2)?;

    let all_at_once = table.rotate(&combined, 0)?;
    let chunked = Tensor::cat(&[&table.rotate(&first, 0)?, &table.rotate(&second, 3)?], 2)?;
    assert!(max_diff(&all_at_once, &chunked)? < 1e-6);
    Ok(())
}

#[test]
fn distinct_bases_disagree_away_from_position_zero() -> Result<()> {
    let device = Device::Cpu;
    let local = RopeTable::new(4, 10_000.0, 16, &device)?;
    let global = RopeTable::new(4, 1_000_000.0, 16, &device)?;

    let x = Tensor::randn(0f32, 1.0, (1, 1, 4, 4), &device)?;
    let a = local.rotate(&x, 4)?;
    let b = global.rotate(&x, 4)?;
    assert!(max_diff(&a, &b)? > 1e-3);

    // At position zero both bases are the identity.
    let single = x.narrow(2, 0, 1)?;
    let a0 = local.rotate(&single, 0)?;
    let b0 = global.rotate(&single, 0)?;
    assert!(max_diff(&a0, &b0)? < 1e-6);
    Ok(())
}

#[test]
fn rotation_preserves_vector_norms() -> Result<()> {
    let device = Device::Cpu;
    let table = RopeTable::new(8, 10_000.0, 16, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
    let rotated = table.rotate(&x, 3)?;

    let norm = |t: &Tensor| -> Result<Vec<f32>> {
        Ok(t.sqr()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?)
    };
    for (a, b) in norm(&x)?.iter().zip(norm(&rotated)?.iter()) {
        assert!((a - b).abs() < 1e-4);
    }
    Ok(())
}
