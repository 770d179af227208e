//! Lightweight validation helpers shared across layer components.
//!
//! Concise shape and dtype assertions for constructors and forward paths.
//! Every helper takes a short name used to identify the offending tensor in
//! the error message and returns `candle_core::Result<()>` so call sites can
//! propagate with `?` instead of panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name} expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Validates that the trailing axis has the given width, any rank allowed.
pub fn expect_last_dim(name: &str, tensor: &Tensor, last: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(actual) if *actual == last => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name} expected last dimension {last}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Checks the tensor is laid out contiguously in memory.
pub fn expect_contiguous(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{name} must be contiguous in memory")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_helpers_accept_and_reject() -> Result<()> {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 3, 4), DType::F32, &device)?;

        expect_shape("t", &tensor, &[2, 3, 4])?;
        assert!(expect_shape("t", &tensor, &[2, 3, 5]).is_err());

        expect_rank("t", &tensor, 3)?;
        assert!(expect_rank("t", &tensor, 2).is_err());

        expect_batch_seq_hidden("t", &tensor, 4)?;
        assert!(expect_batch_seq_hidden("t", &tensor, 8).is_err());

        expect_last_dim("t", &tensor, 4)?;
        let four_d = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        expect_last_dim("t", &four_d, 4)?;
        assert!(expect_last_dim("t", &four_d, 3).is_err());
        Ok(())
    }

    #[test]
    fn dtype_helper_names_the_tensor() -> Result<()> {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2,), DType::F32, &device)?;
        let err = expect_dtype_in("weights.q", &tensor, &[DType::F16]).unwrap_err();
        assert!(err.to_string().contains("weights.q"));
        Ok(())
    }
}
