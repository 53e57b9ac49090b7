// Copyright (c) 2024 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Writing query results into caller-provided memory.
//!
//! Info queries use a two-call convention. The caller first passes no output buffer and
//! receives the size that the value needs, then calls again with a buffer of at least that size.
//! Every function here returns the size of the value, whether or not it was written.

use crate::ClError;
use bytemuck::Pod;

/// Writes a single plain value.
pub fn write_param<T>(param_value: Option<&mut [u8]>, value: &T) -> Result<usize, ClError>
where
    T: Pod,
{
    write_bytes(param_value, bytemuck::bytes_of(value))
}

/// Writes an array of plain values. An empty slice needs zero bytes.
pub fn write_slice<T>(param_value: Option<&mut [u8]>, values: &[T]) -> Result<usize, ClError>
where
    T: Pod,
{
    write_bytes(param_value, bytemuck::cast_slice(values))
}

fn write_bytes(param_value: Option<&mut [u8]>, bytes: &[u8]) -> Result<usize, ClError> {
    if let Some(param_value) = param_value {
        let dst = param_value
            .get_mut(..bytes.len())
            .ok_or(ClError::InvalidValue)?;
        dst.copy_from_slice(bytes);
    }

    Ok(bytes.len())
}
