use crate::error::{GraphError, Result};

/// Ordered dimension sizes. The empty shape denotes a scalar.
pub type Shape = Vec<usize>;

pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Bidirectional ONNX broadcast of `a` and `b`: right-align the axes, pad
/// missing leading axes with 1, reconcile pairwise.
pub fn broadcast_shape(a: &[usize], b: &[usize], op: &'static str) -> Result<Shape> {
    let mut out = Vec::new();
    let max_len = a.len().max(b.len());
    for i in 0..max_len {
        let ad = *a.get(a.len().wrapping_sub(i + 1)).unwrap_or(&1);
        let bd = *b.get(b.len().wrapping_sub(i + 1)).unwrap_or(&1);
        if ad != bd && ad != 1 && bd != 1 {
            return Err(GraphError::ShapeMismatch {
                op,
                lhs: a.to_vec(),
                rhs: b.to_vec(),
            });
        }
        out.push(ad.max(bd));
    }
    out.reverse();
    Ok(out)
}

/// Map a possibly negative axis into `[0, rank)`.
pub fn normalize_axis(axis: isize, rank: usize, op: &'static str) -> Result<usize> {
    let mut axis = axis;
    if axis < 0 {
        axis += rank as isize;
    }
    if axis < 0 || axis as usize >= rank {
        return Err(GraphError::AxisOutOfRange { op, axis, rank });
    }
    Ok(axis as usize)
}

/// Row-major strides for a contiguous layout of `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }
    let mut strides = vec![0; shape.len()];
    let mut stride: usize = 1;
    for (idx, dim) in shape.iter().enumerate().rev() {
        strides[idx] = stride;
        stride = stride.saturating_mul(*dim);
    }
    strides
}

/// Decode a linear element index into per-axis coordinates.
pub fn unravel_index(linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut coord = vec![0; shape.len()];
    let mut rem = linear;
    for (i, &dim) in shape.iter().enumerate().rev() {
        coord[i] = rem % dim;
        rem /= dim;
    }
    coord
}

/// Flatten per-axis coordinates into a linear index under `strides`.
/// Coordinates are reduced modulo the shape, which is what makes broadcast
/// reads with zeroed strides resolve to the right element.
pub fn ravel_index(coord: &[usize], shape: &[usize], strides: &[usize]) -> usize {
    assert_eq!(
        coord.len(),
        shape.len(),
        "ravel_index: coordinate rank {} does not match shape rank {}",
        coord.len(),
        shape.len()
    );
    assert_eq!(
        shape.len(),
        strides.len(),
        "ravel_index: shape rank {} does not match stride rank {}",
        shape.len(),
        strides.len()
    );
    let mut linear = 0;
    for i in 0..shape.len() {
        linear += (coord[i] % shape[i]) * strides[i];
    }
    linear
}
