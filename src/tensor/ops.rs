//! Compile-time tensor kernels
//!
//! The ops constant folding evaluates directly. Each returns an error
//! instead of panicking when the operands do not fit together, so a bad
//! constant surfaces as a structural failure of the compile.

use ndarray::{concatenate, ArrayView, Axis, Ix2, IxDyn, Slice};

use crate::error::{ConvertError, ConvertResult};

use super::shape::normalize_axis;
use super::Tensor;

fn shape_err(op: &str, detail: impl std::fmt::Display) -> ConvertError {
    ConvertError::Structural(format!("{}: {}", op, detail))
}

/// Check if two shapes are broadcastable
pub fn is_broadcastable(shape_a: &[usize], shape_b: &[usize]) -> bool {
    let max_len = shape_a.len().max(shape_b.len());
    (0..max_len).all(|i| {
        let dim_a = shape_a.len().checked_sub(i + 1).map_or(1, |j| shape_a[j]);
        let dim_b = shape_b.len().checked_sub(i + 1).map_or(1, |j| shape_b[j]);
        dim_a == dim_b || dim_a == 1 || dim_b == 1
    })
}

/// Elementwise multiply with numpy broadcasting
pub fn mul(a: &Tensor, b: &Tensor) -> ConvertResult<Tensor> {
    if !is_broadcastable(a.shape(), b.shape()) {
        return Err(shape_err("Mul", format!("{:?} vs {:?}", a.shape(), b.shape())));
    }
    Ok(a * b)
}

/// Elementwise divide with numpy broadcasting
pub fn div(a: &Tensor, b: &Tensor) -> ConvertResult<Tensor> {
    if !is_broadcastable(a.shape(), b.shape()) {
        return Err(shape_err("Div", format!("{:?} vs {:?}", a.shape(), b.shape())));
    }
    Ok(a / b)
}

/// Elementwise floor
pub fn floor(a: &Tensor) -> Tensor {
    a.mapv(f32::floor)
}

/// `np.take(data, indices, axis)`
pub fn take(data: &Tensor, indices: &Tensor, axis: i64) -> ConvertResult<Tensor> {
    let axis = normalize_axis(axis, data.ndim())?;
    let dim = data.shape()[axis] as i64;
    let mut picked = Vec::with_capacity(indices.len());
    for &raw in indices.iter() {
        let mut idx = raw as i64;
        if idx < 0 {
            idx += dim;
        }
        if idx < 0 || idx >= dim {
            return Err(shape_err("Gather", format!("index {} out of range {}", raw, dim)));
        }
        picked.push(idx as usize);
    }

    let selected = data.select(Axis(axis), &picked);
    let mut out_shape: Vec<usize> = data.shape()[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&data.shape()[axis + 1..]);
    selected
        .as_standard_layout()
        .to_owned()
        .into_shape(IxDyn(&out_shape))
        .map_err(|e| shape_err("Gather", e))
}

/// ONNX slicing along the listed axes
///
/// Negative starts/ends count from the end. For positive steps both bounds
/// clamp to `[0, dim]`; for negative steps the start clamps to
/// `[0, dim - 1]` and the end to `[-1, dim - 1]`.
pub fn slice(
    data: &Tensor,
    starts: &[i64],
    ends: &[i64],
    axes: Option<&[i64]>,
    steps: Option<&[i64]>,
) -> ConvertResult<Tensor> {
    let default_axes: Vec<i64> = (0..starts.len() as i64).collect();
    let axes = axes.unwrap_or(&default_axes);
    if starts.len() != ends.len() || axes.len() != starts.len() {
        return Err(shape_err("Slice", "starts, ends and axes differ in length"));
    }

    let mut view = data.view();
    for (i, &axis) in axes.iter().enumerate() {
        let axis = normalize_axis(axis, data.ndim())?;
        let dim = data.shape()[axis] as i64;
        let step = steps.and_then(|s| s.get(i).copied()).unwrap_or(1);
        let wrap = |v: i64| if v < 0 { v.saturating_add(dim) } else { v };
        let range = if step > 0 {
            let start = wrap(starts[i]).clamp(0, dim);
            let end = wrap(ends[i]).clamp(0, dim).max(start);
            Slice::new(start as isize, Some(end as isize), step as isize)
        } else if step < 0 && dim == 0 {
            Slice::new(0, Some(0), step as isize)
        } else if step < 0 {
            // ndarray walks [lo, hi) backwards from hi - 1
            let start = wrap(starts[i]).clamp(0, dim - 1);
            let end = wrap(ends[i]).clamp(-1, dim - 1);
            let hi = start + 1;
            let lo = (end + 1).min(hi);
            Slice::new(lo as isize, Some(hi as isize), step as isize)
        } else {
            return Err(shape_err("Slice", "step must be non-zero"));
        };
        view.slice_axis_inplace(Axis(axis), range);
    }
    Ok(view.to_owned())
}

/// Transpose; an empty permutation reverses the axes
pub fn transpose(data: &Tensor, perm: &[i64]) -> ConvertResult<Tensor> {
    let perm: Vec<usize> = if perm.is_empty() {
        (0..data.ndim()).rev().collect()
    } else {
        perm.iter()
            .map(|&p| normalize_axis(p, data.ndim()))
            .collect::<ConvertResult<_>>()?
    };
    if perm.len() != data.ndim() {
        return Err(shape_err("Transpose", format!("perm {:?} for rank {}", perm, data.ndim())));
    }
    Ok(data
        .clone()
        .permuted_axes(IxDyn(&perm))
        .as_standard_layout()
        .to_owned())
}

/// Concatenate along an axis
pub fn concat(tensors: &[&Tensor], axis: i64) -> ConvertResult<Tensor> {
    let first = tensors
        .first()
        .ok_or_else(|| shape_err("Concat", "no inputs"))?;
    let axis = normalize_axis(axis, first.ndim())?;
    let views: Vec<ArrayView<'_, f32, IxDyn>> = tensors.iter().map(|t| t.view()).collect();
    concatenate(Axis(axis), &views).map_err(|e| shape_err("Concat", e))
}

/// Insert unit axes at the given output positions
pub fn unsqueeze(data: &Tensor, axes: &[i64]) -> ConvertResult<Tensor> {
    let out_rank = data.ndim() + axes.len();
    let mut sorted: Vec<usize> = axes
        .iter()
        .map(|&a| normalize_axis(a, out_rank))
        .collect::<ConvertResult<_>>()?;
    sorted.sort_unstable();
    let mut out = data.clone();
    for a in sorted {
        out.insert_axis_inplace(Axis(a));
    }
    Ok(out)
}

/// Remove unit axes; no axes removes every unit axis
pub fn squeeze(data: &Tensor, axes: &[i64]) -> ConvertResult<Tensor> {
    let mut targets: Vec<usize> = if axes.is_empty() {
        (0..data.ndim()).filter(|&a| data.shape()[a] == 1).collect()
    } else {
        axes.iter()
            .map(|&a| normalize_axis(a, data.ndim()))
            .collect::<ConvertResult<_>>()?
    };
    targets.sort_unstable_by(|a, b| b.cmp(a));
    targets.dedup();
    let mut out = data.clone();
    for a in targets {
        if out.shape()[a] != 1 {
            return Err(shape_err("Squeeze", format!("axis {} has size {}", a, out.shape()[a])));
        }
        out.index_axis_inplace(Axis(a), 0);
    }
    Ok(out)
}

/// `alpha * op(A) @ op(B) + beta * C`
pub fn gemm(
    a: &Tensor,
    b: &Tensor,
    c: Option<&Tensor>,
    alpha: f32,
    beta: f32,
    trans_a: bool,
    trans_b: bool,
) -> ConvertResult<Tensor> {
    let a2 = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| shape_err("Gemm", e))?;
    let b2 = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| shape_err("Gemm", e))?;
    let a2 = if trans_a { a2.reversed_axes() } else { a2 };
    let b2 = if trans_b { b2.reversed_axes() } else { b2 };
    if a2.ncols() != b2.nrows() {
        return Err(shape_err(
            "Gemm",
            format!("inner dims {} and {} differ", a2.ncols(), b2.nrows()),
        ));
    }
    let mut out = a2.dot(&b2).into_dyn() * alpha;
    if let Some(c) = c {
        if !is_broadcastable(out.shape(), c.shape()) {
            return Err(shape_err("Gemm", format!("bias shape {:?}", c.shape())));
        }
        out = &out + &(c * beta);
    }
    Ok(out)
}

/// ONNX Reshape semantics: `0` copies the input dim, `-1` is inferred
pub fn reshape(data: &Tensor, shape: &[i64]) -> ConvertResult<Tensor> {
    let target = resolve_reshape(data.shape(), shape)?;
    data.as_standard_layout()
        .to_owned()
        .into_shape(IxDyn(&target))
        .map_err(|e| shape_err("Reshape", e))
}

/// Resolve a Reshape target shape against a known input shape
pub fn resolve_reshape(input: &[usize], shape: &[i64]) -> ConvertResult<Vec<usize>> {
    let total: usize = input.iter().product();
    let mut out = Vec::with_capacity(shape.len());
    let mut infer_at = None;
    for (i, &d) in shape.iter().enumerate() {
        match d {
            0 => out.push(
                *input
                    .get(i)
                    .ok_or_else(|| shape_err("Reshape", "0 dim past input rank"))?,
            ),
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(shape_err("Reshape", "more than one -1 in target shape"));
                }
                out.push(1);
            }
            d if d > 0 => out.push(d as usize),
            d => return Err(shape_err("Reshape", format!("invalid dim {}", d))),
        }
    }
    if let Some(i) = infer_at {
        let known: usize = out.iter().product();
        if known == 0 || total % known != 0 {
            return Err(shape_err("Reshape", format!("cannot infer {:?} from {:?}", shape, input)));
        }
        out[i] = total / known;
    }
    if out.iter().product::<usize>() != total {
        return Err(shape_err("Reshape", format!("{:?} does not fit {:?}", shape, input)));
    }
    Ok(out)
}
