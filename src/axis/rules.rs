//! Per-op axis propagation and layout tables
//!
//! Every function here is pure: it takes the mapping(s) of an op's inputs
//! and returns the output mapping or the layout the emitted layer needs.
//! Combinations outside the listed cases are [`Unmappable`]; nothing here
//! guesses a default.
//!
//! Target blobs are rank 4 `[S, C, H, W]` with batch carried outside the
//! layer. Permutations returned by this module index that rank-4 space.

use smallvec::{smallvec, SmallVec};

use super::{Axis, AxisMapping, AxisResult, Unmappable};

use Axis::*;

/// Permutation in the rank-4 `[S, C, H, W]` target blob
pub type TargetPerm = [usize; 4];

/// Reduction axis strings the target reduce layer accepts directly
pub const NATIVE_REDUCE_AXES: &[&str] = &["C", "H", "W", "HW", "CHW"];

// ============================================================================
// Propagation
// ============================================================================

/// Output mapping of a broadcasting op
///
/// The input of greatest rank decides; ties go to the first listed.
pub fn broadcast_output(mappings: &[&[Axis]]) -> Option<AxisMapping> {
    let mut best: Option<&[Axis]> = None;
    for &m in mappings {
        if best.map_or(true, |b| m.len() > b.len()) {
            best = Some(m);
        }
    }
    best.map(|m| m.iter().copied().collect())
}

/// Output mapping of a reduction over `axes`
///
/// Without `keepdims` the reduced positions are deleted; an empty result
/// collapses to `[C]`.
pub fn reduced(mapping: &[Axis], axes: &[usize], keepdims: bool) -> AxisMapping {
    if keepdims {
        return mapping.iter().copied().collect();
    }
    let out: AxisMapping = mapping
        .iter()
        .enumerate()
        .filter(|(i, _)| !axes.contains(i))
        .map(|(_, a)| *a)
        .collect();
    if out.is_empty() {
        smallvec![Channel]
    } else {
        out
    }
}

/// Output mapping of `Flatten(axis)`
///
/// Accepted: a leading Sequence or Batch slot with axis 0 or 1, `[S, B, ..]`
/// with axis 2, or a rank-1 blob below Width with axis 1.
pub fn flatten(mapping: &[Axis], axis: i64) -> AxisResult<AxisMapping> {
    let first = *mapping
        .first()
        .ok_or_else(|| Unmappable::new("Flatten of a blob with no axes"))?;

    if mapping.len() == 1 && axis == 1 && first != Width {
        let next = Axis::from_index(first.index() as i64 + 1)
            .ok_or_else(|| Unmappable::new("Flatten axis mode not supported"))?;
        return Ok(smallvec![first, next]);
    }

    let leading_seq_or_batch = matches!(first, Sequence | Batch) && (axis == 0 || axis == 1);
    let seq_batch_prefix = mapping.starts_with(&[Sequence, Batch]) && axis == 2;
    if leading_seq_or_batch || seq_batch_prefix {
        Ok(smallvec![first, Channel])
    } else {
        Err(Unmappable::new("Flatten axis mode not supported"))
    }
}

/// Output mapping of a Reshape whose target dims are all `1`/`-1`
/// (lowered as a flatten)
pub fn flatten_like_reshape(mapping: &[Axis], target_rank: usize) -> AxisResult<AxisMapping> {
    let first = mapping.first().copied().unwrap_or(Channel);
    match target_rank {
        4 => Ok(smallvec![first, Channel, Height, Width]),
        3 => Ok(smallvec![Channel, Height, Width]),
        2 => Ok(smallvec![first, Channel]),
        1 => Ok(smallvec![Channel]),
        _ => Err(Unmappable::new("Supports only less than equal to 4d tensors")),
    }
}

/// Target reshape shape and output mapping
///
/// `input` is `None` when the input mapping is not known yet; the shape is
/// still computed but no mapping is produced. Ranks above 4 need a known
/// input mapping and leading unit dims.
pub fn reshape_target(
    target: &[i64],
    input: Option<&[Axis]>,
) -> AxisResult<(Vec<i64>, Option<AxisMapping>)> {
    let (shape, mapping): (Vec<i64>, AxisMapping) = match target.len() {
        1 => (vec![1, target[0], 1, 1], smallvec![Channel]),
        2 => (vec![target[0], target[1], 1, 1], smallvec![Sequence, Channel]),
        3 => (
            vec![1, target[0], target[1], target[2]],
            smallvec![Channel, Height, Width],
        ),
        4 => {
            let batch_led = input.map_or(false, |m| m.first() == Some(&Batch));
            let mapping = if batch_led && target[0] == 1 {
                smallvec![Batch, Channel, Height, Width]
            } else {
                smallvec![Sequence, Channel, Height, Width]
            };
            (target.to_vec(), mapping)
        }
        n if n > 4 => {
            let diff = n - 4;
            if !target[..diff].iter().all(|&d| d == 1) {
                return Err(Unmappable::new("Tensors more than rank 4 are not supported"));
            }
            if input.is_none() {
                return Err(Unmappable::new("Supports tensors not more than 4d"));
            }
            let shape = target[diff..].to_vec();
            // Only the rank-5 case keeps a known layout.
            let mapping = (n == 5).then(|| smallvec![Batch, Sequence, Channel, Height, Width]);
            return Ok((shape, mapping));
        }
        _ => return Err(Unmappable::new("Unsupported shape for reshape")),
    };
    Ok((shape, input.map(|_| mapping)))
}

/// Output mapping of Squeeze
///
/// Without `axes` the static input shape decides which positions go.
pub fn squeeze(
    mapping: &[Axis],
    axes: Option<&[i64]>,
    shape: Option<&[i64]>,
) -> AxisResult<AxisMapping> {
    let out: AxisMapping = match axes {
        None => {
            let shape = shape.ok_or_else(|| Unmappable::new("shape not known"))?;
            mapping
                .iter()
                .zip(shape)
                .filter(|(_, &d)| d != 1)
                .map(|(a, _)| *a)
                .collect()
        }
        Some(axes) => mapping
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(&(*i as i64)))
            .map(|(_, a)| *a)
            .collect(),
    };
    Ok(if out.is_empty() { smallvec![Channel] } else { out })
}

/// Output mapping of Unsqueeze
///
/// New positions take the unused slots in increasing order.
pub fn unsqueeze(mapping: &[Axis], axes: &[i64]) -> AxisResult<AxisMapping> {
    let mut free = Axis::ALL.iter().filter(|a| !mapping.contains(a)).copied();
    let free_count = Axis::ALL.iter().filter(|a| !mapping.contains(a)).count();
    if axes.len() > free_count {
        return Err(Unmappable::new(
            "cannot unsqueeze to a dimension greater than 5",
        ));
    }

    let rank = axes.len() + mapping.len();
    let mut existing = mapping.iter().copied();
    let mut out = AxisMapping::new();
    for i in 0..rank as i64 {
        let slot = if axes.contains(&i) {
            free.next()
        } else {
            existing.next()
        };
        out.push(slot.ok_or_else(|| Unmappable::new("Unsqueeze axes out of range"))?);
    }
    Ok(out)
}

// ============================================================================
// Layout tables
// ============================================================================

/// Permutation that swaps `slot` with Channel in the target blob
///
/// `None` when the slot already is Channel. Batch never moves.
pub fn channel_swap(slot: Axis) -> AxisResult<Option<TargetPerm>> {
    match slot {
        Channel => Ok(None),
        Sequence => Ok(Some([1, 0, 2, 3])),
        Height => Ok(Some([0, 2, 1, 3])),
        Width => Ok(Some([0, 3, 2, 1])),
        Batch => Err(Unmappable::new("operation not supported along batch axis")),
    }
}

/// Slot an ONNX axis resolves to
pub fn slot_of(mapping: &[Axis], axis: i64) -> AxisResult<Axis> {
    let rank = mapping.len() as i64;
    let idx = if axis < 0 { axis + rank } else { axis };
    usize::try_from(idx)
        .ok()
        .and_then(|i| mapping.get(i).copied())
        .ok_or_else(|| {
            Unmappable::new(format!("axis {} is out of range for rank {}", axis, rank))
        })
}

/// How a conv-like layer (conv, pool, pad) sits on its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialLayout {
    /// `[B|S, C, H, W]`: both spatial dims native
    Planar,
    /// `[B, C, H]`: 1-D along height
    Height,
    /// `[B, C, W]`: 1-D along width
    Width,
    /// 1-D along width after wrapping with this permutation
    WidthSwapped(TargetPerm),
}

impl SpatialLayout {
    /// Spatial axis name used by the parameter builders
    pub fn axis(&self) -> Option<Axis> {
        match self {
            SpatialLayout::Planar => None,
            SpatialLayout::Height => Some(Height),
            SpatialLayout::Width | SpatialLayout::WidthSwapped(_) => Some(Width),
        }
    }
}

/// Layout of a conv-like op for the given input mapping
pub fn spatial_layout(mapping: &[Axis]) -> AxisResult<SpatialLayout> {
    match mapping {
        [Batch, Channel, Height, Width] | [Sequence, Channel, Height, Width] => {
            Ok(SpatialLayout::Planar)
        }
        [Batch, Channel, Height] => Ok(SpatialLayout::Height),
        [Batch, Channel, Width] => Ok(SpatialLayout::Width),
        [Channel, Height, Width] => Ok(SpatialLayout::WidthSwapped([0, 2, 1, 3])),
        [Batch, Channel, Sequence] => Ok(SpatialLayout::WidthSwapped([3, 1, 2, 0])),
        m if m.len() != 3 && m.len() != 4 => Err(Unmappable::new("more than 4 axes not supported")),
        _ => Err(Unmappable::new(
            "error in axes alignment between onnx and coreml",
        )),
    }
}

/// Wrapping permutation an inner-product layer needs, if any
///
/// Only `[B,C]`, `[S,C]`, `[H,W]`, `[C,H]` and `[C,W]` placements exist.
pub fn inner_product_layout(mapping: &[Axis]) -> AxisResult<Option<TargetPerm>> {
    match mapping {
        [Batch, Channel] | [Sequence, Channel] => Ok(None),
        [Height, Width] => Ok(Some([2, 3, 0, 1])),
        [Channel, Height] => Ok(Some([1, 2, 0, 3])),
        [Channel, Width] => Ok(Some([1, 3, 2, 0])),
        _ => Err(Unmappable::new("CoreML incompatible axis placement")),
    }
}

/// Translate an ONNX permutation into the target blob's permutation
///
/// `perm` defaults to reversing the axes. The Batch slot must stay put.
pub fn transpose_perm(mapping: &[Axis], perm: Option<&[i64]>) -> AxisResult<TargetPerm> {
    let reversed: Vec<i64> = (0..mapping.len() as i64).rev().collect();
    let perm = perm.unwrap_or(&reversed);

    let mut slots: SmallVec<[Axis; 5]> = SmallVec::new();
    for &p in perm {
        slots.push(slot_of(mapping, p)?);
    }
    if let Some(before) = mapping.iter().position(|&a| a == Batch) {
        if slots.iter().position(|&a| a == Batch) != Some(before) {
            return Err(Unmappable::new("cannot transpose batch dimension"));
        }
    }

    // Batch is not part of the rank-4 blob; later slots shift down by one.
    let translated: SmallVec<[usize; 4]> = slots
        .iter()
        .filter(|&&a| a != Batch)
        .map(|&a| if a == Sequence { 0 } else { a.index() - 1 })
        .collect();

    let mut out = [usize::MAX; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        if !translated.contains(&i) {
            *slot = i;
        }
    }
    let open = out.iter().filter(|&&v| v == usize::MAX).count();
    if open != translated.len() {
        return Err(Unmappable::new("unable to translate transpose op to CoreML"));
    }
    let mut fill = translated.iter();
    for slot in out.iter_mut().filter(|v| **v == usize::MAX) {
        *slot = *fill
            .next()
            .ok_or_else(|| Unmappable::new("unable to translate transpose op to CoreML"))?;
    }
    Ok(out)
}

/// Target permutation for a Transpose whose input mapping is unknown
///
/// Defaults to `[0, 3, 2, 1]`; longer perms must keep their leading axes.
pub fn transpose_perm_unmapped(perm: Option<&[i64]>) -> AxisResult<TargetPerm> {
    let perm: Vec<i64> = perm.map(<[i64]>::to_vec).unwrap_or_else(|| vec![0, 3, 2, 1]);
    let full: Vec<i64> = if perm.len() > 4 {
        let diff = perm.len() - 4;
        if !(0..diff).all(|i| perm[i] == i as i64) {
            return Err(Unmappable::new("Supports only 4d tensors"));
        }
        perm[diff..].iter().map(|p| p - diff as i64).collect()
    } else {
        let diff = 4 - perm.len();
        (0..diff as i64)
            .chain(perm.iter().map(|p| p + diff as i64))
            .collect()
    };

    let mut out = [0usize; 4];
    for (slot, p) in out.iter_mut().zip(&full) {
        *slot = usize::try_from(*p)
            .ok()
            .filter(|&v| v < 4)
            .ok_or_else(|| Unmappable::new(format!("invalid permutation {:?}", full)))?;
    }
    Ok(out)
}

/// Sorted letter string of the slots `axes` resolve to (e.g. `"HW"`)
pub fn axis_letters(mapping: &[Axis], axes: &[usize]) -> AxisResult<String> {
    let mut letters: Vec<char> = Vec::with_capacity(axes.len());
    for &a in axes {
        letters.push(slot_of(mapping, a as i64)?.letter());
    }
    letters.sort_unstable();
    Ok(letters.into_iter().collect())
}

/// Letter string for an unmapped input of the given rank
///
/// Rank 1 is always `"C"`; rank 2 only reduces along axis 1.
pub fn fallback_axis_letters(rank: usize, axes: &[usize]) -> String {
    let names: &[char] = match rank {
        3 => &['C', 'H', 'W'],
        4 => &['B', 'C', 'H', 'W'],
        _ => &[],
    };
    match rank {
        1 => "C".to_string(),
        2 if axes == [1] => "C".to_string(),
        3 | 4 => axes.iter().filter_map(|&a| names.get(a)).collect(),
        _ => String::new(),
    }
}

/// Target-side load-constant layout of a constant tensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstLayout {
    /// Shape passed to the load-constant layer (`[C, H, W]`)
    pub shape: Vec<i64>,
    /// Mapping recorded for the constant edge
    pub mapping: AxisMapping,
    /// Permutation applied after loading, for `[S, C]` constants
    pub post_perm: Option<TargetPerm>,
}

/// Layout of a constant given its shape and the mapping of a sibling input
pub fn const_layout(shape: &[i64], sibling: Option<&[Axis]>) -> AxisResult<ConstLayout> {
    let layout = match shape.len() {
        0 => ConstLayout {
            shape: vec![1, 1, 1],
            mapping: smallvec![Channel],
            post_perm: None,
        },
        1 => ConstLayout {
            shape: vec![shape[0], 1, 1],
            mapping: smallvec![Channel],
            post_perm: None,
        },
        2 => {
            let row_major = matches!(sibling, Some([Batch, Channel]) | Some([Sequence, Channel]));
            ConstLayout {
                shape: vec![1, shape[0], shape[1]],
                mapping: if row_major {
                    smallvec![Sequence, Channel]
                } else {
                    smallvec![Height, Width]
                },
                post_perm: row_major.then_some([2, 3, 0, 1]),
            }
        }
        3 => ConstLayout {
            shape: shape.to_vec(),
            mapping: smallvec![Channel, Height, Width],
            post_perm: None,
        },
        _ => {
            return Err(Unmappable::new(
                "unable to translate constant array shape to CoreML shape",
            ))
        }
    };
    Ok(layout)
}

/// `(S, B, C, H, W)` view of an ONNX shape under its mapping
///
/// Slots the edge does not occupy are `1`. `None` if the ranks disagree.
pub fn describe_shape(mapping: &[Axis], onnx_shape: &[i64]) -> Option<[i64; 5]> {
    if mapping.len() != onnx_shape.len() {
        return None;
    }
    let mut out = [1i64; 5];
    for slot in Axis::ALL {
        if let Some(pos) = mapping.iter().position(|&a| a == slot) {
            out[slot.index()] = onnx_shape[pos];
        }
    }
    Some(out)
}
