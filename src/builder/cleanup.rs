//! Spec cleanup passes
//!
//! Passes that run on the finished layer list, after lowering.

use rustc_hash::FxHashSet;
use tracing::debug;

use super::layers::{Activation, LayerKind};
use super::spec::NeuralNetworkSpec;

/// Statistics from cleanup passes
#[derive(Debug, Default, Clone)]
pub struct CleanupStats {
    /// Layers whose outputs reach no model output
    pub layers_removed: usize,
    /// Crop layers moved behind the following batch-norm
    pub crops_moved: usize,
}

/// Collect every blob some kept layer or model output needs
///
/// Walks the layers backwards, so producers are only kept once a kept
/// consumer has asked for one of their outputs.
pub fn collect_used_blobs(spec: &NeuralNetworkSpec) -> (FxHashSet<String>, Vec<bool>) {
    let mut used: FxHashSet<String> = spec
        .description
        .outputs
        .iter()
        .map(|f| f.name.clone())
        .collect();
    if let Some(blob) = &spec.label_probability_layer_name {
        used.insert(blob.clone());
    }

    let mut keep = vec![false; spec.layers.len()];
    for (i, layer) in spec.layers.iter().enumerate().rev() {
        if layer.outputs.iter().any(|o| used.contains(o)) {
            keep[i] = true;
            used.extend(layer.inputs.iter().filter(|s| !s.is_empty()).cloned());
        }
    }
    (used, keep)
}

/// Delete layers whose outputs reach no model output
pub fn remove_disconnected_layers(spec: &mut NeuralNetworkSpec) -> usize {
    let (_, keep) = collect_used_blobs(spec);
    let before = spec.layers.len();
    let mut flags = keep.into_iter();
    spec.layers_mut().retain(|_| flags.next().unwrap_or(true));
    let removed = before - spec.layers.len();
    if removed > 0 {
        debug!(removed, "removed disconnected layers");
    }
    removed
}

/// Move `Crop` behind a following batch-norm (and ReLU)
///
/// `conv -> crop -> bn [-> relu]` becomes `conv -> bn [-> relu] -> crop`
/// when every intermediate blob has exactly one reader. Cropping after the
/// per-channel ops keeps them fused with the convolution.
pub fn transform_conv_crop(spec: &mut NeuralNetworkSpec) -> usize {
    let mut moved = 0;
    let mut i = 0;
    while i + 2 < spec.layers.len() {
        let Some(span) = conv_crop_span(spec, i) else {
            i += 1;
            continue;
        };

        let layers = spec.layers_mut();
        let conv_out = layers[i].outputs[0].clone();
        let crop_out = layers[i + 1].outputs[0].clone();
        let last = i + 1 + span;
        let final_out = layers[last].outputs[0].clone();

        layers[i + 2].inputs[0] = conv_out;
        layers[last].outputs[0] = crop_out.clone();
        let mut crop = layers.remove(i + 1);
        crop.inputs[0] = crop_out;
        crop.outputs[0] = final_out;
        layers.insert(last, crop);

        moved += 1;
        i = last + 1;
    }
    if moved > 0 {
        debug!(moved, "moved crop layers behind batch-norm");
    }
    moved
}

/// Number of layers after the crop that move ahead of it, if the pattern matches
fn conv_crop_span(spec: &NeuralNetworkSpec, i: usize) -> Option<usize> {
    let layers = &spec.layers;
    let readers = |blob: &str| {
        layers
            .iter()
            .filter(|l| l.inputs.iter().any(|x| x == blob))
            .count()
    };
    let is_output = |blob: &str| spec.description.outputs.iter().any(|f| f.name == blob);
    let single_edge = |from: usize, to: usize| {
        let blob = layers[from].outputs.first()?;
        (layers[to].inputs.first() == Some(blob) && readers(blob) == 1 && !is_output(blob))
            .then_some(())
    };

    matches!(layers[i].kind, LayerKind::Convolution { .. }).then_some(())?;
    matches!(layers[i + 1].kind, LayerKind::Crop { .. }).then_some(())?;
    matches!(layers[i + 2].kind, LayerKind::Batchnorm { .. }).then_some(())?;
    single_edge(i, i + 1)?;
    single_edge(i + 1, i + 2)?;

    let relu_follows = layers.get(i + 3).map_or(false, |l| {
        matches!(
            l.kind,
            LayerKind::Activation {
                activation: Activation::Relu
            }
        )
    });
    if relu_follows && single_edge(i + 2, i + 3).is_some() {
        Some(2)
    } else {
        Some(1)
    }
}

/// Run every cleanup pass
pub fn cleanup_with_stats(spec: &mut NeuralNetworkSpec) -> CleanupStats {
    CleanupStats {
        layers_removed: remove_disconnected_layers(spec),
        crops_moved: transform_conv_crop(spec),
    }
}
