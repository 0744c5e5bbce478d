//! Target layer kinds and their parameters
//!
//! A [`Layer`] is a name, its input and output blob names, and a
//! [`LayerKind`] carrying the kind-specific parameters. Kinds serialize
//! with a `type` tag so a finished spec reads as plain JSON.

#![allow(missing_docs)]

use serde::Serialize;

use crate::tensor::Tensor;

/// Dense weight blob
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct WeightParams {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl WeightParams {
    /// Rank-1 blob from raw values
    pub fn from_values(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// Blob of `len` copies of `value`
    pub fn filled(len: usize, value: f32) -> Self {
        Self::from_values(vec![value; len])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<&Tensor> for WeightParams {
    fn from(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            values: tensor.iter().copied().collect(),
        }
    }
}

impl From<Tensor> for WeightParams {
    fn from(tensor: Tensor) -> Self {
        Self::from(&tensor)
    }
}

// ============================================================================
// Parameter enums
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activation {
    Linear { alpha: f32, beta: f32 },
    Relu,
    LeakyRelu { alpha: f32 },
    ThresholdedRelu { alpha: f32 },
    Tanh,
    ScaledTanh { alpha: f32, beta: f32 },
    Sigmoid,
    SigmoidHard { alpha: f32, beta: f32 },
    Elu { alpha: f32 },
    Softsign,
    Softplus,
    ParametricSoftplus { alpha: WeightParams, beta: WeightParams },
    Prelu { alpha: WeightParams },
}

impl Activation {
    /// Identity, used to copy a blob under a new name
    pub fn identity() -> Self {
        Activation::Linear {
            alpha: 1.0,
            beta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnaryMode {
    Sqrt,
    Rsqrt,
    Inverse,
    Power,
    Exp,
    Log,
    Abs,
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementwiseMode {
    Add,
    Multiply,
    Average,
    Max,
    Min,
    Concat,
    SequenceConcat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaddingMode {
    Constant,
    Reflection,
    Replication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpsampleMode {
    Nn,
    Bilinear,
}

/// Blob axis a legacy slice runs along
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceAxis {
    Channel,
    Height,
    Width,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReduceMode {
    Sum,
    Avg,
    Prod,
    Logsum,
    Sumsquare,
    L1,
    L2,
    Max,
    Min,
    Argmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReshapeOrder {
    ChannelFirst,
    ChannelLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReorganizeMode {
    SpaceToDepth,
    DepthToSpace,
    PixelShuffle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolingType {
    Max,
    Average,
    L2,
}

/// Padding scheme of a convolution or pooling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BorderMode {
    /// Explicit amounts, `[top, bottom, left, right]`
    Valid { paddings: [i64; 4] },
    /// Output size `ceil(in / stride)`
    Same { asymmetry: SameAsymmetry },
    /// Legacy pooling mode that keeps the last partial window
    IncludeLastPixel { paddings: [i64; 2] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SameAsymmetry {
    BottomRightHeavy,
    TopLeftHeavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Max,
    Min,
    Pow,
    Mod,
    FloorDiv,
}

/// Elementwise math without parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MathOp {
    Floor,
    Ceil,
    Round,
    Sign,
    Erf,
    Tanh,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Asinh,
    Acosh,
    Atanh,
    Exp2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReduceOp {
    Sum,
    Prod,
    Mean,
    Max,
    Min,
    L1,
    L2,
    LogSum,
    LogSumExp,
    SumSquare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOp {
    And,
    Or,
    Xor,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompareOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScatterMode {
    Update,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResizeMode {
    StrictAlignEndpoints,
    AlignEndpoints,
    UpsampleMode,
    RoiAlignMode,
}

/// Gate activations of a recurrent cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurrentActivation {
    Sigmoid,
    Tanh,
    Relu,
    SigmoidHard,
    Linear,
}

/// Gate weights of one recurrent direction
///
/// LSTM gates are ordered input, forget, output, cell; GRU gates are
/// update, reset, output.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RecurrentWeights {
    pub w_x: Vec<WeightParams>,
    pub w_h: Vec<WeightParams>,
    pub bias: Option<Vec<WeightParams>>,
    pub peephole: Option<Vec<WeightParams>>,
}

/// Opaque attribute carried by a custom layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CustomParam {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

// ============================================================================
// Layer kinds
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LayerKind {
    // ---- rank-5 layers ----
    Activation {
        #[serde(flatten)]
        activation: Activation,
    },
    Unary {
        mode: UnaryMode,
        alpha: f32,
        shift: f32,
        scale: f32,
        epsilon: f32,
    },
    Elementwise {
        mode: ElementwiseMode,
        alpha: Option<f32>,
    },
    Softmax,
    Permute {
        axes: [usize; 4],
    },
    Padding {
        mode: PaddingMode,
        value: f32,
        top: i64,
        bottom: i64,
        left: i64,
        right: i64,
    },
    Batchnorm {
        channels: usize,
        gamma: WeightParams,
        beta: WeightParams,
        mean: Option<WeightParams>,
        variance: Option<WeightParams>,
        compute_mean_var: bool,
        instance_normalization: bool,
        epsilon: f32,
    },
    Upsample {
        scaling_factor_h: f32,
        scaling_factor_w: f32,
        mode: UpsampleMode,
    },
    UniLstm {
        hidden_size: usize,
        input_size: usize,
        weights: RecurrentWeights,
        activations: Vec<RecurrentActivation>,
        output_all: bool,
        forget_bias: bool,
        cell_clip: Option<f32>,
        reverse_input: bool,
    },
    BiDirLstm {
        hidden_size: usize,
        input_size: usize,
        forward: RecurrentWeights,
        backward: RecurrentWeights,
        activations: Vec<RecurrentActivation>,
        output_all: bool,
        forget_bias: bool,
        cell_clip: Option<f32>,
    },
    Gru {
        hidden_size: usize,
        input_size: usize,
        weights: RecurrentWeights,
        activation: RecurrentActivation,
        inner_activation: RecurrentActivation,
        output_all: bool,
        reverse_input: bool,
    },
    Slice {
        axis: SliceAxis,
        start: i64,
        end: i64,
        stride: i64,
    },
    Split {
        n_outputs: usize,
    },
    Reduce {
        axis: String,
        mode: ReduceMode,
        epsilon: f32,
    },
    Reshape {
        target_shape: Vec<i64>,
        order: ReshapeOrder,
    },
    ReorganizeData {
        mode: ReorganizeMode,
        block_size: usize,
    },
    Mvn {
        across_channels: bool,
        normalize_variance: bool,
        epsilon: f32,
    },
    Lrn {
        alpha: f32,
        beta: f32,
        local_size: usize,
        k: f32,
    },
    LoadConstant {
        shape: Vec<i64>,
        constant: WeightParams,
    },
    InnerProduct {
        input_channels: usize,
        output_channels: usize,
        weights: WeightParams,
        bias: Option<WeightParams>,
    },
    Flatten {
        order: ReshapeOrder,
    },
    Convolution {
        kernel_channels: usize,
        output_channels: usize,
        kernel: [usize; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
        border_mode: BorderMode,
        groups: usize,
        weights: WeightParams,
        bias: Option<WeightParams>,
        is_deconv: bool,
        output_shape: Option<[usize; 2]>,
    },
    Pooling {
        pool_type: PoolingType,
        kernel: [usize; 2],
        stride: [usize; 2],
        border_mode: BorderMode,
        exclude_pad_area: bool,
        is_global: bool,
    },
    Bias {
        bias: WeightParams,
        shape: Vec<usize>,
    },
    Scale {
        scale: WeightParams,
        bias: Option<WeightParams>,
        shape_scale: Vec<usize>,
        shape_bias: Vec<usize>,
    },
    Crop {
        top: i64,
        bottom: i64,
        left: i64,
        right: i64,
        offset: Vec<i64>,
    },
    ResizeBilinear {
        target_height: usize,
        target_width: usize,
        mode: ResizeMode,
    },
    CropResize {
        target_height: usize,
        target_width: usize,
        mode: ResizeMode,
        normalized_coordinates: bool,
        spatial_scale: f32,
    },
    Custom {
        class_name: String,
        description: String,
        parameters: indexmap::IndexMap<String, CustomParam>,
    },

    // ---- arbitrary-rank layers ----
    LoadConstantNd {
        shape: Vec<i64>,
        constant: WeightParams,
    },
    ExpandDims {
        axes: Vec<i64>,
    },
    Squeeze {
        axes: Option<Vec<i64>>,
    },
    Transpose {
        axes: Vec<i64>,
    },
    SplitNd {
        axis: i64,
        num_splits: usize,
        split_sizes: Vec<i64>,
    },
    ReshapeStatic {
        target_shape: Vec<i64>,
    },
    RankPreservingReshape {
        target_shape: Vec<i64>,
    },
    ReshapeDynamic,
    ConcatNd {
        axis: i64,
    },
    BatchedMatMul {
        transpose_a: bool,
        transpose_b: bool,
        weights: Option<WeightParams>,
        bias: Option<WeightParams>,
        weight_rows: usize,
        weight_columns: usize,
    },
    Broadcastable {
        op: BinaryOp,
    },
    SliceStatic {
        begin_ids: Vec<i64>,
        end_ids: Vec<i64>,
        strides: Vec<i64>,
        begin_masks: Vec<bool>,
        end_masks: Vec<bool>,
    },
    ReduceNd {
        op: ReduceOp,
        axes: Option<Vec<i64>>,
        keepdims: bool,
        reduce_all: bool,
    },
    GetShape,
    Math {
        op: MathOp,
    },
    Clip {
        min: f32,
        max: f32,
    },
    FillStatic {
        shape: Vec<i64>,
        value: f32,
    },
    FillDynamic {
        value: f32,
    },
    WhereNonZero,
    WhereBroadcastable,
    TopK {
        k: i64,
        axis: i64,
        use_bottom_k: bool,
    },
    Tile {
        reps: Vec<i64>,
    },
    ScatterAlongAxis {
        axis: i64,
        mode: ScatterMode,
    },
    ReverseSequence {
        batch_axis: i64,
        seq_axis: i64,
    },
    RandomNormalStatic {
        shape: Vec<i64>,
        mean: f32,
        stddev: f32,
        seed: i64,
    },
    RandomNormalLike {
        mean: f32,
        stddev: f32,
        seed: i64,
    },
    RandomUniformStatic {
        shape: Vec<i64>,
        minval: f32,
        maxval: f32,
        seed: i64,
    },
    RandomUniformLike {
        minval: f32,
        maxval: f32,
        seed: i64,
    },
    Logical {
        op: LogicalOp,
    },
    Compare {
        op: CompareOp,
        alpha: Option<f32>,
    },
    Gather {
        axis: i64,
    },
    FlattenTo2d {
        axis: i64,
    },
    ConstantPad {
        value: f32,
        pad_amounts: Vec<i64>,
    },
    BroadcastToStatic {
        shape: Vec<i64>,
    },
    BroadcastToDynamic,
    ArgMax {
        axis: i64,
        keepdims: bool,
    },
    ArgMin {
        axis: i64,
        keepdims: bool,
    },
    SoftmaxNd {
        axis: i64,
    },
}

/// First specification version that understands the arbitrary-rank layers
pub const ND_SPEC_VERSION: u32 = 4;

impl LayerKind {
    pub fn activation(activation: Activation) -> Self {
        LayerKind::Activation { activation }
    }

    /// Unary layer with neutral `alpha`, `shift` and `scale`
    pub fn unary(mode: UnaryMode) -> Self {
        LayerKind::Unary {
            mode,
            alpha: 1.0,
            shift: 0.0,
            scale: 1.0,
            epsilon: 1e-6,
        }
    }

    pub fn elementwise(mode: ElementwiseMode, alpha: Option<f32>) -> Self {
        LayerKind::Elementwise { mode, alpha }
    }

    /// Wire name of the layer kind
    pub fn type_name(&self) -> &'static str {
        use LayerKind::*;
        match self {
            Activation { .. } => "activation",
            Unary { .. } => "unary",
            Elementwise { .. } => "elementwise",
            Softmax => "softmax",
            Permute { .. } => "permute",
            Padding { .. } => "padding",
            Batchnorm { .. } => "batchnorm",
            Upsample { .. } => "upsample",
            UniLstm { .. } => "uniDirectionalLSTM",
            BiDirLstm { .. } => "biDirectionalLSTM",
            Gru { .. } => "gru",
            Slice { .. } => "slice",
            Split { .. } => "split",
            Reduce { .. } => "reduce",
            Reshape { .. } => "reshape",
            ReorganizeData { .. } => "reorganizeData",
            Mvn { .. } => "mvn",
            Lrn { .. } => "lrn",
            LoadConstant { .. } => "loadConstant",
            InnerProduct { .. } => "innerProduct",
            Flatten { .. } => "flatten",
            Convolution { .. } => "convolution",
            Pooling { .. } => "pooling",
            Bias { .. } => "bias",
            Scale { .. } => "scale",
            Crop { .. } => "crop",
            ResizeBilinear { .. } => "resizeBilinear",
            CropResize { .. } => "cropResize",
            Custom { .. } => "custom",
            LoadConstantNd { .. } => "loadConstantND",
            ExpandDims { .. } => "expandDims",
            Squeeze { .. } => "squeeze",
            Transpose { .. } => "transpose",
            SplitNd { .. } => "splitND",
            ReshapeStatic { .. } => "reshapeStatic",
            RankPreservingReshape { .. } => "rankPreservingReshape",
            ReshapeDynamic => "reshapeDynamic",
            ConcatNd { .. } => "concatND",
            BatchedMatMul { .. } => "batchedMatmul",
            Broadcastable { .. } => "broadcastable",
            SliceStatic { .. } => "sliceStatic",
            ReduceNd { .. } => "reduceND",
            GetShape => "getShape",
            Math { .. } => "math",
            Clip { .. } => "clip",
            FillStatic { .. } => "fillStatic",
            FillDynamic { .. } => "fillDynamic",
            WhereNonZero => "whereNonZero",
            WhereBroadcastable => "whereBroadcastable",
            TopK { .. } => "topK",
            Tile { .. } => "tile",
            ScatterAlongAxis { .. } => "scatterAlongAxis",
            ReverseSequence { .. } => "reverseSeq",
            RandomNormalStatic { .. } => "randomNormalStatic",
            RandomNormalLike { .. } => "randomNormalLike",
            RandomUniformStatic { .. } => "randomUniformStatic",
            RandomUniformLike { .. } => "randomUniformLike",
            Logical { .. } => "logical",
            Compare { .. } => "compare",
            Gather { .. } => "gather",
            FlattenTo2d { .. } => "flattenTo2D",
            ConstantPad { .. } => "constantPad",
            BroadcastToStatic { .. } => "broadcastToStatic",
            BroadcastToDynamic => "broadcastToDynamic",
            ArgMax { .. } => "argMax",
            ArgMin { .. } => "argMin",
            SoftmaxNd { .. } => "softmaxND",
        }
    }

    /// Lowest specification version that can carry this layer
    pub fn min_spec_version(&self) -> u32 {
        use LayerKind::*;
        match self {
            Activation { .. } | Unary { .. } | Elementwise { .. } | Softmax | Permute { .. }
            | Padding { .. } | Batchnorm { .. } | Upsample { .. } | UniLstm { .. }
            | BiDirLstm { .. } | Gru { .. } | Slice { .. } | Split { .. } | Reduce { .. }
            | Reshape { .. } | ReorganizeData { .. } | Mvn { .. } | Lrn { .. }
            | LoadConstant { .. } | InnerProduct { .. } | Flatten { .. }
            | Convolution { .. } | Pooling { .. } | Bias { .. } | Scale { .. } | Crop { .. }
            | Custom { .. } => 1,
            ResizeBilinear { .. } | CropResize { .. } => 3,
            _ => ND_SPEC_VERSION,
        }
    }

    /// Rank of the outputs given the input ranks (`None` = unknown)
    ///
    /// Layers that keep rank copy the first input's rank.
    pub fn output_rank(&self, inputs: &[Option<usize>]) -> Option<usize> {
        use LayerKind::*;
        let first = inputs.first().copied().flatten();
        let max_of_inputs = || {
            if inputs.is_empty() {
                return None;
            }
            inputs.iter().try_fold(0usize, |acc, r| r.map(|r| acc.max(r)))
        };
        match self {
            LoadConstant { .. } => Some(5),
            Reshape { target_shape, .. } => Some(target_shape.len()),
            LoadConstantNd { shape, .. }
            | FillStatic { shape, .. }
            | BroadcastToStatic { shape }
            | RandomNormalStatic { shape, .. }
            | RandomUniformStatic { shape, .. } => Some(shape.len()),
            ReshapeStatic { target_shape } => Some(target_shape.len()),
            ExpandDims { axes } => first.map(|r| r + axes.len()),
            Squeeze { axes: Some(axes) } => first.map(|r| r.saturating_sub(axes.len()).max(1)),
            Squeeze { axes: None } | ReshapeDynamic | FillDynamic { .. } | BroadcastToDynamic => {
                None
            }
            ReduceNd {
                axes,
                keepdims,
                reduce_all,
                ..
            } => {
                if *keepdims {
                    first
                } else if *reduce_all || first == Some(1) {
                    Some(1)
                } else {
                    let n = axes.as_ref().map_or(0, Vec::len);
                    first.map(|r| r.saturating_sub(n).max(1))
                }
            }
            ArgMax { keepdims, .. } | ArgMin { keepdims, .. } => match first {
                Some(1) => Some(1),
                Some(r) if !keepdims => Some(r - 1),
                r => r,
            },
            Broadcastable { .. } | WhereBroadcastable | Logical { .. } | Compare { .. } => {
                max_of_inputs()
            }
            BatchedMatMul { weights, .. } => {
                if weights.is_some() {
                    first.map(|r| r.max(2))
                } else {
                    max_of_inputs().map(|r| r.max(2))
                }
            }
            GetShape => Some(1),
            WhereNonZero | FlattenTo2d { .. } => Some(2),
            Gather { .. } => match (first, inputs.get(1).copied().flatten()) {
                (Some(a), Some(b)) => Some((a + b).saturating_sub(1)),
                _ => None,
            },
            _ => first,
        }
    }
}

/// One emitted target layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layer {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(flatten)]
    pub kind: LayerKind,
}

impl Layer {
    pub fn new<S: AsRef<str>>(name: &str, inputs: &[S], outputs: &[S], kind: LayerKind) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| s.as_ref().to_string()).collect(),
            outputs: outputs.iter().map(|s| s.as_ref().to_string()).collect(),
            kind,
        }
    }

    /// Single-input single-output layer
    pub fn unary(name: &str, input: &str, output: &str, kind: LayerKind) -> Self {
        Self::new(name, &[input], &[output], kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tensor_from_vec;

    #[test]
    fn test_weights_from_tensor() {
        let t = tensor_from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = WeightParams::from(&t);
        assert_eq!(w.shape, vec![2, 2]);
        assert_eq!(w.values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(WeightParams::filled(3, 0.5).values, vec![0.5; 3]);
    }

    #[test]
    fn test_output_rank_rules() {
        let expand = LayerKind::ExpandDims { axes: vec![0, 3] };
        assert_eq!(expand.output_rank(&[Some(3)]), Some(5));

        let squeeze_all = LayerKind::Squeeze { axes: None };
        assert_eq!(squeeze_all.output_rank(&[Some(3)]), None);
        let squeeze = LayerKind::Squeeze { axes: Some(vec![0]) };
        assert_eq!(squeeze.output_rank(&[Some(1)]), Some(1));

        let add = LayerKind::Broadcastable { op: BinaryOp::Add };
        assert_eq!(add.output_rank(&[Some(2), Some(4)]), Some(4));
        assert_eq!(add.output_rank(&[Some(2), None]), None);

        let reduce = LayerKind::ReduceNd {
            op: ReduceOp::Sum,
            axes: Some(vec![1, 2]),
            keepdims: false,
            reduce_all: false,
        };
        assert_eq!(reduce.output_rank(&[Some(3)]), Some(1));
        assert_eq!(
            LayerKind::Gather { axis: 0 }.output_rank(&[Some(3), Some(2)]),
            Some(4)
        );
        assert_eq!(LayerKind::Softmax.output_rank(&[Some(4)]), Some(4));
    }

    #[test]
    fn test_layer_json_shape() {
        let layer = Layer::unary(
            "relu",
            "x",
            "y",
            LayerKind::Activation {
                activation: Activation::Relu,
            },
        );
        let json = serde_json::to_value(&layer).unwrap();
        assert_eq!(json["type"], "activation");
        assert_eq!(json["mode"], "RELU");
        assert_eq!(json["inputs"][0], "x");
        assert_eq!(layer.kind.type_name(), "activation");
    }

    #[test]
    fn test_capability_levels() {
        let resize = LayerKind::ResizeBilinear {
            target_height: 2,
            target_width: 2,
            mode: ResizeMode::StrictAlignEndpoints,
        };
        assert_eq!(resize.min_spec_version(), 3);
        assert_eq!(LayerKind::GetShape.min_spec_version(), ND_SPEC_VERSION);
        assert_eq!(LayerKind::Softmax.min_spec_version(), 1);
    }
}
