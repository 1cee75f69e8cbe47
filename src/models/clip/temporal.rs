use super::LayerNorm;
use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

/// Frames in the neighborhood each class token correlates with.
const TEMPORAL_WINDOW: usize = 5;

/// Gathers, for every frame, the patch tokens of its temporal neighborhood.
///
/// Input `(N*T, C, P)`, output `(N*T, C, window_size * P)`; within the last
/// axis the layout is window index major, token minor. Neighbors outside the
/// clip are zeros.
#[derive(Debug, Clone, Copy)]
pub struct UnfoldTemporalWindows {
    window_size: usize,
    window_stride: usize,
    window_dilation: usize,
    padding: usize,
}

impl UnfoldTemporalWindows {
    pub fn new(window_size: usize, window_stride: usize, window_dilation: usize) -> Result<Self> {
        if window_size == 0 || window_stride == 0 || window_dilation == 0 {
            candle_core::bail!(
                "window size {window_size}, stride {window_stride} and dilation {window_dilation} must be positive"
            )
        }
        let padding = (window_size + (window_size - 1) * (window_dilation - 1) - 1) / 2;
        Ok(Self {
            window_size,
            window_stride,
            window_dilation,
            padding,
        })
    }

    pub fn forward(&self, xs: &Tensor, frames: usize) -> Result<Tensor> {
        let (nt, c, p) = xs.dims3()?;
        if frames == 0 || nt % frames != 0 {
            candle_core::bail!("batch {nt} is not a whole number of {frames}-frame clips")
        }
        let span = self.window_dilation * (self.window_size - 1);
        let padded = frames + 2 * self.padding;
        if padded < span + 1 || (padded - span - 1) / self.window_stride + 1 != frames {
            candle_core::bail!(
                "window {}x{} (stride {}) does not preserve {frames} frames",
                self.window_size,
                self.window_dilation,
                self.window_stride
            )
        }
        let xs = xs
            .reshape((nt / frames, frames, c, p))?
            .pad_with_zeros(1, self.padding, self.padding)?;
        let windows = (0..self.window_size)
            .map(|k| xs.narrow(1, k * self.window_dilation, frames))
            .collect::<Result<Vec<_>>>()?;
        // (N, T, C, window, P) -> (N*T, C, window*P)
        Tensor::stack(&windows, 3)?.reshape((nt, c, self.window_size * p))
    }
}

/// Sigmoid-gated correlation of query tokens against neighborhood tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationModule;

impl CorrelationModule {
    /// `xs`: `(L, N, D)`, `upfold`: `(O, N, D)`, returns `(L, N, D)`.
    pub fn forward(&self, xs: &Tensor, upfold: &Tensor) -> Result<Tensor> {
        let (_, _, d) = xs.dims3()?;
        let xs = xs.transpose(0, 1)?.contiguous()?;
        let upfold = upfold.transpose(0, 1)?.contiguous()?;
        // (N, L, O)
        let affinities = (xs.matmul(&upfold.t()?)? / (d as f64).sqrt())?;
        let gates = (candle_nn::ops::sigmoid(&affinities)? - 0.5)?;
        gates.matmul(&upfold)?.transpose(0, 1)?.contiguous()
    }
}

/// Produces a temporal summary for the class token of every frame.
#[derive(Debug, Clone)]
pub struct TemporalAggregationBlock {
    attn: CorrelationModule,
    ln_1: LayerNorm,
    upfold: UnfoldTemporalWindows,
}

impl TemporalAggregationBlock {
    pub fn new(vb: VarBuilder, d_model: usize) -> Result<Self> {
        log::debug!("building {}", vb.prefix());
        Ok(Self {
            attn: CorrelationModule,
            ln_1: LayerNorm::new(vb.pp("ln_1"), d_model)?,
            upfold: UnfoldTemporalWindows::new(TEMPORAL_WINDOW, 1, 1)?,
        })
    }

    /// `xs`: `(L, N*T, D)`, returns `(1, N*T, D)`.
    pub fn forward(&self, xs: &Tensor, frames: usize) -> Result<Tensor> {
        let xs = self.ln_1.forward(xs)?;
        let len = xs.dim(0)?;
        let cls = xs.narrow(0, 0, 1)?;
        // LND -> NDL -> unfold -> LND
        let patches = xs.narrow(0, 1, len - 1)?.permute((1, 2, 0))?;
        let upfold = self
            .upfold
            .forward(&patches, frames)?
            .permute((2, 0, 1))?;
        self.attn.forward(&cls, &upfold)
    }
}
