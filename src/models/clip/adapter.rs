use super::QuickGelu;
use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

const BOTTLENECK_RATIO: f64 = 0.25;

/// Bottleneck adapter. `c_out` starts at zero so a fresh adapter adds nothing.
#[derive(Debug, Clone)]
pub struct Adapter {
    c_in: Linear,
    c_out: Linear,
    skip_connect: bool,
}

impl Adapter {
    pub fn new(vb: VarBuilder, d_model: usize, skip_connect: bool) -> Result<Self> {
        let hidden = (d_model as f64 * BOTTLENECK_RATIO) as usize;
        let vb = vb.pp("mlp");
        let c_in = candle_nn::linear(d_model, hidden, vb.pp("c_in"))?;
        let vb_out = vb.pp("c_out");
        let c_out = Linear::new(
            vb_out.get_with_hints((d_model, hidden), "weight", Init::Const(0.))?,
            Some(vb_out.get_with_hints(d_model, "bias", Init::Const(0.))?),
        );
        Ok(Self {
            c_in,
            c_out,
            skip_connect,
        })
    }
}

impl candle_nn::Module for Adapter {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.apply(&self.c_in)?.apply(&QuickGelu)?.apply(&self.c_out)?;
        if self.skip_connect {
            ys + xs
        } else {
            Ok(ys)
        }
    }
}
