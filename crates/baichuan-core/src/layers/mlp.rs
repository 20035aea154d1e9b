use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{BaichuanConfig, HiddenAct};
use crate::error::Result;
use crate::layers::parallel::{ColumnLinear, Communicator, RowLinear};

/// Gated feed-forward block: `down(act(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    gate_proj: ColumnLinear,
    up_proj: ColumnLinear,
    down_proj: RowLinear,
    act: HiddenAct,
}

impl GatedMlp {
    pub fn load(cfg: &BaichuanConfig, vb: VarBuilder, comm: Arc<dyn Communicator>) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let ffn = cfg.mlp_hidden_size();
        let gate_proj = ColumnLinear::load(hidden, ffn, false, vb.pp("gate_proj"), comm.clone())?;
        let up_proj = ColumnLinear::load(hidden, ffn, false, vb.pp("up_proj"), comm.clone())?;
        let down_proj = RowLinear::load(ffn, hidden, vb.pp("down_proj"), comm)?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act: cfg.hidden_act,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.act.apply(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&gate.mul(&up)?)
    }
}
