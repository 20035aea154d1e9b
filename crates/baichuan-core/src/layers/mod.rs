//! Building blocks of the Baichuan decoder.

pub mod alibi;
pub mod attention;
pub mod mlp;
pub mod parallel;
pub mod rotary;

pub use alibi::{alibi_slopes, AlibiBias};
pub use attention::{Attention, Segment};
pub use mlp::GatedMlp;
pub use parallel::{local_group, ColumnLinear, Communicator, RowLinear, SingleRank};
pub use rotary::RotaryEmbedding;
