pub mod barrier;
pub(crate) mod spin;

pub use barrier::{MmBarrier, MoBarrier, OmBarrier, RmoBarrier};
