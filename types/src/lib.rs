#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

mod chain;
mod hash;
pub mod serde_dec;

pub use chain::{BlockInfo, ChainId};
pub use hash::keccak256;
