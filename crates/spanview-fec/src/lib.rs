//! Reed–Solomon forward error correction over video frames: a GF(2⁸)
//! systematic erasure codec plus the sender-side grouper and
//! receiver-side group assembler that wrap it.

mod gf256;

pub mod error;
pub mod group;
pub mod rs;

pub use error::FecError;
pub use group::{AssemblyOutcome, GroupAssembler, GroupEncoder, RecoveredFrame};
pub use rs::{ReedSolomon, MAX_SHARDS};
