use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FecError {
    #[error("invalid shard counts: {data} data, {parity} parity")]
    InvalidShardCount { data: usize, parity: usize },

    #[error("too few shards present: {present} of {needed} needed")]
    TooFewShards { present: usize, needed: usize },

    #[error("shard size mismatch")]
    ShardSizeMismatch,

    #[error("singular decode submatrix")]
    Singular,
}
