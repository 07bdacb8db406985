//! Errors that can occur when checking consensus rules.
//!
//! Each error variant corresponds to a consensus rule; the string forms end
//! up in peer-facing reject reasons and log lines.

use thiserror::Error;

use sable_chain::{block, work::difficulty::ExpandedDifficulty};

#[derive(Error, Clone, Debug, PartialEq)]
pub enum TransactionError {
    #[error("first transaction must be coinbase")]
    CoinbasePosition,

    #[error("coinbase input found in non-coinbase transaction")]
    CoinbaseInputFound,

    #[error("transaction has no inputs or no outputs")]
    NoFunds,

    #[error("transaction spends an unknown output {0:?}")]
    MissingOutput(sable_chain::transparent::OutPoint),

    #[error("output {0:?} is already spent")]
    DoubleSpend(sable_chain::transparent::OutPoint),

    #[error("script verification failed: {0}")]
    Script(String),
}

#[derive(Error, Clone, Debug, PartialEq)]
pub enum BlockError {
    #[error("block has no transactions")]
    NoTransactions,

    #[error("block {1:?} at height {0:?} has an invalid difficulty field")]
    InvalidDifficulty(block::Height, block::Hash),

    #[error("block {1:?} at height {0:?} has a difficulty threshold easier than the network limit")]
    TargetDifficultyLimit(block::Height, block::Hash, ExpandedDifficulty),

    #[error("block {1:?} at height {0:?} does not satisfy its own difficulty threshold")]
    DifficultyFilter(block::Height, block::Hash, ExpandedDifficulty),

    #[error("merkle root mismatch: computed {actual:?}, header says {expected:?}")]
    BadMerkleRoot {
        actual: block::merkle::Root,
        expected: block::merkle::Root,
    },

    #[error("block contains duplicate transactions")]
    DuplicateTransaction,

    #[error("block time is invalid: {0}")]
    Time(String),

    #[error("invalid transaction: {0}")]
    Transaction(#[from] TransactionError),
}

// BlockTimeError is not Clone, so it is flattened to its message here.
impl From<block::BlockTimeError> for BlockError {
    fn from(e: block::BlockTimeError) -> Self {
        BlockError::Time(e.to_string())
    }
}
