//! Raw serialized test vectors.
//!
//! These are stored as bytes, not chain types, so every crate in the
//! workspace can deserialize them with its own code under test.

use lazy_static::lazy_static;

lazy_static! {
    /// The raw serialized Bitcoin mainnet genesis block (285 bytes).
    pub static ref GENESIS_BLOCK_MAINNET: Vec<u8> = hex::decode(
        "0100000000000000000000000000000000000000000000000000000000000000\
         000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa\
         4b1e5e4a29ab5f49ffff001d1dac2b7c01010000000100000000000000000000\
         00000000000000000000000000000000000000000000ffffffff4d04ffff001d\
         0104455468652054696d65732030332f4a616e2f32303039204368616e63656c\
         6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f75742066\
         6f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe554827\
         1967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4\
         f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000"
    )
    .expect("hard-coded hex decodes");

    /// A minimal coinbase transaction (65 bytes): one BIP 34 height push
    /// input, one `OP_TRUE` output.
    pub static ref DUMMY_TX1: Vec<u8> = hex::decode(
        "0100000001000000000000000000000000000000000000000000000000000000\
         0000000000ffffffff0403900100ffffffff0100f2052a010000000151000000\
         00"
    )
    .expect("hard-coded hex decodes");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_lengths() {
        assert_eq!(GENESIS_BLOCK_MAINNET.len(), 285);
        assert_eq!(DUMMY_TX1.len(), 65);
    }
}
