//! Double-SHA256 hashing, the hash function used for block hashes,
//! transaction ids, and message checksums.

use std::io;

use sha2::{Digest, Sha256};

/// A writer that accumulates data and produces a double-SHA256 digest.
#[derive(Default)]
pub struct Writer {
    hash: Sha256,
}

impl Writer {
    /// Consume the writer and produce the hash result.
    pub fn finish(self) -> [u8; 32] {
        let result1 = self.hash.finalize();
        let result2 = Sha256::digest(&result1);
        let mut buffer = [0u8; 32];
        buffer[0..32].copy_from_slice(&result2[0..32]);
        buffer
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hash.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The first four bytes of a double-SHA256 digest, used as a message
/// checksum by the network protocol.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Checksum(pub [u8; 4]);

impl<'a> From<&'a [u8]> for Checksum {
    fn from(bytes: &'a [u8]) -> Self {
        use std::io::Write;
        let mut hash_writer = Writer::default();
        hash_writer
            .write_all(bytes)
            .expect("writing to a hash writer is infallible");
        let hash = hash_writer.finish();
        let mut checksum = [0u8; 4];
        checksum[0..4].copy_from_slice(&hash[0..4]);
        Self(checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_empty_payload() {
        // sha256d("") starts with 5d f6 e0 e2
        assert_eq!(Checksum::from(&b""[..]), Checksum([0x5d, 0xf6, 0xe0, 0xe2]));
    }

    #[test]
    fn checksum_is_double_hash_prefix() {
        let payload = b"sable";
        let first = Sha256::digest(&payload[..]);
        let second = Sha256::digest(&first);
        assert_eq!(Checksum::from(&payload[..]).0[..], second[0..4]);
    }
}
