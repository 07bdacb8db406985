//! The twelve-byte, null-padded ASCII command names used in message
//! headers.

use std::fmt;

/// A recognized protocol command.
///
/// The wire format identifies messages by a 12-byte ASCII string; this enum
/// is the internal representation. Commands outside this set still frame
/// correctly; the codec consumes and drops their bodies.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    Version,
    Verack,
    Addr,
    GetAddr,
    Inv,
    GetData,
    GetBlocks,
    GetHeaders,
    Block,
    Tx,
    Headers,
    Ping,
    Pong,
    Alert,
    FilterLoad,
    FilterAdd,
    FilterClear,
    MerkleBlock,
}

/// All commands, for filters that register against every message.
pub const ALL_COMMANDS: [Command; 18] = [
    Command::Version,
    Command::Verack,
    Command::Addr,
    Command::GetAddr,
    Command::Inv,
    Command::GetData,
    Command::GetBlocks,
    Command::GetHeaders,
    Command::Block,
    Command::Tx,
    Command::Headers,
    Command::Ping,
    Command::Pong,
    Command::Alert,
    Command::FilterLoad,
    Command::FilterAdd,
    Command::FilterClear,
    Command::MerkleBlock,
];

impl Command {
    /// The command's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Addr => "addr",
            Command::GetAddr => "getaddr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::GetBlocks => "getblocks",
            Command::GetHeaders => "getheaders",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::Headers => "headers",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Alert => "alert",
            Command::FilterLoad => "filterload",
            Command::FilterAdd => "filteradd",
            Command::FilterClear => "filterclear",
            Command::MerkleBlock => "merkleblock",
        }
    }

    /// The command's null-padded header field.
    pub fn bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        let name = self.name().as_bytes();
        bytes[..name.len()].copy_from_slice(name);
        bytes
    }

    /// Parse a header command field. Returns `None` for commands outside
    /// the recognized set.
    pub fn from_bytes(bytes: &[u8; 12]) -> Option<Command> {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(12);
        // Padding must be all-null after the name.
        if bytes[end..].iter().any(|b| *b != 0) {
            return None;
        }
        let name = std::str::from_utf8(&bytes[..end]).ok()?;
        ALL_COMMANDS
            .iter()
            .copied()
            .find(|command| command.name() == name)
    }

    /// The handshake messages predate the header checksum field and are
    /// framed without one.
    pub fn has_checksum(&self) -> bool {
        !matches!(self, Command::Version | Command::Verack)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}
