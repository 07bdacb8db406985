/// A Tokio codec that transforms an `AsyncRead` into a `Stream` of `Message`s.
pub mod codec;
/// Inventory items.
pub mod inv;
/// An enum of all supported network message types.
pub mod message;

/// The twelve-byte command names of the protocol.
pub mod command;
/// Newtype wrappers for primitive types.
pub mod types;

pub use codec::Codec;
pub use command::Command;
pub use inv::InventoryHash;
pub use message::{Message, Version};
