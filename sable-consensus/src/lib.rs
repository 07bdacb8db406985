//! Consensus checks and script verification for sable.
//!
//! The checks in [`block`] are context-free validation functions; [`script`]
//! implements the signature-verification primitive; [`verifier`] runs that
//! primitive across worker threads with short-circuit failure.

pub mod block;
pub mod error;
pub mod script;
pub mod verifier;

pub use verifier::VerifierPool;
