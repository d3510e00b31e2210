//! # quorum-primitives
//!
//! leaf primitives of the quorum task network:
//!
//! - [`identity`]: secp256k1 recoverable signatures and keccak addresses
//! - [`filter`]: the quorum bloom filter and its versioned byte format
//! - [`seal`]: ecies sealing of task results to a per-task ephemeral key
//! - [`canonical`]: canonical json, the only byte form that gets signed
//!
//! ## usage
//!
//! ```rust
//! use quorum_primitives::{identity, KeyPair, QuorumFilter};
//!
//! let participant = KeyPair::generate();
//! let mut quorum = QuorumFilter::new(3, 0.01).unwrap();
//! quorum.add(participant.address().as_bytes());
//!
//! let signature = participant.sign(b"payload").unwrap();
//! let signer = identity::recover_signer(&signature, b"payload").unwrap();
//! assert!(quorum.contains(signer.as_bytes()));
//! ```

#![forbid(unsafe_code)]

pub mod canonical;
pub mod error;
pub mod filter;
pub mod identity;
pub mod seal;

pub use canonical::{to_canonical_json, to_canonical_string};
pub use error::{Error, Result};
pub use filter::{FilterParams, HashScheme, QuorumFilter};
pub use identity::{
    digest, recover_address, recover_signer, sign, Address, KeyPair, RecoverableSignature,
};

pub use k256::ecdsa::VerifyingKey as PublicKey;
