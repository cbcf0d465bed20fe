//! Client-side core of the Asheron's Call network protocol: packet
//! framing, the composite checksum, the ISAAC-derived keystream, fragment
//! reassembly, per-packet reliability, the session handshake state
//! machine, and the opcode dispatch layer above it.
//!
//! This crate stops at decoded bytes and typed session events; it has no
//! opinion on game state, entity models, or anything built from the
//! messages it moves. See each module's docs for the corresponding piece
//! of the wire protocol.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod composite;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod framing;
pub mod integrity;
pub mod keystream;
pub mod primitives;
pub mod reassembly;
pub mod reliability;
pub mod seq;
pub mod session;
pub mod stats;

#[cfg(feature = "std")]
pub mod driver;

pub use config::SessionConfig;
pub use error::CoreError;
pub use events::{DisconnectReason, SessionEvent};
pub use session::{Session, SessionState};
pub use stats::Stats;
