//! Domain model for selective salience compression.
//!
//! Turns are owned by the caller and only read; salience items belong to the
//! session's salience set once accepted; compression events form an
//! append-only audit log.

pub mod error;
pub mod event;
pub mod item;
pub mod turn;

pub use error::{CapabilityError, ConfigError, SalienceError, ValidationError};
pub use event::{compression_ratio, CompressionEvent, CompressionState, StateTransition};
pub use item::{item_id, Category, SalienceItem};
pub use turn::{
    contains_normalized, normalize_whitespace, render_turns, ConversationTurn, Role,
};
