//! Core types shared by every Splash process.
//!
//! Provides the [`Value`] tagged sum carried by attribute messages and tree
//! leaves, the [`SerializedObject`] byte buffer exchanged between World and
//! Scenes, the wire codec used to frame both, and the microsecond clock used
//! to stamp updates.

// crate-specific lint exceptions:
//#![allow()]

pub mod clock;
pub mod codec;
pub mod serialized;
pub mod value;

pub use codec::{CodecError, MessageFrame};
pub use serialized::SerializedObject;
pub use value::{TypeCode, Value, ValueKind, Values};
