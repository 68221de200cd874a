//! # Core Wire Layer
//!
//! The marshalling engine and frame codec underneath every transport.
//!
//! ## Components
//! - **wire**: typed wire values and the compile-time field descriptor table
//! - **marshal**: presence-flagged, length-prefixed field encoding/decoding
//! - **codec**: the length-prefixed transport frame for `Framed` streams

pub mod codec;
pub mod marshal;
pub mod wire;

pub use codec::{Frame, FrameCodec};
pub use marshal::{decode, encode, MarshalSpec};
pub use wire::{FieldDescriptor, Wire, WireType, WireValue};
