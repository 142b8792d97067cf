//! # P++ data model
//!
//! Kinds, type descriptors and compile-time constants shared by the
//! compiler and the machine's native routines.
//!
//! Every runtime value is one 64-bit word: integers as-is, floats as their
//! IEEE bit pattern, arrays and strings as heap handle ids, function values
//! as a packed (static link, address) pair.

pub mod types;

pub use types::{
    ArrayDesc, ConstValue, FunctionDesc, IntFlags, Kind, ParamDesc, Type, kinds_match,
    signatures_match,
};
