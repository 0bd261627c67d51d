//! Object identity for the gitref reference database.
//!
//! This crate provides the `ObjectId` type — the immutable 20-byte object
//! identifier a reference ultimately points at — together with its canonical
//! 40-character lowercase hex encoding.

mod error;
pub mod hex;
mod oid;

pub use error::HashError;
pub use oid::ObjectId;
