//! Generated client stubs and wire messages for the storage-server RPC
//! surface. Only the client side is compiled; implementing a storage
//! server is out of scope for this crate.

#![allow(clippy::derive_partial_eq_without_eq)]

tonic::include_proto!("grid.v1");
