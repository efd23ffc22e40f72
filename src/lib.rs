//! KYRO Hub - Real-time Collaboration Server
//!
//! The hub at the center of the KYRO code-editing service: accepts many
//! concurrent client sessions per room, fans out CRDT document updates and
//! presence between them, persists authoritative room state, and enforces
//! membership, capacity, and access rules.

// ============ Core Modules ============
pub mod config;
pub mod error;
pub mod hub;
pub mod server;

// ============ Room Engine ============
pub mod document;
pub mod presence;
pub mod registry;
pub mod room;
pub mod session;

// ============ Admission & Identity ============
pub mod admission;
pub mod principal;

// ============ Persistence ============
pub mod store;

// ============ Wire Protocol ============
pub mod protocol;
