// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PeerPigeon Mesh — Core Library
//!
//! A self-healing peer-to-peer mesh: a signaling relay gets peers talking
//! long enough to strike a direct WebRTC-style connection, after which the
//! relay becomes a convenience rather than a dependency. Messages travel by
//! epidemic gossip; keys and values live in a Kademlia-flavored WebDHT
//! spread across whoever is closest by XOR distance.
//!
//! ## Architecture
//!
//! - **signaling** — relay client: connect/reconnect with backoff, frame
//!   exchange, elected keep-alive pings.
//! - **connection** — the bounded slot set of direct peer connections: the
//!   handshake state machine and the admission control that guards it.
//! - **discovery** — tracks peers learned via signaling, and the
//!   eviction/optimizer policy that decides who to connect to and who to
//!   drop.
//! - **gossip** — epidemic broadcast and directed messaging: TTL, loop
//!   suppression, duplicate suppression.
//! - **dht** — the WebDHT: hash ring, records, replication, conflict
//!   resolution, and outstanding-query tracking.
//! - **transport** — the injected capability-set abstraction both
//!   signaling and connection depend on, so the mesh core never hardcodes a
//!   WebSocket or WebRTC library.
//!
//! Everything above is orchestrated by [`Mesh`], the one type applications
//! construct directly.
//!
//! ## Design Philosophy
//!
//! 1. Most failures are events, not `Result`s — a lost peer is mesh life,
//!    not an application error.
//! 2. No module reaches for global state; every dependency is passed in at
//!    construction.
//! 3. Every public API is documented.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod dht;
pub mod error;
pub mod events;
pub mod gossip;
pub mod mesh;
pub mod metrics;
pub mod peer_id;
pub mod signaling;
pub mod transport;
pub mod wire;

pub use config::MeshConfig;
pub use error::MeshError;
pub use events::MeshEvent;
pub use mesh::Mesh;
pub use peer_id::PeerId;
