// Swarm Node
//
// This crate implements the chunk distribution plane of a node in a
// content-addressed storage overlay. Chunks are pushed toward the peers whose
// overlay address is closest to the chunk address, replicated in that
// neighbourhood and served back on request by forwarding toward it. Every
// forwarded chunk is metered in a per-peer ledger; debts are cancelled in-band
// by pseudosettle refreshments or paid through an injected settlement
// capability.
//
// # Architecture
//
// * **Protocols**: pushsync, retrieval and pseudosettle over framed streams
// * **Accounting**: per-peer balances, reservations and thresholds
// * **Pusher**: drains the local push index with bounded concurrency
// * **Collaborators**: topology, chunk store, pricer, signer and transport
//   are traits with in-memory implementations
//
// # Usage
//
// ```rust,no_run
// use swarm_node::config::Config;
// use swarm_node::crypto::DefaultSigner;
// use swarm_node::node::{Node, NodeOptions};
// use swarm_node::p2p::MemoryNetwork;
// use std::sync::Arc;
//
// async fn example() -> swarm_node::error::Result<()> {
//     let network = MemoryNetwork::new();
//     let a = Node::start(Config::default(), Arc::new(DefaultSigner::random()), &network, NodeOptions::default())?;
//     let b = Node::start(Config::default(), Arc::new(DefaultSigner::random()), &network, NodeOptions::default())?;
//     network.connect(a.overlay(), b.overlay()).await?;
//
//     let address = a.upload(b"hello", 0).await?;
//     let chunk = b.download(&address).await?;
//     assert_eq!(chunk.payload(), b"hello");
//     Ok(())
// }
// ```
//
// # Modules Overview

/// Per-peer ledger metering forwarded chunks.
///
/// Reservations guard outgoing requests, shadow reservations guard incoming
/// ones, and both are committed or released through RAII actions.
pub mod accounting;

/// Node configuration loaded from TOML with environment overrides.
pub mod config;

/// Signing capability, signature recovery and overlay derivation.
pub mod crypto;

/// Error types shared by every component.
pub mod error;

/// Atomic counters per component with serializable snapshots.
pub mod metrics;

/// Wiring of all components for one node.
pub mod node;

/// Stream layer, handshake and the in-process transport.
pub mod p2p;

/// Chunk pricing by proximity.
pub mod pricer;

/// Push index loop handing local uploads to pushsync.
pub mod pusher;

/// Pushsync protocol: forwarding chunks to their neighbourhood for receipts.
pub mod pushsync;

/// Retrieval protocol: fetching chunks by forwarding toward them.
pub mod retrieval;

/// Settlement worker, payment capability and the pseudosettle protocol.
pub mod settlement;

/// Chunk store interface and the in-memory store.
pub mod storage;

/// Upload progress tags.
pub mod tags;

/// Topology interface and the in-memory peer table.
pub mod topology;

/// Addresses, proximity and chunks.
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;
