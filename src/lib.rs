//! Core of a container SDN control plane: cluster-coordinated network and
//! address allocation, OVS bridge/port lifecycle, and per-container
//! namespace wiring. Process glue (CLI parsing, the HTTP surface, signal
//! handling) lives in the `agent` binary crate; this crate is everything
//! that surface calls into.

pub mod bitmap;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod firewall;
pub mod kv;
pub mod netlink;
pub mod network;
pub mod ovsdb;
pub mod peer;
pub mod registry;
pub mod syncer;

