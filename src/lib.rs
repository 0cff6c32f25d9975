#![allow(dead_code)]

pub mod bitfield;
pub mod config;
pub mod controller;
pub mod dht;
pub mod meta;
pub mod peer;
pub mod piece_store;
pub mod shared;
pub mod swarm;
pub mod wire;

pub use bitfield::Bitfield;
pub use meta::Meta;
