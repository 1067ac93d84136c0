//! Transport implementations.
//!
//! This module contains concrete implementations of the [`crate::Transport`]
//! and [`crate::Channel`] traits.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryBrokerConfig, InMemoryChannel};
