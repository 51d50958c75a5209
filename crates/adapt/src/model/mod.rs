//! Model-side pieces: the capability traits and reference network, energy
//! scoring, and the tensor bridge to host buffers.

pub mod bridge;
pub mod energy;
pub mod network;

pub use network::{AdaptNet, AdaptNetConfig, Backbone, Classifier};
