//! Cairn Workflow
//!
//! The static and dynamic shape of a pipeline:
//! - [`Graph`]: nodes ([`NodeSpec`]) and typed [`Edge`]s, kept acyclic as it
//!   is built, validated as a whole before a run
//! - [`Node`]: one concrete instance of a graph node with resolved
//!   parameters, fingerprint, working directory, and [`NodeState`]
//! - [`fanout`]: Cartesian-product expansion of nodes over iterable inputs
//!   and collection of instance outputs back into lists

mod edge;
mod error;
pub mod fanout;
mod graph;
mod node;

pub use edge::{Edge, EdgeTransform};
pub use error::WorkflowError;
pub use fanout::FanOutPolicy;
pub use graph::Graph;
pub use node::{Node, NodeFailure, NodeSpec, NodeState};
