//! Cairn Config
//!
//! Serializable pipeline definitions. A [`PipelineDef`] names its units (the
//! commands it runs and their declared fields), the nodes that use them, and
//! the edges between nodes. [`PipelineDef::build`] compiles a definition into
//! a [`Graph`](cairn_workflow::Graph) ready for the executor.
//!
//! Pipelines are JSON:
//!
//! ```json
//! {
//!   "name": "smooth",
//!   "units": [{
//!     "name": "blur",
//!     "program": "blur",
//!     "args": ["{{ image }}", "--fwhm", "{{ fwhm }}", "-o", "out.nii"],
//!     "inputs": [
//!       { "name": "image", "type": "file", "required": true },
//!       { "name": "fwhm", "type": "number", "default": 4 }
//!     ],
//!     "outputs": [
//!       { "name": "out", "type": "file", "source": { "from": "path", "path": "out.nii" } }
//!     ]
//!   }],
//!   "nodes": [
//!     { "node_id": "blur", "unit": "blur", "iterate": [{ "field": "image", "values": ["a.nii", "b.nii"] }] }
//!   ],
//!   "edges": []
//! }
//! ```

mod edge;
mod error;
mod node;
mod pipeline;
mod unit;

pub use edge::EdgeDef;
pub use error::ConfigError;
pub use node::{IterateDef, NodeDef};
pub use pipeline::PipelineDef;
pub use unit::{OutputDef, UnitDef};
