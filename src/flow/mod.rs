//! Flow execution engine (§4.J): a tagged node graph with a per-tag
//! executor registry, a dotted-path variable store, and a sandboxed
//! `${...}` expression grammar.

pub mod executor;
pub mod expr;
pub mod graph;
pub mod node;
pub mod tools;

pub use executor::{EngineDeps, ExecContext, FlowEvent, NodeExecutor, RunOptions};
pub use graph::{Edge, Graph, GraphNode};
pub use node::{ContextMessage, ExecutionState, Node};
