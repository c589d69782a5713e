pub mod graph;

pub use graph::{CascadePolicy, GraphStore, InMemoryGraphStore};
