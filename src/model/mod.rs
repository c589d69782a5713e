pub mod edge;
pub mod embedding;
pub mod node;
pub mod value;

pub use edge::{Edge, EdgePatch, EdgeType};
pub use embedding::{cosine_similarity, EmbeddingProvider, HashEmbedder};
pub use node::{Metadata, Node, NodePatch, NodeType};
pub use value::{Criteria, Predicate, PropertyAccess};
