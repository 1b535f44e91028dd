//! Motor GraphRAG sobre Neo4j: indexa corpus Markdown en un grafo tipado de
//! entidades, relaciones, afirmaciones y comunidades jerárquicas, y responde
//! preguntas en tres modos: Local, Global (Map-Reduce sobre resúmenes de
//! comunidad) y Tree-of-Graphs (razonamiento multi-salto sobre el grafo).

pub mod chunker;
pub mod community;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod global_query;
pub mod graph_store;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod resolve;
pub mod retrieval;
pub mod summarize;
pub mod tog;
pub mod vector_store;

pub use config::{AppConfig, PruningMethod, ToGConfig};
pub use engine::GraphRagEngine;
pub use error::{EngineError, EngineResult};
pub use models::{GlobalAnswer, GraphStats, LocalAnswer, QueryMode, ToGAnswer};
