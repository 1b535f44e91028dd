//! Índice vectorial opcional sobre `:TextUnit(embedding)`.
//!
//! Sólo entra en juego cuando hay modelo de embeddings configurado: sirve
//! para sembrar la consulta local cuando la pregunta no casa léxicamente
//! con ninguna entidad. Los caminos principales del motor no dependen de
//! este índice.

use neo4rs::query;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::graph_store::GraphStore;
use crate::llm::LlmManager;

const INDEX_NAME: &str = "textunitEmbeddingIndex";

/// Garantiza que el índice vectorial sobre `:TextUnit(embedding)` exista,
/// con la dimensión del modelo de embeddings configurado.
pub async fn ensure_textunit_vector_index(
    store: &GraphStore,
    dimensions: usize,
) -> EngineResult<()> {
    let graph = store.inner();

    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", INDEX_NAME),
        )
        .await?;
    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{INDEX_NAME}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {INDEX_NAME}
FOR (t:TextUnit)
ON (t.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
    );
    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{INDEX_NAME}' creado.");
    Ok(())
}

/// Guarda el embedding de una unidad de texto.
pub async fn store_textunit_embedding(
    store: &GraphStore,
    textunit_id: &str,
    vector: &[f64],
) -> EngineResult<()> {
    store
        .inner()
        .run(
            query("MATCH (t:TextUnit {id: $id}) SET t.embedding = $embedding")
                .param("id", textunit_id)
                .param("embedding", vector.to_vec()),
        )
        .await?;
    Ok(())
}

/// Siembra semántica: embedding de la pregunta, búsqueda vectorial sobre
/// las unidades de texto y salto por MENTIONS hasta las entidades.
pub async fn semantic_seed_entities(
    store: &GraphStore,
    llm: &LlmManager,
    question: &str,
    top_k: usize,
) -> EngineResult<Vec<String>> {
    if !llm.supports_embeddings() {
        return Ok(Vec::new());
    }

    let vectors = llm.embed(&[question.to_string()]).await?;
    let question_vec = vectors
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Parse("No se pudo generar embedding de la pregunta".into()))?;

    let mut cursor = store
        .inner()
        .execute(
            query(
                "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                 YIELD node, score
                 MATCH (node)-[:MENTIONS]->(e:Entity)
                 RETURN DISTINCT e.id AS id
                 LIMIT $k",
            )
            .param("index_name", INDEX_NAME)
            .param("k", top_k as i64)
            .param("embedding", question_vec),
        )
        .await?;

    let mut ids = Vec::new();
    while let Some(row) = cursor.next().await? {
        if let Some(id) = row.get::<String>("id") {
            ids.push(id);
        }
    }
    Ok(ids)
}
