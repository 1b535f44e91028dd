//! Utilidades compartidas por los escenarios de integración: un backend
//! LLM guionizado por contenido del prompt y el arranque del motor contra
//! el Neo4j de pruebas (variable NEO4J_TEST_URI).

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use neo4j_graphrag_engine::config::AppConfig;
use neo4j_graphrag_engine::engine::GraphRagEngine;
use neo4j_graphrag_engine::graph_store::GraphStore;
use neo4j_graphrag_engine::llm::{LlmBackend, LlmCallError, LlmManager, LlmRequest};

/// Los escenarios comparten la base de datos de pruebas; se serializan.
pub fn test_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Backend guionizado: la primera regla cuyo patrón aparezca en el prompt
/// gana; sin regla, responde un valor por defecto razonable según el tipo
/// de prompt.
#[derive(Default, Clone)]
pub struct MockLlm {
    rules: Vec<(String, String)>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    async fn complete(&self, req: &LlmRequest) -> Result<String, LlmCallError> {
        for (needle, reply) in &self.rules {
            if req.prompt.contains(needle.as_str()) {
                return Ok(reply.clone());
            }
        }

        let p = &req.prompt;
        let reply = if p.contains("única letra") {
            "N".to_string()
        } else if p.contains("empezar la exploración del grafo") {
            r#"{"entities": []}"#.to_string()
        } else if p.contains("Puntúa cada relación") || p.contains("Puntúa cada entidad") {
            r#"{"scores": []}"#.to_string()
        } else if p.contains("¿Bastan estos hechos") {
            r#"{"sufficient": false, "confidence": 0.4}"#.to_string()
        } else if p.contains("informe de una comunidad") {
            r#"{"title": "Comunidad", "summary": "Resumen de la comunidad",
                "rating": 5.0, "significance": "medium", "findings": []}"#
                .to_string()
        } else if p.contains("Resume lo que este lote aporta") {
            r#"{"batch_summary": "Lote sin configurar", "importance_score": 5}"#.to_string()
        } else if p.contains("Resúmenes intermedios") {
            r#"{"answer": "Síntesis sin configurar.", "citations": [], "confidence": 0.6}"#
                .to_string()
        } else if p.contains("usando exclusivamente el contexto") {
            r#"{"answer": "No lo sé.", "citations": [], "confidence": 0.3}"#.to_string()
        } else if p.contains("razonando SOLO") {
            r#"{"answer": "Respuesta anclada sin configurar.", "confidence": 0.6}"#.to_string()
        } else if p.contains("no recuperó hechos") {
            r#"{"answer": "Sin anclaje en los documentos.", "confidence": 0.2}"#.to_string()
        } else if p.contains("¿Son la misma entidad?") {
            r#"{"are_same": false, "confidence": 0.2, "canonical_name": "", "reasoning": ""}"#
                .to_string()
        } else if p.contains("descripción coherente") {
            "Descripción consolidada.".to_string()
        } else {
            // Extracción (inicial o gleaning) sin regla: sin registros.
            "<COMPLETE>".to_string()
        };
        Ok(reply)
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f64>>, LlmCallError> {
        Err(LlmCallError::Fatal("el mock no genera embeddings".into()))
    }
}

/// Configuración del motor apuntando al Neo4j de pruebas, o `None` si el
/// entorno no lo define.
pub fn test_config() -> Option<AppConfig> {
    let uri = std::env::var("NEO4J_TEST_URI").ok()?;
    let mut cfg = AppConfig::default();
    cfg.neo4j_uri = uri;
    cfg.neo4j_user = std::env::var("NEO4J_TEST_USER").unwrap_or_else(|_| "neo4j".to_string());
    cfg.neo4j_password = std::env::var("NEO4J_TEST_PASSWORD").unwrap_or_default();
    cfg.llm.rate_limit_rpm = 6000;
    cfg.llm.max_retries = 0;
    Some(cfg)
}

/// Arranca el motor con el grafo purgado y el backend guionizado.
pub async fn engine_with(cfg: AppConfig, mock: MockLlm) -> (GraphRagEngine, GraphStore) {
    let store = GraphStore::connect(&cfg).await.expect("conexión a Neo4j");
    store.ensure_schema().await.expect("esquema");
    store.purge_graph().await.expect("purga");
    let llm = LlmManager::with_backend(Arc::new(mock), &cfg.llm);
    let engine = GraphRagEngine::with_handles(cfg, store.clone(), llm).expect("cableado");
    (engine, store)
}
