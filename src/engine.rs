//! Fachada del motor GraphRAG: cableado explícito de dependencias sobre los
//! dos manejadores de larga vida (almacén de grafo y pasarela LLM) y las
//! operaciones externas de ingesta, consulta y administración. Cada consulta
//! corre bajo un plazo global; al agotarse, el resultado parcial se descarta.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker::{Chunker, TokenCounter};
use crate::community::{CommunityBuilder, DetectionSummary};
use crate::config::{AppConfig, ToGConfig};
use crate::error::{EngineError, EngineResult};
use crate::extract::Extractor;
use crate::global_query::GlobalQueryEngine;
use crate::graph_store::GraphStore;
use crate::ingest::{IngestOutcome, IngestionPipeline, IngestionSummary};
use crate::llm::LlmManager;
use crate::models::{
    EntityNode, GlobalAnswer, GraphStats, LocalAnswer, QueryMode, QueryNode, ToGAnswer,
};
use crate::prompts;
use crate::resolve::{lcs_ratio, Resolver};
use crate::retrieval::ContextAssembler;
use crate::summarize::CommunitySummarizer;
use crate::tog::{tokenize, ToGEngine};
use crate::vector_store;

/// Similitud mínima entre un token de la pregunta y un nombre de entidad
/// para sembrar la consulta local.
const LOCAL_SEED_THRESHOLD: f64 = 0.6;
/// Nivel de comunidad usado por la consulta global.
const GLOBAL_COMMUNITY_LEVEL: i64 = 0;

#[derive(Debug, Clone, Deserialize)]
struct LocalReply {
    answer: String,
    #[serde(default)]
    citations: Vec<String>,
    confidence: f64,
}

/// Motor completo, listo para ser expuesto por un adaptador (CLI, HTTP…).
#[derive(Clone)]
pub struct GraphRagEngine {
    cfg: AppConfig,
    store: GraphStore,
    llm: LlmManager,
    pipeline: IngestionPipeline,
    assembler: ContextAssembler,
    global: GlobalQueryEngine,
    tog: ToGEngine,
    communities: CommunityBuilder,
    summarizer: CommunitySummarizer,
}

impl std::fmt::Debug for GraphRagEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRagEngine").finish()
    }
}

impl GraphRagEngine {
    /// Conecta con Neo4j, asegura el esquema y cablea todos los
    /// componentes. Único punto de construcción en producción.
    pub async fn connect(cfg: AppConfig) -> EngineResult<Self> {
        cfg.validate()?;
        let store = GraphStore::connect(&cfg).await?;
        store.ensure_schema().await?;
        let llm = LlmManager::from_config(&cfg.llm)?;
        if llm.supports_embeddings() {
            vector_store::ensure_textunit_vector_index(&store, cfg.llm.embedding_dimensions)
                .await?;
        }
        Self::with_handles(cfg, store, llm)
    }

    /// Cableado sobre manejadores ya construidos (pruebas incluidas).
    pub fn with_handles(cfg: AppConfig, store: GraphStore, llm: LlmManager) -> EngineResult<Self> {
        let counter = TokenCounter::new()?;
        let chunker = Chunker::new(counter.clone(), cfg.chunking.clone());
        let extractor = Extractor::new(llm.clone(), cfg.extraction.clone());
        let resolver = Resolver::new(store.clone(), llm.clone(), cfg.resolution.clone());
        let communities = CommunityBuilder::new(store.clone(), cfg.community.clone());
        let summarizer = CommunitySummarizer::new(store.clone(), llm.clone());
        let assembler =
            ContextAssembler::new(store.clone(), counter.clone(), cfg.retrieval.clone());
        let global = GlobalQueryEngine::new(
            llm.clone(),
            counter.clone(),
            cfg.retrieval.batch_token_limit,
            cfg.retrieval.map_fan_out,
        );
        let tog = ToGEngine::new(store.clone(), llm.clone());
        let pipeline = IngestionPipeline::new(
            store.clone(),
            llm.clone(),
            chunker,
            extractor,
            resolver,
            communities.clone(),
            summarizer.clone(),
            cfg.resolution.enabled,
            cfg.extraction_fan_out,
        );

        Ok(Self {
            cfg,
            store,
            llm,
            pipeline,
            assembler,
            global,
            tog,
            communities,
            summarizer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    // ------------------------------------------------------------------
    // INGESTA
    // ------------------------------------------------------------------

    /// Ingesta idempotente de un documento.
    pub async fn ingest_document(
        &self,
        document_id: &str,
        file_path: &Path,
    ) -> EngineResult<IngestOutcome> {
        self.pipeline.ingest_document(document_id, file_path).await
    }

    /// Ingesta recursiva de un directorio de ficheros de texto.
    pub async fn ingest_directory(&self, root: &Path) -> EngineResult<IngestionSummary> {
        self.pipeline.ingest_directory(root).await
    }

    /// Borra un documento en cascada y limpia comunidades huérfanas.
    pub async fn delete_document(&self, document_id: &str) -> EngineResult<()> {
        if self.store.get_document(document_id).await?.is_none() {
            return Err(EngineError::NotFound(format!(
                "documento {document_id}"
            )));
        }
        self.store.delete_document(document_id).await?;
        self.store.delete_orphan_communities().await?;
        info!("Documento {document_id} borrado");
        Ok(())
    }

    // ------------------------------------------------------------------
    // CONSULTAS
    // ------------------------------------------------------------------

    /// Consulta local: siembra por coincidencia con la pregunta, contexto
    /// acotado y respuesta citada.
    pub async fn query_local(
        &self,
        question: &str,
        hop_limit: usize,
        document_scope: Option<&str>,
    ) -> EngineResult<LocalAnswer> {
        self.with_deadline(self.query_local_inner(question, hop_limit, document_scope))
            .await
    }

    async fn query_local_inner(
        &self,
        question: &str,
        hop_limit: usize,
        document_scope: Option<&str>,
    ) -> EngineResult<LocalAnswer> {
        let candidates = self.store.entities_with_degree(document_scope).await?;
        if candidates.is_empty() {
            return Err(EngineError::NotFound(
                "No hay entidades indexadas para esta consulta".into(),
            ));
        }

        let mut seeds = seed_entities_for_question(question, &candidates);

        // Respaldo semántico cuando el léxico no casa con nada.
        if seeds.is_empty() && self.llm.supports_embeddings() {
            let ids =
                vector_store::semantic_seed_entities(&self.store, &self.llm, question, 10).await?;
            seeds = self.store.entities_by_ids(&ids).await?;
        }
        if seeds.is_empty() {
            return Err(EngineError::NotFound(
                "Ninguna entidad casa con la pregunta".into(),
            ));
        }

        // Saltos adicionales opcionales desde las semillas.
        for _ in 1..hop_limit.max(1) {
            let ids: Vec<String> = seeds.iter().map(|e| e.id.clone()).collect();
            let neighbor_ids = self.store.one_hop_neighbors(&ids).await?;
            let mut neighbors = self.store.entities_by_ids(&neighbor_ids).await?;
            neighbors.retain(|n| seeds.iter().all(|s| s.id != n.id));
            seeds.extend(neighbors);
        }

        let mut context = self.assembler.assemble_local(seeds).await?;

        // El presupuesto sobrante se rellena con los resúmenes de las
        // comunidades hoja de las semillas.
        let remaining = self
            .cfg
            .retrieval
            .max_context_tokens
            .saturating_sub(context.token_count);
        if remaining > 0 {
            let communities = self
                .assembler
                .assemble_community(&context.entity_ids, GLOBAL_COMMUNITY_LEVEL, remaining)
                .await?;
            context.text.push_str(&communities.text);
            context.token_count += communities.token_count;
            context.citations.extend(communities.citations);
        }

        let prompt = prompts::local_answer_prompt(question, &context.text);
        let reply = self
            .llm
            .complete_json::<LocalReply>(prompts::EXTRACTION_SYSTEM, &prompt, 0.0)
            .await?;

        let citations = if reply.citations.is_empty() {
            context.citations.clone()
        } else {
            reply.citations
        };

        self.audit(
            question,
            QueryMode::Local,
            reply.confidence,
            &context.entity_ids,
            &[],
        )
        .await;

        Ok(LocalAnswer {
            answer: reply.answer,
            citations,
            confidence: reply.confidence.clamp(0.0, 1.0),
            context_token_count: context.token_count,
        })
    }

    /// Consulta global por Map-Reduce sobre los informes de comunidad. Los
    /// parámetros opcionales anulan los valores configurados.
    pub async fn query_global(
        &self,
        question: &str,
        batch_token_limit: Option<usize>,
        min_rank: Option<f64>,
    ) -> EngineResult<GlobalAnswer> {
        self.with_deadline(self.query_global_inner(question, batch_token_limit, min_rank))
            .await
    }

    async fn query_global_inner(
        &self,
        question: &str,
        batch_token_limit: Option<usize>,
        min_rank: Option<f64>,
    ) -> EngineResult<GlobalAnswer> {
        let ranked = self
            .assembler
            .ranked_global_communities(GLOBAL_COMMUNITY_LEVEL, min_rank)
            .await?;
        let limit = batch_token_limit.unwrap_or(self.cfg.retrieval.batch_token_limit);
        let answer = self.global.run_with_limit(question, ranked, limit).await?;

        let community_keys: Vec<(i64, i64)> = answer
            .citations
            .iter()
            .map(|id| (*id, GLOBAL_COMMUNITY_LEVEL))
            .collect();
        self.audit(question, QueryMode::Global, answer.confidence, &[], &community_keys)
            .await;
        Ok(answer)
    }

    /// Consulta Tree-of-Graphs; la configuración puede venir del llamante.
    pub async fn query_tog(
        &self,
        question: &str,
        cfg: Option<ToGConfig>,
        document_scope: Option<&str>,
    ) -> EngineResult<ToGAnswer> {
        let tog_cfg = cfg.unwrap_or_else(|| self.cfg.tog.clone());
        let answer = self
            .with_deadline(self.tog.query(question, document_scope, &tog_cfg))
            .await?;
        self.audit(question, QueryMode::ToG, answer.confidence, &[], &[])
            .await;
        Ok(answer)
    }

    // ------------------------------------------------------------------
    // ADMINISTRACIÓN
    // ------------------------------------------------------------------

    /// Detección de comunidades, completa o incremental.
    pub async fn detect_communities(
        &self,
        incremental: bool,
        affected_entities: Option<Vec<String>>,
    ) -> EngineResult<DetectionSummary> {
        if incremental {
            let affected = affected_entities.unwrap_or_default();
            self.communities.detect_incremental(&affected).await
        } else {
            self.communities.detect_full().await
        }
    }

    /// Regenera informes de comunidad (todos o sólo los ausentes).
    pub async fn summarize_communities(&self, only_missing: bool) -> EngineResult<usize> {
        self.summarizer.summarize_all(only_missing).await
    }

    pub async fn graph_stats(&self) -> EngineResult<GraphStats> {
        self.store.graph_stats().await
    }

    // ------------------------------------------------------------------
    // INTERNOS
    // ------------------------------------------------------------------

    /// Aplica el plazo global de consulta; al agotarse, el resultado
    /// parcial se descarta y se devuelve el error de plazo.
    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = EngineResult<T>>,
    ) -> EngineResult<T> {
        let deadline = Duration::from_secs(self.cfg.query_deadline_s.max(1));
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DeadlineExceeded(self.cfg.query_deadline_s)),
        }
    }

    /// Registra la consulta respondida; un fallo de auditoría no toca la
    /// respuesta.
    async fn audit(
        &self,
        question: &str,
        mode: QueryMode,
        confidence: f64,
        entity_ids: &[String],
        community_keys: &[(i64, i64)],
    ) {
        let node = QueryNode {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            mode,
            created_at: chrono::Utc::now().to_rfc3339(),
            confidence: confidence.clamp(0.0, 1.0),
        };
        if let Err(e) = self.store.log_query(&node, entity_ids, community_keys).await {
            warn!("Registro de consulta fallido: {e}");
        }
    }
}

/// Siembra léxica de la consulta local: una entidad entra si su nombre
/// aparece en la pregunta o algún token de la pregunta se le parece lo
/// suficiente.
pub fn seed_entities_for_question(
    question: &str,
    candidates: &[EntityNode],
) -> Vec<EntityNode> {
    let lowered = question.to_lowercase();
    let tokens = tokenize(question);
    let mut scored: Vec<(f64, &EntityNode)> = Vec::new();

    for entity in candidates {
        let name = entity.name.to_lowercase();
        let score = if lowered.contains(&name) {
            1.0
        } else {
            tokens
                .iter()
                .map(|t| lcs_ratio(t, &entity.name))
                .fold(0.0f64, f64::max)
        };
        if score >= LOCAL_SEED_THRESHOLD {
            scored.push((score, entity));
        }
    }

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.mention_count.cmp(&a.1.mention_count))
    });
    scored.into_iter().map(|(_, e)| e.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, mentions: i64) -> EntityNode {
        EntityNode {
            id: format!("id-{name}"),
            name: name.to_string(),
            entity_type: "CONCEPT".to_string(),
            description: String::new(),
            mention_count: mentions,
            confidence: 0.9,
            aliases: Vec::new(),
            degree: 0,
        }
    }

    #[test]
    fn la_siembra_encuentra_entidades_citadas_en_la_pregunta() {
        let candidates = vec![entity("Alice", 4), entity("Acme", 9), entity("Paris", 2)];
        let seeds = seed_entities_for_question("Where does Alice work?", &candidates);
        assert!(seeds.iter().any(|e| e.name == "Alice"));
        assert!(!seeds.iter().any(|e| e.name == "Paris"));
    }

    #[test]
    fn la_siembra_tolera_variaciones_menores() {
        let candidates = vec![entity("Acme", 9)];
        let seeds = seed_entities_for_question("¿Qué sabemos de acme?", &candidates);
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn sin_coincidencias_no_hay_semillas() {
        let candidates = vec![entity("Entidad Irrelevante", 1)];
        let seeds = seed_entities_for_question("pregunta sin relación", &candidates);
        assert!(seeds.is_empty());
    }
}
