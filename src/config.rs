//! Carga y gestión de configuración del motor (Neo4j + LLM + parámetros de
//! indexación y consulta). Todo se lee de variables de entorno una sola vez
//! al arrancar; los componentes reciben referencias, nunca leen el entorno.

use std::env;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(EngineError::Configuration(format!(
                "Proveedor LLM no soportado: {other}"
            ))),
        }
    }
}

/// Método de puntuación usado por ToG para podar relaciones y entidades.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruningMethod {
    Llm,
    Bm25,
    SentenceBert,
}

impl PruningMethod {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.to_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "bm25" => Ok(Self::Bm25),
            "sentence_bert" | "sentencebert" => Ok(Self::SentenceBert),
            other => Err(EngineError::Configuration(format!(
                "Método de poda no soportado: {other}"
            ))),
        }
    }
}

/// Parámetros de troceado de documentos.
#[derive(Clone, Debug)]
pub struct ChunkingConfig {
    pub chunk_size_tokens: usize,
    pub overlap_tokens: usize,
    pub min_chunk_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 1000,
            overlap_tokens: 500,
            min_chunk_tokens: 100,
        }
    }
}

/// Parámetros de la extracción por gleaning.
#[derive(Clone, Debug)]
pub struct ExtractionConfig {
    pub entity_types: Vec<String>,
    pub tuple_delimiter: String,
    pub record_delimiter: String,
    pub completion_delimiter: String,
    pub max_gleanings: usize,
    pub enable_description_summarization: bool,
    pub description_max_length: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            entity_types: [
                "PERSON",
                "ORGANIZATION",
                "GEO",
                "EVENT",
                "PRODUCT",
                "FACILITY",
                "WORK_OF_ART",
                "LAW",
                "CONCEPT",
                "OTHER",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            tuple_delimiter: "|||".to_string(),
            record_delimiter: "\n".to_string(),
            completion_delimiter: "<COMPLETE>".to_string(),
            max_gleanings: 1,
            enable_description_summarization: true,
            description_max_length: 120,
        }
    }
}

/// Parámetros de resolución de entidades duplicadas.
#[derive(Clone, Debug)]
pub struct ResolutionConfig {
    pub enabled: bool,
    pub similarity_threshold: f64,
    pub auto_merge_threshold: f64,
    pub enable_llm_resolution: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.85,
            auto_merge_threshold: 0.95,
            enable_llm_resolution: true,
        }
    }
}

/// Parámetros de detección de comunidades.
#[derive(Clone, Debug)]
pub struct CommunityConfig {
    pub random_seed: u64,
    pub max_levels: usize,
    pub tolerance: f64,
    pub include_intermediate: bool,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            random_seed: 42,
            max_levels: 10,
            tolerance: 0.0001,
            include_intermediate: true,
        }
    }
}

/// Parámetros de recuperación y presupuesto de contexto.
#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub max_context_tokens: usize,
    pub top_k_entities: usize,
    pub top_k_relationships: usize,
    pub min_rank_threshold: f64,
    pub batch_token_limit: usize,
    pub map_fan_out: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            top_k_entities: 20,
            top_k_relationships: 15,
            min_rank_threshold: 0.3,
            batch_token_limit: 8000,
            map_fan_out: 8,
        }
    }
}

/// Configuración del razonador Tree-of-Graphs.
#[derive(Clone, Debug)]
pub struct ToGConfig {
    pub search_width: usize,
    pub search_depth: usize,
    pub exploration_temp: f64,
    pub reasoning_temp: f64,
    pub num_retain_entity: usize,
    pub pruning_method: PruningMethod,
    pub enable_sufficiency_check: bool,
}

impl Default for ToGConfig {
    fn default() -> Self {
        Self {
            search_width: 3,
            search_depth: 3,
            exploration_temp: 0.4,
            reasoning_temp: 0.0,
            num_retain_entity: 5,
            pruning_method: PruningMethod::Llm,
            enable_sufficiency_check: true,
        }
    }
}

/// Configuración de la pasarela LLM.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub chat_model: String,
    pub embedding_model: String,
    /// Dimensión de los vectores del modelo de embeddings; el índice
    /// vectorial se crea con este valor.
    pub embedding_dimensions: usize,
    pub rate_limit_rpm: u32,
    pub max_retries: u32,
    pub timeout_s: u64,
    pub max_concurrency: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: String::new(),
            embedding_dimensions: 1536,
            rate_limit_rpm: 60,
            max_retries: 3,
            timeout_s: 60,
            max_concurrency: 8,
        }
    }
}

/// Dimensión conocida de los modelos de embeddings de OpenAI; los modelos
/// no reconocidos caen en la de text-embedding-3-small.
pub fn default_embedding_dimensions(model: &str) -> usize {
    if model.contains("3-large") {
        3072
    } else {
        1536
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    /// Tamaño mínimo del pool de conexiones a Neo4j.
    pub neo4j_max_connections: usize,
    /// Plazo máximo de una consulta completa, en segundos.
    pub query_deadline_s: u64,
    /// Paralelismo máximo de extracción por chunk.
    pub extraction_fan_out: usize,

    pub chunking: ChunkingConfig,
    pub extraction: ExtractionConfig,
    pub resolution: ResolutionConfig,
    pub community: CommunityConfig,
    pub retrieval: RetrievalConfig,
    pub tog: ToGConfig,
    pub llm: LlmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            neo4j_uri: "neo4j://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: String::new(),
            neo4j_max_connections: 100,
            query_deadline_s: 120,
            extraction_fan_out: 8,
            chunking: ChunkingConfig::default(),
            extraction: ExtractionConfig::default(),
            resolution: ResolutionConfig::default(),
            community: CommunityConfig::default(),
            retrieval: RetrievalConfig::default(),
            tog: ToGConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si
    /// existe). Las variables ausentes caen en los valores por defecto,
    /// salvo las credenciales de Neo4j, que son obligatorias.
    pub fn from_env() -> EngineResult<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| EngineError::Configuration("Falta NEO4J_URI en el entorno".into()))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| EngineError::Configuration("Falta NEO4J_USER en el entorno".into()))?;
        let neo4j_password = env::var("NEO4J_PASSWORD").map_err(|_| {
            EngineError::Configuration("Falta NEO4J_PASSWORD en el entorno".into())
        })?;

        let llm_provider_str = env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());

        let mut cfg = Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            neo4j_max_connections: env_or("NEO4J_MAX_CONNECTIONS", 100)?,
            query_deadline_s: env_or("QUERY_DEADLINE_S", 120)?,
            extraction_fan_out: env_or("EXTRACTION_FAN_OUT", 8)?,
            ..Self::default()
        };

        cfg.llm.provider = LlmProvider::parse(&llm_provider_str)?;
        cfg.llm.chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        cfg.llm.embedding_model = env::var("LLM_EMBEDDING_MODEL").unwrap_or_default();
        cfg.llm.embedding_dimensions = env_or(
            "LLM_EMBEDDING_DIMENSIONS",
            default_embedding_dimensions(&cfg.llm.embedding_model),
        )?;
        cfg.llm.rate_limit_rpm = env_or("LLM_RATE_LIMIT_RPM", 60)?;
        cfg.llm.max_retries = env_or("LLM_MAX_RETRIES", 3)?;
        cfg.llm.timeout_s = env_or("LLM_TIMEOUT_S", 60)?;

        cfg.chunking.chunk_size_tokens = env_or("CHUNK_SIZE_TOKENS", 1000)?;
        cfg.chunking.overlap_tokens = env_or("CHUNK_OVERLAP_TOKENS", 500)?;
        cfg.chunking.min_chunk_tokens = env_or("CHUNK_MIN_TOKENS", 100)?;

        cfg.extraction.max_gleanings = env_or("EXTRACTION_MAX_GLEANINGS", 1)?;
        cfg.resolution.enabled = env_or("RESOLUTION_ENABLED", true)?;
        cfg.community.random_seed = env_or("COMMUNITY_RANDOM_SEED", 42)?;
        cfg.retrieval.max_context_tokens = env_or("RETRIEVAL_MAX_CONTEXT_TOKENS", 8000)?;
        cfg.retrieval.batch_token_limit = env_or("RETRIEVAL_BATCH_TOKEN_LIMIT", 8000)?;

        if let Ok(method) = env::var("TOG_PRUNING_METHOD") {
            cfg.tog.pruning_method = PruningMethod::parse(&method)?;
        }
        cfg.tog.search_width = env_or("TOG_SEARCH_WIDTH", 3)?;
        cfg.tog.search_depth = env_or("TOG_SEARCH_DEPTH", 3)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rechaza combinaciones de parámetros sin sentido antes de arrancar.
    pub fn validate(&self) -> EngineResult<()> {
        if self.chunking.overlap_tokens >= self.chunking.chunk_size_tokens {
            return Err(EngineError::Configuration(format!(
                "El solape ({}) debe ser menor que el tamaño de chunk ({})",
                self.chunking.overlap_tokens, self.chunking.chunk_size_tokens
            )));
        }
        if !(0.0..=1.0).contains(&self.resolution.similarity_threshold)
            || !(0.0..=1.0).contains(&self.resolution.auto_merge_threshold)
        {
            return Err(EngineError::Configuration(
                "Los umbrales de similitud deben estar en [0, 1]".into(),
            ));
        }
        if self.resolution.auto_merge_threshold < self.resolution.similarity_threshold {
            return Err(EngineError::Configuration(format!(
                "auto_merge_threshold ({}) no puede ser menor que similarity_threshold ({})",
                self.resolution.auto_merge_threshold, self.resolution.similarity_threshold
            )));
        }
        if self.tog.search_width == 0 || self.tog.search_depth == 0 {
            return Err(EngineError::Configuration(
                "search_width y search_depth deben ser mayores que cero".into(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> EngineResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| EngineError::Configuration(format!("Valor inválido para {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_coinciden_con_la_superficie_documentada() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.chunking.chunk_size_tokens, 1000);
        assert_eq!(cfg.chunking.overlap_tokens, 500);
        assert_eq!(cfg.extraction.tuple_delimiter, "|||");
        assert_eq!(cfg.extraction.completion_delimiter, "<COMPLETE>");
        assert_eq!(cfg.resolution.auto_merge_threshold, 0.95);
        assert_eq!(cfg.community.random_seed, 42);
        assert_eq!(cfg.retrieval.max_context_tokens, 8000);
        assert_eq!(cfg.tog.search_width, 3);
        assert_eq!(cfg.tog.pruning_method, PruningMethod::Llm);
        assert_eq!(cfg.llm.rate_limit_rpm, 60);
        assert_eq!(cfg.query_deadline_s, 120);
    }

    #[test]
    fn valida_solape_contra_tamano_de_chunk() {
        let mut cfg = AppConfig::default();
        cfg.chunking.overlap_tokens = 2000;
        assert!(matches!(cfg.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn valida_orden_de_umbrales_de_resolucion() {
        let mut cfg = AppConfig::default();
        cfg.resolution.similarity_threshold = 0.9;
        cfg.resolution.auto_merge_threshold = 0.8;
        assert!(matches!(cfg.validate(), Err(EngineError::Configuration(_))));

        cfg.resolution.auto_merge_threshold = 0.9;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn la_dimension_de_embeddings_se_deriva_del_modelo() {
        assert_eq!(default_embedding_dimensions("text-embedding-3-small"), 1536);
        assert_eq!(default_embedding_dimensions("text-embedding-3-large"), 3072);
        assert_eq!(default_embedding_dimensions(""), 1536);
        assert_eq!(AppConfig::default().llm.embedding_dimensions, 1536);
    }

    #[test]
    fn parse_de_metodo_de_poda() {
        assert_eq!(PruningMethod::parse("bm25").unwrap(), PruningMethod::Bm25);
        assert_eq!(
            PruningMethod::parse("sentence_bert").unwrap(),
            PruningMethod::SentenceBert
        );
        assert!(PruningMethod::parse("drift").is_err());
    }
}
