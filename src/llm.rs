//! Pasarela LLM sobre Rig con límite de peticiones y reintentos.
//!
//! El proveedor concreto queda detrás del trait `LlmBackend`, de modo que
//! las pruebas inyectan un backend guionizado sin tocar la red. La pasarela
//! clasifica cada fallo como transitorio (se reintenta con backoff
//! exponencial) o fatal (se propaga sin reintentar); la ausencia de API key
//! es un error de configuración detectado al construir el backend.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{EngineError, EngineResult};

/// Petición de completado: instrucciones de sistema, prompt y temperatura.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
}

/// Fallo de una llamada cruda al proveedor, ya clasificado.
#[derive(Debug, Clone)]
pub enum LlmCallError {
    /// Fallo recuperable (429, 5xx, timeout de red). Candidato a reintento.
    Transient(String),
    /// Fallo definitivo (clave inválida, petición rechazada). Sin reintento.
    Fatal(String),
}

impl std::fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "fallo transitorio del LLM: {msg}"),
            Self::Fatal(msg) => write!(f, "fallo fatal del LLM: {msg}"),
        }
    }
}

/// Proveedor de completados y embeddings. Implementado por Rig/OpenAI en
/// producción y por backends guionizados en las pruebas.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: &LlmRequest) -> Result<String, LlmCallError>;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, LlmCallError>;
}

/// Backend OpenAI vía Rig.
pub struct OpenAiBackend {
    chat_model: String,
    embedding_model: String,
}

impl OpenAiBackend {
    /// Valida la presencia de la API key al construir: su ausencia es un
    /// error de configuración, nunca un candidato a reintento.
    pub fn new(chat_model: &str, embedding_model: &str) -> EngineResult<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(EngineError::Configuration(
                "Falta OPENAI_API_KEY en el entorno".into(),
            ));
        }
        Ok(Self {
            chat_model: if chat_model.is_empty() {
                "gpt-4o-mini".to_string()
            } else {
                chat_model.to_string()
            },
            embedding_model: embedding_model.to_string(),
        })
    }

    /// Clasifica un error del proveedor por su mensaje. Por defecto se
    /// asume transitorio: reintentar un fallo de red es barato comparado
    /// con perder un chunk.
    fn classify(err: impl std::fmt::Display) -> LlmCallError {
        let msg = err.to_string();
        let lowered = msg.to_lowercase();
        if lowered.contains("api key")
            || lowered.contains("unauthorized")
            || lowered.contains("401")
            || lowered.contains("403")
            || lowered.contains("invalid_request")
        {
            LlmCallError::Fatal(msg)
        } else {
            LlmCallError::Transient(msg)
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, req: &LlmRequest) -> Result<String, LlmCallError> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let agent = client
            .agent(&self.chat_model)
            .preamble(&req.system)
            .temperature(req.temperature)
            .build();

        agent
            .prompt(req.prompt.as_str())
            .await
            .map_err(Self::classify)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, LlmCallError> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let model = client.embedding_model(model_name);

        let embeddings = model
            .embed_texts(texts.to_vec())
            .await
            .map_err(Self::classify)?;

        if embeddings.len() != texts.len() {
            return Err(LlmCallError::Fatal(format!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            )));
        }
        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }
}

/// Gestor de LLMs: cubo de tokens a nivel de proceso, límite de
/// concurrencia, timeout por llamada y reintentos con backoff exponencial.
#[derive(Clone)]
pub struct LlmManager {
    backend: Arc<dyn LlmBackend>,
    limiter: Arc<DefaultDirectRateLimiter>,
    concurrency: Arc<Semaphore>,
    max_retries: u32,
    timeout: Duration,
    has_embedding_model: bool,
}

impl std::fmt::Debug for LlmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmManager")
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmManager {
    /// Construye el gestor a partir de la configuración.
    ///
    /// Nota: sólo está implementado OpenAI; para otros proveedores se
    /// añadirían ramas adicionales al `match`.
    pub fn from_config(cfg: &LlmConfig) -> EngineResult<Self> {
        let backend: Arc<dyn LlmBackend> = match cfg.provider {
            LlmProvider::OpenAI => {
                Arc::new(OpenAiBackend::new(&cfg.chat_model, &cfg.embedding_model)?)
            }
            ref other => {
                return Err(EngineError::Configuration(format!(
                    "Proveedor LLM {other:?} aún no implementado"
                )))
            }
        };
        Ok(Self::with_backend(backend, cfg))
    }

    /// Construye el gestor sobre un backend arbitrario (pruebas incluidas).
    pub fn with_backend(backend: Arc<dyn LlmBackend>, cfg: &LlmConfig) -> Self {
        let rpm = NonZeroU32::new(cfg.rate_limit_rpm).unwrap_or(nonzero!(60u32));
        Self {
            backend,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            concurrency: Arc::new(Semaphore::new(cfg.max_concurrency.max(1))),
            max_retries: cfg.max_retries,
            timeout: Duration::from_secs(cfg.timeout_s.max(1)),
            has_embedding_model: !cfg.embedding_model.is_empty(),
        }
    }

    /// ¿Hay modelo de embeddings configurado? La siembra semántica y la
    /// poda sentence_bert sólo se ofrecen cuando lo hay.
    pub fn supports_embeddings(&self) -> bool {
        self.has_embedding_model
    }

    /// Lanza un completado con límite de peticiones, timeout y reintentos.
    pub async fn complete(
        &self,
        system: &str,
        prompt: &str,
        temperature: f64,
    ) -> EngineResult<String> {
        let req = LlmRequest {
            system: system.to_string(),
            prompt: prompt.to_string(),
            temperature,
        };

        let _permit = self.concurrency.acquire().await.map_err(|_| {
            EngineError::ExternalUnavailable("Semáforo de concurrencia cerrado".into())
        })?;

        let mut last_msg = String::new();
        for attempt in 0..=self.max_retries {
            self.limiter.until_ready().await;

            let outcome = tokio::time::timeout(self.timeout, self.backend.complete(&req)).await;
            match outcome {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(LlmCallError::Fatal(msg))) => {
                    return Err(EngineError::ExternalUnavailable(msg));
                }
                Ok(Err(LlmCallError::Transient(msg))) => {
                    last_msg = msg;
                }
                Err(_) => {
                    last_msg = format!("timeout tras {} s", self.timeout.as_secs());
                }
            }

            if attempt < self.max_retries {
                let backoff = Duration::from_millis(500 * (1u64 << attempt.min(6)));
                warn!(
                    intento = attempt + 1,
                    "Fallo transitorio del LLM ({last_msg}); reintentando en {:?}", backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(EngineError::ExternalUnavailable(format!(
            "LLM agotó {} reintentos: {last_msg}",
            self.max_retries
        )))
    }

    /// Completado que exige una respuesta JSON con un esquema conocido.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: &str,
        prompt: &str,
        temperature: f64,
    ) -> EngineResult<T> {
        let raw = self.complete(system, prompt, temperature).await?;
        parse_json_reply(&raw)
    }

    /// Embeddings en bloque, con el mismo régimen de límites y reintentos.
    pub async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self.concurrency.acquire().await.map_err(|_| {
            EngineError::ExternalUnavailable("Semáforo de concurrencia cerrado".into())
        })?;

        let mut last_msg = String::new();
        for attempt in 0..=self.max_retries {
            self.limiter.until_ready().await;

            match tokio::time::timeout(self.timeout, self.backend.embed(texts)).await {
                Ok(Ok(vectors)) => return Ok(vectors),
                Ok(Err(LlmCallError::Fatal(msg))) => {
                    return Err(EngineError::ExternalUnavailable(msg));
                }
                Ok(Err(LlmCallError::Transient(msg))) => last_msg = msg,
                Err(_) => last_msg = format!("timeout tras {} s", self.timeout.as_secs()),
            }

            if attempt < self.max_retries {
                tokio::time::sleep(Duration::from_millis(500 * (1u64 << attempt.min(6)))).await;
            }
        }

        Err(EngineError::ExternalUnavailable(format!(
            "Embeddings agotaron {} reintentos: {last_msg}",
            self.max_retries
        )))
    }
}

/// Limpia la respuesta del LLM (vallas de código incluidas) y la parsea
/// contra el esquema tipado. Una respuesta inválida es un error de parseo,
/// nunca un valor degradado en silencio.
pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> EngineResult<T> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str::<T>(cleaned).map_err(|e| {
        warn!("Respuesta JSON no parseable del LLM: {e}");
        EngineError::parse("respuesta del LLM", e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        ok: bool,
        score: f64,
    }

    /// Backend que falla `failures` veces y luego responde.
    struct FlakyBackend {
        failures: AtomicU32,
        reply: String,
    }

    #[async_trait]
    impl LlmBackend for FlakyBackend {
        async fn complete(&self, _req: &LlmRequest) -> Result<String, LlmCallError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(LlmCallError::Transient("simulado 503".into()));
            }
            Ok(self.reply.clone())
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, LlmCallError> {
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    fn fast_cfg(retries: u32) -> LlmConfig {
        LlmConfig {
            max_retries: retries,
            rate_limit_rpm: 6000,
            timeout_s: 5,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn parse_json_reply_quita_vallas_de_codigo() {
        let raw = "```json\n{\"ok\": true, \"score\": 0.9}\n```";
        let v: Verdict = parse_json_reply(raw).unwrap();
        assert_eq!(
            v,
            Verdict {
                ok: true,
                score: 0.9
            }
        );
    }

    #[test]
    fn parse_json_reply_invalido_es_error_de_parseo() {
        let result = parse_json_reply::<Verdict>("esto no es JSON");
        assert!(matches!(result, Err(EngineError::Parse(_))));
    }

    #[tokio::test]
    async fn reintenta_fallos_transitorios_hasta_exito() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(2),
            reply: "hola".into(),
        });
        let manager = LlmManager::with_backend(backend, &fast_cfg(3));
        let reply = manager.complete("sys", "pregunta", 0.0).await.unwrap();
        assert_eq!(reply, "hola");
    }

    #[tokio::test]
    async fn agotar_reintentos_escala_a_external_unavailable() {
        let backend = Arc::new(FlakyBackend {
            failures: AtomicU32::new(100),
            reply: String::new(),
        });
        let manager = LlmManager::with_backend(backend, &fast_cfg(0));
        let result = manager.complete("sys", "pregunta", 0.0).await;
        assert!(matches!(result, Err(EngineError::ExternalUnavailable(_))));
    }
}
