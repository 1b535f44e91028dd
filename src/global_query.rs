//! Consulta global por Map-Reduce sobre los informes de comunidad.
//!
//! Las comunidades ya rankeadas se empaquetan en lotes bajo un presupuesto
//! de tokens; cada lote se resume en paralelo respecto a la pregunta (Map)
//! y una única síntesis final produce la respuesta con citas (Reduce). Si
//! todo cabe en un lote, la síntesis es directa y no hay fase Map.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::chunker::TokenCounter;
use crate::error::{EngineError, EngineResult};
use crate::graph_store::WeightedCommunity;
use crate::llm::LlmManager;
use crate::models::GlobalAnswer;
use crate::prompts;

/// Lote de comunidades con su texto formateado.
#[derive(Debug, Clone)]
pub struct CommunityBatch {
    pub text: String,
    pub community_ids: Vec<i64>,
    pub token_count: usize,
}

/// Respuesta del paso Map para un lote.
#[derive(Debug, Clone, Deserialize)]
struct MapReply {
    batch_summary: String,
    importance_score: f64,
    #[serde(default)]
    key_findings: Vec<String>,
    #[serde(default)]
    limitations: Vec<String>,
}

/// Respuesta del paso Reduce.
#[derive(Debug, Clone, Deserialize)]
struct ReduceReply {
    answer: String,
    #[serde(default)]
    citations: Vec<i64>,
    confidence: f64,
}

/// Empaqueta las comunidades en lotes por acumulación voraz de tokens. Una
/// comunidad que no cabe ni sola forma su propio lote.
pub fn batch_communities(
    ranked: &[WeightedCommunity],
    batch_token_limit: usize,
    counter: &TokenCounter,
) -> Vec<CommunityBatch> {
    let mut batches = Vec::new();
    let mut text = String::new();
    let mut ids = Vec::new();
    let mut tokens = 0usize;

    for wc in ranked {
        let community = &wc.community;
        if community.summary.is_empty() {
            continue;
        }
        let block = format!(
            "Comunidad {}: {}\n{}\n\n",
            community.id, community.title, community.summary
        );
        let cost = counter.count(&block);

        if tokens + cost > batch_token_limit && !ids.is_empty() {
            batches.push(CommunityBatch {
                text: std::mem::take(&mut text),
                community_ids: std::mem::take(&mut ids),
                token_count: tokens,
            });
            tokens = 0;
        }
        text.push_str(&block);
        ids.push(community.id);
        tokens += cost;
    }
    if !ids.is_empty() {
        batches.push(CommunityBatch {
            text,
            community_ids: ids,
            token_count: tokens,
        });
    }
    batches
}

/// Motor de consulta global. Opera sobre la lista ya rankeada de
/// comunidades; el acceso al grafo vive en el llamante.
#[derive(Debug, Clone)]
pub struct GlobalQueryEngine {
    llm: LlmManager,
    counter: TokenCounter,
    batch_token_limit: usize,
    fan_out: usize,
}

impl GlobalQueryEngine {
    pub fn new(
        llm: LlmManager,
        counter: TokenCounter,
        batch_token_limit: usize,
        fan_out: usize,
    ) -> Self {
        Self {
            llm,
            counter,
            batch_token_limit,
            fan_out: fan_out.max(1),
        }
    }

    /// Ejecuta Map-Reduce (o síntesis directa con un único lote) con el
    /// presupuesto de lote configurado.
    pub async fn run(
        &self,
        question: &str,
        ranked: Vec<WeightedCommunity>,
    ) -> EngineResult<GlobalAnswer> {
        self.run_with_limit(question, ranked, self.batch_token_limit)
            .await
    }

    /// Variante con presupuesto de lote explícito.
    pub async fn run_with_limit(
        &self,
        question: &str,
        ranked: Vec<WeightedCommunity>,
        batch_token_limit: usize,
    ) -> EngineResult<GlobalAnswer> {
        let num_communities = ranked.len();
        let batches = batch_communities(&ranked, batch_token_limit, &self.counter);
        if batches.is_empty() {
            return Err(EngineError::NotFound(
                "No hay comunidades con resumen para responder globalmente".into(),
            ));
        }
        let batches_used = batches.len();

        // Un único lote: síntesis directa, sin fase Map.
        if batches.len() == 1 {
            let only = &batches[0];
            let reply = self.reduce(question, &only.text).await?;
            let citations = if reply.citations.is_empty() {
                only.community_ids.clone()
            } else {
                reply.citations
            };
            return Ok(GlobalAnswer {
                answer: reply.answer,
                citations,
                confidence: reply.confidence.clamp(0.0, 1.0),
                num_communities,
                batches_used,
            });
        }

        // Map en paralelo acotado; los fallos individuales se descartan.
        let intermediates: Vec<(MapReply, Vec<i64>)> = stream::iter(batches.into_iter())
            .map(|batch| {
                let llm = self.llm.clone();
                let question = question.to_string();
                async move {
                    let prompt = prompts::map_batch_prompt(&question, &batch.text);
                    match llm
                        .complete_json::<MapReply>(prompts::EXTRACTION_SYSTEM, &prompt, 0.0)
                        .await
                    {
                        Ok(reply) => Some((reply, batch.community_ids)),
                        Err(e) => {
                            warn!("Lote de Map descartado por fallo: {e}");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.fan_out)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        if intermediates.is_empty() {
            return Err(EngineError::ExternalUnavailable(
                "Todas las llamadas Map fallaron".into(),
            ));
        }

        // Los lotes sin señal (importance 0) son ruido.
        let mut useful: Vec<(MapReply, Vec<i64>)> = intermediates
            .into_iter()
            .filter(|(reply, _)| reply.importance_score > 0.0)
            .collect();
        useful.sort_by(|a, b| {
            b.0.importance_score
                .partial_cmp(&a.0.importance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if useful.is_empty() {
            return Ok(GlobalAnswer {
                answer: "Ninguna comunidad aporta información relevante a esta pregunta.".into(),
                citations: Vec::new(),
                confidence: 0.1,
                num_communities,
                batches_used,
            });
        }

        let intermediate_block = useful
            .iter()
            .map(|(reply, ids)| {
                let findings = if reply.key_findings.is_empty() {
                    String::new()
                } else {
                    format!("\n  Hallazgos: {}", reply.key_findings.join("; "))
                };
                let limitations = if reply.limitations.is_empty() {
                    String::new()
                } else {
                    format!("\n  Limitaciones: {}", reply.limitations.join("; "))
                };
                format!(
                    "- [comunidades {:?}, importancia {:.1}] {}{}{}",
                    ids, reply.importance_score, reply.batch_summary, findings, limitations
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let reply = self.reduce(question, &intermediate_block).await?;
        let citations = if reply.citations.is_empty() {
            useful.iter().flat_map(|(_, ids)| ids.clone()).collect()
        } else {
            reply.citations
        };

        info!(
            comunidades = num_communities,
            lotes = batches_used,
            "Consulta global respondida"
        );
        Ok(GlobalAnswer {
            answer: reply.answer,
            citations,
            confidence: reply.confidence.clamp(0.0, 1.0),
            num_communities,
            batches_used,
        })
    }

    async fn reduce(&self, question: &str, block: &str) -> EngineResult<ReduceReply> {
        let prompt = prompts::reduce_prompt(question, block);
        self.llm
            .complete_json::<ReduceReply>(prompts::EXTRACTION_SYSTEM, &prompt, 0.0)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::{LlmBackend, LlmCallError, LlmRequest};
    use crate::models::{CommunityNode, Significance};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn community(id: i64, summary: &str) -> WeightedCommunity {
        WeightedCommunity {
            community: CommunityNode {
                id,
                level: 0,
                title: format!("Comunidad {id}"),
                summary: summary.to_string(),
                themes: Vec::new(),
                significance: Significance::Medium,
                rank: Some(0.8),
                entity_count: 3,
            },
            weight: 10 - id,
        }
    }

    #[test]
    fn batching_respeta_el_limite_de_tokens() {
        let counter = TokenCounter::new().unwrap();
        let ranked: Vec<WeightedCommunity> = (0..10)
            .map(|i| community(i, &"resumen con contenido razonable ".repeat(10)))
            .collect();
        let batches = batch_communities(&ranked, 120, &counter);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(batch.token_count <= 120 || batch.community_ids.len() == 1);
        }
        let all_ids: Vec<i64> = batches
            .iter()
            .flat_map(|b| b.community_ids.clone())
            .collect();
        assert_eq!(all_ids.len(), 10);
    }

    #[test]
    fn comunidades_sin_resumen_se_omiten() {
        let counter = TokenCounter::new().unwrap();
        let ranked = vec![community(0, ""), community(1, "con resumen")];
        let batches = batch_communities(&ranked, 1000, &counter);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].community_ids, vec![1]);
    }

    /// Backend que responde según el contenido del prompt.
    struct RoutedBackend;

    #[async_trait]
    impl LlmBackend for RoutedBackend {
        async fn complete(&self, req: &LlmRequest) -> Result<String, LlmCallError> {
            if req.prompt.contains("Resúmenes intermedios") {
                return Ok(r#"{"answer": "Los temas son Tech, Legal y Finance.",
                              "citations": [0, 1, 2], "confidence": 0.85}"#
                    .to_string());
            }
            // Map: el lote que contiene la comunidad 9 es ruido.
            if req.prompt.contains("Comunidad 9") {
                return Ok(r#"{"batch_summary": "nada", "importance_score": 0}"#.to_string());
            }
            Ok(r#"{"batch_summary": "Temas relevantes del lote",
                   "importance_score": 7.5, "key_findings": ["tema"]}"#
                .to_string())
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f64>>, LlmCallError> {
            Err(LlmCallError::Fatal("sin embeddings".into()))
        }
    }

    fn engine(limit: usize) -> GlobalQueryEngine {
        let cfg = LlmConfig {
            rate_limit_rpm: 6000,
            max_retries: 0,
            ..LlmConfig::default()
        };
        GlobalQueryEngine::new(
            LlmManager::with_backend(Arc::new(RoutedBackend), &cfg),
            TokenCounter::new().unwrap(),
            limit,
            4,
        )
    }

    #[tokio::test]
    async fn map_reduce_descarta_lotes_sin_senal() {
        let ranked: Vec<WeightedCommunity> = (0..10)
            .map(|i| community(i, &"resumen con bastantes palabras que ocupa ".repeat(8)))
            .collect();
        let answer = engine(150).run("¿Cuáles son los temas?", ranked).await.unwrap();
        assert!(answer.batches_used > 1);
        assert_eq!(answer.num_communities, 10);
        assert!(answer.answer.contains("Tech"));
        assert_eq!(answer.citations, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn un_solo_lote_hace_sintesis_directa() {
        let ranked = vec![community(0, "resumen breve"), community(1, "otro resumen")];
        let answer = engine(8000).run("¿Temas?", ranked).await.unwrap();
        assert_eq!(answer.batches_used, 1);
        assert!(answer.confidence > 0.0);
    }

    #[tokio::test]
    async fn sin_comunidades_es_not_found() {
        let result = engine(8000).run("¿Temas?", Vec::new()).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
