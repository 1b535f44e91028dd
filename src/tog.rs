//! Razonador Tree-of-Graphs: exploración iterativa del grafo acotada en
//! anchura y profundidad, con poda de relaciones y entidades guiada por el
//! método configurado (LLM, BM25 o similitud de embeddings), chequeo de
//! suficiencia y síntesis final anclada en las tripletas recuperadas.
//!
//! Un tope absoluto de iteraciones acota las llamadas al LLM por encima de
//! cualquier configuración; la detección de ciclos corta la exploración
//! cuando la frontera deja de avanzar.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{PruningMethod, ToGConfig};
use crate::error::{EngineError, EngineResult};
use crate::graph_store::{GraphStore, RelationTarget};
use crate::llm::LlmManager;
use crate::models::{ReasoningStep, RetrievedTriplet, ToGAnswer};
use crate::prompts;
use crate::resolve::lcs_ratio;

/// Tope absoluto de iteraciones, por encima de `search_depth`.
const MAX_ITERATIONS: usize = 10;
/// Máximo de entidades candidatas traídas por relación.
const CANDIDATE_FETCH_LIMIT: i64 = 50;
/// Umbral a partir del cual los candidatos se muestrean.
const CANDIDATE_SAMPLE_THRESHOLD: usize = 20;
/// Recorte aproximado de cada extracto de texto fuente.
const EXCERPT_CHAR_LIMIT: usize = 500;
/// Solape de frontera que se considera ciclo.
const CYCLE_OVERLAP: f64 = 0.8;
/// Candidatas mostradas al LLM al elegir entidades-tema.
const TOPIC_CANDIDATE_LIMIT: i64 = 1000;
/// Umbral del emparejamiento difuso de respaldo para la siembra.
const TOPIC_FUZZY_THRESHOLD: f64 = 0.6;
/// Confianza fija de la respuesta directa sin tripletas.
const DIRECT_ANSWER_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Deserialize)]
struct TopicReply {
    #[serde(default)]
    entities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedScore {
    name: String,
    score: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ScoreReply {
    #[serde(default)]
    scores: Vec<NamedScore>,
}

#[derive(Debug, Clone, Deserialize)]
struct SufficiencyReply {
    sufficient: bool,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    missing_information: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SynthesisReply {
    answer: String,
    #[serde(default)]
    reasoning_chain: Vec<String>,
    confidence: f64,
    #[serde(default)]
    grounding: Vec<String>,
    #[serde(default)]
    limitations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DirectReply {
    answer: String,
    #[serde(default)]
    confidence: f64,
}

/// Motor ToG sobre los dos manejadores de larga vida.
#[derive(Debug, Clone)]
pub struct ToGEngine {
    store: GraphStore,
    llm: LlmManager,
}

impl ToGEngine {
    pub fn new(store: GraphStore, llm: LlmManager) -> Self {
        Self { store, llm }
    }

    /// Responde una pregunta explorando el grafo.
    pub async fn query(
        &self,
        question: &str,
        document_scope: Option<&str>,
        cfg: &ToGConfig,
    ) -> EngineResult<ToGAnswer> {
        let started = Instant::now();

        // 1) Siembra de entidades-tema.
        let candidates = match document_scope {
            Some(doc) => self.store.entities_with_degree(Some(doc)).await?,
            None => self.store.top_entities_by_mentions(TOPIC_CANDIDATE_LIMIT).await?,
        };
        if candidates.is_empty() {
            return Err(EngineError::NotFound(
                "No hay documentos indexados sobre los que razonar".into(),
            ));
        }
        let mut frontier = self.seed_topic_entities(question, &candidates, cfg).await;
        if frontier.is_empty() {
            warn!("Sin entidades-tema para la pregunta; respuesta directa");
            return self.direct_answer(question, Vec::new(), started).await;
        }

        let mut reasoning_path: Vec<ReasoningStep> = Vec::new();
        let mut retrieved_triplets: Vec<RetrievedTriplet> = Vec::new();
        let mut explored_entities: HashSet<String> =
            frontier.iter().map(|e| e.id.clone()).collect();
        let mut explored_relations: HashSet<String> = HashSet::new();

        // 2) Exploración en profundidad acotada.
        for depth in 0..cfg.search_depth.min(MAX_ITERATIONS) {
            let frontier_ids: Vec<String> = frontier.iter().map(|e| e.id.clone()).collect();

            // a) Relaciones salientes aún no exploradas.
            let relation_counts = self.store.outgoing_relation_types(&frontier_ids).await?;
            let relations_explored: Vec<String> = relation_counts
                .iter()
                .map(|r| r.rel_type.clone())
                .filter(|r| !explored_relations.contains(r))
                .collect();
            if relations_explored.is_empty() {
                break;
            }

            let reasoning_summary = summarize_reasoning(&retrieved_triplets);
            let relation_items: Vec<(String, String)> = relations_explored
                .iter()
                .map(|r| (r.clone(), r.replace('_', " ").to_lowercase()))
                .collect();
            let scored_relations = self
                .score_items(
                    cfg.pruning_method,
                    question,
                    &reasoning_summary,
                    ScoreKind::Relations,
                    &relation_items,
                    cfg.exploration_temp,
                )
                .await;
            let selected_relations: Vec<String> =
                top_names(&scored_relations, cfg.search_width);
            explored_relations.extend(selected_relations.iter().cloned());

            // b) Candidatos por relación retenida.
            let mut by_id: HashMap<String, (RelationTarget, String)> = HashMap::new();
            for relation in &selected_relations {
                let targets = self
                    .store
                    .targets_for_relation(&frontier_ids, relation, CANDIDATE_FETCH_LIMIT)
                    .await?;
                for target in targets {
                    if explored_entities.contains(&target.entity.id) {
                        continue;
                    }
                    by_id
                        .entry(target.entity.id.clone())
                        .or_insert((target, relation.clone()));
                }
            }
            if by_id.is_empty() {
                reasoning_path.push(ReasoningStep {
                    depth,
                    entities: Vec::new(),
                    relations_explored,
                    selected_relations,
                    sufficiency_score: None,
                    sufficient: None,
                });
                break;
            }

            // c) Deduplicación y muestreo determinista si hay demasiados.
            let mut candidates: Vec<(RelationTarget, String)> = by_id.into_values().collect();
            candidates.sort_by(|a, b| a.0.entity.id.cmp(&b.0.entity.id));
            if candidates.len() > CANDIDATE_SAMPLE_THRESHOLD {
                let mut rng = StdRng::seed_from_u64(42 + depth as u64);
                candidates.shuffle(&mut rng);
                candidates.truncate(cfg.num_retain_entity.max(cfg.search_width));
                candidates.sort_by(|a, b| a.0.entity.id.cmp(&b.0.entity.id));
            }

            let entity_items: Vec<(String, String)> = candidates
                .iter()
                .map(|(t, _)| {
                    (
                        t.entity.name.clone(),
                        format!("{} {}", t.entity.name, t.entity.description),
                    )
                })
                .collect();
            let relation_context = selected_relations.join(", ");
            let scored_entities = self
                .score_entities(
                    cfg,
                    question,
                    &reasoning_summary,
                    &relation_context,
                    &entity_items,
                )
                .await;

            // d) Nueva frontera: top search_width por puntuación.
            let keep: HashSet<String> = top_names(&scored_entities, cfg.search_width)
                .into_iter()
                .collect();
            let mut next_frontier = Vec::new();
            let mut step_entities = Vec::new();
            for (target, relation) in candidates {
                if !keep.contains(&target.entity.name) {
                    continue;
                }
                let source_texts = self.excerpts_for(&target.entity.id).await;
                retrieved_triplets.push(RetrievedTriplet {
                    subject: target.source_name.clone(),
                    relation: relation.clone(),
                    object: target.entity.name.clone(),
                    confidence: target.confidence,
                    source_texts,
                });
                step_entities.push(target.entity.name.clone());
                next_frontier.push(target.entity);
            }

            let mut step = ReasoningStep {
                depth,
                entities: step_entities,
                relations_explored,
                selected_relations,
                sufficiency_score: None,
                sufficient: None,
            };

            // e) Detección de ciclos: frontera que no avanza.
            let prev_ids: HashSet<&str> = frontier_ids.iter().map(String::as_str).collect();
            let overlap = next_frontier
                .iter()
                .filter(|e| prev_ids.contains(e.id.as_str()))
                .count();
            let cycle = !next_frontier.is_empty()
                && overlap as f64 / next_frontier.len() as f64 >= CYCLE_OVERLAP;

            // f) Chequeo de suficiencia a partir de la segunda iteración.
            let mut sufficient = false;
            if cfg.enable_sufficiency_check && depth >= 1 && !retrieved_triplets.is_empty() {
                if let Some(reply) = self.check_sufficiency(question, &retrieved_triplets).await {
                    step.sufficiency_score = Some(reply.confidence.clamp(0.0, 1.0));
                    step.sufficient = Some(reply.sufficient);
                    sufficient = reply.sufficient;
                    if !reply.sufficient {
                        debug!(
                            "Suficiencia negativa ({}); falta: {}",
                            reply.reasoning, reply.missing_information
                        );
                    }
                }
            }

            let stop = cycle || sufficient || next_frontier.is_empty();
            reasoning_path.push(step);
            if stop {
                break;
            }

            explored_entities.extend(next_frontier.iter().map(|e| e.id.clone()));
            frontier = next_frontier;
        }

        // 3) Síntesis final.
        if retrieved_triplets.is_empty() {
            return self.direct_answer(question, reasoning_path, started).await;
        }

        let frontier_ids: Vec<String> = explored_entities.iter().cloned().collect();
        let answer = self
            .synthesize(question, &retrieved_triplets, &frontier_ids, cfg)
            .await?;

        info!(
            pasos = reasoning_path.len(),
            tripletas = retrieved_triplets.len(),
            "Consulta ToG respondida"
        );
        Ok(ToGAnswer {
            answer: answer.answer,
            reasoning_path,
            retrieved_triplets,
            confidence: answer.confidence.clamp(0.0, 1.0),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Elige las entidades-tema: primero el LLM sobre las más mencionadas,
    /// con respaldo difuso sobre los tokens de la pregunta.
    async fn seed_topic_entities(
        &self,
        question: &str,
        candidates: &[crate::models::EntityNode],
        cfg: &ToGConfig,
    ) -> Vec<crate::models::EntityNode> {
        let block = candidates
            .iter()
            .map(|e| format!("- {} ({})", e.name, e.entity_type))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = prompts::topic_entities_prompt(question, &block);

        let by_name: HashMap<String, &crate::models::EntityNode> = candidates
            .iter()
            .map(|e| (e.name.to_lowercase(), e))
            .collect();

        if let Ok(reply) = self
            .llm
            .complete_json::<TopicReply>(prompts::EXTRACTION_SYSTEM, &prompt, cfg.exploration_temp)
            .await
        {
            let seeds: Vec<crate::models::EntityNode> = reply
                .entities
                .iter()
                .filter_map(|name| by_name.get(&name.to_lowercase()).map(|e| (*e).clone()))
                .take(cfg.search_width.max(3))
                .collect();
            if !seeds.is_empty() {
                return seeds;
            }
        }

        // Respaldo: emparejamiento difuso de los tokens de la pregunta.
        let tokens = tokenize(question);
        let mut scored: Vec<(f64, &crate::models::EntityNode)> = Vec::new();
        for entity in candidates {
            let best = tokens
                .iter()
                .map(|t| lcs_ratio(t, &entity.name))
                .fold(0.0f64, f64::max);
            if best >= TOPIC_FUZZY_THRESHOLD {
                scored.push((best, entity));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(cfg.search_width.max(3))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Puntuación de entidades con el método configurado.
    async fn score_entities(
        &self,
        cfg: &ToGConfig,
        question: &str,
        reasoning_summary: &str,
        relation: &str,
        items: &[(String, String)],
    ) -> Vec<(String, f64)> {
        match cfg.pruning_method {
            PruningMethod::Llm => {
                let block = items
                    .iter()
                    .map(|(name, text)| format!("- {name}: {text}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let prompt = prompts::score_entities_prompt(
                    question,
                    reasoning_summary,
                    relation,
                    &block,
                );
                self.llm_scores(&prompt, items, cfg.exploration_temp).await
            }
            PruningMethod::Bm25 => bm25_rank(question, items),
            PruningMethod::SentenceBert => self.embedding_rank(question, items).await,
        }
    }

    /// Puntuación genérica (relaciones) con el método configurado.
    async fn score_items(
        &self,
        method: PruningMethod,
        question: &str,
        reasoning_summary: &str,
        kind: ScoreKind,
        items: &[(String, String)],
        temperature: f64,
    ) -> Vec<(String, f64)> {
        match method {
            PruningMethod::Llm => {
                let block = items
                    .iter()
                    .map(|(name, _)| format!("- {name}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let prompt = match kind {
                    ScoreKind::Relations => {
                        prompts::score_relations_prompt(question, reasoning_summary, &block)
                    }
                };
                self.llm_scores(&prompt, items, temperature).await
            }
            PruningMethod::Bm25 => bm25_rank(question, items),
            PruningMethod::SentenceBert => self.embedding_rank(question, items).await,
        }
    }

    async fn llm_scores(
        &self,
        prompt: &str,
        items: &[(String, String)],
        temperature: f64,
    ) -> Vec<(String, f64)> {
        match self
            .llm
            .complete_json::<ScoreReply>(prompts::EXTRACTION_SYSTEM, prompt, temperature)
            .await
        {
            Ok(reply) => {
                let scored: HashMap<String, f64> = reply
                    .scores
                    .into_iter()
                    .map(|s| (s.name.to_lowercase(), s.score.clamp(0.0, 1.0)))
                    .collect();
                items
                    .iter()
                    .map(|(name, _)| {
                        (
                            name.clone(),
                            scored.get(&name.to_lowercase()).copied().unwrap_or(0.0),
                        )
                    })
                    .collect()
            }
            Err(e) => {
                warn!("Puntuación LLM fallida ({e}); se usa BM25 de respaldo");
                bm25_rank_from_items(&tokenize(prompt), items)
            }
        }
    }

    /// Similitud coseno entre el embedding de la pregunta y el de cada
    /// candidato. Sin modelo de embeddings, cae en BM25.
    async fn embedding_rank(
        &self,
        question: &str,
        items: &[(String, String)],
    ) -> Vec<(String, f64)> {
        if !self.llm.supports_embeddings() || items.is_empty() {
            return bm25_rank(question, items);
        }
        let mut texts = vec![question.to_string()];
        texts.extend(items.iter().map(|(_, text)| text.clone()));
        match self.llm.embed(&texts).await {
            Ok(vectors) if vectors.len() == items.len() + 1 => {
                let question_vec = &vectors[0];
                items
                    .iter()
                    .zip(vectors.iter().skip(1))
                    .map(|((name, _), vec)| {
                        let sim = cosine_similarity(question_vec, vec);
                        (name.clone(), (sim + 1.0) / 2.0)
                    })
                    .collect()
            }
            _ => {
                warn!("Embeddings no disponibles; poda por BM25");
                bm25_rank(question, items)
            }
        }
    }

    async fn check_sufficiency(
        &self,
        question: &str,
        triplets: &[RetrievedTriplet],
    ) -> Option<SufficiencyReply> {
        let prompt = prompts::sufficiency_prompt(question, &render_triplets(triplets));
        match self
            .llm
            .complete_json::<SufficiencyReply>(prompts::EXTRACTION_SYSTEM, &prompt, 0.0)
            .await
        {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("Chequeo de suficiencia fallido: {e}");
                None
            }
        }
    }

    async fn synthesize(
        &self,
        question: &str,
        triplets: &[RetrievedTriplet],
        frontier_ids: &[String],
        cfg: &ToGConfig,
    ) -> EngineResult<SynthesisReply> {
        let triplets_block = render_triplets(triplets);

        // Hasta 3 contextos de entidad más hasta 3 chunks de
        // enriquecimiento (los que más entidades de la frontera mencionan).
        let mut sources: Vec<String> = triplets
            .iter()
            .flat_map(|t| t.source_texts.iter().cloned())
            .take(3)
            .collect();
        match self
            .store
            .textunits_by_frontier_coverage(frontier_ids, 3)
            .await
        {
            Ok(units) => {
                sources.extend(units.into_iter().map(|u| truncate_chars(&u.text, EXCERPT_CHAR_LIMIT)));
            }
            Err(e) => warn!("Enriquecimiento de fuentes fallido: {e}"),
        }
        let sources_block = if sources.is_empty() {
            "(sin extractos)".to_string()
        } else {
            sources
                .iter()
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = prompts::tog_answer_prompt(question, &triplets_block, &sources_block);
        self.llm
            .complete_json::<SynthesisReply>(prompts::EXTRACTION_SYSTEM, &prompt, cfg.reasoning_temp)
            .await
    }

    /// Respuesta directa sin anclaje en el grafo, con confianza fija baja.
    async fn direct_answer(
        &self,
        question: &str,
        reasoning_path: Vec<ReasoningStep>,
        started: Instant,
    ) -> EngineResult<ToGAnswer> {
        let prompt = prompts::direct_answer_prompt(question);
        let reply = self
            .llm
            .complete_json::<DirectReply>(prompts::EXTRACTION_SYSTEM, &prompt, 0.0)
            .await?;
        Ok(ToGAnswer {
            answer: reply.answer,
            reasoning_path,
            retrieved_triplets: Vec::new(),
            confidence: DIRECT_ANSWER_CONFIDENCE,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn excerpts_for(&self, entity_id: &str) -> Vec<String> {
        match self.store.mention_excerpts(entity_id, 3).await {
            Ok(excerpts) => excerpts
                .into_iter()
                .map(|t| truncate_chars(&t, EXCERPT_CHAR_LIMIT))
                .collect(),
            Err(e) => {
                warn!("No se pudieron traer extractos de {entity_id}: {e}");
                Vec::new()
            }
        }
    }
}

/// Clase de elemento a puntuar (de momento sólo relaciones pasan por aquí;
/// las entidades tienen su propio prompt con más contexto).
#[derive(Debug, Clone, Copy)]
enum ScoreKind {
    Relations,
}

fn render_triplets(triplets: &[RetrievedTriplet]) -> String {
    triplets
        .iter()
        .map(|t| {
            format!(
                "{} --[{}: confianza {:.2}]--> {}",
                t.subject, t.relation, t.confidence, t.object
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize_reasoning(triplets: &[RetrievedTriplet]) -> String {
    if triplets.is_empty() {
        return "(aún sin hechos)".to_string();
    }
    triplets
        .iter()
        .rev()
        .take(5)
        .map(|t| format!("{} {} {}", t.subject, t.relation.to_lowercase(), t.object))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Los `k` nombres mejor puntuados, en orden descendente estable.
fn top_names(scored: &[(String, f64)], k: usize) -> Vec<String> {
    let mut sorted: Vec<&(String, f64)> = scored.iter().collect();
    sorted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    sorted.into_iter().take(k).map(|(n, _)| n.clone()).collect()
}

/// Tokenización simple para BM25 y el respaldo difuso.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(String::from)
        .collect()
}

/// BM25 de los textos de los items frente a la pregunta, normalizado a
/// [0, 1] por el máximo.
pub fn bm25_rank(question: &str, items: &[(String, String)]) -> Vec<(String, f64)> {
    bm25_rank_from_items(&tokenize(question), items)
}

fn bm25_rank_from_items(query_tokens: &[String], items: &[(String, String)]) -> Vec<(String, f64)> {
    const K1: f64 = 1.2;
    const B: f64 = 0.75;

    if items.is_empty() {
        return Vec::new();
    }

    let docs: Vec<Vec<String>> = items.iter().map(|(_, text)| tokenize(text)).collect();
    let n = docs.len() as f64;
    let avg_len = docs.iter().map(|d| d.len() as f64).sum::<f64>() / n.max(1.0);

    // Frecuencia documental por término de la consulta.
    let mut doc_freq: HashMap<&str, f64> = HashMap::new();
    for token in query_tokens {
        let df = docs
            .iter()
            .filter(|d| d.iter().any(|t| t == token))
            .count() as f64;
        doc_freq.insert(token.as_str(), df);
    }

    let mut scores: Vec<f64> = docs
        .iter()
        .map(|doc| {
            let len = doc.len() as f64;
            query_tokens
                .iter()
                .map(|token| {
                    let df = doc_freq.get(token.as_str()).copied().unwrap_or(0.0);
                    if df == 0.0 {
                        return 0.0;
                    }
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let tf = doc.iter().filter(|t| *t == token).count() as f64;
                    idf * (tf * (K1 + 1.0))
                        / (tf + K1 * (1.0 - B + B * len / avg_len.max(1.0)))
                })
                .sum()
        })
        .collect();

    let max = scores.iter().cloned().fold(0.0f64, f64::max);
    if max > 0.0 {
        for score in scores.iter_mut() {
            *score /= max;
        }
    }

    items
        .iter()
        .zip(scores)
        .map(|((name, _), score)| (name.clone(), score))
        .collect()
}

/// Similitud coseno entre dos vectores (0 si alguno es nulo).
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Recorte por caracteres respetando límites UTF-8.
fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_separa_y_normaliza() {
        let tokens = tokenize("¿Dónde trabaja Alice, en Acme?");
        assert!(tokens.contains(&"alice".to_string()));
        assert!(tokens.contains(&"acme".to_string()));
        assert!(!tokens.contains(&"¿".to_string()));
    }

    #[test]
    fn bm25_prefiere_el_documento_con_los_terminos_de_la_pregunta() {
        let items = vec![
            ("works_at".to_string(), "works at empresa empleo".to_string()),
            ("located_in".to_string(), "ubicación ciudad país".to_string()),
        ];
        let scores = bm25_rank("where does alice works", &items);
        let by_name: HashMap<String, f64> = scores.into_iter().collect();
        assert!(by_name["works_at"] > by_name["located_in"]);
        assert!(by_name["works_at"] <= 1.0);
    }

    #[test]
    fn bm25_sin_coincidencias_da_ceros() {
        let items = vec![("x".to_string(), "nada relacionado".to_string())];
        let scores = bm25_rank("pregunta totalmente distinta", &items);
        assert_eq!(scores[0].1, 0.0);
    }

    #[test]
    fn cosine_similarity_basica() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn top_names_ordena_y_acota() {
        let scored = vec![
            ("a".to_string(), 0.2),
            ("b".to_string(), 0.9),
            ("c".to_string(), 0.9),
            ("d".to_string(), 0.5),
        ];
        let top = top_names(&scored, 2);
        assert_eq!(top, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn truncate_chars_respeta_utf8() {
        let text = "áéíóú".repeat(200);
        let cut = truncate_chars(&text, 500);
        assert_eq!(cut.chars().count(), 500);
    }

    #[test]
    fn render_triplets_usa_el_formato_de_flecha() {
        let triplets = vec![RetrievedTriplet {
            subject: "X".into(),
            relation: "WORKS_AT".into(),
            object: "Y".into(),
            confidence: 0.9,
            source_texts: Vec::new(),
        }];
        let rendered = render_triplets(&triplets);
        assert!(rendered.contains("X --[WORKS_AT"));
        assert!(rendered.contains("]--> Y"));
    }

    #[test]
    fn el_muestreo_de_candidatos_es_determinista() {
        let mut rng1 = StdRng::seed_from_u64(42);
        let mut rng2 = StdRng::seed_from_u64(42);
        let mut a: Vec<usize> = (0..50).collect();
        let mut b: Vec<usize> = (0..50).collect();
        a.shuffle(&mut rng1);
        b.shuffle(&mut rng2);
        assert_eq!(a, b);
    }
}
