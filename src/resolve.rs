//! Resolución de entidades duplicadas más allá de la clave exacta
//! (nombre, tipo): similitud por subsecuencia común más larga sobre
//! nombres normalizados, arbitraje opcional por LLM y fusión transaccional
//! en el almacén.

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ResolutionConfig;
use crate::error::EngineResult;
use crate::graph_store::GraphStore;
use crate::llm::LlmManager;
use crate::models::EntityNode;
use crate::prompts;

/// Confianza mínima exigida al veredicto del LLM para fusionar.
const LLM_MERGE_CONFIDENCE: f64 = 0.75;

/// Par candidato a fusión, con su similitud en [0, 1].
#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub entity_a: EntityNode,
    pub entity_b: EntityNode,
    pub similarity: f64,
}

/// Veredicto del arbitraje por LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionVerdict {
    pub are_same: bool,
    pub confidence: f64,
    pub canonical_name: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Ratio de subsecuencia común más larga sobre nombres en minúsculas:
/// 2·LCS / (|a| + |b|).
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    (2.0 * lcs as f64) / ((a.len() + b.len()) as f64)
}

/// Enumera pares del mismo tipo con similitud ≥ `threshold`, de mayor a
/// menor similitud.
pub fn candidate_pairs(entities: &[EntityNode], threshold: f64) -> Vec<DuplicatePair> {
    let mut pairs = Vec::new();
    for (i, a) in entities.iter().enumerate() {
        for b in entities.iter().skip(i + 1) {
            if a.entity_type != b.entity_type || a.name == b.name {
                continue;
            }
            let similarity = lcs_ratio(&a.name, &b.name);
            if similarity >= threshold {
                pairs.push(DuplicatePair {
                    entity_a: a.clone(),
                    entity_b: b.clone(),
                    similarity,
                });
            }
        }
    }
    pairs.sort_by(|x, y| {
        y.similarity
            .partial_cmp(&x.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    pairs
}

/// Resolutor: opera sobre los dos manejadores de larga vida del motor.
#[derive(Debug, Clone)]
pub struct Resolver {
    store: GraphStore,
    llm: LlmManager,
    cfg: ResolutionConfig,
}

impl Resolver {
    pub fn new(store: GraphStore, llm: LlmManager, cfg: ResolutionConfig) -> Self {
        Self { store, llm, cfg }
    }

    /// Pares candidatos de todo el grafo (o de un documento).
    pub async fn find_duplicate_pairs(
        &self,
        document_scope: Option<&str>,
    ) -> EngineResult<Vec<DuplicatePair>> {
        let entities = self.store.entities_with_degree(document_scope).await?;
        Ok(candidate_pairs(&entities, self.cfg.similarity_threshold))
    }

    /// Arbitraje por LLM de un par concreto.
    pub async fn resolve_with_llm(
        &self,
        a: &EntityNode,
        b: &EntityNode,
    ) -> EngineResult<ResolutionVerdict> {
        let prompt = prompts::resolution_prompt(
            &a.name,
            &a.description,
            &b.name,
            &b.description,
            &a.entity_type,
        );
        self.llm
            .complete_json::<ResolutionVerdict>(prompts::EXTRACTION_SYSTEM, &prompt, 0.0)
            .await
    }

    /// Fusión transaccional; delega en el almacén. Devuelve `false` si no
    /// había nada que fusionar (par ya fusionado).
    pub async fn merge(
        &self,
        primary_id: &str,
        duplicate_ids: &[String],
        canonical_name: &str,
    ) -> EngineResult<bool> {
        self.store
            .merge_entities(primary_id, duplicate_ids, canonical_name)
            .await
    }

    /// Resuelve duplicados dentro del conjunto afectado por una ingesta
    /// (las entidades dadas más sus vecinas a un salto). Devuelve cuántas
    /// fusiones se aplicaron.
    pub async fn resolve_affected(&self, affected_ids: &[String]) -> EngineResult<usize> {
        if !self.cfg.enabled || affected_ids.is_empty() {
            return Ok(0);
        }

        let mut scope: Vec<String> = affected_ids.to_vec();
        scope.extend(self.store.one_hop_neighbors(affected_ids).await?);
        scope.sort();
        scope.dedup();

        let entities = self.store.entities_by_ids(&scope).await?;
        let pairs = candidate_pairs(&entities, self.cfg.similarity_threshold);

        let mut merged_ids: Vec<String> = Vec::new();
        let mut merges = 0usize;
        for pair in pairs {
            if merged_ids.contains(&pair.entity_a.id) || merged_ids.contains(&pair.entity_b.id) {
                continue;
            }

            let decision = self.decide(&pair).await?;
            let Some(canonical) = decision else { continue };

            // La primaria es la más mencionada; en empate, el id menor.
            let a_primary = match pair.entity_a.mention_count.cmp(&pair.entity_b.mention_count) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => pair.entity_a.id <= pair.entity_b.id,
            };
            let (primary, duplicate) = if a_primary {
                (&pair.entity_a, &pair.entity_b)
            } else {
                (&pair.entity_b, &pair.entity_a)
            };

            if self
                .merge(&primary.id, &[duplicate.id.clone()], &canonical)
                .await?
            {
                info!(
                    "Entidades fusionadas: '{}' absorbe a '{}' (similitud {:.2})",
                    primary.name, duplicate.name, pair.similarity
                );
                merged_ids.push(duplicate.id.clone());
                merges += 1;
            }
        }
        Ok(merges)
    }

    /// Regla de decisión: fusión directa por encima del umbral automático,
    /// arbitraje por LLM en la franja intermedia, nada por debajo.
    /// Devuelve el nombre canónico cuando procede fusionar.
    async fn decide(&self, pair: &DuplicatePair) -> EngineResult<Option<String>> {
        if pair.similarity >= self.cfg.auto_merge_threshold {
            let canonical = if pair.entity_a.mention_count >= pair.entity_b.mention_count {
                pair.entity_a.name.clone()
            } else {
                pair.entity_b.name.clone()
            };
            return Ok(Some(canonical));
        }

        if !self.cfg.enable_llm_resolution {
            return Ok(None);
        }

        match self.resolve_with_llm(&pair.entity_a, &pair.entity_b).await {
            Ok(verdict) if verdict.are_same && verdict.confidence >= LLM_MERGE_CONFIDENCE => {
                let canonical = if verdict.canonical_name.trim().is_empty() {
                    pair.entity_a.name.clone()
                } else {
                    verdict.canonical_name.trim().to_string()
                };
                Ok(Some(canonical))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(
                    "Arbitraje LLM fallido para '{}' / '{}': {e}; el par se deja separado",
                    pair.entity_a.name, pair.entity_b.name
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, entity_type: &str, mentions: i64) -> EntityNode {
        EntityNode {
            id: format!("id-{name}"),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            description: String::new(),
            mention_count: mentions,
            confidence: 0.9,
            aliases: Vec::new(),
            degree: 0,
        }
    }

    #[test]
    fn lcs_ratio_de_nombres_identicos_es_uno() {
        assert_eq!(lcs_ratio("Acme", "acme"), 1.0);
    }

    #[test]
    fn lcs_ratio_detecta_variantes_cercanas() {
        let sim = lcs_ratio("Apple Inc.", "Apple Inc");
        assert!(sim > 0.94, "similitud inesperadamente baja: {sim}");
        assert!(sim < 1.0);
    }

    #[test]
    fn lcs_ratio_de_nombres_distintos_es_bajo() {
        assert!(lcs_ratio("Acme", "Paris") < 0.5);
        assert_eq!(lcs_ratio("", "Paris"), 0.0);
    }

    #[test]
    fn candidate_pairs_respeta_tipo_y_umbral() {
        let entities = vec![
            entity("Apple Inc.", "ORGANIZATION", 5),
            entity("Apple Inc", "ORGANIZATION", 3),
            entity("Apple", "PRODUCT", 2),
            entity("Paris", "GEO", 1),
        ];
        let pairs = candidate_pairs(&entities, 0.85);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].entity_a.name, "Apple Inc.");
        assert_eq!(pairs[0].entity_b.name, "Apple Inc");
    }

    #[test]
    fn candidate_pairs_ordena_por_similitud_descendente() {
        let entities = vec![
            entity("Banco Central Europeo", "ORGANIZATION", 1),
            entity("Banco Central Europe", "ORGANIZATION", 1),
            entity("Banco Central", "ORGANIZATION", 1),
        ];
        let pairs = candidate_pairs(&entities, 0.5);
        for window in pairs.windows(2) {
            assert!(window[0].similarity >= window[1].similarity);
        }
    }
}
