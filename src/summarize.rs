//! Informes estructurados de comunidades: título, resumen, temas,
//! significancia y hallazgos, generados por el LLM a partir de los miembros
//! de la comunidad, sus relaciones internas y una muestra de afirmaciones.
//! El informe debe sostenerse exclusivamente sobre ese material.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::graph_store::GraphStore;
use crate::llm::LlmManager;
use crate::models::Significance;
use crate::prompts;

/// Miembros que se muestran al LLM, los más mencionados primero.
const TOP_MEMBERS: i64 = 15;
/// Muestra máxima de afirmaciones por comunidad.
const CLAIM_SAMPLE: i64 = 10;

/// Hallazgo individual del informe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub summary: String,
    pub explanation: String,
}

/// Esquema del informe que devuelve el LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct CommunityReport {
    pub title: String,
    pub summary: String,
    pub rating: f64,
    #[serde(default)]
    pub rating_explanation: String,
    #[serde(default)]
    pub themes: Vec<String>,
    pub significance: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone)]
pub struct CommunitySummarizer {
    store: GraphStore,
    llm: LlmManager,
}

impl CommunitySummarizer {
    pub fn new(store: GraphStore, llm: LlmManager) -> Self {
        Self { store, llm }
    }

    /// Genera y guarda el informe de una comunidad. Devuelve `false` si la
    /// comunidad está vacía o el informe no se pudo producir; un informe
    /// fallido no detiene al resto.
    pub async fn summarize_community(&self, community_id: i64, level: i64) -> EngineResult<bool> {
        let members = self
            .store
            .community_members(community_id, level, TOP_MEMBERS)
            .await?;
        if members.is_empty() {
            return Ok(false);
        }

        let relationships = self
            .store
            .community_relationships(community_id, level)
            .await?;
        let claims = self
            .store
            .community_claims(community_id, level, CLAIM_SAMPLE)
            .await?;

        let entities_block = members
            .iter()
            .map(|e| format!("- {} ({}): {}", e.name, e.entity_type, e.description))
            .collect::<Vec<_>>()
            .join("\n");
        let relationships_block = if relationships.is_empty() {
            "(ninguna)".to_string()
        } else {
            relationships
                .iter()
                .map(|r| {
                    format!(
                        "- {} --[{}]--> {}: {}",
                        r.source_name, r.rel_type, r.target_name, r.description
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let claims_block = if claims.is_empty() {
            "(ninguna)".to_string()
        } else {
            claims
                .iter()
                .map(|c| {
                    format!(
                        "- [{}] {}: {}",
                        c.status.as_str(),
                        c.subject_name,
                        c.description
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt =
            prompts::community_report_prompt(&entities_block, &relationships_block, &claims_block);

        // Un informe que no parsea se reintenta una vez; a la segunda se
        // deja vacío y se continúa.
        let report = match self.request_report(&prompt).await {
            Ok(report) => report,
            Err(EngineError::Parse(first)) => match self.request_report(&prompt).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(
                        comunidad = community_id,
                        nivel = level,
                        "Informe no parseable tras reintento ({first}; {e}); se deja vacío"
                    );
                    return Ok(false);
                }
            },
            Err(e) => return Err(e),
        };

        let findings_json = serde_json::to_string(&report.findings)
            .map_err(|e| EngineError::parse("hallazgos del informe", e))?;
        let rating = report.rating.clamp(0.0, 10.0);
        self.store
            .store_community_report(
                community_id,
                level,
                report.title.trim(),
                report.summary.trim(),
                rating,
                &report.rating_explanation,
                &report.themes,
                Significance::parse(&report.significance),
                &findings_json,
            )
            .await?;

        info!(
            comunidad = community_id,
            nivel = level,
            "Informe de comunidad almacenado: {}",
            report.title.trim()
        );
        Ok(true)
    }

    async fn request_report(&self, prompt: &str) -> EngineResult<CommunityReport> {
        self.llm
            .complete_json::<CommunityReport>(prompts::EXTRACTION_SYSTEM, prompt, 0.3)
            .await
    }

    /// Resume un lote de comunidades identificadas por (id, nivel).
    /// Devuelve cuántos informes se almacenaron.
    pub async fn summarize_keys(&self, keys: &[(i64, i64)]) -> EngineResult<usize> {
        let mut stored = 0usize;
        for (community_id, level) in keys {
            if self.summarize_community(*community_id, *level).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Resume todas las comunidades, o sólo las que no tienen resumen.
    pub async fn summarize_all(&self, only_missing: bool) -> EngineResult<usize> {
        let keys = if only_missing {
            self.store.communities_without_summary().await?
        } else {
            self.store.all_community_keys().await?
        };
        self.summarize_keys(&keys).await
    }
}
