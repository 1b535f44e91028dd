//! Extracción de entidades, relaciones y afirmaciones por gleaning.
//!
//! Cada chunk pasa por una extracción inicial y hasta `max_gleanings`
//! rondas de refinamiento en las que se pide al LLM lo que faltó. La salida
//! del LLM son registros delimitados que se parsean de forma estricta: un
//! registro malformado se descarta con un aviso y el resto sigue adelante.
//! Un fallo del LLM tras los reintentos deja el chunk vacío; la pérdida
//! degrada la cobertura, nunca la corrección.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::graph_store::DESCRIPTION_SEPARATOR;
use crate::llm::LlmManager;
use crate::models::ClaimStatus;
use crate::prompts;

/// Entidad observada en un chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub confidence: f64,
}

/// Relación observada en un chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub rel_type: String,
    pub description: String,
    pub confidence: f64,
    pub weight: f64,
}

/// Afirmación observada en un chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedClaim {
    pub subject: String,
    pub object: Option<String>,
    pub claim_type: String,
    pub status: ClaimStatus,
    pub description: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl ExtractedClaim {
    /// Id estable: hash de (sujeto, objeto, tipo, descripción).
    pub fn stable_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update(b"|");
        hasher.update(self.object.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(self.claim_type.as_bytes());
        hasher.update(b"|");
        hasher.update(self.description.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Resultado completo de la extracción de un chunk.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
    pub claims: Vec<ExtractedClaim>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.claims.is_empty()
    }

    fn absorb(&mut self, other: ExtractionResult) {
        self.entities.extend(other.entities);
        self.relationships.extend(other.relationships);
        self.claims.extend(other.claims);
    }
}

/// Motor de extracción: sin estado propio más allá de la pasarela LLM y la
/// configuración.
#[derive(Debug, Clone)]
pub struct Extractor {
    llm: LlmManager,
    cfg: ExtractionConfig,
}

impl Extractor {
    pub fn new(llm: LlmManager, cfg: ExtractionConfig) -> Self {
        Self { llm, cfg }
    }

    /// Extrae el grafo de un chunk con refinamiento iterativo y devuelve el
    /// resultado ya deduplicado por chunk.
    pub async fn extract_graph(&self, chunk_text: &str) -> ExtractionResult {
        let initial_prompt = prompts::extraction_prompt(&self.cfg, chunk_text);
        let mut result = match self
            .llm
            .complete(prompts::EXTRACTION_SYSTEM, &initial_prompt, 0.0)
            .await
        {
            Ok(raw) => parse_records(&raw, &self.cfg),
            Err(e) => {
                warn!("Extracción inicial fallida, el chunk queda vacío: {e}");
                return ExtractionResult::default();
            }
        };

        for round in 0..self.cfg.max_gleanings {
            let continue_prompt = format!(
                "{initial_prompt}\n\nRegistros ya extraídos:\n{}\n\n{}",
                render_records(&result, &self.cfg),
                prompts::gleaning_continue_prompt(&self.cfg)
            );
            match self
                .llm
                .complete(prompts::EXTRACTION_SYSTEM, &continue_prompt, 0.0)
                .await
            {
                Ok(raw) => {
                    let extra = parse_records(&raw, &self.cfg);
                    debug!(
                        ronda = round + 1,
                        entidades = extra.entities.len(),
                        relaciones = extra.relationships.len(),
                        "Gleaning aportó registros adicionales"
                    );
                    result.absorb(extra);
                }
                Err(e) => {
                    warn!("Ronda de gleaning {} fallida: {e}", round + 1);
                    break;
                }
            }

            // Pregunta binaria: ¿queda algo por extraer?
            let check_prompt = format!(
                "Texto analizado:\n{chunk_text}\n\nRegistros extraídos:\n{}\n\n{}",
                render_records(&result, &self.cfg),
                prompts::GLEANING_LOOP_PROMPT
            );
            match self
                .llm
                .complete(prompts::EXTRACTION_SYSTEM, &check_prompt, 0.0)
                .await
            {
                Ok(reply) => {
                    let done = !reply.trim().to_uppercase().starts_with('Y');
                    if done {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        dedupe(result)
    }

    /// Consolida varias descripciones de la misma entidad en una sola,
    /// acotada por la longitud configurada.
    pub async fn consolidate_description(
        &self,
        entity_name: &str,
        entity_type: &str,
        descriptions: &[String],
    ) -> Option<String> {
        if !self.cfg.enable_description_summarization || descriptions.len() < 2 {
            return None;
        }
        let prompt = prompts::summarize_descriptions_prompt(
            entity_name,
            entity_type,
            descriptions,
            self.cfg.description_max_length,
        );
        match self.llm.complete(prompts::EXTRACTION_SYSTEM, &prompt, 0.3).await {
            Ok(summary) => {
                let summary = summary.trim().to_string();
                if summary.is_empty() {
                    None
                } else {
                    Some(summary)
                }
            }
            Err(e) => {
                warn!("Consolidación de descripciones de '{entity_name}' fallida: {e}");
                None
            }
        }
    }
}

/// Parsea la salida delimitada del LLM. Ignora todo lo posterior al
/// delimitador de finalización y descarta registros malformados.
pub fn parse_records(raw: &str, cfg: &ExtractionConfig) -> ExtractionResult {
    let body = match raw.find(&cfg.completion_delimiter) {
        Some(idx) => &raw[..idx],
        None => raw,
    };

    let mut result = ExtractionResult::default();
    for record in body.split(&cfg.record_delimiter) {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.split(&cfg.tuple_delimiter).map(str::trim).collect();
        match fields[0].to_lowercase().as_str() {
            "entity" => match parse_entity(&fields, cfg) {
                Some(e) => result.entities.push(e),
                None => warn!("Registro de entidad malformado descartado: {record}"),
            },
            "relationship" => match parse_relationship(&fields) {
                Some(r) => result.relationships.push(r),
                None => warn!("Registro de relación malformado descartado: {record}"),
            },
            "claim" => match parse_claim(&fields) {
                Some(c) => result.claims.push(c),
                None => warn!("Registro de afirmación malformado descartado: {record}"),
            },
            _ => debug!("Línea sin etiqueta reconocible ignorada: {record}"),
        }
    }
    result
}

fn parse_entity(fields: &[&str], cfg: &ExtractionConfig) -> Option<ExtractedEntity> {
    if fields.len() < 4 || fields[1].is_empty() {
        return None;
    }
    let raw_type = fields[2].to_uppercase().replace(' ', "_");
    let entity_type = if cfg.entity_types.iter().any(|t| t == &raw_type) {
        raw_type
    } else {
        "OTHER".to_string()
    };
    Some(ExtractedEntity {
        name: fields[1].to_string(),
        entity_type,
        description: fields[3].to_string(),
        confidence: parse_confidence(fields.get(4)),
    })
}

fn parse_relationship(fields: &[&str]) -> Option<ExtractedRelationship> {
    if fields.len() < 5 || fields[1].is_empty() || fields[2].is_empty() {
        return None;
    }
    let confidence = parse_confidence(fields.get(5));
    Some(ExtractedRelationship {
        source: fields[1].to_string(),
        target: fields[2].to_string(),
        rel_type: fields[3].to_uppercase().replace(' ', "_"),
        description: fields[4].to_string(),
        confidence,
        weight: confidence,
    })
}

fn parse_claim(fields: &[&str]) -> Option<ExtractedClaim> {
    if fields.len() < 6 || fields[1].is_empty() {
        return None;
    }
    Some(ExtractedClaim {
        subject: fields[1].to_string(),
        object: optional_field(fields[2]),
        claim_type: fields[3].to_uppercase().replace(' ', "_"),
        status: ClaimStatus::parse(fields[4]),
        description: fields[5].to_string(),
        start_date: fields.get(6).and_then(|f| optional_field(f)),
        end_date: fields.get(7).and_then(|f| optional_field(f)),
    })
}

fn optional_field(field: &str) -> Option<String> {
    let trimmed = field.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") || trimmed == "-" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_confidence(field: Option<&&str>) -> f64 {
    field
        .and_then(|f| f.parse::<f64>().ok())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0)
}

/// Deduplicación por chunk: entidades por (nombre, tipo) sin distinguir
/// mayúsculas, con descripciones unidas y confianzas promediadas;
/// relaciones por (origen, destino, tipo) con peso máximo.
pub fn dedupe(result: ExtractionResult) -> ExtractionResult {
    let mut entities: HashMap<(String, String), (ExtractedEntity, usize)> = HashMap::new();
    for entity in result.entities {
        let key = (entity.name.to_lowercase(), entity.entity_type.clone());
        match entities.get_mut(&key) {
            Some((kept, n)) => {
                if !entity.description.is_empty()
                    && !kept.description.contains(&entity.description)
                {
                    if !kept.description.is_empty() {
                        kept.description.push_str(DESCRIPTION_SEPARATOR);
                    }
                    kept.description.push_str(&entity.description);
                }
                kept.confidence = (kept.confidence * *n as f64 + entity.confidence)
                    / (*n as f64 + 1.0);
                *n += 1;
            }
            None => {
                entities.insert(key, (entity, 1));
            }
        }
    }

    let mut relationships: HashMap<(String, String, String), ExtractedRelationship> =
        HashMap::new();
    for rel in result.relationships {
        let key = (
            rel.source.to_lowercase(),
            rel.target.to_lowercase(),
            rel.rel_type.clone(),
        );
        match relationships.get_mut(&key) {
            Some(kept) => {
                if !rel.description.is_empty() && !kept.description.contains(&rel.description) {
                    if !kept.description.is_empty() {
                        kept.description.push_str(DESCRIPTION_SEPARATOR);
                    }
                    kept.description.push_str(&rel.description);
                }
                kept.weight = kept.weight.max(rel.weight);
                kept.confidence = kept.confidence.max(rel.confidence);
            }
            None => {
                relationships.insert(key, rel);
            }
        }
    }

    let mut claims: HashMap<String, ExtractedClaim> = HashMap::new();
    for claim in result.claims {
        claims.entry(claim.stable_id()).or_insert(claim);
    }

    let mut entities: Vec<ExtractedEntity> = entities.into_values().map(|(e, _)| e).collect();
    entities.sort_by(|a, b| a.name.cmp(&b.name));
    let mut relationships: Vec<ExtractedRelationship> = relationships.into_values().collect();
    relationships.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
    let mut claims: Vec<ExtractedClaim> = claims.into_values().collect();
    claims.sort_by(|a, b| a.subject.cmp(&b.subject));

    ExtractionResult {
        entities,
        relationships,
        claims,
    }
}

/// Render inverso de los registros, usado para decirle al LLM qué hay ya
/// extraído en las rondas de gleaning.
fn render_records(result: &ExtractionResult, cfg: &ExtractionConfig) -> String {
    let t = &cfg.tuple_delimiter;
    let mut lines = Vec::new();
    for e in &result.entities {
        lines.push(format!(
            "entity{t}{}{t}{}{t}{}{t}{:.2}",
            e.name, e.entity_type, e.description, e.confidence
        ));
    }
    for r in &result.relationships {
        lines.push(format!(
            "relationship{t}{}{t}{}{t}{}{t}{}{t}{:.2}",
            r.source, r.target, r.rel_type, r.description, r.confidence
        ));
    }
    for c in &result.claims {
        lines.push(format!(
            "claim{t}{}{t}{}{t}{}{t}{}{t}{}{t}{}{t}{}",
            c.subject,
            c.object.as_deref().unwrap_or("NONE"),
            c.claim_type,
            c.status.as_str(),
            c.description,
            c.start_date.as_deref().unwrap_or("NONE"),
            c.end_date.as_deref().unwrap_or("NONE"),
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::{LlmBackend, LlmCallError, LlmRequest};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn cfg() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    #[test]
    fn parsea_registros_bien_formados() {
        let raw = "\
entity|||Alice|||PERSON|||Ingeniera en Acme|||0.9
entity|||Acme|||ORGANIZATION|||Empresa tecnológica|||0.95
relationship|||Alice|||Acme|||WORKS_AT|||Alice trabaja en Acme|||0.9
claim|||Acme|||Paris|||LOCATION|||TRUE|||Acme tiene sede en París|||NONE|||NONE
<COMPLETE>";
        let result = parse_records(raw, &cfg());
        assert_eq!(result.entities.len(), 2);
        assert_eq!(result.relationships.len(), 1);
        assert_eq!(result.claims.len(), 1);
        assert_eq!(result.relationships[0].rel_type, "WORKS_AT");
        assert_eq!(result.claims[0].object.as_deref(), Some("Paris"));
        assert_eq!(result.claims[0].start_date, None);
    }

    #[test]
    fn descarta_registros_malformados_sin_abortar() {
        let raw = "\
entity|||Alice|||PERSON|||desc|||0.9
entity|||
relationship|||solo_origen
basura sin etiqueta
entity|||Bob|||PERSON|||otra desc|||0.8";
        let result = parse_records(raw, &cfg());
        assert_eq!(result.entities.len(), 2);
        assert!(result.relationships.is_empty());
    }

    #[test]
    fn ignora_texto_tras_el_delimitador_de_fin() {
        let raw = "entity|||Alice|||PERSON|||desc|||0.9\n<COMPLETE>\nentity|||Fantasma|||PERSON|||no|||0.9";
        let result = parse_records(raw, &cfg());
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].name, "Alice");
    }

    #[test]
    fn tipo_desconocido_cae_en_other() {
        let raw = "entity|||Algo|||ALIEN_TECH|||desc|||0.9";
        let result = parse_records(raw, &cfg());
        assert_eq!(result.entities[0].entity_type, "OTHER");
    }

    #[test]
    fn dedupe_une_entidades_por_nombre_y_tipo() {
        let result = ExtractionResult {
            entities: vec![
                ExtractedEntity {
                    name: "Acme".into(),
                    entity_type: "ORGANIZATION".into(),
                    description: "Empresa".into(),
                    confidence: 0.8,
                },
                ExtractedEntity {
                    name: "acme".into(),
                    entity_type: "ORGANIZATION".into(),
                    description: "Con sede en París".into(),
                    confidence: 0.6,
                },
            ],
            relationships: vec![],
            claims: vec![],
        };
        let deduped = dedupe(result);
        assert_eq!(deduped.entities.len(), 1);
        let entity = &deduped.entities[0];
        assert!(entity.description.contains("Empresa"));
        assert!(entity.description.contains("París"));
        assert!((entity.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn dedupe_maximiza_peso_de_relaciones() {
        let mk = |w: f64| ExtractedRelationship {
            source: "A".into(),
            target: "B".into(),
            rel_type: "KNOWS".into(),
            description: String::new(),
            confidence: w,
            weight: w,
        };
        let deduped = dedupe(ExtractionResult {
            entities: vec![],
            relationships: vec![mk(0.4), mk(0.9)],
            claims: vec![],
        });
        assert_eq!(deduped.relationships.len(), 1);
        assert_eq!(deduped.relationships[0].weight, 0.9);
    }

    #[test]
    fn id_de_claim_es_estable() {
        let claim = ExtractedClaim {
            subject: "Acme".into(),
            object: Some("Paris".into()),
            claim_type: "LOCATION".into(),
            status: ClaimStatus::True,
            description: "Sede en París".into(),
            start_date: None,
            end_date: None,
        };
        assert_eq!(claim.stable_id(), claim.clone().stable_id());
    }

    /// Backend guionizado: devuelve las respuestas en orden.
    struct ScriptedBackend {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn complete(&self, _req: &LlmRequest) -> Result<String, LlmCallError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok("N".to_string());
            }
            Ok(replies.remove(0))
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f64>>, LlmCallError> {
            Err(LlmCallError::Fatal("sin embeddings".into()))
        }
    }

    fn manager(replies: Vec<&str>) -> LlmManager {
        let backend = Arc::new(ScriptedBackend {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
        });
        LlmManager::with_backend(
            backend,
            &LlmConfig {
                rate_limit_rpm: 6000,
                max_retries: 0,
                ..LlmConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn el_gleaning_suma_registros_de_rondas_posteriores() {
        let llm = manager(vec![
            "entity|||Alice|||PERSON|||Ingeniera|||0.9\n<COMPLETE>",
            "entity|||Acme|||ORGANIZATION|||Empresa|||0.9\n<COMPLETE>",
            "N",
        ]);
        let extractor = Extractor::new(llm, cfg());
        let result = extractor.extract_graph("Alice trabaja en Acme.").await;
        assert_eq!(result.entities.len(), 2);
    }

    #[tokio::test]
    async fn fallo_del_llm_devuelve_resultado_vacio() {
        // Backend que sólo sabe decir "N": la pasada inicial no produce
        // registros y el resultado queda vacío sin error.
        let llm = manager(vec![]);
        let extractor = Extractor::new(llm, cfg());
        let result = extractor.extract_graph("Texto").await;
        assert!(result.entities.is_empty());
    }
}
