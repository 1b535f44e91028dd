//! Ingesta incremental de documentos Markdown en el grafo de conocimiento.
//!
//! Cada documento pasa por una serie de pasos con punto de control: hash de
//! contenido (los documentos sin cambios se saltan), diff de chunks por
//! hash de texto, extracción por chunk, resolución de duplicados sobre el
//! conjunto afectado, detección incremental de comunidades y regeneración
//! de los informes cuya pertenencia cambió. Un chunk fallido degrada la
//! cobertura sin abortar el documento; un fallo de paso deja el documento
//! en estado `failed` con el grafo consistente.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunker::{Chunk, Chunker};
use crate::community::CommunityBuilder;
use crate::error::{EngineError, EngineResult};
use crate::extract::{ExtractionResult, Extractor};
use crate::graph_store::GraphStore;
use crate::llm::LlmManager;
use crate::models::{ClaimNode, DocumentNode, DocumentStatus, TextUnitNode};
use crate::resolve::{lcs_ratio, Resolver};
use crate::summarize::CommunitySummarizer;
use crate::vector_store;

/// Extensiones aceptadas al recorrer un directorio.
const TEXT_EXTENSIONS: [&str; 3] = ["md", "markdown", "txt"];
/// Similitud mínima para enlazar el objeto de una afirmación por nombre.
const CLAIM_OBJECT_FUZZY_THRESHOLD: f64 = 0.85;

/// Resultado de la ingesta de un documento.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub status: DocumentStatus,
    pub chunks_created: usize,
    pub entities_count: usize,
    pub relationships_count: usize,
    pub claims_count: usize,
    pub communities_count: usize,
}

/// Resumen de los resultados de una ingesta de directorio.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub chunks_created: usize,
    pub entities_created: usize,
    pub relationships_created: usize,
    pub claims_created: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos. {} chunks, {} entidades, {} relaciones y {} afirmaciones.",
            self.files_scanned,
            self.files_ingested,
            self.files_skipped,
            self.chunks_created,
            self.entities_created,
            self.relationships_created,
            self.claims_created
        )
    }
}

/// Orquestador de la ingesta. No guarda estado propio: opera sobre los dos
/// manejadores de larga vida y los componentes sin estado construidos sobre
/// ellos.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    store: GraphStore,
    llm: LlmManager,
    chunker: Chunker,
    extractor: Extractor,
    resolver: Resolver,
    communities: CommunityBuilder,
    summarizer: CommunitySummarizer,
    resolution_enabled: bool,
    extraction_fan_out: usize,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: GraphStore,
        llm: LlmManager,
        chunker: Chunker,
        extractor: Extractor,
        resolver: Resolver,
        communities: CommunityBuilder,
        summarizer: CommunitySummarizer,
        resolution_enabled: bool,
        extraction_fan_out: usize,
    ) -> Self {
        Self {
            store,
            llm,
            chunker,
            extractor,
            resolver,
            communities,
            summarizer,
            resolution_enabled,
            extraction_fan_out: extraction_fan_out.max(1),
        }
    }

    /// Ingesta (o re-ingesta) un documento. Idempotente sobre contenido sin
    /// cambios: con el mismo hash devuelve `ready` sin tocar el grafo.
    pub async fn ingest_document(
        &self,
        document_id: &str,
        file_path: &Path,
    ) -> EngineResult<IngestOutcome> {
        let job_id = Uuid::new_v4().to_string();
        let span = info_span!("ingesta", job = %job_id, documento = %document_id);
        self.ingest_document_inner(document_id, file_path)
            .instrument(span)
            .await
    }

    async fn ingest_document_inner(
        &self,
        document_id: &str,
        file_path: &Path,
    ) -> EngineResult<IngestOutcome> {
        let text = std::fs::read_to_string(file_path)?;
        let content_hash = sha256_hex(&text);

        // 1) Hash sin cambios: no hay nada que hacer.
        if let Some(existing) = self.store.get_document(document_id).await? {
            if existing.content_hash == content_hash {
                info!("Contenido sin cambios; la ingesta se salta.");
                if existing.status != DocumentStatus::Ready {
                    self.store
                        .set_document_status(document_id, DocumentStatus::Ready)
                        .await?;
                }
                return Ok(IngestOutcome {
                    status: DocumentStatus::Ready,
                    ..IngestOutcome::default()
                });
            }
        }

        // El nombre de fichero a secas no es único en un árbol (varios
        // README.md); el nombre del documento incorpora el id para respetar
        // la constraint de unicidad sobre Document.name.
        let name = match file_path.file_name() {
            Some(file_name) => format!("{document_id}:{}", file_name.to_string_lossy()),
            None => document_id.to_string(),
        };
        let now = chrono::Utc::now().to_rfc3339();
        self.store
            .upsert_document(&DocumentNode {
                id: document_id.to_string(),
                name,
                file_path: file_path.to_string_lossy().to_string(),
                content_hash: content_hash.clone(),
                status: DocumentStatus::Processing,
                created_at: now.clone(),
                updated_at: now,
            })
            .await?;

        match self.run_pipeline(document_id, &text).await {
            Ok(outcome) => {
                self.store
                    .set_document_status(document_id, DocumentStatus::Ready)
                    .await?;
                Ok(IngestOutcome {
                    status: DocumentStatus::Ready,
                    ..outcome
                })
            }
            Err(e) => {
                error!("Ingesta de {document_id} fallida: {e}");
                let _ = self
                    .store
                    .set_document_status(document_id, DocumentStatus::Failed)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, document_id: &str, text: &str) -> EngineResult<IngestOutcome> {
        // 2) Troceado y diff contra los chunks almacenados.
        let chunks = self.chunker.chunk(text);
        let stored = self.store.textunit_hashes(document_id).await?;
        let stored_by_hash: HashMap<&str, &str> = stored
            .iter()
            .map(|(id, hash)| (hash.as_str(), id.as_str()))
            .collect();

        let mut new_units: Vec<(TextUnitNode, String)> = Vec::new();
        let mut surviving_hashes: HashSet<String> = HashSet::new();
        for chunk in &chunks {
            let text_hash = sha256_hex(&chunk.text);
            if stored_by_hash.contains_key(text_hash.as_str()) {
                surviving_hashes.insert(text_hash);
                continue;
            }
            let unit = TextUnitNode {
                id: textunit_id(document_id, chunk),
                document_id: document_id.to_string(),
                text: chunk.text.clone(),
                start_char: chunk.start_char as i64,
                end_char: chunk.end_char as i64,
                token_count: chunk.token_count as i64,
            };
            new_units.push((unit, text_hash));
        }

        let stale_ids: Vec<String> = stored
            .iter()
            .filter(|(_, hash)| !surviving_hashes.contains(hash))
            .map(|(id, _)| id.clone())
            .collect();

        // Entidades que pierden menciones con los chunks borrados también
        // cuentan como afectadas para comunidades y resolución.
        let mut affected: HashSet<String> = self
            .store
            .entities_mentioned_by(&stale_ids)
            .await?
            .into_iter()
            .collect();
        self.store.delete_textunits(&stale_ids).await?;

        for (unit, text_hash) in &new_units {
            self.store.upsert_textunit(unit, text_hash).await?;
        }
        info!(
            nuevos = new_units.len(),
            borrados = stale_ids.len(),
            "Diff de chunks aplicado"
        );

        // Embeddings opcionales de los chunks nuevos.
        if self.llm.supports_embeddings() && !new_units.is_empty() {
            let texts: Vec<String> = new_units.iter().map(|(u, _)| u.text.clone()).collect();
            match self.llm.embed(&texts).await {
                Ok(vectors) => {
                    for ((unit, _), vector) in new_units.iter().zip(vectors) {
                        vector_store::store_textunit_embedding(&self.store, &unit.id, &vector)
                            .await?;
                    }
                }
                Err(e) => warn!("Embeddings de chunks no disponibles: {e}"),
            }
        }

        // 3) Extracción por chunk, concurrente hasta el fan-out configurado.
        let extractions: Vec<(String, ExtractionResult)> =
            stream::iter(new_units.iter().map(|(unit, _)| {
                let extractor = self.extractor.clone();
                let unit_id = unit.id.clone();
                let text = unit.text.clone();
                async move {
                    let result = extractor.extract_graph(&text).await;
                    (unit_id, result)
                }
            }))
            .buffered(self.extraction_fan_out)
            .collect()
            .await;

        let mut outcome = IngestOutcome {
            chunks_created: new_units.len(),
            ..IngestOutcome::default()
        };
        let mut descriptions: HashMap<(String, String), Vec<String>> = HashMap::new();
        let mut entity_ids: HashMap<(String, String), String> = HashMap::new();

        for (unit_id, extraction) in &extractions {
            if let Err(e) = self
                .persist_chunk(unit_id, extraction, &mut entity_ids, &mut descriptions, &mut outcome)
                .await
            {
                // Contención a nivel de chunk: se pierde cobertura, no
                // corrección.
                warn!("Chunk {unit_id} no persistido del todo: {e}");
            }
        }
        affected.extend(entity_ids.values().cloned());

        // Consolidación de descripciones con varias observaciones.
        for ((name, entity_type), observed) in &descriptions {
            if observed.len() < 2 {
                continue;
            }
            if let Some(summary) = self
                .extractor
                .consolidate_description(name, entity_type, observed)
                .await
            {
                if let Some(id) = entity_ids.get(&(name.clone(), entity_type.clone())) {
                    self.store.set_entity_description(id, &summary).await?;
                }
            }
        }

        self.store.cleanup_unreferenced_entities().await?;

        let affected_ids: Vec<String> = affected.into_iter().collect();

        // 4) Resolución de duplicados sobre el conjunto afectado.
        if self.resolution_enabled {
            let merges = self.resolver.resolve_affected(&affected_ids).await?;
            if merges > 0 {
                info!(fusiones = merges, "Resolución de entidades aplicada");
            }
        }

        // 5) Comunidades incrementales sobre los afectados.
        let detection = self.communities.detect_incremental(&affected_ids).await?;
        outcome.communities_count = detection.communities;

        // 6) Regenerar los informes de las comunidades cuya pertenencia
        // cambió. Un informe fallido no aborta la ingesta.
        let changed = self.store.community_keys_for_entities(&affected_ids).await?;
        if let Err(e) = self.summarizer.summarize_keys(&changed).await {
            warn!("Regeneración de informes incompleta: {e}");
        }

        Ok(outcome)
    }

    /// Persiste el resultado de extracción de un chunk: entidades,
    /// menciones, relaciones y afirmaciones con sus aristas.
    async fn persist_chunk(
        &self,
        unit_id: &str,
        extraction: &ExtractionResult,
        entity_ids: &mut HashMap<(String, String), String>,
        descriptions: &mut HashMap<(String, String), Vec<String>>,
        outcome: &mut IngestOutcome,
    ) -> EngineResult<()> {
        for entity in &extraction.entities {
            let id = match self
                .store
                .upsert_entity(
                    &entity.name,
                    &entity.entity_type,
                    &entity.description,
                    entity.confidence,
                )
                .await
            {
                Ok(id) => id,
                Err(EngineError::InvariantViolation(msg)) => {
                    warn!("Entidad rechazada: {msg}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.store.create_mention(unit_id, &id).await?;
            let key = (entity.name.to_lowercase(), entity.entity_type.clone());
            if !entity.description.is_empty() {
                descriptions
                    .entry(key.clone())
                    .or_default()
                    .push(entity.description.clone());
            }
            entity_ids.insert(key, id);
            outcome.entities_count += 1;
        }

        for rel in &extraction.relationships {
            let source = self.resolve_local_entity(&rel.source, entity_ids);
            let target = self.resolve_local_entity(&rel.target, entity_ids);
            let (Some(source_id), Some(target_id)) = (source, target) else {
                warn!(
                    "Relación {} -> {} sin entidades resolubles; descartada",
                    rel.source, rel.target
                );
                continue;
            };
            self.store
                .upsert_relationship(
                    &source_id,
                    &target_id,
                    &rel.rel_type,
                    &rel.description,
                    rel.confidence,
                    rel.weight,
                )
                .await?;
            outcome.relationships_count += 1;
        }

        for claim in &extraction.claims {
            let Some(subject_id) = self.resolve_local_entity(&claim.subject, entity_ids) else {
                warn!("Afirmación sin sujeto resoluble ({}); descartada", claim.subject);
                continue;
            };
            let node = ClaimNode {
                id: claim.stable_id(),
                subject_name: claim.subject.clone(),
                object_name: claim.object.clone(),
                claim_type: claim.claim_type.clone(),
                status: claim.status,
                description: claim.description.clone(),
                start_date: claim.start_date.clone(),
                end_date: claim.end_date.clone(),
                source_text: claim.description.clone(),
                occurrence_count: 1,
            };
            self.store.upsert_claim(&node).await?;
            self.store.link_claim_subject(&node.id, &subject_id).await?;
            self.store.link_claim_source(&node.id, unit_id).await?;

            // El objeto se enlaza por coincidencia difusa de nombre, si la
            // hay; ABOUT es opcional.
            if let Some(object_name) = &claim.object {
                if let Some(object_id) = self.fuzzy_local_entity(object_name, entity_ids) {
                    self.store.link_claim_object(&node.id, &object_id).await?;
                }
            }
            outcome.claims_count += 1;
        }

        Ok(())
    }

    /// Id de una entidad extraída en este documento, por nombre exacto
    /// (sin distinguir mayúsculas) en cualquier tipo.
    fn resolve_local_entity(
        &self,
        name: &str,
        entity_ids: &HashMap<(String, String), String>,
    ) -> Option<String> {
        let lowered = name.to_lowercase();
        entity_ids
            .iter()
            .find(|((n, _), _)| *n == lowered)
            .map(|(_, id)| id.clone())
    }

    fn fuzzy_local_entity(
        &self,
        name: &str,
        entity_ids: &HashMap<(String, String), String>,
    ) -> Option<String> {
        if let Some(id) = self.resolve_local_entity(name, entity_ids) {
            return Some(id);
        }
        entity_ids
            .iter()
            .map(|((n, _), id)| (lcs_ratio(name, n), id))
            .filter(|(sim, _)| *sim >= CLAIM_OBJECT_FUZZY_THRESHOLD)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, id)| id.clone())
    }

    /// Recorre recursivamente un directorio ingiriendo los ficheros de
    /// texto soportados. El id de documento deriva de la ruta, de modo que
    /// re-ejecutar sobre el mismo árbol es incremental.
    pub async fn ingest_directory(&self, root: &Path) -> EngineResult<IngestionSummary> {
        if !root.is_dir() {
            return Err(EngineError::NotFound(format!(
                "La ruta no es un directorio: {}",
                root.display()
            )));
        }

        let mut summary = IngestionSummary::default();
        let entries: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        let total = entries.len();

        for (index, entry) in entries.iter().enumerate() {
            summary.files_scanned += 1;
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(std::ffi::OsStr::to_str)
                .unwrap_or("")
                .to_lowercase();
            if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
                summary.files_skipped += 1;
                continue;
            }

            let document_id = document_id_for_path(path);
            info!(
                "[{}/{}] Procesando: {}",
                index + 1,
                total,
                path.display()
            );
            match self.ingest_document(&document_id, path).await {
                Ok(outcome) => {
                    summary.files_ingested += 1;
                    summary.chunks_created += outcome.chunks_created;
                    summary.entities_created += outcome.entities_count;
                    summary.relationships_created += outcome.relationships_count;
                    summary.claims_created += outcome.claims_count;
                }
                Err(e) => {
                    summary.files_skipped += 1;
                    error!("Error ingiriendo {}: {e}", path.display());
                }
            }
        }

        info!("{summary}");
        Ok(summary)
    }
}

/// Id estable de documento derivado de su ruta.
pub fn document_id_for_path(path: &Path) -> String {
    let digest = sha256_hex(&path.to_string_lossy());
    format!("doc-{}", &digest[..16])
}

/// Id determinista de unidad de texto: documento + offset + hash del texto.
fn textunit_id(document_id: &str, chunk: &Chunk) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(chunk.start_char.to_be_bytes());
    hasher.update(chunk.text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("tu-{}", &digest[..24])
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_hash_de_contenido_es_estable() {
        assert_eq!(sha256_hex("hola"), sha256_hex("hola"));
        assert_ne!(sha256_hex("hola"), sha256_hex("hola "));
    }

    #[test]
    fn el_id_de_unidad_depende_de_documento_offset_y_texto() {
        let chunk = Chunk {
            text: "contenido".into(),
            start_char: 0,
            end_char: 9,
            token_count: 2,
        };
        let a = textunit_id("doc-1", &chunk);
        let b = textunit_id("doc-2", &chunk);
        assert_ne!(a, b);
        assert!(a.starts_with("tu-"));

        let moved = Chunk {
            start_char: 5,
            ..chunk.clone()
        };
        assert_ne!(textunit_id("doc-1", &chunk), textunit_id("doc-1", &moved));
    }

    #[test]
    fn el_id_de_documento_deriva_de_la_ruta() {
        let a = document_id_for_path(Path::new("/corpus/a.md"));
        let b = document_id_for_path(Path::new("/corpus/b.md"));
        assert_ne!(a, b);
        assert_eq!(a, document_id_for_path(Path::new("/corpus/a.md")));
    }

    #[test]
    fn el_resumen_se_muestra_en_texto() {
        let summary = IngestionSummary {
            files_scanned: 3,
            files_ingested: 2,
            files_skipped: 1,
            chunks_created: 10,
            entities_created: 25,
            relationships_created: 12,
            claims_created: 4,
        };
        let text = summary.to_string();
        assert!(text.contains("3 ficheros escaneados"));
        assert!(text.contains("25 entidades"));
    }
}
