//! Almacén de grafo sobre Neo4j: única pieza con permiso de mutación.
//!
//! Todos los componentes escriben a través de estas operaciones
//! parametrizadas; las escrituras de varios statements van dentro de una
//! transacción explícita que se confirma o revierte en todos los caminos de
//! salida. Ningún componente cachea ids de nodos más allá del alcance de
//! una consulta.

use std::collections::HashSet;
use std::sync::Arc;

use neo4rs::{query, ConfigBuilder, Graph, Txn};
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ClaimNode, ClaimStatus, CommunityNode, DocumentNode, DocumentStatus, EntityNode, GraphStats,
    QueryNode, RelationshipRecord, Significance, TextUnitNode,
};

/// Separador usado al concatenar descripciones de una misma entidad.
pub const DESCRIPTION_SEPARATOR: &str = " | ";

/// Arista saliente agrupada por tipo, con su número de usos.
#[derive(Debug, Clone)]
pub struct RelationTypeCount {
    pub rel_type: String,
    pub uses: i64,
}

/// Candidato alcanzado al seguir una relación durante la exploración.
#[derive(Debug, Clone)]
pub struct RelationTarget {
    pub source_name: String,
    pub entity: EntityNode,
    pub rel_description: String,
    pub confidence: f64,
}

/// Comunidad anotada con su peso global (unidades de texto alcanzables).
#[derive(Debug, Clone)]
pub struct WeightedCommunity {
    pub community: CommunityNode,
    pub weight: i64,
}

/// Manejador de larga vida sobre el pool de conexiones de Neo4j.
#[derive(Clone)]
pub struct GraphStore {
    graph: Arc<Graph>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore").finish()
    }
}

impl GraphStore {
    /// Conecta con Neo4j usando la configuración dada.
    pub async fn connect(cfg: &AppConfig) -> EngineResult<Self> {
        let url = Url::parse(&cfg.neo4j_uri)
            .map_err(|e| EngineError::Configuration(format!("NEO4J_URI inválida: {e}")))?;
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port().unwrap_or(7687);
        let addr = format!("{host}:{port}");

        info!("Conectando a Neo4j en {addr}...");
        let config = ConfigBuilder::default()
            .uri(&addr)
            .user(&cfg.neo4j_user)
            .password(&cfg.neo4j_password)
            .max_connections(cfg.neo4j_max_connections)
            .build()
            .map_err(EngineError::Graph)?;
        let graph = Graph::connect(config).await?;
        info!("Conexión a Neo4j OK");
        Ok(Self {
            graph: Arc::new(graph),
        })
    }

    /// Crea constraints e índices para todas las etiquetas del grafo.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        let statements = [
            "CREATE CONSTRAINT document_id IF NOT EXISTS
             FOR (d:Document)
             REQUIRE d.id IS UNIQUE",
            "CREATE CONSTRAINT document_name IF NOT EXISTS
             FOR (d:Document)
             REQUIRE d.name IS UNIQUE",
            "CREATE CONSTRAINT textunit_id IF NOT EXISTS
             FOR (t:TextUnit)
             REQUIRE t.id IS UNIQUE",
            // La pareja (name, type) identifica a la entidad en todo el grafo.
            "CREATE CONSTRAINT entity_name_type IF NOT EXISTS
             FOR (e:Entity)
             REQUIRE (e.name, e.type) IS UNIQUE",
            "CREATE CONSTRAINT claim_id IF NOT EXISTS
             FOR (c:Claim)
             REQUIRE c.id IS UNIQUE",
            "CREATE CONSTRAINT community_id_level IF NOT EXISTS
             FOR (c:Community)
             REQUIRE (c.id, c.level) IS UNIQUE",
            "CREATE CONSTRAINT query_id IF NOT EXISTS
             FOR (q:Query)
             REQUIRE q.id IS UNIQUE",
            "CREATE INDEX entity_id IF NOT EXISTS FOR (e:Entity) ON (e.id)",
            "CREATE INDEX entity_name IF NOT EXISTS FOR (e:Entity) ON (e.name)",
            "CREATE INDEX textunit_document IF NOT EXISTS FOR (t:TextUnit) ON (t.document_id)",
        ];

        for stmt in statements {
            self.graph.run(query(stmt)).await?;
        }

        info!("Esquema de Neo4j asegurado (constraints e índices creados).");
        Ok(())
    }

    /// Acceso crudo para módulos hermanos que abren sus propias
    /// transacciones (resolutor, ingesta).
    pub(crate) fn inner(&self) -> &Graph {
        self.graph.as_ref()
    }

    // ------------------------------------------------------------------
    // DOCUMENTOS Y UNIDADES DE TEXTO
    // ------------------------------------------------------------------

    pub async fn upsert_document(&self, doc: &DocumentNode) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MERGE (d:Document {id: $id})
                     ON CREATE SET d.created_at = $now
                     SET d.name = $name, d.file_path = $file_path,
                         d.content_hash = $content_hash, d.status = $status,
                         d.updated_at = $now",
                )
                .param("id", doc.id.clone())
                .param("name", doc.name.clone())
                .param("file_path", doc.file_path.clone())
                .param("content_hash", doc.content_hash.clone())
                .param("status", doc.status.as_str())
                .param("now", doc.updated_at.clone()),
            )
            .await?;
        Ok(())
    }

    pub async fn set_document_status(&self, id: &str, status: DocumentStatus) -> EngineResult<()> {
        self.graph
            .run(
                query("MATCH (d:Document {id: $id}) SET d.status = $status, d.updated_at = $now")
                    .param("id", id)
                    .param("status", status.as_str())
                    .param("now", chrono::Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> EngineResult<Option<DocumentNode>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (d:Document {id: $id})
                     RETURN d.id AS id, d.name AS name, d.file_path AS file_path,
                            d.content_hash AS content_hash, d.status AS status,
                            d.created_at AS created_at, d.updated_at AS updated_at",
                )
                .param("id", id),
            )
            .await?;

        match cursor.next().await? {
            Some(row) => Ok(Some(DocumentNode {
                id: req_str(&row, "id")?,
                name: req_str(&row, "name")?,
                file_path: req_str(&row, "file_path")?,
                content_hash: req_str(&row, "content_hash")?,
                status: DocumentStatus::parse(&req_str(&row, "status")?),
                created_at: row.get::<String>("created_at").unwrap_or_default(),
                updated_at: row.get::<String>("updated_at").unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }

    /// Borra el documento y sus unidades de texto en cascada, decrementando
    /// las menciones de las entidades afectadas.
    pub async fn delete_document(&self, id: &str) -> EngineResult<()> {
        let txn = self.graph.start_txn().await?;
        let result = async {
            txn.run(
                query(
                    "MATCH (d:Document {id: $id})-[:CONTAINS]->(t:TextUnit)-[:MENTIONS]->(e:Entity)
                     WITH e, count(t) AS menciones
                     SET e.mention_count = e.mention_count - menciones",
                )
                .param("id", id),
            )
            .await?;
            txn.run(
                query(
                    "MATCH (d:Document {id: $id})
                     OPTIONAL MATCH (d)-[:CONTAINS]->(t:TextUnit)
                     DETACH DELETE t, d",
                )
                .param("id", id),
            )
            .await?;
            Ok::<(), EngineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                txn.commit().await?;
                self.cleanup_unreferenced_entities().await?;
                Ok(())
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn upsert_textunit(&self, unit: &TextUnitNode, text_hash: &str) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MERGE (t:TextUnit {id: $id})
                     SET t.document_id = $document_id, t.text = $text,
                         t.start_char = $start_char, t.end_char = $end_char,
                         t.token_count = $token_count, t.text_hash = $text_hash
                     WITH t
                     MATCH (d:Document {id: $document_id})
                     MERGE (d)-[:CONTAINS]->(t)",
                )
                .param("id", unit.id.clone())
                .param("document_id", unit.document_id.clone())
                .param("text", unit.text.clone())
                .param("start_char", unit.start_char)
                .param("end_char", unit.end_char)
                .param("token_count", unit.token_count)
                .param("text_hash", text_hash),
            )
            .await?;
        Ok(())
    }

    /// Hashes de las unidades almacenadas de un documento, para el diff
    /// incremental.
    pub async fn textunit_hashes(&self, document_id: &str) -> EngineResult<Vec<(String, String)>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (d:Document {id: $id})-[:CONTAINS]->(t:TextUnit)
                     RETURN t.id AS id, t.text_hash AS text_hash
                     ORDER BY t.start_char",
                )
                .param("id", document_id),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push((req_str(&row, "id")?, req_str(&row, "text_hash")?));
        }
        Ok(out)
    }

    /// Entidades mencionadas por las unidades de texto dadas.
    pub async fn entities_mentioned_by(&self, unit_ids: &[String]) -> EngineResult<Vec<String>> {
        if unit_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (t:TextUnit)-[:MENTIONS]->(e:Entity)
                     WHERE t.id IN $ids
                     RETURN DISTINCT e.id AS id",
                )
                .param("ids", unit_ids.to_vec()),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(req_str(&row, "id")?);
        }
        Ok(out)
    }

    /// Borra unidades de texto concretas decrementando menciones.
    pub async fn delete_textunits(&self, ids: &[String]) -> EngineResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let txn = self.graph.start_txn().await?;
        let result = async {
            txn.run(
                query(
                    "MATCH (t:TextUnit)-[:MENTIONS]->(e:Entity)
                     WHERE t.id IN $ids
                     WITH e, count(t) AS menciones
                     SET e.mention_count = e.mention_count - menciones",
                )
                .param("ids", ids.to_vec()),
            )
            .await?;
            txn.run(
                query("MATCH (t:TextUnit) WHERE t.id IN $ids DETACH DELETE t")
                    .param("ids", ids.to_vec()),
            )
            .await?;
            Ok::<(), EngineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                txn.commit().await?;
                Ok(())
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    /// Elimina entidades sin menciones que ninguna afirmación ni relación
    /// mantiene con vida.
    pub async fn cleanup_unreferenced_entities(&self) -> EngineResult<u64> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (e:Entity)
                 WHERE e.mention_count <= 0
                   AND NOT ()-[:MENTIONS]->(e)
                   AND NOT (e)-[:RELATED_TO]-()
                   AND NOT (e)-[:MAKES_CLAIM]->()
                   AND NOT ()-[:ABOUT]->(e)
                 DETACH DELETE e
                 RETURN count(*) AS borradas",
            ))
            .await?;

        let deleted = match cursor.next().await? {
            Some(row) => row.get::<i64>("borradas").unwrap_or(0) as u64,
            None => 0,
        };
        if deleted > 0 {
            info!("Limpieza de entidades sin referencias: {deleted} borradas");
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // ENTIDADES Y RELACIONES
    // ------------------------------------------------------------------

    /// MERGE de entidad sobre la clave (name, type). Incrementa
    /// mention_count, funde la descripción con separador si es nueva y se
    /// queda con la confianza máxima. Devuelve el id estable de la entidad.
    pub async fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        description: &str,
        confidence: f64,
    ) -> EngineResult<String> {
        if name.trim().is_empty() {
            return Err(EngineError::InvariantViolation(
                "Entidad con nombre vacío rechazada".into(),
            ));
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MERGE (e:Entity {name: $name, type: $type})
                     ON CREATE SET e.id = $new_id, e.description = $description,
                                   e.confidence = $confidence, e.mention_count = 1,
                                   e.aliases = []
                     ON MATCH SET e.mention_count = e.mention_count + 1,
                                  e.confidence = CASE WHEN $confidence > e.confidence
                                                      THEN $confidence ELSE e.confidence END,
                                  e.description = CASE
                                      WHEN $description = '' OR e.description CONTAINS $description
                                      THEN e.description
                                      ELSE e.description + $sep + $description END
                     RETURN e.id AS id",
                )
                .param("name", name.trim())
                .param("type", entity_type)
                .param("new_id", new_id)
                .param("description", description)
                .param("confidence", confidence)
                .param("sep", DESCRIPTION_SEPARATOR),
            )
            .await?;

        match cursor.next().await? {
            Some(row) => req_str(&row, "id"),
            None => Err(EngineError::InvariantViolation(format!(
                "MERGE de entidad ({name}, {entity_type}) no devolvió id"
            ))),
        }
    }

    /// Sustituye la descripción consolidada de una entidad.
    pub async fn set_entity_description(&self, id: &str, description: &str) -> EngineResult<()> {
        self.graph
            .run(
                query("MATCH (e:Entity {id: $id}) SET e.description = $description")
                    .param("id", id)
                    .param("description", description),
            )
            .await?;
        Ok(())
    }

    /// MERGE de relación sobre (origen, destino, tipo); el peso y la
    /// confianza se quedan con el máximo observado.
    pub async fn upsert_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        description: &str,
        confidence: f64,
        weight: f64,
    ) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (s:Entity {id: $source_id}), (t:Entity {id: $target_id})
                     MERGE (s)-[r:RELATED_TO {type: $rel_type}]->(t)
                     ON CREATE SET r.description = $description, r.confidence = $confidence,
                                   r.weight = $weight
                     ON MATCH SET r.weight = CASE WHEN $weight > r.weight THEN $weight ELSE r.weight END,
                                  r.confidence = CASE WHEN $confidence > r.confidence
                                                      THEN $confidence ELSE r.confidence END,
                                  r.description = CASE
                                      WHEN $description = '' OR r.description CONTAINS $description
                                      THEN r.description
                                      ELSE r.description + $sep + $description END",
                )
                .param("source_id", source_id)
                .param("target_id", target_id)
                .param("rel_type", rel_type)
                .param("description", description)
                .param("confidence", confidence)
                .param("weight", weight)
                .param("sep", DESCRIPTION_SEPARATOR),
            )
            .await?;
        Ok(())
    }

    /// Crea la mención TextUnit → Entity (dirección semántica: el texto
    /// menciona a la entidad).
    pub async fn create_mention(&self, textunit_id: &str, entity_id: &str) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (t:TextUnit {id: $tid}), (e:Entity {id: $eid})
                     MERGE (t)-[:MENTIONS]->(e)",
                )
                .param("tid", textunit_id)
                .param("eid", entity_id),
            )
            .await?;
        Ok(())
    }

    pub async fn entity_by_id(&self, id: &str) -> EngineResult<Option<EntityNode>> {
        let mut cursor = self
            .graph
            .execute(
                query(&format!(
                    "MATCH (e:Entity {{id: $id}}) RETURN {RETURN_ENTITY}"
                ))
                .param("id", id),
            )
            .await?;
        match cursor.next().await? {
            Some(row) => Ok(Some(entity_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn entities_by_ids(&self, ids: &[String]) -> EngineResult<Vec<EntityNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(&format!(
                    "MATCH (e:Entity) WHERE e.id IN $ids RETURN {RETURN_ENTITY}"
                ))
                .param("ids", ids.to_vec()),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(entity_from_row(&row)?);
        }
        Ok(out)
    }

    /// Entidades más mencionadas del grafo (candidatas a tema de ToG).
    pub async fn top_entities_by_mentions(&self, limit: i64) -> EngineResult<Vec<EntityNode>> {
        let mut cursor = self
            .graph
            .execute(
                query(&format!(
                    "MATCH (e:Entity) RETURN {RETURN_ENTITY}
                     ORDER BY e.mention_count DESC LIMIT $limit"
                ))
                .param("limit", limit),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(entity_from_row(&row)?);
        }
        Ok(out)
    }

    /// Todas las entidades con su grado de relación, opcionalmente acotadas
    /// a un documento.
    pub async fn entities_with_degree(
        &self,
        document_scope: Option<&str>,
    ) -> EngineResult<Vec<EntityNode>> {
        let cypher = match document_scope {
            Some(_) => {
                "MATCH (d:Document {id: $doc})-[:CONTAINS]->(:TextUnit)-[:MENTIONS]->(e:Entity)
                 WITH DISTINCT e
                 OPTIONAL MATCH (e)-[r:RELATED_TO]-()
                 WITH e, count(r) AS degree
                 RETURN e.id AS id, e.name AS name, e.type AS type,
                        e.description AS description, e.mention_count AS mention_count,
                        e.confidence AS confidence, e.aliases AS aliases, degree"
            }
            None => {
                "MATCH (e:Entity)
                 OPTIONAL MATCH (e)-[r:RELATED_TO]-()
                 WITH e, count(r) AS degree
                 RETURN e.id AS id, e.name AS name, e.type AS type,
                        e.description AS description, e.mention_count AS mention_count,
                        e.confidence AS confidence, e.aliases AS aliases, degree"
            }
        };
        let mut q = query(cypher);
        if let Some(doc) = document_scope {
            q = q.param("doc", doc);
        }
        let mut cursor = self.graph.execute(q).await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(entity_from_row(&row)?);
        }
        Ok(out)
    }

    /// Relaciones cuyo origen o destino está en el conjunto dado.
    pub async fn relationships_touching(
        &self,
        ids: &[String],
    ) -> EngineResult<Vec<(String, String, RelationshipRecord)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (s:Entity)-[r:RELATED_TO]->(t:Entity)
                     WHERE s.id IN $ids OR t.id IN $ids
                     RETURN s.id AS source_id, t.id AS target_id,
                            s.name AS source_name, t.name AS target_name,
                            r.type AS rel_type, r.description AS description,
                            r.confidence AS confidence, r.weight AS weight",
                )
                .param("ids", ids.to_vec()),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push((
                req_str(&row, "source_id")?,
                req_str(&row, "target_id")?,
                RelationshipRecord {
                    source_name: req_str(&row, "source_name")?,
                    target_name: req_str(&row, "target_name")?,
                    rel_type: req_str(&row, "rel_type")?,
                    description: row.get::<String>("description").unwrap_or_default(),
                    confidence: row.get::<f64>("confidence").unwrap_or(0.0),
                    weight: row.get::<f64>("weight").unwrap_or(0.0),
                },
            ));
        }
        Ok(out)
    }

    /// Vecinos a un salto por RELATED_TO.
    pub async fn one_hop_neighbors(&self, ids: &[String]) -> EngineResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity)-[:RELATED_TO]-(n:Entity)
                     WHERE e.id IN $ids
                     RETURN DISTINCT n.id AS id",
                )
                .param("ids", ids.to_vec()),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(req_str(&row, "id")?);
        }
        Ok(out)
    }

    /// Unidades de texto que mencionan a cualquiera de las entidades dadas,
    /// deduplicadas y en orden estable.
    pub async fn textunits_mentioning(
        &self,
        entity_ids: &[String],
        limit: i64,
    ) -> EngineResult<Vec<TextUnitNode>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (t:TextUnit)-[:MENTIONS]->(e:Entity)
                     WHERE e.id IN $ids
                     WITH DISTINCT t
                     RETURN t.id AS id, t.document_id AS document_id, t.text AS text,
                            t.start_char AS start_char, t.end_char AS end_char,
                            t.token_count AS token_count
                     ORDER BY t.document_id, t.start_char
                     LIMIT $limit",
                )
                .param("ids", entity_ids.to_vec())
                .param("limit", limit),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(textunit_from_row(&row)?);
        }
        Ok(out)
    }

    /// Unidades de texto ordenadas por cuántas entidades de la frontera
    /// mencionan (enriquecimiento de la síntesis de ToG).
    pub async fn textunits_by_frontier_coverage(
        &self,
        entity_ids: &[String],
        limit: i64,
    ) -> EngineResult<Vec<TextUnitNode>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (t:TextUnit)-[:MENTIONS]->(e:Entity)
                     WHERE e.id IN $ids
                     WITH t, count(DISTINCT e) AS cobertura
                     ORDER BY cobertura DESC, t.id
                     LIMIT $limit
                     RETURN t.id AS id, t.document_id AS document_id, t.text AS text,
                            t.start_char AS start_char, t.end_char AS end_char,
                            t.token_count AS token_count",
                )
                .param("ids", entity_ids.to_vec())
                .param("limit", limit),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(textunit_from_row(&row)?);
        }
        Ok(out)
    }

    /// Hasta `limit` extractos de texto que mencionan a la entidad.
    pub async fn mention_excerpts(&self, entity_id: &str, limit: i64) -> EngineResult<Vec<String>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (t:TextUnit)-[:MENTIONS]->(e:Entity {id: $id})
                     RETURN t.text AS text ORDER BY t.id LIMIT $limit",
                )
                .param("id", entity_id)
                .param("limit", limit),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(req_str(&row, "text")?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // AFIRMACIONES
    // ------------------------------------------------------------------

    pub async fn upsert_claim(&self, claim: &ClaimNode) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MERGE (c:Claim {id: $id})
                     ON CREATE SET c.subject_name = $subject_name, c.object_name = $object_name,
                                   c.type = $type, c.status = $status,
                                   c.description = $description, c.start_date = $start_date,
                                   c.end_date = $end_date, c.source_text = $source_text,
                                   c.occurrence_count = 1
                     ON MATCH SET c.occurrence_count = c.occurrence_count + 1",
                )
                .param("id", claim.id.clone())
                .param("subject_name", claim.subject_name.clone())
                .param("object_name", claim.object_name.clone().unwrap_or_default())
                .param("type", claim.claim_type.clone())
                .param("status", claim.status.as_str())
                .param("description", claim.description.clone())
                .param("start_date", claim.start_date.clone().unwrap_or_default())
                .param("end_date", claim.end_date.clone().unwrap_or_default())
                .param("source_text", claim.source_text.clone()),
            )
            .await?;
        Ok(())
    }

    /// Arista sujeto → afirmación.
    pub async fn link_claim_subject(&self, claim_id: &str, entity_id: &str) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (e:Entity {id: $eid}), (c:Claim {id: $cid})
                     MERGE (e)-[:MAKES_CLAIM]->(c)",
                )
                .param("eid", entity_id)
                .param("cid", claim_id),
            )
            .await?;
        Ok(())
    }

    /// Arista afirmación → objeto (opcional).
    pub async fn link_claim_object(&self, claim_id: &str, entity_id: &str) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (c:Claim {id: $cid}), (e:Entity {id: $eid})
                     MERGE (c)-[:ABOUT]->(e)",
                )
                .param("cid", claim_id)
                .param("eid", entity_id),
            )
            .await?;
        Ok(())
    }

    /// Arista afirmación → unidad de texto de origen.
    pub async fn link_claim_source(&self, claim_id: &str, textunit_id: &str) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (c:Claim {id: $cid}), (t:TextUnit {id: $tid})
                     MERGE (c)-[:SOURCED_FROM]->(t)",
                )
                .param("cid", claim_id)
                .param("tid", textunit_id),
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // COMUNIDADES
    // ------------------------------------------------------------------

    /// Proyección no dirigida del subgrafo de entidades: ids de nodo y
    /// aristas (origen, destino, peso). Con `scope` vacío proyecta todo.
    pub async fn entity_projection(
        &self,
        scope: Option<&[String]>,
    ) -> EngineResult<(Vec<String>, Vec<(String, String, f64)>)> {
        let (nodes_cypher, edges_cypher) = match scope {
            Some(_) => (
                "MATCH (e:Entity) WHERE e.id IN $ids RETURN e.id AS id",
                "MATCH (s:Entity)-[r:RELATED_TO]->(t:Entity)
                 WHERE s.id IN $ids AND t.id IN $ids
                 RETURN s.id AS source, t.id AS target, r.weight AS weight",
            ),
            None => (
                "MATCH (e:Entity) RETURN e.id AS id",
                "MATCH (s:Entity)-[r:RELATED_TO]->(t:Entity)
                 RETURN s.id AS source, t.id AS target, r.weight AS weight",
            ),
        };

        let mut nodes_q = query(nodes_cypher);
        let mut edges_q = query(edges_cypher);
        if let Some(ids) = scope {
            nodes_q = nodes_q.param("ids", ids.to_vec());
            edges_q = edges_q.param("ids", ids.to_vec());
        }

        let mut nodes = Vec::new();
        let mut cursor = self.graph.execute(nodes_q).await?;
        while let Some(row) = cursor.next().await? {
            nodes.push(req_str(&row, "id")?);
        }

        let mut edges = Vec::new();
        let mut cursor = self.graph.execute(edges_q).await?;
        while let Some(row) = cursor.next().await? {
            edges.push((
                req_str(&row, "source")?,
                req_str(&row, "target")?,
                row.get::<f64>("weight").unwrap_or(1.0),
            ));
        }
        Ok((nodes, edges))
    }

    /// Borra las pertenencias a comunidad de las entidades dadas.
    pub async fn clear_community_memberships(&self, entity_ids: &[String]) -> EngineResult<()> {
        if entity_ids.is_empty() {
            return Ok(());
        }
        self.graph
            .run(
                query(
                    "MATCH (e:Entity)-[r:IN_COMMUNITY]->()
                     WHERE e.id IN $ids
                     DELETE r",
                )
                .param("ids", entity_ids.to_vec()),
            )
            .await?;
        Ok(())
    }

    /// Asigna una entidad a una comunidad de un nivel, creando la comunidad
    /// si no existe.
    pub async fn assign_community(
        &self,
        entity_id: &str,
        community_id: i64,
        level: i64,
        confidence: f64,
    ) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MERGE (c:Community {id: $cid, level: $level})
                     ON CREATE SET c.summary = '', c.title = '', c.themes = [],
                                   c.significance = 'medium'
                     WITH c
                     MATCH (e:Entity {id: $eid})
                     MERGE (e)-[r:IN_COMMUNITY]->(c)
                     SET r.confidence = $confidence, r.community_level = $level",
                )
                .param("cid", community_id)
                .param("level", level)
                .param("eid", entity_id)
                .param("confidence", confidence),
            )
            .await?;
        Ok(())
    }

    /// Arista comunidad → comunidad padre (nivel superior de la jerarquía).
    pub async fn link_community_parent(
        &self,
        child_id: i64,
        child_level: i64,
        parent_id: i64,
        parent_level: i64,
    ) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (c:Community {id: $cid, level: $clevel}),
                           (p:Community {id: $pid, level: $plevel})
                     MERGE (c)-[:PART_OF]->(p)",
                )
                .param("cid", child_id)
                .param("clevel", child_level)
                .param("pid", parent_id)
                .param("plevel", parent_level),
            )
            .await?;
        Ok(())
    }

    /// Borra comunidades que se quedaron sin miembros.
    pub async fn delete_orphan_communities(&self) -> EngineResult<u64> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (c:Community)
                 WHERE NOT ()-[:IN_COMMUNITY]->(c)
                 DETACH DELETE c
                 RETURN count(*) AS borradas",
            ))
            .await?;
        let deleted = match cursor.next().await? {
            Some(row) => row.get::<i64>("borradas").unwrap_or(0) as u64,
            None => 0,
        };
        Ok(deleted)
    }

    /// Mayor id de comunidad en uso; -1 con el grafo vacío. Las detecciones
    /// incrementales arrancan por encima para no pisar ids vivos.
    pub async fn max_community_id(&self) -> EngineResult<i64> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (c:Community) RETURN coalesce(max(c.id), -1) AS max_id",
            ))
            .await?;
        match cursor.next().await? {
            Some(row) => Ok(row.get::<i64>("max_id").unwrap_or(-1)),
            None => Ok(-1),
        }
    }

    /// Guarda el informe estructurado sobre el nodo de comunidad.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_community_report(
        &self,
        community_id: i64,
        level: i64,
        title: &str,
        summary: &str,
        rating: f64,
        rating_explanation: &str,
        themes: &[String],
        significance: Significance,
        findings_json: &str,
    ) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (c:Community {id: $id, level: $level})
                     SET c.title = $title, c.summary = $summary, c.rating = $rating,
                         c.rating_explanation = $rating_explanation, c.themes = $themes,
                         c.significance = $significance, c.findings = $findings",
                )
                .param("id", community_id)
                .param("level", level)
                .param("title", title)
                .param("summary", summary)
                .param("rating", rating)
                .param("rating_explanation", rating_explanation)
                .param("themes", themes.to_vec())
                .param("significance", significance.as_str())
                .param("findings", findings_json),
            )
            .await?;
        Ok(())
    }

    /// Comunidades de un nivel con su peso global: número de unidades de
    /// texto distintas alcanzables desde sus miembros.
    pub async fn communities_at_level(&self, level: i64) -> EngineResult<Vec<WeightedCommunity>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (c:Community {level: $level})
                     OPTIONAL MATCH (c)<-[:IN_COMMUNITY]-(e:Entity)
                     OPTIONAL MATCH (t:TextUnit)-[:MENTIONS]->(e)
                     WITH c, count(DISTINCT e) AS entity_count, count(DISTINCT t) AS weight
                     RETURN c.id AS id, c.level AS level, c.title AS title,
                            c.summary AS summary, c.themes AS themes,
                            c.significance AS significance, c.rank AS rank,
                            entity_count, weight
                     ORDER BY weight DESC, c.id",
                )
                .param("level", level),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(WeightedCommunity {
                community: community_from_row(&row)?,
                weight: row.get::<i64>("weight").unwrap_or(0),
            });
        }
        Ok(out)
    }

    /// Comunidades (de un nivel) a las que pertenecen las entidades dadas.
    pub async fn communities_for_entities(
        &self,
        entity_ids: &[String],
        level: i64,
    ) -> EngineResult<Vec<CommunityNode>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity)-[:IN_COMMUNITY]->(c:Community {level: $level})
                     WHERE e.id IN $ids
                     WITH DISTINCT c
                     OPTIONAL MATCH (c)<-[:IN_COMMUNITY]-(m:Entity)
                     WITH c, count(DISTINCT m) AS entity_count
                     RETURN c.id AS id, c.level AS level, c.title AS title,
                            c.summary AS summary, c.themes AS themes,
                            c.significance AS significance, c.rank AS rank, entity_count
                     ORDER BY c.id",
                )
                .param("ids", entity_ids.to_vec())
                .param("level", level),
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(community_from_row(&row)?);
        }
        Ok(out)
    }

    /// Comunidades a las que pertenece cualquier entidad del conjunto, en
    /// todos los niveles. Sirve para saber qué informes deben regenerarse.
    pub async fn community_keys_for_entities(
        &self,
        entity_ids: &[String],
    ) -> EngineResult<Vec<(i64, i64)>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity)-[:IN_COMMUNITY]->(c:Community)
                     WHERE e.id IN $ids
                     RETURN DISTINCT c.id AS id, c.level AS level",
                )
                .param("ids", entity_ids.to_vec()),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push((
                row.get::<i64>("id").unwrap_or(0),
                row.get::<i64>("level").unwrap_or(0),
            ));
        }
        Ok(out)
    }

    /// Comunidades sin resumen (para `summarize_communities(only_missing)`).
    pub async fn communities_without_summary(&self) -> EngineResult<Vec<(i64, i64)>> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (c:Community)
                 WHERE c.summary IS NULL OR c.summary = ''
                 RETURN c.id AS id, c.level AS level",
            ))
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push((
                row.get::<i64>("id").unwrap_or(0),
                row.get::<i64>("level").unwrap_or(0),
            ));
        }
        Ok(out)
    }

    pub async fn all_community_keys(&self) -> EngineResult<Vec<(i64, i64)>> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (c:Community) RETURN c.id AS id, c.level AS level",
            ))
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push((
                row.get::<i64>("id").unwrap_or(0),
                row.get::<i64>("level").unwrap_or(0),
            ));
        }
        Ok(out)
    }

    /// Miembros de una comunidad, los más mencionados primero.
    pub async fn community_members(
        &self,
        community_id: i64,
        level: i64,
        limit: i64,
    ) -> EngineResult<Vec<EntityNode>> {
        let mut cursor = self
            .graph
            .execute(
                query(&format!(
                    "MATCH (e:Entity)-[:IN_COMMUNITY]->(c:Community {{id: $id, level: $level}})
                     RETURN {RETURN_ENTITY}
                     ORDER BY e.mention_count DESC LIMIT $limit"
                ))
                .param("id", community_id)
                .param("level", level)
                .param("limit", limit),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(entity_from_row(&row)?);
        }
        Ok(out)
    }

    /// Relaciones internas entre miembros de una comunidad.
    pub async fn community_relationships(
        &self,
        community_id: i64,
        level: i64,
    ) -> EngineResult<Vec<RelationshipRecord>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (s:Entity)-[:IN_COMMUNITY]->(c:Community {id: $id, level: $level}),
                           (t:Entity)-[:IN_COMMUNITY]->(c),
                           (s)-[r:RELATED_TO]->(t)
                     RETURN s.name AS source_name, t.name AS target_name,
                            r.type AS rel_type, r.description AS description,
                            r.confidence AS confidence, r.weight AS weight",
                )
                .param("id", community_id)
                .param("level", level),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(RelationshipRecord {
                source_name: req_str(&row, "source_name")?,
                target_name: req_str(&row, "target_name")?,
                rel_type: req_str(&row, "rel_type")?,
                description: row.get::<String>("description").unwrap_or_default(),
                confidence: row.get::<f64>("confidence").unwrap_or(0.0),
                weight: row.get::<f64>("weight").unwrap_or(0.0),
            });
        }
        Ok(out)
    }

    /// Muestra de afirmaciones hechas por o sobre los miembros.
    pub async fn community_claims(
        &self,
        community_id: i64,
        level: i64,
        limit: i64,
    ) -> EngineResult<Vec<ClaimNode>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity)-[:IN_COMMUNITY]->(c:Community {id: $id, level: $level})
                     MATCH (cl:Claim)
                     WHERE (e)-[:MAKES_CLAIM]->(cl) OR (cl)-[:ABOUT]->(e)
                     WITH DISTINCT cl LIMIT $limit
                     RETURN cl.id AS id, cl.subject_name AS subject_name,
                            cl.object_name AS object_name, cl.type AS type,
                            cl.status AS status, cl.description AS description,
                            cl.start_date AS start_date, cl.end_date AS end_date,
                            cl.source_text AS source_text,
                            cl.occurrence_count AS occurrence_count",
                )
                .param("id", community_id)
                .param("level", level)
                .param("limit", limit),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            let object_name = row.get::<String>("object_name").unwrap_or_default();
            out.push(ClaimNode {
                id: req_str(&row, "id")?,
                subject_name: req_str(&row, "subject_name")?,
                object_name: if object_name.is_empty() {
                    None
                } else {
                    Some(object_name)
                },
                claim_type: row.get::<String>("type").unwrap_or_default(),
                status: ClaimStatus::parse(&row.get::<String>("status").unwrap_or_default()),
                description: row.get::<String>("description").unwrap_or_default(),
                start_date: non_empty(row.get::<String>("start_date")),
                end_date: non_empty(row.get::<String>("end_date")),
                source_text: row.get::<String>("source_text").unwrap_or_default(),
                occurrence_count: row.get::<i64>("occurrence_count").unwrap_or(1),
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // EXPLORACIÓN (ToG)
    // ------------------------------------------------------------------

    /// Tipos de relación salientes de la frontera, con su número de usos.
    pub async fn outgoing_relation_types(
        &self,
        frontier_ids: &[String],
    ) -> EngineResult<Vec<RelationTypeCount>> {
        if frontier_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (s:Entity)-[r:RELATED_TO]->(:Entity)
                     WHERE s.id IN $ids
                     RETURN r.type AS rel_type, count(*) AS uses
                     ORDER BY uses DESC",
                )
                .param("ids", frontier_ids.to_vec()),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(RelationTypeCount {
                rel_type: req_str(&row, "rel_type")?,
                uses: row.get::<i64>("uses").unwrap_or(0),
            });
        }
        Ok(out)
    }

    /// Entidades alcanzables desde la frontera siguiendo un tipo de
    /// relación concreto.
    pub async fn targets_for_relation(
        &self,
        frontier_ids: &[String],
        rel_type: &str,
        limit: i64,
    ) -> EngineResult<Vec<RelationTarget>> {
        if frontier_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (s:Entity)-[r:RELATED_TO {type: $rel_type}]->(t:Entity)
                     WHERE s.id IN $ids
                     RETURN s.name AS source_name, t.id AS id, t.name AS name,
                            t.type AS type, t.description AS description,
                            t.mention_count AS mention_count, t.confidence AS confidence,
                            t.aliases AS aliases, 0 AS degree,
                            r.description AS rel_description,
                            r.confidence AS rel_confidence
                     LIMIT $limit",
                )
                .param("ids", frontier_ids.to_vec())
                .param("rel_type", rel_type)
                .param("limit", limit),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            out.push(RelationTarget {
                source_name: req_str(&row, "source_name")?,
                entity: entity_from_row(&row)?,
                rel_description: row.get::<String>("rel_description").unwrap_or_default(),
                confidence: row.get::<f64>("rel_confidence").unwrap_or(0.0),
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // AUDITORÍA Y ESTADÍSTICAS
    // ------------------------------------------------------------------

    /// Registra la consulta respondida y su procedencia.
    pub async fn log_query(
        &self,
        node: &QueryNode,
        entity_citations: &[String],
        community_citations: &[(i64, i64)],
    ) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MERGE (q:Query {id: $id})
                     SET q.question = $question, q.mode = $mode,
                         q.created_at = $created_at, q.confidence = $confidence",
                )
                .param("id", node.id.clone())
                .param("question", node.question.clone())
                .param("mode", node.mode.as_str())
                .param("created_at", node.created_at.clone())
                .param("confidence", node.confidence),
            )
            .await?;

        for entity_id in entity_citations {
            self.graph
                .run(
                    query(
                        "MATCH (q:Query {id: $qid}), (e:Entity {id: $eid})
                         MERGE (q)-[:ANSWERED_FROM]->(e)",
                    )
                    .param("qid", node.id.clone())
                    .param("eid", entity_id.clone()),
                )
                .await?;
        }
        for (community_id, level) in community_citations {
            self.graph
                .run(
                    query(
                        "MATCH (q:Query {id: $qid}), (c:Community {id: $cid, level: $level})
                         MERGE (q)-[:ANSWERED_FROM]->(c)",
                    )
                    .param("qid", node.id.clone())
                    .param("cid", *community_id)
                    .param("level", *level),
                )
                .await?;
        }
        Ok(())
    }

    /// Borra el grafo completo. Pensado para entornos de prueba y
    /// reconstrucciones desde cero; no hay vuelta atrás.
    pub async fn purge_graph(&self) -> EngineResult<()> {
        self.graph.run(query("MATCH (n) DETACH DELETE n")).await?;
        warn!("Grafo purgado por completo");
        Ok(())
    }

    /// Recuento global de nodos y relaciones del grafo.
    pub async fn graph_stats(&self) -> EngineResult<GraphStats> {
        let mut stats = GraphStats::default();
        let pairs = [
            ("MATCH (d:Document) RETURN count(d) AS n", 0usize),
            ("MATCH (t:TextUnit) RETURN count(t) AS n", 1),
            ("MATCH (e:Entity) RETURN count(e) AS n", 2),
            ("MATCH ()-[r:RELATED_TO]->() RETURN count(r) AS n", 3),
            ("MATCH (c:Claim) RETURN count(c) AS n", 4),
            ("MATCH (c:Community) RETURN count(c) AS n", 5),
        ];
        for (cypher, slot) in pairs {
            let mut cursor = self.graph.execute(query(cypher)).await?;
            let n = match cursor.next().await? {
                Some(row) => row.get::<i64>("n").unwrap_or(0),
                None => 0,
            };
            match slot {
                0 => stats.documents = n,
                1 => stats.textunits = n,
                2 => stats.entities = n,
                3 => stats.relationships = n,
                4 => stats.claims = n,
                _ => stats.communities = n,
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // FUSIÓN DE ENTIDADES (resolutor)
    // ------------------------------------------------------------------

    /// Fusiona entidades duplicadas en la primaria dentro de una única
    /// transacción: recablea relaciones, menciones y afirmaciones, suma
    /// menciones, une alias y borra las duplicadas. Fusionar un par ya
    /// fusionado es un no-op.
    pub async fn merge_entities(
        &self,
        primary_id: &str,
        duplicate_ids: &[String],
        canonical_name: &str,
    ) -> EngineResult<bool> {
        let duplicates: Vec<String> = duplicate_ids
            .iter()
            .filter(|id| id.as_str() != primary_id)
            .cloned()
            .collect();
        if duplicates.is_empty() {
            return Ok(false);
        }

        // Alias y menciones de las duplicadas, leídos antes de tocar nada.
        let dup_entities = self.entities_by_ids(&duplicates).await?;
        if dup_entities.is_empty() {
            return Ok(false);
        }
        let primary = match self.entity_by_id(primary_id).await? {
            Some(p) => p,
            None => {
                return Err(EngineError::NotFound(format!(
                    "entidad primaria {primary_id}"
                )))
            }
        };

        let mut aliases: HashSet<String> = primary.aliases.iter().cloned().collect();
        let mut extra_mentions = 0i64;
        for dup in &dup_entities {
            aliases.insert(dup.name.clone());
            aliases.extend(dup.aliases.iter().cloned());
            extra_mentions += dup.mention_count;
        }
        aliases.remove(canonical_name);
        let mut aliases: Vec<String> = aliases.into_iter().collect();
        aliases.sort();

        let txn = self.graph.start_txn().await?;
        let result = merge_entities_in_txn(
            &txn,
            primary_id,
            &duplicates,
            canonical_name,
            &aliases,
            extra_mentions,
        )
        .await;

        match result {
            Ok(()) => {
                txn.commit().await?;
                Ok(true)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }
}

/// Cuerpo de la fusión, ejecutado dentro de la transacción abierta.
async fn merge_entities_in_txn(
    txn: &Txn,
    primary_id: &str,
    duplicates: &[String],
    canonical_name: &str,
    aliases: &[String],
    extra_mentions: i64,
) -> EngineResult<()> {
    // Relaciones salientes de las duplicadas.
    txn.run(
        query(
            "MATCH (d:Entity)-[r:RELATED_TO]->(o:Entity)
             WHERE d.id IN $dups AND o.id <> $primary
             MATCH (p:Entity {id: $primary})
             MERGE (p)-[nr:RELATED_TO {type: r.type}]->(o)
             ON CREATE SET nr.description = r.description,
                           nr.confidence = r.confidence, nr.weight = r.weight
             ON MATCH SET nr.weight = CASE WHEN r.weight > nr.weight
                                           THEN r.weight ELSE nr.weight END",
        )
        .param("dups", duplicates.to_vec())
        .param("primary", primary_id),
    )
    .await?;

    // Relaciones entrantes.
    txn.run(
        query(
            "MATCH (o:Entity)-[r:RELATED_TO]->(d:Entity)
             WHERE d.id IN $dups AND o.id <> $primary
             MATCH (p:Entity {id: $primary})
             MERGE (o)-[nr:RELATED_TO {type: r.type}]->(p)
             ON CREATE SET nr.description = r.description,
                           nr.confidence = r.confidence, nr.weight = r.weight
             ON MATCH SET nr.weight = CASE WHEN r.weight > nr.weight
                                           THEN r.weight ELSE nr.weight END",
        )
        .param("dups", duplicates.to_vec())
        .param("primary", primary_id),
    )
    .await?;

    // Menciones.
    txn.run(
        query(
            "MATCH (t:TextUnit)-[:MENTIONS]->(d:Entity)
             WHERE d.id IN $dups
             MATCH (p:Entity {id: $primary})
             MERGE (t)-[:MENTIONS]->(p)",
        )
        .param("dups", duplicates.to_vec())
        .param("primary", primary_id),
    )
    .await?;

    // Afirmaciones: sujeto y objeto.
    txn.run(
        query(
            "MATCH (d:Entity)-[:MAKES_CLAIM]->(c:Claim)
             WHERE d.id IN $dups
             MATCH (p:Entity {id: $primary})
             MERGE (p)-[:MAKES_CLAIM]->(c)",
        )
        .param("dups", duplicates.to_vec())
        .param("primary", primary_id),
    )
    .await?;
    txn.run(
        query(
            "MATCH (c:Claim)-[:ABOUT]->(d:Entity)
             WHERE d.id IN $dups
             MATCH (p:Entity {id: $primary})
             MERGE (c)-[:ABOUT]->(p)",
        )
        .param("dups", duplicates.to_vec())
        .param("primary", primary_id),
    )
    .await?;

    // Pertenencias a comunidad de las duplicadas desaparecen con ellas; la
    // siguiente detección incremental recoloca a la primaria.
    txn.run(
        query("MATCH (d:Entity) WHERE d.id IN $dups DETACH DELETE d")
            .param("dups", duplicates.to_vec()),
    )
    .await?;

    // Estado consolidado de la primaria.
    txn.run(
        query(
            "MATCH (p:Entity {id: $primary})
             SET p.name = $canonical, p.aliases = $aliases,
                 p.mention_count = p.mention_count + $extra",
        )
        .param("primary", primary_id)
        .param("canonical", canonical_name)
        .param("aliases", aliases.to_vec())
        .param("extra", extra_mentions),
    )
    .await?;

    Ok(())
}

/// Columnas estándar con las que se leen entidades.
const RETURN_ENTITY: &str = "e.id AS id, e.name AS name, e.type AS type, \
     e.description AS description, e.mention_count AS mention_count, \
     e.confidence AS confidence, e.aliases AS aliases, 0 AS degree";

fn req_str(row: &neo4rs::Row, key: &str) -> EngineResult<String> {
    row.get::<String>(key).ok_or_else(|| {
        warn!("Falta el campo '{key}' en un resultado de Neo4j");
        EngineError::Parse(format!("Falta el campo '{key}' en el resultado de Neo4j"))
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn entity_from_row(row: &neo4rs::Row) -> EngineResult<EntityNode> {
    Ok(EntityNode {
        id: req_str(row, "id")?,
        name: req_str(row, "name")?,
        entity_type: row.get::<String>("type").unwrap_or_default(),
        description: row.get::<String>("description").unwrap_or_default(),
        mention_count: row.get::<i64>("mention_count").unwrap_or(0),
        confidence: row.get::<f64>("confidence").unwrap_or(0.0),
        aliases: row.get::<Vec<String>>("aliases").unwrap_or_default(),
        degree: row.get::<i64>("degree").unwrap_or(0),
    })
}

fn textunit_from_row(row: &neo4rs::Row) -> EngineResult<TextUnitNode> {
    Ok(TextUnitNode {
        id: req_str(row, "id")?,
        document_id: row.get::<String>("document_id").unwrap_or_default(),
        text: row.get::<String>("text").unwrap_or_default(),
        start_char: row.get::<i64>("start_char").unwrap_or(0),
        end_char: row.get::<i64>("end_char").unwrap_or(0),
        token_count: row.get::<i64>("token_count").unwrap_or(0),
    })
}

fn community_from_row(row: &neo4rs::Row) -> EngineResult<CommunityNode> {
    Ok(CommunityNode {
        id: row.get::<i64>("id").unwrap_or(0),
        level: row.get::<i64>("level").unwrap_or(0),
        title: row.get::<String>("title").unwrap_or_default(),
        summary: row.get::<String>("summary").unwrap_or_default(),
        themes: row.get::<Vec<String>>("themes").unwrap_or_default(),
        significance: Significance::parse(&row.get::<String>("significance").unwrap_or_default()),
        rank: row.get::<f64>("rank"),
        entity_count: row.get::<i64>("entity_count").unwrap_or(0),
    })
}
