//! Modelos de dominio: nodos y aristas del grafo Neo4j y formas de
//! respuesta de las consultas. Los nodos se modelan como registros planos
//! identificados por id; las aristas son valores de primera clase y toda
//! travesía pasa por el almacén, nunca por punteros en memoria.

use serde::{Deserialize, Serialize};

/// Estado del ciclo de vida de un documento ingerido.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Representa un nodo (:Document) en Neo4j.
#[derive(Debug, Clone)]
pub struct DocumentNode {
    pub id: String,
    pub name: String,
    pub file_path: String,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Representa un nodo (:TextUnit): un trozo de documento con sus offsets.
#[derive(Debug, Clone)]
pub struct TextUnitNode {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub start_char: i64,
    pub end_char: i64,
    pub token_count: i64,
}

/// Representa un nodo (:Entity): una cosa nombrada con tipo.
/// La pareja (name, type) es única en todo el grafo.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub mention_count: i64,
    pub confidence: f64,
    pub aliases: Vec<String>,
    /// Grado de relación en el grafo; sólo se rellena en lecturas de
    /// recuperación, vale 0 en el resto de contextos.
    pub degree: i64,
}

/// Estado de verificación de una afirmación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClaimStatus {
    True,
    False,
    Suspected,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::Suspected => "SUSPECTED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRUE" => Self::True,
            "FALSE" => Self::False,
            _ => Self::Suspected,
        }
    }
}

/// Representa un nodo (:Claim): una afirmación factual sujeta a una o dos
/// entidades, con vigencia temporal opcional.
#[derive(Debug, Clone)]
pub struct ClaimNode {
    /// Hash estable de (subject, object, type, description).
    pub id: String,
    pub subject_name: String,
    pub object_name: Option<String>,
    pub claim_type: String,
    pub status: ClaimStatus,
    pub description: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub source_text: String,
    pub occurrence_count: i64,
}

/// Arista Entity → Entity con tipo libre procedente de la extracción.
#[derive(Debug, Clone)]
pub struct RelationshipRecord {
    pub source_name: String,
    pub target_name: String,
    pub rel_type: String,
    pub description: String,
    pub confidence: f64,
    pub weight: f64,
}

/// Importancia asignada a una comunidad por su informe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    High,
    Medium,
    Low,
}

impl Significance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Representa un nodo (:Community) en un nivel de la jerarquía de Leiden.
#[derive(Debug, Clone)]
pub struct CommunityNode {
    pub id: i64,
    pub level: i64,
    pub title: String,
    pub summary: String,
    pub themes: Vec<String>,
    pub significance: Significance,
    pub rank: Option<f64>,
    /// Número de entidades miembro; se rellena en lecturas.
    pub entity_count: i64,
}

/// Registro de auditoría de consultas: nodo (:Query) con procedencia.
#[derive(Debug, Clone)]
pub struct QueryNode {
    pub id: String,
    pub question: String,
    pub mode: QueryMode,
    pub created_at: String,
    pub confidence: f64,
}

/// Modo de consulta, fijado en la frontera; las capas inferiores nunca
/// reciben cadenas libres de modo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Local,
    Global,
    ToG,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
            Self::ToG => "tog",
        }
    }
}

/// Respuesta de una consulta local.
#[derive(Debug, Clone, Serialize)]
pub struct LocalAnswer {
    pub answer: String,
    pub citations: Vec<String>,
    pub confidence: f64,
    pub context_token_count: usize,
}

/// Respuesta de una consulta global (Map-Reduce sobre comunidades).
#[derive(Debug, Clone, Serialize)]
pub struct GlobalAnswer {
    pub answer: String,
    pub citations: Vec<i64>,
    pub confidence: f64,
    pub num_communities: usize,
    pub batches_used: usize,
}

/// Un paso del camino de razonamiento de ToG.
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningStep {
    pub depth: usize,
    pub entities: Vec<String>,
    pub relations_explored: Vec<String>,
    pub selected_relations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sufficiency_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sufficient: Option<bool>,
}

/// Tripleta recuperada durante la exploración de ToG.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedTriplet {
    pub subject: String,
    pub relation: String,
    pub object: String,
    pub confidence: f64,
    /// Hasta tres extractos de texto fuente que mencionan al objeto.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_texts: Vec<String>,
}

/// Respuesta de una consulta Tree-of-Graphs.
#[derive(Debug, Clone, Serialize)]
pub struct ToGAnswer {
    pub answer: String,
    pub reasoning_path: Vec<ReasoningStep>,
    pub retrieved_triplets: Vec<RetrievedTriplet>,
    pub confidence: f64,
    pub processing_time_ms: u64,
}

/// Recuento global de nodos del grafo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub documents: i64,
    pub textunits: i64,
    pub entities: i64,
    pub relationships: i64,
    pub claims: i64,
    pub communities: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estados_de_documento_ida_y_vuelta() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Ready,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn estado_de_claim_desconocido_cae_en_suspected() {
        assert_eq!(ClaimStatus::parse("maybe"), ClaimStatus::Suspected);
        assert_eq!(ClaimStatus::parse("true"), ClaimStatus::True);
    }

    #[test]
    fn significancia_desconocida_cae_en_medium() {
        assert_eq!(Significance::parse("crítica"), Significance::Medium);
    }
}
