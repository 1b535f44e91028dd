//! Taxonomía de errores del motor GraphRAG.
//!
//! Cada variante distingue cómo debe reaccionar el llamante: los errores de
//! configuración se propagan de inmediato, los transitorios se reintentan en
//! la pasarela LLM, los de parseo se descartan con un aviso y el resto se
//! devuelve tal cual al adaptador externo.

use thiserror::Error;

/// Resultado estándar del motor.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error principal del motor.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuración inválida o incompleta (API key ausente, parámetro fuera
    /// de rango). No se reintenta nunca.
    #[error("error de configuración: {0}")]
    Configuration(String),

    /// Un servicio externo (LLM o Neo4j) siguió fallando tras agotar los
    /// reintentos con backoff.
    #[error("servicio externo no disponible: {0}")]
    ExternalUnavailable(String),

    /// Respuesta del LLM que no respeta el formato pedido (JSON o registro
    /// delimitado). El registro ofensivo se descarta; el procesamiento sigue.
    #[error("respuesta no parseable: {0}")]
    Parse(String),

    /// Recurso inexistente (documento desconocido, grafo sin entidades).
    #[error("no encontrado: {0}")]
    NotFound(String),

    /// Escritura que violaría una invariante del grafo (p. ej. entidad con
    /// nombre vacío). La escritura se rechaza y la operación envolvente
    /// continúa donde sea seguro.
    #[error("invariante violada: {0}")]
    InvariantViolation(String),

    /// La consulta superó su plazo máximo; los resultados parciales se
    /// descartan.
    #[error("plazo de consulta agotado tras {0} s")]
    DeadlineExceeded(u64),

    /// Error devuelto por el driver de Neo4j.
    #[error("error de Neo4j: {0}")]
    Graph(#[from] neo4rs::Error),

    /// Error de E/S al leer documentos del disco.
    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Construye un `Parse` a partir de cualquier error de serde.
    pub fn parse(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Parse(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_incluye_contexto() {
        let err = EngineError::NotFound("documento doc-1".into());
        assert_eq!(err.to_string(), "no encontrado: documento doc-1");
    }

    #[test]
    fn parse_conserva_el_contexto() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = EngineError::parse("informe de comunidad", serde_err);
        assert!(err.to_string().contains("informe de comunidad"));
    }
}
