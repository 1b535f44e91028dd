//! Prompts del motor. Cada prompt fija un contrato de salida estricto
//! (registros delimitados o un único objeto JSON) que el llamante parsea
//! contra un esquema tipado; aquí sólo vive el texto.

use crate::config::ExtractionConfig;

/// Preámbulo común de extracción de grafos.
pub const EXTRACTION_SYSTEM: &str = "\
Eres un analista experto en construir grafos de conocimiento a partir de texto. \
Sigues el formato de salida pedido al pie de la letra, sin explicaciones ni texto adicional.";

/// Prompt de extracción inicial: entidades, relaciones y afirmaciones en
/// registros delimitados.
pub fn extraction_prompt(cfg: &ExtractionConfig, chunk_text: &str) -> String {
    let types = cfg.entity_types.join(", ");
    let t = &cfg.tuple_delimiter;
    let c = &cfg.completion_delimiter;
    format!(
        r#"Analiza el texto y extrae todas las entidades, relaciones y afirmaciones.

Tipos de entidad permitidos: {types}

Formato de salida, un registro por línea:
- Entidad:   entity{t}<nombre>{t}<tipo>{t}<descripción>{t}<confianza 0..1>
- Relación:  relationship{t}<origen>{t}<destino>{t}<tipo_relación>{t}<descripción>{t}<confianza 0..1>
- Afirmación: claim{t}<sujeto>{t}<objeto o NONE>{t}<tipo>{t}<estado TRUE/FALSE/SUSPECTED>{t}<descripción>{t}<fecha_inicio o NONE>{t}<fecha_fin o NONE>

Reglas:
- El tipo de relación es un identificador conciso en mayúsculas (ej: WORKS_AT, PART_OF, CEO_OF).
- Usa exactamente el delimitador {t} entre campos; no lo uses dentro de ningún campo.
- Cuando termines, escribe {c} en una línea propia.

Texto:
{chunk_text}"#
    )
}

/// Prompt de continuación del gleaning: pide lo que faltó, mismo formato.
pub fn gleaning_continue_prompt(cfg: &ExtractionConfig) -> String {
    format!(
        "En la extracción anterior faltaron entidades o relaciones. Añade ÚNICAMENTE \
los registros que falten, en el mismo formato delimitado por {t}, y termina con {c}. \
No repitas registros ya emitidos.",
        t = cfg.tuple_delimiter,
        c = cfg.completion_delimiter
    )
}

/// Pregunta binaria que cierra el bucle de gleaning.
pub const GLEANING_LOOP_PROMPT: &str = "\
¿Queda alguna entidad o relación del texto sin extraer? Responde con una única letra: \
Y si falta algo, N si la extracción está completa.";

/// Prompt para consolidar varias descripciones de la misma entidad.
pub fn summarize_descriptions_prompt(
    entity_name: &str,
    entity_type: &str,
    descriptions: &[String],
    max_length: usize,
) -> String {
    format!(
        "Estas son varias descripciones observadas de la entidad \"{entity_name}\" (tipo {entity_type}):\n\n{}\n\n\
Escribe una única descripción coherente que las integre todas, de como mucho {max_length} palabras. \
Devuelve sólo la descripción, sin comillas ni preámbulo.",
        descriptions
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

/// Prompt de arbitraje de duplicados para el resolutor de entidades.
pub fn resolution_prompt(
    name_a: &str,
    desc_a: &str,
    name_b: &str,
    desc_b: &str,
    entity_type: &str,
) -> String {
    format!(
        r#"Dos entidades de tipo {entity_type} podrían ser la misma cosa real:

Entidad A: "{name_a}": {desc_a}
Entidad B: "{name_b}": {desc_b}

¿Son la misma entidad? Responde con un único objeto JSON:
{{"are_same": bool, "confidence": número 0..1, "canonical_name": "el mejor nombre", "reasoning": "una frase"}}"#
    )
}

/// Prompt del informe estructurado de comunidad.
pub fn community_report_prompt(
    entities_block: &str,
    relationships_block: &str,
    claims_block: &str,
) -> String {
    format!(
        r#"Vas a redactar el informe de una comunidad de un grafo de conocimiento.
Usa EXCLUSIVAMENTE la información suministrada; nada de conocimiento externo.

Entidades:
{entities_block}

Relaciones:
{relationships_block}

Afirmaciones:
{claims_block}

Devuelve un único objeto JSON:
{{"title": "...", "summary": "...", "rating": número 0..10, "rating_explanation": "...",
  "themes": ["..."], "significance": "high"|"medium"|"low",
  "findings": [{{"summary": "...", "explanation": "..."}}]}}"#
    )
}

/// Prompt del paso Map de la consulta global: resumen de un lote de
/// comunidades respecto a la pregunta.
pub fn map_batch_prompt(question: &str, communities_block: &str) -> String {
    format!(
        r#"Pregunta del usuario: {question}

Informes de comunidades disponibles:
{communities_block}

Resume lo que este lote aporta a la pregunta. Si el lote no aporta nada, pon importance_score a 0.
Devuelve un único objeto JSON:
{{"batch_summary": "...", "importance_score": número 0..10,
  "key_findings": ["..."], "limitations": ["..."]}}"#
    )
}

/// Prompt del paso Reduce: síntesis final sobre los resúmenes intermedios.
pub fn reduce_prompt(question: &str, intermediate_block: &str) -> String {
    format!(
        r#"Pregunta del usuario: {question}

Resúmenes intermedios (cada uno cita los ids de comunidad que lo sustentan):
{intermediate_block}

Sintetiza la respuesta final usando sólo estos resúmenes. Cita los ids de comunidad relevantes.
Devuelve un único objeto JSON:
{{"answer": "...", "citations": [ids de comunidad, enteros], "confidence": número 0..1}}"#
    )
}

/// Prompt de respuesta local: contexto tabulado de entidades, relaciones y
/// unidades de texto.
pub fn local_answer_prompt(question: &str, context: &str) -> String {
    format!(
        r#"Responde a la pregunta usando exclusivamente el contexto siguiente. Si el contexto
no contiene la respuesta, dilo explícitamente. Cita los ids de los elementos usados.

{context}

Pregunta: {question}

Devuelve un único objeto JSON:
{{"answer": "...", "citations": ["ids de entidades o unidades de texto"], "confidence": número 0..1}}"#
    )
}

/// Prompt de siembra de ToG: elegir las entidades-tema de la pregunta.
pub fn topic_entities_prompt(question: &str, candidates_block: &str) -> String {
    format!(
        r#"Pregunta: {question}

Entidades disponibles en el grafo (nombre y tipo):
{candidates_block}

Elige las entidades (máximo 5) por las que debería empezar la exploración del grafo
para responder a la pregunta. Devuelve un único objeto JSON:
{{"entities": ["nombre exacto tal y como aparece en la lista"]}}"#
    )
}

/// Prompt de puntuación de relaciones durante la exploración de ToG.
pub fn score_relations_prompt(
    question: &str,
    reasoning_summary: &str,
    relations_block: &str,
) -> String {
    format!(
        r#"Pregunta: {question}
Razonamiento acumulado: {reasoning_summary}

Relaciones salientes candidatas:
{relations_block}

Puntúa cada relación según su utilidad para avanzar hacia la respuesta.
Devuelve un único objeto JSON:
{{"scores": [{{"name": "tipo de relación", "score": número 0..1}}]}}"#
    )
}

/// Prompt de puntuación de entidades candidatas durante ToG.
pub fn score_entities_prompt(
    question: &str,
    reasoning_summary: &str,
    relation: &str,
    entities_block: &str,
) -> String {
    format!(
        r#"Pregunta: {question}
Razonamiento acumulado: {reasoning_summary}
Relación que se está siguiendo: {relation}

Entidades candidatas (nombre y descripción):
{entities_block}

Puntúa cada entidad según su utilidad para responder a la pregunta.
Devuelve un único objeto JSON:
{{"scores": [{{"name": "nombre exacto", "score": número 0..1}}]}}"#
    )
}

/// Prompt del chequeo de suficiencia de ToG.
pub fn sufficiency_prompt(question: &str, triplets_block: &str) -> String {
    format!(
        r#"Pregunta: {question}

Hechos recuperados del grafo hasta ahora:
{triplets_block}

¿Bastan estos hechos para responder con solvencia? Devuelve un único objeto JSON:
{{"sufficient": bool, "confidence": número 0..1, "reasoning": "una frase",
  "missing_information": "qué falta, o cadena vacía"}}"#
    )
}

/// Prompt de síntesis final de ToG, anclada en las tripletas recuperadas.
pub fn tog_answer_prompt(question: &str, triplets_block: &str, sources_block: &str) -> String {
    format!(
        r#"Responde a la pregunta razonando SOLO sobre los hechos y extractos siguientes.

Hechos del grafo:
{triplets_block}

Extractos de texto fuente:
{sources_block}

Pregunta: {question}

Devuelve un único objeto JSON:
{{"answer": "...", "reasoning_chain": ["paso 1", "paso 2"], "confidence": número 0..1,
  "grounding": ["hechos citados, formato sujeto->relación->objeto"], "limitations": ["..."]}}"#
    )
}

/// Prompt de respuesta directa cuando la exploración no recuperó tripletas.
pub fn direct_answer_prompt(question: &str) -> String {
    format!(
        "La exploración del grafo no recuperó hechos para esta pregunta. Responde lo mejor \
que puedas con conocimiento general, dejando claro que la respuesta no está anclada en \
los documentos indexados.\n\nPregunta: {question}\n\n\
Devuelve un único objeto JSON: {{\"answer\": \"...\", \"confidence\": número 0..1}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_prompt_de_extraccion_incluye_delimitadores_y_tipos() {
        let cfg = ExtractionConfig::default();
        let prompt = extraction_prompt(&cfg, "Alice trabaja en Acme.");
        assert!(prompt.contains("|||"));
        assert!(prompt.contains("<COMPLETE>"));
        assert!(prompt.contains("PERSON"));
        assert!(prompt.contains("Alice trabaja en Acme."));
    }

    #[test]
    fn el_prompt_de_informe_exige_json() {
        let prompt = community_report_prompt("e", "r", "c");
        assert!(prompt.contains("\"significance\""));
        assert!(prompt.contains("findings"));
    }
}
