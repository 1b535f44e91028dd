//! Ensamblado de contexto acotado por tokens para las consultas.
//!
//! El contexto local se construye por bloques (entidades, relaciones,
//! unidades de texto) formateados como tablas delimitadas con cabecera. Las
//! relaciones dentro de la red (ambos extremos seleccionados) entran antes
//! que las externas; el presupuesto se mide con el mismo contador de tokens
//! del troceador y nunca se rebasa.

use std::collections::{HashMap, HashSet};

use crate::chunker::TokenCounter;
use crate::config::RetrievalConfig;
use crate::error::EngineResult;
use crate::graph_store::{GraphStore, WeightedCommunity};
use crate::models::{CommunityNode, EntityNode, RelationshipRecord, TextUnitNode};

/// Rank por defecto de una comunidad sin informe puntuado.
const DEFAULT_COMMUNITY_RANK: f64 = 0.5;

/// Contexto ya ensamblado, con su coste y los ids que cita.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub text: String,
    pub token_count: usize,
    pub entity_ids: Vec<String>,
    pub citations: Vec<String>,
}

/// Relación anotada con los ids de sus extremos.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub source_id: String,
    pub target_id: String,
    pub record: RelationshipRecord,
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    store: GraphStore,
    counter: TokenCounter,
    cfg: RetrievalConfig,
}

impl ContextAssembler {
    pub fn new(store: GraphStore, counter: TokenCounter, cfg: RetrievalConfig) -> Self {
        Self {
            store,
            counter,
            cfg,
        }
    }

    /// Contexto local a partir de un conjunto semilla de entidades.
    pub async fn assemble_local(
        &self,
        seed_entities: Vec<EntityNode>,
    ) -> EngineResult<AssembledContext> {
        let selected = select_entities(seed_entities, self.cfg.top_k_entities);
        let selected_ids: Vec<String> = selected.iter().map(|e| e.id.clone()).collect();

        let touching = self.store.relationships_touching(&selected_ids).await?;
        let edges: Vec<EdgeRow> = touching
            .into_iter()
            .map(|(source_id, target_id, record)| EdgeRow {
                source_id,
                target_id,
                record,
            })
            .collect();
        let ordered_edges = order_relationships(
            &edges,
            &selected_ids,
            self.cfg.top_k_relationships * selected_ids.len().max(1),
        );

        let textunits = self
            .store
            .textunits_mentioning(&selected_ids, (self.cfg.top_k_entities * 2) as i64)
            .await?;

        Ok(build_context(
            &selected,
            &ordered_edges,
            &textunits,
            self.cfg.max_context_tokens,
            &self.counter,
        ))
    }

    /// Contexto de comunidades: resúmenes de las comunidades (del nivel
    /// pedido) a las que pertenecen las semillas, bajo el presupuesto dado.
    pub async fn assemble_community(
        &self,
        seed_ids: &[String],
        level: i64,
        max_tokens: usize,
    ) -> EngineResult<AssembledContext> {
        let communities = self.store.communities_for_entities(seed_ids, level).await?;
        Ok(build_community_context(
            &communities,
            max_tokens,
            &self.counter,
        ))
    }

    /// Lista global de comunidades de un nivel, filtrada por rank mínimo y
    /// ordenada por (peso, rank) descendente. Sin `min_rank` explícito se
    /// aplica el umbral configurado.
    pub async fn ranked_global_communities(
        &self,
        level: i64,
        min_rank: Option<f64>,
    ) -> EngineResult<Vec<WeightedCommunity>> {
        let communities = self.store.communities_at_level(level).await?;
        Ok(rank_communities(
            communities,
            min_rank.unwrap_or(self.cfg.min_rank_threshold),
        ))
    }
}

/// Selección de entidades: grado de relación primero, menciones después.
pub fn select_entities(mut candidates: Vec<EntityNode>, top_k: usize) -> Vec<EntityNode> {
    candidates.sort_by(|a, b| {
        (b.degree, b.mention_count, &a.id).cmp(&(a.degree, a.mention_count, &b.id))
    });
    candidates.truncate(top_k);
    candidates
}

/// Ordena las relaciones para el contexto: primero las internas a la red
/// (por peso), después las externas por conexiones mutuas y peso. El total
/// queda acotado por `max_edges`.
pub fn order_relationships(
    edges: &[EdgeRow],
    selected_ids: &[String],
    max_edges: usize,
) -> Vec<EdgeRow> {
    let selected: HashSet<&str> = selected_ids.iter().map(String::as_str).collect();

    let mut in_network: Vec<&EdgeRow> = Vec::new();
    let mut out_network: Vec<&EdgeRow> = Vec::new();
    for edge in edges {
        let s_in = selected.contains(edge.source_id.as_str());
        let t_in = selected.contains(edge.target_id.as_str());
        if s_in && t_in {
            in_network.push(edge);
        } else if s_in || t_in {
            out_network.push(edge);
        }
    }

    // Conexiones mutuas de cada nodo externo: cuántas entidades
    // seleccionadas lo tocan.
    let mut mutual: HashMap<&str, usize> = HashMap::new();
    for edge in &out_network {
        let outside = if selected.contains(edge.source_id.as_str()) {
            edge.target_id.as_str()
        } else {
            edge.source_id.as_str()
        };
        *mutual.entry(outside).or_insert(0) += 1;
    }

    in_network.sort_by(|a, b| {
        b.record
            .weight
            .partial_cmp(&a.record.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out_network.sort_by(|a, b| {
        let mutual_a = mutual
            .get(outside_id(a, &selected))
            .copied()
            .unwrap_or(0);
        let mutual_b = mutual
            .get(outside_id(b, &selected))
            .copied()
            .unwrap_or(0);
        mutual_b.cmp(&mutual_a).then(
            b.record
                .weight
                .partial_cmp(&a.record.weight)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    in_network
        .into_iter()
        .chain(out_network)
        .take(max_edges)
        .cloned()
        .collect()
}

fn outside_id<'a>(edge: &'a EdgeRow, selected: &HashSet<&str>) -> &'a str {
    if selected.contains(edge.source_id.as_str()) {
        edge.target_id.as_str()
    } else {
        edge.source_id.as_str()
    }
}

/// Ensambla los tres bloques bajo el presupuesto de tokens. Si una unidad
/// de texto no cabe entera, se recorta para apurar el presupuesto y se
/// cierra el contexto.
pub fn build_context(
    entities: &[EntityNode],
    edges: &[EdgeRow],
    textunits: &[TextUnitNode],
    max_tokens: usize,
    counter: &TokenCounter,
) -> AssembledContext {
    let mut text = String::new();
    let mut tokens = 0usize;
    let mut entity_ids = Vec::new();
    let mut citations = Vec::new();

    let mut push_line = |line: &str, text: &mut String, tokens: &mut usize| -> bool {
        let cost = counter.count(line) + 1;
        if *tokens + cost > max_tokens {
            return false;
        }
        text.push_str(line);
        text.push('\n');
        *tokens += cost;
        true
    };

    if !entities.is_empty() {
        push_line("-----Entidades-----", &mut text, &mut tokens);
        push_line("id|nombre|tipo|descripción|rank", &mut text, &mut tokens);
        for entity in entities {
            let line = format!(
                "{}|{}|{}|{}|{}",
                entity.id, entity.name, entity.entity_type, entity.description, entity.degree
            );
            if !push_line(&line, &mut text, &mut tokens) {
                break;
            }
            entity_ids.push(entity.id.clone());
            citations.push(entity.id.clone());
        }
    }

    if !edges.is_empty() && tokens < max_tokens {
        push_line("-----Relaciones-----", &mut text, &mut tokens);
        push_line(
            "origen|destino|tipo|descripción|peso",
            &mut text,
            &mut tokens,
        );
        for edge in edges {
            let line = format!(
                "{}|{}|{}|{}|{:.2}",
                edge.record.source_name,
                edge.record.target_name,
                edge.record.rel_type,
                edge.record.description,
                edge.record.weight
            );
            if !push_line(&line, &mut text, &mut tokens) {
                break;
            }
        }
    }

    if !textunits.is_empty() && tokens < max_tokens {
        push_line("-----Unidades de texto-----", &mut text, &mut tokens);
        push_line("id|texto", &mut text, &mut tokens);
        for unit in textunits {
            let line = format!("{}|{}", unit.id, unit.text.replace('\n', " "));
            if push_line(&line, &mut text, &mut tokens) {
                citations.push(unit.id.clone());
                continue;
            }
            // Última unidad recortada al presupuesto restante.
            let remaining = max_tokens.saturating_sub(tokens + 1);
            if remaining > 8 {
                let truncated = counter.truncate(&line, remaining);
                text.push_str(&truncated);
                text.push('\n');
                tokens += counter.count(&truncated) + 1;
                citations.push(unit.id.clone());
            }
            break;
        }
    }

    AssembledContext {
        text,
        token_count: tokens,
        entity_ids,
        citations,
    }
}

/// Contexto de resúmenes de comunidad bajo presupuesto.
pub fn build_community_context(
    communities: &[CommunityNode],
    max_tokens: usize,
    counter: &TokenCounter,
) -> AssembledContext {
    let mut text = String::new();
    let mut tokens = 0usize;
    let mut citations = Vec::new();

    for community in communities {
        if community.summary.is_empty() {
            continue;
        }
        let block = format!(
            "-----Comunidad {} (nivel {})-----\n{}\n{}\n",
            community.id,
            community.level,
            community.title,
            community.summary
        );
        let cost = counter.count(&block);
        if tokens + cost > max_tokens {
            break;
        }
        text.push_str(&block);
        tokens += cost;
        citations.push(community.id.to_string());
    }

    AssembledContext {
        text,
        token_count: tokens,
        entity_ids: Vec::new(),
        citations,
    }
}

/// Filtra por rank mínimo y ordena por (peso, rank) descendente.
pub fn rank_communities(
    communities: Vec<WeightedCommunity>,
    min_rank: f64,
) -> Vec<WeightedCommunity> {
    let mut ranked: Vec<WeightedCommunity> = communities
        .into_iter()
        .filter(|wc| wc.community.rank.unwrap_or(DEFAULT_COMMUNITY_RANK) >= min_rank)
        .collect();
    ranked.sort_by(|a, b| {
        b.weight.cmp(&a.weight).then(
            b.community
                .rank
                .unwrap_or(DEFAULT_COMMUNITY_RANK)
                .partial_cmp(&a.community.rank.unwrap_or(DEFAULT_COMMUNITY_RANK))
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Significance;

    fn counter() -> TokenCounter {
        TokenCounter::new().unwrap()
    }

    fn entity(id: &str, degree: i64, mentions: i64) -> EntityNode {
        EntityNode {
            id: id.to_string(),
            name: format!("Entidad {id}"),
            entity_type: "CONCEPT".to_string(),
            description: "Una descripción de prueba con contenido".to_string(),
            mention_count: mentions,
            confidence: 0.9,
            aliases: Vec::new(),
            degree,
        }
    }

    fn edge(source: &str, target: &str, weight: f64) -> EdgeRow {
        EdgeRow {
            source_id: source.to_string(),
            target_id: target.to_string(),
            record: RelationshipRecord {
                source_name: source.to_string(),
                target_name: target.to_string(),
                rel_type: "RELATED".to_string(),
                description: String::new(),
                confidence: weight,
                weight,
            },
        }
    }

    fn unit(id: &str, text: &str) -> TextUnitNode {
        TextUnitNode {
            id: id.to_string(),
            document_id: "doc".to_string(),
            text: text.to_string(),
            start_char: 0,
            end_char: text.len() as i64,
            token_count: 0,
        }
    }

    #[test]
    fn select_entities_prioriza_grado_y_menciones() {
        let selected = select_entities(
            vec![entity("a", 1, 10), entity("b", 5, 1), entity("c", 5, 9)],
            2,
        );
        assert_eq!(selected[0].id, "c");
        assert_eq!(selected[1].id, "b");
    }

    #[test]
    fn las_relaciones_internas_entran_antes_que_las_externas() {
        let selected = vec!["a".to_string(), "b".to_string()];
        let edges = vec![
            edge("a", "externa", 0.99),
            edge("a", "b", 0.10),
            edge("b", "externa", 0.50),
        ];
        let ordered = order_relationships(&edges, &selected, 10);
        assert_eq!(ordered[0].source_id, "a");
        assert_eq!(ordered[0].target_id, "b");
    }

    #[test]
    fn las_externas_se_ordenan_por_conexiones_mutuas() {
        let selected = vec!["a".to_string(), "b".to_string()];
        let edges = vec![
            edge("a", "x", 0.9), // x: 1 conexión mutua
            edge("a", "y", 0.1), // y: 2 conexiones mutuas
            edge("b", "y", 0.2),
        ];
        let ordered = order_relationships(&edges, &selected, 10);
        let first_outside = outside_id(
            &ordered[0],
            &selected.iter().map(String::as_str).collect(),
        )
        .to_string();
        assert_eq!(first_outside, "y");
    }

    #[test]
    fn el_numero_de_aristas_queda_acotado() {
        let selected = vec!["a".to_string()];
        let edges: Vec<EdgeRow> = (0..50)
            .map(|i| edge("a", &format!("n{i}"), 0.5))
            .collect();
        let ordered = order_relationships(&edges, &selected, 7);
        assert_eq!(ordered.len(), 7);
    }

    #[test]
    fn el_contexto_nunca_rebasa_el_presupuesto() {
        let c = counter();
        let entities: Vec<EntityNode> = (0..30).map(|i| entity(&format!("e{i}"), 1, 1)).collect();
        let units: Vec<TextUnitNode> = (0..20)
            .map(|i| unit(&format!("t{i}"), &"texto repetido bastante largo ".repeat(30)))
            .collect();
        for budget in [50usize, 200, 1000] {
            let ctx = build_context(&entities, &[], &units, budget, &c);
            assert!(
                ctx.token_count <= budget,
                "presupuesto {budget} rebasado: {}",
                ctx.token_count
            );
            assert!(c.count(&ctx.text) <= budget + 4);
        }
    }

    #[test]
    fn la_ultima_unidad_se_recorta_para_apurar_presupuesto() {
        let c = counter();
        let units = vec![unit("t0", &"contenido útil ".repeat(200))];
        let ctx = build_context(&[], &[], &units, 60, &c);
        assert!(ctx.token_count <= 60);
        assert!(ctx.citations.contains(&"t0".to_string()));
    }

    #[test]
    fn rank_communities_filtra_y_ordena() {
        let wc = |id: i64, weight: i64, rank: Option<f64>| WeightedCommunity {
            community: CommunityNode {
                id,
                level: 0,
                title: String::new(),
                summary: "resumen".to_string(),
                themes: Vec::new(),
                significance: Significance::Medium,
                rank,
                entity_count: 1,
            },
            weight,
        };
        let ranked = rank_communities(
            vec![wc(1, 5, Some(0.9)), wc(2, 9, None), wc(3, 9, Some(0.1))],
            0.3,
        );
        // La 3 cae por rank; la 2 (peso 9, rank 0.5 por defecto) gana.
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].community.id, 2);
        assert_eq!(ranked[1].community.id, 1);
    }
}
