//! Detección jerárquica de comunidades sobre la proyección de entidades.
//!
//! La proyección (entidades unidas por RELATED_TO, no dirigida y ponderada)
//! se trae a memoria y se agrupa con un Leiden de movimiento local: barridos
//! de optimización de modularidad con orden barajado por una semilla fija,
//! refinamiento que parte comunidades internamente desconectadas y
//! agregación del grafo para producir los niveles superiores. Con la misma
//! semilla y el mismo grafo, el resultado es idéntico módulo renombrado
//! estable de ids.

use std::collections::HashMap;

use petgraph::graph::UnGraph;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::config::CommunityConfig;
use crate::error::EngineResult;
use crate::graph_store::GraphStore;

/// Resultado de una pasada de detección.
#[derive(Debug, Clone, Default)]
pub struct DetectionSummary {
    pub entities: usize,
    pub levels: usize,
    pub communities: usize,
}

/// Jerarquía detectada: asignación entidad → comunidad por nivel, y la
/// arista PART_OF de cada comunidad hacia su padre.
#[derive(Debug, Clone, Default)]
pub struct CommunityHierarchy {
    /// `levels[l]` asigna cada id de entidad a su comunidad del nivel `l`
    /// (0 = hoja).
    pub levels: Vec<HashMap<String, i64>>,
    /// (id_hija, nivel_hija) → id_padre (en nivel_hija + 1).
    pub parents: HashMap<(i64, i64), i64>,
}

impl CommunityHierarchy {
    pub fn community_count(&self) -> usize {
        let mut ids: Vec<i64> = Vec::new();
        for level in &self.levels {
            ids.extend(level.values().copied());
        }
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Grafo no dirigido agregable usado por el algoritmo.
#[derive(Debug, Clone)]
struct Projection {
    neighbors: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
}

impl Projection {
    fn node_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Grado ponderado, con el lazo contado dos veces.
    fn degree(&self, i: usize) -> f64 {
        self.neighbors[i].iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self.self_loops[i]
    }

    /// Peso total del grafo (cada arista contada una vez).
    fn total_weight(&self) -> f64 {
        let half: f64 = self
            .neighbors
            .iter()
            .flat_map(|adj| adj.iter().map(|(_, w)| w))
            .sum();
        half / 2.0 + self.self_loops.iter().sum::<f64>()
    }
}

/// Detecta la jerarquía completa sobre los nodos y aristas dados. Los ids
/// de comunidad se numeran a partir de `id_offset`, en orden estable.
pub fn detect_hierarchy(
    node_ids: &[String],
    edges: &[(String, String, f64)],
    cfg: &CommunityConfig,
    id_offset: i64,
) -> CommunityHierarchy {
    let mut hierarchy = CommunityHierarchy::default();
    if node_ids.is_empty() {
        return hierarchy;
    }

    // Orden estable de nodos: la numeración de comunidades no depende del
    // orden de llegada de las filas.
    let mut sorted_ids: Vec<String> = node_ids.to_vec();
    sorted_ids.sort();
    sorted_ids.dedup();
    let index: HashMap<&str, usize> = sorted_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut graph: UnGraph<usize, f64> = UnGraph::new_undirected();
    let nodes: Vec<_> = (0..sorted_ids.len()).map(|i| graph.add_node(i)).collect();
    let mut merged: HashMap<(usize, usize), f64> = HashMap::new();
    for (a, b, w) in edges {
        let (Some(&i), Some(&j)) = (index.get(a.as_str()), index.get(b.as_str())) else {
            continue;
        };
        if i == j {
            continue;
        }
        let key = (i.min(j), i.max(j));
        *merged.entry(key).or_insert(0.0) += w.max(0.01);
    }
    for (&(i, j), &w) in &merged {
        graph.add_edge(nodes[i], nodes[j], w);
    }

    let mut projection = Projection {
        neighbors: (0..sorted_ids.len()).map(|_| Vec::new()).collect(),
        self_loops: vec![0.0; sorted_ids.len()],
    };
    for edge in graph.edge_indices() {
        if let (Some((a, b)), Some(&w)) = (graph.edge_endpoints(edge), graph.edge_weight(edge)) {
            projection.neighbors[a.index()].push((b.index(), w));
            projection.neighbors[b.index()].push((a.index(), w));
        }
    }

    let mut rng = StdRng::seed_from_u64(cfg.random_seed);
    // current[i] = nodo agregado que representa a la entidad i en el nivel
    // en curso.
    let mut current: Vec<usize> = (0..sorted_ids.len()).collect();
    let mut next_id = id_offset;
    let mut previous_level_ids: Vec<i64> = Vec::new();

    for level in 0..cfg.max_levels {
        let communities = cluster_once(&projection, cfg.tolerance, &mut rng);
        let community_count = renumbered_count(&communities);

        // Asignación de ids globales estables: comunidades ordenadas por su
        // primera entidad (en el orden estable de sorted_ids).
        let mut first_member: HashMap<usize, usize> = HashMap::new();
        for (entity_idx, &agg_node) in current.iter().enumerate() {
            let comm = communities[agg_node];
            first_member.entry(comm).or_insert(entity_idx);
        }
        let mut ordered: Vec<(usize, usize)> =
            first_member.iter().map(|(&c, &f)| (f, c)).collect();
        ordered.sort_unstable();
        let mut global_ids: HashMap<usize, i64> = HashMap::new();
        for (_, comm) in ordered {
            global_ids.insert(comm, next_id);
            next_id += 1;
        }

        let mut assignment: HashMap<String, i64> = HashMap::new();
        for (entity_idx, id) in sorted_ids.iter().enumerate() {
            let comm = communities[current[entity_idx]];
            if let Some(&gid) = global_ids.get(&comm) {
                assignment.insert(id.clone(), gid);
            }
        }

        // PART_OF del nivel anterior hacia éste.
        if level > 0 {
            for entity_idx in 0..sorted_ids.len() {
                let child = previous_level_ids[entity_idx];
                let comm = communities[current[entity_idx]];
                if let Some(&parent) = global_ids.get(&comm) {
                    hierarchy
                        .parents
                        .insert((child, level as i64 - 1), parent);
                }
            }
        }

        previous_level_ids = sorted_ids
            .iter()
            .enumerate()
            .map(|(entity_idx, _)| {
                let comm = communities[current[entity_idx]];
                global_ids.get(&comm).copied().unwrap_or(0)
            })
            .collect();

        hierarchy.levels.push(assignment);

        // Sin fusiones nuevas no hay más niveles que producir.
        if community_count == projection.node_count() || community_count <= 1 {
            break;
        }
        if !cfg.include_intermediate {
            break;
        }

        let aggregated = aggregate(&projection, &communities);
        for slot in current.iter_mut() {
            *slot = communities[*slot];
        }
        projection = aggregated;
    }

    hierarchy
}

/// Un nivel de agrupamiento: movimiento local de modularidad seguido del
/// refinamiento que separa comunidades internamente desconectadas.
fn cluster_once(projection: &Projection, tolerance: f64, rng: &mut StdRng) -> Vec<usize> {
    let n = projection.node_count();
    let m = projection.total_weight();
    let mut communities: Vec<usize> = (0..n).collect();
    if n == 0 || m <= 0.0 {
        return communities;
    }

    let degrees: Vec<f64> = (0..n).map(|i| projection.degree(i)).collect();
    let mut community_total: Vec<f64> = degrees.clone();

    let mut order: Vec<usize> = (0..n).collect();
    const MAX_SWEEPS: usize = 20;
    for _ in 0..MAX_SWEEPS {
        order.shuffle(rng);
        let mut moved = false;

        for &i in &order {
            let old = communities[i];
            community_total[old] -= degrees[i];

            // Peso hacia cada comunidad vecina.
            let mut weights_to: HashMap<usize, f64> = HashMap::new();
            for &(j, w) in &projection.neighbors[i] {
                *weights_to.entry(communities[j]).or_insert(0.0) += w;
            }

            let base_gain = weights_to.get(&old).copied().unwrap_or(0.0)
                - community_total[old] * degrees[i] / (2.0 * m);
            let mut best = (old, base_gain);
            let mut candidates: Vec<(&usize, &f64)> = weights_to.iter().collect();
            candidates.sort_by_key(|(c, _)| **c);
            for (&comm, &w) in candidates {
                if comm == old {
                    continue;
                }
                let gain = w - community_total[comm] * degrees[i] / (2.0 * m);
                if gain > best.1 + tolerance {
                    best = (comm, gain);
                }
            }

            if best.0 != old {
                moved = true;
            }
            communities[i] = best.0;
            community_total[best.0] += degrees[i];
        }

        if !moved {
            break;
        }
    }

    let refined = split_disconnected(projection, &communities);
    renumber(&refined)
}

/// Refinamiento: cada comunidad debe ser conexa dentro de la proyección;
/// las componentes sueltas se separan en comunidades propias.
fn split_disconnected(projection: &Projection, communities: &[usize]) -> Vec<usize> {
    let n = projection.node_count();
    let mut result = vec![usize::MAX; n];
    let mut next = 0usize;

    for start in 0..n {
        if result[start] != usize::MAX {
            continue;
        }
        // BFS restringido a la comunidad de `start`.
        let comm = communities[start];
        let mut queue = vec![start];
        result[start] = next;
        while let Some(node) = queue.pop() {
            for &(j, _) in &projection.neighbors[node] {
                if communities[j] == comm && result[j] == usize::MAX {
                    result[j] = next;
                    queue.push(j);
                }
            }
        }
        next += 1;
    }
    result
}

fn renumber(communities: &[usize]) -> Vec<usize> {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let mut next = 0usize;
    communities
        .iter()
        .map(|&c| {
            *mapping.entry(c).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            })
        })
        .collect()
}

fn renumbered_count(communities: &[usize]) -> usize {
    let mut distinct: Vec<usize> = communities.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    distinct.len()
}

/// Agrega el grafo: cada comunidad pasa a ser un nodo; los pesos entre
/// comunidades se suman y el peso interno queda como lazo.
fn aggregate(projection: &Projection, communities: &[usize]) -> Projection {
    let k = renumbered_count(communities);

    let mut merged: HashMap<(usize, usize), f64> = HashMap::new();
    let mut self_loops = vec![0.0; k];
    for (i, adj) in projection.neighbors.iter().enumerate() {
        self_loops[communities[i]] += projection.self_loops[i];
        for &(j, w) in adj {
            if i < j {
                let (a, b) = (communities[i], communities[j]);
                if a == b {
                    self_loops[a] += w;
                } else {
                    let key = (a.min(b), a.max(b));
                    *merged.entry(key).or_insert(0.0) += w;
                }
            }
        }
    }

    let mut neighbors: Vec<Vec<(usize, f64)>> = (0..k).map(|_| Vec::new()).collect();
    for (&(a, b), &w) in &merged {
        neighbors[a].push((b, w));
        neighbors[b].push((a, w));
    }

    Projection {
        neighbors,
        self_loops,
    }
}

/// Constructor de comunidades: proyecta desde el almacén, agrupa y
/// persiste las pertenencias y la jerarquía.
#[derive(Debug, Clone)]
pub struct CommunityBuilder {
    store: GraphStore,
    cfg: CommunityConfig,
}

impl CommunityBuilder {
    pub fn new(store: GraphStore, cfg: CommunityConfig) -> Self {
        Self { store, cfg }
    }

    /// Detección completa: borra todas las pertenencias y recalcula desde
    /// cero con ids a partir de 0.
    pub async fn detect_full(&self) -> EngineResult<DetectionSummary> {
        let (nodes, edges) = self.store.entity_projection(None).await?;
        if nodes.is_empty() {
            return Ok(DetectionSummary::default());
        }
        self.store.clear_community_memberships(&nodes).await?;
        let hierarchy = detect_hierarchy(&nodes, &edges, &self.cfg, 0);
        self.persist(&hierarchy).await?;
        let orphans = self.store.delete_orphan_communities().await?;
        info!(
            entidades = nodes.len(),
            niveles = hierarchy.levels.len(),
            huerfanas = orphans,
            "Detección completa de comunidades terminada"
        );
        Ok(DetectionSummary {
            entities: nodes.len(),
            levels: hierarchy.levels.len(),
            communities: hierarchy.community_count(),
        })
    }

    /// Detección incremental sobre el conjunto afectado: se expande un
    /// salto, se re-agrupa sólo ese subgrafo con ids nuevos y se limpian
    /// las comunidades que quedaron vacías.
    pub async fn detect_incremental(
        &self,
        affected_entity_ids: &[String],
    ) -> EngineResult<DetectionSummary> {
        if affected_entity_ids.is_empty() {
            return Ok(DetectionSummary::default());
        }

        let mut scope: Vec<String> = affected_entity_ids.to_vec();
        scope.extend(self.store.one_hop_neighbors(affected_entity_ids).await?);
        scope.sort();
        scope.dedup();

        self.store.clear_community_memberships(&scope).await?;
        let (nodes, edges) = self.store.entity_projection(Some(&scope)).await?;
        if nodes.is_empty() {
            return Ok(DetectionSummary::default());
        }

        let offset = self.store.max_community_id().await? + 1;
        let hierarchy = detect_hierarchy(&nodes, &edges, &self.cfg, offset);
        self.persist(&hierarchy).await?;
        let orphans = self.store.delete_orphan_communities().await?;
        info!(
            entidades = nodes.len(),
            huerfanas = orphans,
            "Detección incremental de comunidades terminada"
        );
        Ok(DetectionSummary {
            entities: nodes.len(),
            levels: hierarchy.levels.len(),
            communities: hierarchy.community_count(),
        })
    }

    async fn persist(&self, hierarchy: &CommunityHierarchy) -> EngineResult<()> {
        for (level, assignment) in hierarchy.levels.iter().enumerate() {
            for (entity_id, community_id) in assignment {
                self.store
                    .assign_community(entity_id, *community_id, level as i64, 1.0)
                    .await?;
            }
        }
        for ((child, child_level), parent) in &hierarchy.parents {
            self.store
                .link_community_parent(*child, *child_level, *parent, *child_level + 1)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CommunityConfig {
        CommunityConfig::default()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn triangle_pair() -> (Vec<String>, Vec<(String, String, f64)>) {
        // Dos triángulos densos unidos por una arista débil.
        let nodes = ids(&["a1", "a2", "a3", "b1", "b2", "b3"]);
        let edge = |a: &str, b: &str, w: f64| (a.to_string(), b.to_string(), w);
        let edges = vec![
            edge("a1", "a2", 1.0),
            edge("a2", "a3", 1.0),
            edge("a1", "a3", 1.0),
            edge("b1", "b2", 1.0),
            edge("b2", "b3", 1.0),
            edge("b1", "b3", 1.0),
            edge("a3", "b1", 0.1),
        ];
        (nodes, edges)
    }

    #[test]
    fn grafo_vacio_produce_jerarquia_vacia() {
        let h = detect_hierarchy(&[], &[], &cfg(), 0);
        assert!(h.levels.is_empty());
    }

    #[test]
    fn dos_triangulos_forman_dos_comunidades_hoja() {
        let (nodes, edges) = triangle_pair();
        let h = detect_hierarchy(&nodes, &edges, &cfg(), 0);
        let leaf = &h.levels[0];
        assert_eq!(leaf.len(), 6);
        assert_eq!(leaf["a1"], leaf["a2"]);
        assert_eq!(leaf["a2"], leaf["a3"]);
        assert_eq!(leaf["b1"], leaf["b2"]);
        assert_eq!(leaf["b2"], leaf["b3"]);
        assert_ne!(leaf["a1"], leaf["b1"]);
    }

    #[test]
    fn toda_entidad_tiene_exactamente_una_comunidad_hoja() {
        let (nodes, edges) = triangle_pair();
        let h = detect_hierarchy(&nodes, &edges, &cfg(), 0);
        for node in &nodes {
            assert!(h.levels[0].contains_key(node));
        }
    }

    #[test]
    fn nodos_aislados_quedan_en_comunidades_propias() {
        let nodes = ids(&["solo1", "solo2"]);
        let h = detect_hierarchy(&nodes, &[], &cfg(), 0);
        let leaf = &h.levels[0];
        assert_eq!(leaf.len(), 2);
        assert_ne!(leaf["solo1"], leaf["solo2"]);
    }

    #[test]
    fn misma_semilla_mismo_resultado() {
        let (nodes, edges) = triangle_pair();
        let h1 = detect_hierarchy(&nodes, &edges, &cfg(), 0);
        let h2 = detect_hierarchy(&nodes, &edges, &cfg(), 0);
        assert_eq!(h1.levels[0], h2.levels[0]);
        assert_eq!(h1.parents, h2.parents);
    }

    #[test]
    fn el_offset_desplaza_los_ids() {
        let (nodes, edges) = triangle_pair();
        let h = detect_hierarchy(&nodes, &edges, &cfg(), 100);
        for id in h.levels[0].values() {
            assert!(*id >= 100);
        }
    }

    #[test]
    fn los_padres_apuntan_al_nivel_superior() {
        let (nodes, edges) = triangle_pair();
        let h = detect_hierarchy(&nodes, &edges, &cfg(), 0);
        if h.levels.len() > 1 {
            for ((_, child_level), _) in &h.parents {
                assert!((*child_level as usize) < h.levels.len() - 1 || h.levels.len() == 1);
            }
        }
    }

    #[test]
    fn refinamiento_separa_comunidades_desconectadas() {
        // Proyección artificial: 4 nodos, comunidad única pero partida en
        // dos componentes (0-1) y (2-3).
        let projection = Projection {
            neighbors: vec![
                vec![(1, 1.0)],
                vec![(0, 1.0)],
                vec![(3, 1.0)],
                vec![(2, 1.0)],
            ],
            self_loops: vec![0.0; 4],
        };
        let refined = split_disconnected(&projection, &[0, 0, 0, 0]);
        assert_eq!(refined[0], refined[1]);
        assert_eq!(refined[2], refined[3]);
        assert_ne!(refined[0], refined[2]);
    }
}
