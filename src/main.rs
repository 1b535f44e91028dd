//! Adaptador CLI fino sobre el motor GraphRAG. Aquí sólo vive el cableado
//! de dependencias y el parseo de subcomandos; toda la lógica está en la
//! biblioteca.

use std::path::Path;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use neo4j_graphrag_engine::ingest::document_id_for_path;
use neo4j_graphrag_engine::{AppConfig, GraphRagEngine};

const USAGE: &str = "\
Uso: graphrag <subcomando>

Subcomandos:
  ingest <ruta>            Ingesta un fichero o directorio de Markdown
  query local <pregunta>   Consulta local sobre entidades cercanas
  query global <pregunta>  Consulta global Map-Reduce sobre comunidades
  query tog <pregunta>     Razonamiento multi-salto Tree-of-Graphs
  communities              Detección completa de comunidades + informes
  stats                    Recuento de nodos del grafo";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, rest) = match args.split_first() {
        Some((c, rest)) => (c.as_str(), rest),
        None => {
            println!("{USAGE}");
            return Ok(());
        }
    };

    let cfg = AppConfig::from_env()?;
    let engine = GraphRagEngine::connect(cfg).await?;

    match (command, rest) {
        ("ingest", [route]) => {
            let path = Path::new(route);
            if path.is_dir() {
                let summary = engine.ingest_directory(path).await?;
                println!("{summary}");
            } else {
                let document_id = document_id_for_path(path);
                let outcome = engine.ingest_document(&document_id, path).await?;
                println!(
                    "Documento {document_id}: {} chunks, {} entidades, {} relaciones, {} afirmaciones, {} comunidades",
                    outcome.chunks_created,
                    outcome.entities_count,
                    outcome.relationships_count,
                    outcome.claims_count,
                    outcome.communities_count
                );
            }
        }
        ("query", [mode, question]) => match mode.as_str() {
            "local" => {
                let answer = engine.query_local(question, 1, None).await?;
                println!("{}", answer.answer);
                println!(
                    "(confianza {:.2}, {} tokens de contexto, citas: {})",
                    answer.confidence,
                    answer.context_token_count,
                    answer.citations.join(", ")
                );
            }
            "global" => {
                let answer = engine.query_global(question, None, None).await?;
                println!("{}", answer.answer);
                println!(
                    "(confianza {:.2}, {} comunidades en {} lotes)",
                    answer.confidence, answer.num_communities, answer.batches_used
                );
            }
            "tog" => {
                let answer = engine.query_tog(question, None, None).await?;
                println!("{}", answer.answer);
                for step in &answer.reasoning_path {
                    info!(
                        "paso {}: relaciones {:?} → entidades {:?}",
                        step.depth, step.selected_relations, step.entities
                    );
                }
                println!(
                    "(confianza {:.2}, {} tripletas, {} ms)",
                    answer.confidence,
                    answer.retrieved_triplets.len(),
                    answer.processing_time_ms
                );
            }
            other => anyhow::bail!("Modo de consulta desconocido: {other}\n{USAGE}"),
        },
        ("communities", []) => {
            let summary = engine.detect_communities(false, None).await?;
            let reports = engine.summarize_communities(true).await?;
            println!(
                "{} comunidades en {} niveles sobre {} entidades; {} informes generados",
                summary.communities, summary.levels, summary.entities, reports
            );
        }
        ("stats", []) => {
            let stats = engine.graph_stats().await?;
            println!(
                "Documentos: {}\nUnidades de texto: {}\nEntidades: {}\nRelaciones: {}\nAfirmaciones: {}\nComunidades: {}",
                stats.documents,
                stats.textunits,
                stats.entities,
                stats.relationships,
                stats.claims,
                stats.communities
            );
        }
        _ => {
            println!("{USAGE}");
        }
    }

    Ok(())
}
