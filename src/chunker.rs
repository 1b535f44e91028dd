//! Troceado de documentos Markdown en unidades de texto acotadas por tokens.
//!
//! Los chunks son spans reales `[start_char, end_char)` sobre el texto
//! original: concatenarlos en orden de `start_char` eliminando los solapes
//! reproduce el documento exacto. El contador de tokens es el mismo BPE que
//! usa el LLM (cl100k), de modo que los presupuestos de contexto y de
//! troceado hablan la misma unidad.

use std::sync::Arc;

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::config::ChunkingConfig;
use crate::error::{EngineError, EngineResult};

/// Contador determinista de tokens compartido por troceado y presupuestos.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish()
    }
}

impl TokenCounter {
    pub fn new() -> EngineResult<Self> {
        let bpe = cl100k_base().map_err(|e| {
            EngineError::Configuration(format!("No se pudo inicializar el BPE cl100k: {e}"))
        })?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Número de tokens del texto.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Recorta el texto a como mucho `max_tokens` tokens, retrocediendo si el
    /// corte cae en mitad de una secuencia UTF-8.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        let mut n = max_tokens;
        while n > 0 {
            if let Ok(s) = self.bpe.decode(tokens[..n].to_vec()) {
                return s;
            }
            n -= 1;
        }
        String::new()
    }
}

/// Un trozo de documento con sus offsets de carácter y su coste en tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub token_count: usize,
}

/// Segmento interno: un párrafo (o frase, si el párrafo se pasa de
/// presupuesto) que particiona el texto original sin huecos.
#[derive(Debug, Clone, Copy)]
struct Atom {
    start: usize,
    end: usize,
    tokens: usize,
}

/// Troceador semántico: acumula párrafos completos hasta el presupuesto y
/// mantiene continuidad temática solapando la cola del chunk anterior.
#[derive(Debug, Clone)]
pub struct Chunker {
    counter: TokenCounter,
    cfg: ChunkingConfig,
}

impl Chunker {
    pub fn new(counter: TokenCounter, cfg: ChunkingConfig) -> Self {
        Self { counter, cfg }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Trocea el texto completo de un documento. Texto vacío → sin chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let atoms = self.atomize(text);
        if atoms.is_empty() {
            return Vec::new();
        }

        let mut chunks: Vec<(usize, usize)> = Vec::new(); // índices [desde, hasta) en atoms
        let mut i = 0;
        while i < atoms.len() {
            let mut j = i;
            let mut tokens = 0;
            while j < atoms.len() {
                let next = tokens + atoms[j].tokens;
                if next > self.cfg.chunk_size_tokens && j > i {
                    break;
                }
                tokens = next;
                j += 1;
                if tokens >= self.cfg.chunk_size_tokens {
                    break;
                }
            }
            chunks.push((i, j));
            if j >= atoms.len() {
                break;
            }
            // El siguiente chunk arranca en la cola del actual: tantos átomos
            // finales como quepan en el presupuesto de solape, garantizando
            // siempre avance de al menos un átomo.
            let mut k = j;
            let mut overlap = 0;
            while k > i + 1 {
                let candidate = overlap + atoms[k - 1].tokens;
                if candidate > self.cfg.overlap_tokens {
                    break;
                }
                overlap = candidate;
                k -= 1;
            }
            i = k.max(i + 1);
        }

        // Un último chunk por debajo del mínimo se funde hacia atrás.
        if chunks.len() > 1 {
            let (s, e) = chunks[chunks.len() - 1];
            let last_tokens: usize = atoms[s..e].iter().map(|a| a.tokens).sum();
            if last_tokens < self.cfg.min_chunk_tokens {
                let last = chunks.pop().unwrap_or((s, e));
                if let Some(prev) = chunks.last_mut() {
                    prev.1 = last.1;
                }
            }
        }

        chunks
            .into_iter()
            .map(|(s, e)| {
                let start = atoms[s].start;
                let end = atoms[e - 1].end;
                let body = &text[start..end];
                Chunk {
                    text: body.to_string(),
                    start_char: start,
                    end_char: end,
                    token_count: self.counter.count(body),
                }
            })
            .collect()
    }

    /// Particiona el texto en párrafos (separados por línea en blanco),
    /// incluyendo cada separador en el párrafo que lo precede. Un párrafo
    /// que excede por sí solo el presupuesto se subdivide en frases.
    fn atomize(&self, text: &str) -> Vec<Atom> {
        let mut atoms = Vec::new();
        for (start, end) in paragraph_spans(text) {
            let tokens = self.counter.count(&text[start..end]);
            if tokens <= self.cfg.chunk_size_tokens {
                atoms.push(Atom { start, end, tokens });
            } else {
                for (s, e) in sentence_spans(text, start, end) {
                    let t = self.counter.count(&text[s..e]);
                    atoms.push(Atom {
                        start: s,
                        end: e,
                        tokens: t,
                    });
                }
            }
        }
        atoms
    }
}

/// Spans de párrafo que cubren todo el texto sin huecos: cada span termina
/// tras la secuencia de líneas en blanco que lo separa del siguiente.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        if let Some(sep) = find_blank_line(text, pos) {
            // Extender el separador hasta el comienzo del siguiente párrafo.
            let mut end = sep;
            while end < bytes.len() && (bytes[end] == b'\n' || bytes[end] == b'\r') {
                end += 1;
            }
            spans.push((start, end));
            start = end;
            pos = end;
        } else {
            break;
        }
    }
    if start < bytes.len() {
        spans.push((start, bytes.len()));
    }
    spans
}

/// Posición del primer salto de línea de una secuencia "línea en blanco"
/// (\n seguido de otro \n, ignorando \r) a partir de `from`.
fn find_blank_line(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] == b'\r' {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'\n' {
                return Some(i + 1);
            }
        }
        i += 1;
    }
    None
}

/// Subdivide `[start, end)` en frases, cortando tras '.', '!', '?' o salto
/// de línea. La unión de los spans cubre el rango exacto.
fn sentence_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut s = start;
    let slice = &text[start..end];
    for (offset, ch) in slice.char_indices() {
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let cut = start + offset + ch.len_utf8();
            if cut > s {
                spans.push((s, cut));
                s = cut;
            }
        }
    }
    if s < end {
        spans.push((s, end));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(size: usize, overlap: usize, min: usize) -> Chunker {
        Chunker::new(
            TokenCounter::new().unwrap(),
            ChunkingConfig {
                chunk_size_tokens: size,
                overlap_tokens: overlap,
                min_chunk_tokens: min,
            },
        )
    }

    /// Reconstruye el texto original quitando las regiones solapadas.
    fn reconstruct(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for c in chunks {
            if c.end_char > covered {
                let skip = covered.saturating_sub(c.start_char);
                out.push_str(&c.text[skip..]);
                covered = c.end_char;
            }
        }
        out
    }

    #[test]
    fn texto_vacio_no_produce_chunks() {
        assert!(chunker(100, 20, 5).chunk("").is_empty());
        assert!(chunker(100, 20, 5).chunk("   \n\n  ").is_empty());
    }

    #[test]
    fn documento_corto_en_un_solo_chunk() {
        let chunks = chunker(1000, 500, 10).chunk("Alice works at Acme.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_char, 0);
        assert_eq!(chunks[0].text, "Alice works at Acme.");
    }

    #[test]
    fn la_concatenacion_sin_solapes_reproduce_el_original() {
        let text = (0..40)
            .map(|i| format!("Párrafo número {i} con algo de texto real que ocupa varios tokens."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunker(60, 20, 10).chunk(&text);
        assert!(chunks.len() > 1);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn los_chunks_van_ordenados_y_solapados() {
        let text = (0..30)
            .map(|i| format!("Oración repetida {i} para forzar varios chunks seguidos."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunker(50, 25, 5).chunk(&text);
        for pair in chunks.windows(2) {
            assert!(pair[0].start_char < pair[1].start_char);
            // La cola del chunk anterior reaparece al comienzo del siguiente.
            assert!(pair[1].start_char <= pair[0].end_char);
        }
    }

    #[test]
    fn parrafo_gigante_se_parte_por_frases() {
        let text = "Una frase. ".repeat(200);
        let chunks = chunker(40, 10, 5).chunk(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_count <= 80, "chunk demasiado grande: {}", c.token_count);
        }
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn el_ultimo_chunk_pequeno_se_funde_hacia_atras() {
        let text = format!(
            "{}\n\nFin.",
            (0..12)
                .map(|i| format!("Contenido sustancial del párrafo {i} con texto suficiente."))
                .collect::<Vec<_>>()
                .join("\n\n")
        );
        let chunks = chunker(60, 10, 8).chunk(&text);
        let last = chunks.last().unwrap();
        assert!(last.token_count >= 8 || chunks.len() == 1);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn truncate_respeta_el_presupuesto() {
        let counter = TokenCounter::new().unwrap();
        let text = "palabra ".repeat(100);
        let cut = counter.truncate(&text, 10);
        assert!(counter.count(&cut) <= 10);
        assert!(text.starts_with(&cut));
    }
}
