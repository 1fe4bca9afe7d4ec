use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cli::EmbedDevice;
use crate::config::ToolServerConfig;

pub const CACHE_METADATA_FILE: &str = "cache_metadata.json";
pub const INDEX_FILE: &str = "index.json";

/// Vector width of the feature-hashing embedder.
pub const EMBED_DIM: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub docs: Vec<String>,
    pub embed_model: String,
    pub embed_device: EmbedDevice,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub default_top_k: usize,
    pub persist_dir: String,
}

impl From<&ToolServerConfig> for RagConfig {
    fn from(cfg: &ToolServerConfig) -> Self {
        Self {
            docs: cfg.docs.clone(),
            embed_model: cfg.embed_model.clone(),
            embed_device: cfg.embed_device,
            chunk_size: cfg.chunk_size,
            chunk_overlap: cfg.chunk_overlap,
            default_top_k: cfg.default_top_k,
            persist_dir: cfg.persist_dir.clone(),
        }
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read document '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Serialize)]
struct SignatureData<'a> {
    doc_files: &'a [String],
    file_hashes: &'a BTreeMap<String, String>,
    embed_model: &'a str,
    chunk_size: usize,
    chunk_overlap: usize,
}

/// Deterministic digest over documents and index configuration. Paths are
/// absolutized and sorted so argument order never changes the digest; files
/// that do not exist are omitted from the hash set (signature time is not the
/// place to fail).
pub fn cache_signature(
    doc_paths: &[String],
    embed_model: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<String> {
    let mut sorted = doc_paths
        .iter()
        .map(|p| {
            std::path::absolute(p)
                .with_context(|| format!("failed to absolutize document path '{p}'"))
                .map(|abs| abs.display().to_string())
        })
        .collect::<Result<Vec<String>>>()?;
    sorted.sort();

    let mut file_hashes = BTreeMap::new();
    for path in &sorted {
        if Path::new(path).exists() {
            file_hashes.insert(path.clone(), file_sha256(Path::new(path))?);
        }
    }

    let data = SignatureData {
        doc_files: &sorted,
        file_hashes: &file_hashes,
        embed_model,
        chunk_size,
        chunk_overlap,
    };
    let serialized =
        serde_json::to_string(&data).context("failed to serialize cache signature data")?;

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Word windows of `chunk_size` words advancing by `chunk_size - overlap`.
pub fn split_into_chunks(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let words = text.split_whitespace().collect::<Vec<&str>>();
    if words.is_empty() {
        return Vec::new();
    }

    let size = chunk_size.max(1);
    let step = size.saturating_sub(chunk_overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Deterministic bag-of-words embedder: tokens are feature-hashed into a
/// fixed-width vector, seeded by the model id so distinct ids produce
/// distinct spaces. Stands in for an external sentence embedder while keeping
/// the signature and ranking contracts fully reproducible.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    seed: u64,
}

impl HashEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            seed: fnv1a(model_id.as_bytes(), 0xcbf2_9ce4_8422_2325),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBED_DIM];
        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes(), self.seed) as usize) % EMBED_DIM;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() > 1)
        .map(str::to_ascii_lowercase)
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub source: String,
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentIndex {
    pub embed_model: String,
    pub chunks: Vec<IndexedChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Loaded,
    Rebuilt,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalChunk {
    pub text: String,
    pub score: f32,
}

#[derive(Debug)]
pub struct RagService {
    index: DocumentIndex,
    embedder: HashEmbedder,
    default_top_k: usize,
    origin: IndexOrigin,
}

impl RagService {
    /// Validate the persisted index against the current signature and either
    /// load it or rebuild from the source documents. Rebuild failures are
    /// fatal; a stale or unreadable cache is not.
    pub fn initialize(cfg: &RagConfig) -> Result<Self> {
        if cfg.docs.is_empty() {
            anyhow::bail!("no document files specified for the retrieval index");
        }

        let signature =
            cache_signature(&cfg.docs, &cfg.embed_model, cfg.chunk_size, cfg.chunk_overlap)?;
        let persist_dir = PathBuf::from(&cfg.persist_dir);
        let embedder = HashEmbedder::new(&cfg.embed_model);

        if saved_signature(&persist_dir).as_deref() == Some(signature.as_str()) {
            match load_index(&persist_dir) {
                Ok(index) => {
                    tracing::info!(
                        persist_dir = %persist_dir.display(),
                        chunks = index.chunks.len(),
                        "cache signature matches; loaded persisted index"
                    );
                    return Ok(Self {
                        index,
                        embedder,
                        default_top_k: cfg.default_top_k,
                        origin: IndexOrigin::Loaded,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        persist_dir = %persist_dir.display(),
                        error = %err,
                        "failed to load index despite matching signature; rebuilding"
                    );
                }
            }
        } else {
            tracing::info!(
                persist_dir = %persist_dir.display(),
                "cache signature missing or stale; rebuilding index"
            );
        }

        let index = build_index(cfg, &embedder)?;
        persist_index(&persist_dir, &index, &signature)?;
        tracing::info!(
            persist_dir = %persist_dir.display(),
            chunks = index.chunks.len(),
            device = cfg.embed_device.as_str(),
            "index built and persisted"
        );

        Ok(Self {
            index,
            embedder,
            default_top_k: cfg.default_top_k,
            origin: IndexOrigin::Rebuilt,
        })
    }

    pub fn origin(&self) -> IndexOrigin {
        self.origin
    }

    pub fn chunk_count(&self) -> usize {
        self.index.chunks.len()
    }

    /// Chunks ranked by similarity, descending. A `top_k` that is absent or
    /// not positive falls back to the configured default; an empty result is
    /// a valid no-match.
    pub fn retrieve(&self, query: &str, top_k: Option<i64>) -> Vec<RetrievalChunk> {
        let limit = match top_k {
            Some(k) if k > 0 => k as usize,
            _ => self.default_top_k,
        };

        let query_vector = self.embedder.embed(query);
        let mut scored = self
            .index
            .chunks
            .iter()
            .map(|chunk| RetrievalChunk {
                text: chunk.text.clone(),
                score: cosine(&query_vector, &chunk.vector),
            })
            .collect::<Vec<RetrievalChunk>>();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }
}

fn saved_signature(persist_dir: &Path) -> Option<String> {
    let metadata_path = persist_dir.join(CACHE_METADATA_FILE);
    let content = std::fs::read_to_string(&metadata_path).ok()?;
    match serde_json::from_str::<CacheMetadata>(&content) {
        Ok(metadata) => Some(metadata.signature),
        Err(err) => {
            tracing::warn!(
                path = %metadata_path.display(),
                error = %err,
                "could not parse cache metadata; treating cache as stale"
            );
            None
        }
    }
}

fn load_index(persist_dir: &Path) -> Result<DocumentIndex> {
    let index_path = persist_dir.join(INDEX_FILE);
    let content = std::fs::read_to_string(&index_path)
        .with_context(|| format!("failed to read index file '{}'", index_path.display()))?;
    serde_json::from_str::<DocumentIndex>(&content)
        .with_context(|| format!("failed to parse index file '{}'", index_path.display()))
}

fn build_index(cfg: &RagConfig, embedder: &HashEmbedder) -> Result<DocumentIndex> {
    let mut chunks = Vec::new();
    for doc in &cfg.docs {
        let path = Path::new(doc);
        if !path.exists() {
            anyhow::bail!("document file not found: {doc}");
        }

        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read document '{doc}'"))?;
        let text = String::from_utf8_lossy(&bytes);

        for (number, chunk) in split_into_chunks(&text, cfg.chunk_size, cfg.chunk_overlap)
            .into_iter()
            .enumerate()
        {
            chunks.push(IndexedChunk {
                source: format!("{doc}#{}", number + 1),
                vector: embedder.embed(&chunk),
                text: chunk,
            });
        }
    }

    if chunks.is_empty() {
        anyhow::bail!("no document content was loaded for the retrieval index");
    }

    Ok(DocumentIndex {
        embed_model: cfg.embed_model.clone(),
        chunks,
    })
}

fn persist_index(persist_dir: &Path, index: &DocumentIndex, signature: &str) -> Result<()> {
    std::fs::create_dir_all(persist_dir).with_context(|| {
        format!(
            "failed to create index persist directory '{}'",
            persist_dir.display()
        )
    })?;

    let index_path = persist_dir.join(INDEX_FILE);
    let serialized = serde_json::to_string(index).context("failed to serialize index")?;
    std::fs::write(&index_path, serialized)
        .with_context(|| format!("failed to write index file '{}'", index_path.display()))?;

    let metadata_path = persist_dir.join(CACHE_METADATA_FILE);
    let metadata = serde_json::to_string(&CacheMetadata {
        signature: signature.to_string(),
    })
    .context("failed to serialize cache metadata")?;
    std::fs::write(&metadata_path, metadata).with_context(|| {
        format!(
            "failed to write cache metadata '{}'",
            metadata_path.display()
        )
    })
}
