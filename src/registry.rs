use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "semantic")]
use crate::embeddings::EmbeddingIndex;
use crate::cursor::Cursor;
use crate::errors::ToolError;

/// Upper bound on a single `SearchPage`/`ListTools` page, regardless of the
/// caller-requested limit.
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// A tool entry in the registry, linking a tool to its backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    /// The namespaced tool name used in search results and `tools/call`.
    pub name: String,
    /// The tool name as the backend itself knows it (pre-namespacing).
    /// Used when calling back into the backend and when generating sandbox
    /// accessor functions, which have no notion of namespaces.
    #[serde(default)]
    pub original_name: String,
    /// Description from the backend's tool definition.
    pub description: String,
    /// The backend that owns this tool.
    pub backend_name: String,
    /// The full JSON schema for the tool's input.
    pub input_schema: Value,
    /// Free-form tags surfaced by the backend (used by toolset filtering and
    /// as an extra BM25 field).
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A change to the catalog, published on the registry's change bus.
///
/// Subscribers run synchronously on the mutating task; the server layer is
/// responsible for offloading slow work (e.g. debounced wire notifications).
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added { tool_name: String },
    Removed { tool_name: String },
}

/// Concurrent tool registry aggregating tools from all backends.
///
/// Uses DashMap for lock-free concurrent reads. Backends register
/// tools concurrently at startup without contention.
pub struct ToolRegistry {
    /// tool_name -> ToolEntry
    tools: DashMap<String, ToolEntry>,
    /// backend_name -> list of tool names
    backend_tools: DashMap<String, Vec<String>>,
    /// Monotonic counter bumped on every mutating operation. Used to bind
    /// pagination cursors to the catalog state they were issued against.
    generation: AtomicU64,
    /// Change notification bus. Sender is kept alive by the registry even
    /// with zero subscribers so `subscribe()` always succeeds.
    changes: tokio::sync::broadcast::Sender<ChangeEvent>,
    /// Optional semantic embedding index for hybrid search.
    #[cfg(feature = "semantic")]
    embedding_index: Option<EmbeddingIndex>,
}

impl ToolRegistry {
    pub fn new() -> Arc<Self> {
        let (changes, _) = tokio::sync::broadcast::channel(256);
        Arc::new(Self {
            tools: DashMap::new(),
            backend_tools: DashMap::new(),
            generation: AtomicU64::new(0),
            changes,
            #[cfg(feature = "semantic")]
            embedding_index: None,
        })
    }

    /// Create a registry with an embedding index for hybrid BM25+semantic search.
    #[cfg(feature = "semantic")]
    pub fn new_with_embeddings(index: EmbeddingIndex) -> Arc<Self> {
        let (changes, _) = tokio::sync::broadcast::channel(256);
        Arc::new(Self {
            tools: DashMap::new(),
            backend_tools: DashMap::new(),
            generation: AtomicU64::new(0),
            changes,
            embedding_index: Some(index),
        })
    }

    /// Current mutation generation. Bumped once per `register_backend_tools`/
    /// `remove_backend_tools` call, never per individual tool.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Subscribe to catalog change events. The receiver only sees events
    /// published after this call; there is no replay of history.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Register tools discovered from a backend, namespacing them under the
    /// backend's own name (`backend_name.tool_name`).
    pub fn register_backend_tools(&self, backend_name: &str, tools: Vec<ToolEntry>) {
        self.register_backend_tools_namespaced(backend_name, backend_name, tools);
    }

    /// Register tools discovered from a backend under an explicit namespace.
    ///
    /// `namespace` may differ from `backend_name` when a backend config sets
    /// a custom `namespace:` (multiple backend configs can then share tool
    /// names without colliding in the registry).
    pub fn register_backend_tools_namespaced(
        &self,
        backend_name: &str,
        namespace: &str,
        tools: Vec<ToolEntry>,
    ) {
        let tools: Vec<ToolEntry> = tools
            .into_iter()
            .map(|mut t| {
                if t.original_name.is_empty() {
                    t.original_name = t.name.clone();
                }
                t.name = format!("{namespace}.{}", t.original_name);
                t.backend_name = backend_name.to_string();
                t
            })
            .collect();

        let tool_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();

        // Insert into DashMap first (source of truth for search results)
        #[cfg(feature = "semantic")]
        let tools_for_embedding: Vec<ToolEntry> = tools.to_vec();

        for tool in tools {
            self.tools.insert(tool.name.clone(), tool);
        }

        // Then update embeddings (any concurrent search will find valid tools)
        #[cfg(feature = "semantic")]
        if let Some(ref index) = self.embedding_index {
            index.add_tools(&tools_for_embedding);
        }

        self.backend_tools
            .insert(backend_name.to_string(), tool_names.clone());

        self.bump_generation();
        for name in tool_names {
            let _ = self.changes.send(ChangeEvent::Added { tool_name: name });
        }
    }

    /// Remove all tools belonging to a backend.
    pub fn remove_backend_tools(&self, backend_name: &str) {
        if let Some((_, tool_names)) = self.backend_tools.remove(backend_name) {
            #[cfg(feature = "semantic")]
            if let Some(ref index) = self.embedding_index {
                index.remove_tools(&tool_names);
            }

            for name in &tool_names {
                self.tools.remove(name);
            }

            self.bump_generation();
            for name in tool_names {
                let _ = self.changes.send(ChangeEvent::Removed { tool_name: name });
            }
        }
    }

    /// Get all tool entries.
    pub fn get_all(&self) -> Vec<ToolEntry> {
        self.tools.iter().map(|r| r.value().clone()).collect()
    }

    /// Get all tool names.
    pub fn get_all_names(&self) -> Vec<String> {
        self.tools.iter().map(|r| r.key().clone()).collect()
    }

    /// Look up a tool by exact name.
    pub fn get_by_name(&self, name: &str) -> Option<ToolEntry> {
        self.tools.get(name).map(|r| r.value().clone())
    }

    /// Get all tools for a specific backend.
    #[allow(dead_code)]
    pub fn get_by_backend(&self, backend_name: &str) -> Vec<ToolEntry> {
        if let Some(names) = self.backend_tools.get(backend_name) {
            names
                .iter()
                .filter_map(|n| self.tools.get(n).map(|r| r.value().clone()))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Search tools using BM25 ranking on name, description, and tags.
    ///
    /// BM25 parameters: k1=1.2 (term frequency saturation), b=0.75 (length normalization).
    /// Tool names are tokenized by splitting underscores/hyphens (e.g., "get_current_time"
    /// becomes ["get", "current", "time"]). Name tokens get a 2x boost over description tokens.
    pub fn search(&self, query: &str, limit: u32) -> Vec<ToolEntry> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        // Build corpus: collect (entry, doc_tokens) for all tools
        let corpus: Vec<(ToolEntry, Vec<String>)> = self
            .tools
            .iter()
            .map(|r| {
                let entry = r.value().clone();
                let mut tokens = tokenize(&entry.name);
                // Name tokens get 2x weight by appearing twice
                let name_tokens = tokens.clone();
                tokens.extend(name_tokens);
                tokens.extend(tokenize(&entry.description));
                for tag in &entry.tags {
                    tokens.extend(tokenize(tag));
                }
                (entry, tokens)
            })
            .collect();

        let n = corpus.len() as f64;
        if n == 0.0 {
            return Vec::new();
        }

        // Average document length
        let avgdl: f64 = corpus.iter().map(|(_, t)| t.len() as f64).sum::<f64>() / n;

        // Document frequency: how many docs contain each query term
        let mut df: HashMap<&str, f64> = HashMap::new();
        for term in &query_terms {
            let count = corpus
                .iter()
                .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
                .count();
            df.insert(term.as_str(), count as f64);
        }

        // Score each document
        const K1: f64 = 1.2;
        const B: f64 = 0.75;

        let mut scored: Vec<(ToolEntry, f64)> = corpus
            .into_iter()
            .filter_map(|(entry, tokens)| {
                let dl = tokens.len() as f64;

                // Term frequencies in this doc
                let mut tf: HashMap<&str, f64> = HashMap::new();
                for term in &query_terms {
                    let count = tokens
                        .iter()
                        .filter(|t| t.as_str() == term.as_str())
                        .count();
                    tf.insert(term.as_str(), count as f64);
                }

                let mut score = 0.0f64;
                for term in &query_terms {
                    let term_freq = tf.get(term.as_str()).copied().unwrap_or(0.0);
                    if term_freq == 0.0 {
                        continue;
                    }
                    let doc_freq = df.get(term.as_str()).copied().unwrap_or(0.0);

                    // IDF: log((N - df + 0.5) / (df + 0.5) + 1)
                    let idf = ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln();

                    // TF component with length normalization
                    let tf_norm =
                        (term_freq * (K1 + 1.0)) / (term_freq + K1 * (1.0 - B + B * dl / avgdl));

                    score += idf * tf_norm;
                }

                if score > 0.0 {
                    Some((entry, score))
                } else {
                    None
                }
            })
            .collect();

        // Sort by score descending, then by name for stability
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.name.cmp(&b.0.name))
        });

        scored.truncate(limit as usize);
        scored.into_iter().map(|(entry, _)| entry).collect()
    }

    /// Total number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Number of registered backends.
    pub fn backend_count(&self) -> usize {
        self.backend_tools.len()
    }

    /// Get backend name for a given tool.
    #[allow(dead_code)]
    pub fn get_backend_for_tool(&self, tool_name: &str) -> Option<String> {
        self.tools
            .get(tool_name)
            .map(|r| r.value().backend_name.clone())
    }

    /// Get all backend names.
    #[allow(dead_code)]
    pub fn get_backend_names(&self) -> Vec<String> {
        self.backend_tools.iter().map(|r| r.key().clone()).collect()
    }

    /// Page through a ranked search (or, for an empty query, the full catalog
    /// in `(namespace_asc, name_asc)` order) using an opaque cursor bound to
    /// the registry's mutation generation.
    ///
    /// `limit` is clamped to `[1, MAX_PAGE_LIMIT]` (`DEFAULT_PAGE_LIMIT` when
    /// zero). A `None` cursor starts at offset 0; a stale or malformed cursor
    /// is a `validation_input` error rather than a best-effort reinterpretation.
    pub fn search_page(
        &self,
        query: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<(Vec<ToolEntry>, Option<String>), ToolError> {
        let limit = if limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit.min(MAX_PAGE_LIMIT)
        };
        let generation = self.generation();

        let offset = match cursor {
            Some(raw) => Cursor::decode_checked(raw, generation)?.offset,
            None => 0,
        };

        let mut matches = if query.trim().is_empty() {
            let mut all = self.get_all();
            all.sort_by(|a, b| {
                a.backend_name
                    .cmp(&b.backend_name)
                    .then_with(|| a.name.cmp(&b.name))
            });
            all
        } else {
            #[cfg(feature = "semantic")]
            let ranked = self.search_hybrid(query, self.tool_count() as u32);
            #[cfg(not(feature = "semantic"))]
            let ranked = self.search(query, self.tool_count() as u32);
            ranked
        };

        if offset > matches.len() {
            return Err(ToolError::validation_input(
                "cursor offset is past the end of the result set",
            ));
        }

        let total = matches.len();
        let page: Vec<ToolEntry> = matches.drain(..).skip(offset).take(limit as usize).collect();
        let next_offset = offset + page.len();
        let next_cursor = if next_offset < total {
            Some(Cursor::new(next_offset, generation).encode())
        } else {
            None
        };

        Ok((page, next_cursor))
    }

    /// List distinct namespaces (backend names), paginated, in lexicographic order.
    pub fn list_namespaces_page(&self, limit: u32, offset: usize) -> (Vec<String>, bool) {
        let mut names = self.get_backend_names();
        names.sort();
        let limit = limit as usize;
        let page: Vec<String> = names.iter().skip(offset).take(limit).cloned().collect();
        let has_more = offset + page.len() < names.len();
        (page, has_more)
    }

    /// Hybrid BM25 + semantic search using Reciprocal Rank Fusion (RRF).
    ///
    /// RRF combines ranked lists from different retrievers by scoring each result as
    /// `1 / (k + rank)` where k=60 is the standard IR constant. This normalizes
    /// the incomparable BM25 scores (0-15+) and cosine similarities (0-1) into a
    /// single ranking without hyperparameter tuning.
    #[cfg(feature = "semantic")]
    pub fn search_hybrid(&self, query: &str, limit: u32) -> Vec<ToolEntry> {
        let index = match &self.embedding_index {
            Some(idx) if !idx.is_empty() => idx,
            _ => return self.search(query, limit),
        };

        const RRF_K: f64 = 60.0;
        let fetch_limit = limit.max(30); // Fetch more candidates for fusion

        // Get BM25 ranked results
        let bm25_results = self.search(query, fetch_limit);

        // Get semantic ranked results
        let semantic_results = index.search(query, fetch_limit as usize);

        // RRF: accumulate 1/(k + rank) for each retriever
        let mut rrf_scores: HashMap<String, f64> = HashMap::new();

        for (rank, entry) in bm25_results.iter().enumerate() {
            *rrf_scores.entry(entry.name.clone()).or_default() += 1.0 / (RRF_K + rank as f64 + 1.0);
        }

        for (rank, (name, _similarity)) in semantic_results.iter().enumerate() {
            *rrf_scores.entry(name.clone()).or_default() += 1.0 / (RRF_K + rank as f64 + 1.0);
        }

        // Sort by combined RRF score descending
        let mut scored: Vec<(String, f64)> = rrf_scores.into_iter().collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit as usize);

        // Look up full ToolEntry for each result
        scored
            .into_iter()
            .filter_map(|(name, _)| self.tools.get(&name).map(|r| r.value().clone()))
            .collect()
    }

    /// Export embedding vectors for cache persistence.
    #[cfg(feature = "semantic")]
    pub fn embedding_snapshot(&self) -> Option<HashMap<String, Vec<f32>>> {
        self.embedding_index.as_ref().map(|idx| idx.snapshot())
    }

    /// Restore embedding vectors from cache (avoids re-embedding on startup).
    #[cfg(feature = "semantic")]
    pub fn load_embeddings(&self, data: HashMap<String, Vec<f32>>) {
        if let Some(ref index) = self.embedding_index {
            index.load_snapshot(data);
        }
    }

    /// Export all tools grouped by backend name (for cache serialization).
    pub fn snapshot(&self) -> HashMap<String, Vec<ToolEntry>> {
        let mut result: HashMap<String, Vec<ToolEntry>> = HashMap::new();
        for entry in self.tools.iter() {
            result
                .entry(entry.value().backend_name.clone())
                .or_default()
                .push(entry.value().clone());
        }
        result
    }
}

/// Tokenize text into lowercase terms, splitting on non-alphanumeric characters.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
