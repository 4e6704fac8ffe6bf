//! Retrieval Collaborators
//!
//! Memory and RAG retrievers backed by the engine's own SQLite store, and a
//! DuckDuckGo HTML web searcher (no API key required).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::{debug, warn};

use super::{MemoryRetriever, RagRetriever, WebSearcher};

const SNIPPET_MAX_CHARS: usize = 600;

fn truncate_snippet(text: &str) -> String {
    if text.len() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }
    let mut cut = SNIPPET_MAX_CHARS;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

/// Recalls the highest-reward past outputs for a task class.
pub struct SqliteMemoryRetriever {
    db_path: PathBuf,
}

impl SqliteMemoryRetriever {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl MemoryRetriever for SqliteMemoryRetriever {
    async fn recall(&self, task_class: &str, _query: &str, k: u32) -> Result<Vec<String>> {
        let path = self.db_path.clone();
        let class = task_class.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT v.output FROM variants v
                 JOIN runs r ON r.id = v.run_id
                 WHERE r.task_class = ?1 AND v.total_reward IS NOT NULL
                 ORDER BY v.total_reward DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![&class, k as i64], |row| row.get::<_, String>(0))?;
            let mut snippets = Vec::new();
            for row in rows {
                snippets.push(truncate_snippet(&row?));
            }
            Ok::<_, anyhow::Error>(snippets)
        })
        .await?
    }
}

/// Keyword retriever over the indexed document table.
pub struct SqliteRagRetriever {
    db_path: PathBuf,
}

impl SqliteRagRetriever {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RagRetriever for SqliteRagRetriever {
    async fn retrieve(&self, task_class: &str, query: &str, k: u32) -> Result<Vec<String>> {
        let path = self.db_path.clone();
        let class = task_class.to_string();
        // Longest query term gives the cheapest useful LIKE filter.
        let term = query
            .split_whitespace()
            .max_by_key(|w| w.len())
            .unwrap_or("")
            .to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let pattern = format!("%{}%", term);
            let mut stmt = conn.prepare(
                "SELECT content FROM rag_documents
                 WHERE task_class = ?1 AND content LIKE ?2
                 ORDER BY created_at DESC
                 LIMIT ?3",
            )?;
            let rows =
                stmt.query_map(params![&class, &pattern, k as i64], |row| row.get::<_, String>(0))?;
            let mut snippets = Vec::new();
            for row in rows {
                snippets.push(truncate_snippet(&row?));
            }

            if snippets.is_empty() {
                let mut recent = conn.prepare(
                    "SELECT content FROM rag_documents WHERE task_class = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = recent.query_map(params![&class, k as i64], |row| row.get::<_, String>(0))?;
                for row in rows {
                    snippets.push(truncate_snippet(&row?));
                }
            }
            Ok::<_, anyhow::Error>(snippets)
        })
        .await?
    }

    async fn index_hash(&self) -> Result<String> {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt =
                conn.prepare("SELECT id, content FROM rag_documents ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut hasher = Sha256::new();
            for row in rows {
                let (id, content) = row?;
                hasher.update(id.to_le_bytes());
                hasher.update(content.as_bytes());
            }
            let digest = hasher.finalize();
            let mut hash = String::with_capacity(64);
            for byte in digest {
                hash.push_str(&format!("{:02x}", byte));
            }
            Ok::<_, anyhow::Error>(hash)
        })
        .await?
    }
}

/// Web search via the DuckDuckGo HTML endpoint.
pub struct DdgWebSearcher {
    client: Client,
}

impl DdgWebSearcher {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
                .build()
                .unwrap_or_default(),
        }
    }

    fn parse_ddg_html(html: &str, max_results: usize) -> Vec<String> {
        let snippet_re = regex::Regex::new(r#"class="result__snippet"[^>]*>([^<]+)"#).ok();
        let title_re = regex::Regex::new(r#"class="result__a"[^>]*>([^<]+)"#).ok();

        let mut results = Vec::new();
        if let (Some(snippet_re), Some(title_re)) = (snippet_re, title_re) {
            let snippets: Vec<_> = snippet_re.captures_iter(html).collect();
            let titles: Vec<_> = title_re.captures_iter(html).collect();
            let count = snippets.len().min(titles.len()).min(max_results);

            for i in 0..count {
                let title = titles[i]
                    .get(1)
                    .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
                    .unwrap_or_default();
                let snippet = snippets[i]
                    .get(1)
                    .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
                    .unwrap_or_default();
                if !title.is_empty() && !snippet.is_empty() {
                    results.push(truncate_snippet(&format!("{}: {}", title, snippet)));
                }
            }
        }
        results
    }
}

impl Default for DdgWebSearcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebSearcher for DdgWebSearcher {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<String>> {
        let url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            urlencoding::encode(query)
        );
        debug!("web search: {}", query);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("web search request failed")?;
        let html = response.text().await.context("web search body unreadable")?;

        let results = Self::parse_ddg_html(&html, max_results);
        if results.is_empty() {
            warn!("web search returned no parseable results for '{}'", query);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_snippet_respects_char_boundaries() {
        let long = "é".repeat(700);
        let out = truncate_snippet(&long);
        assert!(out.len() <= SNIPPET_MAX_CHARS + '…'.len_utf8());
        assert!(out.ends_with('…'));

        assert_eq!(truncate_snippet("short"), "short");
    }

    #[test]
    fn test_parse_ddg_html() {
        let html = r#"
            <a class="result__a" href="x">Rust Language</a>
            <a class="result__snippet">A systems language.</a>
            <a class="result__a" href="y">Tokio</a>
            <a class="result__snippet">An async runtime.</a>
        "#;
        let results = DdgWebSearcher::parse_ddg_html(html, 1);
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("Rust Language"));
    }
}
