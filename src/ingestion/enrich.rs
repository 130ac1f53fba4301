//! Chunk enrichment (§4.H step 4): LLM-rendered `embeddedText` per chunk,
//! cached by the enrichment key in [`crate::cache::enrichment`].

use std::sync::Arc;

use crate::cache::enrichment::{EnrichmentCache, EnrichmentKeyInput};
use crate::error::{CoreError, Result};
use crate::ingestion::types::{ContentType, EnrichmentResult, IngestionConfig, RawChunk};
use crate::llm::provider::{GenerationRequest, LlmProvider, Message, Usage};

pub struct EnrichmentContext<'a> {
    pub source_uri: &'a str,
    pub doc_id: &'a str,
    pub version: &'a str,
    pub doc_author: Option<&'a str>,
    pub doc_description: Option<&'a str>,
    pub doc_tags: &'a [String],
    pub full_document: &'a str,
}

/// A ±2-line window around the chunk, clipped to ≤2000 chars (§4.H step 4
/// "outward context").
fn outward_context(full_document: &str, start_line: usize, end_line: usize) -> String {
    let lines: Vec<&str> = full_document.lines().collect();
    let from = start_line.saturating_sub(2);
    let to = (end_line + 2).min(lines.len().saturating_sub(1));
    if from > to || lines.is_empty() {
        return String::new();
    }
    let mut context = lines[from..=to].join("\n");
    if context.chars().count() > 2000 {
        context = context.chars().take(2000).collect();
    }
    context
}

fn content_type_name(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Markdown => "markdown",
        ContentType::Code => "code",
        ContentType::Table => "table",
    }
}

fn build_prompt(ctx: &EnrichmentContext, chunk: &RawChunk, context_window: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("source_uri: {}\n", ctx.source_uri));
    prompt.push_str(&format!("doc_id: {}\n", ctx.doc_id));
    prompt.push_str(&format!("version: {}\n", ctx.version));
    prompt.push_str(&format!("heading_path: {}\n", chunk.heading_path));
    prompt.push_str(&format!("content_type: {}\n", content_type_name(chunk.content_type)));
    if let Some(language) = &chunk.language {
        prompt.push_str(&format!("language: {language}\n"));
    }
    if let Some(author) = ctx.doc_author {
        prompt.push_str(&format!("author: {author}\n"));
    }
    if let Some(description) = ctx.doc_description {
        prompt.push_str(&format!("description: {description}\n"));
    }
    if !ctx.doc_tags.is_empty() {
        prompt.push_str(&format!("tags: {}\n", ctx.doc_tags.join(", ")));
    }
    prompt.push_str("\n--- chunk ---\n");
    prompt.push_str(&chunk.text);
    prompt.push_str("\n--- surrounding context ---\n");
    prompt.push_str(context_window);
    prompt
}

const SYSTEM_PROMPT: &str = "You analyze a document chunk and return a single JSON object with keys \
summary, key_points, keywords, entities, possible_queries. Respond with JSON only.";

/// Parses the first top-level JSON object found in `text`.
fn parse_first_json_object(text: &str) -> Option<EnrichmentResult> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let ch = byte as char;
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Renders `embeddedText` from a configured subset of content flags,
/// falling back to the raw chunk text when neither summary nor key points
/// are available.
pub fn render_embedded_text(
    chunk_text: &str,
    heading_path: &str,
    ctx: &EnrichmentContext,
    result: &EnrichmentResult,
    content_flags: &[String],
    max_output_chars: usize,
) -> String {
    if result.summary.is_none() && result.key_points.is_empty() {
        return clamp(chunk_text, max_output_chars);
    }

    let mut parts = Vec::new();
    let has = |flag: &str| content_flags.iter().any(|f| f == flag);

    if has("source") {
        parts.push(format!("Source: {}", ctx.source_uri));
    }
    if has("heading_path") && !heading_path.is_empty() {
        parts.push(format!("Section: {heading_path}"));
    }
    if has("author") {
        if let Some(author) = ctx.doc_author {
            parts.push(format!("Author: {author}"));
        }
    }
    if has("description") {
        if let Some(description) = ctx.doc_description {
            parts.push(format!("Description: {description}"));
        }
    }
    if has("tags") && !ctx.doc_tags.is_empty() {
        parts.push(format!("Tags: {}", ctx.doc_tags.join(", ")));
    }
    if has("content_type") {
        parts.push(String::new());
    }
    if has("summary") {
        if let Some(summary) = &result.summary {
            parts.push(format!("Summary: {summary}"));
        }
    }
    if has("key_points") && !result.key_points.is_empty() {
        parts.push(format!("Key points: {}", result.key_points.join("; ")));
    }
    if has("keywords") && !result.keywords.is_empty() {
        parts.push(format!("Keywords: {}", result.keywords.join(", ")));
    }
    if has("entities") && !result.entities.is_empty() {
        parts.push(format!("Entities: {}", result.entities.join(", ")));
    }
    if has("possible_queries") && !result.possible_queries.is_empty() {
        parts.push(format!("Possible queries: {}", result.possible_queries.join("; ")));
    }

    parts.push(String::new());
    parts.push(chunk_text.to_string());

    clamp(&parts.join("\n"), max_output_chars)
}

fn clamp(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// Enriches one chunk, consulting the cache first. Returns the rendered
/// `embeddedText` plus the provider usage for this call, `None` on a cache
/// hit since no provider call was made.
pub async fn enrich_chunk(
    provider: &dyn LlmProvider,
    cache: &EnrichmentCache,
    config: &IngestionConfig,
    ctx: &EnrichmentContext<'_>,
    chunk: &RawChunk,
) -> Result<(String, Option<Usage>)> {
    let context_window = outward_context(ctx.full_document, chunk.start_line, chunk.end_line);
    let content_flags: Vec<&str> = config.enrichment_content_flags.iter().map(String::as_str).collect();

    let key_input = EnrichmentKeyInput {
        model: &config.enrichment_model,
        prompt_version: &config.enrichment_prompt_version,
        doc_id: Some(ctx.doc_id),
        version: Some(ctx.version),
        heading_path: &chunk.heading_path,
        content_type: content_type_name(chunk.content_type),
        language: chunk.language.as_deref(),
        raw_chunk: &chunk.text,
        outward_context: &context_window,
        content_flags: &content_flags,
    };

    if let Some(cached) = cache.get(&key_input).await {
        return Ok((cached, None));
    }

    let prompt = build_prompt(ctx, chunk, &context_window);
    let messages = vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)];
    let response = provider
        .generate(GenerationRequest {
            messages: &messages,
            temperature: Some(0.2),
            ..Default::default()
        })
        .await?;

    let parsed = parse_first_json_object(&response.text).unwrap_or_default();
    let embedded_text = render_embedded_text(
        &chunk.text,
        &chunk.heading_path,
        ctx,
        &parsed,
        &config.enrichment_content_flags,
        config.max_output_chars,
    );

    cache.set(&key_input, embedded_text.clone()).await?;
    Ok((embedded_text, response.usage))
}

/// Enriches `chunks` in batches of 5, pausing 200ms between batches and
/// checking `cancel` at every batch boundary. Returns the rendered text
/// alongside the per-chunk provider usage (`None` for cache hits).
pub async fn enrich_chunks(
    provider: Arc<dyn LlmProvider>,
    cache: &EnrichmentCache,
    config: &IngestionConfig,
    ctx: &EnrichmentContext<'_>,
    chunks: &[RawChunk],
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Vec<(String, Option<Usage>)>> {
    let mut rendered = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(5) {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        for chunk in batch {
            let entry = enrich_chunk(provider.as_ref(), cache, config, ctx, chunk).await?;
            rendered.push(entry);
        }
        if rendered.len() < chunks.len() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> RawChunk {
        RawChunk {
            chunk_index: 0,
            text: "The quick brown fox.".to_string(),
            start_char: 0,
            end_char: 20,
            start_line: 2,
            end_line: 2,
            heading_path: "Intro".to_string(),
            content_type: ContentType::Markdown,
            language: None,
        }
    }

    #[test]
    fn outward_context_clips_to_window_around_chunk() {
        let doc = "l0\nl1\nl2\nl3\nl4\nl5\nl6";
        let context = outward_context(doc, 3, 3);
        assert_eq!(context, "l1\nl2\nl3\nl4\nl5");
    }

    #[test]
    fn parses_first_json_object_ignoring_surrounding_text() {
        let text = "Here you go:\n{\"summary\": \"a fox story\", \"key_points\": [\"fast\"]}\nthanks";
        let parsed = parse_first_json_object(text).unwrap();
        assert_eq!(parsed.summary.as_deref(), Some("a fox story"));
        assert_eq!(parsed.key_points, vec!["fast".to_string()]);
    }

    #[test]
    fn render_falls_back_to_raw_chunk_when_no_summary_or_key_points() {
        let chunk = sample_chunk();
        let ctx = EnrichmentContext {
            source_uri: "file:///a.md",
            doc_id: "doc1",
            version: "1",
            doc_author: None,
            doc_description: None,
            doc_tags: &[],
            full_document: "",
        };
        let result = EnrichmentResult::default();
        let rendered = render_embedded_text(&chunk.text, &chunk.heading_path, &ctx, &result, &[], 8000);
        assert_eq!(rendered, chunk.text);
    }

    #[test]
    fn render_includes_requested_flags_only() {
        let chunk = sample_chunk();
        let ctx = EnrichmentContext {
            source_uri: "file:///a.md",
            doc_id: "doc1",
            version: "1",
            doc_author: None,
            doc_description: None,
            doc_tags: &[],
            full_document: "",
        };
        let result = EnrichmentResult {
            summary: Some("a fox story".to_string()),
            key_points: vec!["fast".to_string()],
            ..Default::default()
        };
        let flags = vec!["summary".to_string()];
        let rendered = render_embedded_text(&chunk.text, &chunk.heading_path, &ctx, &result, &flags, 8000);
        assert!(rendered.contains("Summary: a fox story"));
        assert!(!rendered.contains("Key points"));
    }

    #[test]
    fn render_clamps_to_max_output_chars() {
        let chunk = sample_chunk();
        let ctx = EnrichmentContext {
            source_uri: "file:///a.md",
            doc_id: "doc1",
            version: "1",
            doc_author: None,
            doc_description: None,
            doc_tags: &[],
            full_document: "",
        };
        let result = EnrichmentResult {
            summary: Some("s".repeat(100)),
            ..Default::default()
        };
        let flags = vec!["summary".to_string()];
        let rendered = render_embedded_text(&chunk.text, &chunk.heading_path, &ctx, &result, &flags, 10);
        assert_eq!(rendered.chars().count(), 10);
    }
}
