//! Answer generation from fused results.
//!
//! [`TemplateGenerator`] renders results as a numbered list and needs
//! nothing external. [`OpenAIChatGenerator`] asks a chat-completions model
//! to phrase the answer, with the results and the conversation so far as
//! context. Either way the results themselves are returned to the caller
//! unchanged; the generator only writes prose.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::GeneratorConfig;
use crate::models::{ConversationTurn, Role, SearchResult};

/// Everything a generator may look at for one turn.
#[derive(Debug, Clone, Copy)]
pub struct AnswerContext<'a> {
    pub query: &'a str,
    /// Prior turns, oldest first; does not include `query`.
    pub history: &'a [ConversationTurn],
    pub results: &'a [SearchResult],
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, ctx: &AnswerContext<'_>) -> Result<String>;
}

pub const NO_RESULTS_ANSWER: &str = "I couldn't find any views, workbooks or datasources matching your query. \
Try rephrasing your question or naming a project.";

/// Numbered, human-readable listing of `results`.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return NO_RESULTS_ANSWER.to_string();
    }

    let mut out = format!(
        "I found {} object(s) that match your query:\n",
        results.len()
    );
    for r in results {
        let o = &r.object;
        let _ = writeln!(out, "\n{}. **{}** ({})", r.rank, o.title, o.object_type);
        if !o.project_name.is_empty() {
            let _ = writeln!(out, "   Project: {}", o.project_name);
        }
        if !o.url.is_empty() {
            let _ = writeln!(out, "   Link: {}", o.url);
        }
        let _ = writeln!(out, "   Relevance: {:.1}%", r.fused_score * 100.0);
    }
    out.trim_end().to_string()
}

/// Offline generator; always succeeds.
pub struct TemplateGenerator;

#[async_trait]
impl AnswerGenerator for TemplateGenerator {
    fn name(&self) -> &str {
        "template"
    }

    async fn generate(&self, ctx: &AnswerContext<'_>) -> Result<String> {
        let mut answer = format_results(ctx.results);
        match ctx.results.len() {
            0 => {}
            1 => answer.push_str("\n\nAsk me for similar objects or more details about this one."),
            _ => answer.push_str(
                "\n\nYou can narrow these down by project or object type.",
            ),
        }
        Ok(answer)
    }
}

const SYSTEM_PROMPT: &str = "You help people find dashboards, workbooks and datasources. \
Answer using only the search results provided. Mention titles and links exactly as given. \
If the results do not answer the question, say so briefly.";

/// Chat-completions generator over the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIChatGenerator {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChatGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
            api_key,
            client,
        })
    }

    fn messages(ctx: &AnswerContext<'_>) -> Vec<serde_json::Value> {
        let mut messages = vec![serde_json::json!({"role": "system", "content": SYSTEM_PROMPT})];
        for turn in ctx.history {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": turn.content}));
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": format!("{}\n\nSearch results:\n{}", ctx.query, format_results(ctx.results)),
        }));
        messages
    }
}

#[async_trait]
impl AnswerGenerator for OpenAIChatGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, ctx: &AnswerContext<'_>) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": Self::messages(ctx),
            "temperature": 0.1,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() && status.as_u16() != 429 {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }
        // 429 and 5xx surface as reqwest errors, which are retried
        let json: serde_json::Value = response.error_for_status()?.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
}

/// | Config Value | Generator |
/// |-------------|-----------|
/// | `"template"` | [`TemplateGenerator`] |
/// | `"openai"` | [`OpenAIChatGenerator`] |
pub fn create_generator(config: &GeneratorConfig) -> Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "template" => Ok(Arc::new(TemplateGenerator)),
        "openai" => Ok(Arc::new(OpenAIChatGenerator::new(config)?)),
        other => bail!("Unknown generator provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObjectRef, ObjectType};
    use chrono::Utc;

    fn result(rank: usize, title: &str, score: f64) -> SearchResult {
        SearchResult {
            object: ObjectRef {
                site_id: "s1".into(),
                object_type: ObjectType::Workbook,
                object_id: format!("w{}", rank),
                title: title.into(),
                url: format!("https://bi.example.test/w{}", rank),
                project_name: "Finance".into(),
                updated_at: Utc::now(),
            },
            lexical_score: score,
            semantic_score: score,
            fused_score: score,
            rank,
        }
    }

    #[test]
    fn test_format_results_lists_each_hit() {
        let text = format_results(&[result(1, "Q3 Sales Dashboard", 0.875), result(2, "Margins", 0.5)]);
        assert!(text.starts_with("I found 2 object(s)"));
        assert!(text.contains("1. **Q3 Sales Dashboard** (workbook)"));
        assert!(text.contains("Project: Finance"));
        assert!(text.contains("Link: https://bi.example.test/w1"));
        assert!(text.contains("Relevance: 87.5%"));
    }

    #[test]
    fn test_format_results_empty() {
        assert_eq!(format_results(&[]), NO_RESULTS_ANSWER);
    }

    #[tokio::test]
    async fn test_template_generator() {
        let results = [result(1, "Q3 Sales Dashboard", 1.0)];
        let ctx = AnswerContext {
            query: "sales dashboard",
            history: &[],
            results: &results,
        };
        let answer = TemplateGenerator.generate(&ctx).await.unwrap();
        assert!(answer.contains("Q3 Sales Dashboard"));
        assert!(answer.ends_with("more details about this one."));
    }

    #[test]
    fn test_chat_messages_carry_history_and_results() {
        let history = [
            ConversationTurn::user("where is churn"),
            ConversationTurn::assistant("Churn lives in Retention."),
        ];
        let results = [result(1, "Churn Cohorts", 0.9)];
        let ctx = AnswerContext {
            query: "and by region?",
            history: &history,
            results: &results,
        };
        let messages = OpenAIChatGenerator::messages(&ctx);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        let last = messages[3]["content"].as_str().unwrap();
        assert!(last.starts_with("and by region?"));
        assert!(last.contains("Churn Cohorts"));
    }

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({"choices": [{"message": {"content": " Try Finance. "}}]});
        assert_eq!(parse_chat_response(&json).unwrap(), "Try Finance.");
        assert!(parse_chat_response(&serde_json::json!({"choices": []})).is_err());
    }
}
