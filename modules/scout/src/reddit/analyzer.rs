//! Claude-backed analyzer: matches a thread against a profile's relevancy
//! filter and extracts the requested properties as structured output.

use std::collections::HashMap;
use std::sync::Arc;

use ai_client::{AiError, Claude};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use scout_common::{Detection, ProfileSettings, Result, ScoutError};

use super::{Comment, Thread};
use crate::store::RequestsLog;

#[async_trait]
pub trait ThreadAnalyzer: Send + Sync {
    async fn analyze(&self, thread: &Thread, settings: &ProfileSettings) -> Result<Detection>;
}

const SYSTEM_PROMPT: &str = r#"You are a data extraction specialist experienced in filtering forum posts and extracting information from them.

You are given a forum post with its comments, a relevancy filter, and a list of properties to extract, all inside one JSON object:

{
    "post": {
        "title": "Post title",
        "body": "Post body",
        "score": 42,
        "link": "Link attached to the post"
    },
    "comments": [
        { "comment": "Comment text", "score": 7 }
    ],
    "relevancy_filter": "Description of what makes a post relevant",
    "extracted_properties": {
        "property_name": "Definition of the property to extract"
    }
}

The relevancy filter describes the context, objectives and requirements a post must satisfy to be considered relevant. Match the post against it. For every entry of extracted_properties, extract the corresponding information from the post; rely on the property's definition, not its name. Report a property as null when the post does not contain it.

Record your result with the provided tool, setting is_relevant and one value per requested property."#;

const TOOL_NAME: &str = "record_analysis";
const TOOL_DESCRIPTION: &str =
    "Record whether the post matches the relevancy filter and the extracted property values.";

#[derive(Debug, Serialize)]
struct InputPost<'a> {
    title: &'a str,
    body: &'a str,
    score: i32,
    link: &'a str,
}

#[derive(Debug, Serialize)]
struct InputComment<'a> {
    comment: &'a str,
    score: i32,
}

#[derive(Debug, Serialize)]
struct InputObject<'a> {
    post: InputPost<'a>,
    comments: Vec<InputComment<'a>>,
    relevancy_filter: &'a str,
    extracted_properties: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AnalysisOutput {
    is_relevant: bool,
    #[serde(default)]
    properties: HashMap<String, Option<String>>,
}

pub struct ClaudeAnalyzer {
    claude: Claude,
    max_comments: usize,
    requests_log: Arc<dyn RequestsLog>,
}

impl ClaudeAnalyzer {
    pub fn new(claude: Claude, max_comments: usize, requests_log: Arc<dyn RequestsLog>) -> Self {
        Self {
            claude,
            max_comments,
            requests_log,
        }
    }

    /// Top-level comments by descending score, capped at `max_comments`.
    fn select_comments<'a>(&self, comments: &'a [Comment]) -> Vec<&'a Comment> {
        let mut sorted: Vec<&Comment> = comments.iter().collect();
        sorted.sort_by(|a, b| b.score.cmp(&a.score));
        sorted.truncate(self.max_comments);
        sorted
    }

    fn build_input<'a>(&self, thread: &'a Thread, settings: &'a ProfileSettings) -> InputObject<'a> {
        InputObject {
            post: InputPost {
                title: &thread.post.title,
                body: &thread.post.body,
                score: thread.post.score,
                link: &thread.post.url,
            },
            comments: self
                .select_comments(&thread.comments)
                .into_iter()
                .map(|comment| InputComment {
                    comment: &comment.body,
                    score: comment.score,
                })
                .collect(),
            relevancy_filter: &settings.relevancy_filter,
            extracted_properties: &settings.extracted_properties,
        }
    }

    /// Tool input schema: is_relevant plus one nullable string per requested
    /// property, all required.
    fn response_schema(extracted_properties: &HashMap<String, String>) -> serde_json::Value {
        let mut property_schemas = serde_json::Map::new();
        let mut required: Vec<&String> = extracted_properties.keys().collect();
        required.sort();

        for (name, definition) in extracted_properties {
            property_schemas.insert(
                name.clone(),
                serde_json::json!({
                    "type": ["string", "null"],
                    "description": definition,
                }),
            );
        }

        serde_json::json!({
            "type": "object",
            "properties": {
                "is_relevant": { "type": "boolean" },
                "properties": {
                    "type": "object",
                    "properties": property_schemas,
                    "required": required,
                    "additionalProperties": false,
                },
            },
            "required": ["is_relevant", "properties"],
        })
    }
}

#[async_trait]
impl ThreadAnalyzer for ClaudeAnalyzer {
    async fn analyze(&self, thread: &Thread, settings: &ProfileSettings) -> Result<Detection> {
        let input = self.build_input(thread, settings);
        let input_json = serde_json::to_value(&input)
            .map_err(|err| ScoutError::Other(anyhow::anyhow!("serialize analyzer input: {err}")))?;
        let user_prompt = input_json.to_string();

        let schema = Self::response_schema(&settings.extracted_properties);

        let extraction = self
            .claude
            .extract(SYSTEM_PROMPT, &user_prompt, TOOL_NAME, TOOL_DESCRIPTION, schema)
            .await
            .map_err(|err| match err {
                AiError::Http(_) | AiError::Api { .. } => {
                    ScoutError::AnalyzerUnavailable(err.to_string())
                }
                AiError::EmptyResponse | AiError::NoStructuredOutput => {
                    ScoutError::AnalyzerEmptyResponse
                }
            })?;

        if let Err(err) = self
            .requests_log
            .save("analyze", input_json, extraction.value.clone())
            .await
        {
            warn!(post_id = thread.id(), error = %err, "failed to save request log");
        }

        let output: AnalysisOutput = serde_json::from_value(extraction.value)
            .map_err(|err| ScoutError::AnalyzerBadShape(err.to_string()))?;

        Ok(Detection {
            is_relevant: output.is_relevant,
            properties: output.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NoopRequestsLog;

    fn analyzer(max_comments: usize) -> ClaudeAnalyzer {
        ClaudeAnalyzer::new(
            Claude::new("sk-ant-test", "claude-sonnet-4-5-20250929"),
            max_comments,
            Arc::new(NoopRequestsLog),
        )
    }

    fn comment(id: &str, score: i32) -> Comment {
        Comment {
            id: id.to_string(),
            body: format!("comment {id}"),
            author: String::new(),
            score,
            created_at: None,
            replies: Vec::new(),
        }
    }

    #[test]
    fn comments_are_sorted_by_score_and_truncated() {
        let analyzer = analyzer(2);
        let comments = vec![comment("low", 1), comment("high", 10), comment("mid", 5)];

        let selected = analyzer.select_comments(&comments);
        let ids: Vec<&str> = selected.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
    }

    #[test]
    fn schema_has_one_nullable_string_per_property() {
        let mut properties = HashMap::new();
        properties.insert("summary".to_string(), "One-line summary".to_string());
        properties.insert("project_url".to_string(), "Linked project".to_string());

        let schema = ClaudeAnalyzer::response_schema(&properties);

        let inner = &schema["properties"]["properties"];
        assert_eq!(
            inner["properties"]["summary"]["type"],
            serde_json::json!(["string", "null"])
        );
        assert_eq!(
            inner["required"],
            serde_json::json!(["project_url", "summary"])
        );
        assert_eq!(
            schema["required"],
            serde_json::json!(["is_relevant", "properties"])
        );
    }

    #[test]
    fn output_parses_null_properties() {
        let output: AnalysisOutput = serde_json::from_value(serde_json::json!({
            "is_relevant": true,
            "properties": {"summary": "a post", "project_url": null}
        }))
        .unwrap();

        assert!(output.is_relevant);
        assert_eq!(
            output.properties.get("summary"),
            Some(&Some("a post".to_string()))
        );
        assert_eq!(output.properties.get("project_url"), Some(&None));
    }
}
