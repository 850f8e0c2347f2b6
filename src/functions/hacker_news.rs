//! Hacker News functions, backed by the public Firebase API.

use anyhow::Context;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ChatFunction, FunctionOutput, FunctionRegistry};

/// Most stories a single call may fetch.
const MAX_STORIES: u64 = 30;
const DEFAULT_STORIES: u64 = 10;
/// Top-level comments fetched per story.
const MAX_COMMENTS: usize = 10;
/// Characters of each comment quoted in a digest.
const COMMENT_EXCERPT_CHARS: usize = 280;

/// HN item (story or comment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descendants: Option<u64>,
    #[serde(default, skip_serializing)]
    pub kids: Vec<u64>,
    #[serde(default, skip_serializing)]
    pub deleted: bool,
    #[serde(default, skip_serializing)]
    pub dead: bool,
}

impl Item {
    fn is_visible(&self) -> bool {
        !self.deleted && !self.dead
    }
}

/// Thin client over `{base_url}/v0/...`.
#[derive(Debug, Clone)]
pub struct HackerNewsClient {
    http: reqwest::Client,
    base_url: String,
}

impl HackerNewsClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn top_story_ids(&self) -> anyhow::Result<Vec<u64>> {
        let url = format!("{}/v0/topstories.json", self.base_url);
        let ids = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<u64>>()
            .await
            .context("failed to decode top stories")?;
        Ok(ids)
    }

    /// Fetch an item; `None` when it does not exist.
    pub async fn item(&self, id: u64) -> anyhow::Result<Option<Item>> {
        let url = format!("{}/v0/item/{id}.json", self.base_url);
        let item = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Option<Item>>()
            .await
            .with_context(|| format!("failed to decode item {id}"))?;
        Ok(item)
    }

    async fn stories(&self, ids: &[u64]) -> anyhow::Result<Vec<Item>> {
        let items = try_join_all(ids.iter().map(|id| self.item(*id))).await?;
        Ok(items.into_iter().flatten().filter(Item::is_visible).collect())
    }

    async fn story_with_comments(&self, id: u64) -> anyhow::Result<(Item, Vec<Item>)> {
        let story = self
            .item(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("story {id} not found"))?;
        let kids: Vec<u64> = story.kids.iter().take(MAX_COMMENTS).copied().collect();
        let comments = self.stories(&kids).await?;
        Ok((story, comments))
    }
}

/// Plain-text digest of a story and its top comments, shown to the caller as-is.
fn digest(story: &Item, comments: &[Item]) -> String {
    let mut out = format!(
        "Top story: {}",
        story.title.as_deref().unwrap_or("(untitled)")
    );
    if let Some(by) = &story.by {
        out.push_str(&format!(" by {by}"));
    }
    if let Some(score) = story.score {
        out.push_str(&format!(" ({score} points)"));
    }
    out.push('\n');
    match &story.url {
        Some(url) => out.push_str(url),
        None => out.push_str(&format!("https://news.ycombinator.com/item?id={}", story.id)),
    }
    out.push('\n');

    if !comments.is_empty() {
        out.push_str("\nTop comments:\n");
        for comment in comments {
            let text: String = comment
                .text
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(COMMENT_EXCERPT_CHARS)
                .collect();
            out.push_str(&format!(
                "- {}: {}\n",
                comment.by.as_deref().unwrap_or("anonymous"),
                text
            ));
        }
    }
    out
}

/// Story count requested by the model, within `1..=MAX_STORIES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u64")]
pub struct StoryLimit(u64);

impl TryFrom<u64> for StoryLimit {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if (1..=MAX_STORIES).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("limit must be between 1 and {MAX_STORIES}, got {value}"))
        }
    }
}

impl Default for StoryLimit {
    fn default() -> Self {
        Self(DEFAULT_STORIES)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopStoriesArgs {
    #[serde(default)]
    limit: StoryLimit,
}

#[derive(Debug, Deserialize)]
pub struct StoryArgs {
    id: u64,
}

#[derive(Debug, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Clone)]
pub struct GetTopStories(pub HackerNewsClient);

#[async_trait]
impl ChatFunction for GetTopStories {
    type Args = TopStoriesArgs;

    fn name(&self) -> &'static str {
        "get_top_stories"
    }

    fn description(&self) -> &'static str {
        "Get the current top stories on Hacker News."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_STORIES,
                    "description": "Number of stories to return. Defaults to 10."
                }
            },
            "required": []
        })
    }

    async fn call(&self, args: TopStoriesArgs) -> anyhow::Result<FunctionOutput> {
        let ids = self.0.top_story_ids().await?;
        let ids: Vec<u64> = ids.into_iter().take(args.limit.0 as usize).collect();
        let stories = self.0.stories(&ids).await?;
        Ok(FunctionOutput::Data(json!(stories)))
    }
}

#[derive(Debug, Clone)]
pub struct GetStory(pub HackerNewsClient);

#[async_trait]
impl ChatFunction for GetStory {
    type Args = StoryArgs;

    fn name(&self) -> &'static str {
        "get_story"
    }

    fn description(&self) -> &'static str {
        "Get a Hacker News story by its ID."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "The story ID." }
            },
            "required": ["id"]
        })
    }

    async fn call(&self, args: StoryArgs) -> anyhow::Result<FunctionOutput> {
        let story = self
            .0
            .item(args.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("story {} not found", args.id))?;
        Ok(FunctionOutput::Data(json!(story)))
    }
}

#[derive(Debug, Clone)]
pub struct GetStoryWithComments(pub HackerNewsClient);

#[async_trait]
impl ChatFunction for GetStoryWithComments {
    type Args = StoryArgs;

    fn name(&self) -> &'static str {
        "get_story_with_comments"
    }

    fn description(&self) -> &'static str {
        "Get a Hacker News story by its ID, with its top comments."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "The story ID." }
            },
            "required": ["id"]
        })
    }

    async fn call(&self, args: StoryArgs) -> anyhow::Result<FunctionOutput> {
        let (story, comments) = self.0.story_with_comments(args.id).await?;
        Ok(FunctionOutput::Data(json!({ "story": story, "comments": comments })))
    }
}

#[derive(Debug, Clone)]
pub struct SummarizeTopStory(pub HackerNewsClient);

#[async_trait]
impl ChatFunction for SummarizeTopStory {
    type Args = NoArgs;

    fn name(&self) -> &'static str {
        "summarize_top_story"
    }

    fn description(&self) -> &'static str {
        "Show a short digest of the current top story on Hacker News and its top comments."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn call(&self, _args: NoArgs) -> anyhow::Result<FunctionOutput> {
        let id = *self
            .0
            .top_story_ids()
            .await?
            .first()
            .ok_or_else(|| anyhow::anyhow!("no top stories"))?;
        let (story, comments) = self.0.story_with_comments(id).await?;
        Ok(FunctionOutput::Reply(digest(&story, &comments)))
    }
}

impl FunctionRegistry {
    /// Registry with every Hacker News function.
    #[must_use]
    pub fn hacker_news(client: &HackerNewsClient) -> Self {
        Self::new()
            .with_function(GetTopStories(client.clone()))
            .with_function(GetStory(client.clone()))
            .with_function(GetStoryWithComments(client.clone()))
            .with_function(SummarizeTopStory(client.clone()))
    }
}
