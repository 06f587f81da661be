use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{EnvLookup, FileConfig, MigrationConfig, env_value_u64, env_value_usize};
use crate::pagination::collect_all;

/// Backlog caps `count` at 100 for issue listings.
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MARKDOWN_FORMATTING_RULE: &str = "markdown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub text_formatting_rule: String,
    pub markdown_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueSummary {
    pub id: i64,
    pub key: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub id: i64,
    pub key: String,
    pub summary: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiSummary {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiPage {
    pub id: i64,
    pub name: String,
    pub content: String,
}

/// Remote capabilities the migration needs from a Backlog space.
pub trait BacklogApi {
    fn get_project(&mut self, project_key: &str) -> Result<ProjectSummary>;
    /// One page of issue summaries, oldest first.
    fn issue_page(
        &mut self,
        project_id: i64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<IssueSummary>>;
    fn get_issue(&mut self, issue_id: i64) -> Result<Issue>;
    fn update_issue_description(&mut self, issue_id: i64, description: &str) -> Result<()>;
    fn list_wikis(&mut self, project_id: i64) -> Result<Vec<WikiSummary>>;
    fn get_wiki(&mut self, wiki_id: i64) -> Result<WikiPage>;
    fn update_wiki_content(&mut self, wiki_id: i64, content: &str) -> Result<()>;
    fn request_count(&self) -> usize;

    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }

    /// Every issue in the project, regardless of the remote page limit.
    fn list_issues(&mut self, project_id: i64) -> Result<Vec<IssueSummary>> {
        let page_size = self.page_size();
        let issues = collect_all(page_size, |offset, count| {
            debug!(project_id, offset, count, "fetching issue page");
            self.issue_page(project_id, offset, count)
        })?;
        info!(project_id, total = issues.len(), "listed issues");
        Ok(issues)
    }
}

#[derive(Debug, Clone)]
pub struct BacklogClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub page_size: usize,
    pub read_interval_ms: u64,
}

impl BacklogClientConfig {
    /// env > config file > built-in defaults.
    pub fn resolve(config: &MigrationConfig, file: &FileConfig, env: &EnvLookup) -> Self {
        Self {
            base_url: config.base_url(),
            api_key: config.api_key.clone(),
            user_agent: file.user_agent(env),
            timeout_ms: env_value_u64(env, "BACKLOG_HTTP_TIMEOUT_MS")
                .or(file.http.timeout_ms)
                .unwrap_or(30_000),
            page_size: env_value_usize(env, "BACKLOG_PAGE_SIZE")
                .or(file.http.page_size)
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, DEFAULT_PAGE_SIZE),
            read_interval_ms: env_value_u64(env, "BACKLOG_READ_INTERVAL_MS")
                .or(file.http.read_interval_ms)
                .unwrap_or(1_000),
        }
    }
}

pub struct BacklogClient {
    client: Client,
    config: BacklogClientConfig,
    last_listing_at: Option<Instant>,
    request_count: usize,
}

impl BacklogClient {
    pub fn new(config: BacklogClientConfig) -> Result<Self> {
        Url::parse(&config.base_url)
            .with_context(|| format!("invalid Backlog base URL: {}", config.base_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Backlog HTTP client")?;

        Ok(Self {
            client,
            config,
            last_listing_at: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        api_url(&self.config.base_url, path)
    }

    fn request_json_get(
        &mut self,
        path: &str,
        params: &[(&str, String)],
        paced: bool,
    ) -> Result<Value> {
        let url = self.endpoint(path)?;
        self.apply_rate_limit(paced);
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&[("apiKey", self.config.api_key.as_str())])
            .query(params)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to call Backlog API GET {path}"))?;
        decode_response(response)
    }

    fn request_json_patch(&mut self, path: &str, form: &[(&str, &str)]) -> Result<Value> {
        let url = self.endpoint(path)?;
        self.apply_rate_limit(false);
        let response = self
            .client
            .patch(url)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&[("apiKey", self.config.api_key.as_str())])
            .form(form)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to call Backlog API PATCH {path}"))?;
        decode_response(response)
    }

    /// Listing pages are spaced at least `read_interval_ms` apart.
    fn apply_rate_limit(&mut self, paced: bool) {
        if paced {
            let delay = Duration::from_millis(self.config.read_interval_ms);
            if let Some(last) = self.last_listing_at {
                let elapsed = last.elapsed();
                if elapsed < delay {
                    sleep(delay - elapsed);
                }
            }
            self.last_listing_at = Some(Instant::now());
        }
        self.request_count += 1;
    }
}

impl BacklogApi for BacklogClient {
    fn get_project(&mut self, project_key: &str) -> Result<ProjectSummary> {
        debug!(project_key, "fetching project");
        let response = self.request_json_get(&format!("projects/{project_key}"), &[], false)?;
        let payload: ProjectPayload =
            serde_json::from_value(response).context("failed to decode project response")?;
        Ok(payload.into())
    }

    fn issue_page(
        &mut self,
        project_id: i64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<IssueSummary>> {
        let response = self.request_json_get(
            "issues",
            &[
                ("projectId[]", project_id.to_string()),
                ("offset", offset.to_string()),
                ("count", count.to_string()),
                ("sort", "created".to_string()),
                ("order", "asc".to_string()),
            ],
            true,
        )?;
        let payload: Vec<IssuePayload> =
            serde_json::from_value(response).context("failed to decode issue list response")?;
        Ok(payload
            .into_iter()
            .map(|issue| IssueSummary {
                id: issue.id,
                key: issue.issue_key,
                summary: issue.summary.unwrap_or_default(),
            })
            .collect())
    }

    fn get_issue(&mut self, issue_id: i64) -> Result<Issue> {
        debug!(issue_id, "fetching issue");
        let response = self.request_json_get(&format!("issues/{issue_id}"), &[], false)?;
        let payload: IssuePayload =
            serde_json::from_value(response).context("failed to decode issue response")?;
        Ok(payload.into())
    }

    fn update_issue_description(&mut self, issue_id: i64, description: &str) -> Result<()> {
        debug!(issue_id, "updating issue description");
        self.request_json_patch(
            &format!("issues/{issue_id}"),
            &[("description", description)],
        )?;
        Ok(())
    }

    fn list_wikis(&mut self, project_id: i64) -> Result<Vec<WikiSummary>> {
        debug!(project_id, "fetching wiki list");
        let response = self.request_json_get(
            "wikis",
            &[("projectIdOrKey", project_id.to_string())],
            true,
        )?;
        let payload: Vec<WikiPayload> =
            serde_json::from_value(response).context("failed to decode wiki list response")?;
        info!(project_id, total = payload.len(), "listed wikis");
        Ok(payload
            .into_iter()
            .map(|wiki| WikiSummary {
                id: wiki.id,
                name: wiki.name,
            })
            .collect())
    }

    fn get_wiki(&mut self, wiki_id: i64) -> Result<WikiPage> {
        debug!(wiki_id, "fetching wiki");
        let response = self.request_json_get(&format!("wikis/{wiki_id}"), &[], false)?;
        let payload: WikiPayload =
            serde_json::from_value(response).context("failed to decode wiki response")?;
        Ok(payload.into())
    }

    fn update_wiki_content(&mut self, wiki_id: i64, content: &str) -> Result<()> {
        debug!(wiki_id, "updating wiki content");
        self.request_json_patch(&format!("wikis/{wiki_id}"), &[("content", content)])?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }
}

fn api_url(base_url: &str, path: &str) -> Result<Url> {
    let base =
        Url::parse(base_url).with_context(|| format!("invalid Backlog base URL: {base_url}"))?;
    base.join(&format!("api/v2/{}", path.trim_start_matches('/')))
        .with_context(|| format!("invalid Backlog API path: {path}"))
}

fn decode_response(response: Response) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .map_err(reqwest::Error::without_url)
        .context("failed to read Backlog API response body")?;
    if !status.is_success() {
        bail!("{}", describe_api_error(status, &body));
    }
    serde_json::from_str(&body).context("failed to decode Backlog API JSON response")
}

fn describe_api_error(status: StatusCode, body: &str) -> String {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).unwrap_or_default();
    let Some(first) = envelope.errors.into_iter().next() else {
        return format!("Backlog API request failed with HTTP {status}");
    };
    let code = first
        .code
        .map(|code| code.to_string())
        .unwrap_or_else(|| status.as_u16().to_string());
    let message = first
        .message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| "unknown error".to_string());
    match first.more_info.filter(|info| !info.trim().is_empty()) {
        Some(info) => format!("Backlog API error [{code}] (HTTP {status}): {message} ({info})"),
        None => format!("Backlog API error [{code}] (HTTP {status}): {message}"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectPayload {
    id: i64,
    project_key: String,
    name: String,
    text_formatting_rule: Option<String>,
}

impl From<ProjectPayload> for ProjectSummary {
    fn from(payload: ProjectPayload) -> Self {
        let text_formatting_rule = payload.text_formatting_rule.unwrap_or_default();
        Self {
            markdown_enabled: text_formatting_rule == MARKDOWN_FORMATTING_RULE,
            id: payload.id,
            key: payload.project_key,
            name: payload.name,
            text_formatting_rule,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuePayload {
    id: i64,
    issue_key: String,
    summary: Option<String>,
    description: Option<String>,
}

impl From<IssuePayload> for Issue {
    fn from(payload: IssuePayload) -> Self {
        Self {
            id: payload.id,
            key: payload.issue_key,
            summary: payload.summary.unwrap_or_default(),
            description: payload.description.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WikiPayload {
    id: i64,
    name: String,
    content: Option<String>,
}

impl From<WikiPayload> for WikiPage {
    fn from(payload: WikiPayload) -> Self {
        Self {
            id: payload.id,
            name: payload.name,
            content: payload.content.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorItem {
    message: Option<String>,
    code: Option<i64>,
    more_info: Option<String>,
}
