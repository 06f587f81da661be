use std::fmt;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{error, info};

use crate::backlog::{BacklogApi, Issue, IssueSummary, ProjectSummary, WikiPage, WikiSummary};
use crate::headers::normalize_headers;

/// Default pause after each successful persist.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Issue,
    Wiki,
}

impl ItemKind {
    pub const ALL: [ItemKind; 2] = [ItemKind::Issue, ItemKind::Wiki];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Wiki => "wiki",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::Issue => "issues",
            Self::Wiki => "wikis",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Execute,
}

impl RunMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { Self::DryRun } else { Self::Execute }
    }

    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub mode: RunMode,
    /// Minimum gap after each successful persist. Zero disables pacing.
    pub write_interval: Duration,
    /// Blocks for `write_interval`; `thread::sleep` outside tests.
    pub pause: fn(Duration),
}

impl MigrationOptions {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            write_interval: DEFAULT_WRITE_INTERVAL,
            pause: sleep,
        }
    }

    pub fn with_write_interval(mut self, write_interval: Duration) -> Self {
        self.write_interval = write_interval;
        self
    }

    pub fn with_pause(mut self, pause: fn(Duration)) -> Self {
        self.pause = pause;
        self
    }
}

/// Lightweight handle for one item of a collection listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub id: i64,
    pub display_key: String,
    pub title: String,
}

impl From<IssueSummary> for ItemRef {
    fn from(issue: IssueSummary) -> Self {
        Self {
            id: issue.id,
            display_key: issue.key,
            title: issue.summary,
        }
    }
}

impl From<WikiSummary> for ItemRef {
    fn from(wiki: WikiSummary) -> Self {
        Self {
            id: wiki.id,
            title: wiki.name.clone(),
            display_key: wiki.name,
        }
    }
}

/// Full record whose body gets normalized: an issue description or a wiki page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub id: i64,
    pub display_key: String,
    pub body: String,
}

impl From<Issue> for ContentItem {
    fn from(issue: Issue) -> Self {
        Self {
            id: issue.id,
            display_key: issue.key,
            body: issue.description,
        }
    }
}

impl From<WikiPage> for ContentItem {
    fn from(wiki: WikiPage) -> Self {
        Self {
            id: wiki.id,
            display_key: wiki.name,
            body: wiki.content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ItemOutcome {
    Unchanged,
    WouldUpdate { change_count: usize },
    Updated { change_count: usize },
    Failed { error: String },
}

impl ItemOutcome {
    pub fn change_count(&self) -> Option<usize> {
        match self {
            Self::WouldUpdate { change_count } | Self::Updated { change_count } => {
                Some(*change_count)
            }
            Self::Unchanged | Self::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub total: usize,
    pub updated: usize,
    pub errors: usize,
}

impl ProcessingStats {
    /// Fold one item outcome into the running counters.
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Unchanged => {}
            ItemOutcome::WouldUpdate { .. } | ItemOutcome::Updated { .. } => self.updated += 1,
            ItemOutcome::Failed { .. } => self.errors += 1,
        }
    }

    pub fn merge(&mut self, other: &ProcessingStats) {
        self.total += other.total;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub id: i64,
    pub display_key: String,
    pub title: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub kind: ItemKind,
    pub mode: RunMode,
    pub stats: ProcessingStats,
    /// Items that need, or received, a fix plus failures, in listing order.
    pub items: Vec<ItemResult>,
}

impl BatchReport {
    pub fn pending(&self) -> impl Iterator<Item = &ItemResult> {
        self.items
            .iter()
            .filter(|item| item.outcome.change_count().is_some())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ItemOutcome::Failed { .. }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub project: ProjectSummary,
    pub mode: RunMode,
    pub batches: Vec<BatchReport>,
    pub request_count: usize,
}

impl MigrationReport {
    pub fn totals(&self) -> ProcessingStats {
        let mut totals = ProcessingStats::default();
        for batch in &self.batches {
            totals.merge(&batch.stats);
        }
        totals
    }

    pub fn batch(&self, kind: ItemKind) -> Option<&BatchReport> {
        self.batches.iter().find(|batch| batch.kind == kind)
    }
}

/// Hooks for rendering batch progress; every method defaults to a no-op.
pub trait BatchProgress {
    fn start(&mut self, _kind: ItemKind, _total: usize) {}
    fn advance(&mut self, _result: &ItemResult) {}
    fn finish(&mut self, _kind: ItemKind, _stats: &ProcessingStats) {}
}

pub struct NoProgress;

impl BatchProgress for NoProgress {}

/// Fetch the project and refuse to continue unless it is Markdown-formatted.
pub fn resolve_project<A: BacklogApi + ?Sized>(
    api: &mut A,
    project_key: &str,
) -> Result<ProjectSummary> {
    let project = api
        .get_project(project_key)
        .with_context(|| format!("failed to get project {project_key}"))?;
    if !project.markdown_enabled {
        bail!(
            "project {} does not use markdown formatting (uses: {})",
            project.key,
            if project.text_formatting_rule.is_empty() {
                "unknown"
            } else {
                project.text_formatting_rule.as_str()
            }
        );
    }
    info!(
        project = %project.key,
        project_id = project.id,
        "project validated: {} uses markdown",
        project.name
    );
    Ok(project)
}

/// Validate the project, then run one batch per requested kind in order.
pub fn run_migration<A: BacklogApi + ?Sized>(
    api: &mut A,
    project_key: &str,
    kinds: &[ItemKind],
    options: &MigrationOptions,
    progress: &mut dyn BatchProgress,
) -> Result<MigrationReport> {
    let project = resolve_project(api, project_key)?;
    info!(
        project = %project.key,
        dry_run = options.mode.is_dry_run(),
        "starting header migration"
    );

    let mut batches = Vec::with_capacity(kinds.len());
    for kind in kinds {
        batches.push(run_batch(api, project.id, *kind, options, progress)?);
    }

    let report = MigrationReport {
        project,
        mode: options.mode,
        batches,
        request_count: api.request_count(),
    };
    let totals = report.totals();
    info!(
        total = totals.total,
        updated = totals.updated,
        errors = totals.errors,
        "migration finished"
    );
    Ok(report)
}

/// One sequential pass over every item of `kind` in the project.
///
/// Listing failures abort the batch. Anything that goes wrong for a single
/// item is recorded as [`ItemOutcome::Failed`] and the pass moves on.
pub fn run_batch<A: BacklogApi + ?Sized>(
    api: &mut A,
    project_id: i64,
    kind: ItemKind,
    options: &MigrationOptions,
    progress: &mut dyn BatchProgress,
) -> Result<BatchReport> {
    let listing = list_items(api, project_id, kind)
        .with_context(|| format!("failed to list {} for project {project_id}", kind.plural()))?;

    let mut report = BatchReport {
        kind,
        mode: options.mode,
        stats: ProcessingStats {
            total: listing.len(),
            ..ProcessingStats::default()
        },
        items: Vec::new(),
    };
    if listing.is_empty() {
        info!(kind = %kind, "no {} found in the project", kind.plural());
        return Ok(report);
    }

    progress.start(kind, listing.len());
    for item in listing {
        let outcome = process_item(api, kind, &item, options);
        report.stats.record(&outcome);
        let result = ItemResult {
            id: item.id,
            display_key: item.display_key,
            title: item.title,
            outcome,
        };
        progress.advance(&result);
        if result.outcome != ItemOutcome::Unchanged {
            report.items.push(result);
        }
    }
    progress.finish(kind, &report.stats);

    info!(
        kind = %kind,
        total = report.stats.total,
        updated = report.stats.updated,
        errors = report.stats.errors,
        "{} batch finished",
        kind
    );
    Ok(report)
}

fn list_items<A: BacklogApi + ?Sized>(
    api: &mut A,
    project_id: i64,
    kind: ItemKind,
) -> Result<Vec<ItemRef>> {
    Ok(match kind {
        ItemKind::Issue => api
            .list_issues(project_id)?
            .into_iter()
            .map(ItemRef::from)
            .collect(),
        ItemKind::Wiki => api
            .list_wikis(project_id)?
            .into_iter()
            .map(ItemRef::from)
            .collect(),
    })
}

fn process_item<A: BacklogApi + ?Sized>(
    api: &mut A,
    kind: ItemKind,
    item: &ItemRef,
    options: &MigrationOptions,
) -> ItemOutcome {
    match try_process_item(api, kind, item, options) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(
                kind = %kind,
                key = %item.display_key,
                "error processing {kind} {}: {err:#}",
                item.display_key
            );
            ItemOutcome::Failed {
                error: format!("{err:#}"),
            }
        }
    }
}

fn try_process_item<A: BacklogApi + ?Sized>(
    api: &mut A,
    kind: ItemKind,
    item: &ItemRef,
    options: &MigrationOptions,
) -> Result<ItemOutcome> {
    let content = fetch_item(api, kind, item.id)?;
    let fix = normalize_headers(&content.body);
    if !fix.changed {
        return Ok(ItemOutcome::Unchanged);
    }

    match options.mode {
        RunMode::DryRun => {
            info!(
                kind = %kind,
                key = %content.display_key,
                "{} header(s) need fixing",
                fix.change_count
            );
            Ok(ItemOutcome::WouldUpdate {
                change_count: fix.change_count,
            })
        }
        RunMode::Execute => {
            persist_item(api, kind, item.id, &fix.content)?;
            info!(
                kind = %kind,
                key = %content.display_key,
                "fixed {} header(s)",
                fix.change_count
            );
            if !options.write_interval.is_zero() {
                (options.pause)(options.write_interval);
            }
            Ok(ItemOutcome::Updated {
                change_count: fix.change_count,
            })
        }
    }
}

fn fetch_item<A: BacklogApi + ?Sized>(
    api: &mut A,
    kind: ItemKind,
    id: i64,
) -> Result<ContentItem> {
    match kind {
        ItemKind::Issue => api
            .get_issue(id)
            .map(ContentItem::from)
            .with_context(|| format!("failed to get issue {id}")),
        ItemKind::Wiki => api
            .get_wiki(id)
            .map(ContentItem::from)
            .with_context(|| format!("failed to get wiki {id}")),
    }
}

fn persist_item<A: BacklogApi + ?Sized>(
    api: &mut A,
    kind: ItemKind,
    id: i64,
    body: &str,
) -> Result<()> {
    match kind {
        ItemKind::Issue => api
            .update_issue_description(id, body)
            .with_context(|| format!("failed to update issue {id}")),
        ItemKind::Wiki => api
            .update_wiki_content(id, body)
            .with_context(|| format!("failed to update wiki {id}")),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use anyhow::bail;

    use super::{
        BatchProgress, ItemKind, ItemOutcome, ItemResult, MigrationOptions, NoProgress,
        ProcessingStats, RunMode, resolve_project, run_batch, run_migration,
    };
    use crate::backlog::{
        BacklogApi, Issue, IssueSummary, ProjectSummary, WikiPage, WikiSummary,
    };

    struct MockApi {
        project: ProjectSummary,
        issues: Vec<Issue>,
        wikis: Vec<WikiPage>,
        page_size: usize,
        failing_reads: BTreeSet<i64>,
        failing_writes: BTreeSet<i64>,
        failing_listing: bool,
        issue_updates: Vec<(i64, String)>,
        wiki_updates: Vec<(i64, String)>,
        calls: Vec<String>,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                project: ProjectSummary {
                    id: 7,
                    key: "DEMO".to_string(),
                    name: "Demo".to_string(),
                    text_formatting_rule: "markdown".to_string(),
                    markdown_enabled: true,
                },
                issues: Vec::new(),
                wikis: Vec::new(),
                page_size: 2,
                failing_reads: BTreeSet::new(),
                failing_writes: BTreeSet::new(),
                failing_listing: false,
                issue_updates: Vec::new(),
                wiki_updates: Vec::new(),
                calls: Vec::new(),
            }
        }

        fn with_issues(mut self, bodies: &[&str]) -> Self {
            self.issues = bodies
                .iter()
                .enumerate()
                .map(|(index, body)| issue(index as i64 + 1, body))
                .collect();
            self
        }
    }

    fn issue(id: i64, description: &str) -> Issue {
        Issue {
            id,
            key: format!("DEMO-{id}"),
            summary: format!("issue {id}"),
            description: description.to_string(),
        }
    }

    fn wiki(id: i64, name: &str, content: &str) -> WikiPage {
        WikiPage {
            id,
            name: name.to_string(),
            content: content.to_string(),
        }
    }

    impl BacklogApi for MockApi {
        fn get_project(&mut self, project_key: &str) -> anyhow::Result<ProjectSummary> {
            self.calls.push(format!("project {project_key}"));
            if project_key != self.project.key {
                bail!("No project.");
            }
            Ok(self.project.clone())
        }

        fn issue_page(
            &mut self,
            _project_id: i64,
            offset: usize,
            count: usize,
        ) -> anyhow::Result<Vec<IssueSummary>> {
            self.calls.push(format!("issue_page {offset}"));
            if self.failing_listing {
                bail!("listing unavailable");
            }
            Ok(self
                .issues
                .iter()
                .skip(offset)
                .take(count)
                .map(|issue| IssueSummary {
                    id: issue.id,
                    key: issue.key.clone(),
                    summary: issue.summary.clone(),
                })
                .collect())
        }

        fn get_issue(&mut self, issue_id: i64) -> anyhow::Result<Issue> {
            self.calls.push(format!("get_issue {issue_id}"));
            if self.failing_reads.contains(&issue_id) {
                bail!("read failed for {issue_id}");
            }
            self.issues
                .iter()
                .find(|issue| issue.id == issue_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing issue {issue_id}"))
        }

        fn update_issue_description(
            &mut self,
            issue_id: i64,
            description: &str,
        ) -> anyhow::Result<()> {
            self.calls.push(format!("update_issue {issue_id}"));
            if self.failing_writes.contains(&issue_id) {
                bail!("write rejected for {issue_id}");
            }
            if let Some(issue) = self.issues.iter_mut().find(|issue| issue.id == issue_id) {
                issue.description = description.to_string();
            }
            self.issue_updates.push((issue_id, description.to_string()));
            Ok(())
        }

        fn list_wikis(&mut self, _project_id: i64) -> anyhow::Result<Vec<WikiSummary>> {
            self.calls.push("list_wikis".to_string());
            Ok(self
                .wikis
                .iter()
                .map(|wiki| WikiSummary {
                    id: wiki.id,
                    name: wiki.name.clone(),
                })
                .collect())
        }

        fn get_wiki(&mut self, wiki_id: i64) -> anyhow::Result<WikiPage> {
            self.calls.push(format!("get_wiki {wiki_id}"));
            if self.failing_reads.contains(&wiki_id) {
                bail!("read failed for {wiki_id}");
            }
            self.wikis
                .iter()
                .find(|wiki| wiki.id == wiki_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing wiki {wiki_id}"))
        }

        fn update_wiki_content(&mut self, wiki_id: i64, content: &str) -> anyhow::Result<()> {
            self.calls.push(format!("update_wiki {wiki_id}"));
            if self.failing_writes.contains(&wiki_id) {
                bail!("write rejected for {wiki_id}");
            }
            if let Some(wiki) = self.wikis.iter_mut().find(|wiki| wiki.id == wiki_id) {
                wiki.content = content.to_string();
            }
            self.wiki_updates.push((wiki_id, content.to_string()));
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.calls.len()
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    fn execute() -> MigrationOptions {
        MigrationOptions::new(RunMode::Execute).with_write_interval(Duration::ZERO)
    }

    fn dry_run() -> MigrationOptions {
        MigrationOptions::new(RunMode::DryRun).with_write_interval(Duration::ZERO)
    }

    #[derive(Default)]
    struct RecordingProgress {
        started: Vec<(ItemKind, usize)>,
        advanced: Vec<String>,
        finished: Vec<(ItemKind, ProcessingStats)>,
    }

    impl BatchProgress for RecordingProgress {
        fn start(&mut self, kind: ItemKind, total: usize) {
            self.started.push((kind, total));
        }

        fn advance(&mut self, result: &ItemResult) {
            self.advanced.push(result.display_key.clone());
        }

        fn finish(&mut self, kind: ItemKind, stats: &ProcessingStats) {
            self.finished.push((kind, *stats));
        }
    }

    #[test]
    fn execute_isolates_failures_and_persists_only_changed_items() {
        let mut api = MockApi::new().with_issues(&["# fine", "##Broken\nbody", "#Also"]);
        api.failing_reads.insert(3);

        let report = run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect("batch");

        assert_eq!(
            report.stats,
            ProcessingStats {
                total: 3,
                updated: 1,
                errors: 1
            }
        );
        assert_eq!(
            api.issue_updates,
            vec![(2, "## Broken\nbody".to_string())]
        );
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.items[0].display_key, "DEMO-2");
        assert_eq!(
            report.items[0].outcome,
            ItemOutcome::Updated { change_count: 1 }
        );
        assert!(matches!(
            report.items[1].outcome,
            ItemOutcome::Failed { ref error } if error.contains("read failed for 3")
        ));
    }

    #[test]
    fn dry_run_matches_execute_counts_without_persisting() {
        let bodies = ["#One", "plain", "##Two\n###Three", ""];
        let mut preview_api = MockApi::new().with_issues(&bodies);
        let mut execute_api = MockApi::new().with_issues(&bodies);

        let preview = run_batch(&mut preview_api, 7, ItemKind::Issue, &dry_run(), &mut NoProgress)
            .expect("dry run");
        let applied = run_batch(&mut execute_api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect("execute");

        assert_eq!(preview.stats.total, applied.stats.total);
        assert_eq!(preview.stats.updated, applied.stats.updated);
        assert_eq!(preview.stats.updated, 2);
        assert!(preview_api.issue_updates.is_empty());
        assert_eq!(execute_api.issue_updates.len(), 2);
        assert_eq!(
            preview.pending().filter_map(|item| item.outcome.change_count()).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(preview
            .items
            .iter()
            .all(|item| matches!(item.outcome, ItemOutcome::WouldUpdate { .. })));
    }

    #[test]
    fn empty_collection_returns_zero_stats_without_item_calls() {
        let mut api = MockApi::new();
        let mut progress = RecordingProgress::default();

        let report =
            run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut progress).expect("batch");

        assert_eq!(report.stats, ProcessingStats::default());
        assert_eq!(api.calls, vec!["issue_page 0".to_string()]);
        assert!(progress.started.is_empty());
    }

    #[test]
    fn listing_spans_every_page() {
        let bodies = ["#a", "b", "#c", "d", "#e"];
        let mut api = MockApi::new().with_issues(&bodies);

        let report = run_batch(&mut api, 7, ItemKind::Issue, &dry_run(), &mut NoProgress)
            .expect("batch");

        assert_eq!(report.stats.total, 5);
        assert_eq!(report.stats.updated, 3);
        let pages = api
            .calls
            .iter()
            .filter(|call| call.starts_with("issue_page"))
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(pages, vec!["issue_page 0", "issue_page 2", "issue_page 4"]);
    }

    #[test]
    fn persist_failure_counts_as_error_and_batch_continues() {
        let mut api = MockApi::new().with_issues(&["#a", "#b", "#c"]);
        api.failing_writes.insert(2);

        let report = run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect("batch");

        assert_eq!(report.stats.updated, 2);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(
            api.issue_updates
                .iter()
                .map(|(id, _)| *id)
                .collect::<Vec<_>>(),
            vec![1, 3]
        );
        let failure = report.failures().next().expect("failure recorded");
        assert_eq!(failure.display_key, "DEMO-2");
    }

    #[test]
    fn listing_failure_aborts_batch() {
        let mut api = MockApi::new().with_issues(&["#a"]);
        api.failing_listing = true;

        let error = run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect_err("must fail");
        assert!(error.to_string().contains("failed to list issues"));
        assert!(api.issue_updates.is_empty());
    }

    #[test]
    fn wiki_batch_updates_page_content() {
        let mut api = MockApi::new();
        api.wikis = vec![
            wiki(11, "Home", "#Welcome\ntext"),
            wiki(12, "Notes", "## Ok"),
        ];

        let report =
            run_batch(&mut api, 7, ItemKind::Wiki, &execute(), &mut NoProgress).expect("batch");

        assert_eq!(
            report.stats,
            ProcessingStats {
                total: 2,
                updated: 1,
                errors: 0
            }
        );
        assert_eq!(
            api.wiki_updates,
            vec![(11, "# Welcome\ntext".to_string())]
        );
        assert_eq!(report.items[0].display_key, "Home");
    }

    #[test]
    fn rerun_after_execute_finds_nothing_left() {
        let mut api = MockApi::new().with_issues(&["#a", "#b\n##c"]);
        api.failing_writes.insert(1);

        let first = run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect("first run");
        assert_eq!(first.stats.updated, 1);
        assert_eq!(first.stats.errors, 1);

        api.failing_writes.clear();
        let second = run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect("second run");
        assert_eq!(second.stats.updated, 1);
        assert_eq!(second.items[0].id, 1);

        let third = run_batch(&mut api, 7, ItemKind::Issue, &execute(), &mut NoProgress)
            .expect("third run");
        assert_eq!(third.stats.updated, 0);
        assert!(third.items.is_empty());
    }

    #[test]
    fn progress_sees_every_item() {
        let mut api = MockApi::new().with_issues(&["#a", "b", "c"]);
        let mut progress = RecordingProgress::default();

        let report =
            run_batch(&mut api, 7, ItemKind::Issue, &dry_run(), &mut progress).expect("batch");

        assert_eq!(progress.started, vec![(ItemKind::Issue, 3)]);
        assert_eq!(progress.advanced, vec!["DEMO-1", "DEMO-2", "DEMO-3"]);
        assert_eq!(progress.finished, vec![(ItemKind::Issue, report.stats)]);
    }

    thread_local! {
        static PAUSES: RefCell<Vec<Duration>> = const { RefCell::new(Vec::new()) };
    }

    fn record_pause(interval: Duration) {
        PAUSES.with(|pauses| pauses.borrow_mut().push(interval));
    }

    fn take_pauses() -> Vec<Duration> {
        PAUSES.with(|pauses| pauses.borrow_mut().drain(..).collect())
    }

    #[test]
    fn write_interval_applies_only_after_persist() {
        let mut api = MockApi::new().with_issues(&["#a", "b", "#c", "#d"]);
        api.failing_writes.insert(4);
        let interval = Duration::from_millis(15);
        let options = MigrationOptions::new(RunMode::Execute)
            .with_write_interval(interval)
            .with_pause(record_pause);

        let report =
            run_batch(&mut api, 7, ItemKind::Issue, &options, &mut NoProgress).expect("batch");
        assert_eq!(report.stats.updated, 2);
        assert_eq!(report.stats.errors, 1);
        // Unchanged "b" and the rejected write for "#d" get no pause.
        assert_eq!(take_pauses(), vec![interval, interval]);

        let mut preview_api = MockApi::new().with_issues(&["#a", "#b"]);
        let preview = MigrationOptions::new(RunMode::DryRun)
            .with_write_interval(Duration::from_secs(30))
            .with_pause(record_pause);
        run_batch(&mut preview_api, 7, ItemKind::Issue, &preview, &mut NoProgress)
            .expect("dry run");
        assert!(take_pauses().is_empty());
    }

    #[test]
    fn zero_write_interval_skips_the_pause() {
        let mut api = MockApi::new().with_issues(&["#a", "#b"]);
        let options = MigrationOptions::new(RunMode::Execute)
            .with_write_interval(Duration::ZERO)
            .with_pause(record_pause);

        run_batch(&mut api, 7, ItemKind::Issue, &options, &mut NoProgress).expect("batch");
        assert_eq!(api.issue_updates.len(), 2);
        assert!(take_pauses().is_empty());
    }

    #[test]
    fn non_markdown_project_is_fatal() {
        let mut api = MockApi::new().with_issues(&["#a"]);
        api.project.text_formatting_rule = "backlog".to_string();
        api.project.markdown_enabled = false;

        let error = run_migration(&mut api, "DEMO", &ItemKind::ALL, &execute(), &mut NoProgress)
            .expect_err("must fail");
        assert!(error.to_string().contains("does not use markdown"));
        assert_eq!(api.calls, vec!["project DEMO".to_string()]);
    }

    #[test]
    fn unknown_project_is_fatal() {
        let mut api = MockApi::new();
        let error = resolve_project(&mut api, "NOPE").expect_err("must fail");
        assert!(error.to_string().contains("failed to get project NOPE"));
    }

    #[test]
    fn migration_runs_issues_then_wikis_and_totals() {
        let mut api = MockApi::new().with_issues(&["#a", "b"]);
        api.wikis = vec![wiki(21, "Home", "##x"), wiki(22, "Broken", "#y")];
        api.failing_reads.insert(22);

        let report = run_migration(&mut api, "DEMO", &ItemKind::ALL, &dry_run(), &mut NoProgress)
            .expect("migration");

        assert_eq!(report.project.key, "DEMO");
        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.batches[0].kind, ItemKind::Issue);
        assert_eq!(report.batches[1].kind, ItemKind::Wiki);
        assert_eq!(
            report.totals(),
            ProcessingStats {
                total: 4,
                updated: 2,
                errors: 1
            }
        );
        assert_eq!(
            report.batch(ItemKind::Wiki).expect("wiki batch").stats.errors,
            1
        );
        assert_eq!(report.request_count, api.calls.len());
        assert!(api.issue_updates.is_empty());
        assert!(api.wiki_updates.is_empty());
    }

    #[test]
    fn migration_can_skip_a_kind() {
        let mut api = MockApi::new().with_issues(&["#a"]);
        api.wikis = vec![wiki(21, "Home", "##x")];

        let report = run_migration(
            &mut api,
            "DEMO",
            &[ItemKind::Wiki],
            &execute(),
            &mut NoProgress,
        )
        .expect("migration");

        assert_eq!(report.batches.len(), 1);
        assert!(api.issue_updates.is_empty());
        assert_eq!(api.wiki_updates.len(), 1);
    }
}
