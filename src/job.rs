use std::sync::Arc;
use std::time::Instant;

use crate::connectors::{find_document_type, Connector};
use crate::error::{Error, FailureKind, Result};
use crate::metrics::RunReport;
use crate::notify::HealthcheckNotifier;
use crate::sink::{DocumentWriter, SyncStateSource, WriteTarget};
use crate::storage::repository::{self, NewExtract};
use crate::storage::Database;
use crate::sync::scheduler::FailureAction;
use crate::sync::unit::{AccountSettings, SkipReason, StreamKey, SyncUnit, UnitState};
use crate::sync::{DocumentType, History, Phase, RunContext, SyncOptions, SyncProgress, SyncUnitScheduler};

/// One run of one platform: read settings, plan units, fetch each unit in
/// order and hand its rows to the sink (or the extract cache).
pub struct ConnectorSyncJob {
    connector: Arc<dyn Connector>,
    state: Arc<dyn SyncStateSource>,
    writer: DocumentWriter,
    options: SyncOptions,
    notifier: Option<HealthcheckNotifier>,
    cache: Option<Database>,
}

impl ConnectorSyncJob {
    pub fn new(
        connector: Arc<dyn Connector>,
        state: Arc<dyn SyncStateSource>,
        writer: DocumentWriter,
        options: SyncOptions,
    ) -> Self {
        Self {
            connector,
            state,
            writer,
            options,
            notifier: None,
            cache: None,
        }
    }

    pub fn with_notifier(mut self, notifier: HealthcheckNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_cache(mut self, cache: Database) -> Self {
        self.cache = Some(cache);
        self
    }

    fn platform(&self) -> &'static str {
        self.connector.platform().as_str()
    }

    /// Run every phase step and return the final report. Unit and account
    /// failures end up in the report; only setup problems are returned as
    /// errors.
    pub async fn run(&self, progress: &dyn SyncProgress) -> Result<RunReport> {
        let phase = self.options.phase;
        if phase != Phase::Full && self.cache.is_none() {
            return Err(Error::Config(format!("{phase} phase needs an extract cache")));
        }

        let ctx = RunContext::new();
        let run_id = self.start_run().await;
        log::info!("Starting {} {phase} sync", self.platform());

        match phase {
            Phase::Full | Phase::Extract => self.sync_projects(&ctx, progress).await,
            Phase::Load => self.load_pending(&ctx).await?,
        }

        let report = ctx.stats().report(self.platform(), self.options.env.as_str());
        log::info!("{}", report.message);
        if let Some(notifier) = &self.notifier {
            notifier.report(&report).await;
        }
        self.finish_run(run_id, &report).await;
        Ok(report)
    }

    async fn sync_projects(&self, ctx: &RunContext, progress: &dyn SyncProgress) {
        let settings = match self.state.account_settings().await {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to read {} settings: {e}", self.platform());
                self.record_error(ctx, 0, "settings", &e);
                if e.aborts_job() {
                    self.abort(ctx, &e, "settings").await;
                }
                return;
            }
        };

        let scheduler = SyncUnitScheduler::new(
            self.options.today(),
            self.connector.platform().timestamp_format(),
            self.options.max_lookback_days,
            self.options.bounds,
            self.options.skip_today,
        );

        for project in settings {
            if !self.options.projects.contains_project(project.project_id) {
                continue;
            }
            let accounts = if self.connector.account_scoped() {
                project.split_accounts()
            } else {
                vec![AccountSettings {
                    account_id: project.project_id.to_string(),
                    ..project.clone()
                }]
            };
            if accounts.is_empty() {
                log::warn!("Project {} has no {} account", project.project_id, self.platform());
                ctx.with_stats(|s| s.record_skip(project.project_id, "settings", "no account configured"));
                continue;
            }
            for account in &accounts {
                if ctx.is_aborted() {
                    return;
                }
                self.sync_account(&scheduler, ctx, account, progress).await;
            }
        }
    }

    async fn sync_account(
        &self,
        scheduler: &SyncUnitScheduler,
        ctx: &RunContext,
        account: &AccountSettings,
        progress: &dyn SyncProgress,
    ) {
        let project_id = account.project_id;

        let prepared = match self.connector.prepare(account).await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Project {project_id} account {}: {e}", account.account_id);
                self.record_error(ctx, project_id, "token", &e);
                if e.aborts_job() {
                    self.abort(ctx, &e, &format!("project {project_id} account {}", account.account_id))
                        .await;
                }
                return;
            }
        };
        if prepared.refreshed {
            if let Err(e) = self
                .state
                .update_access_token(project_id, prepared.token.clone())
                .await
            {
                log::error!("Failed to store refreshed token for project {project_id}: {e}");
            }
        }

        let infos = match self
            .state
            .last_sync_info(project_id, account.account_id.clone())
            .await
        {
            Ok(infos) => infos,
            Err(e) => {
                log::error!("Failed to read last sync info for project {project_id}: {e}");
                ctx.with_stats(|s| s.record_failure(project_id, "last_sync_info", &e.to_string()));
                return;
            }
        };

        let document_types = self.connector.document_types(project_id);
        let plan = scheduler.plan(account, &prepared.token, &infos, &document_types);
        for (document_type, reason) in &plan.skipped {
            if *reason == SkipReason::AlreadySynced {
                log::debug!("Project {project_id} {document_type}: already synced");
                continue;
            }
            ctx.with_stats(|s| s.record_skip(project_id, document_type, &reason.to_string()));
        }

        let total = plan.units.len();
        progress.on_account_start(project_id, &account.account_id, total);

        for (index, unit) in plan.units.iter().enumerate() {
            if ctx.is_aborted() {
                return;
            }
            progress.on_unit_start(unit, index, total);

            let Some(document_type) = find_document_type(&document_types, &unit.document_type) else {
                continue;
            };

            if let Some(reason) = scheduler.admit(unit, document_type, ctx) {
                log::info!("Skipping {unit}: {reason}");
                ctx.with_stats(|s| s.record_skip(project_id, &unit.document_type, &reason.to_string()));
                progress.on_unit_complete(unit, &UnitState::Skipped(reason));
                continue;
            }

            match self.run_unit(unit, document_type, ctx).await {
                Ok(records) => {
                    log::info!("Synced {unit}: {records} records");
                    progress.on_unit_complete(unit, &UnitState::Success { records });
                }
                Err(e) => {
                    log::error!("Failed {unit}: {e}");
                    self.record_error(ctx, project_id, &unit.document_type, &e);
                    progress.on_unit_complete(unit, &UnitState::Failed(e.to_string()));
                    if scheduler.on_failure(unit, &e, ctx) == FailureAction::AbortJob {
                        self.abort(ctx, &e, &unit.to_string()).await;
                        return;
                    }
                }
            }
        }
    }

    /// Fetch one unit and write (or cache) its rows, under the unit timeout.
    async fn run_unit(&self, unit: &SyncUnit, document_type: &DocumentType, ctx: &RunContext) -> Result<usize> {
        let limit = self.options.unit_timeout;
        let work = async {
            let started = Instant::now();
            let fetched = self.connector.fetch(unit).await?;
            let records = fetched.rows.len();
            ctx.with_stats(|s| {
                s.record_requests(
                    unit.project_id,
                    &unit.document_type,
                    fetched.request_count,
                    records as u64,
                    started.elapsed(),
                )
            });

            let timestamp = self.document_timestamp(unit, document_type);
            match (&self.cache, self.options.phase) {
                (Some(cache), Phase::Extract) => {
                    self.save_extract(cache, unit, document_type, timestamp, fetched.request_count, fetched.rows)
                        .await?;
                }
                _ => {
                    let target = WriteTarget {
                        project_id: unit.project_id,
                        account_id: unit.account_id.clone(),
                        document_type: unit.document_type.clone(),
                        id_field: document_type.id_field.to_string(),
                        timestamp,
                        platform: document_type.platform,
                    };
                    self.writer.add_all(&target, fetched.rows).await?;
                }
            }
            ctx.with_stats(|s| s.record_success(unit.project_id, &unit.account_id, &unit.document_type));
            Ok::<usize, Error>(records)
        };

        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{unit} exceeded {}s", limit.as_secs()))),
        }
    }

    /// Marker stored with each document; the next run plans from it.
    fn document_timestamp(&self, unit: &SyncUnit, document_type: &DocumentType) -> i64 {
        match document_type.history {
            History::Cursor => chrono::Utc::now().timestamp_millis(),
            _ => self.connector.platform().timestamp_format().encode(unit.to),
        }
    }

    /// Stop the run: keep the reason in the report and alert right away,
    /// since the final report may be hours later.
    async fn abort(&self, ctx: &RunContext, error: &Error, at: &str) {
        ctx.abort(&error.failure_key());
        let message = format!("{} sync aborted at {at}: {error}", self.platform());
        log::error!("{message}");
        if let Some(notifier) = &self.notifier {
            notifier.notify(self.platform(), &message).await;
        }
    }

    /// Failures are keyed by class and short reason so repeats collapse.
    fn record_error(&self, ctx: &RunContext, project_id: u64, document_type: &str, error: &Error) {
        let message = error.failure_key();
        ctx.with_stats(|s| match error.kind() {
            FailureKind::PermissionDenied => s.record_token_failure(project_id, document_type, &message),
            _ => s.record_failure(project_id, document_type, &message),
        });
    }

    // ── Extract cache ──────────────────────────────────────────────

    async fn save_extract(
        &self,
        cache: &Database,
        unit: &SyncUnit,
        document_type: &DocumentType,
        timestamp: i64,
        request_count: u64,
        rows: Vec<serde_json::Value>,
    ) -> Result<()> {
        let platform = self.platform();
        let unit = unit.clone();
        let id_field = document_type.id_field;
        cache
            .writer()
            .call(move |conn| {
                repository::save_extracted_unit(
                    conn,
                    &NewExtract {
                        platform,
                        project_id: unit.project_id,
                        account_id: &unit.account_id,
                        document_type: &unit.document_type,
                        id_field,
                        from_date: unit.from,
                        to_date: unit.to,
                        timestamp,
                        request_count,
                        rows: &rows,
                    },
                )
            })
            .await?;
        Ok(())
    }

    async fn load_pending(&self, ctx: &RunContext) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Err(Error::Config("load phase needs an extract cache".into()));
        };
        let platform = self.platform();
        let pending = cache
            .reader()
            .call(move |conn| repository::list_pending(conn, platform))
            .await?;
        log::info!("{} extracted units pending for {platform}", pending.len());

        for extract in pending {
            if ctx.is_aborted() {
                break;
            }
            if !self.options.projects.contains_project(extract.project_id) {
                continue;
            }
            let stream = StreamKey {
                project_id: extract.project_id,
                account_id: extract.account_id.clone(),
                document_type: extract.document_type.clone(),
            };
            // Later days must not advance the marker past a gap.
            if ctx.stream_failed(&stream) {
                log::info!(
                    "Skipping load of project {} {} {}: {}",
                    extract.project_id,
                    extract.document_type,
                    extract.from_date,
                    SkipReason::PriorFailure
                );
                ctx.with_stats(|s| {
                    s.record_skip(extract.project_id, &extract.document_type, &SkipReason::PriorFailure.to_string())
                });
                continue;
            }

            let platform_split = find_document_type(
                &self.connector.document_types(extract.project_id),
                &extract.document_type,
            )
            .and_then(|t| t.platform);
            let target = WriteTarget {
                project_id: extract.project_id,
                account_id: extract.account_id.clone(),
                document_type: extract.document_type.clone(),
                id_field: extract.id_field.clone(),
                timestamp: extract.timestamp,
                platform: platform_split,
            };
            let id = extract.id;
            let loaded = match self.writer.add_all(&target, extract.rows).await {
                Ok(_) => cache
                    .writer()
                    .call(move |conn| repository::mark_loaded(conn, id))
                    .await
                    .map_err(Error::from),
                Err(e) => Err(e),
            };
            match loaded {
                Ok(()) => ctx.with_stats(|s| {
                    s.record_success(extract.project_id, &extract.account_id, &extract.document_type)
                }),
                Err(e) => {
                    log::error!(
                        "Failed to load project {} {} {}: {e}",
                        extract.project_id,
                        extract.document_type,
                        extract.from_date
                    );
                    self.record_error(ctx, extract.project_id, &extract.document_type, &e);
                    ctx.mark_stream_failed(stream);
                    if e.aborts_job() {
                        let at = format!(
                            "load of project {} {} {}",
                            extract.project_id, extract.document_type, extract.from_date
                        );
                        self.abort(ctx, &e, &at).await;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Run log ────────────────────────────────────────────────────

    async fn start_run(&self) -> Option<i64> {
        let cache = self.cache.as_ref()?;
        let platform = self.platform();
        let phase = self.options.phase.to_string();
        match cache
            .writer()
            .call(move |conn| repository::insert_sync_run(conn, platform, &phase))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Failed to record sync run: {e}");
                None
            }
        }
    }

    async fn finish_run(&self, run_id: Option<i64>, report: &RunReport) {
        let (Some(cache), Some(run_id)) = (&self.cache, run_id) else {
            return;
        };
        let status = format!("{:?}", report.status).to_lowercase();
        let successes: u64 = report.success_counts.values().sum();
        let failures = report.failures.len() as u64 + report.token_failures.len() as u64;
        let message = report.message.clone();
        if let Err(e) = cache
            .writer()
            .call(move |conn| repository::finish_sync_run(conn, run_id, &status, successes, failures, Some(&message)))
            .await
        {
            log::warn!("Failed to record sync run result: {e}");
        }
    }
}
