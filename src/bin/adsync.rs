use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use adsync::auth::OAuthRefresher;
use adsync::connectors::{
    AdWordsConfig, AdWordsConnector, FacebookConfig, FacebookConnector, HubSpotConfig, HubSpotConnector,
    LinkedInConfig, LinkedInConnector, MemberCompanyStrategy,
};
use adsync::date_util::parse_yyyymmdd;
use adsync::http::{ReqwestTransport, RetryPolicy, RetryingHttpClient};
use adsync::sink::{BatchConfig, DataService, DocumentWriter, DEFAULT_BATCH_SIZE};
use adsync::sync::range::{validate_custom_range, RangeBounds, MAX_LOOKBACK_DAYS};
use adsync::sync::DEFAULT_UNIT_TIMEOUT;
use adsync::{
    AllowList, Connector, ConnectorSyncJob, Database, Environment, HealthcheckNotifier, NotifierConfig,
    OAuthSecret, Phase, RunReport, SyncOptions, SyncUnit, UnitState,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "adsync", about = "Sync ad platform and CRM documents into the data service")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    platform: PlatformCommand,
}

#[derive(Args)]
struct GlobalArgs {
    /// development, staging or production
    #[arg(long, global = true, default_value = "development")]
    env: Environment,

    /// Fetch but do not write to the data service
    #[arg(long, global = true)]
    dry: bool,

    /// Do not sync units that end today
    #[arg(long, global = true)]
    skip_today: bool,

    /// Projects to sync, "*" or comma separated ids
    #[arg(long, global = true, default_value = "*")]
    project_ids: AllowList,

    #[arg(long, global = true, default_value = "http://localhost:8089")]
    data_service_host: String,

    /// Custom backfill start (YYYYMMDD)
    #[arg(long, global = true)]
    start_timestamp: Option<String>,

    /// Custom backfill end (YYYYMMDD)
    #[arg(long, global = true)]
    end_timestamp: Option<String>,

    /// Projects written with add_batch
    #[arg(long, global = true, default_value = "")]
    batch_insert_project_ids: AllowList,

    /// Document types written with add_batch
    #[arg(long, global = true, default_value = "")]
    batch_insert_doc_types: AllowList,

    #[arg(long, global = true, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[arg(long, global = true)]
    healthcheck_ping_id: Option<String>,

    #[arg(long, global = true)]
    token_failure_ping_id: Option<String>,

    /// Alert endpoint for aborted runs
    #[arg(long, global = true)]
    notify_url: Option<String>,

    /// full, extract or load
    #[arg(long, global = true, default_value = "full")]
    phase: Phase,

    /// Extract cache path (default: ~/.adsync/extract.db)
    #[arg(long, global = true)]
    cache_db: Option<String>,

    /// Per-unit time limit in seconds
    #[arg(long, global = true)]
    unit_timeout_secs: Option<u64>,

    /// Increase logging verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum PlatformCommand {
    /// Google AdWords reports and entities
    Adwords {
        #[arg(long)]
        developer_token: String,
        /// OAuth client secret JSON, inline or a file path
        #[arg(long)]
        oauth_secret: String,
        /// Minutes a minted access token is reused
        #[arg(long, default_value_t = 45)]
        token_ttl_minutes: u64,
    },
    /// Facebook Marketing API objects and insights
    Facebook {
        /// Skip the publisher platform breakdown of insights
        #[arg(long)]
        no_publisher_breakdown: bool,
    },
    /// LinkedIn ad analytics
    Linkedin {
        #[arg(long)]
        client_id: String,
        #[arg(long)]
        client_secret: String,
        /// v1 (daily) or v2 (weekly)
        #[arg(long, default_value = "v1")]
        member_company_strategy: MemberCompanyStrategy,
        /// Weeks held back by the weekly strategy
        #[arg(long, default_value_t = 0)]
        member_company_buffer_weeks: u32,
        #[arg(long, default_value = "*")]
        member_company_project_ids: AllowList,
    },
    /// HubSpot CRM objects
    Hubspot {
        /// Projects that also sync archived contacts
        #[arg(long, default_value = "")]
        deleted_contacts_project_ids: AllowList,
    },
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl adsync::SyncProgress for StderrProgress {
    fn on_account_start(&self, project_id: u64, account_id: &str, units: usize) {
        eprintln!("Project {project_id} account {account_id}: {units} units");
    }

    fn on_unit_start(&self, unit: &SyncUnit, index: usize, total: usize) {
        eprint!("  [{}/{}] {unit}...", index + 1, total);
    }

    fn on_unit_complete(&self, _unit: &SyncUnit, state: &UnitState) {
        match state {
            UnitState::Success { records } => eprintln!(" {records} records"),
            UnitState::Failed(msg) => eprintln!(" failed: {msg}"),
            UnitState::Skipped(reason) => eprintln!(" skipped ({reason})"),
            UnitState::Pending | UnitState::Running => eprintln!(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let global = &cli.global;

    let level = match global.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let options = sync_options(global)?;
    let transport = Arc::new(ReqwestTransport::new(HTTP_TIMEOUT)?);
    let client = RetryingHttpClient::new(transport, RetryPolicy::default());

    let connector = build_connector(&cli.platform, &client)?;
    let platform = connector.platform();

    let data_service = Arc::new(DataService::new(
        client.clone(),
        &global.data_service_host,
        platform.as_str(),
        global.dry,
    )?);
    let batch = BatchConfig::new(
        global.batch_size,
        global.batch_insert_project_ids.clone(),
        global.batch_insert_doc_types.clone(),
    );
    let writer = DocumentWriter::new(data_service.clone(), batch);
    let notifier = HealthcheckNotifier::new(
        &client,
        NotifierConfig {
            env: global.env,
            ping_id: global.healthcheck_ping_id.clone(),
            token_failure_ping_id: global.token_failure_ping_id.clone(),
            notify_url: global.notify_url.clone(),
            ..Default::default()
        },
    );

    let mut job = ConnectorSyncJob::new(connector, data_service, writer, options.clone()).with_notifier(notifier);
    if options.phase != Phase::Full || global.cache_db.is_some() {
        let cache = match &global.cache_db {
            Some(path) => Database::open_at(path).await?,
            None => Database::open().await?,
        };
        job = job.with_cache(cache);
    }

    let report = job.run(&StderrProgress).await?;
    print_report(&report);
    // Partial failures and rate-limit aborts still exit 0.
    Ok(())
}

fn sync_options(global: &GlobalArgs) -> anyhow::Result<SyncOptions> {
    let bounds = RangeBounds {
        start: global
            .start_timestamp
            .as_deref()
            .map(parse_yyyymmdd)
            .transpose()?,
        end: global.end_timestamp.as_deref().map(parse_yyyymmdd).transpose()?,
    };
    let options = SyncOptions {
        env: global.env,
        dry_run: global.dry,
        skip_today: global.skip_today,
        projects: global.project_ids.clone(),
        max_lookback_days: MAX_LOOKBACK_DAYS,
        bounds,
        unit_timeout: global
            .unit_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UNIT_TIMEOUT),
        phase: global.phase,
        today: None,
    };
    validate_custom_range(bounds, options.today(), options.max_lookback_days)?;
    Ok(options)
}

fn build_connector(command: &PlatformCommand, client: &RetryingHttpClient) -> anyhow::Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match command {
        PlatformCommand::Adwords {
            developer_token,
            oauth_secret,
            token_ttl_minutes,
        } => {
            if developer_token.trim().is_empty() {
                anyhow::bail!("--developer-token must not be empty");
            }
            let secret = read_oauth_secret(oauth_secret)?;
            let refresher = OAuthRefresher::google(client.clone(), &secret.client_id, &secret.client_secret);
            let mut config = AdWordsConfig::new(developer_token.as_str());
            config.token_ttl = Duration::from_secs(*token_ttl_minutes * 60);
            Arc::new(AdWordsConnector::new(client.clone(), Arc::new(refresher), config))
        }
        PlatformCommand::Facebook {
            no_publisher_breakdown,
        } => Arc::new(FacebookConnector::new(
            client.clone(),
            FacebookConfig {
                publisher_breakdown: !no_publisher_breakdown,
                ..Default::default()
            },
        )),
        PlatformCommand::Linkedin {
            client_id,
            client_secret,
            member_company_strategy,
            member_company_buffer_weeks,
            member_company_project_ids,
        } => {
            if client_id.trim().is_empty() || client_secret.trim().is_empty() {
                anyhow::bail!("--client-id and --client-secret are required");
            }
            let refresher = OAuthRefresher::linkedin(client.clone(), client_id, client_secret);
            Arc::new(LinkedInConnector::new(
                client.clone(),
                Arc::new(refresher),
                LinkedInConfig {
                    member_company_strategy: *member_company_strategy,
                    member_company_buffer_weeks: *member_company_buffer_weeks,
                    member_company_projects: member_company_project_ids.clone(),
                    ..Default::default()
                },
            ))
        }
        PlatformCommand::Hubspot {
            deleted_contacts_project_ids,
        } => Arc::new(HubSpotConnector::new(
            client.clone(),
            HubSpotConfig {
                deleted_contacts_projects: deleted_contacts_project_ids.clone(),
                ..Default::default()
            },
        )),
    };
    Ok(connector)
}

fn read_oauth_secret(value: &str) -> anyhow::Result<OAuthSecret> {
    let json = if value.trim_start().starts_with('{') {
        value.to_string()
    } else {
        std::fs::read_to_string(value).with_context(|| format!("reading OAuth secret from {value}"))?
    };
    Ok(OAuthSecret::parse(&json)?)
}

fn print_report(report: &RunReport) {
    println!("Sync: {} ({})", report.platform, report.env);
    println!("  Status:    {:?}", report.status);
    println!("  Message:   {}", report.message);
    let successes: u64 = report.success_counts.values().sum();
    println!("  Succeeded: {successes} units");
    for (document_type, count) in &report.success_counts {
        println!("    {document_type}: {count}");
    }
    if !report.failures.is_empty() {
        println!("  Failures:  {}", report.failures.len());
    }
    if !report.token_failures.is_empty() {
        println!("  Token failures: {}", report.token_failures.len());
    }
    if let Some(reason) = &report.aborted {
        println!("  Aborted:   {reason}");
    }
}
