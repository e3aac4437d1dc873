use std::{process, sync::Arc};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::CronStream;
use edgepurge::{
    application::{
        error::AppError,
        jobs::{PurgeJobContext, process_purge_cleanup_job, process_purge_tick_job},
        pipeline::Pipeline,
        repos::{ContentRepo, ContentWriteRepo, ItemQuery, QueueRepo},
    },
    config,
    domain::references::ContentReference,
    infra::{
        db::SqliteRepositories,
        drivers,
        error::InfraError,
        http::{self, AdminState},
        telemetry,
    },
    purge::{PurgeConfig, PurgeDriver, PurgeError, PurgeMode, ResolverConfig},
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Tick(_) => run_tick(settings).await,
        config::Command::Cleanup(_) => run_cleanup(settings).await,
        config::Command::Purge(args) => run_purge(settings, args.mode, args.target).await,
        config::Command::Queue(args) => run_queue(settings, args.command).await,
    }
}

struct ApplicationContext {
    repositories: Arc<SqliteRepositories>,
    pipeline: Arc<Pipeline>,
}

async fn init_repositories(settings: &config::Settings) -> Result<Arc<SqliteRepositories>, AppError> {
    let pool = SqliteRepositories::connect(
        &settings.database.url,
        settings.database.max_connections.get(),
    )
    .await
    .map_err(|err| AppError::from(InfraError::from(err)))?;

    SqliteRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(Arc::new(SqliteRepositories::new(pool)))
}

async fn build_application_context(
    settings: &config::Settings,
) -> Result<ApplicationContext, AppError> {
    let repositories = init_repositories(settings).await?;
    let queue_repo: Arc<dyn QueueRepo> = repositories.clone();
    let content_repo: Arc<dyn ContentRepo> = repositories.clone();

    let driver: Option<Arc<dyn PurgeDriver>> = match drivers::build_driver(&settings.driver) {
        Ok(driver) => {
            info!(
                driver = driver.descriptor().name,
                max_urls_per_batch = driver.max_urls_per_batch(),
                "purge driver ready"
            );
            Some(driver)
        }
        Err(PurgeError::NotConfigured(reason)) => {
            warn!(reason = %reason, "cache purging is not configured");
            None
        }
        Err(err) => return Err(err.into()),
    };

    let pipeline = Pipeline::new(
        &settings.site.queue_key,
        queue_repo,
        content_repo,
        ResolverConfig::from(&settings.site),
        PurgeConfig::from(&settings.purge),
        driver,
    );

    Ok(ApplicationContext {
        repositories,
        pipeline: Arc::new(pipeline),
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;

    let monitor_handle = spawn_job_monitor(app.pipeline.clone(), &settings.purge)?;

    let content: Arc<dyn ContentWriteRepo> = app.repositories.clone();
    let admin_state = AdminState {
        db: app.repositories.clone(),
        pipeline: app.pipeline.clone(),
        content,
    };
    let result = serve_admin(&settings, admin_state).await;

    monitor_handle.abort();
    if tokio::time::timeout(settings.server.graceful_shutdown, monitor_handle)
        .await
        .is_err()
    {
        warn!("job monitor did not stop within the shutdown grace period");
    }

    result
}

fn spawn_job_monitor(
    pipeline: Arc<Pipeline>,
    purge: &config::PurgeSettings,
) -> Result<tokio::task::JoinHandle<()>, AppError> {
    let tick_schedule = config::parse_schedule(&purge.tick_schedule)
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;
    let cleanup_schedule = config::parse_schedule(&purge.cleanup_schedule)
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    let context = PurgeJobContext { pipeline };

    let tick_worker = WorkerBuilder::new("purge-tick-worker")
        .data(context.clone())
        .backend(CronStream::new(tick_schedule))
        .build_fn(process_purge_tick_job);
    let cleanup_worker = WorkerBuilder::new("purge-cleanup-worker")
        .data(context)
        .backend(CronStream::new(cleanup_schedule))
        .build_fn(process_purge_cleanup_job);

    let monitor = Monitor::new().register(tick_worker).register(cleanup_worker);

    info!(
        tick = %purge.tick_schedule,
        cleanup = %purge.cleanup_schedule,
        "purge schedules registered"
    );

    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    }))
}

async fn serve_admin(settings: &config::Settings, state: AdminState) -> Result<(), AppError> {
    let router = http::build_admin_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(addr = %settings.server.admin_addr, "admin API listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn run_tick(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;
    let report = app.pipeline.consumer().tick().await?;
    print_json(&report)
}

async fn run_cleanup(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;
    let report = app.pipeline.consumer().cleanup().await?;
    print_json(&report)
}

async fn run_purge(
    settings: config::Settings,
    mode: Option<PurgeMode>,
    target: config::PurgeCommand,
) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;
    let trigger = app.pipeline.trigger();
    let reference = match target {
        config::PurgeCommand::Post { id } => ContentReference::Post(id),
        config::PurgeCommand::Term { id } => ContentReference::Term(id),
        config::PurgeCommand::Url { url } => ContentReference::Url(url),
        config::PurgeCommand::Tag { tag } => ContentReference::CacheTag(tag),
        config::PurgeCommand::All => ContentReference::All,
    };
    let outcome = trigger
        .trigger_with(reference, mode.unwrap_or(trigger.mode()))
        .await?;
    print_json(&outcome)
}

async fn run_queue(
    settings: config::Settings,
    command: config::QueueCommand,
) -> Result<(), AppError> {
    let app = build_application_context(&settings).await?;
    let pipeline = &app.pipeline;
    match command {
        config::QueueCommand::Stats { queue } => print_json(&pipeline.stats(queue).await?),
        config::QueueCommand::List {
            queue,
            state,
            limit,
            offset,
        } => {
            let query = ItemQuery {
                state,
                limit,
                offset,
            };
            print_json(&pipeline.list_items(queue, &query).await?)
        }
        config::QueueCommand::Delete { queue, ids } => {
            let deleted = pipeline.delete_items(queue, &ids).await?;
            info!(queue = pipeline.queue_name(queue), deleted, "queue items deleted");
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
        config::QueueCommand::Clear { queue } => {
            let deleted = pipeline.clear(queue).await?;
            info!(queue = pipeline.queue_name(queue), deleted, "queue cleared");
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
