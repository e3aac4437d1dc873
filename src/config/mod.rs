//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use apalis_cron::Schedule;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    CliArgs, Command, DatabaseOverride, LoggingOverrides, PurgeArgs, PurgeCommand, QueueArgs,
    QueueCommand, RunArgs, ServeArgs, ServeOverrides,
};

use crate::{
    infra::drivers::cloudflare::DEFAULT_API_BASE,
    purge::{DEFAULT_MAX_ARCHIVE_PAGES, DEFAULT_PERMALINK_TEMPLATE, DEFAULT_POSTS_PER_PAGE, PurgeMode},
    queue::{DEFAULT_FLAG_BATCH, DEFAULT_MAX_ATTEMPTS},
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "edgepurge";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 3101;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DATABASE_URL: &str = "sqlite://edgepurge.db";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_QUEUE_KEY: &str = "site";
const DEFAULT_OBJECT_BATCH_SIZE: u32 = 100;
const DEFAULT_URL_BATCH_SIZE: u32 = 500;
const DEFAULT_RESERVATION_TIMEOUT_SECS: i64 = 15 * 60;
const DEFAULT_RETENTION_DAYS: i64 = 7;
const DEFAULT_TICK_SCHEDULE: &str = "0 * * * * *";
const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 3 * * Sun";
const DEFAULT_DRIVER_TIMEOUT_SECS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub site: SiteSettings,
    pub purge: PurgeSettings,
    pub driver: DriverSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub url: Url,
    /// Namespace of the two purge queues: `{queue_key}_purge_objects|urls`.
    pub queue_key: String,
    pub permalink_template: String,
    pub posts_per_page: NonZeroU32,
    pub max_archive_pages: u32,
    pub front_page_post_types: Vec<String>,
    pub feeds: bool,
    pub term_extra_paths: Vec<String>,
    pub cache_tag_prefix: Option<String>,
    pub multisite_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub mode: PurgeMode,
    pub object_batch_size: NonZeroU32,
    pub url_batch_size: NonZeroU32,
    pub drain_limit: Option<u32>,
    pub batch_size_cap: Option<NonZeroUsize>,
    pub max_attempts: i32,
    pub flag_batch_size: NonZeroU32,
    pub reservation_timeout_secs: i64,
    pub retention_days: i64,
    pub tick_schedule: String,
    pub cleanup_schedule: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Cloudflare,
    Http,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// `None` leaves purging unconfigured.
    pub kind: Option<DriverKind>,
    pub timeout: Duration,
    pub cloudflare: CloudflareSettings,
    pub http: HttpDriverSettings,
}

#[derive(Debug, Clone)]
pub struct CloudflareSettings {
    pub api_base: Url,
    pub zone_id: Option<String>,
    pub api_token: Option<String>,
    pub email: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpDriverSettings {
    pub endpoint: Option<Url>,
    pub token: Option<String>,
    pub purge_all_prefixes: Vec<String>,
    pub max_urls_per_batch: Option<usize>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("EDGEPURGE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("site.front_page_post_types")
            .with_list_parse_key("site.term_extra_paths")
            .with_list_parse_key("driver.http.purge_all_prefixes")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Tick(args)) | Some(Command::Cleanup(args)) => raw.apply_run_overrides(args),
        Some(Command::Purge(args)) => {
            raw.apply_database_override(&args.database);
            if let Some(mode) = args.mode {
                raw.purge.mode = Some(mode);
            }
        }
        Some(Command::Queue(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    site: RawSiteSettings,
    purge: RawPurgeSettings,
    driver: RawDriverSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_database_override(&overrides.database);
        self.apply_logging_overrides(&overrides.logging);
        if let Some(host) = overrides.admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(schedule) = overrides.tick_schedule.as_ref() {
            self.purge.tick_schedule = Some(schedule.clone());
        }
    }

    fn apply_run_overrides(&mut self, overrides: &RunArgs) {
        self.apply_database_override(&overrides.database);
        self.apply_logging_overrides(&overrides.logging);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            site,
            purge,
            driver,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            site: build_site_settings(site)?,
            purge: build_purge_settings(purge)?,
            driver: build_driver_settings(driver)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_empty(database.url).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    if !url.starts_with("sqlite:") {
        return Err(LoadError::invalid(
            "database.url",
            format!("expected a sqlite: URL, got `{url}`"),
        ));
    }

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let raw_url = non_empty(site.url)
        .ok_or_else(|| LoadError::invalid("site.url", "the public site URL must be set"))?;
    let url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("site.url", format!("`{raw_url}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid("site.url", "scheme must be http or https"));
    }

    let queue_key = non_empty(site.queue_key).unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string());
    if !queue_key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LoadError::invalid(
            "site.queue_key",
            "only ASCII letters, digits, `_` and `-` are allowed",
        ));
    }

    let permalink_template = non_empty(site.permalink_template)
        .unwrap_or_else(|| DEFAULT_PERMALINK_TEMPLATE.to_string());
    if !permalink_template.contains("{slug}") && !permalink_template.contains("{id}") {
        return Err(LoadError::invalid(
            "site.permalink_template",
            "must contain `{slug}` or `{id}`",
        ));
    }

    let posts_per_page = non_zero_u32(
        site.posts_per_page.unwrap_or(DEFAULT_POSTS_PER_PAGE).into(),
        "site.posts_per_page",
    )?;

    let front_page_post_types = site
        .front_page_post_types
        .unwrap_or_else(|| vec!["post".to_string()]);

    Ok(SiteSettings {
        url,
        queue_key,
        permalink_template,
        posts_per_page,
        max_archive_pages: site.max_archive_pages.unwrap_or(DEFAULT_MAX_ARCHIVE_PAGES),
        front_page_post_types,
        feeds: site.feeds.unwrap_or(true),
        term_extra_paths: site.term_extra_paths.unwrap_or_default(),
        cache_tag_prefix: non_empty(site.cache_tag_prefix),
        multisite_id: non_empty(site.multisite_id),
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let max_attempts = purge.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts < 1 {
        return Err(LoadError::invalid(
            "purge.max_attempts",
            "must be at least one",
        ));
    }

    let reservation_timeout_secs = purge
        .reservation_timeout_seconds
        .unwrap_or(DEFAULT_RESERVATION_TIMEOUT_SECS);
    if reservation_timeout_secs <= 0 {
        return Err(LoadError::invalid(
            "purge.reservation_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let retention_days = purge.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
    if retention_days <= 0 {
        return Err(LoadError::invalid(
            "purge.retention_days",
            "must be greater than zero",
        ));
    }

    let batch_size_cap = match purge.batch_size_cap {
        Some(cap) => Some(
            NonZeroUsize::new(cap)
                .ok_or_else(|| LoadError::invalid("purge.batch_size_cap", "must be greater than zero"))?,
        ),
        None => None,
    };

    let tick_schedule = cron_schedule(purge.tick_schedule, DEFAULT_TICK_SCHEDULE, "purge.tick_schedule")?;
    let cleanup_schedule = cron_schedule(
        purge.cleanup_schedule,
        DEFAULT_CLEANUP_SCHEDULE,
        "purge.cleanup_schedule",
    )?;

    Ok(PurgeSettings {
        mode: purge.mode.unwrap_or_default(),
        object_batch_size: non_zero_u32(
            purge
                .object_batch_size
                .unwrap_or(DEFAULT_OBJECT_BATCH_SIZE)
                .into(),
            "purge.object_batch_size",
        )?,
        url_batch_size: non_zero_u32(
            purge.url_batch_size.unwrap_or(DEFAULT_URL_BATCH_SIZE).into(),
            "purge.url_batch_size",
        )?,
        drain_limit: purge.drain_limit,
        batch_size_cap,
        max_attempts,
        flag_batch_size: non_zero_u32(
            purge.flag_batch_size.unwrap_or(DEFAULT_FLAG_BATCH).into(),
            "purge.flag_batch_size",
        )?,
        reservation_timeout_secs,
        retention_days,
        tick_schedule,
        cleanup_schedule,
    })
}

fn build_driver_settings(driver: RawDriverSettings) -> Result<DriverSettings, LoadError> {
    let timeout_secs = driver.timeout_seconds.unwrap_or(DEFAULT_DRIVER_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "driver.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let api_base = non_empty(driver.cloudflare.api_base)
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let api_base = Url::parse(&api_base)
        .map_err(|err| LoadError::invalid("driver.cloudflare.api_base", err.to_string()))?;

    let endpoint = match non_empty(driver.http.endpoint) {
        Some(value) => Some(
            Url::parse(&value)
                .map_err(|err| LoadError::invalid("driver.http.endpoint", err.to_string()))?,
        ),
        None => None,
    };

    if driver.http.max_urls_per_batch == Some(0) {
        return Err(LoadError::invalid(
            "driver.http.max_urls_per_batch",
            "must be greater than zero",
        ));
    }

    Ok(DriverSettings {
        kind: driver.name,
        timeout: Duration::from_secs(timeout_secs),
        cloudflare: CloudflareSettings {
            api_base,
            zone_id: non_empty(driver.cloudflare.zone_id),
            api_token: non_empty(driver.cloudflare.api_token),
            email: non_empty(driver.cloudflare.email),
            api_key: non_empty(driver.cloudflare.api_key),
        },
        http: HttpDriverSettings {
            endpoint,
            token: non_empty(driver.http.token),
            purge_all_prefixes: driver.http.purge_all_prefixes.unwrap_or_default(),
            max_urls_per_batch: driver.http.max_urls_per_batch,
        },
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    admin_host: Option<String>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    url: Option<String>,
    queue_key: Option<String>,
    permalink_template: Option<String>,
    posts_per_page: Option<u32>,
    max_archive_pages: Option<u32>,
    front_page_post_types: Option<Vec<String>>,
    feeds: Option<bool>,
    term_extra_paths: Option<Vec<String>>,
    cache_tag_prefix: Option<String>,
    multisite_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    mode: Option<PurgeMode>,
    object_batch_size: Option<u32>,
    url_batch_size: Option<u32>,
    drain_limit: Option<u32>,
    batch_size_cap: Option<usize>,
    max_attempts: Option<i32>,
    flag_batch_size: Option<u32>,
    reservation_timeout_seconds: Option<i64>,
    retention_days: Option<i64>,
    tick_schedule: Option<String>,
    cleanup_schedule: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDriverSettings {
    name: Option<DriverKind>,
    timeout_seconds: Option<u64>,
    cloudflare: RawCloudflareSettings,
    http: RawHttpDriverSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCloudflareSettings {
    api_base: Option<String>,
    zone_id: Option<String>,
    api_token: Option<String>,
    email: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpDriverSettings {
    endpoint: Option<String>,
    token: Option<String>,
    purge_all_prefixes: Option<Vec<String>>,
    max_urls_per_batch: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn cron_schedule(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let expression = non_empty(value).unwrap_or_else(|| default.to_string());
    Schedule::from_str(&expression)
        .map_err(|err| LoadError::invalid(key, format!("`{expression}`: {err}")))?;
    Ok(expression)
}

/// Parse a cron expression that already passed validation at load time.
pub fn parse_schedule(expression: &str) -> Result<Schedule, LoadError> {
    Schedule::from_str(expression)
        .map_err(|err| LoadError::invalid("purge.schedule", format!("`{expression}`: {err}")))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
