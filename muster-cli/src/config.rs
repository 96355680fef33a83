use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use muster::core::{DateTime, Uuid};
use muster::runner::reaper::ReaperOptions;
use muster::runner::worker::WorkerOptions;
use std::time::Duration;

/// Longest lease a worker may request, one year.
pub const MAX_LEASE_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(name = "muster", version, about = "Operate a muster job queue on PostgreSQL")]
pub struct Cli {
    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "MUSTER_LOG_FORMAT",
        global = true
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply pending migrations
    Migrate(DatabaseArgs),

    /// Insert a job
    Enqueue(EnqueueArgs),

    /// Print job counts per status
    Stats {
        #[command(flatten)]
        database: DatabaseArgs,

        /// Only count job types starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Print one job as JSON
    Job {
        #[command(flatten)]
        database: DatabaseArgs,

        id: Uuid,
    },

    /// Recover jobs whose lease expired
    Reap(ReapArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "MUSTER_DATABASE_URL")]
    pub database_url: String,

    /// Upper bound on pooled connections
    #[arg(long, default_value_t = 10, env = "MUSTER_MAX_CONNECTIONS")]
    pub max_connections: u32,
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Dot-delimited job type, e.g. memory.ingest
    pub job_type: String,

    /// JSON payload
    #[arg(value_parser = parse_json_payload)]
    pub payload: serde_json::Value,

    /// Lower runs first
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i32,

    /// RFC 3339 timestamp before which the job is not claimed
    #[arg(long)]
    pub run_at: Option<DateTime>,

    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct ReapArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Run a single pass and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Seconds between passes
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_secs: u64,

    /// Jobs recovered per pass
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
}

impl ReapArgs {
    pub fn reaper_options(&self) -> ReaperOptions {
        ReaperOptions::default()
            .with_interval(Duration::from_secs(self.interval_secs))
            .with_batch_size(self.batch_size)
    }
}

/// Settings for a worker process, read once at startup.
///
/// Embed it in an application's own clap parser with `#[command(flatten)]`.
#[derive(Args, Debug, Clone)]
pub struct WorkerConfig {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Job type prefix this process serves, e.g. `memory.`
    #[arg(long, env = "MUSTER_TYPE_PREFIX")]
    pub type_prefix: String,

    #[arg(long, default_value_t = 1500, env = "MUSTER_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Claim lease in seconds; heartbeats renew it every third of that
    #[arg(
        long,
        default_value_t = 300,
        env = "MUSTER_LEASE_SECS",
        value_parser = clap::value_parser!(u64).range(1..=MAX_LEASE_SECS)
    )]
    pub lease_secs: u64,

    /// Worker loops to run concurrently
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub reaper_interval_secs: u64,
}

fn parse_json_payload(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

impl WorkerConfig {
    pub fn worker_options(&self) -> anyhow::Result<WorkerOptions> {
        anyhow::ensure!(
            (1..=MAX_LEASE_SECS).contains(&self.lease_secs),
            "lease_secs must be between 1 and {MAX_LEASE_SECS}, got {}",
            self.lease_secs
        );
        let lease = i64::try_from(self.lease_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .context("lease_secs out of range")?;
        Ok(WorkerOptions::new(self.type_prefix.clone())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_lease_duration(lease))
    }

    pub fn reaper_options(&self) -> ReaperOptions {
        ReaperOptions::default().with_interval(Duration::from_secs(self.reaper_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    struct WorkerCli {
        #[command(flatten)]
        config: WorkerConfig,
    }

    #[test]
    fn worker_config_defaults() {
        let cli = WorkerCli::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/muster",
            "--type-prefix",
            "memory.",
        ])
        .unwrap();

        assert_eq!(cli.config.database.max_connections, 10);
        assert_eq!(cli.config.poll_interval_ms, 1500);
        assert_eq!(cli.config.workers, 1);

        let options = cli.config.worker_options().unwrap();
        assert_eq!(options.type_prefix, "memory.");
        assert_eq!(options.poll_interval, Duration::from_millis(1500));
        assert_eq!(options.lease_duration, chrono::Duration::seconds(300));
    }

    #[test]
    fn worker_config_overrides() {
        let cli = WorkerCli::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/muster",
            "--type-prefix",
            "events.",
            "--poll-interval-ms",
            "250",
            "--lease-secs",
            "60",
            "--workers",
            "4",
        ])
        .unwrap();

        let options = cli.config.worker_options().unwrap();
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert_eq!(options.lease_duration, chrono::Duration::seconds(60));
        assert_eq!(cli.config.workers, 4);
    }

    #[test]
    fn enqueue_parses_payload_and_schedule() {
        let cli = Cli::try_parse_from([
            "muster",
            "enqueue",
            "--database-url",
            "postgres://localhost/muster",
            "memory.ingest",
            r#"{"memory_id": 42}"#,
            "--priority",
            "-1",
            "--run-at",
            "2030-01-01T00:00:00Z",
        ])
        .unwrap();

        let Command::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.job_type, "memory.ingest");
        assert_eq!(args.payload, serde_json::json!({"memory_id": 42}));
        assert_eq!(args.priority, -1);
        assert_eq!(args.run_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn enqueue_rejects_malformed_payload() {
        let result = Cli::try_parse_from([
            "muster",
            "enqueue",
            "--database-url",
            "postgres://localhost/muster",
            "memory.ingest",
            "{not json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn enqueue_keeps_payload_shape() {
        let parse = |payload: &str| {
            let cli = Cli::try_parse_from([
                "muster",
                "enqueue",
                "--database-url",
                "postgres://localhost/muster",
                "memory.ingest",
                payload,
            ])
            .unwrap();
            let Command::Enqueue(args) = cli.command else {
                panic!("expected enqueue");
            };
            args.payload
        };

        assert_eq!(parse("[1, 2]"), serde_json::json!([1, 2]));
        assert_eq!(parse(r#""text""#), serde_json::json!("text"));
        assert!(parse("{}").is_object());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let reap = Cli::try_parse_from([
            "muster",
            "reap",
            "--database-url",
            "postgres://localhost/muster",
            "--interval-secs",
            "0",
        ]);
        assert!(reap.is_err());

        let worker = WorkerCli::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/muster",
            "--type-prefix",
            "memory.",
            "--reaper-interval-secs",
            "0",
        ]);
        assert!(worker.is_err());
    }

    #[test]
    fn lease_secs_is_bounded() {
        for lease in ["0", "31536001", "18446744073709551615"] {
            let result = WorkerCli::try_parse_from([
                "worker",
                "--database-url",
                "postgres://localhost/muster",
                "--type-prefix",
                "memory.",
                "--lease-secs",
                lease,
            ]);
            assert!(result.is_err(), "--lease-secs {lease} accepted");
        }
    }

    #[test]
    fn oversized_lease_is_an_error() {
        let mut cli = WorkerCli::try_parse_from([
            "worker",
            "--database-url",
            "postgres://localhost/muster",
            "--type-prefix",
            "memory.",
        ])
        .unwrap();

        cli.config.lease_secs = u64::MAX;
        assert!(cli.config.worker_options().is_err());

        cli.config.lease_secs = MAX_LEASE_SECS;
        let options = cli.config.worker_options().unwrap();
        assert_eq!(options.lease_duration, chrono::Duration::days(365));
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::try_parse_from([
            "muster",
            "stats",
            "--database-url",
            "postgres://localhost/muster",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
