use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reception_code::{AllocatorConfig, Category, CategoryRegistry, OverflowPolicy};

/// Runtime configuration for the `reception-code` binary.
///
/// Store and allocator settings are global and may come from the command
/// line, the environment, or a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "reception-code",
    version,
    about = "Allocate and manage laboratory reception codes"
)]
pub struct CliArgs {
    /// SQLite database holding counters and receptions. Created on first use.
    ///
    /// Environment variable: `RECEPTION_DATABASE`
    #[arg(long, env = "RECEPTION_DATABASE", default_value = "receptions.sqlite3")]
    pub database: PathBuf,

    /// JSON file mapping category keys to category settings, e.g.
    /// `{"BLOOD": {"prefix": "BLOOD", "numericWidth": 4, "resetPeriod": "MONTHLY"}}`.
    ///
    /// Environment variable: `RECEPTION_CATEGORIES`
    #[arg(long, env = "RECEPTION_CATEGORIES")]
    pub categories: Option<PathBuf>,

    /// Total allocation attempts before giving up with a conflict.
    ///
    /// Environment variable: `RECEPTION_MAX_ATTEMPTS`
    #[arg(long, env = "RECEPTION_MAX_ATTEMPTS", default_value_t = reception_code::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    ///
    /// Environment variable: `RECEPTION_BACKOFF_BASE_MS`
    #[arg(long, env = "RECEPTION_BACKOFF_BASE_MS", default_value_t = reception_code::DEFAULT_BACKOFF_BASE_MS)]
    pub backoff_base_ms: u64,

    /// Upper bound for a single retry delay, in milliseconds.
    ///
    /// Environment variable: `RECEPTION_BACKOFF_MAX_MS`
    #[arg(long, env = "RECEPTION_BACKOFF_MAX_MS", default_value_t = reception_code::DEFAULT_BACKOFF_MAX_MS)]
    pub backoff_max_ms: u64,

    /// What to do when a sequence outgrows the category's numeric width.
    ///
    /// Environment variable: `RECEPTION_OVERFLOW`
    #[arg(long, env = "RECEPTION_OVERFLOW", value_enum, default_value_t = Overflow::Reject)]
    pub overflow: Overflow,

    /// How long to wait for another writer's lock, in milliseconds.
    ///
    /// Environment variable: `RECEPTION_BUSY_TIMEOUT_MS`
    #[arg(long, env = "RECEPTION_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    pub busy_timeout_ms: u64,

    /// Print results as JSON lines.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the database schema.
    Init,
    /// Allocate codes and record a reception for each.
    Allocate {
        #[command(flatten)]
        target: Target,
        /// Reception time; defaults to now (local time).
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<NaiveDateTime>,
        /// Number of receptions to record.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show the code the next allocation would most likely receive.
    Preview {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<NaiveDateTime>,
    },
    /// Show the date bucket every reset period produces.
    Buckets {
        /// Restrict the listing to one category.
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<NaiveDateTime>,
    },
    /// List live receptions in a time range, latest first.
    ///
    /// With neither bound given, lists today's receptions.
    List {
        /// Start of the range; defaults to the start of the `--to` day, or today.
        #[arg(long, value_parser = parse_timestamp)]
        from: Option<NaiveDateTime>,
        /// End of the range, inclusive. A bare date covers that whole day.
        /// Defaults to the end of the `--from` day.
        #[arg(long, value_parser = parse_range_end)]
        to: Option<NaiveDateTime>,
    },
    /// Find the live reception carrying a code.
    Lookup { code: String },
    /// Soft-delete the live reception carrying a code.
    Delete { code: String },
}

/// Either a registered category or an ad-hoc prefix.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct Target {
    /// Category key from the categories file.
    #[arg(long)]
    pub category: Option<String>,
    /// Prefix to allocate against with default settings.
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Reject,
    Widen,
}

impl From<Overflow> for OverflowPolicy {
    fn from(value: Overflow) -> Self {
        match value {
            Overflow::Reject => Self::Reject,
            Overflow::Widen => Self::Widen,
        }
    }
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD HH:MM:SS`.
fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| format!("invalid timestamp {raw:?}, expected YYYY-MM-DD[THH:MM:SS]"))
}

/// Like [`parse_timestamp`], but a bare date means the last instant of that day.
fn parse_range_end(raw: &str) -> Result<NaiveDateTime, String> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(date) => Ok(end_of_day(date)),
        Err(_) => parse_timestamp(raw),
    }
}

pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN) + chrono::TimeDelta::days(1)
        - chrono::TimeDelta::milliseconds(1)
}

#[derive(Debug)]
pub struct CliConfig {
    pub database: PathBuf,
    pub busy_timeout: Duration,
    pub allocator: AllocatorConfig,
    pub categories: CategoryRegistry,
    pub json: bool,
    pub command: Command,
}

impl TryFrom<CliArgs> for CliConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_attempts == 0 {
            bail!("RECEPTION_MAX_ATTEMPTS must be greater than 0");
        }
        if args.backoff_max_ms < args.backoff_base_ms {
            bail!(
                "RECEPTION_BACKOFF_MAX_MS ({}) is below RECEPTION_BACKOFF_BASE_MS ({})",
                args.backoff_max_ms,
                args.backoff_base_ms
            );
        }
        if let Command::Allocate { count: 0, .. } = args.command {
            bail!("--count must be greater than 0");
        }
        if let Command::List {
            from: Some(from),
            to: Some(to),
        } = args.command
        {
            if to < from {
                bail!("--to ({to}) is before --from ({from})");
            }
        }

        let categories = match &args.categories {
            Some(path) => load_categories(path)?,
            None => CategoryRegistry::new(),
        };

        let allocator = AllocatorConfig::new()
            .with_max_attempts(args.max_attempts)
            .with_backoff(
                args.backoff_base_ms,
                args.backoff_max_ms,
                reception_code::DEFAULT_JITTER,
            )
            .with_overflow(args.overflow.into());

        Ok(Self {
            database: args.database,
            busy_timeout: Duration::from_millis(args.busy_timeout_ms),
            allocator,
            categories,
            json: args.json,
            command: args.command,
        })
    }
}

/// Reads a `{ key: category }` JSON object into a registry.
pub fn load_categories(path: &std::path::Path) -> anyhow::Result<CategoryRegistry> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read categories from {}", path.display()))?;
    parse_categories(&raw).with_context(|| format!("invalid categories in {}", path.display()))
}

fn parse_categories(raw: &str) -> anyhow::Result<CategoryRegistry> {
    let categories: BTreeMap<String, Category> = serde_json::from_str(raw)?;
    Ok(categories.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reception_code::{CategoryResolver, ResetPeriod};

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("reception-code").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn parses_allocate_by_prefix() {
        let args = parse(&["--overflow", "widen", "allocate", "--prefix", "T", "--count", "3"]);
        assert_eq!(args.overflow, Overflow::Widen);
        let config = CliConfig::try_from(args).unwrap();
        assert_eq!(config.allocator.overflow, OverflowPolicy::Widen);
        assert_eq!(config.allocator.max_attempts, 5);
        match config.command {
            Command::Allocate { target, at, count } => {
                assert_eq!(target.prefix.as_deref(), Some("T"));
                assert!(target.category.is_none());
                assert!(at.is_none());
                assert_eq!(count, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn target_requires_exactly_one_of_category_or_prefix() {
        let none = CliArgs::try_parse_from(["reception-code", "allocate"]);
        assert!(none.is_err());
        let both = CliArgs::try_parse_from([
            "reception-code",
            "preview",
            "--category",
            "BLOOD",
            "--prefix",
            "B",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn rejects_invalid_settings() {
        let args = parse(&["--max-attempts", "0", "init"]);
        assert!(CliConfig::try_from(args).is_err());
        let args = parse(&["--backoff-base-ms", "100", "--backoff-max-ms", "10", "init"]);
        assert!(CliConfig::try_from(args).is_err());
        let args = parse(&["allocate", "--prefix", "T", "--count", "0"]);
        assert!(CliConfig::try_from(args).is_err());
    }

    #[test]
    fn parses_timestamps() {
        let date_only = parse_timestamp("2025-12-11").unwrap();
        assert_eq!(date_only.to_string(), "2025-12-11 00:00:00");
        let full = parse_timestamp("2025-12-11T09:15:00").unwrap();
        assert_eq!(full.to_string(), "2025-12-11 09:15:00");
        assert_eq!(parse_timestamp("2025-12-11 09:15:00").unwrap(), full);
        assert!(parse_timestamp("11/12/2025").is_err());

        let end = parse_range_end("2025-12-11").unwrap();
        assert_eq!(end.to_string(), "2025-12-11 23:59:59.999");
        assert_eq!(parse_range_end("2025-12-11T09:15:00").unwrap(), full);
    }

    #[test]
    fn rejects_inverted_ranges() {
        let args = parse(&["list", "--from", "2025-12-12", "--to", "2025-12-11"]);
        assert!(CliConfig::try_from(args).is_err());
        let args = parse(&["list", "--from", "2025-12-11", "--to", "2025-12-11"]);
        assert!(CliConfig::try_from(args).is_ok());
    }

    #[test]
    fn loads_categories_with_defaults() {
        let registry = parse_categories(
            r#"{
                "BLOOD": {"prefix": "BLOOD"},
                "URINE": {"prefix": "U", "numericWidth": 5, "resetPeriod": "DAILY"}
            }"#,
        )
        .unwrap();
        assert_eq!(registry.keys(), vec!["BLOOD", "URINE"]);
        let blood = registry.resolve("BLOOD").unwrap();
        assert_eq!(blood.numeric_width(), 4);
        assert_eq!(blood.reset_period(), ResetPeriod::Monthly);
        let urine = registry.resolve("URINE").unwrap();
        assert_eq!(urine.prefix(), "U");
        assert_eq!(urine.reset_period(), ResetPeriod::Daily);
    }

    #[test]
    fn rejects_invalid_categories() {
        assert!(parse_categories(r#"{"BAD": {"prefix": "NO SPACES"}}"#).is_err());
        assert!(parse_categories(r#"{"WIDE": {"prefix": "W", "numericWidth": 9}}"#).is_err());
    }
}
