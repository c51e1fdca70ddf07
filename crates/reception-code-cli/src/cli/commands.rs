use std::io::Write;

use anyhow::{Context, bail};
use chrono::NaiveDateTime;
use reception_code::{
    Category, CategoryRegistry, ReceptionAllocator, ReceptionRecord, ResetPeriod,
    SequenceTransaction, SqliteStore, StatsSnapshot, bucket_examples, code_stem,
};
use serde::Serialize;

use super::config::{CliConfig, Command, Target, end_of_day};

/// One invocation of the binary: an open store, an allocator over the
/// configured categories and the command to run against them.
pub struct App {
    store: SqliteStore,
    allocator: ReceptionAllocator<CategoryRegistry>,
    json: bool,
    command: Command,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Preview<'a> {
    code: &'a str,
    sequence: u64,
    prefix: &'a str,
    date_bucket: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Buckets<'a> {
    category: &'a str,
    prefix: &'a str,
    reset_period: ResetPeriod,
    next_stem: String,
    buckets: Vec<(ResetPeriod, String)>,
}

impl App {
    /// Opens (and if needed creates) the database named in `config`.
    pub fn open(config: CliConfig) -> anyhow::Result<Self> {
        let store = SqliteStore::with_busy_timeout(&config.database, config.busy_timeout)
            .with_context(|| format!("failed to open {}", config.database.display()))?;
        let allocator = ReceptionAllocator::new(config.categories).with_config(config.allocator);
        Ok(Self {
            store,
            allocator,
            json: config.json,
            command: config.command,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.allocator.stats().snapshot()
    }

    pub fn run(&self, out: &mut impl Write) -> anyhow::Result<()> {
        match &self.command {
            Command::Init => {
                #[cfg(feature = "tracing")]
                tracing::info!(path = %self.store.path().display(), "schema ready");
                writeln!(out, "initialized {}", self.store.path().display())?;
            }
            Command::Allocate { target, at, count } => self.allocate(target, *at, *count, out)?,
            Command::Preview { target, at } => self.preview(target, *at, out)?,
            Command::Buckets { category, at } => self.buckets(category.as_deref(), *at, out)?,
            Command::List { from, to } => self.list(*from, *to, out)?,
            Command::Lookup { code } => {
                let record = self
                    .store
                    .find_by_code(code)?
                    .with_context(|| format!("no live reception carries {code}"))?;
                self.print_record(&record, out)?;
            }
            Command::Delete { code } => {
                let now = self.allocator.now();
                if !self.store.soft_delete(code, now)? {
                    bail!("no live reception carries {code}");
                }
                #[cfg(feature = "tracing")]
                tracing::info!(code = %code, "reception deleted");
                writeln!(out, "deleted {code}")?;
            }
        }
        Ok(())
    }

    /// Returns the category and the label recorded on each reception.
    fn resolve<'a>(&self, target: &'a Target) -> anyhow::Result<(Category, &'a str)> {
        match (&target.category, &target.prefix) {
            (Some(key), _) => Ok((self.allocator.resolve(key)?, key.as_str())),
            (None, Some(prefix)) => Ok((Category::with_prefix(prefix.as_str())?, prefix.as_str())),
            (None, None) => bail!("either --category or --prefix is required"),
        }
    }

    fn allocate(
        &self,
        target: &Target,
        at: Option<NaiveDateTime>,
        count: u32,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        let (category, label) = self.resolve(target)?;
        let received_at = at.unwrap_or_else(|| self.allocator.now());
        for _ in 0..count {
            let (allocation, record) = self.allocator.allocate_category_with_retry(
                &self.store,
                &category,
                Some(received_at),
                |tx, allocation| {
                    let record = allocation.to_record(label, received_at);
                    tx.insert_reception(&record).map(|()| record)
                },
            )?;
            #[cfg(feature = "tracing")]
            tracing::info!(code = %allocation.code, key = %allocation.key, "reception recorded");
            #[cfg(not(feature = "tracing"))]
            let _ = allocation;
            self.print_record(&record, out)?;
        }
        Ok(())
    }

    fn preview(
        &self,
        target: &Target,
        at: Option<NaiveDateTime>,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        let (category, _) = self.resolve(target)?;
        let now = at.unwrap_or_else(|| self.allocator.now());
        let mut tx = self.store.begin_read()?;
        let allocation = self.allocator.preview(&mut tx, &category, now)?;
        tx.rollback()?;

        if self.json {
            let preview = Preview {
                code: &allocation.code,
                sequence: allocation.sequence,
                prefix: allocation.key.prefix(),
                date_bucket: allocation.key.bucket(),
            };
            writeln!(out, "{}", serde_json::to_string(&preview)?)?;
        } else {
            writeln!(out, "{}", allocation.code)?;
        }
        Ok(())
    }

    fn buckets(
        &self,
        only: Option<&str>,
        at: Option<NaiveDateTime>,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        let now = at.unwrap_or_else(|| self.allocator.now());
        let keys = match only {
            Some(key) => vec![key.to_owned()],
            None => self.allocator.categories().keys(),
        };
        if keys.is_empty() {
            bail!("no categories configured; pass --categories");
        }

        for key in &keys {
            let category = self.allocator.resolve(key)?;
            let buckets = bucket_examples(&now).to_vec();
            let active = buckets
                .iter()
                .find(|(period, _)| *period == category.reset_period())
                .map(|(_, bucket)| code_stem(category.prefix(), bucket))
                .unwrap_or_default();

            if self.json {
                let row = Buckets {
                    category: key,
                    prefix: category.prefix(),
                    reset_period: category.reset_period(),
                    next_stem: active,
                    buckets,
                };
                writeln!(out, "{}", serde_json::to_string(&row)?)?;
            } else {
                writeln!(
                    out,
                    "{key}: prefix {} resets {} -> {active}",
                    category.prefix(),
                    category.reset_period()
                )?;
                for (period, bucket) in &buckets {
                    writeln!(out, "  {:<8} {}", period.as_str(), code_stem(category.prefix(), bucket))?;
                }
            }
        }
        Ok(())
    }

    fn list(
        &self,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
        out: &mut impl Write,
    ) -> anyhow::Result<()> {
        let (from, to) = match (from, to) {
            (Some(from), Some(to)) => (from, to),
            (Some(from), None) => (from, end_of_day(from.date())),
            (None, Some(to)) => (to.date().and_time(chrono::NaiveTime::MIN), to),
            (None, None) => {
                let today = self.allocator.now().date();
                (today.and_time(chrono::NaiveTime::MIN), end_of_day(today))
            }
        };
        let records = self.store.list_receptions(from, to)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(%from, %to, count = records.len(), "listed receptions");
        for record in &records {
            self.print_record(record, out)?;
        }
        Ok(())
    }

    fn print_record(&self, record: &ReceptionRecord, out: &mut impl Write) -> anyhow::Result<()> {
        if self.json {
            writeln!(out, "{}", serde_json::to_string(record)?)?;
        } else {
            writeln!(
                out,
                "{}\t{}\t{}",
                record.code, record.category, record.received_at
            )?;
        }
        Ok(())
    }
}
