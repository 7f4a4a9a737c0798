// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Database backup rotation.
//!
//! A backup job runs once a day, usually from a scheduler like cron. Every
//! run produces one dump classified into exactly one __tier__: monthly,
//! weekly, or daily. Each tier keeps its files for a different number of
//! days, which yields a grandfather-father-son style rotation without any
//! bookkeeping beyond the file names themselves.
//!
//! # Backup File Naming
//!
//! Backup files are named `<resource>.<database>.<YYYYMMDD>.<tier>.sql`,
//! with the dump tool's diagnostics going to a sibling `.log` file. The
//! `<resource>.<database>` part is the __prefix__ that retention sweeps
//! operate on.
//!
//! # Tier Classification
//!
//! 1. Monthly, if today is the configured day of the month.
//! 2. Weekly, if today is the configured day of the week.
//! 3. Daily otherwise.
//!
//! Monthly always wins when both rules match.
//!
//! # Backup Sequence
//!
//! Dump, verify, then sweep. A dump that fails, or whose output does not end
//! with the engine's completion marker, aborts the run before the sweep. The
//! partial files stay on disk for inspection.

use crate::{
    database::{is_ready, DatabaseError, Engine},
    syscall::{run_redirected, SyscallError},
    wait::{poll, Sleep, POLL_INTERVAL, POLL_TIMEOUT},
};

use chrono::{Datelike, NaiveDate, Weekday};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{remove_file, File},
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::{info, instrument, warn};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Number of trailing bytes inspected for completion marker.
const TAIL_WINDOW: u64 = 4096;

/// Retention class of a backup file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Taken on configured day of month.
    Monthly,

    /// Taken on configured day of week.
    Weekly,

    /// Taken on any other day.
    Daily,
}

impl Tier {
    /// Every tier, in classification priority.
    pub const ALL: [Tier; 3] = [Tier::Monthly, Tier::Weekly, Tier::Daily];

    /// File name suffix of tier.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Weekly => "weekly",
            Self::Daily => "daily",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.suffix())
    }
}

/// When monthly and weekly backups are taken.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Schedule {
    /// Day of month for monthly backups.
    pub monthly_day: u32,

    /// Day of week for weekly backups.
    pub weekly_day: Weekday,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            monthly_day: 1,
            weekly_day: Weekday::Sun,
        }
    }
}

impl Schedule {
    /// Classify date into tier.
    pub fn tier_for(&self, today: NaiveDate) -> Tier {
        plan_tier(today, self.monthly_day, self.weekly_day)
    }
}

/// Classify date into exactly one tier.
///
/// Monthly takes precedence over weekly.
pub fn plan_tier(today: NaiveDate, monthly_day: u32, weekly_day: Weekday) -> Tier {
    if today.day() == monthly_day {
        Tier::Monthly
    } else if today.weekday() == weekly_day {
        Tier::Weekly
    } else {
        Tier::Daily
    }
}

/// Days each tier keeps its files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Retention {
    /// Days to keep daily backups.
    pub daily: u32,

    /// Days to keep weekly backups.
    pub weekly: u32,

    /// Days to keep monthly backups.
    pub monthly: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 35,
            monthly: 365,
        }
    }
}

impl Retention {
    /// Retention window of tier.
    pub fn window(&self, tier: Tier) -> Duration {
        let days = match tier {
            Tier::Monthly => self.monthly,
            Tier::Weekly => self.weekly,
            Tier::Daily => self.daily,
        };

        Duration::from_secs(u64::from(days) * SECONDS_PER_DAY)
    }
}

/// Planned names for today's backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    /// Tier of today's backup.
    pub tier: Tier,

    /// File name without extension.
    pub base: String,
}

impl BackupPlan {
    /// Plan backup of prefix for given date.
    pub fn new(prefix: &str, today: NaiveDate, schedule: &Schedule) -> Self {
        let tier = schedule.tier_for(today);
        let base = format!("{prefix}.{}.{tier}", today.format("%Y%m%d"));

        Self { tier, base }
    }

    /// Path of dump file inside directory.
    pub fn dump_path(&self, directory: &Path) -> PathBuf {
        directory.join(format!("{}.sql", self.base))
    }

    /// Path of diagnostics file inside directory.
    pub fn log_path(&self, directory: &Path) -> PathBuf {
        directory.join(format!("{}.log", self.base))
    }
}

/// Delete backup files that outlived their tier's retention window.
///
/// Every tier is swept, no matter which tier today belongs to. A file is
/// deleted only if its age is strictly greater than the window. Age is
/// measured from the file's modification time.
///
/// # Errors
///
/// - Return [`BackupError::Pattern`] if prefix produces invalid glob.
/// - Return [`BackupError::Stat`] if file metadata cannot be read.
/// - Return [`BackupError::Remove`] if file cannot be deleted.
#[instrument(skip(retention, now), level = "debug")]
pub fn apply_retention(
    directory: &Path,
    prefix: &str,
    retention: &Retention,
    now: SystemTime,
) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for tier in Tier::ALL {
        let window = retention.window(tier);
        for extension in ["sql", "log"] {
            let pattern = format!(
                "{}/{}.*.{tier}.{extension}",
                glob::Pattern::escape(&directory.to_string_lossy()),
                glob::Pattern::escape(prefix)
            );

            for path in glob::glob(&pattern)? {
                let path = path.map_err(|err| BackupError::Stat {
                    path: err.path().to_path_buf(),
                    source: err.into(),
                })?;

                let modified = path
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map_err(|err| BackupError::Stat {
                        source: err,
                        path: path.clone(),
                    })?;
                let age = now.duration_since(modified).unwrap_or_default();
                if age <= window {
                    continue;
                }

                info!("remove expired {tier} backup {:?}", path.display());
                remove_file(&path).map_err(|err| BackupError::Remove {
                    source: err,
                    path: path.clone(),
                })?;
                removed.push(path);
            }
        }
    }

    Ok(removed)
}

/// Check that dump file ends with completion marker.
///
/// Only the last non-empty line is inspected.
///
/// # Errors
///
/// - Return [`BackupError::Stat`] if dump file cannot be read.
/// - Return [`BackupError::Incomplete`] if marker is missing.
pub fn verify_dump(path: &Path, marker: &str) -> Result<()> {
    let stat_error = |err| BackupError::Stat {
        source: err,
        path: path.to_path_buf(),
    };

    let mut file = File::open(path).map_err(stat_error)?;
    let length = file.metadata().map_err(stat_error)?.len();
    file.seek(SeekFrom::Start(length.saturating_sub(TAIL_WINDOW)))
        .map_err(stat_error)?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).map_err(stat_error)?;

    let tail = String::from_utf8_lossy(&tail);
    let complete = tail
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.contains(marker));

    if !complete {
        return Err(BackupError::Incomplete {
            path: path.to_path_buf(),
            marker: marker.into(),
        });
    }

    Ok(())
}

/// Result of a finished backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// Tier of produced backup.
    pub tier: Tier,

    /// Produced dump file.
    pub dump: PathBuf,

    /// Produced diagnostics file.
    pub log: PathBuf,

    /// Files removed by retention sweep.
    pub removed: Vec<PathBuf>,
}

/// Backup of one database into one directory.
#[derive(Debug, Clone)]
pub struct BackupJob {
    /// Database engine.
    pub engine: Engine,

    /// Name of server or service the database belongs to.
    pub resource: String,

    /// Database to dump.
    pub database: String,

    /// Client credentials file.
    pub credentials: PathBuf,

    /// Directory receiving backup files.
    pub directory: PathBuf,
}

impl BackupJob {
    /// Prefix shared by every backup file of this job.
    pub fn prefix(&self) -> String {
        format!("{}.{}", self.resource, self.database)
    }

    /// Wait until database server accepts connections.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::NotReady`] if server never becomes ready.
    /// - Return [`BackupError::Database`] if probe cannot be executed.
    pub fn wait_ready(&self, sleeper: &impl Sleep) -> Result<()> {
        poll(sleeper, POLL_INTERVAL, POLL_TIMEOUT, || {
            is_ready(self.engine, &self.credentials, &self.database)
                .map(|ready| ready.then_some(()))
        })?
        .ok_or_else(|| BackupError::NotReady {
            engine: self.engine,
        })
    }

    /// Dump database and verify result.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Template`] if spinner style is invalid.
    /// - Return [`BackupError::Syscall`] if dump tool cannot be executed.
    /// - Return [`BackupError::DumpFailed`] if dump tool fails.
    /// - Return [`BackupError::Incomplete`] if dump lacks completion marker.
    pub fn dump(&self, plan: &BackupPlan, bar: ProgressBar) -> Result<(PathBuf, PathBuf)> {
        let dump = plan.dump_path(&self.directory);
        let log = plan.log_path(&self.directory);

        bar.set_style(ProgressStyle::with_template(
            "{spinner:.green} {elapsed_precise} {msg}",
        )?);
        bar.set_message(format!("dump {} into {:?}", self.database, dump.display()));
        bar.enable_steady_tick(Duration::from_millis(100));
        let status = run_redirected(
            &mut self.engine.dump_command(&self.credentials, &self.database),
            &dump,
            &log,
        );
        bar.finish_and_clear();

        let status = status?;
        if !status.success() {
            warn!("dump failed, see {:?}", log.display());
            return Err(BackupError::DumpFailed {
                code: status.code(),
                log,
            });
        }

        verify_dump(&dump, self.engine.completion_marker())?;
        info!("dump verified at {:?}", dump.display());

        Ok((dump, log))
    }

    /// Run full backup sequence for given date.
    ///
    /// # Errors
    ///
    /// - Return any error of [`BackupJob::wait_ready`], [`BackupJob::dump`],
    ///   or [`apply_retention`].
    #[instrument(
        skip(self, schedule, retention, sleeper, bar),
        fields(prefix = %self.prefix()),
        level = "debug"
    )]
    pub fn run(
        &self,
        today: NaiveDate,
        schedule: &Schedule,
        retention: &Retention,
        sleeper: &impl Sleep,
        bar: ProgressBar,
    ) -> Result<BackupReport> {
        self.wait_ready(sleeper)?;

        let plan = BackupPlan::new(&self.prefix(), today, schedule);
        info!("take {} backup {}", plan.tier, plan.base);
        let (dump, log) = self.dump(&plan, bar)?;

        let removed = apply_retention(
            &self.directory,
            &self.prefix(),
            retention,
            SystemTime::now(),
        )?;

        Ok(BackupReport {
            tier: plan.tier,
            dump,
            log,
            removed,
        })
    }
}

/// Backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Database server did not accept connections in time.
    #[error("{engine} server not ready after {:?}", POLL_TIMEOUT)]
    NotReady { engine: Engine },

    /// Dump tool exited unsuccessfully.
    #[error("dump failed with status {code:?}, see {:?}", log.display())]
    DumpFailed { code: Option<i32>, log: PathBuf },

    /// Dump output lacks completion marker.
    #[error("dump at {:?} does not end with {marker:?}", path.display())]
    Incomplete { path: PathBuf, marker: String },

    /// Backup file metadata cannot be read.
    #[error("failed to inspect backup file at {:?}", path.display())]
    Stat {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Expired backup file cannot be deleted.
    #[error("failed to remove backup file at {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Retention pattern is invalid.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// Style template cannot be set for spinner.
    #[error(transparent)]
    Template(#[from] indicatif::style::TemplateError),

    /// Database plumbing failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// External tool failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

/// Friendly result alias :3
pub type Result<T, E = BackupError> = std::result::Result<T, E>;
