// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use provkit::{
    backup::BackupJob,
    config::ProvisionConfig,
    database::{Credentials, Engine},
    disk::{DiskMounter, Fstab, HostBlockDevices, DEFAULT_FS_TYPE},
    editor::{ConfigEditor, Syntax, UpsertMode},
    logging::{self, ACTION},
    params::ParameterSet,
    path::default_config_path,
    wait::ThreadSleep,
};

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::{error::ErrorKind, Parser, Subcommand, ValueEnum};
use indicatif::ProgressBar;
use inquire::{Confirm, Password};
use std::{path::PathBuf, process::exit};
use tracing::{error, info};

/// Keys every backup job must receive.
const BACKUP_KEYS: &[&str] = &[
    "resource-name",
    "database",
    "engine",
    "credentials",
    "backup-dir",
];

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "provkit [options] <provkit-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Set(opts) => run_set(opts),
            Command::Enable(opts) => run_enable(opts),
            Command::Mount(opts) => run_mount(load_config(self.config)?, opts),
            Command::Credentials(opts) => run_credentials(opts),
            Command::Backup(opts) => run_backup(load_config(self.config)?, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Set parameter line of configuration file.
    #[command(override_usage = "provkit set [options] <file> <key> <value>")]
    Set(SetOptions),

    /// Uncomment commented-out directive of configuration file.
    #[command(override_usage = "provkit enable [options] <file> <key>")]
    Enable(EnableOptions),

    /// Format and mount block device selected by size.
    #[command(override_usage = "provkit mount [options] --size <label> --mount-point <path>")]
    Mount(MountOptions),

    /// Write database client credentials file.
    #[command(override_usage = "provkit credentials [options] --engine <engine> --path <path>")]
    Credentials(CredentialsOptions),

    /// Take tiered database backup and prune old ones.
    #[command(override_usage = "provkit backup [options] -- [--<key> <value>]...")]
    Backup(BackupOptions),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SyntaxKind {
    /// Lines of the form `key = value`.
    Assignment,

    /// Lines of the form `key value`, possibly indented.
    Directive,

    /// Lines of the form `key<separator>value<terminator>`.
    Declaration,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SetOptions {
    /// Configuration file to edit.
    #[arg(value_name = "file")]
    pub file: PathBuf,

    /// Parameter key.
    #[arg(value_name = "key")]
    pub key: String,

    /// Desired parameter value.
    #[arg(value_name = "value", allow_hyphen_values = true)]
    pub value: String,

    /// Grammar of parameter lines.
    #[arg(short, long, value_enum, default_value_t = SyntaxKind::Assignment)]
    pub syntax: SyntaxKind,

    /// Text between key and value.
    #[arg(long, value_name = "text", allow_hyphen_values = true)]
    pub separator: Option<String>,

    /// Text after value.
    #[arg(long, value_name = "text", default_value = "", allow_hyphen_values = true)]
    pub terminator: String,

    /// Append parameter line if key is missing.
    #[arg(short, long, group = "mode")]
    pub append: bool,

    /// Insert parameter line after anchor if key is missing.
    #[arg(long, group = "mode", value_name = "anchor")]
    pub after: Option<String>,
}

impl SetOptions {
    fn syntax(&self) -> Syntax {
        let syntax = match self.syntax {
            SyntaxKind::Assignment => Syntax::assignment(),
            SyntaxKind::Directive => Syntax::directive(),
            SyntaxKind::Declaration => Syntax::declaration(" "),
        };
        let syntax = match &self.separator {
            Some(separator) => syntax.with_separator(separator),
            None => syntax,
        };

        syntax.with_terminator(&self.terminator)
    }

    fn mode(&self) -> UpsertMode {
        match (&self.after, self.append) {
            (Some(anchor), _) => UpsertMode::InsertAfterAnchor(anchor.clone()),
            (None, true) => UpsertMode::AppendIfMissing,
            (None, false) => UpsertMode::UpdateOnly,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct EnableOptions {
    /// Configuration file to edit.
    #[arg(value_name = "file")]
    pub file: PathBuf,

    /// Directive to uncomment.
    #[arg(value_name = "key")]
    pub key: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MountOptions {
    /// Size label of block device as reported by lsblk, e.g. 500G.
    #[arg(long, value_name = "label")]
    pub size: String,

    /// Directory to mount block device at.
    #[arg(long, value_name = "path")]
    pub mount_point: PathBuf,

    /// Format device without asking if it has no filesystem.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CredentialsOptions {
    /// Database engine the file is meant for.
    #[arg(long, value_enum, value_name = "engine")]
    pub engine: Engine,

    /// Path of credentials file to write.
    #[arg(long, value_name = "path")]
    pub path: PathBuf,

    /// Server host name.
    #[arg(long, value_name = "host", default_value = "localhost")]
    pub host: String,

    /// Server port, defaults to the engine's standard port.
    #[arg(long, value_name = "port", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Login user.
    #[arg(long, value_name = "user")]
    pub user: String,

    /// Login password, prompted for if omitted.
    #[arg(long, value_name = "password")]
    pub password: Option<String>,

    /// Default database.
    #[arg(long, value_name = "database")]
    pub database: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BackupOptions {
    /// Job parameters as `--key value` pairs.
    #[arg(last = true, value_name = "params")]
    pub params: Vec<String>,
}

fn main() {
    logging::init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    let cli = Cli::try_parse().unwrap_or_else(|error| match usage_exit_code(&error) {
        Some(code) => {
            let _ = error.print();
            exit(code)
        }
        None => error.exit(),
    });

    cli.run()
}

/// Exit status of failed command-line parse, `None` if clap reports no failure.
fn usage_exit_code(error: &clap::Error) -> Option<i32> {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => None,
        _ => Some(1),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ProvisionConfig> {
    let config = match path {
        Some(path) => ProvisionConfig::load(path)?,
        None => ProvisionConfig::load_or_default(default_config_path()?)?,
    };

    Ok(config)
}

fn run_set(opts: SetOptions) -> Result<()> {
    info!(target: ACTION, "set {} in {:?}", opts.key, opts.file.display());
    let editor = ConfigEditor::new(&opts.file);
    editor.upsert(&opts.key, &opts.value, &opts.syntax(), &opts.mode())?;

    Ok(())
}

fn run_enable(opts: EnableOptions) -> Result<()> {
    info!(target: ACTION, "enable {} in {:?}", opts.key, opts.file.display());
    let editor = ConfigEditor::new(&opts.file);
    editor.enable(&opts.key)?;

    Ok(())
}

fn run_mount(config: ProvisionConfig, opts: MountOptions) -> Result<()> {
    info!(
        target: ACTION,
        "mount {} volume at {:?}",
        opts.size,
        opts.mount_point.display()
    );
    let mounter = DiskMounter::new(
        HostBlockDevices::new(),
        ThreadSleep,
        Fstab::new(config.mount.fstab),
    );

    let entry = mounter.mount_by_size(&opts.size, &opts.mount_point, |device| {
        if opts.yes {
            return Ok(true);
        }

        let message = format!(
            "{:?} has no filesystem, create {DEFAULT_FS_TYPE} on it?",
            device.sys_path().display()
        );
        Ok(Confirm::new(&message).with_default(false).prompt()?)
    })?;
    info!("mounted UUID {} at {:?}", entry.uuid, entry.mount_point.display());

    Ok(())
}

fn run_credentials(opts: CredentialsOptions) -> Result<()> {
    info!(
        target: ACTION,
        "write {} credentials to {:?}",
        opts.engine,
        opts.path.display()
    );
    let password = match opts.password {
        Some(password) => password,
        None => Password::new(&format!("{} password:", opts.user))
            .without_confirmation()
            .prompt()?,
    };
    let port = opts.port.unwrap_or(match opts.engine {
        Engine::Mysql => 3306,
        Engine::Postgresql => 5432,
    });

    let credentials = Credentials {
        host: opts.host,
        port,
        user: opts.user,
        password,
        database: opts.database,
    };
    credentials.write(opts.engine, &opts.path)?;

    Ok(())
}

fn run_backup(config: ProvisionConfig, opts: BackupOptions) -> Result<()> {
    let params = ParameterSet::parse("provkit backup --", opts.params, BACKUP_KEYS)?;
    let param = |key: &str| {
        params
            .get(key)
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("parameter --{key} not set"))
    };

    let job = BackupJob {
        engine: param("engine")?.parse()?,
        resource: param("resource-name")?,
        database: param("database")?,
        credentials: PathBuf::from(param("credentials")?),
        directory: PathBuf::from(param("backup-dir")?),
    };

    info!(target: ACTION, "back up {} database {}", job.engine, job.prefix());
    let report = job.run(
        Local::now().date_naive(),
        &config.schedule,
        &config.retention,
        &ThreadSleep,
        ProgressBar::new_spinner(),
    )?;

    info!(
        "{} backup written to {:?}, {} old files removed",
        report.tier,
        report.dump.display(),
        report.removed.len()
    );

    Ok(())
}
