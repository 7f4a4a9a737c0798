// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Database client plumbing.
//!
//! Provkit never talks to a database server itself. It writes a client-style
//! credentials file and hands it to the stock client tools: mysqladmin and
//! mysqldump for MySQL (and MariaDB), pg_isready and pg_dump for PostgreSQL.
//!
//! # Credentials File Layout
//!
//! MySQL clients read an option file passed through `--defaults-extra-file`.
//! Connection settings live in the `[client]` group that every MySQL client
//! understands. The default database goes into the `[mysql]` group, because
//! mysqldump refuses unknown options in `[client]`.
//!
//! PostgreSQL clients read a connection service file passed through the
//! `PGSERVICEFILE` environment variable. The service section is named after
//! the database, so `service=<database>` selects it.
//!
//! Both files hold a plain text password, so they are always written with
//! owner-only permissions.

use crate::syscall::{run_captured, SyscallError};

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{set_permissions, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
};
use tracing::{debug, info, instrument};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// MySQL or MariaDB.
    Mysql,

    /// PostgreSQL.
    Postgresql,
}

impl Engine {
    /// Line a complete dump ends with.
    pub fn completion_marker(&self) -> &'static str {
        match self {
            Self::Mysql => "-- Dump completed",
            Self::Postgresql => "-- PostgreSQL database dump complete",
        }
    }

    /// Command that succeeds once server accepts connections.
    pub fn ready_command(&self, credentials: &Path, database: &str) -> Command {
        match self {
            Self::Mysql => {
                let mut command = Command::new("mysqladmin");
                command.arg(defaults_extra_file(credentials)).arg("ping");
                command
            }
            Self::Postgresql => {
                let mut command = Command::new("pg_isready");
                command
                    .env("PGSERVICEFILE", credentials)
                    .arg(format!("--dbname=service={database}"));
                command
            }
        }
    }

    /// Command writing a plain SQL dump of database to standard output.
    pub fn dump_command(&self, credentials: &Path, database: &str) -> Command {
        match self {
            Self::Mysql => {
                let mut command = Command::new("mysqldump");
                command
                    .arg(defaults_extra_file(credentials))
                    .args(["--single-transaction", "--routines", "--triggers"])
                    .arg(database);
                command
            }
            Self::Postgresql => {
                let mut command = Command::new("pg_dump");
                command
                    .env("PGSERVICEFILE", credentials)
                    .arg("--no-password")
                    .arg(format!("--dbname=service={database}"));
                command
            }
        }
    }
}

impl FromStr for Engine {
    type Err = DatabaseError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgresql" | "postgres" | "pgsql" => Ok(Self::Postgresql),
            _ => Err(DatabaseError::UnknownEngine(data.into())),
        }
    }
}

impl Display for Engine {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Mysql => fmt.write_str("mysql"),
            Self::Postgresql => fmt.write_str("postgresql"),
        }
    }
}

fn defaults_extra_file(credentials: &Path) -> OsString {
    let mut arg = OsString::from("--defaults-extra-file=");
    arg.push(credentials);
    arg
}

/// Probe whether database server accepts connections.
///
/// # Errors
///
/// - Return [`DatabaseError::Syscall`] if probe tool cannot be executed.
pub fn is_ready(engine: Engine, credentials: &Path, database: &str) -> Result<bool> {
    let output = run_captured(&mut engine.ready_command(credentials, database))?;
    if !output.status.success() {
        debug!("{engine} not ready: {}", output.stderr);
    }

    Ok(output.status.success())
}

/// Connection settings for a database client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Server host name.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Login user.
    pub user: String,

    /// Login password.
    pub password: String,

    /// Default database.
    pub database: String,
}

impl Credentials {
    /// Render credentials file content for engine.
    ///
    /// # Errors
    ///
    /// - Return [`DatabaseError::InvalidValue`] if a value would break the
    ///   file layout.
    pub fn render(&self, engine: Engine) -> Result<String> {
        for (field, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("password", &self.password),
            ("database", &self.database),
        ] {
            if value.contains(['\n', '\r']) {
                return Err(DatabaseError::InvalidValue(field));
            }
        }

        let content = match engine {
            Engine::Mysql => format!(
                "[client]\nhost={}\nport={}\nuser={}\npassword={}\n\n[mysql]\ndatabase={}\n",
                self.host,
                self.port,
                self.user,
                quote_option(&self.password),
                self.database
            ),
            Engine::Postgresql => {
                if self.database.contains([']', '[']) {
                    return Err(DatabaseError::InvalidValue("database"));
                }
                format!(
                    "[{db}]\nhost={}\nport={}\nuser={}\npassword={}\ndbname={db}\n",
                    self.host,
                    self.port,
                    self.user,
                    self.password,
                    db = self.database
                )
            }
        };

        Ok(content)
    }

    /// Write credentials file with owner-only permissions.
    ///
    /// Existing file is truncated, and its permissions are tightened.
    ///
    /// # Errors
    ///
    /// - Return [`DatabaseError::InvalidValue`] if a value would break the
    ///   file layout.
    /// - Return [`DatabaseError::WriteCredentials`] if file cannot be written.
    #[instrument(skip(self), level = "debug")]
    pub fn write(&self, engine: Engine, path: &Path) -> Result<()> {
        let content = self.render(engine)?;
        let write_error = |err| DatabaseError::WriteCredentials {
            source: err,
            path: path.to_path_buf(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(write_error)?;
        set_permissions(path, Permissions::from_mode(0o600)).map_err(write_error)?;
        file.write_all(content.as_bytes()).map_err(write_error)?;
        info!("wrote {engine} credentials to {:?}", path.display());

        Ok(())
    }
}

fn quote_option(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Database plumbing error types.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Engine name is not supported.
    #[error("unknown database engine {0:?}, expected mysql or postgresql")]
    UnknownEngine(String),

    /// Credential value contains characters that break the file layout.
    #[error("credential field {0:?} contains forbidden characters")]
    InvalidValue(&'static str),

    /// Credentials file cannot be written.
    #[error("failed to write credentials file at {:?}", path.display())]
    WriteCredentials {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Client tool failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

/// Friendly result alias :3
pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;
