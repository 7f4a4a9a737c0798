// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the optional configuration file that tunes how
//! provkit runs: when monthly and weekly backups are taken, how long each
//! backup tier is kept, and which mount table to register volumes in.
//!
//! Every section and field may be omitted, in which case built-in defaults
//! apply.
//!
//! ```toml
//! [schedule]
//! monthly_day = 1
//! weekly_day = "Sunday"
//!
//! [retention]
//! daily = 7
//! weekly = 35
//! monthly = 365
//!
//! [mount]
//! fstab = "/etc/fstab"
//! ```

use crate::{
    backup::{Retention, Schedule},
    disk::DEFAULT_FSTAB,
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Provisioning configuration layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Backup tier schedule.
    pub schedule: Schedule,

    /// Backup retention windows in days.
    pub retention: Retention,

    /// Volume mounting settings.
    pub mount: MountSettings,
}

impl ProvisionConfig {
    /// Load configuration file that must exist.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return any parsing or validation error of [`ProvisionConfig`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("load configuration from {:?}", path.display());
        read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }

    /// Load configuration file, or fall back to defaults if it is missing.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return any parsing or validation error of [`ProvisionConfig`].
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        match Self::load(path.as_ref()) {
            Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                debug!("no configuration at {:?}, use defaults", path.as_ref().display());
                Ok(Self::default())
            }
            result => result,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(1..=31).contains(&self.schedule.monthly_day) {
            return Err(ConfigError::Invalid(format!(
                "schedule.monthly_day must be within 1..=31, got {}",
                self.schedule.monthly_day
            )));
        }

        for (field, days) in [
            ("daily", self.retention.daily),
            ("weekly", self.retention.weekly),
            ("monthly", self.retention.monthly),
        ] {
            if days == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retention.{field} must be at least one day"
                )));
            }
        }

        Ok(())
    }
}

impl FromStr for ProvisionConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: ProvisionConfig =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on mount table path.
        config.mount.fstab = PathBuf::from(
            shellexpand::full(config.mount.fstab.to_string_lossy().as_ref())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned(),
        );

        config.validate()?;

        Ok(config)
    }
}

impl Display for ProvisionConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Volume mounting settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MountSettings {
    /// Persisted mount table to register volumes in.
    pub fstab: PathBuf,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            fstab: PathBuf::from(DEFAULT_FSTAB),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("PROVKIT_ROOT", "/mnt/sysroot")])]
    fn deserialize_provision_config() -> anyhow::Result<()> {
        let result: ProvisionConfig = r#"
            [schedule]
            monthly_day = 15
            weekly_day = "Sunday"

            [retention]
            daily = 10
            weekly = 60
            monthly = 730

            [mount]
            fstab = "$PROVKIT_ROOT/etc/fstab"
        "#
        .parse()?;

        let expect = ProvisionConfig {
            schedule: Schedule {
                monthly_day: 15,
                weekly_day: Weekday::Sun,
            },
            retention: Retention {
                daily: 10,
                weekly: 60,
                monthly: 730,
            },
            mount: MountSettings {
                fstab: PathBuf::from("/mnt/sysroot/etc/fstab"),
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() -> anyhow::Result<()> {
        let result: ProvisionConfig = r#"
            [retention]
            daily = 3
        "#
        .parse()?;

        let mut expect = ProvisionConfig::default();
        expect.retention.daily = 3;
        assert_eq!(result, expect);
        assert_eq!(result.mount.fstab, PathBuf::from("/etc/fstab"));

        Ok(())
    }

    #[test]
    fn reject_out_of_range_values() {
        let result = "[schedule]\nmonthly_day = 32\n".parse::<ProvisionConfig>();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = "[retention]\nweekly = 0\n".parse::<ProvisionConfig>();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn serialized_config_parses_back() -> anyhow::Result<()> {
        let mut config = ProvisionConfig::default();
        config.schedule.weekly_day = Weekday::Sat;
        config.retention.monthly = 400;

        let result: ProvisionConfig = config.to_string().parse()?;
        assert_eq!(result, config);

        Ok(())
    }

    #[sealed_test]
    fn missing_default_file_yields_defaults() -> anyhow::Result<()> {
        let result = ProvisionConfig::load_or_default("provkit.toml")?;
        assert_eq!(result, ProvisionConfig::default());

        let result = ProvisionConfig::load("provkit.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));

        Ok(())
    }
}
