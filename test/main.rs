// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use provkit::{
    backup::{apply_retention, BackupPlan, Retention, Schedule, Tier},
    config::ProvisionConfig,
    editor::{ConfigEditor, EditError, MatchError, Outcome, Syntax, UpsertMode},
    params::{ParameterSet, Problem},
};

use anyhow::Result;
use chrono::NaiveDate;
use indoc::indoc;
use sealed_test::prelude::*;
use simple_test_case::test_case;
use std::{
    fs::{read_to_string, write, File},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const DAY: u64 = 24 * 60 * 60;

/// Directory of backup files with controlled ages.
pub(crate) struct BackupDirFixture {
    root: PathBuf,
    now: SystemTime,
}

impl BackupDirFixture {
    pub(crate) fn new(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;

        // INVARIANT: Use whole seconds so coarse filesystem timestamps agree.
        let seconds = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let now = UNIX_EPOCH + Duration::from_secs(seconds);

        Ok(Self {
            root: root.as_ref().to_path_buf(),
            now,
        })
    }

    pub(crate) fn add(&self, name: &str, age_days: u64) -> Result<PathBuf> {
        let path = self.root.join(name);
        let file = File::create(&path)?;
        file.set_modified(self.now - Duration::from_secs(age_days * DAY))?;

        Ok(path)
    }

    pub(crate) fn remaining(&self) -> Result<Vec<String>> {
        let mut names = std::fs::read_dir(&self.root)?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<Vec<_>>>()?;
        names.sort();

        Ok(names)
    }
}

#[sealed_test]
fn nginx_directive_inserted_after_anchor_once() -> Result<()> {
    write(
        "site.conf",
        indoc! {r#"
            server {
                listen 80;
                server_name example.org;
            }
        "#},
    )?;

    let editor = ConfigEditor::new("site.conf");
    let syntax = Syntax::directive().with_terminator(";");
    let mode = UpsertMode::InsertAfterAnchor("server_name".into());

    let first = editor.upsert("client_max_body_size", "64m", &syntax, &mode)?;
    let second = editor.upsert("client_max_body_size", "64m", &syntax, &mode)?;
    assert_eq!((first, second), (Outcome::Inserted, Outcome::Unchanged));

    let expect = indoc! {r#"
        server {
            listen 80;
            server_name example.org;
            client_max_body_size 64m;
        }
    "#};
    assert_eq!(read_to_string("site.conf")?, expect);

    Ok(())
}

#[sealed_test]
fn php_assignment_updated_and_missing_key_refused() -> Result<()> {
    let content = indoc! {r#"
        [PHP]
        ;memory_limit = 64M
        memory_limit = 128M
        max_execution_time = 30
    "#};
    write("php.ini", content)?;

    let editor = ConfigEditor::new("php.ini");
    let syntax = Syntax::assignment();
    let outcome = editor.upsert("memory_limit", "512M", &syntax, &UpsertMode::UpdateOnly)?;
    assert_eq!(outcome, Outcome::Updated);

    let before = read_to_string("php.ini")?;
    let result = editor.upsert("upload_max_filesize", "64M", &syntax, &UpsertMode::UpdateOnly);
    assert!(matches!(
        result,
        Err(EditError::Reconcile {
            source: MatchError::NoMatch { .. },
            ..
        })
    ));
    assert_eq!(read_to_string("php.ini")?, before);

    let expect = indoc! {r#"
        [PHP]
        ;memory_limit = 64M
        memory_limit = 512M
        max_execution_time = 30
    "#};
    assert_eq!(before, expect);

    Ok(())
}

#[sealed_test]
fn sshd_directive_enabled_then_updated() -> Result<()> {
    write(
        "sshd_config",
        indoc! {r#"
            Port 22
            #PermitRootLogin prohibit-password
            PasswordAuthentication yes
        "#},
    )?;

    let editor = ConfigEditor::new("sshd_config");
    assert_eq!(editor.enable("PermitRootLogin")?, Outcome::Enabled);
    assert_eq!(editor.enable("PermitRootLogin")?, Outcome::Unchanged);

    let syntax = Syntax::directive();
    let outcome = editor.upsert("PermitRootLogin", "no", &syntax, &UpsertMode::UpdateOnly)?;
    assert_eq!(outcome, Outcome::Updated);

    let expect = indoc! {r#"
        Port 22
        PermitRootLogin no
        PasswordAuthentication yes
    "#};
    assert_eq!(read_to_string("sshd_config")?, expect);

    Ok(())
}

#[sealed_test]
fn apt_declaration_prefix_collision_is_ambiguous() -> Result<()> {
    let content = indoc! {r#"
        Unattended-Upgrade::Automatic-Reboot "false";
        Unattended-Upgrade::Automatic-Reboot-Time "02:00";
    "#};
    write("50unattended-upgrades", content)?;

    let editor = ConfigEditor::new("50unattended-upgrades");
    let syntax = Syntax::declaration(" ").with_terminator(";");
    let found = editor.scan("Unattended-Upgrade::Automatic-Reboot", &syntax)?;
    assert_eq!(found.match_count, 2);
    assert_eq!(found.line_index, Some(0));

    let result = editor.upsert(
        "Unattended-Upgrade::Automatic-Reboot",
        r#""true""#,
        &syntax,
        &UpsertMode::AppendIfMissing,
    );
    assert!(matches!(
        result,
        Err(EditError::Reconcile {
            source: MatchError::MultipleMatches { count: 2, .. },
            ..
        })
    ));
    assert_eq!(read_to_string("50unattended-upgrades")?, content);

    Ok(())
}

#[sealed_test]
fn append_to_file_without_trailing_newline() -> Result<()> {
    write("main.cf", "myhostname = mail.example.org")?;

    let editor = ConfigEditor::new("main.cf");
    let outcome = editor.upsert(
        "relayhost",
        "[smtp.example.org]:587",
        &Syntax::assignment(),
        &UpsertMode::AppendIfMissing,
    )?;
    assert_eq!(outcome, Outcome::Appended);

    let expect = indoc! {r#"
        myhostname = mail.example.org
        relayhost = [smtp.example.org]:587
    "#};
    assert_eq!(read_to_string("main.cf")?, expect);

    Ok(())
}

#[test_case(2024, 9, 1, Tier::Monthly; "first of month")]
#[test_case(2024, 9, 8, Tier::Weekly; "sunday")]
#[test_case(2024, 9, 10, Tier::Daily; "tuesday")]
#[test]
fn plan_backup_name(year: i32, month: u32, day: u32, tier: Tier) {
    let today = NaiveDate::from_ymd_opt(year, month, day).expect("valid date");
    let plan = BackupPlan::new("db01.shop", today, &Schedule::default());
    let expect = format!("db01.shop.{year}{month:02}{day:02}.{tier}");
    assert_eq!(plan.tier, tier);
    assert_eq!(plan.base, expect);
    assert_eq!(
        plan.dump_path(Path::new("/var/backups")),
        PathBuf::from(format!("/var/backups/{expect}.sql"))
    );
}

#[sealed_test]
fn retention_sweeps_every_tier_of_one_prefix() -> Result<()> {
    let fixture = BackupDirFixture::new("backups")?;
    fixture.add("db01.shop.20240101.daily.sql", 8)?;
    fixture.add("db01.shop.20240101.daily.log", 8)?;
    fixture.add("db01.shop.20240105.daily.sql", 7)?;
    fixture.add("db01.shop.20240101.weekly.sql", 36)?;
    fixture.add("db01.shop.20240108.weekly.sql", 20)?;
    fixture.add("db01.shop.20230101.monthly.sql", 366)?;
    fixture.add("db01.shop.20230201.monthly.sql", 300)?;
    fixture.add("db01.blog.20240101.daily.sql", 90)?;
    fixture.add("notes.txt", 900)?;

    let removed = apply_retention(
        Path::new("backups"),
        "db01.shop",
        &Retention::default(),
        fixture.now,
    )?;
    assert_eq!(removed.len(), 4);

    let expect = vec![
        "db01.blog.20240101.daily.sql",
        "db01.shop.20230201.monthly.sql",
        "db01.shop.20240105.daily.sql",
        "db01.shop.20240108.weekly.sql",
        "notes.txt",
    ];
    assert_eq!(fixture.remaining()?, expect);

    Ok(())
}

#[test]
fn backup_parameters_report_everything_at_once() {
    let keys = ["resource-name", "database", "engine", "credentials", "backup-dir"];
    let result = ParameterSet::parse(
        "provkit backup --",
        ["--engine", "mysql", "--datbase", "shop", "--backup-dir"],
        &keys,
    );

    let error = match result {
        Ok(params) => panic!("expected failure, got {params:?}"),
        Err(error) => error,
    };
    let expect = vec![
        Problem::Unexpected("--datbase".into()),
        Problem::Missing("resource-name".into()),
        Problem::Missing("database".into()),
        Problem::Missing("credentials".into()),
        Problem::Missing("backup-dir".into()),
    ];
    assert_eq!(error.problems, expect);
    assert!(error.usage.starts_with("usage: provkit backup -- --resource-name"));
}

#[sealed_test]
fn config_file_drives_schedule_and_retention() -> Result<()> {
    write(
        "provkit.toml",
        indoc! {r#"
            [schedule]
            monthly_day = 15
            weekly_day = "Saturday"

            [retention]
            daily = 3
        "#},
    )?;

    let config = ProvisionConfig::load("provkit.toml")?;
    let today = NaiveDate::from_ymd_opt(2024, 9, 14).expect("valid date");
    assert_eq!(config.schedule.tier_for(today), Tier::Weekly);
    assert_eq!(config.retention.window(Tier::Daily), Duration::from_secs(3 * DAY));
    assert_eq!(config.retention.weekly, Retention::default().weekly);

    Ok(())
}
