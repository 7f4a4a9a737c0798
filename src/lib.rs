// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent server provisioning helpers.
//!
//! Provkit bundles the small chores that come up when a fresh server is
//! brought into shape, and makes each of them safe to run again:
//!
//! - Keep a single `key value` style entry of a configuration file in line
//!   with a desired value, see [`editor`].
//! - Locate a block device by size, give it a filesystem if it has none, and
//!   register it in the persisted mount table, see [`disk`].
//! - Take a tiered daily, weekly, or monthly database dump and prune old
//!   dumps per tier, see [`backup`].
//! - Accept untyped `--key value` parameters for scheduled jobs, see
//!   [`params`].
//!
//! # Idempotence
//!
//! Running any operation twice with the same inputs leaves the host exactly
//! as running it once does. Files are only written when their content would
//! actually change, and devices are only formatted when they carry no
//! filesystem yet.
//!
//! # Process Invocation
//!
//! External tools are always run with explicit argument vectors, never
//! through a shell, see [`syscall`].

pub mod backup;
pub mod config;
pub mod database;
pub mod disk;
pub mod editor;
pub mod logging;
pub mod params;
pub mod path;
pub mod syscall;
pub mod wait;
