// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Untyped `--key value` parameter sets.
//!
//! Scheduled jobs receive their parameters as plain `--key value` pairs.
//! Each job declares the keys it expects up front. Parsing collects every
//! problem before giving up, so the operator sees all unexpected and all
//! missing keys at once along with a usage line.
//!
//! A successfully parsed [`ParameterSet`] cannot be modified afterwards. It is
//! handed explicitly to whatever needs it.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::info;

/// Prefix every key must carry on the command line.
pub const KEY_PREFIX: &str = "--";

/// Validated, read-only parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSet {
    keys: Vec<String>,
    values: HashMap<String, String>,
}

impl ParameterSet {
    /// Parse argument pairs against expected keys.
    ///
    /// Arguments are consumed two at a time. A trailing key without a value
    /// counts as having an empty value.
    ///
    /// # Errors
    ///
    /// - Return [`ParamError`] listing every unexpected and missing key if
    ///   the arguments do not fill the expected key set exactly.
    pub fn parse(
        program: &str,
        argv: impl IntoIterator<Item = impl Into<String>>,
        expected: &[&str],
    ) -> Result<Self> {
        let keys = expected.iter().map(|key| key.to_string()).collect::<Vec<_>>();
        let mut values = keys
            .iter()
            .map(|key| (key.clone(), String::new()))
            .collect::<HashMap<_, _>>();
        let mut problems = Vec::new();

        let mut argv = argv.into_iter().map(Into::into);
        while let Some(raw) = argv.next() {
            let value = argv.next().unwrap_or_default();
            match raw.strip_prefix(KEY_PREFIX) {
                Some(key) if values.contains_key(key) => {
                    values.insert(key.to_owned(), value);
                }
                _ => problems.push(Problem::Unexpected(raw)),
            }
        }

        for key in &keys {
            if values.get(key).is_none_or(String::is_empty) {
                problems.push(Problem::Missing(key.clone()));
            }
        }

        if !problems.is_empty() {
            return Err(ParamError {
                problems,
                usage: usage(program, &keys),
            });
        }

        let params = Self { keys, values };
        for (key, value) in params.iter() {
            info!("parameter {key} = {value}");
        }

        Ok(params)
    }

    /// Value of key, if key was declared.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterate over key and value pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys
            .iter()
            .map(|key| (key.as_str(), self.values[key].as_str()))
    }
}

/// Synthesize usage line enumerating expected keys.
pub fn usage(program: &str, keys: &[impl AsRef<str>]) -> String {
    let mut line = format!("usage: {program}");
    for key in keys {
        let key = key.as_ref();
        line.push_str(&format!(" {KEY_PREFIX}{key} <{key}>"));
    }

    line
}

/// Single parameter problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// Argument is not a declared key.
    Unexpected(String),

    /// Declared key has no value.
    Missing(String),
}

impl Display for Problem {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Unexpected(raw) => write!(fmt, "unexpected parameter {raw:?}"),
            Self::Missing(key) => write!(fmt, "missing parameter {KEY_PREFIX}{key}"),
        }
    }
}

/// Parameter set does not match expected keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid parameters:\n{}\n{usage}", problem_lines(problems))]
pub struct ParamError {
    /// Every problem found, in discovery order.
    pub problems: Vec<Problem>,

    /// Usage line listing expected keys.
    pub usage: String,
}

fn problem_lines(problems: &[Problem]) -> String {
    problems
        .iter()
        .map(|problem| format!("  {problem}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Friendly result alias :3
pub type Result<T, E = ParamError> = std::result::Result<T, E>;
