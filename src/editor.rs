// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keyed line editing.
//!
//! Converge a single parameter line of a configuration file to a desired
//! value. Most service configuration files (php.ini, Apache and Nginx
//! configuration, Postfix main.cf, apt configuration fragments) keep one
//! parameter per line, so a parameter can be located by matching the start
//! of each line against its key.
//!
//! # Reconciliation Rules
//!
//! Every edit first counts the lines that match the key:
//!
//! - Exactly one match: the line is rewritten into canonical form while
//!   keeping its leading indentation.
//! - No match: depending on [`UpsertMode`], the edit either fails, appends a
//!   new line at the end of the file, or inserts the new line right after an
//!   anchor line.
//! - More than one match: the edit always fails. Ambiguity is never resolved
//!   automatically.
//!
//! A failed edit never touches the file. Repeating a successful edit leaves
//! the file byte-identical.
//!
//! # Pitfalls
//!
//! There is no file locking. Callers must not run two editors against the
//! same file at the same time.

use regex::Regex;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    path::PathBuf,
};
use tracing::{info, instrument};

/// Manage keyed parameter lines of a configuration file.
#[derive(Clone, Debug)]
pub struct ConfigEditor {
    path: PathBuf,
}

impl ConfigEditor {
    /// Construct new editor for configuration file at `path`.
    ///
    /// The file is not opened until an edit is requested.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Count lines matching key without modifying anything.
    ///
    /// # Errors
    ///
    /// - Return [`EditError::Read`] if configuration file cannot be read.
    /// - Return [`EditError::Pattern`] if key pattern cannot be compiled.
    pub fn scan(&self, key: &str, syntax: &Syntax) -> Result<ConfigLine> {
        let lines = self.read()?;
        Ok(lines.scan(key, &syntax.key_pattern(key)?))
    }

    /// Update parameter line, or insert it according to mode.
    ///
    /// # Errors
    ///
    /// - Return [`EditError::Read`] if configuration file cannot be read.
    /// - Return [`EditError::Reconcile`] if match count forbids the edit.
    /// - Return [`EditError::Write`] if edited content cannot be written.
    #[instrument(skip(self, value, syntax, mode), fields(path = ?self.path), level = "debug")]
    pub fn upsert(
        &self,
        key: &str,
        value: &str,
        syntax: &Syntax,
        mode: &UpsertMode,
    ) -> Result<Outcome> {
        let mut lines = self.read()?;
        let outcome = lines
            .upsert(key, value, syntax, mode)
            .map_err(|err| self.reconcile_error(err))?;
        self.commit(&lines, outcome)?;
        info!("{outcome} {key:?} in {:?}", self.path.display());

        Ok(outcome)
    }

    /// Uncomment a commented-out directive.
    ///
    /// Does nothing if the directive is already active.
    ///
    /// # Errors
    ///
    /// - Return [`EditError::Read`] if configuration file cannot be read.
    /// - Return [`EditError::Reconcile`] if match count forbids the edit.
    /// - Return [`EditError::Write`] if edited content cannot be written.
    #[instrument(skip(self), fields(path = ?self.path), level = "debug")]
    pub fn enable(&self, key: &str) -> Result<Outcome> {
        let mut lines = self.read()?;
        let outcome = lines.enable(key).map_err(|err| self.reconcile_error(err))?;
        self.commit(&lines, outcome)?;
        info!("{outcome} {key:?} in {:?}", self.path.display());

        Ok(outcome)
    }

    fn read(&self) -> Result<ConfigLines> {
        read_to_string(&self.path)
            .map(|content| ConfigLines::from(content.as_str()))
            .map_err(|err| EditError::Read {
                source: err,
                path: self.path.clone(),
            })
    }

    fn commit(&self, lines: &ConfigLines, outcome: Outcome) -> Result<()> {
        if outcome == Outcome::Unchanged {
            return Ok(());
        }

        write(&self.path, lines.to_string().as_bytes()).map_err(|err| EditError::Write {
            source: err,
            path: self.path.clone(),
        })
    }

    fn reconcile_error(&self, err: MatchError) -> EditError {
        EditError::Reconcile {
            source: err,
            path: self.path.clone(),
        }
    }
}

/// How a parameter line is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// `key = value` starting at column zero, e.g., php.ini or main.cf.
    Assignment,

    /// Possibly indented `key value`, e.g., Apache or Nginx directives.
    Directive,

    /// Any line starting with key, e.g., apt configuration declarations.
    Declaration,
}

/// Line grammar used to find and render a parameter line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syntax {
    style: Style,
    separator: String,
    terminator: String,
}

impl Syntax {
    /// Grammar for `key = value` lines.
    pub fn assignment() -> Self {
        Self {
            style: Style::Assignment,
            separator: " = ".into(),
            terminator: String::new(),
        }
    }

    /// Grammar for `key value` directive lines.
    pub fn directive() -> Self {
        Self {
            style: Style::Directive,
            separator: " ".into(),
            terminator: String::new(),
        }
    }

    /// Grammar for declaration lines joined by `separator`.
    pub fn declaration(separator: impl Into<String>) -> Self {
        Self {
            style: Style::Declaration,
            separator: separator.into(),
            terminator: String::new(),
        }
    }

    /// Use a different separator between key and value.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Append terminator to rendered lines, e.g., ";" for Nginx.
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Layout style of grammar.
    pub fn style(&self) -> Style {
        self.style
    }

    fn key_pattern(&self, key: &str) -> Result<Regex, regex::Error> {
        let key = regex::escape(key);
        let pattern = match self.style {
            Style::Assignment => format!(r"^{key}[ \t]*=.*$"),
            Style::Directive => format!(r"^[ \t]*{key}[ \t].*$"),
            Style::Declaration => format!(r"^{key}.*$"),
        };

        Regex::new(&pattern)
    }

    fn render(&self, indent: &str, key: &str, value: &str) -> String {
        format!("{indent}{key}{}{value}{}", self.separator, self.terminator)
    }

    // INVARIANT: Only directives may be indented, other styles match at column zero.
    fn indent_after<'a>(&self, anchor: &'a str) -> &'a str {
        match self.style {
            Style::Directive => indentation(anchor),
            Style::Assignment | Style::Declaration => "",
        }
    }
}

impl Default for Syntax {
    fn default() -> Self {
        Self::assignment()
    }
}

/// What to do when no line matches the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpsertMode {
    /// Fail, the parameter must already exist.
    #[default]
    UpdateOnly,

    /// Append the parameter line to the end of the file.
    AppendIfMissing,

    /// Insert parameter line right after the first line starting with anchor.
    InsertAfterAnchor(String),
}

/// Result of a successful edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Existing line rewritten.
    Updated,

    /// Existing line already in desired state.
    Unchanged,

    /// New line appended to end of file.
    Appended,

    /// New line inserted after anchor.
    Inserted,

    /// Commented-out directive uncommented.
    Enabled,
}

impl Display for Outcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let word = match self {
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Appended => "appended",
            Self::Inserted => "inserted",
            Self::Enabled => "enabled",
        };
        fmt.write_str(word)
    }
}

/// Match result of scanning configuration lines for a key.
///
/// Computed through one linear scan. Only the first match is recorded, but
/// edits refuse to go through unless `match_count` is at most one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    /// Key that was searched for.
    pub key: String,

    /// Number of lines matching key.
    pub match_count: usize,

    /// Content of first matching line without its line ending.
    pub raw_line: Option<String>,

    /// Zero-based index of first matching line.
    pub line_index: Option<usize>,
}

/// In-memory configuration file content.
///
/// Lines keep their original endings, so any line that is not edited is
/// written back byte-for-byte.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigLines {
    lines: Vec<(String, String)>,
}

impl ConfigLines {
    /// Count lines matching pattern.
    pub fn scan(&self, key: &str, pattern: &Regex) -> ConfigLine {
        let mut found = ConfigLine {
            key: key.into(),
            match_count: 0,
            raw_line: None,
            line_index: None,
        };

        for (index, (body, _)) in self.lines.iter().enumerate() {
            if pattern.is_match(body) {
                if found.match_count == 0 {
                    found.raw_line = Some(body.clone());
                    found.line_index = Some(index);
                }
                found.match_count += 1;
            }
        }

        found
    }

    /// Update or insert parameter line in memory.
    ///
    /// # Errors
    ///
    /// - Return [`MatchError::NoMatch`] if nothing matched in update-only mode.
    /// - Return [`MatchError::MultipleMatches`] if more than one line matched.
    /// - Return [`MatchError::AnchorNotFound`] if anchor line is missing.
    /// - Return [`MatchError::Pattern`] if key pattern cannot be compiled.
    pub fn upsert(
        &mut self,
        key: &str,
        value: &str,
        syntax: &Syntax,
        mode: &UpsertMode,
    ) -> Result<Outcome, MatchError> {
        let found = self.scan(key, &syntax.key_pattern(key)?);
        match (found.match_count, found.line_index) {
            (1, Some(index)) => {
                let body = &self.lines[index].0;
                let rendered = syntax.render(indentation(body), key, value);
                if *body == rendered {
                    return Ok(Outcome::Unchanged);
                }

                self.lines[index].0 = rendered;
                Ok(Outcome::Updated)
            }
            (0, _) => match mode {
                UpsertMode::UpdateOnly => Err(MatchError::NoMatch { key: key.into() }),
                UpsertMode::AppendIfMissing => {
                    self.append(syntax.render("", key, value));
                    Ok(Outcome::Appended)
                }
                UpsertMode::InsertAfterAnchor(anchor) => {
                    let index = self.find_anchor(anchor)?;
                    let indent = syntax.indent_after(&self.lines[index].0);
                    let rendered = syntax.render(indent, key, value);
                    self.insert_after(index, rendered);
                    Ok(Outcome::Inserted)
                }
            },
            (count, _) => Err(MatchError::MultipleMatches {
                key: key.into(),
                count,
            }),
        }
    }

    /// Uncomment single commented-out directive in memory.
    ///
    /// # Errors
    ///
    /// - Return [`MatchError::NoMatch`] if no commented directive exists.
    /// - Return [`MatchError::MultipleMatches`] if directive is ambiguous.
    /// - Return [`MatchError::Pattern`] if key pattern cannot be compiled.
    pub fn enable(&mut self, key: &str) -> Result<Outcome, MatchError> {
        let escaped = regex::escape(key);
        let active = Regex::new(&format!(r"^[ \t]*{escaped}([ \t].*)?$"))?;
        let commented = Regex::new(&format!(r"^[ \t]*#[ \t]*{escaped}([ \t].*)?$"))?;

        let found = self.scan(key, &active);
        match found.match_count {
            0 => {}
            1 => return Ok(Outcome::Unchanged),
            count => {
                return Err(MatchError::MultipleMatches {
                    key: key.into(),
                    count,
                })
            }
        }

        let found = self.scan(key, &commented);
        match (found.match_count, found.line_index) {
            (1, Some(index)) => {
                let body = &self.lines[index].0;
                let indent = indentation(body);
                let directive = body[indent.len()..]
                    .trim_start_matches('#')
                    .trim_start_matches([' ', '\t']);
                self.lines[index].0 = format!("{indent}{directive}");
                Ok(Outcome::Enabled)
            }
            (0, _) => Err(MatchError::NoMatch { key: key.into() }),
            (count, _) => Err(MatchError::MultipleMatches {
                key: key.into(),
                count,
            }),
        }
    }

    fn find_anchor(&self, anchor: &str) -> Result<usize, MatchError> {
        let pattern = Regex::new(&format!(r"^[ \t]*{}", regex::escape(anchor)))?;
        self.lines
            .iter()
            .position(|(body, _)| pattern.is_match(body))
            .ok_or_else(|| MatchError::AnchorNotFound {
                anchor: anchor.into(),
            })
    }

    fn append(&mut self, body: String) {
        let ending = self
            .lines
            .iter()
            .rev()
            .map(|(_, ending)| ending.as_str())
            .find(|ending| !ending.is_empty())
            .unwrap_or("\n")
            .to_owned();

        if let Some((_, last)) = self.lines.last_mut() {
            if last.is_empty() {
                *last = ending.clone();
            }
        }
        self.lines.push((body, ending));
    }

    fn insert_after(&mut self, index: usize, body: String) {
        // INVARIANT: Keep absence of trailing newline when anchor is last line.
        let ending = &mut self.lines[index].1;
        let new_ending = if ending.is_empty() {
            *ending = "\n".into();
            String::new()
        } else {
            ending.clone()
        };
        self.lines.insert(index + 1, (body, new_ending));
    }
}

impl From<&str> for ConfigLines {
    fn from(content: &str) -> Self {
        let lines = content
            .split_inclusive('\n')
            .map(|raw| {
                let (body, ending) = if let Some(body) = raw.strip_suffix("\r\n") {
                    (body, "\r\n")
                } else if let Some(body) = raw.strip_suffix('\n') {
                    (body, "\n")
                } else {
                    (raw, "")
                };
                (body.to_owned(), ending.to_owned())
            })
            .collect();

        Self { lines }
    }
}

impl Display for ConfigLines {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for (body, ending) in &self.lines {
            fmt.write_str(body)?;
            fmt.write_str(ending)?;
        }

        Ok(())
    }
}

fn indentation(body: &str) -> &str {
    let rest = body.trim_start_matches([' ', '\t']);
    &body[..body.len() - rest.len()]
}

/// Match count violations.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// Key was required to exist, but no line matched.
    #[error("no line matched {key:?}")]
    NoMatch { key: String },

    /// Key is ambiguous.
    #[error("more than one line matched {key:?} ({count} lines)")]
    MultipleMatches { key: String, count: usize },

    /// Anchor line for insertion does not exist.
    #[error("insertion point {anchor:?} not found")]
    AnchorNotFound { anchor: String },

    /// Key or anchor could not be turned into a pattern.
    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

/// Keyed line editing error types.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    /// Configuration file cannot be read from.
    #[error("failed to read configuration file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file cannot be written to.
    #[error("failed to write configuration file at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Match count of key forbids the requested edit.
    #[error("cannot edit configuration file at {:?}", path.display())]
    Reconcile {
        #[source]
        source: MatchError,
        path: PathBuf,
    },

    /// Key could not be turned into a pattern.
    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

/// Friendly result alias :3
pub type Result<T, E = EditError> = std::result::Result<T, E>;
