//! Variable interpolation for block text fields
//!
//! Text may reference variables with `{{name}}`, or a column of a table variable with
//! `{{table.column}}`. Tokens are scanned left to right without overlap.
//!
//! - `{{name}}` is replaced with the current value of the scalar variable `name`. A table
//!   named this way is replaced with a row-count summary.
//! - `{{table.column}}` drives per-row iteration: [`Interpolator::interpolate_rows`]
//!   produces one rendering per row of `table`, in row order. Outside of a row context
//!   the token renders as the table's row-count summary.
//!
//! References that cannot be resolved are handled according to [`MissingValue`].

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::variables::{TableData, TableRow, VariableStore, VariableValue};

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)(?:\.([A-Za-z0-9_\-]+))?\s*\}\}")
        .expect("token pattern is a valid regex")
});

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("Variable `{0}` not found or has no value")]
    MissingVariable(String),

    #[error("Table `{0}` not found")]
    NotATable(String),

    #[error("Text references columns of more than one table: `{0}` and `{1}`")]
    MixedTables(String, String),
}

/// What a single `{{...}}` token refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRef {
    Variable(String),
    Column { table: String, column: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Byte range of the whole token, braces included
    pub range: Range<usize>,
    pub reference: TokenRef,
}

impl Token {
    /// Name of the referenced variable (the table, for column references)
    pub fn variable_name(&self) -> &str {
        match &self.reference {
            TokenRef::Variable(name) => name,
            TokenRef::Column { table, .. } => table,
        }
    }

    fn display_name(&self) -> String {
        match &self.reference {
            TokenRef::Variable(name) => name.clone(),
            TokenRef::Column { table, column } => format!("{table}.{column}"),
        }
    }
}

/// Scan text for interpolation tokens
pub fn tokens(text: &str) -> Vec<Token> {
    TOKEN_PATTERN
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?.as_str().to_string();
            let reference = match caps.get(2) {
                Some(column) => TokenRef::Column {
                    table: name,
                    column: column.as_str().to_string(),
                },
                None => TokenRef::Variable(name),
            };
            Some(Token {
                range: whole.range(),
                reference,
            })
        })
        .collect()
}

/// How to render a reference that has no value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValue {
    /// Substitute "no value saved to `<name>`"
    #[default]
    Fallback,
    /// Leave the token in the text as written
    Keep,
    /// Fail with [`InterpolationError::MissingVariable`]
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpolationPolicy {
    pub missing: MissingValue,
    /// Wrap substituted values in double quotes, escaping embedded quotes
    pub quote_values: bool,
}

impl InterpolationPolicy {
    pub fn new(missing: MissingValue) -> Self {
        Self {
            missing,
            quote_values: false,
        }
    }

    /// Policy for source code: values become string literals, missing values are errors
    pub fn code() -> Self {
        Self {
            missing: MissingValue::Error,
            quote_values: true,
        }
    }
}

/// Result of interpolating a piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolated {
    pub text: String,
    /// References that had no value, in order of appearance
    pub unresolved: Vec<String>,
}

impl Interpolated {
    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// One rendering of a text for one row of the table it iterates over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInterpolation {
    pub row_id: String,
    pub text: String,
    pub unresolved: Vec<String>,
}

pub fn fallback_text(name: &str) -> String {
    format!("no value saved to `{name}`")
}

pub fn table_summary(name: &str, table: &TableData) -> String {
    match table.rows.len() {
        1 => format!("[table {name}: 1 row]"),
        n => format!("[table {name}: {n} rows]"),
    }
}

/// True iff a variable with this name exists, whatever its current value
pub fn is_resolved(store: &VariableStore, name: &str) -> bool {
    store.contains_name(name)
}

/// Every token in the text, paired with whether its variable exists
pub fn highlight(store: &VariableStore, text: &str) -> Vec<(Token, bool)> {
    tokens(text)
        .into_iter()
        .map(|token| {
            let resolved = is_resolved(store, token.variable_name());
            (token, resolved)
        })
        .collect()
}

/// The `(table, column)` pair a text iterates over, if it contains column references
pub fn row_source(text: &str) -> Result<Option<(String, String)>, InterpolationError> {
    let mut source: Option<(String, String)> = None;
    for token in tokens(text) {
        if let TokenRef::Column { table, column } = token.reference {
            match &source {
                None => source = Some((table, column)),
                Some((first, _)) if *first != table => {
                    return Err(InterpolationError::MixedTables(first.clone(), table));
                }
                Some(_) => {}
            }
        }
    }
    Ok(source)
}

/// Renders text against the current contents of a [`VariableStore`]
pub struct Interpolator<'a> {
    store: &'a VariableStore,
    policy: InterpolationPolicy,
}

impl<'a> Interpolator<'a> {
    pub fn new(store: &'a VariableStore, policy: InterpolationPolicy) -> Self {
        Self { store, policy }
    }

    /// Interpolate outside of any row context
    pub fn interpolate(&self, text: &str) -> Result<Interpolated, InterpolationError> {
        self.render(text, None)
    }

    /// Interpolate once per row of the table referenced by the text's column tokens.
    ///
    /// Text without column references yields a single rendering with an empty row id.
    pub fn interpolate_rows(
        &self,
        text: &str,
    ) -> Result<Vec<RowInterpolation>, InterpolationError> {
        let Some((table_name, _)) = row_source(text)? else {
            let rendered = self.interpolate(text)?;
            return Ok(vec![RowInterpolation {
                row_id: String::new(),
                text: rendered.text,
                unresolved: rendered.unresolved,
            }]);
        };

        let table = self
            .store
            .get_variable_by_name(&table_name)
            .and_then(|v| v.as_table().cloned())
            .ok_or_else(|| InterpolationError::NotATable(table_name.clone()))?;

        table
            .rows
            .iter()
            .map(|row| {
                let rendered = self.render(text, Some((&table_name, row)))?;
                Ok(RowInterpolation {
                    row_id: row.id.clone(),
                    text: rendered.text,
                    unresolved: rendered.unresolved,
                })
            })
            .collect()
    }

    fn render(
        &self,
        text: &str,
        row: Option<(&str, &TableRow)>,
    ) -> Result<Interpolated, InterpolationError> {
        let mut output = String::with_capacity(text.len());
        let mut unresolved = Vec::new();
        let mut last = 0;

        for token in tokens(text) {
            output.push_str(&text[last..token.range.start]);
            last = token.range.end;

            match self.resolve(&token, row) {
                Some(value) => output.push_str(&self.format_value(&value)),
                None => {
                    let name = token.display_name();
                    match self.policy.missing {
                        MissingValue::Fallback => output.push_str(&fallback_text(&name)),
                        MissingValue::Keep => output.push_str(&text[token.range.clone()]),
                        MissingValue::Error => {
                            return Err(InterpolationError::MissingVariable(name));
                        }
                    }
                    unresolved.push(name);
                }
            }
        }
        output.push_str(&text[last..]);

        Ok(Interpolated {
            text: output,
            unresolved,
        })
    }

    fn resolve(&self, token: &Token, row: Option<(&str, &TableRow)>) -> Option<String> {
        match &token.reference {
            TokenRef::Column { table, column } => {
                if let Some((row_table, row)) = row {
                    if row_table == table {
                        return row.get(column).filter(|value| !value.is_empty());
                    }
                }
                let variable = self.store.get_variable_by_name(table)?;
                variable.as_table().map(|data| table_summary(table, data))
            }
            TokenRef::Variable(name) => {
                let variable = self.store.get_variable_by_name(name)?;
                match &variable.value {
                    VariableValue::Scalar(value) if value.is_empty() => None,
                    VariableValue::Scalar(value) => Some(value.clone()),
                    VariableValue::Table(data) => Some(table_summary(name, data)),
                }
            }
        }
    }

    fn format_value(&self, value: &str) -> String {
        if self.policy.quote_values {
            format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
        } else {
            value.to_string()
        }
    }
}
