// Copyright 2025 Sense Dispatch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Logic-less message templates.
//!
//! Templates are plain text with `{{field.path}}` placeholders. Each
//! placeholder is replaced by the value at that path in the change document.
//! There are no sections, conditionals or escapes: a template either renders
//! completely or fails with a [`RenderError`].
//!
//! | Value | Rendered as |
//! |---|---|
//! | string | the string itself |
//! | integer, double, boolean | its literal (`42`, `1.5`, `true`) |
//! | null | empty string |
//! | object id | hex string |
//! | date | RFC 3339 timestamp |
//! | document, array | relaxed extended JSON |
//!
//! ```rust
//! use sense_dispatch_core::template::Template;
//! use bson::doc;
//!
//! let template = Template::parse("Patient {{patient.name}} visited on {{date}}").unwrap();
//! let rendered = template
//!     .render(&doc! { "patient": { "name": "Bob" }, "date": "2016-03-01" })
//!     .unwrap();
//!
//! assert_eq!(rendered, "Patient Bob visited on 2016-03-01");
//! ```

use crate::event::lookup;
use bson::{Bson, Document};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors parsing or rendering a template.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// The template text is not well formed
    #[error("Malformed template at byte {position}: {reason}")]
    Malformed {
        /// Byte offset of the problem
        position: usize,
        /// What is wrong
        reason: String,
    },

    /// A placeholder does not contain a valid field path
    #[error("Invalid placeholder: {{{{{0}}}}}")]
    InvalidPlaceholder(String),

    /// A placeholder references a field absent from the document
    #[error("Missing field: {0}")]
    MissingField(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{([^{}]*)\}\}").unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
    })
}

fn field_path_regex() -> &'static Regex {
    static FIELD_PATH: OnceLock<Regex> = OnceLock::new();
    FIELD_PATH.get_or_init(|| {
        Regex::new(r"^[^\s.{}]+(\.[^\s.{}]+)*$")
            .unwrap_or_else(|e| panic!("invalid field path regex: {e}"))
    })
}

impl Template {
    /// Parses template text.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Malformed`] for unbalanced braces and
    /// [`RenderError::InvalidPlaceholder`] for placeholders that are not
    /// field paths.
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for captures in placeholder_regex().captures_iter(source) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };

            push_text(&mut segments, source, cursor, whole.start())?;

            let path = inner.as_str().trim();
            if !field_path_regex().is_match(path) {
                return Err(RenderError::InvalidPlaceholder(inner.as_str().to_string()));
            }
            segments.push(Segment::Field(path.to_string()));
            cursor = whole.end();
        }

        push_text(&mut segments, source, cursor, source.len())?;

        Ok(Self { segments })
    }

    /// Renders the template against a document.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::MissingField`] for the first placeholder whose
    /// path does not resolve.
    pub fn render(&self, doc: &Document) -> Result<String, RenderError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(path) => {
                    let value =
                        lookup(doc, path).ok_or_else(|| RenderError::MissingField(path.clone()))?;
                    out.push_str(&display_value(value));
                }
            }
        }
        Ok(out)
    }

    /// Field paths referenced by the template, in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(path) => Some(path.as_str()),
            Segment::Text(_) => None,
        })
    }
}

/// Parses and renders in one step.
///
/// # Errors
///
/// See [`Template::parse`] and [`Template::render`].
pub fn render(source: &str, doc: &Document) -> Result<String, RenderError> {
    Template::parse(source)?.render(doc)
}

fn push_text(
    segments: &mut Vec<Segment>,
    source: &str,
    start: usize,
    end: usize,
) -> Result<(), RenderError> {
    let text = &source[start..end];
    if let Some(offset) = text.find("{{") {
        return Err(RenderError::Malformed {
            position: start + offset,
            reason: "unclosed placeholder".to_string(),
        });
    }
    if let Some(offset) = text.find("}}") {
        return Err(RenderError::Malformed {
            position: start + offset,
            reason: "unopened placeholder".to_string(),
        });
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(())
}

fn display_value(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Null | Bson::Undefined => String::new(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(d) if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e15 => {
            format!("{}", *d as i64)
        }
        Bson::Double(d) => d.to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .unwrap_or_else(|_| dt.to_string()),
        Bson::Document(_) | Bson::Array(_) => value.clone().into_relaxed_extjson().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_simple_interpolation() {
        assert_eq!(render("Hello {{name}}", &doc! { "name": "Ann" }).unwrap(), "Hello Ann");
    }

    #[test]
    fn test_whitespace_inside_braces() {
        assert_eq!(render("Hi {{ name }}!", &doc! { "name": "Ann" }).unwrap(), "Hi Ann!");
    }

    #[test]
    fn test_nested_path() {
        let doc = doc! { "patientRef": { "name": "Bob" } };
        assert_eq!(render("Patient {{patientRef.name}}", &doc).unwrap(), "Patient Bob");
    }

    #[test]
    fn test_value_formatting() {
        let doc = doc! {
            "count": 3_i32,
            "big": 5_000_000_000_i64,
            "whole": 42.0,
            "ratio": 1.5,
            "flag": true,
            "nothing": Bson::Null,
            "list": [1, 2],
        };

        assert_eq!(
            render(
                "{{count}} {{big}} {{whole}} {{ratio}} {{flag}} [{{nothing}}] {{list}}",
                &doc
            )
            .unwrap(),
            "3 5000000000 42 1.5 true [] [1,2]"
        );
    }

    #[test]
    fn test_missing_field() {
        let err = render("Hello {{name}}", &doc! { "other": 1 }).unwrap_err();
        assert_eq!(err, RenderError::MissingField("name".to_string()));
    }

    #[test]
    fn test_unclosed_placeholder() {
        let err = Template::parse("Hello {{name").unwrap_err();
        assert_eq!(
            err,
            RenderError::Malformed {
                position: 6,
                reason: "unclosed placeholder".to_string()
            }
        );
    }

    #[test]
    fn test_unopened_placeholder() {
        let err = Template::parse("Hello name}}").unwrap_err();
        assert!(matches!(err, RenderError::Malformed { position: 10, .. }));
    }

    #[test]
    fn test_invalid_placeholder() {
        assert_eq!(
            Template::parse("{{ first name }}").unwrap_err(),
            RenderError::InvalidPlaceholder(" first name ".to_string())
        );
        assert!(matches!(
            Template::parse("{{}}").unwrap_err(),
            RenderError::InvalidPlaceholder(_)
        ));
        assert!(matches!(
            Template::parse("{{a..b}}").unwrap_err(),
            RenderError::InvalidPlaceholder(_)
        ));
    }

    #[test]
    fn test_plain_text_and_fields() {
        let template = Template::parse("no placeholders").unwrap();
        assert_eq!(template.render(&Document::new()).unwrap(), "no placeholders");
        assert_eq!(template.fields().count(), 0);

        let template = Template::parse("{{a}}{{b.c}}").unwrap();
        assert_eq!(template.fields().collect::<Vec<_>>(), vec!["a", "b.c"]);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            RenderError::InvalidPlaceholder("x y".into()).to_string(),
            "Invalid placeholder: {{x y}}"
        );
    }
}
