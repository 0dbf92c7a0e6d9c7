//! Result-element token parser.
//!
//! A result body such as `hit;wait250;lick[12,45,67]` is split into elements
//! and each element is classified against three configured name sets:
//!
//! | Order | Set | Element shape | Record |
//! |-------|-----|---------------|--------|
//! | 1 | status | exactly `name` | [`ResultRecord::Status`] |
//! | 2 | values | `name` + integer | [`ResultRecord::Value`] |
//! | 3 | arrays | `name` + `[` ints `]` | [`ResultRecord::Array`] |
//! | 4 | - | anything else | [`ResultRecord::Unknown`] |
//!
//! The first match wins. Matching is by prefix, so names must be chosen so
//! that none is a prefix of another.
//!
//! A value or array element whose numbers fail to convert yields *no*
//! record at all: the failure is logged and the next element is parsed.
//! Downstream tallies rely on such elements being neither counted nor
//! reported as unknown.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, TokenError};
use crate::identifiers::SubscriptionId;
use crate::transport::Connection;

use super::Event;
use super::split_elements;

// ============================================================================
// ResultRecord
// ============================================================================

/// The parse of one result element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultRecord {
    /// The element equals a status name.
    Status {
        /// Status name.
        name: String,
    },

    /// A value name followed by a decimal integer.
    Value {
        /// Value name.
        name: String,
        /// Parsed integer.
        value: i64,
    },

    /// An array name followed by a bracketed integer list.
    Array {
        /// Array name.
        name: String,
        /// Parsed integers, in order. May be empty.
        values: Vec<i64>,
    },

    /// Nothing matched.
    Unknown {
        /// The raw element.
        raw: String,
    },
}

impl ResultRecord {
    /// Creates a status record.
    #[inline]
    #[must_use]
    pub fn status(name: impl Into<String>) -> Self {
        Self::Status { name: name.into() }
    }

    /// Creates a value record.
    #[inline]
    #[must_use]
    pub fn value(name: impl Into<String>, value: i64) -> Self {
        Self::Value {
            name: name.into(),
            value,
        }
    }

    /// Creates an array record.
    #[inline]
    #[must_use]
    pub fn array(name: impl Into<String>, values: impl Into<Vec<i64>>) -> Self {
        Self::Array {
            name: name.into(),
            values: values.into(),
        }
    }

    /// Creates an unknown record.
    #[inline]
    #[must_use]
    pub fn unknown(raw: impl Into<String>) -> Self {
        Self::Unknown { raw: raw.into() }
    }

    /// Returns the configured name this record matched, if any.
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Status { name } | Self::Value { name, .. } | Self::Array { name, .. } => {
                Some(name)
            }
            Self::Unknown { .. } => None,
        }
    }
}

// ============================================================================
// ParseEvent
// ============================================================================

/// One step of a parse pass.
///
/// Every pass is bracketed by `Begin` and `End`, so observers can tell
/// "no records this pass" apart from "an empty array this pass".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ParseEvent {
    /// A pass is starting.
    Begin,
    /// One element was classified.
    Record(ResultRecord),
    /// The pass is complete.
    End,
}

// ============================================================================
// ResultNames
// ============================================================================

/// The three name sets a parser is built from.
///
/// Insertion order is preserved; it is the order in which value and array
/// prefixes are tried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultNames {
    /// Names matched exactly.
    pub status: Vec<String>,
    /// Prefixes followed by an integer.
    pub values: Vec<String>,
    /// Prefixes followed by a bracketed integer list.
    pub arrays: Vec<String>,
}

impl ResultNames {
    /// Creates empty name sets.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds status names.
    #[must_use]
    pub fn with_status(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.status.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds value names.
    #[must_use]
    pub fn with_values(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.values.extend(names.into_iter().map(Into::into));
        self
    }

    /// Adds array names.
    #[must_use]
    pub fn with_arrays(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.arrays.extend(names.into_iter().map(Into::into));
        self
    }

    /// Loads name sets from JSON, e.g. `{"status": ["hit"], "values": ["wait"]}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns `true` if `name` is a status name.
    #[inline]
    #[must_use]
    pub fn is_status(&self, name: &str) -> bool {
        self.status.iter().any(|s| s == name)
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// Outcome of trying one matcher against one element.
enum Outcome {
    /// Record produced; stop.
    Matched(ResultRecord),
    /// Prefix matched but the numbers did not convert; stop with no record.
    Failed(TokenError),
    /// Not this matcher; try the next one.
    Skip,
}

/// One typed name test. Matchers are tried in list order.
#[derive(Debug, Clone)]
enum Matcher {
    Status(String),
    Value(String),
    Array(String),
}

impl Matcher {
    /// Name of the set the matcher was built from.
    const fn category(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Value(_) => "value",
            Self::Array(_) => "array",
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Status(name) | Self::Value(name) | Self::Array(name) => name,
        }
    }

    fn try_match(&self, element: &str) -> Outcome {
        match self {
            Self::Status(name) => {
                if element == name {
                    Outcome::Matched(ResultRecord::status(name.as_str()))
                } else {
                    Outcome::Skip
                }
            }
            Self::Value(name) => {
                let Some(suffix) = element.strip_prefix(name.as_str()) else {
                    return Outcome::Skip;
                };
                match suffix.trim().parse::<i64>() {
                    Ok(value) => Outcome::Matched(ResultRecord::value(name.as_str(), value)),
                    Err(source) => Outcome::Failed(TokenError::Value {
                        name: name.clone(),
                        element: element.to_string(),
                        source,
                    }),
                }
            }
            Self::Array(name) => {
                let Some(interior) = element
                    .strip_prefix(name.as_str())
                    .and_then(|suffix| suffix.strip_prefix('['))
                    .and_then(|suffix| suffix.strip_suffix(']'))
                else {
                    // names sharing a prefix fall through to the next array name
                    return Outcome::Skip;
                };

                let parsed: std::result::Result<Vec<i64>, _> = interior
                    .split(',')
                    .map(str::trim)
                    .filter(|piece| !piece.is_empty())
                    .map(str::parse::<i64>)
                    .collect();

                match parsed {
                    Ok(values) => Outcome::Matched(ResultRecord::array(name.as_str(), values)),
                    Err(source) => Outcome::Failed(TokenError::Array {
                        name: name.clone(),
                        element: element.to_string(),
                        source,
                    }),
                }
            }
        }
    }
}

// ============================================================================
// ResultParser
// ============================================================================

/// Splits result bodies and classifies each element.
///
/// # Example
///
/// ```
/// use ublock::{ResultNames, ResultParser, ResultRecord};
///
/// let parser = ResultParser::new(
///     ResultNames::new()
///         .with_status(["hit", "miss"])
///         .with_values(["wait"])
///         .with_arrays(["lick"]),
/// )?;
///
/// let records = parser.parse("hit;wait250;lick[12,45,67]");
/// assert_eq!(records[0], ResultRecord::status("hit"));
/// assert_eq!(records[1], ResultRecord::value("wait", 250));
/// assert_eq!(records[2], ResultRecord::array("lick", vec![12, 45, 67]));
/// # Ok::<(), ublock::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ResultParser {
    /// The validated name sets.
    names: ResultNames,
    /// Statuses, then values, then arrays.
    matchers: Vec<Matcher>,
}

impl ResultParser {
    /// Builds a parser from validated name sets.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateName`] if a name appears in more than one set
    /// - [`Error::Config`] if a name is empty
    pub fn new(names: ResultNames) -> Result<Self> {
        let mut seen: FxHashMap<String, &'static str> = FxHashMap::default();
        let mut validated = ResultNames::new();
        let mut matchers = Vec::new();

        let sets: [(&Vec<String>, fn(String) -> Matcher); 3] = [
            (&names.status, Matcher::Status),
            (&names.values, Matcher::Value),
            (&names.arrays, Matcher::Array),
        ];

        for (list, build) in sets {
            for name in list {
                let matcher = build(name.clone());
                let category = matcher.category();
                if name.is_empty() {
                    return Err(Error::config(format!("empty {category} name")));
                }
                if let Some(&first) = seen.get(name) {
                    if first == category {
                        debug!(%name, category, "Ignoring repeated result name");
                        continue;
                    }
                    return Err(Error::duplicate_name(name.as_str(), first, category));
                }
                seen.insert(name.clone(), category);

                let set = match matcher {
                    Matcher::Status(_) => &mut validated.status,
                    Matcher::Value(_) => &mut validated.values,
                    Matcher::Array(_) => &mut validated.arrays,
                };
                set.push(matcher.name().to_string());
                matchers.push(matcher);
            }
        }

        debug!(
            status = validated.status.len(),
            values = validated.values.len(),
            arrays = validated.arrays.len(),
            "Result parser configured"
        );

        Ok(Self {
            names: validated,
            matchers,
        })
    }

    /// Returns the name sets this parser was built from.
    #[inline]
    #[must_use]
    pub fn names(&self) -> &ResultNames {
        &self.names
    }

    /// Classifies one element.
    ///
    /// # Errors
    ///
    /// Returns the [`TokenError`] when a value or array prefix matched but
    /// its numbers did not convert.
    pub fn classify_element(&self, element: &str) -> std::result::Result<ResultRecord, TokenError> {
        let element = element.trim();
        for matcher in &self.matchers {
            match matcher.try_match(element) {
                Outcome::Matched(record) => return Ok(record),
                Outcome::Failed(err) => return Err(err),
                Outcome::Skip => {}
            }
        }
        Ok(ResultRecord::unknown(element))
    }

    /// Runs one parse pass over a result body, reporting every step to `sink`.
    pub fn parse_with<F>(&self, body: &str, mut sink: F)
    where
        F: FnMut(ParseEvent),
    {
        trace!(body, "Parsing result");
        sink(ParseEvent::Begin);
        for element in split_elements(body) {
            match self.classify_element(element) {
                Ok(record) => sink(ParseEvent::Record(record)),
                Err(err) => warn!(error = %err, "Dropping malformed result element"),
            }
        }
        sink(ParseEvent::End);
    }

    /// Parses a result body into its records.
    #[must_use]
    pub fn parse(&self, body: &str) -> Vec<ResultRecord> {
        let mut records = Vec::new();
        self.parse_with(body, |event| {
            if let ParseEvent::Record(record) = event {
                records.push(record);
            }
        });
        records
    }

    /// Parses every result message received on `connection`.
    ///
    /// Returns the subscription, which can be removed with
    /// [`Connection::unsubscribe`].
    pub fn attach<F>(self: &Arc<Self>, connection: &Connection, sink: F) -> SubscriptionId
    where
        F: Fn(&ParseEvent) + Send + Sync + 'static,
    {
        let parser = Arc::clone(self);
        connection.subscribe(move |event| {
            if let Event::Result(body) = event {
                parser.parse_with(body, |step| sink(&step));
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
