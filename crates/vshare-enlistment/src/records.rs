//! Line-oriented key/value record files.
//!
//! ```text
//! A {"Key":"https://example.com/repo","Value":"0f3a..."}
//! D {"Key":"https://example.com/old"}
//! ```
//!
//! The last record for a key wins. A final line with no newline is a torn
//! append from a writer that died mid-write: readers skip it, and the next
//! writer (holding the lock) truncates it away before appending.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct RecordError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Add { key: String, value: String },
    Delete { key: String },
}

#[derive(Serialize, Deserialize)]
struct AddBody<'a> {
    #[serde(rename = "Key", borrow)]
    key: std::borrow::Cow<'a, str>,
    #[serde(rename = "Value", borrow)]
    value: std::borrow::Cow<'a, str>,
}

#[derive(Serialize, Deserialize)]
struct DeleteBody<'a> {
    #[serde(rename = "Key", borrow)]
    key: std::borrow::Cow<'a, str>,
}

impl Record {
    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        Record::Add {
            key: key.into(),
            value: value.into(),
        }
    }

    /// One line, newline included
    pub fn render(&self) -> String {
        // Serializing two strings cannot fail
        match self {
            Record::Add { key, value } => {
                let body = AddBody {
                    key: key.as_str().into(),
                    value: value.as_str().into(),
                };
                format!("A {}\n", serde_json::to_string(&body).unwrap_or_default())
            }
            Record::Delete { key } => {
                let body = DeleteBody {
                    key: key.as_str().into(),
                };
                format!("D {}\n", serde_json::to_string(&body).unwrap_or_default())
            }
        }
    }
}

/// Result of reading a record file
#[derive(Debug, Default)]
pub struct Parsed {
    pub records: Vec<Record>,
    /// Byte length covered by complete lines
    pub complete_len: usize,
    /// A partial final line was present
    pub torn_tail: bool,
}

impl Parsed {
    /// Fold records into the current key/value view
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for record in &self.records {
            match record {
                Record::Add { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                Record::Delete { key } => {
                    map.remove(key);
                }
            }
        }
        map
    }
}

pub fn parse(contents: &[u8]) -> Result<Parsed, RecordError> {
    let mut parsed = Parsed::default();
    let mut offset = 0;
    let mut line_no = 0;

    while offset < contents.len() {
        line_no += 1;
        let Some(nl) = contents[offset..].iter().position(|&b| b == b'\n') else {
            parsed.torn_tail = true;
            break;
        };
        let raw = &contents[offset..offset + nl];
        offset += nl + 1;
        parsed.complete_len = offset;

        let line = std::str::from_utf8(raw).map_err(|_| RecordError {
            line: line_no,
            reason: "not valid UTF-8".to_string(),
        })?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        parsed.records.push(parse_line(line).map_err(|reason| RecordError {
            line: line_no,
            reason,
        })?);
    }

    Ok(parsed)
}

fn parse_line(line: &str) -> Result<Record, String> {
    let (tag, body) = line
        .split_once(' ')
        .ok_or_else(|| format!("missing record tag in {:?}", truncate(line)))?;
    match tag {
        "A" => {
            let body: AddBody = serde_json::from_str(body).map_err(|e| e.to_string())?;
            Ok(Record::add(body.key, body.value))
        }
        "D" => {
            let body: DeleteBody = serde_json::from_str(body).map_err(|e| e.to_string())?;
            Ok(Record::Delete {
                key: body.key.into_owned(),
            })
        }
        other => Err(format!("unknown record tag {:?}", truncate(other))),
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(40) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
