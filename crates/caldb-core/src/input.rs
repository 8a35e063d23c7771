//! Candidate rows parsed from bulk-load sources.
//!
//! Both formats use the table's column names as field keys. Derived columns
//! (`MID`, `UID`, `ModifiedDateTime`, `PreviousValues`) are never read, so an
//! export can be fed back in directly.

use std::io::{BufRead, Read};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tabular::{check_delimiter, CsvReader};
use crate::{AliasList, CodecError, ParameterCandidate, ParameterError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Csv,
    Json,
}

impl InputFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// One source row: its 1-based position and either a candidate or the reason
/// the row cannot become one.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRow {
    pub row: usize,
    pub candidate: Result<ParameterCandidate, ParameterError>,
}

pub struct CsvCandidates<R> {
    reader: CsvReader<R>,
    header: Vec<String>,
    row: usize,
}

impl<R: BufRead> CsvCandidates<R> {
    /// Read the header row and prepare to stream data rows.
    ///
    /// # Errors
    /// Returns [`CodecError`] for an unusable delimiter, unreadable input, or a
    /// missing header.
    pub fn new(reader: R, delimiter: char) -> Result<Self, CodecError> {
        check_delimiter(delimiter)?;
        let mut reader = CsvReader::new(reader, delimiter);
        let header = reader.read_record()?.ok_or(CodecError::MissingHeader)?;
        Ok(Self {
            reader,
            header,
            row: 0,
        })
    }
}

impl<R: BufRead> Iterator for CsvCandidates<R> {
    type Item = Result<InputRow, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };
        self.row += 1;

        let header = &self.header;
        let candidate = build_candidate(|key| {
            Ok(header
                .iter()
                .position(|column| column == key)
                .and_then(|i| record.get(i))
                .cloned())
        });
        Some(Ok(InputRow {
            row: self.row,
            candidate,
        }))
    }
}

/// Parse a JSON document holding one object or an array of objects.
///
/// # Errors
/// Returns [`CodecError`] when the document is not valid JSON or its shape is
/// not an object or an array of objects.
pub fn json_rows<R: Read>(reader: R) -> Result<Vec<InputRow>, CodecError> {
    let document: Value = serde_json::from_reader(reader)?;
    let items = match document {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        _ => return Err(CodecError::UnsupportedJsonShape),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let Value::Object(object) = item else {
                return Err(CodecError::NotAnObject { index: index + 1 });
            };
            let candidate = build_candidate(|key| json_text(key, object.get(key)));
            Ok(InputRow {
                row: index + 1,
                candidate,
            })
        })
        .collect()
}

pub enum CandidateRows<R> {
    Csv(CsvCandidates<R>),
    Json(std::vec::IntoIter<InputRow>),
}

impl<R: BufRead> Iterator for CandidateRows<R> {
    type Item = Result<InputRow, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Csv(rows) => rows.next(),
            Self::Json(rows) => rows.next().map(Ok),
        }
    }
}

/// Open `reader` as a sequence of candidate rows in source order.
///
/// CSV rows are parsed as they are pulled; JSON is parsed up front since the
/// document has to be complete to be valid.
///
/// # Errors
/// Returns [`CodecError`] when the header or JSON document cannot be read.
pub fn candidate_rows<R: BufRead>(
    reader: R,
    format: InputFormat,
    delimiter: char,
) -> Result<CandidateRows<R>, CodecError> {
    match format {
        InputFormat::Csv => Ok(CandidateRows::Csv(CsvCandidates::new(reader, delimiter)?)),
        InputFormat::Json => Ok(CandidateRows::Json(json_rows(reader)?.into_iter())),
    }
}

fn build_candidate<F>(mut field: F) -> Result<ParameterCandidate, ParameterError>
where
    F: FnMut(&str) -> Result<Option<String>, ParameterError>,
{
    let min = parse_bound("Min", field("Min")?)?;
    let max = parse_bound("Max", field("Max")?)?;
    let candidate = ParameterCandidate {
        name: field("Name")?.unwrap_or_default(),
        value: field("Value")?,
        comment: field("COMMENT")?,
        data_type: field("DataType")?,
        unit: field("Unit")?,
        size: field("Size")?,
        min,
        max,
        description: field("Description")?,
        aliases: field("ALIASES")?
            .map(|raw| AliasList::parse(&raw))
            .unwrap_or_default(),
        modification_comment: field("ModificationComment")?,
    };
    Ok(candidate.normalized())
}

fn parse_bound(key: &str, raw: Option<String>) -> Result<Option<f64>, ParameterError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<f64>() {
        Ok(bound) => Ok(Some(bound)),
        Err(_) => Err(ParameterError::Validation(format!(
            "{key} must be numeric, got '{trimmed}'"
        ))),
    }
}

fn json_text(key: &str, value: Option<&Value>) -> Result<Option<String>, ParameterError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(Value::Array(items)) if key == "ALIASES" => {
            let mut tokens = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(token) = item else {
                    return Err(ParameterError::Validation(
                        "ALIASES array must contain only strings".to_string(),
                    ));
                };
                tokens.push(token.as_str());
            }
            Ok(Some(tokens.into_iter().collect::<AliasList>().to_delimited()))
        }
        Some(_) => Err(ParameterError::Validation(format!(
            "{key} must be a string or a number"
        ))),
    }
}
