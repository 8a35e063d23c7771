use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod input;
pub mod tabular;

pub use input::{candidate_rows, CandidateRows, CsvCandidates, InputFormat, InputRow};

/// Column names of the `calibration` table, in storage and export order.
pub const COLUMNS: [&str; 15] = [
    "MID",
    "UID",
    "Name",
    "Value",
    "COMMENT",
    "DataType",
    "Unit",
    "Size",
    "Min",
    "Max",
    "Description",
    "ALIASES",
    "ModifiedDateTime",
    "ModificationComment",
    "PreviousValues",
];

pub const DEFAULT_PREFIX: &str = "cal-";
pub const LIST_DELIMITER: char = ';';

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ParameterError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("parameter with name '{name}' already exists in Name or ALIASES")]
    DuplicateName { name: String },
    #[error("parameter with MID {machine_id} or UID {user_id} already exists")]
    DuplicateIdentity {
        machine_id: MachineId,
        user_id: UserId,
    },
    #[error("parameter not found: {identifier}")]
    NotFound { identifier: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON input: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV input has no header row")]
    MissingHeader,
    #[error("line {line}: unterminated quoted field")]
    UnterminatedQuote { line: usize },
    #[error("JSON item {index} is not an object")]
    NotAnObject { index: usize },
    #[error("JSON document must be an object or an array of objects")]
    UnsupportedJsonShape,
    #[error("unusable CSV delimiter {0:?}")]
    InvalidDelimiter(char),
}

/// Caller-facing identity: prefix plus the creation-time name. Never changes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn derive(prefix: &str, name: &str) -> Self {
        Self(format!("{prefix}{name}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key: lower-case hex MD5 of the [`UserId`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    #[must_use]
    pub fn derive(user_id: &UserId) -> Self {
        Self(hex::encode(md5::compute(user_id.as_str().as_bytes()).0))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ParameterIdentity {
    pub machine_id: MachineId,
    pub user_id: UserId,
}

impl ParameterIdentity {
    #[must_use]
    pub fn derive(prefix: &str, name: &str) -> Self {
        let user_id = UserId::derive(prefix, name);
        Self {
            machine_id: MachineId::derive(&user_id),
            user_id,
        }
    }
}

/// Retired names that still resolve to a record. Append-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct AliasList(Vec<String>);

impl AliasList {
    /// Parse a `;`-delimited alias column. Tokens are trimmed and empty tokens dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(LIST_DELIMITER)
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Exact token comparison; `"Temp"` does not match an alias `"Temp1"`.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.0.iter().any(|alias| alias == token)
    }

    pub fn push(&mut self, alias: String) {
        self.0.push(alias);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn to_delimited(&self) -> String {
        join_delimited(&self.0)
    }
}

impl<S: Into<String>> FromIterator<S> for AliasList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Every value a record held before its current one, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ValueHistory(Vec<String>);

impl ValueHistory {
    /// Tokens are kept verbatim; only empty tokens are dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(LIST_DELIMITER)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn push(&mut self, value: String) {
        self.0.push(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn to_delimited(&self) -> String {
        join_delimited(&self.0)
    }
}

impl<S: Into<String>> FromIterator<S> for ValueHistory {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

fn join_delimited(tokens: &[String]) -> String {
    let mut joined = String::new();
    for (index, token) in tokens.iter().enumerate() {
        if index > 0 {
            joined.push(LIST_DELIMITER);
        }
        joined.push_str(token);
    }
    joined
}

/// One persisted calibration parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub machine_id: MachineId,
    pub user_id: UserId,
    pub name: String,
    pub value: Option<String>,
    pub comment: Option<String>,
    pub data_type: Option<String>,
    pub unit: Option<String>,
    pub size: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: Option<String>,
    pub aliases: AliasList,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub modification_comment: Option<String>,
    pub previous_values: ValueHistory,
}

impl Parameter {
    #[must_use]
    pub fn identity(&self) -> ParameterIdentity {
        ParameterIdentity {
            machine_id: self.machine_id.clone(),
            user_id: self.user_id.clone(),
        }
    }

    /// True when `name` is this record's current name or one of its aliases.
    #[must_use]
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(name)
    }

    /// Apply a value update and refresh the audit fields.
    ///
    /// Returns `true` when the stored value changed. A changed value pushes the
    /// prior value onto `previous_values` and records an `old -> new` delta in
    /// the modification comment. Otherwise the supplied comment is kept verbatim.
    pub fn apply_value_update(&mut self, update: &ValueUpdate, now: OffsetDateTime) -> bool {
        let comment = update
            .modification_comment
            .as_deref()
            .filter(|c| !c.is_empty());
        let changed = match update.value.as_deref().filter(|v| !v.is_empty()) {
            Some(new_value) if self.value.as_deref() != Some(new_value) => {
                let old_value = self.value.replace(new_value.to_string());
                let delta = format!(
                    "Value: {} -> {new_value}",
                    old_value.as_deref().unwrap_or_default()
                );
                if let Some(old_value) = old_value {
                    self.previous_values.push(old_value);
                }
                self.modification_comment = Some(annotate(comment, &delta));
                true
            }
            _ => {
                self.modification_comment = comment.map(str::to_string);
                false
            }
        };
        self.modified_at = now;
        changed
    }

    /// Give the record a new display name, retiring the current one into `aliases`.
    ///
    /// Returns the retired name. Identity fields are untouched.
    pub fn apply_rename(
        &mut self,
        new_name: &str,
        modification_comment: Option<&str>,
        now: OffsetDateTime,
    ) -> String {
        let old_name = std::mem::replace(&mut self.name, new_name.to_string());
        self.aliases.push(old_name.clone());
        let delta = format!("Name: {old_name} -> {new_name}");
        self.modification_comment = Some(annotate(
            modification_comment.filter(|c| !c.is_empty()),
            &delta,
        ));
        self.modified_at = now;
        old_name
    }
}

fn annotate(comment: Option<&str>, delta: &str) -> String {
    match comment {
        Some(comment) => format!("{comment} | {delta}"),
        None => delta.to_string(),
    }
}

/// Caller-supplied fields for a new parameter. Identity is derived on add.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterCandidate {
    pub name: String,
    pub value: Option<String>,
    pub comment: Option<String>,
    pub data_type: Option<String>,
    pub unit: Option<String>,
    pub size: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: AliasList,
    pub modification_comment: Option<String>,
}

impl ParameterCandidate {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Collapse empty optional text fields to unset.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.value,
            &mut self.comment,
            &mut self.data_type,
            &mut self.unit,
            &mut self.size,
            &mut self.description,
            &mut self.modification_comment,
        ] {
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
        self
    }

    /// Check the candidate on its own, before any table lookups.
    ///
    /// # Errors
    /// Returns [`ParameterError::Validation`] when the name or an alias fails
    /// [`validate_name`], the value holds the list delimiter, an alias repeats,
    /// or an alias equals the candidate's own name.
    pub fn validate(&self) -> Result<(), ParameterError> {
        validate_name(&self.name, "parameter name")?;
        validate_value(self.value.as_deref())?;
        for (index, alias) in self.aliases.iter().enumerate() {
            validate_name(alias, "alias")?;
            if alias == self.name {
                return Err(ParameterError::Validation(format!(
                    "alias '{alias}' repeats the parameter name"
                )));
            }
            if self.aliases.iter().take(index).any(|earlier| earlier == alias) {
                return Err(ParameterError::Validation(format!(
                    "alias '{alias}' is listed twice"
                )));
            }
        }
        Ok(())
    }

    /// Build the record to insert under `prefix`.
    ///
    /// # Errors
    /// Returns [`ParameterError::Validation`] when [`Self::validate`] fails.
    pub fn into_parameter(
        self,
        prefix: &str,
        now: OffsetDateTime,
    ) -> Result<Parameter, ParameterError> {
        self.validate()?;
        let ParameterIdentity {
            machine_id,
            user_id,
        } = ParameterIdentity::derive(prefix, &self.name);
        Ok(Parameter {
            machine_id,
            user_id,
            name: self.name,
            value: self.value,
            comment: self.comment,
            data_type: self.data_type,
            unit: self.unit,
            size: self.size,
            min: self.min,
            max: self.max,
            description: self.description,
            aliases: self.aliases,
            modified_at: now,
            modification_comment: self.modification_comment,
            previous_values: ValueHistory::default(),
        })
    }
}

/// Input to the update operation. `value: None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueUpdate {
    pub name: String,
    pub value: Option<String>,
    pub modification_comment: Option<String>,
}

impl ValueUpdate {
    /// Only blank names are refused here, so records carrying names written by
    /// older tooling can still be targeted.
    ///
    /// # Errors
    /// Returns [`ParameterError::Validation`] when the name is blank or the new
    /// value holds the list delimiter.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.name.trim().is_empty() {
            return Err(ParameterError::Validation(
                "parameter name is required".to_string(),
            ));
        }
        validate_value(self.value.as_deref())
    }
}

/// How rename treats a new name that is already taken.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RenamePolicy {
    /// Reject names already used as any record's name or alias.
    #[default]
    Strict,
    /// Apply the rename even when another record answers to the new name.
    Permissive,
}

impl RenamePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Permissive => "permissive",
        }
    }
}

/// Check a name that is about to be stored as a `Name` or an alias token.
///
/// Names end up inside the `;`-delimited `ALIASES` column once retired, and
/// alias tokens are trimmed when read, so both the delimiter and surrounding
/// whitespace are refused.
///
/// # Errors
/// Returns [`ParameterError::Validation`] when `name` is blank, has leading or
/// trailing whitespace, or contains [`LIST_DELIMITER`].
pub fn validate_name(name: &str, what: &str) -> Result<(), ParameterError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ParameterError::Validation(format!("{what} is required")));
    }
    if trimmed != name {
        return Err(ParameterError::Validation(format!(
            "{what} '{name}' has leading or trailing whitespace"
        )));
    }
    if name.contains(LIST_DELIMITER) {
        return Err(ParameterError::Validation(format!(
            "{what} '{name}' must not contain '{LIST_DELIMITER}'"
        )));
    }
    Ok(())
}

fn validate_value(value: Option<&str>) -> Result<(), ParameterError> {
    match value {
        Some(value) if value.contains(LIST_DELIMITER) => Err(ParameterError::Validation(
            format!("value '{value}' must not contain '{LIST_DELIMITER}'"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn later() -> OffsetDateTime {
        fixture_time() + Duration::minutes(5)
    }

    fn temp1() -> Result<Parameter, ParameterError> {
        ParameterCandidate {
            value: Some("[0 100]".to_string()),
            unit: Some("C".to_string()),
            ..ParameterCandidate::named("Temp1")
        }
        .into_parameter(DEFAULT_PREFIX, fixture_time())
    }

    fn is_validation(result: Result<(), ParameterError>) -> bool {
        matches!(result, Err(ParameterError::Validation(_)))
    }

    #[test]
    fn machine_id_is_md5_hex_of_user_id() {
        let user_id = UserId::derive("cal-", "Temp1");
        assert_eq!(user_id.as_str(), "cal-Temp1");

        let machine_id = MachineId::derive(&user_id);
        assert_eq!(machine_id.as_str().len(), 32);
        assert!(machine_id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_eq!(
            MachineId::derive(&UserId(String::new())).as_str(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            MachineId::derive(&UserId("abc".to_string())).as_str(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn alias_tokens_match_exactly() {
        let aliases = AliasList::parse("ParamOld1; ParamOld2;;");
        assert_eq!(aliases.len(), 2);
        assert!(aliases.contains("ParamOld1"));
        assert!(aliases.contains("ParamOld2"));
        assert!(!aliases.contains("ParamOld"));
        assert!(!aliases.contains("Old1"));
        assert_eq!(aliases.to_delimited(), "ParamOld1;ParamOld2");
        assert!(AliasList::parse("").is_empty());
    }

    #[test]
    fn candidate_validation_rejects_blank_names_and_alias_repeats() {
        assert!(is_validation(ParameterCandidate::named("  ").validate()));

        let self_alias = ParameterCandidate {
            aliases: AliasList::parse("A;Temp1"),
            ..ParameterCandidate::named("Temp1")
        };
        assert!(is_validation(self_alias.validate()));

        let repeated = ParameterCandidate {
            aliases: AliasList::parse("A;B;A"),
            ..ParameterCandidate::named("Temp1")
        };
        assert!(is_validation(repeated.validate()));
    }

    #[test]
    fn names_that_would_not_survive_the_alias_column_are_rejected() {
        for name in ["A;B", " Temp1", "Temp1 ", "\tGain"] {
            assert!(is_validation(validate_name(name, "name")), "{name:?}");
            assert!(is_validation(ParameterCandidate::named(name).validate()));
        }
        assert!(validate_name("Temp 1", "name").is_ok());

        let split_alias = ParameterCandidate {
            aliases: ["Old;Older"].into_iter().collect(),
            ..ParameterCandidate::named("Temp1")
        };
        assert!(is_validation(split_alias.validate()));

        let padded_alias = ParameterCandidate {
            aliases: [" Old"].into_iter().collect(),
            ..ParameterCandidate::named("Temp1")
        };
        assert!(is_validation(padded_alias.validate()));
    }

    #[test]
    fn values_holding_the_list_delimiter_are_rejected() {
        let candidate = ParameterCandidate {
            value: Some("a;b".to_string()),
            ..ParameterCandidate::named("P")
        };
        assert!(is_validation(candidate.validate()));

        let update = ValueUpdate {
            name: "P".to_string(),
            value: Some("c;d".to_string()),
            modification_comment: None,
        };
        assert!(is_validation(update.validate()));

        let legacy_name = ValueUpdate {
            name: "Legacy;Name".to_string(),
            value: Some("1".to_string()),
            modification_comment: None,
        };
        assert!(legacy_name.validate().is_ok());
    }

    #[test]
    fn normalized_drops_empty_text_fields() {
        let candidate = ParameterCandidate {
            value: Some(String::new()),
            unit: Some("C".to_string()),
            modification_comment: Some(String::new()),
            ..ParameterCandidate::named("Temp1")
        }
        .normalized();
        assert_eq!(candidate.value, None);
        assert_eq!(candidate.unit.as_deref(), Some("C"));
        assert_eq!(candidate.modification_comment, None);
    }

    #[test]
    fn into_parameter_derives_identity_and_empty_history() -> Result<(), ParameterError> {
        let parameter = temp1()?;
        assert_eq!(parameter.user_id.as_str(), "cal-Temp1");
        assert_eq!(parameter.machine_id, MachineId::derive(&parameter.user_id));
        assert!(parameter.previous_values.is_empty());
        assert_eq!(parameter.modified_at, fixture_time());
        Ok(())
    }

    #[test]
    fn value_change_appends_history_and_delta() -> Result<(), ParameterError> {
        let mut parameter = temp1()?;
        let changed = parameter.apply_value_update(
            &ValueUpdate {
                name: "Temp1".to_string(),
                value: Some("[0 120]".to_string()),
                modification_comment: Some("widened range".to_string()),
            },
            later(),
        );

        assert!(changed);
        assert_eq!(parameter.value.as_deref(), Some("[0 120]"));
        assert_eq!(parameter.previous_values.to_delimited(), "[0 100]");
        assert_eq!(
            parameter.modification_comment.as_deref(),
            Some("widened range | Value: [0 100] -> [0 120]")
        );
        assert_eq!(parameter.modified_at, later());
        Ok(())
    }

    #[test]
    fn value_update_without_comment_records_only_delta() -> Result<(), ParameterError> {
        let mut parameter = temp1()?;
        parameter.apply_value_update(
            &ValueUpdate {
                name: "Temp1".to_string(),
                value: Some("[0 120]".to_string()),
                modification_comment: None,
            },
            later(),
        );
        assert_eq!(
            parameter.modification_comment.as_deref(),
            Some("Value: [0 100] -> [0 120]")
        );
        Ok(())
    }

    #[test]
    fn unset_or_identical_value_only_refreshes_audit_fields() -> Result<(), ParameterError> {
        let mut parameter = temp1()?;
        for value in [None, Some("[0 100]".to_string())] {
            let changed = parameter.apply_value_update(
                &ValueUpdate {
                    name: "Temp1".to_string(),
                    value,
                    modification_comment: Some("reviewed".to_string()),
                },
                later(),
            );
            assert!(!changed);
        }

        assert_eq!(parameter.value.as_deref(), Some("[0 100]"));
        assert!(parameter.previous_values.is_empty());
        assert_eq!(parameter.modification_comment.as_deref(), Some("reviewed"));
        assert_eq!(parameter.modified_at, later());
        Ok(())
    }

    #[test]
    fn first_value_on_unset_record_has_no_history() -> Result<(), ParameterError> {
        let mut parameter =
            ParameterCandidate::named("Gain").into_parameter(DEFAULT_PREFIX, fixture_time())?;
        parameter.apply_value_update(
            &ValueUpdate {
                name: "Gain".to_string(),
                value: Some("3".to_string()),
                modification_comment: None,
            },
            later(),
        );
        assert!(parameter.previous_values.is_empty());
        assert_eq!(parameter.modification_comment.as_deref(), Some("Value:  -> 3"));
        Ok(())
    }

    #[test]
    fn rename_retires_old_name_and_keeps_identity() -> Result<(), ParameterError> {
        let mut parameter = temp1()?;
        let identity = parameter.identity();

        let old_name = parameter.apply_rename("TempMax", Some("clarity"), later());

        assert_eq!(old_name, "Temp1");
        assert_eq!(parameter.name, "TempMax");
        assert_eq!(parameter.aliases.to_delimited(), "Temp1");
        assert_eq!(parameter.identity(), identity);
        assert_eq!(
            parameter.modification_comment.as_deref(),
            Some("clarity | Name: Temp1 -> TempMax")
        );
        assert!(parameter.answers_to("Temp1"));
        assert!(parameter.answers_to("TempMax"));

        parameter.apply_rename("TempCeiling", None, later());
        assert_eq!(parameter.aliases.to_delimited(), "Temp1;TempMax");
        assert_eq!(
            parameter.modification_comment.as_deref(),
            Some("Name: TempMax -> TempCeiling")
        );
        Ok(())
    }

    proptest! {
        #[test]
        fn property_machine_id_is_a_pure_function_of_user_id(
            prefix in "[a-z-]{0,6}",
            name in "[A-Za-z0-9_]{1,24}",
        ) {
            let first = ParameterIdentity::derive(&prefix, &name);
            let second = ParameterIdentity::derive(&prefix, &name);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.user_id.as_str(), format!("{prefix}{name}"));
            prop_assert_eq!(
                first.machine_id,
                MachineId::derive(&UserId(format!("{prefix}{name}")))
            );
        }

        #[test]
        fn property_valid_names_read_back_as_one_alias(
            name in "[A-Za-z0-9_][A-Za-z0-9_ .-]{0,16}[A-Za-z0-9_]",
        ) {
            prop_assert!(validate_name(&name, "name").is_ok());
            let mut aliases = AliasList::default();
            aliases.push(name.clone());
            let read_back = AliasList::parse(&aliases.to_delimited());
            prop_assert_eq!(read_back.len(), 1);
            prop_assert!(read_back.contains(&name));
        }

        #[test]
        fn property_history_only_grows(
            values in proptest::collection::vec("[A-Za-z0-9 \\[\\]]{1,8}", 1..12),
        ) {
            let mut parameter =
                match ParameterCandidate::named("P").into_parameter("cal-", fixture_time()) {
                    Ok(parameter) => parameter,
                    Err(err) => panic!("fixture candidate must be valid: {err}"),
                };
            let mut last_len = 0;
            for value in values {
                let before = parameter.value.clone();
                let changed = parameter.apply_value_update(
                    &ValueUpdate {
                        name: "P".to_string(),
                        value: Some(value.clone()),
                        modification_comment: None,
                    },
                    later(),
                );
                prop_assert!(parameter.previous_values.len() >= last_len);
                let expected_growth = usize::from(changed && before.is_some());
                prop_assert_eq!(parameter.previous_values.len(), last_len + expected_growth);
                prop_assert_eq!(parameter.value.as_deref(), Some(value.as_str()));
                prop_assert_eq!(
                    ValueHistory::parse(&parameter.previous_values.to_delimited()),
                    parameter.previous_values.clone()
                );
                last_len = parameter.previous_values.len();
            }
        }
    }
}
