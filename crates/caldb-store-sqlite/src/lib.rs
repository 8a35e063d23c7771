use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use caldb_core::tabular::{check_delimiter, format_real, CsvWriter};
use caldb_core::{
    candidate_rows, validate_name, AliasList, CodecError, InputFormat, InputRow, MachineId,
    Parameter, ParameterCandidate, ParameterError, ParameterIdentity, RenamePolicy, UserId,
    ValueHistory, ValueUpdate, COLUMNS,
};
use rusqlite::{params, Connection, DatabaseName, ErrorCode, Params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

const CREATE_CALIBRATION_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS calibration (
  MID TEXT PRIMARY KEY,
  UID TEXT UNIQUE,
  Name TEXT,
  Value TEXT,
  COMMENT TEXT,
  DataType TEXT,
  Unit TEXT,
  Size TEXT,
  Min REAL,
  Max REAL,
  Description TEXT,
  ALIASES TEXT,
  ModifiedDateTime TEXT,
  ModificationComment TEXT,
  PreviousValues TEXT
);
";

const SELECT_COLUMNS: &str = "MID, UID, Name, Value, COMMENT, DataType, Unit, Size, Min, Max,
    Description, ALIASES, ModifiedDateTime, ModificationComment, PreviousValues";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenameOutcome {
    pub identity: ParameterIdentity,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    pub row: usize,
    pub name: Option<String>,
    pub error: ParameterError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub added: Vec<ParameterIdentity>,
    pub rejected: Vec<RowRejection>,
}

impl LoadSummary {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.added.len() + self.rejected.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportSummary {
    pub path: String,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Copy)]
enum LookupColumn {
    MachineId,
    UserId,
    Name,
}

impl LookupColumn {
    fn as_sql(self) -> &'static str {
        match self {
            Self::MachineId => "MID",
            Self::UserId => "UID",
            Self::Name => "Name",
        }
    }
}

/// The parameter-level rejection carried by `err`, if that is what it is.
///
/// Rejections leave the table untouched and are safe to report and move past;
/// any other error came from storage or input handling.
#[must_use]
pub fn rejection(err: &anyhow::Error) -> Option<&ParameterError> {
    err.downcast_ref::<ParameterError>()
}

impl SqliteStore {
    /// Open a calibration database, creating the `calibration` table if absent.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or the table cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(CREATE_CALIBRATION_TABLE_SQL)
            .context("failed to create calibration table")?;

        Ok(Self { conn })
    }

    /// Release the connection, reporting any error SQLite raises while closing.
    ///
    /// # Errors
    /// Returns an error when SQLite refuses to close the connection.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, err)| anyhow!(err))
            .context("failed to close sqlite database")
    }

    /// Insert a new parameter under `prefix`.
    ///
    /// The candidate's name and aliases must not already be used as any
    /// record's name or alias, and the derived identity must be unused.
    ///
    /// # Errors
    /// Returns [`ParameterError`] (inside `anyhow::Error`) for validation,
    /// duplicate-name, and duplicate-identity rejections; other errors come
    /// from `SQLite`.
    pub fn add(
        &mut self,
        prefix: &str,
        candidate: ParameterCandidate,
    ) -> Result<ParameterIdentity> {
        let parameter = candidate.into_parameter(prefix, OffsetDateTime::now_utc())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start add transaction")?;

        let mut claimed = vec![parameter.name.as_str()];
        claimed.extend(parameter.aliases.iter());
        for name in claimed {
            if let Some(holder) = find_name_holder(&tx, name)? {
                tracing::debug!(name, holder = %holder.machine_id, "name already taken");
                return Err(duplicate_name(name).into());
            }
        }

        if identity_in_use(&tx, &parameter.machine_id, &parameter.user_id)? {
            return Err(duplicate_identity(&parameter).into());
        }

        insert_parameter(&tx, &parameter)?;
        tx.commit().context("failed to commit add transaction")?;

        tracing::info!(
            mid = %parameter.machine_id,
            uid = %parameter.user_id,
            name = %parameter.name,
            "added parameter"
        );
        Ok(parameter.identity())
    }

    /// Change the value of the parameter whose current name is `update.name`.
    ///
    /// Only the value and the audit fields are written.
    ///
    /// # Errors
    /// Returns [`ParameterError::Validation`] for a blank name or a value
    /// holding `;`, and [`ParameterError::NotFound`] when no record currently
    /// has that name.
    pub fn update(&mut self, update: &ValueUpdate) -> Result<ParameterIdentity> {
        update.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update transaction")?;

        let mut parameter = select_first(&tx, LookupColumn::Name, &update.name)?
            .ok_or_else(|| not_found(&update.name))?;
        let old_value = parameter.value.clone();
        let changed = parameter.apply_value_update(update, OffsetDateTime::now_utc());

        tx.execute(
            "UPDATE calibration
             SET Value = ?1, ModifiedDateTime = ?2, ModificationComment = ?3, PreviousValues = ?4
             WHERE MID = ?5",
            params![
                parameter.value,
                rfc3339(parameter.modified_at)?,
                parameter.modification_comment,
                parameter.previous_values.to_delimited(),
                parameter.machine_id.as_str(),
            ],
        )
        .context("failed to update parameter value")?;
        tx.commit().context("failed to commit update transaction")?;

        if changed {
            tracing::info!(
                mid = %parameter.machine_id,
                name = %parameter.name,
                old = old_value.as_deref().unwrap_or_default(),
                new = parameter.value.as_deref().unwrap_or_default(),
                "updated parameter value"
            );
        } else {
            tracing::info!(
                mid = %parameter.machine_id,
                name = %parameter.name,
                "refreshed parameter audit fields"
            );
        }
        Ok(parameter.identity())
    }

    /// Rename the parameter found by MID, UID, or name (in that order).
    ///
    /// The old name is appended to the record's aliases; identity is kept.
    ///
    /// # Errors
    /// Returns [`ParameterError::Validation`] for a new name that is blank,
    /// padded, or holds `;`, [`ParameterError::NotFound`] when `identifier`
    /// resolves to nothing, and under [`RenamePolicy::Strict`]
    /// [`ParameterError::DuplicateName`] when the new name is already a name
    /// or alias.
    pub fn rename(
        &mut self,
        identifier: &str,
        new_name: &str,
        modification_comment: Option<&str>,
        policy: RenamePolicy,
    ) -> Result<RenameOutcome> {
        validate_name(new_name, "new name")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start rename transaction")?;

        let mut parameter = resolve_in(&tx, identifier)?
            .ok_or_else(|| not_found(identifier))?;

        if let Some(holder) = find_name_holder(&tx, new_name)? {
            match policy {
                RenamePolicy::Strict => return Err(duplicate_name(new_name).into()),
                RenamePolicy::Permissive => tracing::warn!(
                    name = new_name,
                    holder = %holder.machine_id,
                    "renaming onto a name that is already in use"
                ),
            }
        }

        let old_name =
            parameter.apply_rename(new_name, modification_comment, OffsetDateTime::now_utc());

        tx.execute(
            "UPDATE calibration
             SET Name = ?1, ALIASES = ?2, ModifiedDateTime = ?3, ModificationComment = ?4
             WHERE MID = ?5",
            params![
                parameter.name,
                parameter.aliases.to_delimited(),
                rfc3339(parameter.modified_at)?,
                parameter.modification_comment,
                parameter.machine_id.as_str(),
            ],
        )
        .context("failed to rename parameter")?;
        tx.commit().context("failed to commit rename transaction")?;

        tracing::info!(
            mid = %parameter.machine_id,
            uid = %parameter.user_id,
            old = %old_name,
            new = %parameter.name,
            "renamed parameter"
        );
        Ok(RenameOutcome {
            identity: parameter.identity(),
            old_name,
            new_name: parameter.name,
        })
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_by_machine_id(&self, machine_id: &MachineId) -> Result<Option<Parameter>> {
        select_first(&self.conn, LookupColumn::MachineId, machine_id.as_str())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_by_user_id(&self, user_id: &UserId) -> Result<Option<Parameter>> {
        select_first(&self.conn, LookupColumn::UserId, user_id.as_str())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Parameter>> {
        select_first(&self.conn, LookupColumn::Name, name)
    }

    /// Find the record that lists `alias` as an exact token in its aliases.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_by_alias(&self, alias: &str) -> Result<Option<Parameter>> {
        let candidates = select_parameters(
            &self.conn,
            "WHERE instr(ALIASES, ?1) > 0 ORDER BY rowid ASC",
            params![alias],
        )?;
        Ok(candidates
            .into_iter()
            .find(|parameter| parameter.aliases.contains(alias)))
    }

    /// Resolve `identifier` as a MID, then a UID, then a current name.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn resolve(&self, identifier: &str) -> Result<Option<Parameter>> {
        resolve_in(&self.conn, identifier)
    }

    /// All parameters in store iteration (insertion) order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_parameters(&self) -> Result<Vec<Parameter>> {
        select_parameters(&self.conn, "ORDER BY rowid ASC", [])
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM calibration", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count parameters")?;
        usize::try_from(count).context("parameter count out of range")
    }

    /// Feed candidate rows to [`Self::add`] in order.
    ///
    /// A rejected row is recorded in the summary and loading continues with
    /// the next row. Reporting rejections to the user is left to the caller.
    ///
    /// # Errors
    /// Returns an error when the input cannot be read or is malformed, or when
    /// a storage error occurs. Rows added before the failure stay committed.
    pub fn bulk_load<I>(&mut self, rows: I, prefix: &str) -> Result<LoadSummary>
    where
        I: IntoIterator<Item = Result<InputRow, CodecError>>,
    {
        let mut summary = LoadSummary::default();

        for input in rows {
            let InputRow { row, candidate } = input.context("failed to read bulk-load input")?;
            let name = candidate
                .as_ref()
                .ok()
                .map(|candidate| candidate.name.clone());

            let outcome = match candidate {
                Ok(candidate) => self.add(prefix, candidate),
                Err(err) => Err(err.into()),
            };

            match outcome {
                Ok(identity) => summary.added.push(identity),
                Err(err) => {
                    let Some(error) = rejection(&err).cloned() else {
                        return Err(err.context(format!("bulk load failed at row {row}")));
                    };
                    tracing::info!(
                        row,
                        name = name.as_deref().unwrap_or_default(),
                        %error,
                        "bulk-load row rejected"
                    );
                    summary.rejected.push(RowRejection { row, name, error });
                }
            }
        }

        tracing::info!(
            added = summary.added.len(),
            rejected = summary.rejected.len(),
            "bulk load finished"
        );
        Ok(summary)
    }

    /// Bulk-load a CSV or JSON file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or parsed, or when
    /// [`Self::bulk_load`] fails.
    pub fn load_file(
        &mut self,
        path: &Path,
        format: InputFormat,
        prefix: &str,
        delimiter: char,
    ) -> Result<LoadSummary> {
        let source = path.display();
        let file = File::open(path)
            .with_context(|| format!("failed to open input file {source}"))?;
        let rows = candidate_rows(BufReader::new(file), format, delimiter)
            .with_context(|| format!("failed to parse {} input {source}", format.as_str()))?;
        self.bulk_load(rows, prefix)
            .with_context(|| format!("failed to load {source}"))
    }

    /// Write every parameter as CSV: a header of the table columns, then one
    /// row per record in store iteration order. Returns the number of records.
    ///
    /// Stored text is written as it sits in the table, so timestamps and list
    /// columns written by older tooling keep their original spelling.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or the sink cannot be written.
    pub fn export_csv<W: Write>(&self, writer: W, delimiter: char) -> Result<usize> {
        check_delimiter(delimiter)?;
        let rows = select_rows(&self.conn, "ORDER BY rowid ASC", [])?;

        let mut csv = CsvWriter::new(writer, delimiter);
        csv.write_record(COLUMNS)
            .context("failed to write CSV header")?;
        for row in &rows {
            csv.write_record(row.export_fields())
                .with_context(|| format!("failed to write CSV row for {}", row.name))?;
        }
        csv.into_inner()
            .flush()
            .context("failed to flush CSV export")?;

        Ok(rows.len())
    }

    /// Export to `out_file`, returning the row count and the SHA-256 of the
    /// bytes written.
    ///
    /// # Errors
    /// Returns an error when the export cannot be produced or written.
    pub fn export_csv_file(&self, out_file: &Path, delimiter: char) -> Result<ExportSummary> {
        let mut buffer = Vec::new();
        let rows = self.export_csv(&mut buffer, delimiter)?;

        create_parent_dir(out_file, "export file")?;
        fs::write(out_file, &buffer)
            .with_context(|| format!("failed to write export file {}", out_file.display()))?;

        tracing::info!(rows, path = %out_file.display(), "exported parameters");
        Ok(ExportSummary {
            path: out_file.display().to_string(),
            rows,
            sha256: format!("{:x}", Sha256::digest(&buffer)),
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        create_parent_dir(out_file, "backup file")?;

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

#[derive(Debug)]
struct StoredRow {
    machine_id: String,
    user_id: String,
    name: String,
    value: Option<String>,
    comment: Option<String>,
    data_type: Option<String>,
    unit: Option<String>,
    size: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    description: Option<String>,
    aliases: Option<String>,
    modified_at: Option<String>,
    modification_comment: Option<String>,
    previous_values: Option<String>,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            machine_id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            value: row.get(3)?,
            comment: row.get(4)?,
            data_type: row.get(5)?,
            unit: row.get(6)?,
            size: row.get(7)?,
            min: row.get(8)?,
            max: row.get(9)?,
            description: row.get(10)?,
            aliases: row.get(11)?,
            modified_at: row.get(12)?,
            modification_comment: row.get(13)?,
            previous_values: row.get(14)?,
        })
    }

    fn export_fields(&self) -> [String; 15] {
        [
            self.machine_id.clone(),
            self.user_id.clone(),
            self.name.clone(),
            cell(self.value.as_deref()),
            cell(self.comment.as_deref()),
            cell(self.data_type.as_deref()),
            cell(self.unit.as_deref()),
            cell(self.size.as_deref()),
            self.min.map(format_real).unwrap_or_default(),
            self.max.map(format_real).unwrap_or_default(),
            cell(self.description.as_deref()),
            cell(self.aliases.as_deref()),
            cell(self.modified_at.as_deref()),
            cell(self.modification_comment.as_deref()),
            cell(self.previous_values.as_deref()),
        ]
    }

    fn into_parameter(self) -> Result<Parameter> {
        let raw_modified_at = self
            .modified_at
            .ok_or_else(|| anyhow!("parameter {} has no ModifiedDateTime", self.machine_id))?;

        Ok(Parameter {
            modified_at: parse_timestamp(&raw_modified_at)?,
            machine_id: MachineId(self.machine_id),
            user_id: UserId(self.user_id),
            name: self.name,
            value: self.value,
            comment: self.comment,
            data_type: self.data_type,
            unit: self.unit,
            size: self.size,
            min: self.min,
            max: self.max,
            description: self.description,
            aliases: self
                .aliases
                .as_deref()
                .map(AliasList::parse)
                .unwrap_or_default(),
            modification_comment: self.modification_comment,
            previous_values: self
                .previous_values
                .as_deref()
                .map(ValueHistory::parse)
                .unwrap_or_default(),
        })
    }
}

fn select_rows<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<StoredRow>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM calibration {clause}");
    let mut stmt = conn
        .prepare(&query)
        .context("failed to prepare parameter query")?;
    let rows = stmt.query_map(params, StoredRow::read)?;

    let mut stored = Vec::new();
    for row in rows {
        stored.push(row.context("failed to read parameter row")?);
    }
    Ok(stored)
}

fn select_parameters<P: Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<Parameter>> {
    select_rows(conn, clause, params)?
        .into_iter()
        .map(StoredRow::into_parameter)
        .collect()
}

fn select_first(conn: &Connection, column: LookupColumn, key: &str) -> Result<Option<Parameter>> {
    let column = column.as_sql();
    let clause = format!("WHERE {column} = ?1 ORDER BY rowid ASC LIMIT 1");
    let found = select_parameters(conn, &clause, params![key])?
        .into_iter()
        .next();
    tracing::debug!(column, key, found = found.is_some(), "parameter lookup");
    Ok(found)
}

fn resolve_in(conn: &Connection, identifier: &str) -> Result<Option<Parameter>> {
    for column in [
        LookupColumn::MachineId,
        LookupColumn::UserId,
        LookupColumn::Name,
    ] {
        if let Some(parameter) = select_first(conn, column, identifier)? {
            return Ok(Some(parameter));
        }
    }
    Ok(None)
}

/// The record using `token` as its name or as an exact alias token.
fn find_name_holder(conn: &Connection, token: &str) -> Result<Option<Parameter>> {
    let candidates = select_parameters(
        conn,
        "WHERE Name = ?1 OR instr(ALIASES, ?1) > 0 ORDER BY rowid ASC",
        params![token],
    )?;
    Ok(candidates
        .into_iter()
        .find(|parameter| parameter.answers_to(token)))
}

fn identity_in_use(conn: &Connection, machine_id: &MachineId, user_id: &UserId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM calibration WHERE MID = ?1 OR UID = ?2)",
            params![machine_id.as_str(), user_id.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check parameter identity")?;
    Ok(exists == 1)
}

fn insert_parameter(conn: &Connection, parameter: &Parameter) -> Result<()> {
    let aliases = (!parameter.aliases.is_empty())
        .then(|| parameter.aliases.to_delimited());
    let inserted = conn.execute(
        "INSERT INTO calibration(
            MID, UID, Name, Value, COMMENT, DataType, Unit, Size, Min, Max,
            Description, ALIASES, ModifiedDateTime, ModificationComment, PreviousValues
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15
        )",
        params![
            parameter.machine_id.as_str(),
            parameter.user_id.as_str(),
            parameter.name,
            parameter.value,
            parameter.comment,
            parameter.data_type,
            parameter.unit,
            parameter.size,
            parameter.min,
            parameter.max,
            parameter.description,
            aliases,
            rfc3339(parameter.modified_at)?,
            parameter.modification_comment,
            parameter.previous_values.to_delimited(),
        ],
    );

    match inserted {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Err(duplicate_identity(parameter).into())
        }
        Err(err) => Err(anyhow!(err).context("failed to insert parameter")),
    }
}

fn duplicate_name(name: &str) -> ParameterError {
    ParameterError::DuplicateName {
        name: name.to_string(),
    }
}

fn duplicate_identity(parameter: &Parameter) -> ParameterError {
    ParameterError::DuplicateIdentity {
        machine_id: parameter.machine_id.clone(),
        user_id: parameter.user_id.clone(),
    }
}

fn not_found(identifier: &str) -> ParameterError {
    ParameterError::NotFound {
        identifier: identifier.to_string(),
    }
}

fn create_parent_dir(path: &Path, what: &str) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory for {what} {}",
            path.display()
        )
    })
}

fn cell(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

/// Timestamps written by earlier tooling carry no offset; they are read as UTC.
fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(parsed);
    }

    let naive_formats = [
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    ];
    for format in naive_formats {
        if let Ok(parsed) = PrimitiveDateTime::parse(value, format) {
            return Ok(parsed.assume_utc());
        }
    }

    Err(anyhow!("invalid ModifiedDateTime timestamp: {value}"))
}
