//! Carrying row data from an old database into a freshly built one.
//!
//! Only columns present in both versions of a table are copied. Values are moved as
//! [`Value`]s, so whatever storage class a cell had in the old file it keeps in the new one.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::core::TableCopyReport;
use crate::error::Error;
use crate::introspect::{get_table_info, list_tables, quote_ident, ColumnInfo};

/// The columns of `new_columns` that also appear in `old_columns`, in the new order.
pub fn find_common_columns<O: AsRef<str>, N: AsRef<str>>(old_columns: &[O], new_columns: &[N]) -> Vec<String> {
    new_columns
        .iter()
        .filter(|new| old_columns.iter().any(|old| old.as_ref() == new.as_ref()))
        .map(|c| c.as_ref().to_string())
        .collect()
}

/// Copy every table present in both handles from `old` into `new`.
///
/// New constraints are checked against the old data for all tables before any row is
/// written, then each table is copied in its own transaction and AUTOINCREMENT counters
/// are carried over.
///
/// If `new` enforces foreign keys, enforcement is suspended while copying and the
/// copied rows are checked with `foreign_key_check` afterwards.
pub(crate) fn copy_common_tables(
    old: &Connection,
    new: &mut Connection,
    lineage_table: &str,
) -> Result<Vec<TableCopyReport>, Error> {
    let enforce_foreign_keys: bool = new
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .map_err(Error::Introspection)?;
    if !enforce_foreign_keys {
        return copy_tables(old, new, lineage_table);
    }

    // tables are copied in name order, so children may arrive before their parents
    new.pragma_update(None, "foreign_keys", false)
        .map_err(Error::Introspection)?;
    let copied = copy_tables(old, new, lineage_table)
        .and_then(|reports| check_foreign_keys(new).map(|()| reports));
    new.pragma_update(None, "foreign_keys", true)
        .map_err(Error::Introspection)?;
    copied
}

fn copy_tables(
    old: &Connection,
    new: &mut Connection,
    lineage_table: &str,
) -> Result<Vec<TableCopyReport>, Error> {
    let old_tables = list_tables(old, lineage_table)?;
    let new_tables = list_tables(new, lineage_table)?;
    let common = find_common_columns(&old_tables, &new_tables);

    #[cfg(feature = "tracing")]
    tracing::debug!(tables = ?common, "Copying tables present in both schemas");

    for table in &common {
        check_constraints(old, new, table)?;
    }

    let mut reports = Vec::with_capacity(common.len());
    for table in &common {
        reports.push(copy_table(old, new, table)?);
    }

    raise_sequences(old, new, &common)?;
    Ok(reports)
}

/// Fail with [`Error::Constraint`] if a NOT NULL column without a default in the new
/// table cannot be filled from the old rows.
pub(crate) fn check_constraints(old: &Connection, new: &Connection, table: &str) -> Result<(), Error> {
    let old_columns: Vec<String> = get_table_info(old, table)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let new_info = get_table_info(new, table)?;
    let new_columns: Vec<&str> = new_info.iter().map(|c| c.name.as_str()).collect();
    if find_common_columns(&old_columns, &new_columns).is_empty() {
        // nothing will be copied into this table
        return Ok(());
    }

    let data_err = |source| Error::DataCopy {
        table: table.to_string(),
        source,
    };

    for column in new_info.iter().filter(|c| c.requires_value(&new_info)) {
        if old_columns.contains(&column.name) {
            let has_nulls: bool = old
                .query_row(
                    &format!(
                        "SELECT EXISTS(SELECT 1 FROM {} WHERE {} IS NULL)",
                        quote_ident(table),
                        quote_ident(&column.name)
                    ),
                    [],
                    |row| row.get(0),
                )
                .map_err(data_err)?;
            if has_nulls {
                return Err(Error::Constraint {
                    table: table.to_string(),
                    column: column.name.clone(),
                    reason: "column is NOT NULL without a default but existing rows contain NULL"
                        .to_string(),
                });
            }
        } else {
            let has_rows: bool = old
                .query_row(
                    &format!("SELECT EXISTS(SELECT 1 FROM {})", quote_ident(table)),
                    [],
                    |row| row.get(0),
                )
                .map_err(data_err)?;
            if has_rows {
                return Err(Error::Constraint {
                    table: table.to_string(),
                    column: column.name.clone(),
                    reason: "new NOT NULL column without a default cannot be filled for existing rows"
                        .to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Fail with [`Error::Constraint`] on the first row whose foreign key has no parent.
fn check_foreign_keys(conn: &Connection) -> Result<(), Error> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .map_err(Error::Introspection)?;
    let violation: Option<(String, String, i64)> = stmt
        .query_row([], |row| Ok((row.get(0)?, row.get(2)?, row.get(3)?)))
        .optional()
        .map_err(Error::Introspection)?;
    let Some((table, parent, fk_id)) = violation else {
        return Ok(());
    };

    let column: Option<String> = conn
        .query_row(
            "SELECT \"from\" FROM pragma_foreign_key_list(?1) WHERE id = ?2",
            (&table, fk_id),
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::Introspection)?;
    Err(Error::Constraint {
        table,
        column: column.unwrap_or_default(),
        reason: format!("existing rows reference missing rows in {}", parent),
    })
}

/// Copy the rows of `table` from `old` into `new` in a single transaction.
///
/// A NULL headed for a NOT NULL column that declares a default is left out of the insert so
/// the default applies. Any failure rolls the transaction back.
pub fn copy_table(old: &Connection, new: &mut Connection, table: &str) -> Result<TableCopyReport, Error> {
    let old_columns: Vec<String> = get_table_info(old, table)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let new_info = get_table_info(new, table)?;
    let new_columns: Vec<&str> = new_info.iter().map(|c| c.name.as_str()).collect();
    let columns = find_common_columns(&old_columns, &new_columns);

    if columns.is_empty() {
        #[cfg(feature = "tracing")]
        tracing::debug!(table = %table, "No common columns, table data dropped");
        return Ok(TableCopyReport {
            table: table.to_string(),
            columns,
            rows_copied: 0,
        });
    }

    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("copy_table", table = %table).entered();

    let defaulted: Vec<bool> = columns
        .iter()
        .map(|name| {
            new_info
                .iter()
                .find(|c| &c.name == name)
                .is_some_and(|c: &ColumnInfo| c.not_null && c.default_value.is_some())
        })
        .collect();

    let data_err = |source| Error::DataCopy {
        table: table.to_string(),
        source,
    };

    let select = format!(
        "SELECT {} FROM {}",
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        quote_ident(table)
    );
    let mut stmt = old.prepare(&select).map_err(data_err)?;
    let mut rows = stmt.query([]).map_err(data_err)?;

    // dropping the transaction without commit rolls it back
    let tx = new.transaction().map_err(data_err)?;
    let mut rows_copied = 0;
    while let Some(row) = rows.next().map_err(data_err)? {
        let mut names = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value: Value = row.get(i).map_err(data_err)?;
            if value == Value::Null && defaulted[i] {
                continue;
            }
            names.push(quote_ident(name));
            values.push(value);
        }

        let insert = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                names.join(", "),
                vec!["?"; names.len()].join(", ")
            )
        };
        tx.prepare_cached(&insert)
            .and_then(|mut insert| insert.execute(params_from_iter(values)))
            .map_err(data_err)?;
        rows_copied += 1;
    }
    tx.commit().map_err(data_err)?;

    #[cfg(feature = "tracing")]
    tracing::debug!(rows_copied, "Copied table rows");

    Ok(TableCopyReport {
        table: table.to_string(),
        columns,
        rows_copied,
    })
}

/// Raise the AUTOINCREMENT counters of `tables` in `new` to at least their values in `old`.
fn raise_sequences(old: &Connection, new: &Connection, tables: &[String]) -> Result<(), Error> {
    let has_sequence = |conn: &Connection| -> Result<bool, Error> {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='sqlite_sequence')",
            [],
            |row| row.get(0),
        )
        .map_err(Error::Introspection)
    };
    if !has_sequence(old)? || !has_sequence(new)? {
        return Ok(());
    }

    let mut stmt = old
        .prepare("SELECT name, seq FROM sqlite_sequence")
        .map_err(Error::Introspection)?;
    let counters = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(Error::Introspection)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Introspection)?;

    for (table, seq) in counters {
        if !tables.contains(&table) || !is_autoincrement(new, &table)? {
            continue;
        }
        let data_err = |source| Error::DataCopy {
            table: table.clone(),
            source,
        };
        let current: Option<i64> = new
            .query_row("SELECT seq FROM sqlite_sequence WHERE name = ?1", [&table], |row| row.get(0))
            .optional()
            .map_err(data_err)?;
        match current {
            Some(current) if current >= seq => {}
            Some(_) => {
                new.execute("UPDATE sqlite_sequence SET seq = ?2 WHERE name = ?1", (&table, seq))
                    .map_err(data_err)?;
            }
            None => {
                new.execute("INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)", (&table, seq))
                    .map_err(data_err)?;
            }
        }
    }
    Ok(())
}

fn is_autoincrement(conn: &Connection, table: &str) -> Result<bool, Error> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::Introspection)?;
    Ok(sql.is_some_and(|sql| sql.to_ascii_uppercase().contains("AUTOINCREMENT")))
}
