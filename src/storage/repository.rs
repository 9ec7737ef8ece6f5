use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

/// A fetched unit waiting in the extract cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedUnit {
    pub id: i64,
    pub platform: String,
    pub project_id: u64,
    pub account_id: String,
    pub document_type: String,
    pub id_field: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub timestamp: i64,
    pub request_count: u64,
    pub rows: Vec<Value>,
}

/// What the extract phase writes for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExtract<'a> {
    pub platform: &'a str,
    pub project_id: u64,
    pub account_id: &'a str,
    pub document_type: &'a str,
    pub id_field: &'a str,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub timestamp: i64,
    pub request_count: u64,
    pub rows: &'a [Value],
}

// ── Extracted Units ────────────────────────────────────────────────

/// Insert or replace the cached rows for a unit. Re-extracting a unit
/// clears its loaded marker.
pub fn save_extracted_unit(conn: &Connection, unit: &NewExtract<'_>) -> Result<i64, rusqlite::Error> {
    let rows_json = serde_json::to_string(unit.rows)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO extracted_units (platform, project_id, account_id, document_type, id_field,
            from_date, to_date, timestamp, request_count, rows_json, extracted_at, loaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'), NULL)
         ON CONFLICT(platform, project_id, account_id, document_type, from_date, to_date) DO UPDATE SET
           id_field = excluded.id_field,
           timestamp = excluded.timestamp,
           request_count = excluded.request_count,
           rows_json = excluded.rows_json,
           extracted_at = excluded.extracted_at,
           loaded_at = NULL",
        params![
            unit.platform,
            unit.project_id as i64,
            unit.account_id,
            unit.document_type,
            unit.id_field,
            unit.from_date.to_string(),
            unit.to_date.to_string(),
            unit.timestamp,
            unit.request_count as i64,
            rows_json,
        ],
    )?;
    conn.query_row(
        "SELECT id FROM extracted_units
         WHERE platform = ?1 AND project_id = ?2 AND account_id = ?3 AND document_type = ?4
           AND from_date = ?5 AND to_date = ?6",
        params![
            unit.platform,
            unit.project_id as i64,
            unit.account_id,
            unit.document_type,
            unit.from_date.to_string(),
            unit.to_date.to_string(),
        ],
        |row| row.get(0),
    )
}

/// Units not yet loaded, oldest extraction first and dates ascending.
pub fn list_pending(conn: &Connection, platform: &str) -> Result<Vec<ExtractedUnit>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, platform, project_id, account_id, document_type, id_field,
                from_date, to_date, timestamp, request_count, rows_json
         FROM extracted_units
         WHERE platform = ?1 AND loaded_at IS NULL
         ORDER BY project_id, account_id, document_type, from_date",
    )?;
    let rows = stmt.query_map(params![platform], extracted_from_row)?;
    rows.collect()
}

pub fn mark_loaded(conn: &Connection, id: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE extracted_units SET loaded_at = datetime('now') WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

pub fn count_pending(conn: &Connection, platform: &str) -> Result<u64, rusqlite::Error> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM extracted_units WHERE platform = ?1 AND loaded_at IS NULL",
        params![platform],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

// ── Sync Runs ──────────────────────────────────────────────────────

pub fn insert_sync_run(conn: &Connection, platform: &str, phase: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (platform, phase, status, started_at)
         VALUES (?1, ?2, 'running', datetime('now'))",
        params![platform, phase],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_sync_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    successes: u64,
    failures: u64,
    message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = datetime('now'),
            successes = ?3, failures = ?4, message = ?5
         WHERE id = ?1",
        params![run_id, status, successes as i64, failures as i64, message],
    )?;
    Ok(())
}

pub fn last_run_status(conn: &Connection, platform: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT status FROM sync_runs WHERE platform = ?1 ORDER BY id DESC LIMIT 1",
        params![platform],
        |row| row.get(0),
    )
    .optional()
}

// ── Helpers ────────────────────────────────────────────────────────

fn extracted_from_row(row: &Row<'_>) -> Result<ExtractedUnit, rusqlite::Error> {
    let rows_json: String = row.get(10)?;
    let rows: Vec<Value> = serde_json::from_str(&rows_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;
    Ok(ExtractedUnit {
        id: row.get(0)?,
        platform: row.get(1)?,
        project_id: row.get::<_, i64>(2)? as u64,
        account_id: row.get(3)?,
        document_type: row.get(4)?,
        id_field: row.get(5)?,
        from_date: date_column(row, 6)?,
        to_date: date_column(row, 7)?,
        timestamp: row.get(8)?,
        request_count: row.get::<_, i64>(9)? as u64,
        rows,
    })
}

fn date_column(row: &Row<'_>, idx: usize) -> Result<NaiveDate, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::Database;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn extract<'a>(document_type: &'a str, day: NaiveDate, rows: &'a [Value]) -> NewExtract<'a> {
        NewExtract {
            platform: "linkedin",
            project_id: 7,
            account_id: "55",
            document_type,
            id_field: "id",
            from_date: day,
            to_date: day,
            timestamp: 20240102,
            request_count: 2,
            rows,
        }
    }

    #[tokio::test]
    async fn test_save_and_list_pending() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                let rows = vec![json!({"id": 1}), json!({"id": 2})];
                save_extracted_unit(conn, &extract("campaign_insights", d(2024, 1, 3), &rows))?;
                save_extracted_unit(conn, &extract("campaign_insights", d(2024, 1, 2), &rows))?;

                let pending = list_pending(conn, "linkedin")?;
                assert_eq!(pending.len(), 2);
                assert_eq!(pending[0].from_date, d(2024, 1, 2));
                assert_eq!(pending[0].rows, rows);
                assert_eq!(pending[0].request_count, 2);
                assert!(list_pending(conn, "facebook")?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resave_replaces_and_clears_loaded() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                let first = vec![json!({"id": 1})];
                let id = save_extracted_unit(conn, &extract("campaign", d(2024, 1, 2), &first))?;
                mark_loaded(conn, id)?;
                assert_eq!(count_pending(conn, "linkedin")?, 0);

                let second = vec![json!({"id": 1}), json!({"id": 9})];
                let again = save_extracted_unit(conn, &extract("campaign", d(2024, 1, 2), &second))?;
                assert_eq!(id, again);
                let pending = list_pending(conn, "linkedin")?;
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].rows.len(), 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_run_round_trip() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                let run_id = insert_sync_run(conn, "hubspot", "full")?;
                assert!(run_id > 0);
                assert_eq!(last_run_status(conn, "hubspot")?.as_deref(), Some("running"));

                finish_sync_run(conn, run_id, "success", 8, 0, None)?;
                assert_eq!(last_run_status(conn, "hubspot")?.as_deref(), Some("success"));
                assert_eq!(last_run_status(conn, "adwords")?, None);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
