//! Legacy v1 summary rows (map-reduce pipeline, kept for the
//! `summarize` command and the legacy export path).

use rusqlite::{params, OptionalExtension};

use super::types::{InsertResult, SummaryRow};
use super::{Session, StoreResult};

const SUMMARY_COLUMNS: &str =
    "id, scope, ref_id, summary_type, prompt_version, model, input_hash, content, params_json";

impl Session<'_> {
    pub fn get_summary(
        &self,
        scope: &str,
        ref_id: i64,
        summary_type: &str,
        prompt_version: &str,
        model: &str,
        input_hash: &str,
    ) -> StoreResult<Option<SummaryRow>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE scope = ?1 AND ref_id = ?2 AND summary_type = ?3
               AND prompt_version = ?4 AND model = ?5 AND input_hash = ?6"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![scope, ref_id, summary_type, prompt_version, model, input_hash],
                map_summary,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_latest_summary(
        &self,
        scope: &str,
        ref_id: i64,
        summary_type: &str,
    ) -> StoreResult<Option<SummaryRow>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE scope = ?1 AND ref_id = ?2 AND summary_type = ?3
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![scope, ref_id, summary_type], map_summary)
            .optional()?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_summary(
        &self,
        scope: &str,
        ref_id: i64,
        summary_type: &str,
        prompt_version: &str,
        model: &str,
        input_hash: &str,
        content: &str,
        params_json: Option<&str>,
    ) -> StoreResult<InsertResult> {
        let changed = self.conn.execute(
            "INSERT INTO summaries
                 (scope, ref_id, summary_type, prompt_version, model, input_hash, content, params_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (scope, ref_id, summary_type, prompt_version, model, input_hash)
                 DO NOTHING",
            params![scope, ref_id, summary_type, prompt_version, model, input_hash, content, params_json],
        )?;
        if changed == 1 {
            return Ok(InsertResult {
                id: self.conn.last_insert_rowid(),
                inserted: true,
            });
        }
        let id: i64 = self.conn.query_row(
            "SELECT id FROM summaries
             WHERE scope = ?1 AND ref_id = ?2 AND summary_type = ?3
               AND prompt_version = ?4 AND model = ?5 AND input_hash = ?6",
            params![scope, ref_id, summary_type, prompt_version, model, input_hash],
            |row| row.get(0),
        )?;
        Ok(InsertResult {
            id,
            inserted: false,
        })
    }
}

fn map_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
    Ok(SummaryRow {
        id: row.get(0)?,
        scope: row.get(1)?,
        ref_id: row.get(2)?,
        summary_type: row.get(3)?,
        prompt_version: row.get(4)?,
        model: row.get(5)?,
        input_hash: row.get(6)?,
        content: row.get(7)?,
        params_json: row.get(8)?,
    })
}
