//! Plot events: append-only per `(book_id, chapter_idx)`, ordered by
//! `(chapter_idx, id)`.

use rusqlite::params;

use crate::storage::types::{InsertResult, PlotEventRow};
use crate::storage::{Session, StoreResult};

const EVENT_COLUMNS: &str =
    "id, book_id, chapter_idx, event_summary, involved_characters_json, event_type, impact";

impl Session<'_> {
    /// Events in the window `[chapter_idx - window, chapter_idx)`,
    /// most recent first.
    pub fn list_recent_plot_events(
        &self,
        book_id: i64,
        chapter_idx: Option<i64>,
        window: i64,
        limit: i64,
    ) -> StoreResult<Vec<PlotEventRow>> {
        let rows = match chapter_idx {
            Some(idx) => {
                let min_idx = (idx - window.max(1)).max(1);
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM plot_events
                     WHERE book_id = ?1 AND chapter_idx < ?2 AND chapter_idx >= ?3
                     ORDER BY chapter_idx DESC, id DESC LIMIT ?4"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![book_id, idx, min_idx, limit], map_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM plot_events WHERE book_id = ?1
                     ORDER BY chapter_idx DESC, id DESC LIMIT ?2"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![book_id, limit], map_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn list_plot_events_by_book(&self, book_id: i64) -> StoreResult<Vec<PlotEventRow>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM plot_events WHERE book_id = ?1
             ORDER BY chapter_idx, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([book_id], map_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_plot_event(
        &self,
        book_id: i64,
        chapter_idx: i64,
        event_summary: &str,
        involved_characters_json: Option<&str>,
        event_type: Option<&str>,
        impact: Option<&str>,
    ) -> StoreResult<InsertResult> {
        self.conn.execute(
            "INSERT INTO plot_events
                 (book_id, chapter_idx, event_summary, involved_characters_json, event_type, impact)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                book_id,
                chapter_idx,
                event_summary,
                involved_characters_json,
                event_type,
                impact
            ],
        )?;
        Ok(InsertResult {
            id: self.conn.last_insert_rowid(),
            inserted: true,
        })
    }
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlotEventRow> {
    Ok(PlotEventRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        chapter_idx: row.get(2)?,
        event_summary: row.get(3)?,
        involved_characters_json: row.get(4)?,
        event_type: row.get(5)?,
        impact: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    #[test]
    fn recent_events_window_is_half_open() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x")?;
                for idx in 1..=6 {
                    sess.insert_plot_event(book.id, idx, &format!("event-{idx}"), None, None, None)?;
                }
                let recent = sess.list_recent_plot_events(book.id, Some(5), 3, 20)?;
                let indexes: Vec<i64> = recent.iter().map(|e| e.chapter_idx).collect();
                assert_eq!(indexes, vec![4, 3, 2]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn events_preserve_insertion_order_within_chapter() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh2", "x")?;
                sess.insert_plot_event(book.id, 1, "first", None, None, None)?;
                sess.insert_plot_event(book.id, 1, "second", None, None, None)?;
                let all = sess.list_plot_events_by_book(book.id)?;
                let summaries: Vec<&str> =
                    all.iter().map(|e| e.event_summary.as_str()).collect();
                assert_eq!(summaries, vec!["first", "second"]);
                Ok(())
            })
            .unwrap();
    }
}
