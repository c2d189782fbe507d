//! Price alert rows for the out-of-band monitor loop.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use super::{now_ts, Store};

#[derive(Debug, Clone, Serialize)]
pub struct PriceAlert {
    pub id: i64,
    pub symbol: String,
    pub target_price: f64,
    pub condition: String,
    pub email: String,
    pub status: String,
    pub created_ts: i64,
    pub triggered_ts: Option<i64>,
}

impl Store {
    pub fn create_price_alert(
        &self,
        symbol: &str,
        target_price: f64,
        condition: &str,
        email: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO price_alerts(symbol, target_price, condition, email, status, created_ts)
             VALUES(?1, ?2, ?3, ?4, 'active', ?5)",
            params![symbol, target_price, condition, email, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_price_alerts(&self, status: Option<&str>) -> Result<Vec<PriceAlert>> {
        let mut sql = String::from(
            "SELECT id, symbol, target_price, condition, email, status, created_ts, triggered_ts
             FROM price_alerts WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        sql.push_str(" ORDER BY id DESC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok(PriceAlert {
                id: row.get(0)?,
                symbol: row.get(1)?,
                target_price: row.get(2)?,
                condition: row.get(3)?,
                email: row.get(4)?,
                status: row.get(5)?,
                created_ts: row.get(6)?,
                triggered_ts: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_price_alert(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM price_alerts WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn update_alert_status(&self, id: i64, status: &str) -> Result<bool> {
        let triggered_ts = (status == "triggered").then(now_ts);
        let updated = self.conn().execute(
            "UPDATE price_alerts SET status = ?2, triggered_ts = COALESCE(?3, triggered_ts)
             WHERE id = ?1",
            params![id, status, triggered_ts],
        )?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;

    #[test]
    fn alert_lifecycle() {
        let (_dir, store) = temp_store();
        let id = store
            .create_price_alert("BTC_USDT", 100_000.0, "above", "ops@example.com")
            .unwrap();

        let active = store.list_price_alerts(Some("active")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert!(active[0].triggered_ts.is_none());

        assert!(store.update_alert_status(id, "triggered").unwrap());
        let triggered = store.list_price_alerts(Some("triggered")).unwrap();
        assert_eq!(triggered.len(), 1);
        assert!(triggered[0].triggered_ts.is_some());

        assert!(store.delete_price_alert(id).unwrap());
        assert!(store.list_price_alerts(None).unwrap().is_empty());
        assert!(!store.update_alert_status(id, "cancelled").unwrap());
    }
}
