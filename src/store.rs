//! The embedded transactional store (C2).
//!
//! Wraps a single SQLite database with WAL and foreign-key enforcement in
//! force. Mutating operations take a `&mut Store::Tx` so that a whole
//! sequence of reads/writes commits or rolls back atomically; the trading
//! engine and resolver never touch `sqlx` directly.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::models::{
    Market, MarketStatus, PricePoint, Position, Resolution, ResolutionCriteria, Transaction,
    TransactionType, User,
};
use crate::pricing::{Side, DUST_THRESHOLD};

/// An open transaction against the store. Dropping it without calling
/// `commit` rolls back (sqlx's default `Transaction` behavior).
pub struct Tx<'a> {
    inner: sqlx::Transaction<'a, Sqlite>,
}

impl<'a> Tx<'a> {
    pub async fn commit(self) -> AppResult<()> {
        self.inner.commit().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `url`, with WAL and
    /// foreign-key enforcement on every connection in the pool. A single
    /// connection backs the writer pool (§5's single-writer discipline);
    /// callers that only read may share it too, since sqlx serializes access
    /// to one physical connection anyway.
    pub async fn connect(url: &str) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| AppError::InternalError(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            AppError::InternalError(format!("migration failed: {e}"))
        })?;

        info!("store opened and migrated");
        Ok(Self { pool })
    }

    pub async fn begin(&self) -> AppResult<Tx<'_>> {
        Ok(Tx {
            inner: self.pool.begin().await?,
        })
    }

    // ---- Users -------------------------------------------------------

    pub async fn create_user(&self, display_name: &str, balance: f64) -> AppResult<User> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO users (display_name, balance, created_at) VALUES (?, ?, ?)",
        )
        .bind(display_name)
        .bind(balance)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(User {
            id,
            display_name: display_name.to_string(),
            balance,
            created_at: now,
        })
    }

    pub async fn get_user(&self, user_id: i64) -> AppResult<User> {
        let row = sqlx::query("SELECT id, display_name, balance, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
        row_to_user(&row)
    }

    async fn get_user_tx(&self, tx: &mut Tx<'_>, user_id: i64) -> AppResult<User> {
        let row = sqlx::query("SELECT id, display_name, balance, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx.inner)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))?;
        row_to_user(&row)
    }

    pub async fn debit_balance(&self, tx: &mut Tx<'_>, user_id: i64, amount: f64) -> AppResult<f64> {
        let user = self.get_user_tx(tx, user_id).await?;
        if user.balance < amount {
            return Err(AppError::InsufficientFunds);
        }
        let new_balance = user.balance - amount;
        sqlx::query("UPDATE users SET balance = ? WHERE id = ?")
            .bind(new_balance)
            .bind(user_id)
            .execute(&mut *tx.inner)
            .await?;
        Ok(new_balance)
    }

    pub async fn credit_balance(&self, tx: &mut Tx<'_>, user_id: i64, amount: f64) -> AppResult<f64> {
        let user = self.get_user_tx(tx, user_id).await?;
        let new_balance = user.balance + amount;
        sqlx::query("UPDATE users SET balance = ? WHERE id = ?")
            .bind(new_balance)
            .bind(user_id)
            .execute(&mut *tx.inner)
            .await?;
        Ok(new_balance)
    }

    // ---- Markets -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_market(
        &self,
        title: &str,
        category: Option<&str>,
        source: &str,
        resolution_criteria: Option<&ResolutionCriteria>,
        creator: i64,
        q_yes: f64,
        q_no: f64,
        b: f64,
        closes_at: DateTime<Utc>,
    ) -> AppResult<Market> {
        let now = Utc::now();
        let criteria_json = resolution_criteria
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        let id = sqlx::query(
            "INSERT INTO markets
                (title, category, source, resolution_criteria, creator, q_yes, q_no, b, status, closes_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?)",
        )
        .bind(title)
        .bind(category)
        .bind(source)
        .bind(criteria_json)
        .bind(creator)
        .bind(q_yes)
        .bind(q_no)
        .bind(b)
        .bind(closes_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_market(id).await
    }

    pub async fn get_market(&self, market_id: i64) -> AppResult<Market> {
        let row = sqlx::query("SELECT * FROM markets WHERE id = ?")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("market {market_id}")))?;
        row_to_market(&row)
    }

    async fn get_market_tx(&self, tx: &mut Tx<'_>, market_id: i64) -> AppResult<Market> {
        let row = sqlx::query("SELECT * FROM markets WHERE id = ?")
            .bind(market_id)
            .fetch_optional(&mut *tx.inner)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("market {market_id}")))?;
        row_to_market(&row)
    }

    pub async fn load_market_for_trade(&self, tx: &mut Tx<'_>, market_id: i64) -> AppResult<Market> {
        let market = self.get_market_tx(tx, market_id).await?;
        if market.status != MarketStatus::Open {
            return Err(AppError::MarketNotOpen);
        }
        Ok(market)
    }

    pub async fn list_markets(&self) -> AppResult<Vec<Market>> {
        let rows = sqlx::query("SELECT * FROM markets ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_market).collect()
    }

    pub async fn list_markets_due(&self, now: DateTime<Utc>) -> AppResult<Vec<Market>> {
        let rows = sqlx::query("SELECT * FROM markets WHERE status = 'open' AND closes_at <= ?")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_market).collect()
    }

    pub async fn update_market_inventory(
        &self,
        tx: &mut Tx<'_>,
        market_id: i64,
        q_yes: f64,
        q_no: f64,
    ) -> AppResult<()> {
        sqlx::query("UPDATE markets SET q_yes = ?, q_no = ? WHERE id = ?")
            .bind(q_yes)
            .bind(q_no)
            .bind(market_id)
            .execute(&mut *tx.inner)
            .await?;
        Ok(())
    }

    pub async fn mark_resolved(
        &self,
        tx: &mut Tx<'_>,
        market_id: i64,
        outcome: Side,
        resolved_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE markets SET status = 'resolved', outcome = ?, resolved_at = ? WHERE id = ?")
            .bind(outcome.as_str())
            .bind(resolved_at.to_rfc3339())
            .bind(market_id)
            .execute(&mut *tx.inner)
            .await?;
        Ok(())
    }

    pub async fn mark_closed(&self, market_id: i64) -> AppResult<()> {
        sqlx::query("UPDATE markets SET status = 'closed' WHERE id = ? AND status = 'open'")
            .bind(market_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- Positions -----------------------------------------------------

    pub async fn get_position(
        &self,
        tx: &mut Tx<'_>,
        user_id: i64,
        market_id: i64,
        side: Side,
    ) -> AppResult<Option<Position>> {
        let row = sqlx::query(
            "SELECT id, user_id, market_id, side, shares, avg_price FROM positions
             WHERE user_id = ? AND market_id = ? AND side = ?",
        )
        .bind(user_id)
        .bind(market_id)
        .bind(side.as_str())
        .fetch_optional(&mut *tx.inner)
        .await?;

        row.as_ref().map(row_to_position).transpose()
    }

    /// Read-path variant outside any transaction, for query projections.
    pub async fn get_position_readonly(
        &self,
        user_id: i64,
        market_id: i64,
        side: Side,
    ) -> AppResult<Option<Position>> {
        let row = sqlx::query(
            "SELECT id, user_id, market_id, side, shares, avg_price FROM positions
             WHERE user_id = ? AND market_id = ? AND side = ?",
        )
        .bind(user_id)
        .bind(market_id)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_position).transpose()
    }

    pub async fn list_positions_for_user(&self, user_id: i64) -> AppResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT id, user_id, market_id, side, shares, avg_price FROM positions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn list_positions_by_side(
        &self,
        tx: &mut Tx<'_>,
        market_id: i64,
        side: Side,
    ) -> AppResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT id, user_id, market_id, side, shares, avg_price FROM positions
             WHERE market_id = ? AND side = ?",
        )
        .bind(market_id)
        .bind(side.as_str())
        .fetch_all(&mut *tx.inner)
        .await?;
        rows.iter().map(row_to_position).collect()
    }

    pub async fn count_positions(&self, market_id: i64) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE market_id = ?")
            .bind(market_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Insert or update the `(user, market, side)` position row. When an
    /// existing row is found the new cost basis is the weighted average of
    /// the old and new stake (§4.3 step 8); callers pass the stake just
    /// spent, not the resulting shares total.
    pub async fn upsert_position(
        &self,
        tx: &mut Tx<'_>,
        user_id: i64,
        market_id: i64,
        side: Side,
        delta_shares: f64,
        stake_for_new_shares: f64,
    ) -> AppResult<()> {
        let existing = self.get_position(tx, user_id, market_id, side).await?;
        match existing {
            Some(pos) => {
                let new_shares = pos.shares + delta_shares;
                let new_avg_price = ((pos.shares * pos.avg_price) + stake_for_new_shares)
                    / new_shares;
                sqlx::query(
                    "UPDATE positions SET shares = ?, avg_price = ? WHERE id = ?",
                )
                .bind(new_shares)
                .bind(new_avg_price)
                .bind(pos.id)
                .execute(&mut *tx.inner)
                .await?;
            }
            None => {
                let avg_price = stake_for_new_shares / delta_shares;
                sqlx::query(
                    "INSERT INTO positions (user_id, market_id, side, shares, avg_price)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(market_id)
                .bind(side.as_str())
                .bind(delta_shares)
                .bind(avg_price)
                .execute(&mut *tx.inner)
                .await?;
            }
        }
        Ok(())
    }

    /// Reduce a position's shares after a sell, deleting the row if the
    /// remainder is at or below the dust threshold. `avg_price` is left
    /// untouched (§9 "average-price semantics on sell").
    pub async fn reduce_position(
        &self,
        tx: &mut Tx<'_>,
        position_id: i64,
        new_shares: f64,
    ) -> AppResult<()> {
        if new_shares <= DUST_THRESHOLD {
            sqlx::query("DELETE FROM positions WHERE id = ?")
                .bind(position_id)
                .execute(&mut *tx.inner)
                .await?;
        } else {
            sqlx::query("UPDATE positions SET shares = ? WHERE id = ?")
                .bind(new_shares)
                .bind(position_id)
                .execute(&mut *tx.inner)
                .await?;
        }
        Ok(())
    }

    pub async fn credit_position_holder(
        &self,
        tx: &mut Tx<'_>,
        user_id: i64,
        amount: f64,
    ) -> AppResult<()> {
        self.credit_balance(tx, user_id, amount).await.map(|_| ())
    }

    // ---- Transactions & price history -----------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn append_transaction(
        &self,
        tx: &mut Tx<'_>,
        user_id: i64,
        market_id: i64,
        side: Side,
        transaction_type: TransactionType,
        shares: f64,
        price_per_share: f64,
        total_cash: f64,
    ) -> AppResult<i64> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO transactions
                (user_id, market_id, side, transaction_type, shares, price_per_share, total_cash, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(market_id)
        .bind(side.as_str())
        .bind(transaction_type.as_str())
        .bind(shares)
        .bind(price_per_share)
        .bind(total_cash)
        .bind(now.to_rfc3339())
        .execute(&mut *tx.inner)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn append_price_point(
        &self,
        tx: &mut Tx<'_>,
        market_id: i64,
        yes_price: f64,
        no_price: f64,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO price_points (market_id, yes_price, no_price, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(market_id)
        .bind(yes_price)
        .bind(no_price)
        .bind(now.to_rfc3339())
        .execute(&mut *tx.inner)
        .await?;
        Ok(())
    }

    pub async fn list_price_history(&self, market_id: i64) -> AppResult<Vec<PricePoint>> {
        let rows = sqlx::query(
            "SELECT market_id, yes_price, no_price, timestamp FROM price_points
             WHERE market_id = ? ORDER BY timestamp ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_price_point).collect()
    }

    pub async fn list_recent_transactions(
        &self,
        market_id: i64,
        limit: i64,
    ) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT id, user_id, market_id, side, transaction_type, shares, price_per_share, total_cash, timestamp
             FROM transactions WHERE market_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_transaction).collect()
    }

    pub async fn sum_transaction_volume(&self, market_id: i64) -> AppResult<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_cash), 0.0) AS volume FROM transactions WHERE market_id = ?",
        )
        .bind(market_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<f64, _>("volume"))
    }

    pub async fn count_distinct_traders(&self, market_id: i64) -> AppResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT user_id) AS n FROM transactions WHERE market_id = ?",
        )
        .bind(market_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn count_transactions(&self, market_id: i64) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM transactions WHERE market_id = ?")
            .bind(market_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    // ---- Resolutions -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_resolution(
        &self,
        tx: &mut Tx<'_>,
        market_id: i64,
        outcome: Side,
        source_url: &str,
        source_response: &serde_json::Value,
        calculation_steps: &[String],
        final_value: Option<&serde_json::Value>,
        resolved_by: &str,
    ) -> AppResult<()> {
        let now = Utc::now();
        let steps_json = serde_json::to_string(calculation_steps)
            .map_err(|e| AppError::InternalError(e.to_string()))?;
        let final_value_json = final_value
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO resolutions
                (market_id, outcome, source_url, source_response, calculation_steps, final_value, resolved_by, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(market_id)
        .bind(outcome.as_str())
        .bind(source_url)
        .bind(source_response.to_string())
        .bind(steps_json)
        .bind(final_value_json)
        .bind(resolved_by)
        .bind(now.to_rfc3339())
        .execute(&mut *tx.inner)
        .await?;

        debug!(market_id, resolved_by, "resolution recorded");
        Ok(())
    }

    pub async fn get_resolution(&self, market_id: i64) -> AppResult<Resolution> {
        let row = sqlx::query("SELECT * FROM resolutions WHERE market_id = ?")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("resolution for market {market_id}")))?;
        row_to_resolution(&row)
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> AppResult<User> {
    Ok(User {
        id: row.get("id"),
        display_name: row.get("display_name"),
        balance: row.get("balance"),
        created_at: parse_ts(row.get("created_at"))?,
    })
}

fn row_to_market(row: &sqlx::sqlite::SqliteRow) -> AppResult<Market> {
    let status_str: String = row.get("status");
    let outcome_str: Option<String> = row.get("outcome");
    let criteria_str: Option<String> = row.get("resolution_criteria");
    let resolved_at_str: Option<String> = row.get("resolved_at");

    Ok(Market {
        id: row.get("id"),
        title: row.get("title"),
        category: row.get("category"),
        source: row.get("source"),
        resolution_criteria: criteria_str
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| AppError::InternalError(e.to_string()))?,
        creator: row.get("creator"),
        q_yes: row.get("q_yes"),
        q_no: row.get("q_no"),
        b: row.get("b"),
        status: MarketStatus::from_str(&status_str).map_err(AppError::InternalError)?,
        outcome: outcome_str
            .map(|s| Side::from_str(&s))
            .transpose()
            .map_err(AppError::InternalError)?,
        closes_at: parse_ts(row.get("closes_at"))?,
        resolved_at: resolved_at_str.map(|s| parse_ts(s)).transpose()?,
        created_at: parse_ts(row.get("created_at"))?,
    })
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> AppResult<Position> {
    let side_str: String = row.get("side");
    Ok(Position {
        id: row.get("id"),
        user: row.get("user_id"),
        market: row.get("market_id"),
        side: Side::from_str(&side_str).map_err(AppError::InternalError)?,
        shares: row.get("shares"),
        avg_price: row.get("avg_price"),
    })
}

fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> AppResult<Transaction> {
    let side_str: String = row.get("side");
    let type_str: String = row.get("transaction_type");
    Ok(Transaction {
        id: row.get("id"),
        user: row.get("user_id"),
        market: row.get("market_id"),
        side: Side::from_str(&side_str).map_err(AppError::InternalError)?,
        transaction_type: match type_str.as_str() {
            "buy" => TransactionType::Buy,
            "sell" => TransactionType::Sell,
            other => return Err(AppError::InternalError(format!("bad transaction_type '{other}'"))),
        },
        shares: row.get("shares"),
        price_per_share: row.get("price_per_share"),
        total_cash: row.get("total_cash"),
        timestamp: parse_ts(row.get("timestamp"))?,
    })
}

fn row_to_price_point(row: &sqlx::sqlite::SqliteRow) -> AppResult<PricePoint> {
    Ok(PricePoint {
        market: row.get("market_id"),
        yes_price: row.get("yes_price"),
        no_price: row.get("no_price"),
        timestamp: parse_ts(row.get("timestamp"))?,
    })
}

fn row_to_resolution(row: &sqlx::sqlite::SqliteRow) -> AppResult<Resolution> {
    let outcome_str: String = row.get("outcome");
    let response_str: String = row.get("source_response");
    let steps_str: String = row.get("calculation_steps");
    let final_value_str: Option<String> = row.get("final_value");

    Ok(Resolution {
        market: row.get("market_id"),
        outcome: Side::from_str(&outcome_str).map_err(AppError::InternalError)?,
        source_url: row.get("source_url"),
        source_response: serde_json::from_str(&response_str)
            .map_err(|e| AppError::InternalError(e.to_string()))?,
        calculation_steps: serde_json::from_str(&steps_str)
            .map_err(|e| AppError::InternalError(e.to_string()))?,
        final_value: final_value_str
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| AppError::InternalError(e.to_string()))?,
        resolved_by: row.get("resolved_by"),
        resolved_at: parse_ts(row.get("resolved_at"))?,
    })
}

fn parse_ts(s: String) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::InternalError(format!("bad timestamp '{s}': {e}")))
}
