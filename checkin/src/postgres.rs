//! `PostgreSQL` implementation of the ticket store, event registry and ledger.
//!
//! # Atomic admission
//!
//! `append_if_absent` runs in a transaction that first takes a
//! transaction-scoped advisory lock on the (code, event) key. Every gate
//! process admitting the same key serializes on that lock, re-checks the
//! ledger under it and only then inserts, so exactly one of them sees
//! `Inserted`.
//!
//! # Schema
//!
//! See `migrations/0001_checkin.sql`; [`PostgresBackend::migrate`] applies it.

use crate::ports::{AppendOutcome, CheckInLedger, EventRegistry, PortError, PortFuture, TicketStore};
use crate::types::{
    AttendeeRef, CheckInRecord, EventId, EventInfo, StaffId, Ticket, TicketCode, TicketTypeId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

const SCHEMA: &str = include_str!("../migrations/0001_checkin.sql");

// Organic records sort before overrides, then oldest first.
const REPORTED_RECORD: &str = r"
    SELECT ticket_code, event_id, checked_in_at, staff_id, override_reason
    FROM check_ins
    WHERE ticket_code = $1 AND event_id = $2
    ORDER BY (override_reason IS NOT NULL), id
    LIMIT 1
";

fn db_error(store: &'static str) -> impl Fn(sqlx::Error) -> PortError {
    move |e| PortError::unavailable(store, e.to_string())
}

/// All three ports over one connection pool
#[derive(Clone, Debug)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connect to `database_url` with at most `max_connections` connections
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, PortError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error("postgres"))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the schema cannot be applied.
    pub async fn migrate(&self) -> Result<(), PortError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error("postgres"))?;
        tracing::info!("Check-in schema applied");
        Ok(())
    }

    /// Insert or replace an event and its staff roster
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the write fails.
    pub async fn upsert_event(&self, event: &EventInfo) -> Result<(), PortError> {
        let mut tx = self.pool.begin().await.map_err(db_error("event registry"))?;

        sqlx::query("INSERT INTO events (id, name) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name")
            .bind(event.id.as_str())
            .bind(&event.name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("event registry"))?;

        sqlx::query("DELETE FROM event_staff WHERE event_id = $1")
            .bind(event.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error("event registry"))?;

        for staff_id in &event.staff {
            sqlx::query("INSERT INTO event_staff (event_id, staff_id) VALUES ($1, $2)")
                .bind(event.id.as_str())
                .bind(staff_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error("event registry"))?;
        }

        tx.commit().await.map_err(db_error("event registry"))
    }

    /// Insert or replace a ticket, creating its type if needed
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the write fails.
    pub async fn upsert_ticket(&self, ticket: &Ticket) -> Result<(), PortError> {
        let mut tx = self.pool.begin().await.map_err(db_error("ticket store"))?;

        sqlx::query("INSERT INTO ticket_types (id, active) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET active = EXCLUDED.active")
            .bind(ticket.ticket_type_id.as_str())
            .bind(ticket.type_active)
            .execute(&mut *tx)
            .await
            .map_err(db_error("ticket store"))?;

        sqlx::query(
            r"
            INSERT INTO tickets (code, event_id, ticket_type_id, attendee)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO UPDATE
            SET event_id = EXCLUDED.event_id,
                ticket_type_id = EXCLUDED.ticket_type_id,
                attendee = EXCLUDED.attendee
            ",
        )
        .bind(ticket.code.as_str())
        .bind(ticket.event_id.as_str())
        .bind(ticket.ticket_type_id.as_str())
        .bind(ticket.attendee.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error("ticket store"))?;

        tx.commit().await.map_err(db_error("ticket store"))
    }

    fn row_to_record(row: &PgRow) -> Result<CheckInRecord, PortError> {
        let read = db_error("ledger");
        let code: String = row.try_get("ticket_code").map_err(&read)?;
        let event_id: String = row.try_get("event_id").map_err(&read)?;
        let timestamp: DateTime<Utc> = row.try_get("checked_in_at").map_err(&read)?;
        let staff_id: String = row.try_get("staff_id").map_err(&read)?;
        let override_reason: Option<String> = row.try_get("override_reason").map_err(&read)?;

        let (code, event_id, staff_id) = (
            TicketCode::new(code),
            EventId::new(event_id),
            StaffId::new(staff_id),
        );
        Ok(match override_reason {
            Some(reason) => CheckInRecord::overridden(code, event_id, timestamp, staff_id, reason),
            None => CheckInRecord::organic(code, event_id, timestamp, staff_id),
        })
    }

    async fn insert_record<'c, E>(executor: E, record: &CheckInRecord) -> Result<(), PortError>
    where
        E: sqlx::PgExecutor<'c>,
    {
        sqlx::query(
            r"
            INSERT INTO check_ins (ticket_code, event_id, checked_in_at, staff_id, override_reason)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(record.ticket_code.as_str())
        .bind(record.event_id.as_str())
        .bind(record.timestamp)
        .bind(record.staff_id.as_str())
        .bind(record.override_reason.as_deref())
        .execute(executor)
        .await
        .map_err(db_error("ledger"))?;
        Ok(())
    }
}

impl TicketStore for PostgresBackend {
    fn lookup_ticket<'a>(&'a self, code: &'a TicketCode) -> PortFuture<'a, Option<Ticket>> {
        Box::pin(async move {
            let read = db_error("ticket store");
            let row = sqlx::query(
                r"
                SELECT t.code, t.event_id, t.ticket_type_id, tt.active, t.attendee
                FROM tickets t
                JOIN ticket_types tt ON tt.id = t.ticket_type_id
                WHERE t.code = $1
                ",
            )
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(&read)?;

            let Some(row) = row else {
                return Ok(None);
            };
            Ok(Some(Ticket {
                code: TicketCode::new(row.try_get::<String, _>("code").map_err(&read)?),
                event_id: EventId::new(row.try_get::<String, _>("event_id").map_err(&read)?),
                ticket_type_id: TicketTypeId::new(
                    row.try_get::<String, _>("ticket_type_id").map_err(&read)?,
                ),
                type_active: row.try_get("active").map_err(&read)?,
                attendee: AttendeeRef::new(row.try_get::<String, _>("attendee").map_err(&read)?),
            }))
        })
    }
}

impl EventRegistry for PostgresBackend {
    fn get_event<'a>(&'a self, event_id: &'a EventId) -> PortFuture<'a, Option<EventInfo>> {
        Box::pin(async move {
            let read = db_error("event registry");
            let name: Option<(String,)> = sqlx::query_as("SELECT name FROM events WHERE id = $1")
                .bind(event_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(&read)?;

            let Some((name,)) = name else {
                return Ok(None);
            };

            let staff: Vec<(String,)> =
                sqlx::query_as("SELECT staff_id FROM event_staff WHERE event_id = $1")
                    .bind(event_id.as_str())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(&read)?;

            Ok(Some(EventInfo::new(
                event_id.as_str(),
                name,
                staff.into_iter().map(|(staff_id,)| staff_id),
            )))
        })
    }
}

impl CheckInLedger for PostgresBackend {
    fn find_record<'a>(
        &'a self,
        code: &'a TicketCode,
        event_id: &'a EventId,
    ) -> PortFuture<'a, Option<CheckInRecord>> {
        Box::pin(async move {
            let row = sqlx::query(REPORTED_RECORD)
                .bind(code.as_str())
                .bind(event_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("ledger"))?;
            row.as_ref().map(Self::row_to_record).transpose()
        })
    }

    fn append_if_absent(&self, record: CheckInRecord) -> PortFuture<'_, AppendOutcome> {
        Box::pin(async move {
            let write = db_error("ledger");
            let mut tx = self.pool.begin().await.map_err(&write)?;

            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || E'\\x1f' || $2, 0))")
                .bind(record.ticket_code.as_str())
                .bind(record.event_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(&write)?;

            let existing = sqlx::query(REPORTED_RECORD)
                .bind(record.ticket_code.as_str())
                .bind(record.event_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(&write)?;

            if let Some(row) = existing {
                tx.rollback().await.map_err(&write)?;
                return Ok(AppendOutcome::Existing(Self::row_to_record(&row)?));
            }

            Self::insert_record(&mut *tx, &record).await?;
            tx.commit().await.map_err(&write)?;
            Ok(AppendOutcome::Inserted)
        })
    }

    fn append_unconditional(&self, record: CheckInRecord) -> PortFuture<'_, ()> {
        Box::pin(async move { Self::insert_record(&self.pool, &record).await })
    }

    fn records<'a>(
        &'a self,
        code: &'a TicketCode,
        event_id: &'a EventId,
    ) -> PortFuture<'a, Vec<CheckInRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT ticket_code, event_id, checked_in_at, staff_id, override_reason
                FROM check_ins
                WHERE ticket_code = $1 AND event_id = $2
                ORDER BY id
                ",
            )
            .bind(code.as_str())
            .bind(event_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("ledger"))?;

            rows.iter().map(Self::row_to_record).collect()
        })
    }
}
