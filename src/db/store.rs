use serde_json::Value;
use sqlx::Row;

use crate::db::pool::Pool;
use crate::error::DatabaseError;
use crate::models::{
    Candidate, Event, EventRelay, NetworkType, Relay, RelayMetadata, ServiceName, ServiceState,
    StateType,
};

/// Outcome of a bulk event insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

/// Typed persistence facade over [`Pool`].
///
/// Every mutation maps to one named stored procedure, issued as a single
/// SQL round-trip in a single transaction; partial failure aborts the
/// whole batch. Row batches are transposed to column-major arrays before
/// binding. Batch sizes are validated against `max_batch_size` before any
/// SQL is issued, and empty batches return without touching the pool.
pub struct Store {
    pool: Pool,
    max_batch_size: usize,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        let max_batch_size = pool.config().max_batch_size;
        Self {
            pool,
            max_batch_size,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn check_batch(&self, len: usize) -> Result<(), DatabaseError> {
        if len > self.max_batch_size {
            return Err(DatabaseError::BatchTooLarge {
                got: len,
                max: self.max_batch_size,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Inserts (stored procedures)
    // -------------------------------------------------------------------

    /// Upsert relays by URL. Returns the number of new rows.
    pub async fn insert_relays(&self, relays: &[Relay]) -> Result<u64, DatabaseError> {
        self.check_batch(relays.len())?;
        if relays.is_empty() {
            return Ok(0);
        }

        // Column-major transpose for array binding.
        let urls: Vec<String> = relays.iter().map(|r| r.url().to_string()).collect();
        let networks: Vec<String> = relays.iter().map(|r| r.network().as_str().to_string()).collect();
        let discovered: Vec<i64> = relays.iter().map(Relay::discovered_at).collect();

        let row = sqlx::query("SELECT relay_insert($1, $2, $3)")
            .bind(&urls)
            .bind(&networks)
            .bind(&discovered)
            .fetch_one(&self.pool.handle()?)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    /// Upsert events by id. Returns (inserted, skipped).
    pub async fn insert_events(&self, events: &[Event]) -> Result<InsertOutcome, DatabaseError> {
        self.check_batch(events.len())?;
        if events.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let ids: Vec<String> = events.iter().map(Event::id_hex).collect();
        let pubkeys: Vec<String> = events.iter().map(Event::pubkey_hex).collect();
        let created: Vec<i64> = events.iter().map(Event::created_at).collect();
        let kinds: Vec<i32> = events.iter().map(|e| e.kind() as i32).collect();
        let tags: Vec<Value> = events.iter().map(Event::tags_json).collect();
        let contents: Vec<String> = events.iter().map(|e| e.content().to_string()).collect();
        let sigs: Vec<String> = events.iter().map(Event::sig_hex).collect();

        let row = sqlx::query(
            "SELECT inserted, skipped FROM event_insert($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&ids)
        .bind(&pubkeys)
        .bind(&created)
        .bind(&kinds)
        .bind(&tags)
        .bind(&contents)
        .bind(&sigs)
        .fetch_one(&self.pool.handle()?)
        .await?;

        Ok(InsertOutcome {
            inserted: row.try_get::<i64, _>("inserted")? as u64,
            skipped: row.try_get::<i64, _>("skipped")? as u64,
        })
    }

    /// Insert event-relay observations, cascading missing events and
    /// relays inside the same transaction.
    pub async fn insert_event_relays(&self, batch: &[EventRelay]) -> Result<u64, DatabaseError> {
        self.check_batch(batch.len())?;
        if batch.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = batch.iter().map(|er| er.event.id_hex()).collect();
        let pubkeys: Vec<String> = batch.iter().map(|er| er.event.pubkey_hex()).collect();
        let created: Vec<i64> = batch.iter().map(|er| er.event.created_at()).collect();
        let kinds: Vec<i32> = batch.iter().map(|er| er.event.kind() as i32).collect();
        let tags: Vec<Value> = batch.iter().map(|er| er.event.tags_json()).collect();
        let contents: Vec<String> = batch.iter().map(|er| er.event.content().to_string()).collect();
        let sigs: Vec<String> = batch.iter().map(|er| er.event.sig_hex()).collect();
        let urls: Vec<String> = batch.iter().map(|er| er.relay.url().to_string()).collect();
        let networks: Vec<String> = batch
            .iter()
            .map(|er| er.relay.network().as_str().to_string())
            .collect();
        let discovered: Vec<i64> = batch.iter().map(|er| er.relay.discovered_at()).collect();
        let seen: Vec<i64> = batch.iter().map(|er| er.seen_at).collect();

        let row = sqlx::query(
            "SELECT event_relay_insert($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&ids)
        .bind(&pubkeys)
        .bind(&created)
        .bind(&kinds)
        .bind(&tags)
        .bind(&contents)
        .bind(&sigs)
        .bind(&urls)
        .bind(&networks)
        .bind(&discovered)
        .bind(&seen)
        .fetch_one(&self.pool.handle()?)
        .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    /// Insert relay metadata observations. With `cascade`, missing relay
    /// and metadata rows are created in the same transaction.
    pub async fn insert_relay_metadata(
        &self,
        batch: &[RelayMetadata],
        cascade: bool,
    ) -> Result<u64, DatabaseError> {
        self.check_batch(batch.len())?;
        if batch.is_empty() {
            return Ok(0);
        }

        let urls: Vec<String> = batch.iter().map(|rm| rm.relay.url().to_string()).collect();
        let networks: Vec<String> = batch
            .iter()
            .map(|rm| rm.relay.network().as_str().to_string())
            .collect();
        let discovered: Vec<i64> = batch.iter().map(|rm| rm.relay.discovered_at()).collect();
        let types: Vec<String> = batch
            .iter()
            .map(|rm| rm.metadata.metadata_type().as_str().to_string())
            .collect();
        let hashes: Vec<String> = batch.iter().map(|rm| rm.metadata.content_hash()).collect();
        let payloads: Vec<Value> = batch.iter().map(|rm| rm.metadata.payload().clone()).collect();
        let generated: Vec<i64> = batch.iter().map(|rm| rm.generated_at).collect();

        let row = sqlx::query(
            "SELECT relay_metadata_insert($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&urls)
        .bind(&networks)
        .bind(&discovered)
        .bind(&types)
        .bind(&hashes)
        .bind(&payloads)
        .bind(&generated)
        .bind(cascade)
        .fetch_one(&self.pool.handle()?)
        .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    // -------------------------------------------------------------------
    // Service state
    // -------------------------------------------------------------------

    /// Upsert state rows on (service, type, key); last writer by
    /// `updated_at` wins. Returns the number of rows written.
    pub async fn upsert_service_state(
        &self,
        states: &[ServiceState],
    ) -> Result<u64, DatabaseError> {
        self.check_batch(states.len())?;
        if states.is_empty() {
            return Ok(0);
        }

        let services: Vec<String> = states
            .iter()
            .map(|s| s.service_name.as_str().to_string())
            .collect();
        let types: Vec<String> = states
            .iter()
            .map(|s| s.state_type.as_str().to_string())
            .collect();
        let keys: Vec<String> = states.iter().map(|s| s.state_key.clone()).collect();
        let values: Vec<Value> = states.iter().map(|s| s.state_value.clone()).collect();
        let updated: Vec<i64> = states.iter().map(|s| s.updated_at).collect();

        let row = sqlx::query("SELECT service_state_upsert($1, $2, $3, $4, $5)")
            .bind(&services)
            .bind(&types)
            .bind(&keys)
            .bind(&values)
            .bind(&updated)
            .fetch_one(&self.pool.handle()?)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    /// Fetch state rows for a service and type, ordered by `updated_at`
    /// ascending. A key narrows the lookup to one row.
    pub async fn get_service_state(
        &self,
        service: ServiceName,
        state_type: StateType,
        state_key: Option<&str>,
    ) -> Result<Vec<ServiceState>, DatabaseError> {
        let rows = match state_key {
            Some(key) => {
                sqlx::query(
                    "SELECT service_name, state_type, state_key, state_value, updated_at \
                     FROM service_state \
                     WHERE service_name = $1 AND state_type = $2 AND state_key = $3 \
                     ORDER BY updated_at ASC",
                )
                .bind(service.as_str())
                .bind(state_type.as_str())
                .bind(key)
                .fetch_all(&self.pool.handle()?)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT service_name, state_type, state_key, state_value, updated_at \
                     FROM service_state \
                     WHERE service_name = $1 AND state_type = $2 \
                     ORDER BY updated_at ASC",
                )
                .bind(service.as_str())
                .bind(state_type.as_str())
                .fetch_all(&self.pool.handle()?)
                .await?
            }
        };

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            states.push(decode_state_row(&row)?);
        }
        Ok(states)
    }

    /// Delete state rows identified by three parallel lists. Returns the
    /// number of rows removed.
    pub async fn delete_service_state(
        &self,
        services: &[ServiceName],
        types: &[StateType],
        keys: &[String],
    ) -> Result<u64, DatabaseError> {
        if services.len() != types.len() || services.len() != keys.len() {
            return Err(DatabaseError::Query(format!(
                "parallel list length mismatch: {} services, {} types, {} keys",
                services.len(),
                types.len(),
                keys.len()
            )));
        }
        self.check_batch(keys.len())?;
        if keys.is_empty() {
            return Ok(0);
        }

        let services: Vec<String> = services.iter().map(|s| s.as_str().to_string()).collect();
        let types: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();

        let row = sqlx::query("SELECT service_state_delete($1, $2, $3)")
            .bind(&services)
            .bind(&types)
            .bind(keys)
            .fetch_one(&self.pool.handle()?)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    // -------------------------------------------------------------------
    // Cleanup & maintenance
    // -------------------------------------------------------------------

    pub async fn delete_orphan_events(&self) -> Result<u64, DatabaseError> {
        let row = sqlx::query("SELECT event_delete_orphans()")
            .fetch_one(&self.pool.handle()?)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    pub async fn delete_orphan_metadata(&self) -> Result<u64, DatabaseError> {
        let row = sqlx::query("SELECT metadata_delete_orphans()")
            .fetch_one(&self.pool.handle()?)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    /// Refresh a materialized view by name. The identifier is validated
    /// before interpolation; values are never interpolated.
    pub async fn refresh_materialized_view(&self, name: &str) -> Result<(), DatabaseError> {
        validate_identifier(name)?;
        self.pool
            .execute(&format!("SELECT refresh_view('{name}')"))
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Reads used by the pipeline services
    // -------------------------------------------------------------------

    /// Candidates ordered least-failed and oldest first; ties are broken
    /// randomly so equal candidates cannot starve each other.
    pub async fn fetch_candidates(&self, limit: i64) -> Result<Vec<Candidate>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT service_name, state_type, state_key, state_value, updated_at \
             FROM service_state \
             WHERE state_type = 'candidate' \
             ORDER BY COALESCE((state_value->>'failures')::bigint, 0) ASC, \
                      updated_at ASC, random() \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool.handle()?)
        .await?;

        // Tolerant decode: a malformed row is logged and skipped, never
        // fatal for the cycle.
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let state = decode_state_row(&row)?;
            match Candidate::from_state(&state) {
                Ok(c) => candidates.push(c),
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::db::store",
                        "candidate_parse_failed key={} error={e}",
                        state.state_key
                    );
                }
            }
        }
        Ok(candidates)
    }

    /// Known relays, optionally filtered to one network.
    pub async fn fetch_relays(
        &self,
        network: Option<NetworkType>,
        limit: i64,
    ) -> Result<Vec<Relay>, DatabaseError> {
        let rows = match network {
            Some(net) => {
                sqlx::query(
                    "SELECT url, discovered_at FROM relay WHERE network = $1 \
                     ORDER BY discovered_at ASC LIMIT $2",
                )
                .bind(net.as_str())
                .bind(limit)
                .fetch_all(&self.pool.handle()?)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT url, discovered_at FROM relay ORDER BY discovered_at ASC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool.handle()?)
                .await?
            }
        };

        let mut relays = Vec::with_capacity(rows.len());
        for row in rows {
            let url: String = row.try_get("url")?;
            let discovered_at: i64 = row.try_get("discovered_at")?;
            match Relay::parse_at(&url, discovered_at) {
                Ok(r) => relays.push(r),
                Err(e) => {
                    tracing::warn!(target: "bigbrotr::db::store", "relay_parse_failed url={url} error={e}");
                }
            }
        }
        Ok(relays)
    }

    /// Relay URLs already promoted to the relay table, for candidate
    /// deduplication.
    pub async fn relay_urls(&self, urls: &[String]) -> Result<Vec<String>, DatabaseError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT url FROM relay WHERE url = ANY($1)")
            .bind(urls)
            .fetch_all(&self.pool.handle()?)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("url").map_err(DatabaseError::from))
            .collect()
    }

    /// Relays whose monitor cursor is missing or older than the
    /// staleness horizon, oldest check first.
    pub async fn fetch_relays_due_for_check(
        &self,
        checked_before: i64,
        limit: i64,
    ) -> Result<Vec<Relay>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT r.url, r.discovered_at \
             FROM relay r \
             LEFT JOIN service_state s \
               ON s.service_name = 'monitor' AND s.state_type = 'cursor' AND s.state_key = r.url \
             WHERE s.state_key IS NULL OR s.updated_at < $1 \
             ORDER BY COALESCE(s.updated_at, 0) ASC \
             LIMIT $2",
        )
        .bind(checked_before)
        .bind(limit)
        .fetch_all(&self.pool.handle()?)
        .await?;

        let mut relays = Vec::with_capacity(rows.len());
        for row in rows {
            let url: String = row.try_get("url")?;
            let discovered_at: i64 = row.try_get("discovered_at")?;
            if let Ok(r) = Relay::parse_at(&url, discovered_at) {
                relays.push(r);
            }
        }
        Ok(relays)
    }

    /// Relay URLs mentioned in stored events' tags since a cursor.
    /// Covers recommend-relay (2), contacts (3), relay-list (10002) and
    /// any event carrying `r`/`relay` tags. Returns (url, created_at)
    /// pairs ordered by creation time so the caller can advance its
    /// cursor.
    pub async fn fetch_event_tag_urls(
        &self,
        since: i64,
        limit: i64,
    ) -> Result<Vec<(String, i64)>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT DISTINCT t->>1 AS url, e.created_at \
             FROM event e \
             CROSS JOIN LATERAL jsonb_array_elements(e.tags) AS t \
             WHERE e.created_at >= $1 \
               AND (e.kind IN (2, 3, 10002) OR t->>0 IN ('r', 'relay')) \
               AND t->>1 LIKE 'ws%' \
             ORDER BY e.created_at ASC \
             LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool.handle()?)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("url")?,
                    row.try_get::<i64, _>("created_at")?,
                ))
            })
            .collect()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

fn decode_state_row(row: &sqlx::postgres::PgRow) -> Result<ServiceState, DatabaseError> {
    let service: String = row.try_get("service_name")?;
    let state_type: String = row.try_get("state_type")?;
    let state_key: String = row.try_get("state_key")?;
    let state_value: Value = row.try_get("state_value")?;
    let updated_at: i64 = row.try_get("updated_at")?;

    let service =
        ServiceName::parse(&service).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let state_type =
        StateType::parse(&state_type).map_err(|e| DatabaseError::Query(e.to_string()))?;
    ServiceState::new(service, state_type, state_key, state_value, updated_at)
        .map_err(|e| DatabaseError::Query(e.to_string()))
}

/// SQL identifiers are validated before interpolation; everything else
/// is bound as a parameter.
pub fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}
