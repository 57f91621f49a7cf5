//! Direct-API reservations. At most one is ACTIVE at any instant.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use super::{
    RESERVATION_COLUMNS, SqliteStore, format_ts, get_reservation_status, get_ts,
    is_constraint_violation, new_id,
};
use crate::SchedulerError;
use crate::types::{DirectReservation, ReservationStatus};

fn reservation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirectReservation> {
    Ok(DirectReservation {
        reservation_id: row.get(0)?,
        reserved_by: row.get(1)?,
        reserved_at: get_ts(row, 2)?,
        expires_at: get_ts(row, 3)?,
        status: get_reservation_status(row, 4)?,
    })
}

fn load_reservation(
    conn: &Connection,
    reservation_id: &str,
) -> Result<Option<DirectReservation>, SchedulerError> {
    let reservation = conn
        .query_row(
            &format!(
                "SELECT {RESERVATION_COLUMNS} FROM direct_reservations WHERE reservation_id = ?1"
            ),
            params![reservation_id],
            reservation_from_row,
        )
        .optional()?;
    Ok(reservation)
}

fn load_active(conn: &Connection) -> Result<Option<DirectReservation>, SchedulerError> {
    let reservation = conn
        .query_row(
            &format!(
                "SELECT {RESERVATION_COLUMNS} FROM direct_reservations WHERE status = 'ACTIVE'"
            ),
            [],
            reservation_from_row,
        )
        .optional()?;
    Ok(reservation)
}

fn expire_stale(conn: &Connection, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
    let expired = conn.execute(
        "UPDATE direct_reservations SET status = 'EXPIRED'
         WHERE status = 'ACTIVE' AND expires_at <= ?1",
        params![format_ts(&now)],
    )?;
    Ok(expired)
}

impl SqliteStore {
    /// Create the single ACTIVE reservation.
    ///
    /// Reservations past their expiry are swept first. Fails with
    /// [`SchedulerError::ReservationConflict`] if another one is still live.
    pub fn create_reservation(
        &self,
        reserved_by: &str,
        ttl: Duration,
    ) -> Result<DirectReservation, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let swept = expire_stale(&tx, now)?;
        if swept > 0 {
            info!(count = swept, "expired stale reservations");
        }
        if let Some(active) = load_active(&tx)? {
            return Err(SchedulerError::ReservationConflict {
                reservation_id: active.reservation_id,
                reserved_by: active.reserved_by,
            });
        }

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SchedulerError::InvalidOperation(format!("invalid expiry: {e}")))?;
        let reservation = DirectReservation {
            reservation_id: new_id(),
            reserved_by: reserved_by.to_string(),
            reserved_at: now,
            expires_at: now + ttl,
            status: ReservationStatus::Active,
        };

        let inserted = tx.execute(
            "INSERT INTO direct_reservations
             (reservation_id, reserved_by, reserved_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reservation.reservation_id,
                reservation.reserved_by,
                format_ts(&reservation.reserved_at),
                format_ts(&reservation.expires_at),
                reservation.status.as_str(),
            ],
        );
        match inserted {
            Ok(_) => {}
            // The partial unique index caught a writer we did not see.
            Err(e) if is_constraint_violation(&e) => {
                return Err(SchedulerError::ReservationConflict {
                    reservation_id: "unknown".to_string(),
                    reserved_by: "unknown".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        debug!(reservation_id = %reservation.reservation_id, reserved_by, "reservation created");
        Ok(reservation)
    }

    /// Get a reservation by id.
    pub fn get_reservation(&self, reservation_id: &str) -> Result<DirectReservation, SchedulerError> {
        let conn = self.conn()?;
        load_reservation(&conn, reservation_id)?
            .ok_or_else(|| SchedulerError::ReservationNotFound(reservation_id.to_string()))
    }

    /// The ACTIVE reservation, if any, regardless of its expiry time.
    pub fn get_active_reservation(&self) -> Result<Option<DirectReservation>, SchedulerError> {
        let conn = self.conn()?;
        load_active(&conn)
    }

    /// ACTIVE reservations. With the single-active rule this holds at most one.
    pub fn list_active_reservations(&self) -> Result<Vec<DirectReservation>, SchedulerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM direct_reservations WHERE status = 'ACTIVE'"
        ))?;
        let reservations = stmt
            .query_map([], reservation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reservations)
    }

    /// ACTIVE -> RELEASED.
    pub fn release_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<DirectReservation, SchedulerError> {
        self.finish_reservation(reservation_id, ReservationStatus::Released)
    }

    /// ACTIVE -> EXPIRED.
    pub fn expire_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<DirectReservation, SchedulerError> {
        self.finish_reservation(reservation_id, ReservationStatus::Expired)
    }

    /// Expire every ACTIVE reservation whose expiry is at or before `now`.
    pub fn expire_stale_reservations(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let conn = self.conn()?;
        expire_stale(&conn, now)
    }

    fn finish_reservation(
        &self,
        reservation_id: &str,
        status: ReservationStatus,
    ) -> Result<DirectReservation, SchedulerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE direct_reservations SET status = ?2
             WHERE reservation_id = ?1 AND status = 'ACTIVE'",
            params![reservation_id, status.as_str()],
        )?;
        let reservation = load_reservation(&tx, reservation_id)?
            .ok_or_else(|| SchedulerError::ReservationNotFound(reservation_id.to_string()))?;
        if changed == 0 {
            return Err(SchedulerError::InvalidOperation(format!(
                "reservation {reservation_id} is already {}",
                reservation.status.as_str()
            )));
        }
        tx.commit()?;
        Ok(reservation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn test_single_active_reservation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.create_reservation("api", TTL).unwrap();
        assert_eq!(first.status, ReservationStatus::Active);

        let err = store.create_reservation("cli", TTL).unwrap_err();
        match err {
            SchedulerError::ReservationConflict {
                reservation_id,
                reserved_by,
            } => {
                assert_eq!(reservation_id, first.reservation_id);
                assert_eq!(reserved_by, "api");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        store.release_reservation(&first.reservation_id).unwrap();
        assert!(store.create_reservation("cli", TTL).is_ok());
        assert_eq!(store.list_active_reservations().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_reservation_is_swept_on_create() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stale = store.create_reservation("api", Duration::ZERO).unwrap();

        let fresh = store.create_reservation("cli", TTL).unwrap();
        assert_eq!(
            store.get_reservation(&stale.reservation_id).unwrap().status,
            ReservationStatus::Expired
        );
        assert_eq!(
            store.get_active_reservation().unwrap().unwrap().reservation_id,
            fresh.reservation_id
        );
    }

    #[test]
    fn test_release_twice_is_invalid() {
        let store = SqliteStore::open_in_memory().unwrap();
        let reservation = store.create_reservation("api", TTL).unwrap();
        store.release_reservation(&reservation.reservation_id).unwrap();

        let err = store
            .release_reservation(&reservation.reservation_id)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidOperation(_)));

        let err = store.release_reservation("missing").unwrap_err();
        assert!(matches!(err, SchedulerError::ReservationNotFound(_)));
    }

    #[test]
    fn test_expire_stale_leaves_live_reservation() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_reservation("api", TTL).unwrap();
        assert_eq!(store.expire_stale_reservations(Utc::now()).unwrap(), 0);
        assert!(store.get_active_reservation().unwrap().is_some());
    }
}
