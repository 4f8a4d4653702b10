use crate::availability::Interval;
use crate::db_types::{
    Appointment, AvailabilityOverride, AvailabilityRule, NewNotification, Notification, Nurse,
    Patient,
};
use crate::error::{AppError, RepoError};
use crate::repository::{Repository, Reservation, ReservationRequest};
use crate::tools::normalize_phone;
use crate::types::{CallSession, ConversationTurn, SessionId, Speaker, TranscriptRecord};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const EXCLUSION_VIOLATION: &str = "23P01";

const APPOINTMENT_COLUMNS: &str = "id, patient_id, nurse_id, appointment_date, appointment_time, \
                                   duration_minutes, status, notes, created_at";

pub struct PgRepository {
    pool: Pool<Postgres>,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await
            .map_err(|e| {
                error!(error=%e, "failed to connect to postgres");
                AppError("db connect error")
            })?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                error!(error=%e, "failed to run migrations");
                AppError("db migration error")
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn find_patient_by_phone(&self, phone: &str) -> Result<Option<Patient>, RepoError> {
        let wanted = normalize_phone(phone);
        let candidates = sqlx::query_as::<_, Patient>(
            "
            select id, name, phone, email, date_of_birth, medical_conditions
            from patients
            where right(regexp_replace(phone, '[^0-9]', '', 'g'), 10) = right($1, 10)
            order by id
            ",
        )
        .bind(wanted.trim_start_matches('+'))
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates
            .into_iter()
            .find(|p| normalize_phone(&p.phone) == wanted))
    }

    async fn find_assigned_nurse(
        &self,
        patient_id: i32,
        on: Date,
    ) -> Result<Option<Nurse>, RepoError> {
        let nurse = sqlx::query_as::<_, Nurse>(
            "
            select n.id, n.name, n.specialization, n.phone, n.email, n.is_active
            from patient_nurse_assignments a
            join nurses n on n.id = a.nurse_id
            where a.patient_id = $1
              and a.assignment_date <= $2
              and n.is_active
            order by a.is_primary desc, a.assignment_date desc
            limit 1
            ",
        )
        .bind(patient_id)
        .bind(on)
        .fetch_optional(&self.pool)
        .await?;
        Ok(nurse)
    }

    async fn find_nurse(&self, nurse_id: i32) -> Result<Option<Nurse>, RepoError> {
        let nurse = sqlx::query_as::<_, Nurse>(
            "
            select id, name, specialization, phone, email, is_active
            from nurses
            where id = $1
            ",
        )
        .bind(nurse_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(nurse)
    }

    async fn availability_rules(&self, nurse_id: i32) -> Result<Vec<AvailabilityRule>, RepoError> {
        let rules = sqlx::query_as::<_, AvailabilityRule>(
            "
            select nurse_id, day_of_week, start_time, end_time
            from nurse_availability
            where nurse_id = $1
            order by day_of_week, start_time
            ",
        )
        .bind(nurse_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn availability_override(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Option<AvailabilityOverride>, RepoError> {
        let day_override = sqlx::query_as::<_, AvailabilityOverride>(
            "
            select nurse_id, override_date, start_time, end_time, is_available
            from nurse_availability_overrides
            where nurse_id = $1 and override_date = $2
            ",
        )
        .bind(nurse_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(day_override)
    }

    async fn booked_appointments(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Vec<Appointment>, RepoError> {
        let appointments = sqlx::query_as::<_, Appointment>(&format!(
            "
            select {APPOINTMENT_COLUMNS}
            from appointments
            where nurse_id = $1
              and appointment_date = $2
              and status <> 'cancelled'
            order by appointment_time
            "
        ))
        .bind(nurse_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(appointments)
    }

    /// Serializes reservations per nurse with a transaction-scoped advisory lock. A row that
    /// already matches the request is returned as is; otherwise the row is written only if
    /// nothing overlaps. The exclusion constraint on `appointments` backs this
    /// up for writers that bypass the lock.
    async fn reserve_appointment(
        &self,
        request: &ReservationRequest,
    ) -> Result<Reservation, RepoError> {
        let wanted = request
            .window()
            .ok_or_else(|| RepoError::Query("reservation window runs past midnight".into()))?;
        let starts_at = PrimitiveDateTime::new(request.date, request.start);
        let ends_at = starts_at + time::Duration::minutes(i64::from(request.duration_minutes));

        let mut tx = self.pool.begin().await?;
        sqlx::query("select pg_advisory_xact_lock($1)")
            .bind(i64::from(request.nurse_id))
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, Appointment>(&format!(
            "
            select {APPOINTMENT_COLUMNS}
            from appointments
            where patient_id = $1
              and nurse_id = $2
              and appointment_date = $3
              and appointment_time = $4
              and duration_minutes = $5
              and status <> 'cancelled'
            limit 1
            "
        ))
        .bind(request.patient_id)
        .bind(request.nurse_id)
        .bind(request.date)
        .bind(request.start)
        .bind(i32::from(request.duration_minutes))
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = existing {
            tx.rollback().await?;
            debug!(appointment_id = existing.id, "reservation already written");
            return Ok(Reservation::Reserved(existing));
        }

        let clash = sqlx::query_as::<_, (Time, i32)>(
            "
            select appointment_time, duration_minutes
            from appointments
            where nurse_id = $1
              and status <> 'cancelled'
              and appointment_date + appointment_time < $3
              and appointment_date + appointment_time + make_interval(mins => duration_minutes) > $2
            order by appointment_date, appointment_time
            limit 1
            ",
        )
        .bind(request.nurse_id)
        .bind(starts_at)
        .bind(ends_at)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((start, minutes)) = clash {
            tx.rollback().await?;
            let window = u16::try_from(minutes)
                .ok()
                .and_then(|m| Interval::starting_at(start, m))
                .unwrap_or(wanted);
            debug!(nurse_id = request.nurse_id, clash = %window, "reservation conflict");
            return Ok(Reservation::Conflict(window));
        }

        let inserted = sqlx::query_as::<_, Appointment>(&format!(
            "
            insert into appointments (
              patient_id,
              nurse_id,
              appointment_date,
              appointment_time,
              duration_minutes,
              status,
              notes
            ) values (
              $1,
              $2,
              $3,
              $4,
              $5,
              'scheduled',
              $6
            )
            returning {APPOINTMENT_COLUMNS}
            "
        ))
        .bind(request.patient_id)
        .bind(request.nurse_id)
        .bind(request.date)
        .bind(request.start)
        .bind(i32::from(request.duration_minutes))
        .bind(&request.notes)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(appointment) => {
                tx.commit().await?;
                Ok(Reservation::Reserved(appointment))
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(EXCLUSION_VIOLATION) => {
                warn!(nurse_id = request.nurse_id, "exclusion constraint rejected reservation");
                tx.rollback().await?;
                Ok(Reservation::Conflict(wanted))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue_notifications(
        &self,
        notifications: &[NewNotification],
    ) -> Result<Vec<Notification>, RepoError> {
        let mut tx = self.pool.begin().await?;
        let mut rows = Vec::with_capacity(notifications.len());
        for n in notifications {
            let row = sqlx::query_as::<_, Notification>(
                "
                insert into notifications (
                  recipient_kind,
                  recipient_id,
                  appointment_id,
                  kind,
                  message
                ) values (
                  $1,
                  $2,
                  $3,
                  $4,
                  $5
                )
                returning id, recipient_kind, recipient_id, appointment_id, kind, message,
                          delivery_status, created_at
                ",
            )
            .bind(n.recipient_kind)
            .bind(n.recipient_id)
            .bind(n.appointment_id)
            .bind(n.kind)
            .bind(&n.message)
            .fetch_one(&mut *tx)
            .await?;
            rows.push(row);
        }
        tx.commit().await?;
        Ok(rows)
    }

    async fn record_call_started(&self, session: &CallSession) -> Result<(), RepoError> {
        sqlx::query(
            "
            insert into calls (
              id,
              call_sid,
              stream_sid,
              direction,
              patient_phone,
              workflow_state,
              started_at
            ) values (
              $1,
              $2,
              $3,
              $4,
              $5,
              $6,
              $7
            )
            on conflict (id) do nothing
            ",
        )
        .bind(session.id.0)
        .bind(&session.call_sid)
        .bind(&session.stream_sid)
        .bind(session.direction.as_str())
        .bind(&session.patient_phone)
        .bind(session.workflow_state.as_str())
        .bind(session.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_call_ended(&self, session: &CallSession) -> Result<(), RepoError> {
        sqlx::query(
            "
            update calls
            set patient_id = $2,
                nurse_id = $3,
                appointment_id = $4,
                workflow_state = $5,
                ended_at = $6,
                duration_seconds = $7,
                close_reason = $8
            where id = $1
            ",
        )
        .bind(session.id.0)
        .bind(session.patient_id)
        .bind(session.nurse_id)
        .bind(session.appointment_id)
        .bind(session.workflow_state.as_str())
        .bind(session.ended_at)
        .bind(session.duration_seconds())
        .bind(session.close_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_turns(
        &self,
        session_id: SessionId,
        turns: &[ConversationTurn],
    ) -> Result<(), RepoError> {
        if turns.is_empty() {
            return Ok(());
        }
        let call_ids: Vec<Uuid> = vec![session_id.0; turns.len()];
        let seqs: Vec<i64> = turns.iter().map(|t| t.seq as i64).collect();
        let speakers: Vec<&str> = turns.iter().map(|t| t.speaker.as_str()).collect();
        let kinds: Vec<&str> = turns.iter().map(|t| t.kind.as_str()).collect();
        let payloads: Vec<&str> = turns.iter().map(|t| t.payload.as_str()).collect();
        let recorded: Vec<OffsetDateTime> = turns.iter().map(|t| t.recorded_at).collect();
        sqlx::query(
            "
            insert into conversation_turns (
              call_id,
              seq,
              speaker,
              kind,
              payload,
              recorded_at
            )
            select * from unnest (
              $1::uuid[],
              $2::bigint[],
              $3::text[],
              $4::text[],
              $5::text[],
              $6::timestamptz[]
            )
            on conflict (call_id, seq) do nothing
            ",
        )
        .bind(&call_ids)
        .bind(&seqs)
        .bind(&speakers)
        .bind(&kinds)
        .bind(&payloads)
        .bind(&recorded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_transcript(&self, record: &TranscriptRecord) -> Result<(), RepoError> {
        sqlx::query(
            "
            insert into call_transcripts (
              call_id,
              full_transcript,
              patient_transcript,
              assistant_transcript,
              appointment_summary,
              scheduling_outcome
            ) values (
              $1,
              $2,
              $3,
              $4,
              $5,
              $6
            )
            on conflict (call_id) do update
            set full_transcript = excluded.full_transcript,
                patient_transcript = excluded.patient_transcript,
                assistant_transcript = excluded.assistant_transcript,
                appointment_summary = excluded.appointment_summary,
                scheduling_outcome = excluded.scheduling_outcome
            ",
        )
        .bind(record.session_id.0)
        .bind(&record.full_text)
        .bind(record.partition(Speaker::Patient))
        .bind(record.partition(Speaker::Assistant))
        .bind(record.summary.as_deref())
        .bind(record.outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
