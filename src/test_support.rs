//! Fixtures shared by unit tests.

use crate::availability::Interval;
use crate::db_types::{
    Appointment, AppointmentStatus, AvailabilityOverride, AvailabilityRule, NewNotification,
    Notification, Nurse, Patient,
};
use crate::error::RepoError;
use crate::memory_repository::MemoryRepository;
use crate::repository::{Repository, Reservation, ReservationRequest};
use crate::types::{CallSession, ConversationTurn, SessionId, TranscriptRecord};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::macros::{date, time};
use time::Date;

/// Monday 2025-03-10.
pub const SCENARIO_DATE: Date = date!(2025 - 03 - 10);

pub struct Scenario {
    pub repo: Arc<MemoryRepository>,
    pub patient: Patient,
    pub nurse: Nurse,
    pub booked: Appointment,
}

/// The caller at +15551234567 is assigned a nurse who works Mondays 09:00-17:00 and already
/// has 10:00-10:30 booked on [`SCENARIO_DATE`].
pub fn scenario() -> Scenario {
    let repo = Arc::new(MemoryRepository::new());
    let patient = repo.add_patient("Pat Doe", "+1 (555) 123-4567", &["hypertension"]);
    let nurse = repo.add_nurse("Nora Quinn", "Home health");
    let other = repo.add_patient("Sam Roe", "+15550000000", &[]);
    repo.assign(patient.id, nurse.id, date!(2025 - 03 - 01));
    repo.add_rule(AvailabilityRule {
        nurse_id: nurse.id,
        day_of_week: 0,
        start_time: time!(9:00),
        end_time: time!(17:00),
    });
    let booked = repo.add_appointment(
        other.id,
        nurse.id,
        SCENARIO_DATE,
        time!(10:00),
        30,
        AppointmentStatus::Scheduled,
    );
    Scenario {
        repo,
        patient,
        nurse,
        booked,
    }
}

/// Repository wrapper that can fail or stall on demand. Scheduling reads and writes and the
/// call/transcript journal can be broken independently, and a reservation can be made to
/// hang after it has already been written.
pub struct FlakyRepository {
    inner: Arc<dyn Repository>,
    scheduling_failing: AtomicBool,
    journal_failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    stall_after_reserve: Mutex<Option<Duration>>,
}

impl FlakyRepository {
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            scheduling_failing: AtomicBool::new(false),
            journal_failing: AtomicBool::new(false),
            delay: Mutex::new(None),
            stall_after_reserve: Mutex::new(None),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.scheduling_failing.store(failing, Ordering::SeqCst);
        self.journal_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_scheduling_failing(&self, failing: bool) {
        self.scheduling_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_stall_after_reserve(&self, stall: Option<Duration>) {
        *self.stall_after_reserve.lock().unwrap() = stall;
    }

    async fn scheduling(&self) -> Result<(), RepoError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.scheduling_failing.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn journal(&self) -> Result<(), RepoError> {
        if self.journal_failing.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn find_patient_by_phone(&self, phone: &str) -> Result<Option<Patient>, RepoError> {
        self.scheduling().await?;
        self.inner.find_patient_by_phone(phone).await
    }

    async fn find_assigned_nurse(
        &self,
        patient_id: i32,
        on: Date,
    ) -> Result<Option<Nurse>, RepoError> {
        self.scheduling().await?;
        self.inner.find_assigned_nurse(patient_id, on).await
    }

    async fn find_nurse(&self, nurse_id: i32) -> Result<Option<Nurse>, RepoError> {
        self.scheduling().await?;
        self.inner.find_nurse(nurse_id).await
    }

    async fn availability_rules(&self, nurse_id: i32) -> Result<Vec<AvailabilityRule>, RepoError> {
        self.scheduling().await?;
        self.inner.availability_rules(nurse_id).await
    }

    async fn availability_override(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Option<AvailabilityOverride>, RepoError> {
        self.scheduling().await?;
        self.inner.availability_override(nurse_id, date).await
    }

    async fn booked_appointments(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Vec<Appointment>, RepoError> {
        self.scheduling().await?;
        self.inner.booked_appointments(nurse_id, date).await
    }

    async fn reserve_appointment(
        &self,
        request: &ReservationRequest,
    ) -> Result<Reservation, RepoError> {
        self.scheduling().await?;
        let res = self.inner.reserve_appointment(request).await;
        let stall = *self.stall_after_reserve.lock().unwrap();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        res
    }

    async fn enqueue_notifications(
        &self,
        notifications: &[NewNotification],
    ) -> Result<Vec<Notification>, RepoError> {
        self.scheduling().await?;
        self.inner.enqueue_notifications(notifications).await
    }

    async fn record_call_started(&self, session: &CallSession) -> Result<(), RepoError> {
        self.journal()?;
        self.inner.record_call_started(session).await
    }

    async fn record_call_ended(&self, session: &CallSession) -> Result<(), RepoError> {
        self.journal()?;
        self.inner.record_call_ended(session).await
    }

    async fn append_turns(
        &self,
        session_id: SessionId,
        turns: &[ConversationTurn],
    ) -> Result<(), RepoError> {
        self.journal()?;
        self.inner.append_turns(session_id, turns).await
    }

    async fn save_transcript(&self, record: &TranscriptRecord) -> Result<(), RepoError> {
        self.journal()?;
        self.inner.save_transcript(record).await
    }
}

#[tokio::test]
async fn scenario_slots_exclude_the_booked_window() {
    let s = scenario();
    let free = s
        .repo
        .get_available_slots(s.nurse.id, SCENARIO_DATE)
        .await
        .unwrap();
    let booked = Interval::of_appointment(&s.booked).unwrap();
    assert!(free.iter().all(|f| !f.overlaps(&booked)));
    assert_eq!(free.first().map(|f| f.to_string()), Some("09:00-10:00".into()));
    assert_eq!(free.last().map(|f| f.to_string()), Some("10:30-17:00".into()));
}
