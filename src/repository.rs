use crate::availability::{self, Interval};
use crate::db_types::{
    Appointment, AvailabilityOverride, AvailabilityRule, NewNotification, Notification, Nurse,
    Patient,
};
use crate::error::RepoError;
use crate::types::{CallSession, ConversationTurn, SessionId, TranscriptRecord};

use async_trait::async_trait;
use time::{Date, Time};

#[derive(Clone, Debug, PartialEq)]
pub struct ReservationRequest {
    pub patient_id: i32,
    pub nurse_id: i32,
    pub date: Date,
    pub start: Time,
    pub duration_minutes: u16,
    pub notes: String,
}

impl ReservationRequest {
    pub fn window(&self) -> Option<Interval> {
        Interval::starting_at(self.start, self.duration_minutes)
    }

    /// Whether `appointment` is the live row this request writes.
    pub fn matches(&self, appointment: &Appointment) -> bool {
        appointment.patient_id == self.patient_id
            && appointment.nurse_id == self.nurse_id
            && appointment.appointment_date == self.date
            && appointment.appointment_time == self.start
            && appointment.duration_minutes == i32::from(self.duration_minutes)
            && appointment.status.blocks_time()
    }
}

/// Result of the atomic reserve-or-fail write.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    Reserved(Appointment),
    /// Another non-cancelled appointment for the nurse already covers part of the window.
    Conflict(Interval),
}

/// Everything the call core reads or writes. Implementations must make `reserve_appointment`
/// atomic with respect to the no-overlap invariant across concurrent callers, and idempotent:
/// repeating a request whose row already exists returns that row as `Reserved`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_patient_by_phone(&self, phone: &str) -> Result<Option<Patient>, RepoError>;

    /// The nurse currently assigned to the patient, primary assignments first, latest first.
    async fn find_assigned_nurse(
        &self,
        patient_id: i32,
        on: Date,
    ) -> Result<Option<Nurse>, RepoError>;

    async fn find_nurse(&self, nurse_id: i32) -> Result<Option<Nurse>, RepoError>;

    async fn availability_rules(&self, nurse_id: i32) -> Result<Vec<AvailabilityRule>, RepoError>;

    async fn availability_override(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Option<AvailabilityOverride>, RepoError>;

    /// Non-cancelled appointments for the nurse on `date`.
    async fn booked_appointments(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Vec<Appointment>, RepoError>;

    async fn reserve_appointment(
        &self,
        request: &ReservationRequest,
    ) -> Result<Reservation, RepoError>;

    async fn enqueue_notifications(
        &self,
        notifications: &[NewNotification],
    ) -> Result<Vec<Notification>, RepoError>;

    async fn record_call_started(&self, session: &CallSession) -> Result<(), RepoError>;

    async fn record_call_ended(&self, session: &CallSession) -> Result<(), RepoError>;

    /// Persist transcript turns. Re-sending an already stored `seq` is a no-op.
    async fn append_turns(
        &self,
        session_id: SessionId,
        turns: &[ConversationTurn],
    ) -> Result<(), RepoError>;

    async fn save_transcript(&self, record: &TranscriptRecord) -> Result<(), RepoError>;

    /// Ordered free intervals for the nurse on `date`: effective working windows (a date
    /// override beats the weekly rules) minus already booked windows.
    async fn get_available_slots(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Vec<Interval>, RepoError> {
        let rules = self.availability_rules(nurse_id).await?;
        let day_override = self.availability_override(nurse_id, date).await?;
        let windows = availability::effective_windows(date, &rules, day_override.as_ref());
        if windows.is_empty() {
            return Ok(vec![]);
        }
        let booked: Vec<Interval> = self
            .booked_appointments(nurse_id, date)
            .await?
            .iter()
            .filter_map(Interval::of_appointment)
            .collect();
        Ok(availability::subtract(&windows, &booked))
    }
}
