use sqlx::types::time::{Date, OffsetDateTime, Time};
use time::Weekday;

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Patient {
    pub id: i32,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub date_of_birth: Option<Date>,
    pub medical_conditions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Nurse {
    pub id: i32,
    pub name: String,
    pub specialization: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Assignment {
    pub patient_id: i32,
    pub nurse_id: i32,
    pub assignment_date: Date,
    pub is_primary: bool,
}

/// Recurring weekly availability. `day_of_week` counts from Monday = 0.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct AvailabilityRule {
    pub nurse_id: i32,
    pub day_of_week: i16,
    pub start_time: Time,
    pub end_time: Time,
}

impl AvailabilityRule {
    pub fn applies_on(&self, weekday: Weekday) -> bool {
        self.day_of_week == weekday.number_days_from_monday() as i16
    }
}

/// Date-specific availability. An override without a window but marked available defers to
/// the recurring rules for that day; an unavailable override blanks the day.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct AvailabilityOverride {
    pub nurse_id: i32,
    pub override_date: Date,
    pub start_time: Option<Time>,
    pub end_time: Option<Time>,
    pub is_available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "appointment_status", rename_all = "lowercase")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn blocks_time(self) -> bool {
        self != AppointmentStatus::Cancelled
    }
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Appointment {
    pub id: i32,
    pub patient_id: i32,
    pub nurse_id: i32,
    pub appointment_date: Date,
    pub appointment_time: Time,
    pub duration_minutes: i32,
    pub status: AppointmentStatus,
    pub notes: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum RecipientKind {
    Patient,
    Nurse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationKind {
    AppointmentConfirmed,
    AppointmentAssigned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// A notification the workflow wants delivered; dispatch belongs to another service.
#[derive(Clone, Debug, PartialEq)]
pub struct NewNotification {
    pub recipient_kind: RecipientKind,
    pub recipient_id: i32,
    pub appointment_id: i32,
    pub kind: NotificationKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Notification {
    pub id: i32,
    pub recipient_kind: RecipientKind,
    pub recipient_id: i32,
    pub appointment_id: i32,
    pub kind: NotificationKind,
    pub message: String,
    pub delivery_status: DeliveryStatus,
    pub created_at: OffsetDateTime,
}
