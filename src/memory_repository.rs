use crate::availability::{parse_clock, parse_date, Interval};
use crate::db_types::{
    Appointment, AppointmentStatus, Assignment, AvailabilityOverride, AvailabilityRule,
    DeliveryStatus, NewNotification, Notification, Nurse, Patient,
};
use crate::error::{AppError, RepoError};
use crate::repository::{Repository, Reservation, ReservationRequest};
use crate::tools::normalize_phone;
use crate::types::{CallSession, ConversationTurn, SessionId, TranscriptRecord};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use time::{Date, OffsetDateTime, Time};
use tracing::{debug, error};

#[derive(Default)]
struct Store {
    next_id: i32,
    patients: Vec<Patient>,
    nurses: Vec<Nurse>,
    assignments: Vec<Assignment>,
    rules: Vec<AvailabilityRule>,
    overrides: Vec<AvailabilityOverride>,
    appointments: Vec<Appointment>,
    notifications: Vec<Notification>,
    calls: HashMap<SessionId, CallSession>,
    turns: HashMap<SessionId, BTreeMap<u64, ConversationTurn>>,
    transcripts: HashMap<SessionId, TranscriptRecord>,
}

impl Store {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process repository. The whole store sits behind one mutex, so a reservation's
/// overlap check and insert happen as one step.
#[derive(Default)]
pub struct MemoryRepository {
    store: Mutex<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> Result<T, RepoError> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| RepoError::Unavailable("memory store poisoned".to_string()))?;
        Ok(f(&mut store))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_patient(&self, name: &str, phone: &str, conditions: &[&str]) -> Patient {
        let mut store = self.lock();
        let patient = Patient {
            id: store.next_id(),
            name: name.to_string(),
            phone: phone.to_string(),
            email: None,
            date_of_birth: None,
            medical_conditions: conditions.iter().map(|c| c.to_string()).collect(),
        };
        store.patients.push(patient.clone());
        patient
    }

    pub fn add_nurse(&self, name: &str, specialization: &str) -> Nurse {
        let mut store = self.lock();
        let nurse = Nurse {
            id: store.next_id(),
            name: name.to_string(),
            specialization: specialization.to_string(),
            phone: None,
            email: None,
            is_active: true,
        };
        store.nurses.push(nurse.clone());
        nurse
    }

    pub fn assign(&self, patient_id: i32, nurse_id: i32, assignment_date: Date) {
        self.lock().assignments.push(Assignment {
            patient_id,
            nurse_id,
            assignment_date,
            is_primary: true,
        });
    }

    pub fn add_rule(&self, rule: AvailabilityRule) {
        self.lock().rules.push(rule);
    }

    pub fn add_override(&self, day_override: AvailabilityOverride) {
        let mut store = self.lock();
        store.overrides.retain(|o| {
            !(o.nurse_id == day_override.nurse_id && o.override_date == day_override.override_date)
        });
        store.overrides.push(day_override);
    }

    /// Insert an appointment as-is, without the overlap check.
    pub fn add_appointment(
        &self,
        patient_id: i32,
        nurse_id: i32,
        date: Date,
        start: Time,
        duration_minutes: i32,
        status: AppointmentStatus,
    ) -> Appointment {
        let mut store = self.lock();
        let appointment = Appointment {
            id: store.next_id(),
            patient_id,
            nurse_id,
            appointment_date: date,
            appointment_time: start,
            duration_minutes,
            status,
            notes: String::new(),
            created_at: OffsetDateTime::now_utc(),
        };
        store.appointments.push(appointment.clone());
        appointment
    }

    #[cfg(test)]
    pub fn appointments(&self) -> Vec<Appointment> {
        self.lock().appointments.clone()
    }

    #[cfg(test)]
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    #[cfg(test)]
    pub fn call(&self, session_id: SessionId) -> Option<CallSession> {
        self.lock().calls.get(&session_id).cloned()
    }

    #[cfg(test)]
    pub fn stored_turns(&self, session_id: SessionId) -> Vec<ConversationTurn> {
        self.lock()
            .turns
            .get(&session_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn transcript(&self, session_id: SessionId) -> Option<TranscriptRecord> {
        self.lock().transcripts.get(&session_id).cloned()
    }

    pub fn load_seed_file(&self, path: &Path) -> Result<(), AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            error!(error=%e, path=%path.display(), "failed to read seed file");
            AppError("failed to read seed file")
        })?;
        let seed: Seed = serde_json::from_str(&raw).map_err(|e| {
            error!(error=%e, "failed to deserialize seed file");
            AppError("failed to deserialize seed file")
        })?;
        self.load_seed(seed)
    }

    fn load_seed(&self, seed: Seed) -> Result<(), AppError> {
        let date = |s: &str| parse_date(s).ok_or(AppError("seed file has an invalid date"));
        let clock = |s: &str| parse_clock(s).ok_or(AppError("seed file has an invalid time"));

        let mut patient_ids = HashMap::new();
        for p in &seed.patients {
            let conditions: Vec<&str> = p.conditions.iter().map(String::as_str).collect();
            patient_ids.insert(p.key.clone(), self.add_patient(&p.name, &p.phone, &conditions).id);
        }
        let mut nurse_ids = HashMap::new();
        for n in &seed.nurses {
            let nurse = self.add_nurse(&n.name, &n.specialization);
            nurse_ids.insert(n.key.clone(), nurse.id);
            for r in &n.weekly {
                self.add_rule(AvailabilityRule {
                    nurse_id: nurse.id,
                    day_of_week: r.day_of_week,
                    start_time: clock(&r.start)?,
                    end_time: clock(&r.end)?,
                });
            }
            for o in &n.overrides {
                self.add_override(AvailabilityOverride {
                    nurse_id: nurse.id,
                    override_date: date(&o.date)?,
                    start_time: o.start.as_deref().map(clock).transpose()?,
                    end_time: o.end.as_deref().map(clock).transpose()?,
                    is_available: o.available,
                });
            }
        }
        let lookup = |ids: &HashMap<String, i32>, key: &str| {
            ids.get(key)
                .copied()
                .ok_or(AppError("seed file references an unknown key"))
        };
        for a in &seed.assignments {
            self.assign(
                lookup(&patient_ids, &a.patient)?,
                lookup(&nurse_ids, &a.nurse)?,
                date(&a.date)?,
            );
        }
        for a in &seed.appointments {
            self.add_appointment(
                lookup(&patient_ids, &a.patient)?,
                lookup(&nurse_ids, &a.nurse)?,
                date(&a.date)?,
                clock(&a.start)?,
                a.duration_minutes,
                AppointmentStatus::Scheduled,
            );
        }
        debug!(
            patients = seed.patients.len(),
            nurses = seed.nurses.len(),
            "loaded seed data"
        );
        Ok(())
    }
}

#[derive(Deserialize)]
struct Seed {
    #[serde(default)]
    patients: Vec<SeedPatient>,
    #[serde(default)]
    nurses: Vec<SeedNurse>,
    #[serde(default)]
    assignments: Vec<SeedAssignment>,
    #[serde(default)]
    appointments: Vec<SeedAppointment>,
}

#[derive(Deserialize)]
struct SeedPatient {
    key: String,
    name: String,
    phone: String,
    #[serde(default)]
    conditions: Vec<String>,
}

#[derive(Deserialize)]
struct SeedNurse {
    key: String,
    name: String,
    specialization: String,
    #[serde(default)]
    weekly: Vec<SeedRule>,
    #[serde(default)]
    overrides: Vec<SeedOverride>,
}

#[derive(Deserialize)]
struct SeedRule {
    day_of_week: i16,
    start: String,
    end: String,
}

#[derive(Deserialize)]
struct SeedOverride {
    date: String,
    start: Option<String>,
    end: Option<String>,
    available: bool,
}

#[derive(Deserialize)]
struct SeedAssignment {
    patient: String,
    nurse: String,
    date: String,
}

#[derive(Deserialize)]
struct SeedAppointment {
    patient: String,
    nurse: String,
    date: String,
    start: String,
    duration_minutes: i32,
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_patient_by_phone(&self, phone: &str) -> Result<Option<Patient>, RepoError> {
        let wanted = normalize_phone(phone);
        self.with_store(|s| {
            s.patients
                .iter()
                .find(|p| normalize_phone(&p.phone) == wanted)
                .cloned()
        })
    }

    async fn find_assigned_nurse(
        &self,
        patient_id: i32,
        on: Date,
    ) -> Result<Option<Nurse>, RepoError> {
        self.with_store(|s| {
            let assignment = s
                .assignments
                .iter()
                .filter(|a| a.patient_id == patient_id && a.assignment_date <= on)
                .max_by_key(|a| (a.is_primary, a.assignment_date))?;
            s.nurses
                .iter()
                .find(|n| n.id == assignment.nurse_id && n.is_active)
                .cloned()
        })
    }

    async fn find_nurse(&self, nurse_id: i32) -> Result<Option<Nurse>, RepoError> {
        self.with_store(|s| s.nurses.iter().find(|n| n.id == nurse_id).cloned())
    }

    async fn availability_rules(&self, nurse_id: i32) -> Result<Vec<AvailabilityRule>, RepoError> {
        self.with_store(|s| {
            s.rules
                .iter()
                .filter(|r| r.nurse_id == nurse_id)
                .cloned()
                .collect()
        })
    }

    async fn availability_override(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Option<AvailabilityOverride>, RepoError> {
        self.with_store(|s| {
            s.overrides
                .iter()
                .find(|o| o.nurse_id == nurse_id && o.override_date == date)
                .cloned()
        })
    }

    async fn booked_appointments(
        &self,
        nurse_id: i32,
        date: Date,
    ) -> Result<Vec<Appointment>, RepoError> {
        self.with_store(|s| {
            s.appointments
                .iter()
                .filter(|a| {
                    a.nurse_id == nurse_id && a.appointment_date == date && a.status.blocks_time()
                })
                .cloned()
                .collect()
        })
    }

    async fn reserve_appointment(
        &self,
        request: &ReservationRequest,
    ) -> Result<Reservation, RepoError> {
        let wanted = request
            .window()
            .ok_or_else(|| RepoError::Query("reservation window runs past midnight".into()))?;
        self.with_store(|s| {
            if let Some(existing) = s.appointments.iter().find(|a| request.matches(a)) {
                debug!(appointment_id = existing.id, "reservation already written");
                return Reservation::Reserved(existing.clone());
            }
            let clash = s
                .appointments
                .iter()
                .filter(|a| {
                    a.nurse_id == request.nurse_id
                        && a.appointment_date == request.date
                        && a.status.blocks_time()
                })
                .filter_map(Interval::of_appointment)
                .find(|existing| existing.overlaps(&wanted));
            if let Some(clash) = clash {
                return Reservation::Conflict(clash);
            }
            let appointment = Appointment {
                id: s.next_id(),
                patient_id: request.patient_id,
                nurse_id: request.nurse_id,
                appointment_date: request.date,
                appointment_time: request.start,
                duration_minutes: i32::from(request.duration_minutes),
                status: AppointmentStatus::Scheduled,
                notes: request.notes.clone(),
                created_at: OffsetDateTime::now_utc(),
            };
            s.appointments.push(appointment.clone());
            Reservation::Reserved(appointment)
        })
    }

    async fn enqueue_notifications(
        &self,
        notifications: &[NewNotification],
    ) -> Result<Vec<Notification>, RepoError> {
        self.with_store(|s| {
            notifications
                .iter()
                .map(|n| {
                    let row = Notification {
                        id: s.next_id(),
                        recipient_kind: n.recipient_kind,
                        recipient_id: n.recipient_id,
                        appointment_id: n.appointment_id,
                        kind: n.kind,
                        message: n.message.clone(),
                        delivery_status: DeliveryStatus::Pending,
                        created_at: OffsetDateTime::now_utc(),
                    };
                    s.notifications.push(row.clone());
                    row
                })
                .collect()
        })
    }

    async fn record_call_started(&self, session: &CallSession) -> Result<(), RepoError> {
        self.with_store(|s| {
            s.calls.insert(session.id, session.clone());
        })
    }

    async fn record_call_ended(&self, session: &CallSession) -> Result<(), RepoError> {
        self.with_store(|s| {
            s.calls.insert(session.id, session.clone());
        })
    }

    async fn append_turns(
        &self,
        session_id: SessionId,
        turns: &[ConversationTurn],
    ) -> Result<(), RepoError> {
        self.with_store(|s| {
            let stored = s.turns.entry(session_id).or_default();
            for turn in turns {
                stored.entry(turn.seq).or_insert_with(|| turn.clone());
            }
        })
    }

    async fn save_transcript(&self, record: &TranscriptRecord) -> Result<(), RepoError> {
        self.with_store(|s| {
            s.transcripts.insert(record.session_id, record.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::macros::{date, time};

    fn request(nurse_id: i32, start: Time, duration_minutes: u16) -> ReservationRequest {
        ReservationRequest {
            patient_id: 1,
            nurse_id,
            date: date!(2025 - 03 - 10),
            start,
            duration_minutes,
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn reservation_rejects_overlap_and_reports_the_clash() {
        let repo = MemoryRepository::new();
        let nurse = repo.add_nurse("Nia", "Cardiology");
        repo.add_appointment(
            1,
            nurse.id,
            date!(2025 - 03 - 10),
            time!(10:00),
            30,
            AppointmentStatus::Scheduled,
        );

        let res = repo
            .reserve_appointment(&request(nurse.id, time!(10:15), 30))
            .await
            .unwrap();
        assert_eq!(res, Reservation::Conflict(Interval::new(600, 630).unwrap()));

        let res = repo
            .reserve_appointment(&request(nurse.id, time!(10:30), 30))
            .await
            .unwrap();
        assert!(matches!(res, Reservation::Reserved(_)));
        assert_eq!(repo.appointments().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_appointments_do_not_block() {
        let repo = MemoryRepository::new();
        let nurse = repo.add_nurse("Nia", "Cardiology");
        repo.add_appointment(
            1,
            nurse.id,
            date!(2025 - 03 - 10),
            time!(10:00),
            30,
            AppointmentStatus::Cancelled,
        );
        let res = repo
            .reserve_appointment(&request(nurse.id, time!(10:00), 30))
            .await
            .unwrap();
        assert!(matches!(res, Reservation::Reserved(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overlapping_reservations_admit_exactly_one() {
        let repo = Arc::new(MemoryRepository::new());
        let nurse_id = repo.add_nurse("Nia", "Cardiology").id;
        // every window covers 11:10-11:20, so only one can win
        let starts = [
            time!(11:00),
            time!(11:00),
            time!(11:00),
            time!(10:50),
            time!(11:05),
            time!(11:10),
        ];
        let handles: Vec<_> = starts
            .into_iter()
            .enumerate()
            .map(|(i, start)| {
                let repo = repo.clone();
                let mut request = request(nurse_id, start, 30);
                request.patient_id = i as i32 + 1;
                tokio::spawn(async move { repo.reserve_appointment(&request).await })
            })
            .collect();
        let mut reserved = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap().unwrap() {
                Reservation::Reserved(_) => reserved += 1,
                Reservation::Conflict(_) => conflicts += 1,
            }
        }
        assert_eq!(reserved, 1);
        assert_eq!(conflicts, starts.len() - 1);
        assert_eq!(repo.appointments().len(), 1);
    }

    #[tokio::test]
    async fn repeated_reservation_returns_the_existing_row() {
        let repo = MemoryRepository::new();
        let nurse = repo.add_nurse("Nia", "Cardiology");
        let first = repo
            .reserve_appointment(&request(nurse.id, time!(14:00), 30))
            .await
            .unwrap();
        let again = repo
            .reserve_appointment(&request(nurse.id, time!(14:00), 30))
            .await
            .unwrap();
        assert!(matches!(first, Reservation::Reserved(_)));
        assert_eq!(first, again);
        assert_eq!(repo.appointments().len(), 1);

        let mut other_patient = request(nurse.id, time!(14:00), 30);
        other_patient.patient_id = 2;
        let res = repo.reserve_appointment(&other_patient).await.unwrap();
        assert_eq!(res, Reservation::Conflict(Interval::new(840, 870).unwrap()));
    }

    #[tokio::test]
    async fn assigned_nurse_prefers_latest_primary_assignment() {
        let repo = MemoryRepository::new();
        let patient = repo.add_patient("Pat", "+15551234567", &["diabetes"]);
        let old = repo.add_nurse("Old", "General");
        let new = repo.add_nurse("New", "Cardiology");
        repo.assign(patient.id, old.id, date!(2025 - 01 - 01));
        repo.assign(patient.id, new.id, date!(2025 - 02 - 01));
        repo.assign(patient.id, old.id, date!(2025 - 04 - 01));

        let nurse = repo
            .find_assigned_nurse(patient.id, date!(2025 - 03 - 10))
            .await
            .unwrap();
        assert_eq!(nurse.map(|n| n.id), Some(new.id));
    }

    #[tokio::test]
    async fn phone_lookup_ignores_formatting() {
        let repo = MemoryRepository::new();
        let patient = repo.add_patient("Pat", "+1 (555) 123-4567", &[]);
        for spelling in ["+15551234567", "15551234567", "(555) 123-4567"] {
            let found = repo.find_patient_by_phone(spelling).await.unwrap();
            assert_eq!(found.map(|p| p.id), Some(patient.id), "{spelling}");
        }
        assert!(repo.find_patient_by_phone("+15550000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seed_file_contents_load() {
        let raw = r#"{
            "patients": [{"key": "p1", "name": "Pat", "phone": "+15551234567", "conditions": ["asthma"]}],
            "nurses": [{
                "key": "n3", "name": "Nia", "specialization": "Respiratory",
                "weekly": [{"day_of_week": 0, "start": "09:00", "end": "17:00"}],
                "overrides": [{"date": "2025-03-11", "available": false}]
            }],
            "assignments": [{"patient": "p1", "nurse": "n3", "date": "2025-01-01"}],
            "appointments": [{"patient": "p1", "nurse": "n3", "date": "2025-03-10", "start": "10:00", "duration_minutes": 30}]
        }"#;
        let repo = MemoryRepository::new();
        repo.load_seed(serde_json::from_str(raw).unwrap()).unwrap();

        let patient = repo.find_patient_by_phone("+15551234567").await.unwrap().unwrap();
        let nurse = repo
            .find_assigned_nurse(patient.id, date!(2025 - 03 - 10))
            .await
            .unwrap()
            .unwrap();
        let slots = repo
            .get_available_slots(nurse.id, date!(2025 - 03 - 10))
            .await
            .unwrap();
        assert_eq!(
            slots,
            vec![Interval::new(540, 600).unwrap(), Interval::new(630, 1020).unwrap()]
        );
        assert!(repo
            .availability_override(nurse.id, date!(2025 - 03 - 11))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn seed_with_unknown_reference_fails() {
        let raw = r#"{"assignments": [{"patient": "nobody", "nurse": "n1", "date": "2025-01-01"}]}"#;
        let repo = MemoryRepository::new();
        assert!(repo.load_seed(serde_json::from_str(raw).unwrap()).is_err());
    }
}
