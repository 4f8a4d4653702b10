//! Per-call scheduling state machine.
//!
//! One `SchedulingWorkflow` exists per session and is only ever driven by tool calls, one at
//! a time, from the actor loop in [`run_workflow`]. Repository calls are bounded by the
//! session's tool timeout; a failed call leaves the state exactly as it was before the tool
//! call started. Reservation writes are the exception to cancellation: they run on their own
//! task, and a write that outlives its tool call is reconciled by a later call or at close.

use crate::availability::{self, format_date, Interval};
use crate::config::SessionConfig;
use crate::db_types::{
    Appointment, NewNotification, NotificationKind, Nurse, Patient, RecipientKind,
};
use crate::error::{RepoError, ToolError};
use crate::repository::{Repository, Reservation, ReservationRequest};
use crate::tools::{
    SlotView, ToolCall, ToolResult, CONFIRM_APPOINTMENT, DECLINE_ALTERNATIVES, GET_ASSIGNED_NURSE,
    IDENTIFY_PATIENT, REQUEST_APPOINTMENT_TIME,
};
use crate::types::Outcome;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::{Date, Time};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowState {
    AwaitingIdentity,
    AwaitingNursePreference,
    AwaitingTimePreference,
    CheckingAvailability,
    OfferingAlternatives,
    ReadyToConfirm,
    Scheduled,
    Unresolvable,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::AwaitingIdentity => "awaiting_identity",
            WorkflowState::AwaitingNursePreference => "awaiting_nurse_preference",
            WorkflowState::AwaitingTimePreference => "awaiting_time_preference",
            WorkflowState::CheckingAvailability => "checking_availability",
            WorkflowState::OfferingAlternatives => "offering_alternatives",
            WorkflowState::ReadyToConfirm => "ready_to_confirm",
            WorkflowState::Scheduled => "scheduled",
            WorkflowState::Unresolvable => "unresolvable",
        }
    }

    /// States in which a concrete time can be proposed or booked.
    fn accepts_time(self) -> bool {
        matches!(
            self,
            WorkflowState::AwaitingTimePreference
                | WorkflowState::OfferingAlternatives
                | WorkflowState::ReadyToConfirm
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnresolvedReason {
    PatientNotFound,
    NoAssignedNurse,
    AlternativesDeclined,
    SessionClosed,
}

impl UnresolvedReason {
    fn describe(self) -> &'static str {
        match self {
            UnresolvedReason::PatientNotFound => "caller could not be matched to a patient",
            UnresolvedReason::NoAssignedNurse => "patient has no assigned nurse",
            UnresolvedReason::AlternativesDeclined => "patient declined the offered times",
            UnresolvedReason::SessionClosed => "call ended before an appointment was booked",
        }
    }
}

/// Side effects the bridge has to carry out after delivering a tool result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    Hangup,
    CloseBackendUnavailable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub result: ToolResult,
    pub directive: Option<Directive>,
}

/// What the rest of the session needs to know about the workflow, published after every
/// tool call.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowSnapshot {
    pub state: WorkflowState,
    pub patient_id: Option<i32>,
    pub nurse_id: Option<i32>,
    pub appointment_id: Option<i32>,
    pub unresolved: Option<UnresolvedReason>,
    pub summary: Option<String>,
}

impl WorkflowSnapshot {
    /// Final form at session close: anything not terminal becomes `Unresolvable`.
    pub fn close(mut self) -> (Self, Outcome) {
        let outcome = match self.state {
            WorkflowState::Scheduled => Outcome::Scheduled,
            WorkflowState::Unresolvable => Outcome::Unresolved,
            _ => {
                self.state = WorkflowState::Unresolvable;
                self.unresolved = Some(UnresolvedReason::SessionClosed);
                Outcome::Abandoned
            }
        };
        if self.summary.is_none() {
            self.summary = self.unresolved.map(|r| r.describe().to_string());
        }
        (self, outcome)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RequestedSlot {
    date: Date,
    window: Interval,
}

#[derive(Clone)]
struct Checkpoint {
    state: WorkflowState,
    requested: Option<RequestedSlot>,
    alternatives: Vec<Interval>,
}

enum Check {
    Free,
    Taken(Vec<Interval>),
}

/// A reservation write still running after its tool call timed out.
struct PendingReservation {
    request: ReservationRequest,
    task: JoinHandle<Result<Reservation, RepoError>>,
}

fn joined(res: Result<Result<Reservation, RepoError>, JoinError>) -> Result<Reservation, ToolError> {
    match res {
        Ok(res) => res.map_err(ToolError::from),
        Err(e) => Err(ToolError::Backend(RepoError::Unavailable(format!(
            "reservation task failed: {e}"
        )))),
    }
}

pub struct SchedulingWorkflow {
    repo: Arc<dyn Repository>,
    config: SessionConfig,
    caller_phone: String,
    today: Date,
    state: WorkflowState,
    patient: Option<Patient>,
    nurse: Option<Nurse>,
    requested: Option<RequestedSlot>,
    alternatives: Vec<Interval>,
    appointment: Option<Appointment>,
    unresolved: Option<UnresolvedReason>,
    consecutive_failures: u32,
    pending: Option<PendingReservation>,
}

impl SchedulingWorkflow {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: SessionConfig,
        caller_phone: String,
        today: Date,
    ) -> Self {
        Self {
            repo,
            config,
            caller_phone,
            today,
            state: WorkflowState::AwaitingIdentity,
            patient: None,
            nurse: None,
            requested: None,
            alternatives: vec![],
            appointment: None,
            unresolved: None,
            consecutive_failures: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            state: self.state,
            patient_id: self.patient.as_ref().map(|p| p.id),
            nurse_id: self.nurse.as_ref().map(|n| n.id),
            appointment_id: self.appointment.as_ref().map(|a| a.id),
            unresolved: self.unresolved,
            summary: self.summary(),
        }
    }

    fn summary(&self) -> Option<String> {
        if let Some(a) = &self.appointment {
            let nurse = self.nurse.as_ref().map(|n| n.name.as_str()).unwrap_or("nurse");
            let window = Interval::of_appointment(a)
                .map(|w| w.to_string())
                .unwrap_or_default();
            return Some(format!(
                "Appointment #{} with {} on {} {} ({} min)",
                a.id,
                nurse,
                format_date(a.appointment_date),
                window,
                a.duration_minutes
            ));
        }
        self.unresolved.map(|r| r.describe().to_string())
    }

    fn transition(&mut self, next: WorkflowState) {
        if self.state != next {
            debug!(from=%self.state, to=%next, "workflow transition");
            self.state = next;
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state,
            requested: self.requested,
            alternatives: self.alternatives.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        if self.state != checkpoint.state {
            debug!(from=%self.state, to=%checkpoint.state, "workflow rolled back");
        }
        self.state = checkpoint.state;
        self.requested = checkpoint.requested;
        self.alternatives = checkpoint.alternatives;
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RepoError>>,
    ) -> Result<T, ToolError> {
        match tokio::time::timeout(self.config.tool_timeout, call).await {
            Ok(res) => res.map_err(ToolError::from),
            Err(_) => Err(ToolError::Backend(RepoError::Timeout)),
        }
    }

    /// Parse and run one tool call from the AI.
    pub async fn invoke(&mut self, name: &str, arguments: &str) -> ToolOutcome {
        match ToolCall::parse(name, arguments) {
            Ok(call) => self.handle(call).await,
            Err(e) => {
                warn!(tool = name, error=%e, "rejected tool call");
                ToolOutcome {
                    result: ToolResult::error(&e),
                    directive: None,
                }
            }
        }
    }

    pub async fn handle(&mut self, call: ToolCall) -> ToolOutcome {
        self.settle(Duration::ZERO).await;
        let tool = call.name();
        let checkpoint = self.checkpoint();
        let mut directive = None;
        let res = match call {
            ToolCall::IdentifyPatient { phone } => self.identify_patient(phone).await,
            ToolCall::GetAssignedNurse { patient_id } => self.get_assigned_nurse(patient_id).await,
            ToolCall::GetAvailableSlots { nurse_id, date } => {
                self.get_available_slots(nurse_id, date).await
            }
            ToolCall::RequestAppointmentTime {
                date,
                start,
                duration_minutes,
            } => self.request_appointment_time(date, start, duration_minutes).await,
            ToolCall::ConfirmAppointment {
                patient_id,
                nurse_id,
                date,
                start,
                duration_minutes,
            } => {
                self.confirm_appointment(patient_id, nurse_id, date, start, duration_minutes)
                    .await
            }
            ToolCall::DeclineAlternatives => self.decline_alternatives(),
            ToolCall::EndCall { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "assistant is ending the call");
                directive = Some(Directive::Hangup);
                Ok(ToolResult::Ending)
            }
        };

        let result = match res {
            Ok(result) => {
                self.consecutive_failures = 0;
                result
            }
            Err(e) => {
                self.restore(checkpoint);
                if e.is_retryable() {
                    self.consecutive_failures += 1;
                    warn!(
                        tool,
                        error=%e,
                        failures = self.consecutive_failures,
                        "tool call failed on the backend"
                    );
                    if self.consecutive_failures >= self.config.max_backend_failures {
                        directive = Some(Directive::CloseBackendUnavailable);
                    }
                } else {
                    debug!(tool, error=%e, "tool call rejected");
                }
                ToolResult::error(&e)
            }
        };
        ToolOutcome { result, directive }
    }

    async fn identify_patient(&mut self, phone: Option<String>) -> Result<ToolResult, ToolError> {
        if let Some(p) = &self.patient {
            return Ok(patient_result(p));
        }
        self.require(IDENTIFY_PATIENT, |s| {
            s == WorkflowState::AwaitingIdentity
        })?;
        let phone = phone.unwrap_or_else(|| self.caller_phone.clone());
        if phone.trim().is_empty() {
            return Err(ToolError::Validation("no phone number to look up".into()));
        }

        match self.bounded(self.repo.find_patient_by_phone(&phone)).await? {
            Some(patient) => {
                info!(patient_id = patient.id, "patient identified");
                let result = patient_result(&patient);
                self.patient = Some(patient);
                self.transition(WorkflowState::AwaitingNursePreference);
                Ok(result)
            }
            None => {
                info!("no patient matches caller phone");
                self.unresolve(UnresolvedReason::PatientNotFound);
                Ok(ToolResult::NotFound {
                    what: "patient",
                    message: "No patient is registered with this phone number.".into(),
                })
            }
        }
    }

    async fn get_assigned_nurse(&mut self, patient_id: i32) -> Result<ToolResult, ToolError> {
        if let Some(n) = &self.nurse {
            if self.patient.as_ref().map(|p| p.id) == Some(patient_id) {
                return Ok(nurse_result(n));
            }
        }
        self.require(GET_ASSIGNED_NURSE, |s| {
            s == WorkflowState::AwaitingNursePreference
        })?;
        self.check_patient(patient_id)?;

        match self
            .bounded(self.repo.find_assigned_nurse(patient_id, self.today))
            .await?
        {
            Some(nurse) => {
                info!(patient_id, nurse_id = nurse.id, "assigned nurse found");
                let result = nurse_result(&nurse);
                self.nurse = Some(nurse);
                self.transition(WorkflowState::AwaitingTimePreference);
                Ok(result)
            }
            None => {
                info!(patient_id, "patient has no assigned nurse");
                self.unresolve(UnresolvedReason::NoAssignedNurse);
                Ok(ToolResult::NotFound {
                    what: "nurse",
                    message: "No nurse is currently assigned to this patient.".into(),
                })
            }
        }
    }

    /// Read-only, allowed in any state.
    async fn get_available_slots(
        &mut self,
        nurse_id: i32,
        date: Date,
    ) -> Result<ToolResult, ToolError> {
        if self.nurse.as_ref().map(|n| n.id) != Some(nurse_id) {
            match self.bounded(self.repo.find_nurse(nurse_id)).await? {
                Some(nurse) if nurse.is_active => {}
                _ => {
                    debug!(nurse_id, "slots requested for unknown or inactive nurse");
                    return Ok(ToolResult::NotFound {
                        what: "nurse",
                        message: "No active nurse has that id.".into(),
                    });
                }
            }
        }
        let free = self.bounded(self.repo.get_available_slots(nurse_id, date)).await?;
        Ok(ToolResult::slots(nurse_id, date, &free))
    }

    async fn request_appointment_time(
        &mut self,
        date: Date,
        start: Time,
        duration: Option<u16>,
    ) -> Result<ToolResult, ToolError> {
        self.require(REQUEST_APPOINTMENT_TIME, WorkflowState::accepts_time)?;
        let nurse_id = self.nurse_id()?;
        let window = self.window(start, duration)?;

        match self.check(nurse_id, date, window).await? {
            Check::Free => Ok(ToolResult::Available {
                date: format_date(date),
                slot: window.into(),
            }),
            Check::Taken(alternatives) => Ok(ToolResult::conflict(date, window, &alternatives)),
        }
    }

    async fn confirm_appointment(
        &mut self,
        patient_id: i32,
        nurse_id: i32,
        date: Date,
        start: Time,
        duration: Option<u16>,
    ) -> Result<ToolResult, ToolError> {
        let window = self.window(start, duration)?;
        let wanted = RequestedSlot { date, window };
        if let Some(a) = &self.appointment {
            if a.appointment_date == date && Interval::of_appointment(a) == Some(window) {
                return Ok(self.confirmed_result(a));
            }
        }
        self.require(CONFIRM_APPOINTMENT, WorkflowState::accepts_time)?;
        self.check_patient(patient_id)?;
        if self.nurse_id()? != nurse_id {
            return Err(ToolError::Validation(
                "nurse_id does not match the patient's assigned nurse".into(),
            ));
        }
        if let Some(pending) = self.pending.take() {
            if let Some(appointment) = self.reconcile(pending).await? {
                return Ok(self.book(appointment).await);
            }
        }

        let already_checked =
            self.state == WorkflowState::ReadyToConfirm && self.requested == Some(wanted);
        if !already_checked {
            if let Check::Taken(alternatives) = self.check(nurse_id, date, window).await? {
                return Ok(ToolResult::conflict(date, window, &alternatives));
            }
        }

        let request = ReservationRequest {
            patient_id,
            nurse_id,
            date,
            start,
            duration_minutes: window.minutes(),
            notes: "Booked by phone assistant".to_string(),
        };
        match self.reserve(request).await? {
            Reservation::Reserved(appointment) => Ok(self.book(appointment).await),
            Reservation::Conflict(clash) => {
                info!(nurse_id, requested=%window, clash=%clash, "reservation lost a race");
                self.transition(WorkflowState::CheckingAvailability);
                let alternatives = self.alternatives_for(nurse_id, date, window).await?;
                self.offer(wanted, alternatives.clone());
                Ok(ToolResult::conflict(date, window, &alternatives))
            }
        }
    }

    /// Start the write on its own task and wait for it up to the tool timeout. A write that
    /// is still running then is kept as pending instead of being cancelled.
    async fn reserve(&mut self, request: ReservationRequest) -> Result<Reservation, ToolError> {
        let repo = self.repo.clone();
        let write = request.clone();
        let task = tokio::spawn(async move { repo.reserve_appointment(&write).await });
        self.await_reservation(PendingReservation { request, task }).await
    }

    async fn await_reservation(
        &mut self,
        mut pending: PendingReservation,
    ) -> Result<Reservation, ToolError> {
        let waited = tokio::time::timeout(self.config.tool_timeout, &mut pending.task).await;
        match waited {
            Ok(res) => joined(res),
            Err(_) => {
                warn!(
                    nurse_id = pending.request.nurse_id,
                    date=%format_date(pending.request.date),
                    "reservation outlived the tool timeout"
                );
                self.pending = Some(pending);
                Err(ToolError::Backend(RepoError::Timeout))
            }
        }
    }

    /// Resolve a reservation left over from an earlier confirmation. Returns the appointment
    /// when that write went through.
    async fn reconcile(
        &mut self,
        pending: PendingReservation,
    ) -> Result<Option<Appointment>, ToolError> {
        let res = if pending.task.is_finished() {
            joined(pending.task.await)
        } else {
            let request = &pending.request;
            let committed = match self
                .bounded(self.repo.booked_appointments(request.nurse_id, request.date))
                .await
            {
                Ok(booked) => booked.into_iter().find(|a| request.matches(a)),
                Err(e) => {
                    self.pending = Some(pending);
                    return Err(e);
                }
            };
            if committed.is_some() {
                return Ok(committed);
            }
            match self.await_reservation(pending).await {
                Err(e) if self.pending.is_some() => return Err(e),
                res => res,
            }
        };
        match res {
            Ok(Reservation::Reserved(appointment)) => Ok(Some(appointment)),
            Ok(Reservation::Conflict(clash)) => {
                debug!(clash=%clash, "earlier reservation did not go through");
                Ok(None)
            }
            Err(e) => {
                warn!(error=%e, "earlier reservation failed");
                Ok(None)
            }
        }
    }

    /// Adopt a reservation that finished after its tool call gave up, waiting at most `wait`.
    async fn settle(&mut self, wait: Duration) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        let waited = tokio::time::timeout(wait, &mut pending.task).await;
        let res = match waited {
            Ok(res) => joined(res),
            Err(_) => {
                self.pending = Some(pending);
                return;
            }
        };
        match res {
            Ok(Reservation::Reserved(appointment)) => {
                let current = self.appointment.as_ref().map(|a| a.id);
                if current.map_or(false, |id| id != appointment.id) {
                    warn!(
                        appointment_id = appointment.id,
                        current = ?current,
                        "late reservation after another booking"
                    );
                } else {
                    self.book(appointment).await;
                }
            }
            Ok(Reservation::Conflict(clash)) => {
                debug!(clash=%clash, "late reservation did not go through")
            }
            Err(e) => warn!(error=%e, "late reservation failed"),
        }
    }

    /// Record a written appointment: move to `Scheduled` and queue the notifications once.
    async fn book(&mut self, appointment: Appointment) -> ToolResult {
        if let Some(current) = &self.appointment {
            if current.id == appointment.id {
                return self.confirmed_result(current);
            }
        }
        let start = availability::minute_of_day(appointment.appointment_time);
        info!(
            appointment_id = appointment.id,
            nurse_id = appointment.nurse_id,
            date=%format_date(appointment.appointment_date),
            start=%availability::format_minute(start),
            "appointment reserved"
        );
        self.requested = None;
        self.alternatives.clear();
        self.transition(WorkflowState::Scheduled);
        self.notify(&appointment).await;
        let result = self.confirmed_result(&appointment);
        self.appointment = Some(appointment);
        result
    }

    fn decline_alternatives(&mut self) -> Result<ToolResult, ToolError> {
        self.require(DECLINE_ALTERNATIVES, |s| {
            s == WorkflowState::OfferingAlternatives
        })?;
        self.unresolve(UnresolvedReason::AlternativesDeclined);
        Ok(ToolResult::Declined)
    }

    /// Walk `CheckingAvailability` for one window and land in `ReadyToConfirm` or
    /// `OfferingAlternatives`.
    async fn check(&mut self, nurse_id: i32, date: Date, window: Interval) -> Result<Check, ToolError> {
        self.transition(WorkflowState::CheckingAvailability);
        let free = self.bounded(self.repo.get_available_slots(nurse_id, date)).await?;
        let wanted = RequestedSlot { date, window };
        if availability::fits(&free, &window) {
            self.requested = Some(wanted);
            self.alternatives.clear();
            self.transition(WorkflowState::ReadyToConfirm);
            return Ok(Check::Free);
        }
        let alternatives = self.nearest(&free, window);
        debug!(requested=%window, offered = alternatives.len(), "requested time is taken");
        self.offer(wanted, alternatives.clone());
        Ok(Check::Taken(alternatives))
    }

    async fn alternatives_for(
        &self,
        nurse_id: i32,
        date: Date,
        window: Interval,
    ) -> Result<Vec<Interval>, ToolError> {
        let free = self.bounded(self.repo.get_available_slots(nurse_id, date)).await?;
        Ok(self.nearest(&free, window))
    }

    fn nearest(&self, free: &[Interval], window: Interval) -> Vec<Interval> {
        availability::nearest_alternatives(
            free,
            &window,
            window.minutes(),
            self.config.slot_step_minutes,
            self.config.alternatives_limit,
        )
    }

    fn offer(&mut self, requested: RequestedSlot, alternatives: Vec<Interval>) {
        self.requested = Some(requested);
        self.alternatives = alternatives;
        self.transition(WorkflowState::OfferingAlternatives);
    }

    fn unresolve(&mut self, reason: UnresolvedReason) {
        self.unresolved = Some(reason);
        self.transition(WorkflowState::Unresolvable);
    }

    async fn notify(&self, appointment: &Appointment) {
        let (Some(patient), Some(nurse)) = (&self.patient, &self.nurse) else {
            return;
        };
        let when = format!(
            "{} at {}",
            format_date(appointment.appointment_date),
            availability::format_minute(availability::minute_of_day(appointment.appointment_time))
        );
        let notifications = [
            NewNotification {
                recipient_kind: RecipientKind::Patient,
                recipient_id: patient.id,
                appointment_id: appointment.id,
                kind: NotificationKind::AppointmentConfirmed,
                message: format!("Your appointment with {} is confirmed for {when}.", nurse.name),
            },
            NewNotification {
                recipient_kind: RecipientKind::Nurse,
                recipient_id: nurse.id,
                appointment_id: appointment.id,
                kind: NotificationKind::AppointmentAssigned,
                message: format!("New appointment with {} on {when}.", patient.name),
            },
        ];
        if let Err(e) = self.bounded(self.repo.enqueue_notifications(&notifications)).await {
            warn!(appointment_id = appointment.id, error=%e, "failed to enqueue notifications");
        }
    }

    fn confirmed_result(&self, appointment: &Appointment) -> ToolResult {
        let slot = Interval::of_appointment(appointment)
            .map(Into::into)
            .unwrap_or_else(|| SlotView {
                start: String::new(),
                end: String::new(),
            });
        ToolResult::Confirmed {
            appointment_id: appointment.id,
            nurse_name: self.nurse.as_ref().map(|n| n.name.clone()).unwrap_or_default(),
            date: format_date(appointment.appointment_date),
            slot,
        }
    }

    fn require(
        &self,
        tool: &'static str,
        allowed: impl Fn(WorkflowState) -> bool,
    ) -> Result<(), ToolError> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(ToolError::InvalidState {
                tool,
                state: self.state.as_str(),
            })
        }
    }

    fn check_patient(&self, patient_id: i32) -> Result<(), ToolError> {
        match &self.patient {
            Some(p) if p.id == patient_id => Ok(()),
            Some(_) => Err(ToolError::Validation(
                "patient_id does not match the identified caller".into(),
            )),
            None => Err(ToolError::Validation("the caller has not been identified".into())),
        }
    }

    fn nurse_id(&self) -> Result<i32, ToolError> {
        self.nurse
            .as_ref()
            .map(|n| n.id)
            .ok_or_else(|| ToolError::Validation("no nurse has been assigned yet".into()))
    }

    fn window(&self, start: Time, duration: Option<u16>) -> Result<Interval, ToolError> {
        let minutes = duration.unwrap_or(self.config.default_duration_minutes);
        Interval::starting_at(start, minutes)
            .ok_or_else(|| ToolError::Validation("appointment would run past midnight".into()))
    }
}

fn patient_result(p: &Patient) -> ToolResult {
    ToolResult::PatientIdentified {
        patient_id: p.id,
        name: p.name.clone(),
        conditions: p.medical_conditions.clone(),
    }
}

fn nurse_result(n: &Nurse) -> ToolResult {
    ToolResult::NurseAssigned {
        nurse_id: n.id,
        name: n.name.clone(),
        specialization: n.specialization.clone(),
    }
}

/// A tool call handed to the workflow actor.
pub struct ToolInvocation {
    pub name: String,
    pub arguments: String,
    pub reply: oneshot::Sender<ToolOutcome>,
}

/// Run tool calls against `workflow` in arrival order until every sender is gone,
/// publishing a snapshot after each one.
pub async fn run_workflow(
    mut workflow: SchedulingWorkflow,
    mut invocations: mpsc::Receiver<ToolInvocation>,
    snapshots: watch::Sender<WorkflowSnapshot>,
) {
    while let Some(invocation) = invocations.recv().await {
        let outcome = workflow.invoke(&invocation.name, &invocation.arguments).await;
        snapshots.send_replace(workflow.snapshot());
        if invocation.reply.send(outcome).is_err() {
            debug!(tool=%invocation.name, "tool caller went away before the result");
        }
    }
    let wait = workflow.config.tool_timeout;
    workflow.settle(wait).await;
    if workflow.pending.is_some() {
        warn!("reservation still running when the workflow finished");
    }
    snapshots.send_replace(workflow.snapshot());
    debug!(state=%workflow.state(), "workflow actor finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scenario, FlakyRepository, Scenario, SCENARIO_DATE};
    use serde_json::Value;
    use std::time::Duration;

    fn workflow(repo: Arc<dyn Repository>) -> SchedulingWorkflow {
        SchedulingWorkflow::new(
            repo,
            SessionConfig::default(),
            "+15551234567".to_string(),
            SCENARIO_DATE,
        )
    }

    fn json(outcome: &ToolOutcome) -> Value {
        serde_json::from_str(&outcome.result.to_json()).unwrap()
    }

    async fn identified(s: &Scenario, wf: &mut SchedulingWorkflow) {
        wf.invoke(IDENTIFY_PATIENT, "{}").await;
        wf.invoke(
            GET_ASSIGNED_NURSE,
            &format!(r#"{{"patient_id": {}}}"#, s.patient.id),
        )
        .await;
        assert_eq!(wf.state(), WorkflowState::AwaitingTimePreference);
    }

    /// The scenario's other patient, assigned to the same nurse and ready to ask for a time.
    async fn rival(s: &Scenario) -> (i32, SchedulingWorkflow) {
        let rival_id = s.booked.patient_id;
        s.repo.assign(rival_id, s.nurse.id, SCENARIO_DATE);
        let mut wf = SchedulingWorkflow::new(
            s.repo.clone(),
            SessionConfig::default(),
            "+15550000000".into(),
            SCENARIO_DATE,
        );
        wf.invoke(IDENTIFY_PATIENT, "{}").await;
        wf.invoke(GET_ASSIGNED_NURSE, &format!(r#"{{"patient_id": {rival_id}}}"#))
            .await;
        assert_eq!(wf.state(), WorkflowState::AwaitingTimePreference);
        (rival_id, wf)
    }

    fn confirm_args(patient_id: i32, nurse_id: i32, start: &str) -> String {
        format!(
            r#"{{"patient_id": {patient_id}, "nurse_id": {nurse_id}, "date": "2025-03-10", "start": "{start}", "duration": 30}}"#
        )
    }

    #[tokio::test]
    async fn example_scenario_schedules_after_alternatives() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());

        let out = wf.invoke(IDENTIFY_PATIENT, "{}").await;
        assert_eq!(json(&out)["status"], "patient_identified");
        assert_eq!(json(&out)["patient_id"], s.patient.id);
        assert_eq!(wf.state(), WorkflowState::AwaitingNursePreference);

        let out = wf
            .invoke(GET_ASSIGNED_NURSE, &format!(r#"{{"patient_id": {}}}"#, s.patient.id))
            .await;
        assert_eq!(json(&out)["nurse_id"], s.nurse.id);

        let out = wf
            .invoke(
                "get_available_slots",
                &format!(r#"{{"nurse_id": {}, "date": "2025-03-10"}}"#, s.nurse.id),
            )
            .await;
        let slots = json(&out)["slots"].as_array().unwrap().clone();
        assert!(slots
            .iter()
            .all(|slot| !(slot["start"] == "10:00" && slot["end"] == "10:30")));
        assert_eq!(slots[0]["start"], "09:00");
        assert_eq!(slots[0]["end"], "10:00");
        assert_eq!(slots[1]["start"], "10:30");

        let out = wf
            .invoke(
                "request_appointment_time",
                r#"{"date": "2025-03-10", "start": "10:00"}"#,
            )
            .await;
        let v = json(&out);
        assert_eq!(v["status"], "conflict");
        let starts: Vec<&str> = v["alternatives"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["start"].as_str().unwrap())
            .collect();
        assert!(starts.contains(&"09:00"));
        assert!(starts.contains(&"10:30"));
        assert_eq!(wf.state(), WorkflowState::OfferingAlternatives);

        let out = wf
            .invoke(
                "confirm_appointment",
                &format!(
                    r#"{{"patient_id": {}, "nurse_id": {}, "date": "2025-03-10", "start": "10:30", "duration": 30}}"#,
                    s.patient.id, s.nurse.id
                ),
            )
            .await;
        let v = json(&out);
        assert_eq!(v["status"], "scheduled");
        assert!(v["appointment_id"].is_i64());
        assert_eq!(wf.state(), WorkflowState::Scheduled);
        assert_eq!(s.repo.notifications().len(), 2);

        let (snapshot, outcome) = wf.snapshot().close();
        assert_eq!(outcome, Outcome::Scheduled);
        assert_eq!(snapshot.state, WorkflowState::Scheduled);
        assert!(snapshot.summary.unwrap().contains("10:30-11:00"));
    }

    #[tokio::test]
    async fn unknown_caller_is_unresolvable() {
        let s = scenario();
        let mut wf = SchedulingWorkflow::new(
            s.repo.clone(),
            SessionConfig::default(),
            "+19998887777".into(),
            SCENARIO_DATE,
        );
        let out = wf.invoke(IDENTIFY_PATIENT, "{}").await;
        assert_eq!(json(&out)["status"], "not_found");
        assert_eq!(wf.state(), WorkflowState::Unresolvable);

        let (_, outcome) = wf.snapshot().close();
        assert_eq!(outcome, Outcome::Unresolved);
    }

    #[tokio::test]
    async fn out_of_order_and_malformed_calls_do_not_move_state() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());

        let out = wf
            .invoke(
                "confirm_appointment",
                r#"{"patient_id": 1, "nurse_id": 1, "date": "2025-03-10", "start": "11:00"}"#,
            )
            .await;
        assert_eq!(json(&out)["code"], "invalid_state");
        assert_eq!(wf.state(), WorkflowState::AwaitingIdentity);

        let out = wf.invoke("request_appointment_time", r#"{"date": 5}"#).await;
        assert_eq!(json(&out)["code"], "validation");
        assert_eq!(wf.state(), WorkflowState::AwaitingIdentity);
        assert!(out.directive.is_none());
    }

    #[tokio::test]
    async fn declining_alternatives_ends_unresolved() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());
        identified(&s, &mut wf).await;

        wf.invoke(
            "request_appointment_time",
            r#"{"date": "2025-03-10", "start": "10:00"}"#,
        )
        .await;
        let out = wf.invoke("decline_alternatives", "{}").await;
        assert_eq!(json(&out)["status"], "declined");
        assert_eq!(wf.state(), WorkflowState::Unresolvable);
        assert_eq!(s.repo.appointments().len(), 1);
    }

    #[tokio::test]
    async fn lost_race_offers_fresh_alternatives() {
        let s = scenario();
        let mut first = workflow(s.repo.clone());
        identified(&s, &mut first).await;
        let (rival_id, mut second) = rival(&s).await;

        // both see 11:00 as free before either books
        let ask = r#"{"date": "2025-03-10", "start": "11:00"}"#;
        first.invoke(REQUEST_APPOINTMENT_TIME, ask).await;
        second.invoke(REQUEST_APPOINTMENT_TIME, ask).await;
        assert_eq!(second.state(), WorkflowState::ReadyToConfirm);

        let won = first
            .invoke(CONFIRM_APPOINTMENT, &confirm_args(s.patient.id, s.nurse.id, "11:00"))
            .await;
        assert_eq!(json(&won)["status"], "scheduled");

        let lost = second
            .invoke(CONFIRM_APPOINTMENT, &confirm_args(rival_id, s.nurse.id, "11:00"))
            .await;
        let v = json(&lost);
        assert_eq!(v["status"], "conflict");
        let alternatives = v["alternatives"].as_array().unwrap();
        assert!(!alternatives.is_empty());
        assert!(alternatives.iter().all(|a| a["start"] != "11:00"));
        assert_eq!(second.state(), WorkflowState::OfferingAlternatives);
    }

    #[tokio::test]
    async fn replayed_confirmation_returns_the_same_appointment() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());
        identified(&s, &mut wf).await;
        let confirm = format!(
            r#"{{"patient_id": {}, "nurse_id": {}, "date": "2025-03-10", "start": "14:00"}}"#,
            s.patient.id, s.nurse.id
        );
        let a = wf.invoke("confirm_appointment", &confirm).await;
        let b = wf.invoke("confirm_appointment", &confirm).await;
        assert_eq!(a.result, b.result);
        assert_eq!(s.repo.appointments().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_keep_state_and_eventually_close() {
        let s = scenario();
        let flaky = Arc::new(FlakyRepository::new(s.repo.clone()));
        let mut wf = SchedulingWorkflow::new(
            flaky.clone(),
            SessionConfig {
                tool_timeout: Duration::from_millis(100),
                max_backend_failures: 2,
                ..SessionConfig::default()
            },
            "+15551234567".into(),
            SCENARIO_DATE,
        );
        identified(&s, &mut wf).await;

        flaky.set_delay(Some(Duration::from_secs(10)));
        let out = wf
            .invoke("request_appointment_time", r#"{"date": "2025-03-10", "start": "11:00"}"#)
            .await;
        let v = json(&out);
        assert_eq!(v["code"], "timeout");
        assert_eq!(v["retryable"], true);
        assert_eq!(wf.state(), WorkflowState::AwaitingTimePreference);
        assert!(out.directive.is_none());

        let out = wf
            .invoke("request_appointment_time", r#"{"date": "2025-03-10", "start": "11:00"}"#)
            .await;
        assert_eq!(out.directive, Some(Directive::CloseBackendUnavailable));
        assert_eq!(wf.state(), WorkflowState::AwaitingTimePreference);

        flaky.set_delay(None);
        let out = wf
            .invoke("request_appointment_time", r#"{"date": "2025-03-10", "start": "11:00"}"#)
            .await;
        assert_eq!(json(&out)["status"], "available");
        assert_eq!(wf.state(), WorkflowState::ReadyToConfirm);
    }

    fn stalling_workflow(s: &Scenario) -> (Arc<FlakyRepository>, SchedulingWorkflow) {
        let flaky = Arc::new(FlakyRepository::new(s.repo.clone()));
        let wf = SchedulingWorkflow::new(
            flaky.clone(),
            SessionConfig {
                tool_timeout: Duration::from_millis(100),
                ..SessionConfig::default()
            },
            "+15551234567".into(),
            SCENARIO_DATE,
        );
        (flaky, wf)
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_written_after_timeout_is_confirmed_on_retry() {
        let s = scenario();
        let (flaky, mut wf) = stalling_workflow(&s);
        identified(&s, &mut wf).await;
        let confirm = format!(
            r#"{{"patient_id": {}, "nurse_id": {}, "date": "2025-03-10", "start": "14:00"}}"#,
            s.patient.id, s.nurse.id
        );

        flaky.set_stall_after_reserve(Some(Duration::from_secs(10)));
        let out = wf.invoke("confirm_appointment", &confirm).await;
        assert_eq!(json(&out)["code"], "timeout");
        assert_eq!(wf.state(), WorkflowState::AwaitingTimePreference);
        assert_eq!(s.repo.appointments().len(), 2);
        assert!(s.repo.notifications().is_empty());

        let out = wf.invoke("confirm_appointment", &confirm).await;
        let v = json(&out);
        assert_eq!(v["status"], "scheduled");
        assert_eq!(v["slot"]["start"], "14:00");
        assert_eq!(wf.state(), WorkflowState::Scheduled);

        let booked = s.repo.appointments();
        assert_eq!(booked.len(), 2);
        let ours = booked.iter().find(|a| a.patient_id == s.patient.id).unwrap();
        assert_eq!(v["appointment_id"], ours.id);
        assert_eq!(s.repo.notifications().len(), 2);
        assert_eq!(wf.snapshot().appointment_id, Some(ours.id));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reservation_is_adopted_by_the_next_tool_call() {
        let s = scenario();
        let (flaky, mut wf) = stalling_workflow(&s);
        identified(&s, &mut wf).await;
        let confirm = format!(
            r#"{{"patient_id": {}, "nurse_id": {}, "date": "2025-03-10", "start": "15:00"}}"#,
            s.patient.id, s.nurse.id
        );

        flaky.set_stall_after_reserve(Some(Duration::from_secs(1)));
        let out = wf.invoke("confirm_appointment", &confirm).await;
        assert_eq!(json(&out)["code"], "timeout");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let out = wf
            .invoke(
                "get_available_slots",
                &format!(r#"{{"nurse_id": {}, "date": "2025-03-10"}}"#, s.nurse.id),
            )
            .await;
        assert_eq!(json(&out)["status"], "slots");
        assert_eq!(wf.state(), WorkflowState::Scheduled);
        assert_eq!(s.repo.notifications().len(), 2);
        let (_, outcome) = wf.snapshot().close();
        assert_eq!(outcome, Outcome::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_actor_waits_for_a_running_reservation_before_finishing() {
        let s = scenario();
        let (flaky, mut wf) = stalling_workflow(&s);
        identified(&s, &mut wf).await;
        flaky.set_stall_after_reserve(Some(Duration::from_millis(150)));
        let out = wf
            .invoke(
                "confirm_appointment",
                &format!(
                    r#"{{"patient_id": {}, "nurse_id": {}, "date": "2025-03-10", "start": "16:00"}}"#,
                    s.patient.id, s.nurse.id
                ),
            )
            .await;
        assert_eq!(json(&out)["code"], "timeout");

        let (tx, rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = watch::channel(wf.snapshot());
        drop(tx);
        run_workflow(wf, rx, snapshot_tx).await;
        assert_eq!(snapshot_rx.borrow().state, WorkflowState::Scheduled);
        assert!(snapshot_rx.borrow().appointment_id.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_sessions_racing_for_one_slot_book_it_once() {
        let s = scenario();
        let mut first = workflow(s.repo.clone());
        identified(&s, &mut first).await;
        let (rival_id, mut second) = rival(&s).await;

        let ask = r#"{"date": "2025-03-10", "start": "13:00"}"#;
        first.invoke(REQUEST_APPOINTMENT_TIME, ask).await;
        second.invoke(REQUEST_APPOINTMENT_TIME, ask).await;
        assert_eq!(first.state(), WorkflowState::ReadyToConfirm);
        assert_eq!(second.state(), WorkflowState::ReadyToConfirm);

        let first_args = confirm_args(s.patient.id, s.nurse.id, "13:00");
        let second_args = confirm_args(rival_id, s.nurse.id, "13:00");
        let (a, b) = tokio::join!(
            first.invoke(CONFIRM_APPOINTMENT, &first_args),
            second.invoke(CONFIRM_APPOINTMENT, &second_args),
        );
        let results = [json(&a), json(&b)];
        let won: Vec<&Value> = results.iter().filter(|v| v["status"] == "scheduled").collect();
        let lost: Vec<&Value> = results.iter().filter(|v| v["status"] == "conflict").collect();
        assert_eq!(won.len(), 1);
        assert_eq!(lost.len(), 1);
        let alternatives = lost[0]["alternatives"].as_array().unwrap();
        assert!(!alternatives.is_empty());
        assert!(alternatives.iter().all(|a| a["start"] != "13:00"));

        let at_one = s
            .repo
            .appointments()
            .iter()
            .filter(|a| a.appointment_time == time::macros::time!(13:00))
            .count();
        assert_eq!(at_one, 1);
        let states = [first.state(), second.state()];
        assert!(states.contains(&WorkflowState::Scheduled));
        assert!(states.contains(&WorkflowState::OfferingAlternatives));
    }

    #[tokio::test]
    async fn slots_for_an_unknown_nurse_are_not_found() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());
        let out = wf
            .invoke(
                "get_available_slots",
                r#"{"nurse_id": 999, "date": "2025-03-10"}"#,
            )
            .await;
        let v = json(&out);
        assert_eq!(v["status"], "not_found");
        assert_eq!(v["what"], "nurse");
        assert_eq!(wf.state(), WorkflowState::AwaitingIdentity);

        let out = wf
            .invoke(
                "get_available_slots",
                &format!(r#"{{"nurse_id": {}, "date": "2025-03-10"}}"#, s.nurse.id),
            )
            .await;
        assert_eq!(json(&out)["status"], "slots");
    }

    #[tokio::test]
    async fn closing_mid_flow_abandons() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());
        identified(&s, &mut wf).await;
        let (snapshot, outcome) = wf.snapshot().close();
        assert_eq!(outcome, Outcome::Abandoned);
        assert_eq!(snapshot.state, WorkflowState::Unresolvable);
        assert_eq!(snapshot.unresolved, Some(UnresolvedReason::SessionClosed));
        assert_eq!(snapshot.nurse_id, Some(s.nurse.id));
    }

    #[tokio::test]
    async fn end_call_requests_hangup() {
        let s = scenario();
        let mut wf = workflow(s.repo.clone());
        let out = wf.invoke("end_call", r#"{"reason": "done"}"#).await;
        assert_eq!(out.directive, Some(Directive::Hangup));
        assert_eq!(json(&out)["status"], "ending");
    }
}
