//! The tool surface the AI leg calls into: argument parsing, structured results and the
//! function definitions announced to the model.

use crate::availability::{format_date, format_minute, parse_clock, parse_date, Interval};
use crate::error::ToolError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{Date, Time};
use tracing::error;

pub const IDENTIFY_PATIENT: &str = "identify_patient";
pub const GET_ASSIGNED_NURSE: &str = "get_assigned_nurse";
pub const GET_AVAILABLE_SLOTS: &str = "get_available_slots";
pub const REQUEST_APPOINTMENT_TIME: &str = "request_appointment_time";
pub const CONFIRM_APPOINTMENT: &str = "confirm_appointment";
pub const DECLINE_ALTERNATIVES: &str = "decline_alternatives";
pub const END_CALL: &str = "end_call";

const MAX_DURATION_MINUTES: u16 = 240;

/// A validated tool call.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolCall {
    /// `phone` falls back to the number the call came from (or was placed to).
    IdentifyPatient { phone: Option<String> },
    GetAssignedNurse { patient_id: i32 },
    GetAvailableSlots { nurse_id: i32, date: Date },
    RequestAppointmentTime {
        date: Date,
        start: Time,
        duration_minutes: Option<u16>,
    },
    ConfirmAppointment {
        patient_id: i32,
        nurse_id: i32,
        date: Date,
        start: Time,
        duration_minutes: Option<u16>,
    },
    DeclineAlternatives,
    EndCall { reason: Option<String> },
}

#[derive(Deserialize)]
struct IdentifyArgs {
    phone: Option<String>,
}

#[derive(Deserialize)]
struct NurseArgs {
    patient_id: i32,
}

#[derive(Deserialize)]
struct SlotsArgs {
    nurse_id: i32,
    date: String,
}

#[derive(Deserialize)]
struct RequestArgs {
    date: String,
    start: String,
    duration: Option<u16>,
}

#[derive(Deserialize)]
struct ConfirmArgs {
    patient_id: i32,
    nurse_id: i32,
    date: String,
    start: String,
    duration: Option<u16>,
}

#[derive(Deserialize)]
struct EndCallArgs {
    reason: Option<String>,
}

impl ToolCall {
    /// Parse the raw JSON argument string the AI sent for `name`.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolError> {
        let call = match name {
            IDENTIFY_PATIENT => {
                let args: IdentifyArgs = args(arguments)?;
                ToolCall::IdentifyPatient {
                    phone: args.phone.filter(|p| !p.trim().is_empty()),
                }
            }
            GET_ASSIGNED_NURSE => {
                let args: NurseArgs = args(arguments)?;
                ToolCall::GetAssignedNurse {
                    patient_id: args.patient_id,
                }
            }
            GET_AVAILABLE_SLOTS => {
                let args: SlotsArgs = args(arguments)?;
                ToolCall::GetAvailableSlots {
                    nurse_id: args.nurse_id,
                    date: date_arg(&args.date)?,
                }
            }
            REQUEST_APPOINTMENT_TIME => {
                let args: RequestArgs = args(arguments)?;
                ToolCall::RequestAppointmentTime {
                    date: date_arg(&args.date)?,
                    start: clock_arg(&args.start)?,
                    duration_minutes: duration_arg(args.duration)?,
                }
            }
            CONFIRM_APPOINTMENT => {
                let args: ConfirmArgs = args(arguments)?;
                ToolCall::ConfirmAppointment {
                    patient_id: args.patient_id,
                    nurse_id: args.nurse_id,
                    date: date_arg(&args.date)?,
                    start: clock_arg(&args.start)?,
                    duration_minutes: duration_arg(args.duration)?,
                }
            }
            DECLINE_ALTERNATIVES => ToolCall::DeclineAlternatives,
            END_CALL => {
                let args: EndCallArgs = args(arguments)?;
                ToolCall::EndCall {
                    reason: args.reason,
                }
            }
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::IdentifyPatient { .. } => IDENTIFY_PATIENT,
            ToolCall::GetAssignedNurse { .. } => GET_ASSIGNED_NURSE,
            ToolCall::GetAvailableSlots { .. } => GET_AVAILABLE_SLOTS,
            ToolCall::RequestAppointmentTime { .. } => REQUEST_APPOINTMENT_TIME,
            ToolCall::ConfirmAppointment { .. } => CONFIRM_APPOINTMENT,
            ToolCall::DeclineAlternatives => DECLINE_ALTERNATIVES,
            ToolCall::EndCall { .. } => END_CALL,
        }
    }
}

fn args<T: DeserializeOwned>(arguments: &str) -> Result<T, ToolError> {
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str(arguments).map_err(|e| ToolError::Validation(e.to_string()))
}

fn date_arg(raw: &str) -> Result<Date, ToolError> {
    parse_date(raw)
        .ok_or_else(|| ToolError::Validation(format!("date `{raw}` is not in YYYY-MM-DD form")))
}

fn clock_arg(raw: &str) -> Result<Time, ToolError> {
    parse_clock(raw)
        .ok_or_else(|| ToolError::Validation(format!("start `{raw}` is not a 24-hour HH:MM time")))
}

fn duration_arg(minutes: Option<u16>) -> Result<Option<u16>, ToolError> {
    match minutes {
        Some(m) if m == 0 || m > MAX_DURATION_MINUTES => Err(ToolError::Validation(format!(
            "duration must be between 1 and {MAX_DURATION_MINUTES} minutes"
        ))),
        other => Ok(other),
    }
}

/// A free or requested window as the AI sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub start: String,
    pub end: String,
}

impl From<Interval> for SlotView {
    fn from(i: Interval) -> Self {
        Self {
            start: format_minute(i.start),
            end: format_minute(i.end),
        }
    }
}

/// Structured payload returned to the AI for every tool call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    PatientIdentified {
        patient_id: i32,
        name: String,
        conditions: Vec<String>,
    },
    NurseAssigned {
        nurse_id: i32,
        name: String,
        specialization: String,
    },
    NotFound {
        what: &'static str,
        message: String,
    },
    Slots {
        nurse_id: i32,
        date: String,
        slots: Vec<SlotView>,
    },
    Available {
        date: String,
        slot: SlotView,
    },
    Conflict {
        date: String,
        requested: SlotView,
        alternatives: Vec<SlotView>,
    },
    /// Tagged with the new appointment's status.
    #[serde(rename = "scheduled")]
    Confirmed {
        appointment_id: i32,
        nurse_name: String,
        date: String,
        slot: SlotView,
    },
    Declined,
    Ending,
    Error {
        code: &'static str,
        message: String,
        retryable: bool,
    },
}

impl ToolResult {
    pub fn slots(nurse_id: i32, date: Date, free: &[Interval]) -> Self {
        ToolResult::Slots {
            nurse_id,
            date: format_date(date),
            slots: free.iter().copied().map(SlotView::from).collect(),
        }
    }

    pub fn conflict(date: Date, requested: Interval, alternatives: &[Interval]) -> Self {
        ToolResult::Conflict {
            date: format_date(date),
            requested: requested.into(),
            alternatives: alternatives.iter().copied().map(SlotView::from).collect(),
        }
    }

    pub fn error(e: &ToolError) -> Self {
        ToolResult::Error {
            code: e.code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }

    /// An error result the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolResult::Error { retryable: true, .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            error!(error=%e, "failed to serialize tool result");
            r#"{"status":"error","code":"internal","message":"unserializable result","retryable":false}"#
                .to_string()
        })
    }
}

/// Function definitions announced to the realtime model.
pub fn tool_definitions() -> Vec<Value> {
    let date = json!({"type": "string", "description": "Calendar date, YYYY-MM-DD"});
    let start = json!({"type": "string", "description": "Start time, 24-hour HH:MM"});
    let duration = json!({"type": "integer", "description": "Length in minutes, defaults to 30"});
    vec![
        function(
            IDENTIFY_PATIENT,
            "Look up the patient on this call by phone number. Omit phone to use the caller's number.",
            json!({"phone": {"type": "string"}}),
            &[],
        ),
        function(
            GET_ASSIGNED_NURSE,
            "Find the nurse assigned to an identified patient.",
            json!({"patient_id": {"type": "integer"}}),
            &["patient_id"],
        ),
        function(
            GET_AVAILABLE_SLOTS,
            "List the free time ranges a nurse has on a date.",
            json!({"nurse_id": {"type": "integer"}, "date": date.clone()}),
            &["nurse_id", "date"],
        ),
        function(
            REQUEST_APPOINTMENT_TIME,
            "Record the time the patient asked for (or an offered alternative they picked) and check it against the assigned nurse's schedule.",
            json!({"date": date.clone(), "start": start.clone(), "duration": duration.clone()}),
            &["date", "start"],
        ),
        function(
            CONFIRM_APPOINTMENT,
            "Book the appointment once the patient has agreed to a free slot.",
            json!({
                "patient_id": {"type": "integer"},
                "nurse_id": {"type": "integer"},
                "date": date,
                "start": start,
                "duration": duration
            }),
            &["patient_id", "nurse_id", "date", "start"],
        ),
        function(
            DECLINE_ALTERNATIVES,
            "The patient turned down every offered alternative.",
            json!({}),
            &[],
        ),
        function(
            END_CALL,
            "Hang up after saying goodbye.",
            json!({"reason": {"type": "string"}}),
            &[],
        ),
    ]
}

fn function(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "name": name,
        "description": description,
        "parameters": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    })
}

/// Tools that hold back the caller's audio until their result is delivered. Only the
/// booking write qualifies; lookups run alongside the conversation.
pub fn is_exclusive(tool: &str) -> bool {
    tool == CONFIRM_APPOINTMENT
}

/// E.164 form used as the phone lookup key. North American numbers written without the
/// country code get `+1`; anything else that is not already international stays bare digits.
pub fn normalize_phone(raw: &str) -> String {
    let raw = raw.trim();
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        _ if raw.starts_with('+') => format!("+{digits}"),
        10 => format!("+1{digits}"),
        11 if digits.starts_with('1') => format!("+{digits}"),
        _ => digits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, time};

    #[test]
    fn parses_confirm_arguments() {
        let call = ToolCall::parse(
            CONFIRM_APPOINTMENT,
            r#"{"patient_id": 1, "nurse_id": 3, "date": "2025-03-10", "start": "10:30"}"#,
        )
        .unwrap();
        assert_eq!(
            call,
            ToolCall::ConfirmAppointment {
                patient_id: 1,
                nurse_id: 3,
                date: date!(2025 - 03 - 10),
                start: time!(10:30),
                duration_minutes: None,
            }
        );
    }

    #[test]
    fn malformed_arguments_are_validation_errors() {
        let err = ToolCall::parse(GET_AVAILABLE_SLOTS, r#"{"nurse_id": 3, "date": "tomorrow"}"#)
            .unwrap_err();
        assert_eq!(err.code(), "validation");

        let err = ToolCall::parse(GET_ASSIGNED_NURSE, "{not json").unwrap_err();
        assert_eq!(err.code(), "validation");

        let err = ToolCall::parse(
            REQUEST_APPOINTMENT_TIME,
            r#"{"date": "2025-03-10", "start": "10:00", "duration": 0}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation");

        let err = ToolCall::parse("book_flight", "{}").unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("book_flight".into()));
    }

    #[test]
    fn empty_arguments_are_accepted_for_argumentless_tools() {
        assert_eq!(
            ToolCall::parse(IDENTIFY_PATIENT, "").unwrap(),
            ToolCall::IdentifyPatient { phone: None }
        );
        assert_eq!(
            ToolCall::parse(DECLINE_ALTERNATIVES, "{}").unwrap(),
            ToolCall::DeclineAlternatives
        );
    }

    #[test]
    fn results_serialize_with_status_tag() {
        let requested = Interval::new(660, 690).unwrap();
        let alts = [Interval::new(630, 660).unwrap(), Interval::new(690, 720).unwrap()];
        let value: Value =
            serde_json::from_str(&ToolResult::conflict(date!(2025 - 03 - 10), requested, &alts).to_json())
                .unwrap();
        assert_eq!(value["status"], "conflict");
        assert_eq!(value["requested"]["start"], "11:00");
        assert_eq!(value["alternatives"][1]["end"], "12:00");

        let value: Value = serde_json::from_str(
            &ToolResult::error(&ToolError::Backend(crate::error::RepoError::Timeout)).to_json(),
        )
        .unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "timeout");
        assert_eq!(value["retryable"], true);
    }

    #[test]
    fn definitions_cover_every_tool() {
        let names: Vec<String> = tool_definitions()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_string())
            .collect();
        for name in [
            IDENTIFY_PATIENT,
            GET_ASSIGNED_NURSE,
            GET_AVAILABLE_SLOTS,
            REQUEST_APPOINTMENT_TIME,
            CONFIRM_APPOINTMENT,
            DECLINE_ALTERNATIVES,
            END_CALL,
        ] {
            assert!(names.iter().any(|n| n == name), "{name} missing");
        }
    }

    #[test]
    fn only_the_booking_write_is_exclusive() {
        assert!(is_exclusive(CONFIRM_APPOINTMENT));
        for tool in [IDENTIFY_PATIENT, GET_AVAILABLE_SLOTS, REQUEST_APPOINTMENT_TIME, END_CALL] {
            assert!(!is_exclusive(tool), "{tool}");
        }
    }

    #[test]
    fn phone_spellings_share_one_key() {
        for raw in [
            "+15551234567",
            "15551234567",
            "5551234567",
            "+1 (555) 123-4567",
            "1-555-123-4567",
            "555.123.4567",
        ] {
            assert_eq!(normalize_phone(raw), "+15551234567", "{raw}");
        }
        assert_eq!(normalize_phone("+44 20 7946 0958"), "+442079460958");
        assert_eq!(normalize_phone("1234"), "1234");
    }
}
