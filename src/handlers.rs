use crate::bridge::BridgeLegs;
use crate::consts::APP_GREETING;
use crate::error::{handle_error, AppError};
use crate::realtime::{instructions, open_realtime_stream, read_ai_leg, write_ai_leg};
use crate::recording;
use crate::twilio::{get_twilio_start_meta, read_telephony_leg, write_telephony_leg};
use crate::twilio_types::{
    wrap_twiml, ConnectAction, Connection, Response, ResponseAction, SayAction, StartMeta,
    StreamAction, StreamTrack, TwilioConnectPayload,
};
use crate::types::{AppState, CallRef, CloseReason, Direction};

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Host, Path, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use futures_util::stream::StreamExt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info, trace, warn};

/// Voice webhook: greet the caller and connect the call audio to our media stream endpoint.
pub async fn twiml_start_connect(
    Host(host): Host,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "start request body");
    let payload = match serde_urlencoded::from_str::<TwilioConnectPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio connect payload");
            return (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                "Bad request".to_string(),
            );
        }
    };
    debug!(call_sid=%payload.call_sid, direction=?payload.direction, "call connected");
    app_state.streams.insert(payload);

    let say_action = SayAction {
        text: APP_GREETING.to_string(),
        ..Default::default()
    };
    let stream_action = StreamAction {
        url: format!("wss://{host}/media-stream"),
        track: Some(StreamTrack::Inbound),
        ..Default::default()
    };
    let response = Response {
        actions: vec![
            ResponseAction::Say(say_action),
            ResponseAction::Connect(ConnectAction {
                connection: Connection::Stream(stream_action),
            }),
        ],
    };

    let twiml = wrap_twiml(xmlserde::xml_serialize(response));
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}

pub async fn health(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        "ok, {} active sessions, {} calls waiting for a stream",
        app_state.sessions.active_count(),
        app_state.streams.waiting()
    )
}

/// Serve a saved call recording: `speaker` is `patient` or `assistant`.
pub async fn call_audio(
    State(app_state): State<Arc<AppState>>,
    Path((session_id, speaker)): Path<(String, String)>,
) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    let Some(dir) = &app_state.config.session.recordings_dir else {
        return (StatusCode::NOT_FOUND, headers, Vec::new());
    };
    match recording::load(dir, &session_id, &speaker).await {
        Ok(Some(wav)) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
            (StatusCode::OK, headers, wav)
        }
        Ok(None) => {
            debug!(session=%session_id, speaker=%speaker, "no recording");
            (StatusCode::NOT_FOUND, headers, Vec::new())
        }
        Err(e) => {
            error!(session=%session_id, error=%e, "failed to read recording");
            (StatusCode::INTERNAL_SERVER_ERROR, headers, Vec::new())
        }
    }
}

/// Work out who the patient on this call is. Outbound calls dial the patient, so their
/// number is the `to` side; inbound calls come from the patient.
async fn resolve_call_ref(app_state: &AppState, start: &StartMeta) -> Result<CallRef, AppError> {
    let cached = app_state.streams.take(&start.call_sid);

    let (direction, patient_phone) = if let Some(payload) = cached {
        if payload.direction.is_outbound() {
            (Direction::Outbound, payload.to)
        } else {
            (Direction::Inbound, payload.from)
        }
    } else if let Some(phone) = start.custom_parameters.get("patient_phone") {
        let direction = match start.custom_parameters.get("direction").map(String::as_str) {
            Some("inbound") => Direction::Inbound,
            _ => Direction::Outbound,
        };
        (direction, phone.clone())
    } else {
        let details = app_state.twilio_api.fetch_call(&start.call_sid).await?;
        if details.direction.is_outbound() {
            (Direction::Outbound, details.to)
        } else {
            (Direction::Inbound, details.from)
        }
    };

    Ok(CallRef {
        call_sid: start.call_sid.clone(),
        stream_sid: start.stream_sid.clone(),
        direction,
        patient_phone,
    })
}

pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (twilio_sink, mut twilio_stream) = socket.split();
    let start_meta = match get_twilio_start_meta(&mut twilio_stream).await {
        Ok(start_meta) => start_meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta = ?start_meta, "got start meta from twilio stream");

    let call_ref = match resolve_call_ref(&app_state, &start_meta).await {
        Ok(call_ref) => call_ref,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };

    let today = OffsetDateTime::now_utc().date();
    let (ai_sink, ai_stream) = match open_realtime_stream(
        &app_state.config,
        instructions(&call_ref.patient_phone, today),
    )
    .await
    {
        Ok(ai) => ai,
        Err(e) => {
            handle_error(e).await;
            if let Err(e) = app_state.twilio_api.end_call(&call_ref.call_sid).await {
                warn!(error=%e, "could not hang up after realtime connect failure");
            }
            return;
        }
    };

    let legs = BridgeLegs::new(app_state.config.session.audio_queue_capacity);
    let telephony_in = tokio::spawn(read_telephony_leg(
        twilio_stream,
        legs.from_telephony.clone(),
    ));
    let telephony_out = tokio::spawn(write_telephony_leg(
        twilio_sink,
        legs.to_telephony.clone(),
        call_ref.stream_sid.clone(),
        call_ref.call_sid.clone(),
        app_state.twilio_api.clone(),
    ));
    let ai_in = tokio::spawn(read_ai_leg(ai_stream, legs.from_ai.clone()));
    let ai_out = tokio::spawn(write_ai_leg(ai_sink, legs.to_ai.clone()));

    let session = match app_state.sessions.open(call_ref, legs.clone()).await {
        Ok(session) => session,
        Err(e) => {
            handle_error(e).await;
            legs.close_all();
            return;
        }
    };
    info!(session=%session.id, "media stream attached");

    let (telephony_in, telephony_out, ai_in, ai_out) =
        tokio::join!(telephony_in, telephony_out, ai_in, ai_out);
    for res in [telephony_in, telephony_out, ai_in, ai_out] {
        match res {
            Ok(Ok(())) => (),
            Ok(Err(e)) => handle_error(e).await,
            Err(e) => error!(error=%e, "adapter task panicked"),
        }
    }
    if app_state.sessions.is_active(session.id) {
        debug!(session=%session.id, "adapters finished before the bridge noticed");
        app_state
            .sessions
            .close(session.id, CloseReason::TelephonyLegClosed)
            .await;
    }
    debug!(session=%session.id, "media stream detached");
}
