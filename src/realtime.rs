use crate::bridge::{AiCommand, AiEvent};
use crate::config::Config;
use crate::error::AppError;
use crate::queue::FrameQueue;
use crate::realtime_types::{
    AudioFormat, AudioInput, AudioOutput, AudioSettings, ClientEvent, ConversationItem,
    ServerEvent, SessionSettings, Transcription, TurnDetection,
};
use crate::tools::{is_exclusive, tool_definitions};
use crate::types::Speaker;
use crate::utils::{b64_decode, b64_encode};

use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde_json::Value;
use std::sync::Arc;
use time::Date;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

pub type AiSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub type AiStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const G711_ULAW: &str = "audio/pcmu";

/// Scheduling-assistant prompt for one call.
pub fn instructions(patient_phone: &str, today: Date) -> String {
    format!(
        "You are a friendly scheduling assistant calling on behalf of a home health care team. \
         You are speaking with the patient reachable at {patient_phone}. Today is {today}.\n\
         Start by greeting the caller and calling identify_patient. Then look up their assigned \
         nurse, offer open times with get_available_slots and check the time the patient asks \
         for with request_appointment_time. Only call confirm_appointment after the patient \
         has clearly agreed to a specific date and time. If the time is taken, read out the \
         alternatives you were given; if the patient wants none of them, call \
         decline_alternatives.\n\
         Never invent appointment times, names or confirmations: rely only on tool results. \
         When a tool reports an error that is retryable, apologize and try once more. Keep \
         answers short, speak dates and times naturally, and call end_call after saying \
         goodbye."
    )
}

fn session_update(config: &Config, instructions: String) -> ClientEvent {
    ClientEvent::SessionUpdate {
        session: SessionSettings {
            kind: "realtime",
            instructions,
            tools: Value::Array(tool_definitions()),
            tool_choice: "auto",
            audio: AudioSettings {
                input: AudioInput {
                    format: AudioFormat { kind: G711_ULAW },
                    turn_detection: TurnDetection { kind: "server_vad" },
                    transcription: Transcription { model: "whisper-1" },
                },
                output: AudioOutput {
                    format: AudioFormat { kind: G711_ULAW },
                    voice: config.openai_voice.clone(),
                },
            },
        },
    }
}

async fn send_event(sink: &mut AiSink, event: &ClientEvent) -> Result<(), AppError> {
    let json = serde_json::to_string(event).map_err(|e| {
        error!(error=%e, "failed to serialize realtime client event");
        AppError("realtime serialization error")
    })?;
    sink.send(tungstenite::Message::Text(json))
        .await
        .map_err(|e| {
            error!(error=%e, "failed to send realtime client event");
            AppError("realtime send error")
        })
}

/// Open the realtime websocket, configure the session and ask for the opening greeting.
pub async fn open_realtime_stream(
    config: &Config,
    instructions: String,
) -> Result<(AiSink, AiStream), AppError> {
    let uri = format!("{}?model={}", config.openai_realtime_url, config.openai_model);
    trace!(uri=%uri, "connecting to realtime endpoint");
    let mut rq = uri.into_client_request().map_err(|e| {
        error!(error=%e, "invalid realtime url");
        AppError("invalid realtime url")
    })?;
    let bearer = http::header::HeaderValue::from_str(&format!("Bearer {}", config.openai_api_key))
        .map_err(|_| AppError("invalid OpenAI api key header"))?;
    rq.headers_mut().insert(http::header::AUTHORIZATION, bearer);

    let (ws_stream, _) = connect_async(rq).await.map_err(|e| {
        error!(error=%e, "failed to connect to realtime endpoint");
        AppError("realtime connect error")
    })?;
    let (mut sink, stream) = ws_stream.split();

    send_event(&mut sink, &session_update(config, instructions)).await?;
    send_event(&mut sink, &ClientEvent::ResponseCreate).await?;
    info!("opened realtime session");
    Ok((sink, stream))
}

/// Map a realtime server event onto the bridge's neutral event. Events the bridge does not
/// care about map to `None`.
fn to_ai_event(event: ServerEvent) -> Result<Option<AiEvent>, AppError> {
    let mapped = match event {
        ServerEvent::SessionUpdated => Some(AiEvent::SessionReady),
        ServerEvent::SessionCreated | ServerEvent::Unknown => None,
        ServerEvent::ResponseCreated => Some(AiEvent::ResponseStarted),
        ServerEvent::AudioDelta { delta } => Some(AiEvent::Audio(b64_decode(&delta)?)),
        ServerEvent::AssistantTranscript { transcript } => Some(AiEvent::Transcript {
            speaker: Speaker::Assistant,
            text: transcript,
        }),
        ServerEvent::CallerTranscript { transcript } => Some(AiEvent::Transcript {
            speaker: Speaker::Patient,
            text: transcript,
        }),
        ServerEvent::SpeechStarted => Some(AiEvent::SpeechStarted),
        ServerEvent::FunctionCallArguments {
            call_id,
            name,
            arguments,
        } => Some(AiEvent::ToolCall {
            exclusive: is_exclusive(&name),
            call_id,
            name,
            arguments,
        }),
        ServerEvent::ResponseDone => Some(AiEvent::ResponseDone),
        ServerEvent::Error { error } => Some(AiEvent::Error(match error.code {
            Some(code) => format!("{code}: {}", error.message),
            None => error.message,
        })),
    };
    Ok(mapped)
}

/// Task that turns realtime server events into bridge events until either side goes away.
pub async fn read_ai_leg(
    mut ai_stream: AiStream,
    from_ai: Arc<FrameQueue<AiEvent>>,
) -> Result<(), AppError> {
    let res = loop {
        match ai_stream.next().await {
            Some(Ok(tungstenite::Message::Text(json))) => {
                let event = match serde_json::from_str::<ServerEvent>(&json) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error=%e, "failed to parse realtime server event");
                        continue;
                    }
                };
                match to_ai_event(event) {
                    Ok(Some(event)) => {
                        if !from_ai.push(event) {
                            debug!("bridge closed the ai leg");
                            break Ok(());
                        }
                    }
                    Ok(None) => (),
                    Err(e) => warn!(error=%e, "dropping malformed realtime event"),
                }
            }
            Some(Ok(tungstenite::Message::Close(frame))) => {
                info!(frame=?frame, "realtime endpoint closed the connection");
                break Ok(());
            }
            Some(Ok(_)) => (),
            Some(Err(e)) => {
                error!(error=%e, "failed to receive message from realtime endpoint");
                break Err(AppError("realtime stream error"));
            }
            None => {
                info!("end of realtime stream");
                break Ok(());
            }
        }
    };
    from_ai.close();
    res
}

/// Task that forwards bridge commands to the realtime endpoint. Ends when the bridge closes
/// the queue.
pub async fn write_ai_leg(
    mut ai_sink: AiSink,
    to_ai: Arc<FrameQueue<AiCommand>>,
) -> Result<(), AppError> {
    while let Some(command) = to_ai.pop().await {
        let event = match command {
            AiCommand::Audio(frame) => ClientEvent::InputAudioAppend {
                audio: b64_encode(&frame),
            },
            AiCommand::ToolResult { call_id, output } => ClientEvent::ItemCreate {
                item: ConversationItem::FunctionCallOutput { call_id, output },
            },
            AiCommand::RequestResponse => ClientEvent::ResponseCreate,
        };
        if let Err(e) = send_event(&mut ai_sink, &event).await {
            to_ai.close();
            return Err(e);
        }
    }
    if let Err(e) = ai_sink.close().await {
        debug!(error=%e, "realtime sink already closed");
    }
    Ok(())
}
