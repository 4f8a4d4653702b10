use crate::bridge::{TelephonyCommand, TelephonyEvent};
use crate::error::AppError;
use crate::queue::FrameQueue;
use crate::twilio_api::TwilioApi;
use crate::twilio_types::{
    OutboundMarkMeta, OutboundMediaMeta, StartMeta, TwilioMessage, TwilioOutbound,
};
use crate::utils::{b64_decode, b64_encode};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Capture the Twilio Start media message from the beginning of a Twilio websocket stream.
pub async fn get_twilio_start_meta(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta, AppError> {
    loop {
        match twilio_stream.next().await {
            Some(Ok(Message::Text(json))) => match serde_json::from_str(&json) {
                Ok(TwilioMessage::Connected { protocol, version }) => {
                    trace!("Got connected message with {protocol} and {version}");
                }
                Ok(TwilioMessage::Start { start, .. }) => break Ok(start),
                Ok(_) => {
                    break Err(AppError(
                        "expected a Connected or Start message at the beginning of the stream",
                    ));
                }
                Err(e) => {
                    error!(error=%e, "failed to deserialize Twilio text message");
                    break Err(AppError("Error deserializing twilio text message"));
                }
            },
            Some(Ok(Message::Ping(_))) => (),
            Some(Ok(_)) => {
                break Err(AppError(
                    "Got unexpected websocket message type from Twilio!",
                ));
            }
            Some(Err(e)) => {
                error!(error=%e, "failed to receive message from Twilio");
                break Err(AppError("Failed to receive message from Twilio stream"));
            }
            None => break Err(AppError("End of stream")),
        }
    }
}

fn to_telephony_event(message: TwilioMessage) -> Result<TelephonyEvent, AppError> {
    match message {
        TwilioMessage::Media { media, .. } => {
            Ok(TelephonyEvent::Audio(b64_decode(&media.payload)?))
        }
        TwilioMessage::Mark { mark, .. } => Ok(TelephonyEvent::Mark(mark.name)),
        TwilioMessage::Stop {
            sequence_number, ..
        } => {
            debug!("Got stop message {sequence_number}");
            Ok(TelephonyEvent::Stop)
        }
        TwilioMessage::Connected { .. } | TwilioMessage::Start { .. } => Err(AppError(
            "We should not be getting Connected or Start messages now!",
        )),
    }
}

/// Task that forwards caller audio and stream events from Twilio into the bridge.
pub async fn read_telephony_leg(
    mut twilio_stream: SplitStream<WebSocket>,
    from_telephony: Arc<FrameQueue<TelephonyEvent>>,
) -> Result<(), AppError> {
    let res = loop {
        match twilio_stream.next().await {
            Some(Ok(Message::Text(json))) => {
                let message = match serde_json::from_str::<TwilioMessage>(&json) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(error=%e, "failed to parse Twilio text message");
                        break Err(AppError("Failed to parse incoming text message"));
                    }
                };
                match to_telephony_event(message) {
                    Ok(event) => {
                        let stop = event == TelephonyEvent::Stop;
                        if !from_telephony.push(event) {
                            debug!("bridge closed the telephony leg");
                            break Ok(());
                        }
                        if stop {
                            break Ok(());
                        }
                    }
                    Err(e) => warn!(error=%e, "dropping twilio message"),
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => (),
            Some(Ok(Message::Close(_))) => {
                info!("twilio closed the media stream");
                break Ok(());
            }
            Some(Ok(m)) => {
                warn!(message=?m, "unsupported message type from Twilio");
            }
            Some(Err(e)) => {
                error!(error=%e, "failed to receive message from Twilio");
                break Err(AppError("Failed to receive message from Twilio stream"));
            }
            None => {
                info!("end of twilio stream");
                break Ok(());
            }
        }
    };
    from_telephony.close();
    res
}

/// Task that plays bridge output to the caller. A `Hangup` ends the call through the REST
/// API, which also tears the media stream down.
pub async fn write_telephony_leg(
    mut twilio_sink: SplitSink<WebSocket, Message>,
    to_telephony: Arc<FrameQueue<TelephonyCommand>>,
    stream_sid: String,
    call_sid: String,
    twilio_api: TwilioApi,
) -> Result<(), AppError> {
    while let Some(command) = to_telephony.pop().await {
        let outbound = match command {
            TelephonyCommand::Audio(frame) => TwilioOutbound::Media {
                media: OutboundMediaMeta {
                    payload: b64_encode(&frame),
                },
                stream_sid: stream_sid.clone(),
            },
            TelephonyCommand::Clear => TwilioOutbound::Clear {
                stream_sid: stream_sid.clone(),
            },
            TelephonyCommand::Mark(name) => TwilioOutbound::Mark {
                mark: OutboundMarkMeta { name },
                stream_sid: stream_sid.clone(),
            },
            TelephonyCommand::Hangup => {
                info!(call_sid=%call_sid, "hanging up");
                if let Err(e) = twilio_api.end_call(&call_sid).await {
                    warn!(error=%e, call_sid=%call_sid, "hangup failed, closing the stream instead");
                    break;
                }
                continue;
            }
        };
        let json = serde_json::to_string(&outbound).map_err(|e| {
            error!(error=%e, "failed to serialize Twilio outbound message");
            AppError("twilio serialization error")
        })?;
        if let Err(e) = twilio_sink.send(Message::Text(json)).await {
            error!(error=%e, "failed to send message to Twilio");
            to_telephony.close();
            return Err(AppError("Failed to send message to Twilio stream"));
        }
    }
    if let Err(e) = twilio_sink.close().await {
        debug!(error=%e, "twilio sink already closed");
    }
    Ok(())
}
