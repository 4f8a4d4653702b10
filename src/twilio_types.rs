pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

/// The TwiML subset the voice webhook answers with.
mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Connect")]
        Connect(ConnectAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct ConnectAction {
        #[xmlserde(ty = "untag")]
        pub connection: Connection,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum Connection {
        #[xmlserde(name = b"Stream")]
        Stream(StreamAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamAction {
        #[xmlserde(name = b"url", ty = "attr")]
        pub url: String,
        #[xmlserde(name = b"name", ty = "attr")]
        pub name: Option<String>,
        #[xmlserde(name = b"track", ty = "attr")]
        pub track: Option<StreamTrack>,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        StreamTrack {
            Inbound => "inbound_track",
            Outbound => "outbound_track",
            Both => "both_tracks",
        }
    }
}
pub use twiml::*;

/// Twilio Media Streams websocket messages.
mod ws {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioOutbound {
        Media {
            media: OutboundMediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Mark {
            mark: OutboundMarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Clear {
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    /// Base64 µ-law, 8 kHz mono.
    #[derive(Serialize, Debug)]
    pub struct OutboundMediaMeta {
        pub payload: String,
    }

    #[derive(Serialize, Debug)]
    pub struct OutboundMarkMeta {
        pub name: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioMessage {
        Connected {
            protocol: String,
            version: String,
        },
        Start {
            start: StartMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            media: MediaMeta,
        },
        Mark {
            mark: MarkMeta,
        },
        Stop {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            stop: StopMeta,
        },
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct StartMeta {
        pub stream_sid: String,
        pub account_sid: String,
        pub call_sid: String,
        #[serde(default)]
        pub tracks: Vec<String>,
        /// `<Parameter>` values set on the `<Stream>` noun.
        #[serde(default)]
        pub custom_parameters: HashMap<String, String>,
        pub media_format: MediaFormat,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct MediaFormat {
        pub encoding: String,
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[derive(Deserialize, Debug)]
    pub struct MediaMeta {
        #[serde(default)]
        pub track: Option<String>,
        pub payload: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct StopMeta {
        pub account_sid: String,
        pub call_sid: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct MarkMeta {
        pub name: String,
    }
}
pub use ws::*;

mod connect {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallStatus {
        Queued,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    impl CallDirection {
        pub fn is_outbound(self) -> bool {
            !matches!(self, CallDirection::Inbound)
        }
    }

    /// Form body of the voice webhook Twilio posts when a call connects.
    #[allow(dead_code)]
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TwilioConnectPayload {
        pub account_sid: String,
        pub call_sid: String,
        pub call_status: CallStatus,
        pub direction: CallDirection,
        pub from: String,
        pub to: String,
        pub caller: Option<String>,
        pub called: Option<String>,
    }

    /// Call resource from the Twilio REST API.
    #[allow(dead_code)]
    #[derive(Deserialize, Debug)]
    pub struct CallDetails {
        pub sid: String,
        pub from: String,
        pub to: String,
        pub direction: CallDirection,
        pub status: CallStatus,
    }
}
pub use connect::*;
