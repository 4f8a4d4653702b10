mod client {
    use serde::Serialize;
    use serde_json::Value;

    #[derive(Serialize, Debug)]
    #[serde(tag = "type")]
    pub enum ClientEvent {
        #[serde(rename = "session.update")]
        SessionUpdate { session: SessionSettings },
        #[serde(rename = "input_audio_buffer.append")]
        InputAudioAppend { audio: String },
        #[serde(rename = "conversation.item.create")]
        ItemCreate { item: ConversationItem },
        #[serde(rename = "response.create")]
        ResponseCreate,
    }

    #[derive(Serialize, Debug)]
    pub struct SessionSettings {
        #[serde(rename = "type")]
        pub kind: &'static str,
        pub instructions: String,
        pub tools: Value,
        pub tool_choice: &'static str,
        pub audio: AudioSettings,
    }

    #[derive(Serialize, Debug)]
    pub struct AudioSettings {
        pub input: AudioInput,
        pub output: AudioOutput,
    }

    #[derive(Serialize, Debug)]
    pub struct AudioInput {
        pub format: AudioFormat,
        pub turn_detection: TurnDetection,
        pub transcription: Transcription,
    }

    #[derive(Serialize, Debug)]
    pub struct AudioOutput {
        pub format: AudioFormat,
        pub voice: String,
    }

    #[derive(Serialize, Debug)]
    pub struct AudioFormat {
        #[serde(rename = "type")]
        pub kind: &'static str,
    }

    #[derive(Serialize, Debug)]
    pub struct TurnDetection {
        #[serde(rename = "type")]
        pub kind: &'static str,
    }

    #[derive(Serialize, Debug)]
    pub struct Transcription {
        pub model: &'static str,
    }

    #[derive(Serialize, Debug)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum ConversationItem {
        FunctionCallOutput { call_id: String, output: String },
    }
}
pub use client::*;

mod server {
    use serde::Deserialize;

    /// The subset of realtime server events the adapter acts on. Everything else lands in
    /// `Unknown`. Aliases cover the older beta event names.
    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(tag = "type")]
    pub enum ServerEvent {
        #[serde(rename = "session.created")]
        SessionCreated,
        #[serde(rename = "session.updated")]
        SessionUpdated,
        #[serde(rename = "response.created")]
        ResponseCreated,
        #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
        AudioDelta { delta: String },
        #[serde(
            rename = "response.output_audio_transcript.done",
            alias = "response.audio_transcript.done"
        )]
        AssistantTranscript { transcript: String },
        #[serde(rename = "conversation.item.input_audio_transcription.completed")]
        CallerTranscript { transcript: String },
        #[serde(rename = "input_audio_buffer.speech_started")]
        SpeechStarted,
        #[serde(rename = "response.function_call_arguments.done")]
        FunctionCallArguments {
            call_id: String,
            name: String,
            arguments: String,
        },
        #[serde(rename = "response.done")]
        ResponseDone,
        #[serde(rename = "error")]
        Error { error: ErrorDetail },
        #[serde(other)]
        Unknown,
    }

    #[derive(Deserialize, Debug, PartialEq)]
    pub struct ErrorDetail {
        #[serde(default)]
        pub code: Option<String>,
        pub message: String,
    }
}
pub use server::*;
