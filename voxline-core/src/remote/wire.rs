//! JSON message shapes of the live voice endpoint.
//!
//! Only the fields the call pipeline reads or writes are modelled; unknown
//! fields are ignored on input. Both directions serialize and parse, so an
//! in-process endpoint such as the loopback connector can speak the same
//! frames a network connector would.

use serde::{Deserialize, Serialize};

use crate::buffering::AudioFormat;
use crate::error::Result;
use crate::remote::{InboundEvent, SessionRequest, LIVE_MODEL};

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Inline binary payload, base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl Blob {
    /// Sample rate from a `audio/pcm;rate=<hz>` descriptor, if present.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl ClientMessage {
    /// Opening message for a session.
    pub fn setup(request: &SessionRequest) -> Self {
        let system_instruction = (!request.system_prompt.trim().is_empty()).then(|| Content {
            parts: vec![Part {
                text: Some(request.system_prompt.clone()),
                inline_data: None,
            }],
        });

        ClientMessage::Setup(Setup {
            model: format!("models/{LIVE_MODEL}"),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: request.voice.api_name().to_string(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    /// One captured frame, already encoded.
    pub fn audio(data: String, format: AudioFormat) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: format.mime_type(),
                data,
            }],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub turn_complete: bool,
}

impl ServerMessage {
    /// Handshake acknowledgement.
    pub fn setup_complete() -> Self {
        Self {
            setup_complete: Some(serde_json::Value::Object(Default::default())),
            server_content: None,
        }
    }

    /// One chunk of model audio.
    pub fn audio(data: String, format: AudioFormat) -> Self {
        Self {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(Blob {
                            mime_type: format.mime_type(),
                            data,
                        }),
                    }],
                }),
                ..ServerContent::default()
            }),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into call events. Audio parts come first, then the
    /// interruption flag, then turn completion.
    pub fn into_events(self) -> Vec<InboundEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };

        let mut events: Vec<InboundEvent> = content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.inline_data)
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
            .map(|blob| InboundEvent::Audio { data: blob.data })
            .collect();

        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
        events
    }
}

/// Parse one server frame into call events.
pub fn parse_server_message(text: &str) -> Result<Vec<InboundEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    Ok(message.into_events())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Voice;

    #[test]
    fn setup_carries_voice_modality_and_prompt() {
        let request = SessionRequest {
            voice: Voice::Kore,
            system_prompt: "be brief".into(),
            input_format: AudioFormat::OUTBOUND,
            output_format: AudioFormat::INBOUND,
        };
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&request).to_json().unwrap()).unwrap();

        let setup = &json["setup"];
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "be brief");
    }

    #[test]
    fn audio_message_tags_mime_type() {
        let json: serde_json::Value = serde_json::from_str(
            &ClientMessage::audio("AAAA".into(), AudioFormat::OUTBOUND)
                .to_json()
                .unwrap(),
        )
        .unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAA");
    }

    #[test]
    fn audio_precedes_interruption_in_one_message() {
        let raw = r#"{
            "serverContent": {
                "interrupted": true,
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } },
                    { "text": "ignored" }
                ] }
            }
        }"#;
        let events = parse_server_message(raw).unwrap();
        assert_eq!(
            events,
            vec![
                InboundEvent::Audio {
                    data: "AAA=".into()
                },
                InboundEvent::Interrupted,
            ]
        );
    }

    #[test]
    fn setup_complete_yields_no_events() {
        let message: ServerMessage = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert!(message.is_setup_complete());
        assert!(message.into_events().is_empty());
    }

    #[test]
    fn rate_is_read_from_mime_descriptor() {
        let blob = Blob {
            mime_type: "audio/pcm; rate=24000".into(),
            data: String::new(),
        };
        assert_eq!(blob.sample_rate(), Some(24_000));
        let bare = Blob {
            mime_type: "audio/pcm".into(),
            data: String::new(),
        };
        assert_eq!(bare.sample_rate(), None);
    }

    #[test]
    fn server_audio_frame_parses_back_to_one_event() {
        let json = ServerMessage::audio("AAA=".into(), AudioFormat::INBOUND)
            .to_json()
            .unwrap();
        assert!(!json.contains("interrupted"));
        assert_eq!(
            parse_server_message(&json).unwrap(),
            vec![InboundEvent::Audio {
                data: "AAA=".into()
            }]
        );
    }

    #[test]
    fn turn_complete_is_reported() {
        let events = parse_server_message(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert_eq!(events, vec![InboundEvent::TurnComplete]);
    }
}
