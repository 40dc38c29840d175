use crate::error::BridgeError;
use crate::peer::types::{from_json_ci, IceCandidate, SessionDescription};
use serde::Serialize;

pub const ACTION_OFFER: &str = "offer";
pub const ACTION_ANSWER: &str = "answer";
pub const ACTION_ICE_CANDIDATE: &str = "ice-candidate";
pub const ACTION_ERROR: &str = "error";
pub const ACTION_STATE: &str = "state";

/// Сообщение shim -> native.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Error(String),
    /// ICE connection state as reported by the media engine (`connected`, `failed`...)
    ConnectionState(String),
}

/// Команда native -> shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimCommand {
    CreateOffer,
    /// Answer the given offer, or the one already applied when `None`
    CreateAnswer(Option<SessionDescription>),
    /// Set remote offer and answer it right away
    ApplyOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    ApplyIceCandidate(IceCandidate),
    ToggleAudio,
    ToggleVideo,
    Close,
}

impl ShimCommand {
    /// Page-script entry point name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ShimCommand::CreateOffer => "createOffer",
            ShimCommand::CreateAnswer(_) => "createAnswer",
            ShimCommand::ApplyOffer(_) => "receiveOffer",
            ShimCommand::ApplyAnswer(_) => "receiveAnswer",
            ShimCommand::ApplyIceCandidate(_) => "receiveIceCandidate",
            ShimCommand::ToggleAudio => "toggleMute",
            ShimCommand::ToggleVideo => "toggleCamera",
            ShimCommand::Close => "closeConnection",
        }
    }
}

impl NegotiationMessage {
    pub fn action(&self) -> &'static str {
        match self {
            NegotiationMessage::Offer(_) => ACTION_OFFER,
            NegotiationMessage::Answer(_) => ACTION_ANSWER,
            NegotiationMessage::IceCandidate(_) => ACTION_ICE_CANDIDATE,
            NegotiationMessage::Error(_) => ACTION_ERROR,
            NegotiationMessage::ConnectionState(_) => ACTION_STATE,
        }
    }

    /// Offer, answer and candidates go on to the remote participant.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            NegotiationMessage::Offer(_)
                | NegotiationMessage::Answer(_)
                | NegotiationMessage::IceCandidate(_)
        )
    }

    /// `scheme://action/<percent-encoded json>`
    pub fn encode_url(&self, scheme: &str) -> Result<String, BridgeError> {
        let json = match self {
            NegotiationMessage::Offer(d) | NegotiationMessage::Answer(d) => to_json(d)?,
            NegotiationMessage::IceCandidate(c) => to_json(c)?,
            NegotiationMessage::Error(text) | NegotiationMessage::ConnectionState(text) => {
                to_json(text)?
            }
        };
        Ok(format!(
            "{scheme}://{}/{}",
            self.action(),
            urlencoding::encode(&json)
        ))
    }

    pub fn decode_url(scheme: &str, url: &str) -> Result<Self, BridgeError> {
        let rest = strip_scheme(scheme, url)
            .ok_or_else(|| BridgeError::Malformed(format!("not a {scheme}:// url")))?;
        let (action, payload) = rest.split_once('/').unwrap_or((rest, ""));
        let data = urlencoding::decode(payload)
            .map_err(|e| BridgeError::Malformed(format!("bad percent-encoding: {e}")))?;

        match action {
            ACTION_OFFER => Ok(NegotiationMessage::Offer(from_json_ci(&data)?)),
            ACTION_ANSWER => Ok(NegotiationMessage::Answer(from_json_ci(&data)?)),
            ACTION_ICE_CANDIDATE => Ok(NegotiationMessage::IceCandidate(from_json_ci(&data)?)),
            ACTION_ERROR => Ok(NegotiationMessage::Error(text_payload(&data))),
            ACTION_STATE => Ok(NegotiationMessage::ConnectionState(text_payload(&data))),
            other => Err(BridgeError::UnknownAction(other.to_owned())),
        }
    }
}

/// Case-insensitive `scheme://` prefix check; returns what follows it.
pub fn strip_scheme<'a>(scheme: &str, url: &'a str) -> Option<&'a str> {
    let name = url.get(..scheme.len())?;
    let rest = url.get(scheme.len()..)?.strip_prefix("://")?;
    name.eq_ignore_ascii_case(scheme).then_some(rest)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, BridgeError> {
    serde_json::to_string(value).map_err(|e| BridgeError::Malformed(e.to_string()))
}

// Страница шлёт JSON.stringify(строки), но принимаем и голый текст
fn text_payload(data: &str) -> String {
    serde_json::from_str::<String>(data).unwrap_or_else(|_| data.to_owned())
}
