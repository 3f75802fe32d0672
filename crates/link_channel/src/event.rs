use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::ChannelError;

/// Every event name that crosses a linking channel, in either direction.
///
/// The string forms are the wire protocol; the backend agent matches on
/// them verbatim, so the spellings here must never drift.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    #[strum(serialize = "link-account")]
    #[serde(rename = "link-account")]
    LinkAccount,
    Cancel,
    Username,
    Password,
    Totp,
    Credentials,
    ServerError,
    BrowserClosed,
    Disconnect,
}

/// One named event on the linking channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LinkEvent {
    /// Unique id (UUID).
    pub id: String,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    pub name: EventName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl LinkEvent {
    /// Event carrying no payload.
    pub fn bare(name: EventName) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            name,
            payload: None,
        }
    }

    pub fn with_payload(name: EventName, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::bare(name)
        }
    }
}

/// Credentials issued by the backend agent after a successful login.
///
/// Unknown fields are kept verbatim so the bundle survives the round trip
/// into the config editor untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialBundle {
    pub fn new(issue_token: impl Into<String>, cookies: impl Into<String>) -> Self {
        Self {
            issue_token: Some(issue_token.into()),
            cookies: Some(cookies.into()),
            extra: Map::new(),
        }
    }

    /// Both required sub-fields present means the account counts as linked.
    pub fn is_complete(&self) -> bool {
        self.issue_token.is_some() && self.cookies.is_some()
    }
}

/// Message attached to `server_error` and `browser_closed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorPayload {
    pub message: String,
}

/// The single pending field the user filled in, keyed the way the agent
/// expects it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct StepSubmission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp: Option<String>,
}

impl StepSubmission {
    pub fn username(value: impl Into<String>) -> Self {
        Self {
            username: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn password(value: impl Into<String>) -> Self {
        Self {
            password: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn totp(value: impl Into<String>) -> Self {
        Self {
            totp: Some(value.into()),
            ..Self::default()
        }
    }
}

/// Typed view of the events the backend agent pushes to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Username,
    Password,
    Totp,
    Credentials(CredentialBundle),
    ServerError(ErrorPayload),
    BrowserClosed(ErrorPayload),
    Disconnect,
}

impl AgentEvent {
    pub fn name(&self) -> EventName {
        match self {
            AgentEvent::Username => EventName::Username,
            AgentEvent::Password => EventName::Password,
            AgentEvent::Totp => EventName::Totp,
            AgentEvent::Credentials(_) => EventName::Credentials,
            AgentEvent::ServerError(_) => EventName::ServerError,
            AgentEvent::BrowserClosed(_) => EventName::BrowserClosed,
            AgentEvent::Disconnect => EventName::Disconnect,
        }
    }

    pub fn into_event(self) -> Result<LinkEvent, ChannelError> {
        let event = match self {
            AgentEvent::Username => LinkEvent::bare(EventName::Username),
            AgentEvent::Password => LinkEvent::bare(EventName::Password),
            AgentEvent::Totp => LinkEvent::bare(EventName::Totp),
            AgentEvent::Credentials(bundle) => {
                LinkEvent::with_payload(EventName::Credentials, serde_json::to_value(bundle)?)
            }
            AgentEvent::ServerError(payload) => {
                LinkEvent::with_payload(EventName::ServerError, serde_json::to_value(payload)?)
            }
            AgentEvent::BrowserClosed(payload) => {
                LinkEvent::with_payload(EventName::BrowserClosed, serde_json::to_value(payload)?)
            }
            AgentEvent::Disconnect => LinkEvent::bare(EventName::Disconnect),
        };
        Ok(event)
    }
}

fn required_payload<T: DeserializeOwned>(event: &LinkEvent) -> Result<T, ChannelError> {
    let value = event
        .payload
        .clone()
        .ok_or_else(|| ChannelError::MissingPayload(event.name.to_string()))?;
    Ok(serde_json::from_value(value)?)
}

impl TryFrom<&LinkEvent> for AgentEvent {
    type Error = ChannelError;

    fn try_from(event: &LinkEvent) -> Result<Self, Self::Error> {
        match event.name {
            EventName::Username => Ok(AgentEvent::Username),
            EventName::Password => Ok(AgentEvent::Password),
            EventName::Totp => Ok(AgentEvent::Totp),
            EventName::Credentials => Ok(AgentEvent::Credentials(required_payload(event)?)),
            EventName::ServerError => Ok(AgentEvent::ServerError(required_payload(event)?)),
            EventName::BrowserClosed => Ok(AgentEvent::BrowserClosed(required_payload(event)?)),
            EventName::Disconnect => Ok(AgentEvent::Disconnect),
            other => Err(ChannelError::UnexpectedEvent(other.to_string())),
        }
    }
}

/// Typed view of the events the client sends to the backend agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LinkAccount,
    Cancel,
    Username(StepSubmission),
    Password(StepSubmission),
    Totp(StepSubmission),
}

impl ClientEvent {
    pub fn name(&self) -> EventName {
        match self {
            ClientEvent::LinkAccount => EventName::LinkAccount,
            ClientEvent::Cancel => EventName::Cancel,
            ClientEvent::Username(_) => EventName::Username,
            ClientEvent::Password(_) => EventName::Password,
            ClientEvent::Totp(_) => EventName::Totp,
        }
    }

    pub fn into_event(self) -> Result<LinkEvent, ChannelError> {
        let event = match self {
            ClientEvent::LinkAccount => LinkEvent::bare(EventName::LinkAccount),
            ClientEvent::Cancel => LinkEvent::bare(EventName::Cancel),
            ClientEvent::Username(fields) => {
                LinkEvent::with_payload(EventName::Username, serde_json::to_value(fields)?)
            }
            ClientEvent::Password(fields) => {
                LinkEvent::with_payload(EventName::Password, serde_json::to_value(fields)?)
            }
            ClientEvent::Totp(fields) => {
                LinkEvent::with_payload(EventName::Totp, serde_json::to_value(fields)?)
            }
        };
        Ok(event)
    }
}
