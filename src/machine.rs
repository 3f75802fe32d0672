use link_channel::event::{AgentEvent, CredentialBundle};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// User-facing strings the backend protocol implies but never sends.
pub const MSG_ACCOUNT_NOT_FOUND: &str = "Couldn't find your Google Account";
pub const MSG_WRONG_PASSWORD: &str = "Wrong password. Try again.";
pub const MSG_WRONG_CODE: &str = "Wrong code. Try again.";
pub const MSG_SERVER_DISCONNECTED: &str = "Server Disconnected.";
pub const MSG_LOGGING_IN: &str = "Logging in, please wait...";
pub const MSG_SETTING_UP: &str = "Setting things up, please wait...";

/// The single field the backend agent currently expects from the user.
/// `None` means no step is pending (idle, or the flow finished).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LinkingStep {
    #[default]
    None,
    Username,
    Password,
    Totp,
}

/// Validation rule for one input step, plus the message shown when the
/// agent re-requests the same step (its only way of saying "rejected").
pub struct StepRules {
    pub retry_message: &'static str,
    pub validate: fn(&str) -> Result<(), String>,
}

fn required(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err("a value is required for this step".to_string())
    } else {
        Ok(())
    }
}

static USERNAME_RULES: StepRules = StepRules {
    retry_message: MSG_ACCOUNT_NOT_FOUND,
    validate: required,
};
static PASSWORD_RULES: StepRules = StepRules {
    retry_message: MSG_WRONG_PASSWORD,
    validate: required,
};
static TOTP_RULES: StepRules = StepRules {
    retry_message: MSG_WRONG_CODE,
    validate: required,
};

/// Rules for each step that takes user input; `None` for the idle step.
pub fn step_rules(step: LinkingStep) -> Option<&'static StepRules> {
    match step {
        LinkingStep::None => None,
        LinkingStep::Username => Some(&USERNAME_RULES),
        LinkingStep::Password => Some(&PASSWORD_RULES),
        LinkingStep::Totp => Some(&TOTP_RULES),
    }
}

/// Side effect requested by a transition; the session controller runs it.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StoreCredentials(CredentialBundle),
}

/// Full state of one linking session.
///
/// Transitions never mutate in place: [`apply`](Self::apply) returns the
/// next state as one value, so observers always see a consistent whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionState {
    pub step: LinkingStep,
    /// A flow is active and further agent events are expected.
    pub in_flight: bool,
    /// Per-field message after the agent rejected the previous answer.
    pub field_error: String,
    pub waiting: bool,
    pub waiting_message: String,
    /// Terminal error for the active flow.
    pub error: bool,
    pub error_message: String,
}

impl SessionState {
    pub fn idle() -> Self {
        Self {
            step: LinkingStep::None,
            in_flight: false,
            field_error: String::new(),
            waiting: false,
            waiting_message: String::new(),
            error: false,
            error_message: String::new(),
        }
    }

    /// Apply one inbound agent event and return the next state.
    ///
    /// Re-requesting the step that is already pending is the agent's only
    /// rejection signal; the second request carries the step's retry
    /// message. `browser_closed` and `disconnect` only matter while a flow
    /// is in flight; `server_error` always applies.
    pub fn apply(&self, event: &AgentEvent) -> (SessionState, Option<Effect>) {
        let mut next = self.clone();
        let mut effect = None;

        match event {
            AgentEvent::Username => {
                self.request_step(&mut next, LinkingStep::Username);
                next.waiting_message = MSG_LOGGING_IN.to_string();
            }
            AgentEvent::Password => {
                self.request_step(&mut next, LinkingStep::Password);
            }
            AgentEvent::Totp => {
                self.request_step(&mut next, LinkingStep::Totp);
            }
            AgentEvent::Credentials(bundle) => {
                next.step = LinkingStep::None;
                next.waiting = false;
                next.in_flight = false;
                effect = Some(Effect::StoreCredentials(bundle.clone()));
            }
            AgentEvent::ServerError(payload) => {
                next.error = true;
                next.error_message = payload.message.clone();
            }
            AgentEvent::BrowserClosed(payload) => {
                if self.in_flight {
                    next.error = true;
                    next.error_message = payload.message.clone();
                }
            }
            AgentEvent::Disconnect => {
                if self.in_flight {
                    next.error = true;
                    next.error_message = MSG_SERVER_DISCONNECTED.to_string();
                }
            }
        }

        (next, effect)
    }

    fn request_step(&self, next: &mut SessionState, step: LinkingStep) {
        next.field_error = if self.step == step {
            step_rules(step)
                .map(|rules| rules.retry_message.to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };
        next.step = step;
        next.waiting = false;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::idle()
    }
}
