use tokio::task::JoinHandle;
use tracing::warn;

use crate::channel::ChannelEndpoint;
use crate::event::{AgentEvent, EventName, LinkEvent};

/// One step of a scripted backend agent.
#[derive(Debug, Clone)]
pub enum AgentAction {
    /// Wait for the next client event and check its name.
    AwaitClient(EventName),
    /// Push an event to the client.
    Emit(AgentEvent),
    /// Drop the transport, as a crashed or killed agent would.
    DropTransport,
}

/// Stand-in for the browser-automation agent.
///
/// Plays a fixed script against the agent-side endpoint and returns every
/// client event it observed, so tests and demos can assert on the exact
/// outbound traffic. The script stops early on any surprise: an unexpected
/// event name, a closed transport, or a failed emit.
pub struct ScriptedAgent;

impl ScriptedAgent {
    pub fn spawn(endpoint: ChannelEndpoint, script: Vec<AgentAction>) -> JoinHandle<Vec<LinkEvent>> {
        tokio::spawn(async move {
            let (sender, mut inbound) = endpoint.split();
            let mut seen = Vec::new();
            for action in script {
                match action {
                    AgentAction::AwaitClient(expected) => match inbound.next().await {
                        Some(event) => {
                            let name = event.name;
                            seen.push(event);
                            if name != expected {
                                warn!(%name, %expected, "scripted agent got an unexpected event, stopping");
                                break;
                            }
                        }
                        None => break,
                    },
                    AgentAction::Emit(event) => {
                        let outcome = match event.into_event() {
                            Ok(event) => sender.send(event).await,
                            Err(err) => Err(err),
                        };
                        if let Err(err) = outcome {
                            warn!(error = %err, "scripted agent could not emit, stopping");
                            break;
                        }
                    }
                    AgentAction::DropTransport => break,
                }
            }
            seen
        })
    }
}
