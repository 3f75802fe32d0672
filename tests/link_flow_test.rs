// End-to-end linking flows against a scripted backend agent.

use std::sync::Arc;

use link_channel::channel::{ChannelEndpoint, duplex, namespace};
use link_channel::event::{AgentEvent, CredentialBundle, EventName};
use link_channel::test_util::{AgentAction, ScriptedAgent};
use nestlink::config::{MemoryConfigStore, PluginConfigRecord};
use nestlink::machine::{LinkingStep, MSG_ACCOUNT_NOT_FOUND, MSG_SERVER_DISCONNECTED};
use nestlink::session::{LinkSession, Notice, SessionError, open_session};
use serde_json::json;
use tokio::time::{Duration, timeout};

const PLUGIN: &str = "homebridge-nest-cam";
const ALIAS: &str = "Nest-cam";

fn new_session(
    config: Vec<PluginConfigRecord>,
    store: Arc<MemoryConfigStore>,
) -> (LinkSession, ChannelEndpoint) {
    let (client, agent) = duplex(&namespace(PLUGIN), 8);
    (LinkSession::new(PLUGIN, ALIAS, config, client, store), agent)
}

async fn next(session: &mut LinkSession) -> AgentEvent {
    timeout(Duration::from_secs(1), session.next_event())
        .await
        .expect("timed out waiting for an agent event")
        .expect("channel closed early")
}

#[tokio::test]
async fn test_full_link_flow_persists_credentials_once() {
    let store = MemoryConfigStore::new();
    let (mut session, agent_end) = new_session(Vec::new(), store.clone());

    let agent = ScriptedAgent::spawn(
        agent_end,
        vec![
            AgentAction::AwaitClient(EventName::LinkAccount),
            AgentAction::Emit(AgentEvent::Username),
            AgentAction::AwaitClient(EventName::Username),
            AgentAction::Emit(AgentEvent::Password),
            AgentAction::AwaitClient(EventName::Password),
            AgentAction::Emit(AgentEvent::Credentials(CredentialBundle::new("T", "C"))),
        ],
    );

    assert!(session.should_offer_linking());
    session.start_linking().await.unwrap();

    let event = next(&mut session).await;
    session.handle_event(event).await;
    assert_eq!(session.state().step, LinkingStep::Username);
    assert!(!session.state().waiting);
    session.submit_step("a@b.com").await.unwrap();
    assert!(session.state().waiting);

    let event = next(&mut session).await;
    session.handle_event(event).await;
    assert_eq!(session.state().step, LinkingStep::Password);
    session.submit_step("hunter2").await.unwrap();

    let event = next(&mut session).await;
    session.handle_event(event).await;

    assert_eq!(session.state().step, LinkingStep::None);
    assert!(!session.state().in_flight);
    assert!(!session.should_offer_linking());

    // persisted exactly once, with a one-element list and the exact bundle
    assert_eq!(store.save_count(PLUGIN), 1);
    let saved = store.last(PLUGIN).unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(
        serde_json::to_value(&saved[0]).unwrap(),
        json!({
            "platform": ALIAS,
            "googleAuth": { "issueToken": "T", "cookies": "C" }
        })
    );

    // the agent saw only the submitted fields
    let seen = agent.await.unwrap();
    let names: Vec<EventName> = seen.iter().map(|event| event.name).collect();
    assert_eq!(
        names,
        vec![EventName::LinkAccount, EventName::Username, EventName::Password]
    );
    assert_eq!(seen[1].payload, Some(json!({ "username": "a@b.com" })));
    assert_eq!(seen[2].payload, Some(json!({ "password": "hunter2" })));
}

#[tokio::test]
async fn test_rerequested_step_shows_the_retry_message() {
    let store = MemoryConfigStore::new();
    let (mut session, agent_end) = new_session(Vec::new(), store);

    let _agent = ScriptedAgent::spawn(
        agent_end,
        vec![
            AgentAction::AwaitClient(EventName::LinkAccount),
            AgentAction::Emit(AgentEvent::Username),
            AgentAction::Emit(AgentEvent::Username),
        ],
    );

    session.start_linking().await.unwrap();

    let event = next(&mut session).await;
    session.handle_event(event).await;
    assert_eq!(session.state().field_error, "");

    let event = next(&mut session).await;
    session.handle_event(event).await;
    assert_eq!(session.state().field_error, MSG_ACCOUNT_NOT_FOUND);
    assert_eq!(session.state().step, LinkingStep::Username);
}

#[tokio::test]
async fn test_configured_record_skips_linking_entirely() {
    let record: PluginConfigRecord = serde_json::from_value(json!({
        "platform": ALIAS,
        "googleAuth": { "issueToken": "T", "cookies": "C" }
    }))
    .unwrap();

    let store = MemoryConfigStore::new();
    let (session, agent_end) = new_session(vec![record], store.clone());

    assert!(session.already_configured());
    assert!(!session.should_offer_linking());
    assert_eq!(store.save_count(PLUGIN), 0);

    // no channel traffic happened
    let (_sender, mut agent_inbound) = agent_end.split();
    drop(session);
    let synthetic = agent_inbound.next().await.unwrap();
    assert_eq!(synthetic.name, EventName::Disconnect);
    assert!(agent_inbound.next().await.is_none());
}

#[tokio::test]
async fn test_unlink_then_fresh_start_retains_nothing() {
    let record: PluginConfigRecord = serde_json::from_value(json!({
        "platform": ALIAS,
        "googleAuth": { "issueToken": "T", "cookies": "C" }
    }))
    .unwrap();

    let store = MemoryConfigStore::new();
    let (mut session, agent_end) = new_session(vec![record], store.clone());
    let _agent = ScriptedAgent::spawn(
        agent_end,
        vec![AgentAction::AwaitClient(EventName::LinkAccount)],
    );
    let mut notices = session.notices();

    // break the configured state first
    session
        .handle_event(AgentEvent::ServerError(link_channel::event::ErrorPayload {
            message: "token refresh failed".into(),
        }))
        .await;
    assert!(session.state().error);

    session.unlink().await.unwrap();
    assert_eq!(store.last(PLUGIN), Some(vec![]));
    assert!(!session.already_configured());
    assert!(matches!(notices.try_recv(), Ok(Notice::ConfigSaved)));
    assert!(matches!(notices.try_recv(), Ok(Notice::CloseRequested)));

    session.start_linking().await.unwrap();
    let state = session.state();
    assert!(state.in_flight);
    assert!(!state.error);
    assert_eq!(state.field_error, "");
    assert_eq!(state.step, LinkingStep::None);
    assert!(session.record().google_auth.is_none());
}

#[tokio::test]
async fn test_manual_override_sends_exactly_one_cancel() {
    let store = MemoryConfigStore::new();
    let (mut session, agent_end) = new_session(Vec::new(), store.clone());

    let agent = ScriptedAgent::spawn(
        agent_end,
        vec![
            AgentAction::AwaitClient(EventName::LinkAccount),
            AgentAction::AwaitClient(EventName::Cancel),
        ],
    );

    session.start_linking().await.unwrap();
    session.link_manually().await.unwrap();

    assert!(!session.state().in_flight);
    assert_eq!(session.state().step, LinkingStep::None);
    assert!(session.already_configured());
    assert_eq!(store.save_count(PLUGIN), 0);

    let seen = agent.await.unwrap();
    let cancels = seen
        .iter()
        .filter(|event| event.name == EventName::Cancel)
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn test_transport_drop_mid_flight_surfaces_through_the_actor() {
    let store = MemoryConfigStore::new();
    let (session, agent_end) = new_session(Vec::new(), store);

    let agent = ScriptedAgent::spawn(
        agent_end,
        vec![
            AgentAction::AwaitClient(EventName::LinkAccount),
            AgentAction::Emit(AgentEvent::Username),
            AgentAction::DropTransport,
        ],
    );

    let mut handle = open_session(session);
    handle.start_linking().await.unwrap();

    let view = loop {
        let view = timeout(Duration::from_secs(1), handle.view_changed())
            .await
            .expect("timed out waiting for the error state")
            .unwrap();
        if view.state.error {
            break view;
        }
    };
    assert_eq!(view.state.error_message, MSG_SERVER_DISCONNECTED);
    assert!(!view.should_offer_linking);

    handle.close().await.unwrap();
    assert!(matches!(
        handle.start_linking().await,
        Err(SessionError::SessionGone)
    ));

    let _ = agent.await.unwrap();
}

#[tokio::test]
async fn test_full_flow_through_the_actor_handle() {
    let store = MemoryConfigStore::new();
    let (session, agent_end) = new_session(Vec::new(), store.clone());

    let _agent = ScriptedAgent::spawn(
        agent_end,
        vec![
            AgentAction::AwaitClient(EventName::LinkAccount),
            AgentAction::Emit(AgentEvent::Username),
            AgentAction::AwaitClient(EventName::Username),
            AgentAction::Emit(AgentEvent::Totp),
            AgentAction::AwaitClient(EventName::Totp),
            AgentAction::Emit(AgentEvent::Credentials(CredentialBundle::new("T", "C"))),
        ],
    );

    let mut handle = open_session(session);
    let mut notices = handle.notices();
    handle.start_linking().await.unwrap();

    for answer in ["a@b.com", "123456"] {
        loop {
            let view = timeout(Duration::from_secs(1), handle.view_changed())
                .await
                .expect("timed out waiting for a step")
                .unwrap();
            if view.state.step != LinkingStep::None && !view.state.waiting {
                break;
            }
        }
        handle.submit_step(answer).await.unwrap();
    }

    let view = loop {
        let view = timeout(Duration::from_secs(1), handle.view_changed())
            .await
            .expect("timed out waiting for completion")
            .unwrap();
        if view.config.first().is_some_and(|record| record.is_linked()) {
            break view;
        }
    };
    assert!(!view.state.in_flight);
    assert!(!view.should_offer_linking);
    assert_eq!(store.save_count(PLUGIN), 1);
    assert!(matches!(notices.recv().await, Ok(Notice::ConfigSaved)));

    handle.close().await.unwrap();
}
