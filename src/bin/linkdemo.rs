use clap::Parser;
use link_channel::channel::{duplex, namespace};
use link_channel::event::{AgentEvent, CredentialBundle, EventName};
use link_channel::test_util::{AgentAction, ScriptedAgent};
use nestlink::config::MemoryConfigStore;
use nestlink::logger::init_tracing;
use nestlink::machine::LinkingStep;
use nestlink::session::{LinkSession, open_session};
use tracing::info;

/// Drive a scripted account-linking flow end to end and print the
/// configuration the flow would persist.
#[derive(Parser, Debug)]
#[command(name = "linkdemo", about = "Drive a scripted account-linking flow end to end")]
struct Cli {
    /// Plugin identifier used for the channel namespace and persistence key
    #[arg(long, default_value = "homebridge-nest-cam")]
    plugin: String,

    /// `platform` discriminator written into the config record
    #[arg(long, default_value = "Nest-cam")]
    alias: String,

    /// Log level when RUST_LOG is not set (e.g. error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, None)?;

    let (client_end, agent_end) = duplex(&namespace(&cli.plugin), 16);
    let agent = ScriptedAgent::spawn(
        agent_end,
        vec![
            AgentAction::AwaitClient(EventName::LinkAccount),
            AgentAction::Emit(AgentEvent::Username),
            AgentAction::AwaitClient(EventName::Username),
            AgentAction::Emit(AgentEvent::Password),
            AgentAction::AwaitClient(EventName::Password),
            AgentAction::Emit(AgentEvent::Totp),
            AgentAction::AwaitClient(EventName::Totp),
            AgentAction::Emit(AgentEvent::Credentials(CredentialBundle::new(
                "demo-issue-token",
                "demo-cookies",
            ))),
        ],
    );

    let store = MemoryConfigStore::new();
    let session = LinkSession::new(&cli.plugin, &cli.alias, Vec::new(), client_end, store.clone());
    let mut handle = open_session(session);

    handle.start_linking().await?;
    for answer in ["demo@example.com", "demo-password", "123456"] {
        // wait until the agent asks for the next field
        loop {
            let view = handle.view_changed().await?;
            if view.state.step != LinkingStep::None && !view.state.waiting {
                info!(step = ?view.state.step, "agent requested a field");
                break;
            }
        }
        handle.submit_step(answer).await?;
    }

    // wait for the terminal credentials transition
    loop {
        let view = handle.view_changed().await?;
        if view.config.first().is_some_and(|record| record.is_linked()) {
            break;
        }
    }

    let saved = store.last(&cli.plugin).unwrap_or_default();
    info!(
        config = %serde_json::to_string_pretty(&saved)?,
        "account linked, configuration saved"
    );

    handle.close().await?;
    let _ = agent.await?;
    Ok(())
}
