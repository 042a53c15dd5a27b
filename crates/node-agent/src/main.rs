use std::sync::Arc;

use node_agent::{
    config,
    runner::{self, AgentOptions},
    runtime::{DynControlChannel, IpmiScript},
    session,
};
use tokio::io::BufReader;

/// Newline-delimited JSON on stdin/stdout: commands in; the startup report, status reports and
/// answers out. Logs go to stderr.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    let channel: DynControlChannel = Arc::new(IpmiScript::new(&cfg.ipmi, &cfg.host));
    let mut agent = runner::start_agent(cfg, channel, AgentOptions::default()).await?;

    let served = session::serve(
        &mut agent,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        runner::wait_for_shutdown_signal(),
    )
    .await;

    agent.shutdown().await?;
    served
}
