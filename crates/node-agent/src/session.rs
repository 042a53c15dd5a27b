//! Newline-delimited JSON session with the management server.
//!
//! Commands arrive one per line; the startup report, status reports and answers leave one per
//! line. Each command runs on its own task so status reports keep flowing and a shutdown can
//! reach a power-off that is still escalating.

use std::future::Future;

use common::api::{AgentCommand, Answer};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::runner::AgentHandle;
use crate::telemetry;

/// Command name reported when a line carries no readable `type`.
pub const UNKNOWN_COMMAND: &str = "unknown";

/// Drive `agent` from `input` until the stream closes or `shutdown` resolves.
///
/// On shutdown the agent's shutdown signal is raised before in-flight commands are drained,
/// so a stop between escalation rounds answers as cancelled. Every in-flight command is
/// answered before this returns; the agent's own tasks are left for the caller to await.
pub async fn serve<R, W, S>(
    agent: &mut AgentHandle,
    input: R,
    mut output: W,
    shutdown: S,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    write_line(&mut output, agent.startup_report()).await?;

    let commands = agent.commands();
    let mut reports = agent
        .take_reports()
        .ok_or_else(|| anyhow::anyhow!("status reports already taken"))?;
    let mut lines = input.lines();
    let mut in_flight: JoinSet<Answer> = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(in_flight = in_flight.len(), "shutdown signal received");
                agent.request_shutdown();
                break;
            }
            Some(report) = reports.recv() => {
                write_line(&mut output, &report).await?;
            }
            Some(joined) = in_flight.join_next() => {
                if let Some(answer) = finished(joined) {
                    write_line(&mut output, &answer).await?;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!(in_flight = in_flight.len(), "command stream closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode(&line) {
                    Ok(command) => {
                        let commands = commands.clone();
                        in_flight.spawn(async move { commands.handle(command).await });
                    }
                    Err(answer) => write_line(&mut output, &answer).await?,
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Some(answer) = finished(joined) {
            write_line(&mut output, &answer).await?;
        }
    }
    Ok(())
}

/// Decode one command line, or build the failed answer the sender is owed.
pub fn decode(line: &str) -> Result<AgentCommand, Answer> {
    serde_json::from_str::<AgentCommand>(line).map_err(|err| {
        let command = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("type")?.as_str().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_COMMAND.to_string());
        warn!(%err, command = %command, "rejecting malformed command");
        telemetry::record_command_result("malformed", false);
        Answer::rejected(command, format!("malformed command: {err}"))
    })
}

fn finished(joined: Result<Answer, JoinError>) -> Option<Answer> {
    match joined {
        Ok(answer) => Some(answer),
        Err(err) => {
            error!(?err, "command task did not complete");
            None
        }
    }
}

async fn write_line<W, T>(output: &mut W, value: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
