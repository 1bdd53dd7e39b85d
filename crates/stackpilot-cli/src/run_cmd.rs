//! Implementation of the `stackpilot run` command.
//!
//! Starts the app, then follows one log sink until Ctrl-C or until the app
//! leaves the running state, and stops it on the way out.

use std::time::Duration;

use anyhow::{Result, bail};
use futures::StreamExt;
use tracing::info;

use stackpilot_core::Orchestrator;
use stackpilot_core::kernel::OutputStream;
use stackpilot_core::lifecycle::AppState;
use stackpilot_core::logs::{LogEvent, LogRole};
use stackpilot_core::provider::RunRequest;

/// How often the follow loop checks whether the app is still running.
const STATE_POLL: Duration = Duration::from_millis(500);

pub async fn run_and_follow(orchestrator: &Orchestrator, request: RunRequest, role: LogRole) -> Result<()> {
    let app_id = request.app_id;
    let result = orchestrator.run_app(request).await?;
    if !result.ready {
        for event in orchestrator.get_logs(app_id, LogRole::System) {
            eprintln!("{}", format_event(&event));
        }
        bail!(
            "app did not start: {}",
            result.error.as_deref().unwrap_or("no readiness signal")
        );
    }

    if let Some(pid) = result.process_id {
        info!(app_id, pid, "app running");
    }
    if let Some(url) = &result.url {
        println!("Preview at {url}");
    }
    println!("Following {} logs; press Ctrl-C to stop.", role_name(role));

    let stream = orchestrator.follow_logs(app_id, role);
    futures::pin_mut!(stream);
    let mut poll = tokio::time::interval(STATE_POLL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!(app_id, "interrupt received, stopping app");
                break;
            }
            event = stream.next() => match event {
                Some(event) => println!("{}", format_event(&event)),
                None => break,
            },
            _ = poll.tick() => {
                let state = orchestrator.app_state(app_id);
                if state != AppState::Running {
                    let snapshot = orchestrator.app_snapshot(app_id);
                    if state == AppState::Errored {
                        let reason = snapshot
                            .and_then(|s| s.last_error)
                            .unwrap_or_else(|| "unknown error".into());
                        bail!("app exited: {reason}");
                    }
                    println!("App exited.");
                    return Ok(());
                }
            }
        }
    }

    if let Some(code) = orchestrator.stop_app(app_id).await? {
        println!("App stopped (exit code {code}).");
    } else {
        println!("App stopped.");
    }
    Ok(())
}

fn role_name(role: LogRole) -> &'static str {
    match role {
        LogRole::System => "system",
        LogRole::Frontend => "frontend",
        LogRole::Backend => "backend",
    }
}

/// `[frontend] text`, with `!` marking stderr.
fn format_event(event: &LogEvent) -> String {
    let marker = match event.stream {
        OutputStream::Stdout => "",
        OutputStream::Stderr => "!",
    };
    format!("[{}{marker}] {}", role_name(event.role), event.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(role: LogRole, stream: OutputStream, text: &str) -> LogEvent {
        LogEvent {
            seq: 0,
            app_id: 1,
            role,
            stream,
            text: text.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn events_are_prefixed_with_their_origin() {
        assert_eq!(
            format_event(&event(LogRole::Backend, OutputStream::Stdout, "listening")),
            "[backend] listening"
        );
        assert_eq!(
            format_event(&event(LogRole::Frontend, OutputStream::Stderr, "warn")),
            "[frontend!] warn"
        );
    }
}
