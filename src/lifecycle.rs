//! Lifecycle & Cleanup (C9).
//!
//! Launcher spawn/attach, bounded wait for the engine to connect, and
//! child-process auto-attach event shaping. Grounded on
//! `backend-manager::backend_manager::start_replay_raw`'s
//! spawn-then-bind-then-accept flow and its crash-detection cleanup style.

use crate::config::Configuration;
use crate::dap_types::ChildProcessEventBody;
use crate::error::{AdapterError, Result};
use crate::transport::{Connection, Listener};
use std::path::PathBuf;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Result of spawning an external engine process and waiting for it to
/// connect back over the chosen transport.
pub struct ExternalLaunch {
    pub listener: Listener,
    pub child: Child,
}

/// Opens the transport listener described by `cfg`, spawns the debuggee
/// process with flags describing how to connect back, and waits (bounded by
/// `cfg.connect_timeout`) for the engine to connect. On timeout the child is
/// killed and `launch` fails, matching SPEC_FULL.md §4.9.
pub async fn spawn_external(cfg: &Configuration, launch_exe: &str) -> Result<(ExternalLaunch, Connection)> {
    let endpoint = cfg
        .endpoint
        .clone()
        .unwrap_or_else(|| default_endpoint(cfg));

    let listener = match cfg.transport {
        crate::config::TransportKind::Unix | crate::config::TransportKind::Pipe => {
            Listener::bind_unix(PathBuf::from(&endpoint))?
        }
        crate::config::TransportKind::Tcp => Listener::bind_tcp(&endpoint).await?,
    };

    let mut cmd = Command::new(launch_exe);
    cmd.arg("--endpoint").arg(&endpoint);
    if let Some(program) = &cfg.program {
        cmd.arg("--program").arg(program);
    }
    if let Some(cwd) = &cfg.cwd {
        cmd.current_dir(cwd);
    }
    cmd.args(&cfg.args);

    let mut child = cmd
        .spawn()
        .map_err(|e| AdapterError::Configuration(format!("failed to spawn debuggee: {e}")))?;

    let accept = async {
        loop {
            match listener.accept().await {
                Ok(conn) => return Ok(conn),
                Err(e) => return Err(e),
            }
        }
    };

    let conn = match timeout(cfg.connect_timeout, accept).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(e);
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(AdapterError::Timeout(cfg.connect_timeout));
        }
    };

    Ok((ExternalLaunch { listener, child }, conn))
}

fn default_endpoint(cfg: &Configuration) -> String {
    match cfg.transport {
        crate::config::TransportKind::Tcp => "127.0.0.1:0".to_string(),
        _ => std::env::temp_dir()
            .join(format!("dapper-{}.sock", std::process::id()))
            .to_string_lossy()
            .to_string(),
    }
}

/// Builds the extension event body forwarded to the client when the engine
/// reports it intercepted a same-language child process spawn.
pub fn child_process_event(pid: i64, endpoint: String, parent_pid: i64, session_id: Option<String>) -> ChildProcessEventBody {
    ChildProcessEventBody {
        pid,
        endpoint,
        parent_pid,
        session_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_is_unique_per_process() {
        let cfg = Configuration::default();
        let ep = default_endpoint(&cfg);
        assert!(ep.contains(&std::process::id().to_string()));
    }
}
