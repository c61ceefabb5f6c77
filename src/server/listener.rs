//! Post-receive hook listener.
//!
//! A process-local TCP listener accepting newline-terminated
//! `account/repo/branch` keys from repository post-receive hooks; each
//! key queues a build (which in turn fans out the cache invalidation).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;

use crate::builder::Builder;

/// Bind the listener and process hook notifications forever.
pub async fn run(host: &str, port: u16, builder: Arc<Builder>) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    log::info!("updates listener on {host}:{port}");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("updates listener accept failed: {err}");
                continue;
            }
        };
        let builder = Arc::clone(&builder);
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let key = line.trim();
                        if key.is_empty() {
                            continue;
                        }
                        match parse_key(key) {
                            Some((account, repo, branch)) => {
                                log::debug!("hook update for {key}");
                                builder.schedule_build(account, repo, branch);
                            }
                            None => log::warn!("malformed hook key from {peer}: {key}"),
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::warn!("hook connection from {peer} failed: {err}");
                        break;
                    }
                }
            }
        });
    }
}

/// Split `account/repo/branch`; branches may contain slashes.
fn parse_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '/');
    let account = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    let branch = parts.next().filter(|s| !s.is_empty())?;
    Some((account, repo, branch))
}
