//! The administrative control socket.
//!
//! Line-oriented protocol over a unix stream socket: each request is one
//! line (`COMMAND [ARG]...`), each reply is `OK` or `ERR <reason>` on the
//! first line followed by the command output and a blank terminator line.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bridge_engine::BridgeEngine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::Clock;

pub(crate) async fn serve(
    path: PathBuf,
    engine: Arc<Mutex<BridgeEngine>>,
    clock: Clock,
) -> anyhow::Result<()> {
    // A socket file left over from an earlier run would block the bind.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!(socket = %path.display(), "admin socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let engine = engine.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, engine, clock).await {
                warn!(error = %e, "admin client error");
            }
        });
    }
}

async fn handle_client(
    stream: UnixStream,
    engine: Arc<Mutex<BridgeEngine>>,
    clock: Clock,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = {
            let mut engine = engine.lock().expect("engine lock");
            engine.admin_command(line, clock.now_ms())
        };
        match reply {
            Ok(text) => {
                writer.write_all(b"OK\n").await?;
                writer.write_all(text.as_bytes()).await?;
                if !text.ends_with('\n') && !text.is_empty() {
                    writer.write_all(b"\n").await?;
                }
            }
            Err(reason) => {
                writer.write_all(format!("ERR {reason}\n").as_bytes()).await?;
            }
        }
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_engine::config::{BridgeConfig, InterfaceConfig, NetworkConfig, PortConfig};
    use bridge_engine::sim::Sim;
    use bridge_types::MacAddress;

    fn test_engine() -> BridgeEngine {
        let sim = Sim::new();
        sim.add_netdev(
            "eth1",
            MacAddress::new([0, 0x10, 0x20, 0x30, 0x40, 0x50]),
            true,
        );
        let (dp, net, of) = sim.providers();
        let mut eng = BridgeEngine::new(dp, net, of);
        eng.init(
            &NetworkConfig {
                bridges: vec![BridgeConfig {
                    name: "br0".into(),
                    ports: vec![PortConfig {
                        name: "p1".into(),
                        interfaces: vec![InterfaceConfig::named("eth1")],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
            0,
        );
        eng
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vswitchd.sock");
        let engine = Arc::new(Mutex::new(test_engine()));
        let clock = Clock::new();

        tokio::spawn(serve(path.clone(), engine, clock));
        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"fdb/show br0\n").await.unwrap();
        let first = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first, "OK");
        let header = lines.next_line().await.unwrap().unwrap();
        assert!(header.contains("MAC"));

        writer.write_all(b"fdb/show ghost\n").await.unwrap();
        // Skip until the error line shows up (the previous reply ends
        // with a blank line).
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            if line.starts_with("ERR") {
                assert!(line.contains("no such bridge"));
                break;
            }
        }
    }
}
