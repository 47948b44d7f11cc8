//! Integration tests for the zerolink-node binary.
//!
//! Each test spawns the compiled node, reads the `RPC_PORT=` line it prints
//! and talks to the math service through a proxy.

use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use zerolink::{Endpoint, ErrorKind, EventKey, Kwargs, Protocol, RpcProxy, ZerolinkError};

struct NodeHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl NodeHandle {
    fn proxy(&self) -> RpcProxy {
        RpcProxy::new("math", Endpoint::tcp("127.0.0.1", self.port))
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn node_binary() -> Result<PathBuf, String> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_zerolink-node") {
        return Ok(PathBuf::from(path));
    }

    let current_exe =
        std::env::current_exe().map_err(|e| format!("failed to resolve current_exe: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory".to_string())?;

    let mut fallback = target_debug_dir.join("zerolink-node");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!("zerolink-node binary not found at {}", fallback.display()));
    }
    Ok(fallback)
}

/// Start the node with `args` and wait until it reports its port.
async fn start_node(args: &[&str]) -> Result<NodeHandle, String> {
    let mut child = tokio::process::Command::new(node_binary()?)
        .args(["--host", "127.0.0.1", "--port", "0"])
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn zerolink-node: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read zerolink-node stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by zerolink-node".to_string())?;
    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(NodeHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

fn remote_kind(err: ZerolinkError) -> Option<ErrorKind> {
    err.as_remote().and_then(|remote| remote.kind())
}

#[tokio::test]
async fn test_math_methods() {
    let node = start_node(&[]).await.expect("node did not start");
    let proxy = node.proxy();

    assert_eq!(proxy.method("sum").call(vec![json!(1), json!(2)]).await.unwrap(), json!(3));
    assert_eq!(proxy.method("div").call(vec![json!(10), json!(2)]).await.unwrap(), json!(5));
    assert_eq!(proxy.method("div").call(vec![json!(-7), json!(2)]).await.unwrap(), json!(-4));
    assert_eq!(proxy.method("mul").call(vec![json!(6), json!(7)]).await.unwrap(), json!(42));

    let calculate = json!({"a": 9, "b": 3, "method": "div"});
    assert_eq!(proxy.method("calculate").call(vec![calculate]).await.unwrap(), json!(3));

    node.stop().await;
}

#[tokio::test]
async fn test_remote_errors() {
    let node = start_node(&[]).await.expect("node did not start");
    let proxy = node.proxy();

    let err = proxy.method("div").call(vec![json!(1), json!(0)]).await.unwrap_err();
    assert_eq!(remote_kind(err), Some(ErrorKind::ZeroDivision));

    let err = proxy
        .method("div")
        .call(vec![json!(1), json!(0), json!(2)])
        .await
        .unwrap_err();
    assert_eq!(remote_kind(err), Some(ErrorKind::Type));

    let calculate = json!({"a": 1, "b": 2, "method": "pow"});
    let err = proxy.method("calculate").call(vec![calculate]).await.unwrap_err();
    assert_eq!(remote_kind(err), Some(ErrorKind::Key));

    // The service keeps answering after failures.
    assert_eq!(proxy.method("sum").call(vec![json!(2), json!(2)]).await.unwrap(), json!(4));

    node.stop().await;
}

#[tokio::test]
async fn test_async_calls_through_scope() {
    let node = start_node(&["--workers", "2"]).await.expect("node did not start");
    let proxy = node.proxy();

    {
        let scope = proxy.enter_async();
        scope.async_call("sum", vec![json!(1), json!(2)], Kwargs::new()).await.unwrap();
        scope.async_call("mul", vec![json!(3), json!(4)], Kwargs::new()).await.unwrap();
        assert_eq!(scope.result("mul").await.unwrap(), json!(12));
        assert_eq!(scope.result("sum").await.unwrap(), json!(3));
        assert_eq!(scope.open_connections(), 2);
    }
    assert_eq!(proxy.open_connections(), 0);

    node.stop().await;
}

#[tokio::test]
async fn test_sum_is_published() {
    let publish_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let node = start_node(&["--publish-port", &publish_port.to_string()])
        .await
        .expect("node did not start");

    let protocol = Protocol::json();
    let topic = EventKey::new("math", "sum").to_string();
    let mut subscription = protocol
        .transport()
        .subscribe(&Endpoint::tcp("127.0.0.1", publish_port), &[topic.clone()])
        .await
        .expect("publisher not reachable");

    let proxy = node.proxy();
    assert_eq!(proxy.method("sum").call(vec![json!(20), json!(22)]).await.unwrap(), json!(42));

    let (received, payload) = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no event received")
        .unwrap();
    assert_eq!(received, topic);
    assert_eq!(protocol.parse_event(&payload).unwrap(), json!(42));

    node.stop().await;
}

#[tokio::test]
async fn test_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node.json");
    std::fs::write(&path, r#"{"container": {"port": 1, "workers": 3}}"#).unwrap();

    // `--port 0` from the harness overrides the file's port.
    let node = start_node(&["--config", path.to_str().unwrap()])
        .await
        .expect("node did not start");
    assert_ne!(node.port, 1);

    let proxy = node.proxy();
    assert_eq!(proxy.method("mul").call(vec![json!(2), json!(5)]).await.unwrap(), json!(10));

    node.stop().await;
}
