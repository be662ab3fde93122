//! Tool aggregation and invocation across real subprocesses.

mod common;

use std::time::Duration;

use common::{bounded, manager, mock};
use mcp_orchestrator::mcp_client::types::LogStream;
use mcp_orchestrator::mcp_client::{
    ConnectionManager, McpError, ServerEvent, ToolAggregator, ToolResolution,
};
use serde_json::json;

async fn two_servers() -> ConnectionManager {
    let manager = manager(vec![
        mock("alpha", &["--tools", "a,b"]),
        mock("beta", &["--tools", "b,c"]),
    ]);
    assert!(bounded(manager.start()).await.is_empty());
    manager
}

#[tokio::test]
async fn all_tools_tags_each_tool_with_its_server() {
    let manager = two_servers().await;

    let mut tools: Vec<(String, String)> = bounded(manager.all_tools())
        .await
        .into_iter()
        .map(|t| (t.server_name, t.name))
        .collect();
    tools.sort();
    assert_eq!(
        tools,
        vec![
            ("alpha".to_string(), "a".to_string()),
            ("alpha".to_string(), "b".to_string()),
            ("beta".to_string(), "b".to_string()),
            ("beta".to_string(), "c".to_string()),
        ]
    );

    let catalog = ToolAggregator::new(manager.clone()).list_tools();
    assert_eq!(catalog.names(), vec!["a", "alpha.b", "beta.b", "c"]);

    bounded(manager.disconnect_server("alpha")).await.unwrap();
    bounded(manager.disconnect_server("beta")).await.unwrap();
    assert!(bounded(manager.all_tools()).await.is_empty());
    assert!(ToolAggregator::new(manager.clone()).list_tools().is_empty());
}

#[tokio::test]
async fn invoke_returns_payload_unchanged() {
    let manager = manager(vec![mock("echo", &["--tools", "ping"])]);
    bounded(manager.connect("echo")).await.unwrap();

    let aggregator = ToolAggregator::new(manager.clone());
    let result = bounded(aggregator.invoke("ping", json!({}))).await.unwrap();
    assert_eq!(
        result,
        json!({
            "content": [{"type": "text", "text": "ping handled by echo"}],
            "echo": {"server": "echo", "tool": "ping", "arguments": {}},
        })
    );

    let qualified = bounded(aggregator.invoke("echo.ping", json!({"n": 1})))
        .await
        .unwrap();
    assert_eq!(qualified["echo"]["arguments"], json!({"n": 1}));

    bounded(manager.shutdown()).await;
}

#[tokio::test]
async fn ambiguous_names_need_qualification() {
    let manager = two_servers().await;
    let aggregator = ToolAggregator::new(manager.clone());

    let err = bounded(aggregator.invoke("b", json!({}))).await.unwrap_err();
    match err {
        McpError::AmbiguousTool { candidates, .. } => {
            assert_eq!(candidates, vec!["alpha.b", "beta.b"]);
        }
        other => panic!("expected AmbiguousTool, got {other}"),
    }

    let routed = bounded(aggregator.invoke("beta.b", json!({}))).await.unwrap();
    assert_eq!(routed["echo"]["server"], "beta");
    let unique = bounded(aggregator.invoke("a", json!({}))).await.unwrap();
    assert_eq!(unique["echo"]["server"], "alpha");

    assert!(matches!(aggregator.resolve("c"), ToolResolution::Found(_)));
    assert!(matches!(
        bounded(aggregator.invoke("zzz", json!({}))).await,
        Err(McpError::ToolNotFound { .. })
    ));

    bounded(manager.shutdown()).await;
}

#[tokio::test]
async fn protocol_error_is_invocation_failure_and_keeps_connection() {
    let manager = manager(vec![mock("flaky", &["--error-on-call"])]);
    bounded(manager.connect("flaky")).await.unwrap();
    let aggregator = ToolAggregator::new(manager.clone());

    let err = bounded(aggregator.invoke("ping", json!({}))).await.unwrap_err();
    match &err {
        McpError::ToolInvocationFailed {
            server,
            code,
            message,
            ..
        } => {
            assert_eq!(server, "flaky");
            assert_eq!(*code, -32000);
            assert_eq!(message, "ping failed");
        }
        other => panic!("expected ToolInvocationFailed, got {other}"),
    }
    assert_eq!(err.kind(), "rpc");
    assert!(manager.status().server("flaky").unwrap().connected);

    bounded(manager.shutdown()).await;
}

#[tokio::test]
async fn unanswered_call_times_out_and_clears_pending() {
    let mut settings = common::fast_settings();
    settings.call_timeout = Duration::from_millis(300);
    let manager = ConnectionManager::new(
        common::registry(vec![mock("stuck", &["--hang-on-call"])]),
        settings,
    );
    bounded(manager.connect("stuck")).await.unwrap();
    let aggregator = ToolAggregator::new(manager.clone());

    let err = bounded(aggregator.invoke("ping", json!({}))).await.unwrap_err();
    assert!(matches!(err, McpError::Timeout { timeout_ms: 300, .. }), "{err}");

    let diagnostics = manager.diagnostics();
    assert_eq!(diagnostics[0].pending_requests, 0);
    assert!(diagnostics[0].connected);

    bounded(manager.shutdown()).await;
}

#[tokio::test]
async fn noise_is_forwarded_as_events() {
    let manager = manager(vec![mock("chatty", &["--noise"])]);
    bounded(manager.connect("chatty")).await.unwrap();
    let mut events = manager.subscribe();

    let aggregator = ToolAggregator::new(manager.clone());
    let result = bounded(aggregator.invoke("ping", json!({}))).await.unwrap();
    assert_eq!(result["echo"]["tool"], "ping");

    let mut saw_log = false;
    let mut saw_notification = false;
    while !(saw_log && saw_notification) {
        let event = bounded(events.recv()).await.unwrap();
        assert_eq!(event.server, "chatty");
        match event.event {
            ServerEvent::Log {
                stream: LogStream::Stdout,
                line,
            } => {
                assert_eq!(line, "handling tools/call (debug output)");
                saw_log = true;
            }
            ServerEvent::Notification { method, .. } => {
                assert_eq!(method, "notifications/message");
                saw_notification = true;
            }
            _ => {}
        }
    }

    bounded(manager.shutdown()).await;
}

#[tokio::test]
async fn missing_required_argument_is_rejected_before_dispatch() {
    let manager = manager(vec![mock("echo", &[])]);
    bounded(manager.connect("echo")).await.unwrap();
    let aggregator = ToolAggregator::new(manager.clone());

    // The mock's schema has no required fields, but arguments must be an object.
    let err = bounded(aggregator.invoke("ping", json!([1, 2])))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::InvalidArguments { .. }));

    let diagnostics = manager.diagnostics();
    // Only the handshake requests went out.
    assert_eq!(diagnostics[0].next_message_id, 3);

    bounded(manager.shutdown()).await;
}

#[tokio::test]
async fn resolved_tool_keeps_its_server_when_a_collision_appears() {
    let manager = manager(vec![
        mock("alpha", &["--tools", "a"]),
        mock("beta", &["--tools", "a"]),
    ]);
    bounded(manager.connect("alpha")).await.unwrap();
    let aggregator = ToolAggregator::new(manager.clone());

    let resolved = aggregator.resolve("a").into_result("a").unwrap();
    assert_eq!(resolved.name, "a");

    // beta now exposes a tool with the same bare name.
    bounded(manager.connect("beta")).await.unwrap();
    assert!(matches!(
        bounded(aggregator.invoke("a", json!({}))).await,
        Err(McpError::AmbiguousTool { .. })
    ));

    let result = bounded(aggregator.invoke_resolved(&resolved, json!({})))
        .await
        .unwrap();
    assert_eq!(result["echo"]["server"], "alpha");
    assert_eq!(result["echo"]["tool"], "a");

    bounded(manager.shutdown()).await;
}
