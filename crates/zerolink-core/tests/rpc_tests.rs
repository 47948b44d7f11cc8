//! End-to-end tests for calls between a container and its proxies.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zerolink::{
    param, CallArgs, ClusterProxy, ClusterServiceConfig, Container, Endpoint, ErrorKind, Kwargs,
    MethodRegistry, ParamKind, RpcProxy, RunConfig, Scheme, Service, ServiceContext, ServiceError,
    ZerolinkError,
};

struct Math {
    calls: AtomicUsize,
}

#[async_trait]
impl Service for Math {
    const CLASS: &'static str = "MathService";

    fn name(&self) -> &str {
        "math"
    }

    async fn init(_ctx: &ServiceContext) -> zerolink::Result<Self> {
        Ok(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

fn ints(call: &CallArgs) -> Result<(i64, i64), zerolink::Fault> {
    Ok((call.get(0, "a")?, call.get(1, "b")?))
}

fn math_methods() -> MethodRegistry<Math> {
    let pair = || vec![param("a", ParamKind::Int), param("b", ParamKind::Int)];
    let mut methods = MethodRegistry::new();
    methods
        .register("sum", pair(), |svc: Arc<Math>, call| async move {
            svc.calls.fetch_add(1, Ordering::SeqCst);
            let (a, b) = ints(&call)?;
            Ok(json!(a + b))
        })
        .register("div", pair(), |svc: Arc<Math>, call| async move {
            svc.calls.fetch_add(1, Ordering::SeqCst);
            let (a, b) = ints(&call)?;
            if b == 0 {
                return Err(ServiceError::zero_division("integer division or modulo by zero").into());
            }
            Ok(json!(a / b))
        })
        .register_untyped("echo", |svc: Arc<Math>, call| async move {
            svc.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "args": call.args, "kwargs": call.kwargs }))
        })
        .register_untyped("calls", |svc: Arc<Math>, _| async move {
            Ok(json!(svc.calls.load(Ordering::SeqCst)))
        })
        .register("nap", vec![param("ms", ParamKind::Int)], |_: Arc<Math>, call| async move {
            let ms: u64 = call.get(0, "ms")?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("rested"))
        });
    methods
}

/// Run a math container and return it with the endpoint it serves on.
async fn serve(config: RunConfig) -> (Arc<Container<Math>>, Endpoint) {
    let container = Arc::new(Container::new(math_methods()));
    let running = container.clone();
    tokio::spawn(async move { running.run(&config).await });

    let endpoint = tokio::time::timeout(Duration::from_secs(5), container.ready())
        .await
        .expect("container did not start")
        .unwrap();
    (container, endpoint)
}

fn remote_kind(err: ZerolinkError) -> ErrorKind {
    match err {
        ZerolinkError::Remote(remote) => remote.kind().expect("built-in error kind"),
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_math_over_tcp() {
    let (container, endpoint) = serve(RunConfig::new("127.0.0.1", 0)).await;
    assert_ne!(endpoint.port(), 0);

    let proxy = RpcProxy::new("math", endpoint);
    assert_eq!(proxy.method("sum").call(vec![json!(1), json!(2)]).await.unwrap(), json!(3));
    assert_eq!(proxy.method("div").call(vec![json!(10), json!(2)]).await.unwrap(), json!(5));

    let err = proxy.method("div").call(vec![json!(1), json!(0)]).await.unwrap_err();
    assert_eq!(remote_kind(err), ErrorKind::ZeroDivision);

    let err = proxy
        .method("div")
        .call(vec![json!(1), json!(0), json!(2)])
        .await
        .unwrap_err();
    assert_eq!(remote_kind(err), ErrorKind::Type);

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_error_keeps_message() {
    let (container, endpoint) = serve(RunConfig::new("127.0.0.1", 0)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let mut kwargs = Kwargs::new();
    kwargs.insert("a".into(), json!("one"));
    kwargs.insert("b".into(), json!(2));
    let err = proxy.invoke("sum", vec![], kwargs).await.unwrap_err();

    let ZerolinkError::Remote(remote) = err else {
        panic!("expected a remote error");
    };
    assert_eq!(remote.exc_type(), "ValueError");
    assert_eq!(remote.message(), "Argument a should be of type int");
    assert_eq!(remote.to_string(), "ValueError: Argument a should be of type int");

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_method_gets_no_reply() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 1).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let missing = proxy.method("missing");
    let pending = missing.call(vec![]);
    assert!(tokio::time::timeout(Duration::from_millis(200), pending).await.is_err());

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_selected_method_is_called() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 2).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let result = proxy.select("sum").call(vec![json!(20), json!(22)], Kwargs::new()).await;
    assert_eq!(result.unwrap(), json!(42));

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_async_result_matches_sync_call() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 3).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint).with_header("trace", "abc");

    let args = vec![json!(1), json!("two"), json!([3])];
    let sync_result = proxy.method("echo").call(args.clone()).await.unwrap();

    let async_result = {
        let scope = proxy.enter_async();
        let echo = scope.method("echo");
        echo.async_call(args).await.unwrap();
        echo.result().await.unwrap()
    };

    assert_eq!(sync_result, async_result);
    assert_eq!(proxy.open_connections(), 0);
    assert!(!proxy.is_async_context());

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_async_calls_are_answered_in_order() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 4).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let scope = proxy.enter_async();
    for n in 0..3 {
        scope.async_call("sum", vec![json!(n), json!(10)], Kwargs::new()).await.unwrap();
    }
    assert_eq!(scope.open_connections(), 1);

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(scope.result("sum").await.unwrap());
    }
    assert_eq!(results, vec![json!(10), json!(11), json!(12)]);

    drop(scope);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_async_remote_error_is_raised_on_result() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 5).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let scope = proxy.enter_async();
    scope.async_call("div", vec![json!(1), json!(0)], Kwargs::new()).await.unwrap();
    let err = scope.result("div").await.unwrap_err();
    assert_eq!(remote_kind(err), ErrorKind::ZeroDivision);

    drop(scope);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_cluster_makes_one_round_trip_per_pair() {
    let (container, endpoint) = serve(RunConfig::new("127.0.0.1", 0)).await;
    let cluster = ClusterProxy::new(vec![ClusterServiceConfig::new(
        "math",
        "127.0.0.1",
        endpoint.port(),
    )]);

    let err = cluster.service("users").unwrap_err();
    assert!(matches!(err, ZerolinkError::ServiceNotFound { name } if name == "users"));

    let math = cluster.service("math").unwrap();
    for n in 0..3 {
        math.async_call("echo", vec![json!(n)], Kwargs::new()).await.unwrap();
        let reply = math.result("echo").await.unwrap();
        assert_eq!(reply["args"], json!([n]));
    }

    let calls = math.method("calls").call(vec![]).await.unwrap();
    assert_eq!(calls, json!(3));

    cluster.close();
    assert_eq!(math.open_connections(), 0);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_container_restarts_on_same_endpoint() {
    let config = RunConfig::new("rpc-it", 6).with_protocol(Scheme::Inproc);
    let container = Arc::new(Container::new(math_methods()));

    let running = container.clone();
    let first_config = config.clone();
    let first = tokio::spawn(async move { running.run(&first_config).await });
    let endpoint = container.ready().await.unwrap();

    let proxy = RpcProxy::new("math", endpoint);
    assert_eq!(proxy.method("sum").call(vec![json!(1), json!(1)]).await.unwrap(), json!(2));

    container.stop().await.unwrap();
    first.await.unwrap().unwrap();
    assert!(matches!(container.stop().await, Err(ZerolinkError::ContainerNotRunning)));

    let running = container.clone();
    tokio::spawn(async move { running.run(&config).await });
    container.ready().await.unwrap();

    // The cached connection died with the first run; the failed call drops it.
    let reply = match proxy.method("sum").call(vec![json!(2), json!(2)]).await {
        Ok(value) => value,
        Err(e) if e.is_retryable() => proxy.method("sum").call(vec![json!(2), json!(2)]).await.unwrap(),
        Err(e) => panic!("unexpected error: {}", e),
    };
    assert_eq!(reply, json!(4));

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_value_argument_passes_through_unchanged() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 7).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let payload = json!({"nested": {"list": [1, 2.5, null, true]}});
    let mut kwargs = Kwargs::new();
    kwargs.insert("payload".into(), payload.clone());
    let reply = proxy.invoke("echo", vec![], kwargs).await.unwrap();
    assert_eq!(reply["kwargs"]["payload"], payload);
    assert_eq!(reply["args"], Value::Array(vec![]));

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_call_after_timed_out_call_gets_its_own_reply() {
    let (container, endpoint) = serve(RunConfig::new("rpc-it", 8).with_protocol(Scheme::Inproc)).await;
    let proxy = RpcProxy::new("math", endpoint);

    let nap = proxy.method("nap");
    let slow = nap.call(vec![json!(300)]);
    assert!(tokio::time::timeout(Duration::from_millis(50), slow).await.is_err());

    // The late "rested" reply belongs to the abandoned call only.
    let reply = proxy.method("sum").call(vec![json!(1), json!(2)]).await.unwrap();
    assert_eq!(reply, json!(3));
    let reply = proxy.method("sum").call(vec![json!(2), json!(2)]).await.unwrap();
    assert_eq!(reply, json!(4));

    container.stop().await.unwrap();
}
