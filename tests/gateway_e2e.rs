//! Whole-gateway tests: a compiled Flow program routing real HTTP traffic
//! through the server into a cluster.

use std::sync::Arc;
use std::time::Duration;

use flowgate::config::schema::{ClusterConfig, GatewayConfig, HealthCheckConfig, MemberConfig};
use flowgate::context::register_natives;
use flowgate::vm::{bytecode, MatchCase, MatchKind, MatchPattern, NativeRegistry, Opcode, ProgramBuilder};
use flowgate::{HttpServer, Shutdown};

mod common;

/// main:
///   r1 = req.path()
///   match r1 == "/ping" -> respond(200, "pong")
///   otherwise           -> balance.cluster("web")
fn routing_program_image() -> Vec<u8> {
    let mut registry = NativeRegistry::new();
    register_natives(&mut registry);

    let mut b = ProgramBuilder::new();
    b.add_handler("main", 3);
    let path_fn = b.add_native_function("req.path", "S");
    let respond = b.add_native_handler("respond", "BIS");
    let balance = b.add_native_handler("balance.cluster", "BS");
    let pong = b.add_string("pong");
    let web = b.add_string("web");

    b.emit(Opcode::Call, path_fn, 0, 1); // 0: r1 = req.path()
    b.emit(Opcode::Nop, 0, 0, 0); // 1: patched to SMATCHEQ
    let t_ping = b.emit(Opcode::IMov, 1, 200, 0); // 2
    b.emit(Opcode::SConst, 2, pong, 0); // 3
    b.emit(Opcode::Handler, respond, 2, 0); // 4
    b.emit(Opcode::Exit, 0, 0, 0); // 5
    let t_proxy = b.emit(Opcode::SConst, 1, web, 0); // 6
    b.emit(Opcode::Handler, balance, 1, 0); // 7
    b.emit(Opcode::Exit, 0, 0, 0); // 8
    let table = b.add_match_table(
        MatchKind::Equal,
        t_proxy,
        vec![MatchCase {
            pattern: MatchPattern::Literal("/ping".into()),
            target: t_ping,
        }],
    );
    b.patch(1, Opcode::SMatchEq, 1, table, 0);

    let program = b.build(&registry).expect("program should assemble");
    bytecode::save(&program)
}

#[tokio::test]
async fn flow_program_routes_and_proxies() {
    let backend = common::start_mock_backend("hello from origin").await;

    let image = routing_program_image();
    let dir = std::env::temp_dir().join(format!("flowgate-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let program_path = dir.join("routing.fgbc");
    std::fs::write(&program_path, image).unwrap();

    let mut config = GatewayConfig::default();
    config.flow.program = Some(program_path.clone());
    config.clusters.push(ClusterConfig {
        name: "web".into(),
        members: vec![MemberConfig {
            name: "origin".into(),
            address: backend.to_string(),
            capacity: 4,
            ..MemberConfig::default()
        }],
        health_check: HealthCheckConfig {
            interval_ms: 50,
            success_threshold: 1,
            ..HealthCheckConfig::default()
        },
        ..ClusterConfig::default()
    });

    let server = HttpServer::new(config).expect("server should build");
    let cluster = server.cluster("web").expect("cluster exists");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    {
        let cluster = Arc::clone(&cluster);
        common::wait_for(Duration::from_secs(5), "origin to come online", move || {
            cluster
                .find_member("origin")
                .map(|m| m.monitor().is_online())
                .unwrap_or(false)
                && cluster.shaper().size() == 4
        })
        .await;
    }

    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    // policy short-circuit: answered by the VM, no backend involved
    let res = client
        .get(format!("http://{addr}/ping"))
        .send()
        .await
        .expect("gateway unreachable");
    assert_eq!(res.status(), 200);
    assert!(res.headers().get("x-request-id").is_some());
    assert_eq!(res.text().await.unwrap(), "pong");

    // everything else is proxied through the cluster
    let res = client
        .get(format!("http://{addr}/api/data"))
        .send()
        .await
        .expect("gateway unreachable");
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()
            .get("cluster-bucket")
            .and_then(|v| v.to_str().ok()),
        Some("root")
    );
    assert_eq!(res.text().await.unwrap(), "hello from origin");

    shutdown.trigger();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn gateway_without_clusters_declines() {
    let config = GatewayConfig::default();
    let server = HttpServer::new(config).expect("server should build");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let res = client
        .get(format!("http://{addr}/anything"))
        .send()
        .await
        .expect("gateway unreachable");
    assert_eq!(res.status(), 404);

    shutdown.trigger();
}
