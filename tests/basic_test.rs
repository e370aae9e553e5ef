use std::sync::Arc;
use std::time::Duration;

use betproxy::ca::RootAuthority;
use betproxy::{DirectClient, ProxyError, ProxyService};
use rcgen::{CertifiedKey, generate_simple_self_signed};
use warp::Filter;

fn start_warp_server() -> std::net::SocketAddr {
    let route = warp::any().map(|| warp::reply::html("hello from origin"));
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let server = warp::serve(route);
            let (addr, fut) = server.bind_ephemeral(([127, 0, 0, 1], 0));
            addr_tx.send(addr).unwrap();
            fut.await;
        });
    });
    addr_rx.recv().unwrap()
}

fn start_warp_https_server() -> std::net::SocketAddr {
    let route = warp::any().map(|| warp::reply::html("hello from https origin"));
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let server = warp::serve(route)
                .tls()
                .key(key_pair.serialize_pem())
                .cert(cert.pem());
            let (addr, fut) = server.bind_ephemeral(([127, 0, 0, 1], 0));
            addr_tx.send(addr).unwrap();
            fut.await;
        });
    });
    addr_rx.recv().unwrap()
}

async fn spawn_proxy(skip_tls_verify: bool) -> (ProxyService, std::net::SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let authority = RootAuthority::load_or_generate(dir.path()).unwrap();
    let mut service = ProxyService::bind("127.0.0.1:0", authority).await.unwrap();
    service.set_client(Arc::new(DirectClient::new(skip_tls_verify)));
    let addr = service.local_addr().unwrap();
    (service, addr)
}

#[tokio::test]
async fn plain_http_get_is_forwarded_to_origin() {
    let origin = start_warp_server();
    let (service, proxy_addr) = spawn_proxy(false).await;

    let service = Arc::new(service);
    let runner = service.clone();
    tokio::spawn(async move {
        let _ = runner.listen().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let proxy_url = format!("http://{proxy_addr}");
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(&proxy_url).unwrap())
        .build()
        .unwrap();

    let res = client
        .get(format!("http://{origin}/get"))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());
    assert_eq!(res.text().await.unwrap(), "hello from origin");

    service.close();
}

#[tokio::test]
async fn https_via_connect_terminates_tls_with_minted_leaf() {
    let origin = start_warp_https_server();
    // DirectClient must accept the test origin's self-signed cert; the
    // proxy-minted leaf the client sees is a separate concern, verified below
    // via trusting `ca_der` instead of disabling verification client-side.
    let (service, proxy_addr) = spawn_proxy(true).await;
    let ca_der = service.root_certificate_der().to_vec();

    let service = Arc::new(service);
    let runner = service.clone();
    tokio::spawn(async move {
        let _ = runner.listen().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let proxy_url = format!("http://{proxy_addr}");
    let ca_cert = reqwest::Certificate::from_der(&ca_der).unwrap();
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::https(&proxy_url).unwrap())
        .add_root_certificate(ca_cert)
        .build()
        .unwrap();

    let res = client
        .get(format!("https://localhost:{}/get", origin.port()))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());
    assert_eq!(res.text().await.unwrap(), "hello from https origin");

    service.close();
}

#[tokio::test]
async fn upstream_failure_synthesizes_500() {
    let (service, proxy_addr) = spawn_proxy(false).await;

    let service = Arc::new(service);
    let runner = service.clone();
    tokio::spawn(async move {
        let _ = runner.listen().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Nothing is listening on this port -- connect must fail.
    let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let proxy_url = format!("http://{proxy_addr}");
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(&proxy_url).unwrap())
        .build()
        .unwrap();

    let res = client
        .get(format!("http://{dead_addr}/get"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 500);
    assert_eq!(res.headers().get("via").unwrap(), "betproxy");
    assert_eq!(
        res.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );

    service.close();
}

#[tokio::test]
async fn malformed_request_line_is_rejected() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let (service, proxy_addr) = spawn_proxy(false).await;
    let service = Arc::new(service);
    let runner = service.clone();
    tokio::spawn(async move {
        let _ = runner.listen().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(b"| /get HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    // Either a 400 status line or an immediate close is acceptable; both
    // indicate the proxy never forwarded the malformed line upstream.
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    if !out.is_empty() {
        assert!(out.starts_with(b"HTTP/1.1 400"));
    }

    service.close();
}

#[tokio::test]
async fn missing_client_fails_fast_at_listen() {
    let dir = tempfile::tempdir().unwrap();
    let authority = RootAuthority::load_or_generate(dir.path()).unwrap();
    let service = ProxyService::bind("127.0.0.1:0", authority).await.unwrap();

    let result = service.listen().await;
    assert!(matches!(result, Err(ProxyError::MissingClient)));
}
