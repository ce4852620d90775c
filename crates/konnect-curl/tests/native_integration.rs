#![cfg(feature = "libcurl")]

use std::time::Duration;

use anyhow::{Result, bail};
use bytes::Bytes;
use konnect_core::{Method, Request, RequestBody, TransferError, Transport};
use konnect_curl::{BridgeConfig, CurlBridge};
use konnect_telemetry::Metrics;
use konnect_test_support::fixtures::{closed_port, loopback_available};
use konnect_test_support::http::{FixtureServer, HELLO_BODY};
use tokio::time::timeout;
use tokio_stream::StreamExt;

const CURLE_COULDNT_CONNECT: i32 = 7;
const CURLE_OPERATION_TIMEDOUT: i32 = 28;

fn bridge() -> Result<CurlBridge> {
    CurlBridge::new(BridgeConfig {
        connect_timeout_ms: Some(2_000),
        ..BridgeConfig::default()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetches_concurrently_from_fixture_server() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let metrics = Metrics::new()?;
    let bridge = CurlBridge::with_metrics(BridgeConfig::default(), metrics.clone())?;

    let handles = (0..4)
        .map(|_| bridge.submit(Request::get(server.url("/hello"))))
        .collect::<Result<Vec<_>, _>>()?;
    for handle in handles {
        let response = timeout(Duration::from_secs(10), handle).await??;
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("x-fixture"), Some("konnect"));
        assert_eq!(response.body().as_ref(), HELLO_BODY.as_bytes());
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.transfers_submitted_total, 4);
    assert_eq!(snapshot.transfers_succeeded_total, 4);
    assert_eq!(snapshot.transfers_in_flight, 0);
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploads_fixed_and_chunked_bodies() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let bridge = bridge()?;

    let fixed = bridge
        .process(Request::post(server.url("/echo"), "fixed payload"))
        .await?;
    assert_eq!(fixed.header("x-method"), Some("POST"));
    assert_eq!(fixed.body().as_ref(), b"fixed payload");

    let chunks = RequestBody::from_chunks(
        [b"lazy ".as_slice(), b"chunked ", b"payload"]
            .into_iter()
            .map(Bytes::from_static),
    );
    let chunked = bridge
        .process(Request::new(Method::Put, server.url("/echo")).body(chunks))
        .await?;
    assert_eq!(chunked.header("x-method"), Some("PUT"));
    assert_eq!(chunked.body().as_ref(), b"lazy chunked payload");

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reports_status_codes_and_follows_redirects_on_request() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let bridge = bridge()?;

    let missing = bridge.process(Request::get(server.url("/status/503"))).await?;
    assert_eq!(missing.status(), 503);

    let redirect = bridge.process(Request::get(server.url("/redirect"))).await?;
    assert_eq!(redirect.status(), 302);
    assert_eq!(redirect.header("location"), Some("/hello"));

    let followed = bridge
        .process(Request::get(server.url("/redirect")).follow_redirects(true))
        .await?;
    assert_eq!(followed.status(), 200);
    assert!(
        followed.header("location").is_none(),
        "headers reset on the final status line"
    );
    assert_eq!(followed.body().as_ref(), HELLO_BODY.as_bytes());

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streams_body_chunks() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let bridge = bridge()?;

    let mut handle = bridge.submit(Request::get(server.url("/hello")))?;
    let mut chunks = handle.body_chunks();
    let mut body = Vec::new();
    while let Some(chunk) = timeout(Duration::from_secs(10), chunks.next()).await? {
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, HELLO_BODY.as_bytes());
    assert!(chunks.next().await.is_none());

    let response = handle.await?;
    assert_eq!(response.status(), 200);
    assert!(response.body().is_empty());
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_transfer_can_be_cancelled_or_timed_out() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let bridge = bridge()?;

    let stalled = bridge.submit(Request::get(server.url("/stall")))?;
    let sibling = bridge.submit(Request::get(server.url("/hello")))?;
    let sibling = timeout(Duration::from_secs(10), sibling).await??;
    assert_eq!(sibling.status(), 200);

    stalled.cancel();
    assert_eq!(stalled.await, Err(TransferError::Cancelled));

    let limited = bridge.submit(
        Request::get(server.url("/stall")).timeout(Duration::from_millis(200)),
    )?;
    match timeout(Duration::from_secs(10), limited).await? {
        Err(TransferError::TransferFailed { code, .. }) => {
            assert_eq!(code, CURLE_OPERATION_TIMEDOUT);
        }
        other => bail!("expected timeout failure, got {other:?}"),
    }

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_fails_only_that_transfer() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let refused = closed_port()?;
    let bridge = bridge()?;

    let failing = bridge.submit(Request::get(format!("http://{refused}/")))?;
    let healthy = bridge.submit(Request::get(server.url("/hello")))?;

    match timeout(Duration::from_secs(10), failing).await? {
        Err(TransferError::TransferFailed { code, message }) => {
            assert_eq!(code, CURLE_COULDNT_CONNECT);
            assert!(!message.is_empty());
        }
        other => bail!("expected connect failure, got {other:?}"),
    }
    let healthy = timeout(Duration::from_secs(10), healthy).await??;
    assert_eq!(healthy.status(), 200);

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_stalled_transfers() -> Result<()> {
    if !loopback_available() {
        return Ok(());
    }
    let server = FixtureServer::start().await?;
    let bridge = bridge()?;

    let stalled = bridge.submit(Request::get(server.url("/stall")))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    bridge.shutdown().await;

    assert_eq!(stalled.await, Err(TransferError::Cancelled));
    assert!(matches!(
        bridge.submit(Request::get(server.url("/hello"))),
        Err(TransferError::BridgeClosed)
    ));
    Ok(())
}
