//! End-to-end delivery through the public client API against the mock server.

use std::sync::Arc;
use std::time::Duration;

use integrations_mail_dispatch::mocks::{MockConnectionFactory, MockServer, Step};
use integrations_mail_dispatch::{
    Attachment, CancellationToken, ConnectionPool, EmailRequest, MemoryLogRepository, SmtpClient,
    SmtpConfig, SmtpErrorKind, SmtpMetrics,
};
use tokio_test::{assert_err, assert_ok};

fn config(pool_size: usize, retries: u32, max_concurrent: usize) -> SmtpConfig {
    SmtpConfig::builder()
        .host("mail.example.com")
        .pool_size(pool_size)
        .retry_attempts(retries)
        .retry_delay(Duration::from_secs(1))
        .max_concurrent(max_concurrent)
        .build()
        .unwrap()
}

async fn client(server: &Arc<MockServer>, config: SmtpConfig) -> Arc<SmtpClient> {
    let client = SmtpClient::builder()
        .config(config)
        .connection_factory(Arc::new(MockConnectionFactory::with_server(Arc::clone(server))))
        .build()
        .await
        .unwrap();
    Arc::new(client)
}

fn request(to: &str) -> EmailRequest {
    EmailRequest::plain("sender@example.com", to, "Report", "See the numbers.")
}

#[tokio::test]
async fn pool_bring_up_is_all_or_nothing() {
    // Arrange
    let factory = MockConnectionFactory::new();
    factory.server().fail_creation_at(3);
    let pool = ConnectionPool::new(Arc::new(factory.clone()), 2, Arc::new(SmtpMetrics::new()));

    // Act
    let result = pool.initialize(3).await;

    // Assert
    assert_err!(result);
    assert_eq!(pool.status().await.idle, 0);
    assert_eq!(factory.server().open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn serialized_bulk_keeps_order_and_waits_for_retries() {
    // Arrange
    let server = MockServer::new();
    server.reject_recipient("bounce@example.com");
    let client = client(&server, config(1, 2, 1)).await;
    let requests = vec![request("bounce@example.com"), request("reader@example.com")];

    // Act
    let started = tokio::time::Instant::now();
    let response = client
        .send_bulk(&CancellationToken::new(), requests)
        .await
        .unwrap();

    // Assert
    assert_eq!(response.total(), 2);
    assert!(!response.results[0].success);
    assert!(response.results[0].error.as_deref().unwrap().contains("all 3 send attempts failed"));
    assert!(response.results[1].success);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(server.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn bulk_respects_concurrency_ceiling() {
    // Arrange
    let server = MockServer::new();
    server.set_payload_delay(Duration::from_millis(100));
    let client = client(&server, config(5, 0, 3)).await;
    let requests = (0..9)
        .map(|i| request(&format!("user{}@example.com", i)))
        .collect();

    // Act
    let response = client
        .send_bulk(&CancellationToken::new(), requests)
        .await
        .unwrap();

    // Assert
    assert_eq!(response.succeeded(), 9);
    assert_eq!(server.max_in_flight(), 3);
    for (i, message) in server.delivered().iter().enumerate() {
        assert_eq!(message.recipients.len(), 1, "message {}", i);
    }
}

#[tokio::test]
async fn bulk_reports_setup_failure_as_error() {
    let server = MockServer::new();
    server.fail_all_creations(true);
    let client = client(&server, config(2, 0, 2)).await;

    let err = client
        .send_bulk(&CancellationToken::new(), vec![request("a@example.com")])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), SmtpErrorKind::ConnectionRefused);
}

#[tokio::test]
async fn bulk_partial_and_total_failure_are_not_call_errors() {
    let server = MockServer::new();
    server.reject_recipient("bad@example.com");
    let client = client(&server, config(2, 0, 2)).await;

    let mixed = client
        .send_bulk(
            &CancellationToken::new(),
            vec![request("bad@example.com"), request("good@example.com")],
        )
        .await
        .unwrap();
    assert_eq!(mixed.succeeded(), 1);
    assert_eq!(mixed.failed(), 1);

    let all_bad = client
        .send_bulk(
            &CancellationToken::new(),
            vec![request("bad@example.com"), request("bad@example.com")],
        )
        .await
        .unwrap();
    assert!(all_bad.all_failed());
}

#[tokio::test]
async fn cancelled_bulk_touches_no_connection() {
    let server = MockServer::new();
    let client = client(&server, config(2, 3, 2)).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = client
        .send_bulk(&cancel, vec![request("a@example.com"), request("b@example.com")])
        .await
        .unwrap();

    assert!(response.all_failed());
    assert_eq!(server.create_calls(), 0);
    assert!(server.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_running_send_finish_and_stops_queued_ones() {
    // Arrange
    let server = MockServer::new();
    server.set_payload_delay(Duration::from_millis(500));
    let client = client(&server, config(1, 0, 1)).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    // Act
    let response = client
        .send_bulk(
            &cancel,
            vec![request("first@example.com"), request("second@example.com")],
        )
        .await
        .unwrap();

    // Assert
    assert!(response.results[0].success);
    assert!(!response.results[1].success);
    assert!(response.results[1]
        .error
        .as_deref()
        .unwrap()
        .contains("cancelled"));
    assert_eq!(server.delivered().len(), 1);
    assert_eq!(server.delivered()[0].recipients, vec!["first@example.com"]);
}

#[tokio::test]
async fn every_bulk_item_is_logged() {
    // Arrange
    let server = MockServer::new();
    server.reject_recipient("bad@example.com");
    let repo = MemoryLogRepository::new();
    let client = SmtpClient::builder()
        .config(config(2, 0, 2))
        .connection_factory(Arc::new(MockConnectionFactory::with_server(Arc::clone(&server))))
        .log_repository(repo.clone())
        .build()
        .await
        .map(Arc::new)
        .unwrap();

    let with_file = request("good@example.com")
        .with_attachment(Attachment::from_bytes("report.csv", b"a,b\n1,2\n".to_vec()));
    let html = EmailRequest::html("sender@example.com", "good@example.com", "Hi", "<p>hi</p>");

    // Act
    let response = client
        .send_bulk(
            &CancellationToken::new(),
            vec![with_file, html, request("bad@example.com")],
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(response.succeeded(), 2);
    let logs = repo.wait_for(3, Duration::from_secs(1)).await;
    assert_eq!(logs.len(), 3);

    let mut content_types: Vec<&str> = logs.iter().map(|l| l.content_type.as_str()).collect();
    content_types.sort_unstable();
    assert_eq!(content_types, vec!["multipart/mixed", "text/html", "text/plain"]);

    let failed: Vec<_> = logs.iter().filter(|l| !l.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].to, "bad@example.com");
    assert!(failed[0].error.is_some());
}

#[tokio::test(start_paused = true)]
async fn dead_pooled_connections_are_replaced_transparently() {
    let server = MockServer::new();
    let client = client(&server, config(2, 0, 2)).await;
    assert_ok!(client.connect().await);

    server.kill_existing();
    assert_ok!(
        client
            .send(&CancellationToken::new(), "sender@example.com", "a@example.com", "Hi", "x")
            .await
    );

    assert_eq!(server.created_count(), 3);
    assert_eq!(client.metrics().snapshot().dead_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_session_mid_transaction_is_retried_on_a_fresh_connection() {
    let server = MockServer::new();
    server.drop_at(Step::Payload);
    let client = client(&server, config(1, 1, 1)).await;

    assert_ok!(
        client
            .send(&CancellationToken::new(), "sender@example.com", "a@example.com", "Hi", "x")
            .await
    );

    assert_eq!(server.delivered().len(), 1);
    assert_eq!(server.created_count(), 2);
}

#[tokio::test]
async fn disconnect_quits_idle_connections() {
    let server = MockServer::new();
    let client = client(&server, config(3, 0, 1)).await;
    client.connect().await.unwrap();

    client.disconnect().await.unwrap();

    assert!(!client.is_connected().await);
    assert_eq!(server.quit_count(), 3);
    assert_eq!(server.open_connections(), 0);
}
