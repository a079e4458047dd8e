//! End-to-end prober tests against an in-process SMTP server.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use checker_core::cache::{CacheProvider, MemoryCache};
use checker_core::helo::{HeloRotator, MemoryCounter};
use checker_core::smtp::{EmailProber, ProberConfig, SmtpProber};
use checker_core::throttle::ThrottleManager;
use checker_core::MxRecord;

/// Serve scripted SMTP on an ephemeral port; every RCPT gets `rcpt_reply`.
async fn spawn_server(rcpt_reply: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle_session(stream, rcpt_reply));
        }
    });
    port
}

async fn handle_session(stream: TcpStream, rcpt_reply: &'static str) {
    let (read, mut write) = stream.into_split();
    if write.write_all(b"220 mock.test ESMTP\r\n").await.is_err() {
        return;
    }

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.to_ascii_uppercase();
        let reply: &str = if command.starts_with("EHLO") {
            "250-mock.test\r\n250 SIZE 35882577\r\n"
        } else if command.starts_with("HELO") {
            "250 mock.test\r\n"
        } else if command.starts_with("MAIL") {
            "250 2.1.0 sender ok\r\n"
        } else if command.starts_with("RCPT") {
            rcpt_reply
        } else if command.starts_with("QUIT") {
            let _ = write.write_all(b"221 2.0.0 bye\r\n").await;
            return;
        } else {
            "502 5.5.2 command not recognized\r\n"
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn prober_on(port: u16) -> (SmtpProber, Arc<ThrottleManager>, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    let throttle = Arc::new(ThrottleManager::new(cache.clone()));
    let helo = Arc::new(
        HeloRotator::new(
            vec!["probe-one.test".into(), "probe-two.test".into()],
            Arc::new(MemoryCounter::default()),
        )
        .unwrap(),
    );
    let config = ProberConfig {
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
        ports: vec![port],
    };
    (
        SmtpProber::new(helo, throttle.clone(), config),
        throttle,
        cache,
    )
}

fn mx_localhost() -> Vec<MxRecord> {
    vec![MxRecord {
        host: "127.0.0.1".into(),
        priority: 10,
        ttl: 3600,
    }]
}

#[tokio::test]
async fn accepted_rcpt_reports_existence() {
    let port = spawn_server("250 2.1.5 recipient ok\r\n").await;
    let (prober, _, _) = prober_on(port);

    let outcome = prober.check_email("a@good.test", &mx_localhost()).await;
    assert!(outcome.exists);
    assert!(outcome.smtp_error.is_empty());
    assert!(!outcome.permanent);
}

#[tokio::test]
async fn unknown_mailbox_is_permanent() {
    let port = spawn_server("550 5.1.1 user unknown\r\n").await;
    let (prober, _, _) = prober_on(port);

    let outcome = prober.check_email("nobody@gone.test", &mx_localhost()).await;
    assert!(!outcome.exists);
    assert!(outcome.permanent);
    assert_eq!(outcome.category, "mailbox_not_found");
    assert_eq!(outcome.ttl, 0);
    assert!(outcome.smtp_error.starts_with("550"));
}

#[tokio::test]
async fn greylisting_exhausts_and_throttles_domain() {
    let port = spawn_server("451 4.7.1 greylisted, try again later\r\n").await;
    let (prober, throttle, cache) = prober_on(port);

    let outcome = prober
        .check_email("y@greylist.test", &mx_localhost())
        .await;
    assert!(!outcome.exists);
    assert!(!outcome.permanent);
    assert_eq!(outcome.category, "temporary");
    assert_eq!(outcome.smtp_error, "all MX temporary errors");
    assert_eq!(outcome.ttl, 7200);

    // The domain is now blocked and a first retry is scheduled.
    assert!(throttle.is_throttled("greylist.test").await);
    assert!(cache.get("retry:y@greylist.test:1").await.is_some());

    // A second submission skips SMTP entirely.
    let second = prober
        .check_email("y@greylist.test", &mx_localhost())
        .await;
    assert_eq!(second.category, "throttled");
    assert_eq!(second.smtp_error, "domain throttled");
}

#[tokio::test]
async fn rbl_restriction_throttles_and_stops() {
    let port = spawn_server("554 5.7.1 service unavailable; RBL Restriction; see list\r\n").await;
    let (prober, throttle, _) = prober_on(port);

    let outcome = prober.check_email("u@rbl.test", &mx_localhost()).await;
    assert!(!outcome.exists);
    assert!(!outcome.permanent);
    assert_eq!(outcome.category, "rbl_restriction");
    assert_eq!(outcome.smtp_error, "rbl restriction");
    assert_eq!(outcome.ttl, 60);

    assert!(throttle.is_throttled("rbl.test").await);

    let second = prober.check_email("other@rbl.test", &mx_localhost()).await;
    assert_eq!(second.category, "throttled");
}

#[tokio::test]
async fn unreachable_server_yields_empty_outcome() {
    // Bind then drop so the port refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (prober, throttle, _) = prober_on(port);
    let outcome = prober.check_email("a@dark.test", &mx_localhost()).await;

    assert!(!outcome.exists);
    assert!(outcome.smtp_error.is_empty());
    assert!(outcome.category.is_empty());
    assert!(!outcome.permanent);
    assert_eq!(outcome.ttl, 0);
    assert!(!throttle.is_throttled("dark.test").await);
}

#[tokio::test]
async fn permanent_error_on_first_port_stops_the_walk() {
    let port = spawn_server("554 5.0.0 transaction failed\r\n").await;
    let (prober, _, _) = prober_on(port);

    // Two MX records, but the first permanent classification must end
    // the walk with that result.
    let records = vec![
        MxRecord {
            host: "127.0.0.1".into(),
            priority: 10,
            ttl: 3600,
        },
        MxRecord {
            host: "127.0.0.1".into(),
            priority: 20,
            ttl: 7200,
        },
    ];
    let outcome = prober.check_email("x@stop.test", &records).await;
    assert!(outcome.permanent);
    assert_eq!(outcome.category, "transaction_failed");
}
