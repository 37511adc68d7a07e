//! Chain composition through the public API
//!
//! Elements here are defined outside the crate, the way a user would plug
//! their own functionality into a chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ipsec_chain::chain::{Chain, Element, NetworkServiceElement};
use ipsec_chain::connection::{Connection, Request};
use ipsec_chain::context::RequestContext;
use ipsec_chain::error::{ChainError, DataplaneError};

// ============================================================================
// Test Helpers
// ============================================================================

type Log = Arc<Mutex<Vec<String>>>;

struct Step {
    name: String,
    log: Log,
    fail_request: bool,
    fail_close: bool,
    hang: bool,
    requests: AtomicUsize,
}

impl Step {
    fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            fail_request: false,
            fail_close: false,
            hang: false,
            requests: AtomicUsize::new(0),
        }
    }

    fn failing(mut self) -> Self {
        self.fail_request = true;
        self
    }

    fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    fn error(&self, conn_id: &str) -> ChainError {
        ChainError::dataplane(
            self.name.clone(),
            conn_id,
            DataplaneError::rejected("test", format!("{} refused", self.name)),
        )
    }
}

#[async_trait]
impl NetworkServiceElement for Step {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("request:{}", self.name));
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail_request {
            return Err(self.error(&request.connection.id));
        }
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        self.log.lock().push(format!("close:{}", self.name));
        if self.fail_close {
            return Err(self.error(&conn.id));
        }
        Ok(())
    }
}

fn request() -> Request {
    Request::new(Connection::new("conn-1", "ns"))
}

fn chain_of(steps: &[Arc<Step>]) -> Chain {
    Chain::new(
        "composed",
        steps.iter().map(|s| s.clone() as Element).collect(),
    )
}

// ============================================================================
// Request Traversal
// ============================================================================

#[tokio::test]
async fn test_failure_at_each_position() {
    const N: usize = 5;

    for k in 0..N {
        let log = Log::default();
        let steps: Vec<Arc<Step>> = (0..N)
            .map(|i| {
                let step = Step::new(&format!("e{i}"), &log);
                Arc::new(if i == k { step.failing() } else { step })
            })
            .collect();

        let err = chain_of(&steps)
            .process_request(&RequestContext::background(), request())
            .await
            .unwrap_err();

        assert!(
            matches!(&err, ChainError::DataplaneProgrammingFailed { element, .. } if *element == format!("e{k}"))
        );
        for (i, step) in steps.iter().enumerate() {
            let expected = usize::from(i <= k);
            assert_eq!(step.requests.load(Ordering::SeqCst), expected, "k={k} i={i}");
        }
        // No rollback closes
        assert!(log.lock().iter().all(|entry| entry.starts_with("request:")));
    }
}

#[tokio::test]
async fn test_nested_chain_is_an_element() {
    let log = Log::default();
    let inner = Arc::new(Chain::new(
        "inner",
        vec![
            Arc::new(Step::new("b", &log)) as Element,
            Arc::new(Step::new("c", &log)),
        ],
    ));
    let outer = Chain::new(
        "outer",
        vec![
            Arc::new(Step::new("a", &log)) as Element,
            inner as Element,
            Arc::new(Step::new("d", &log)),
        ],
    );

    outer
        .process_request(&RequestContext::background(), request())
        .await
        .unwrap();
    assert_eq!(
        *log.lock(),
        vec!["request:a", "request:b", "request:c", "request:d"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_interrupts_hung_element() {
    let log = Log::default();
    let steps = vec![
        Arc::new(Step::new("first", &log)),
        Arc::new(Step::new("stuck", &log).hanging()),
        Arc::new(Step::new("never", &log)),
    ];

    let ctx = RequestContext::background().with_timeout(Duration::from_millis(200));
    let err = chain_of(&steps)
        .process_request(&ctx, request())
        .await
        .unwrap_err();

    assert!(matches!(err, ChainError::Cancelled { ref element, .. } if element == "stuck"));
    assert!(err.is_recoverable());
    assert_eq!(steps[2].requests.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Close Traversal
// ============================================================================

#[tokio::test]
async fn test_close_visits_every_element() {
    let log = Log::default();
    let steps = vec![
        Arc::new(Step::new("a", &log)),
        Arc::new(Step::new("b", &log).failing_close()),
        Arc::new(Step::new("c", &log)),
        Arc::new(Step::new("d", &log).failing_close()),
    ];

    let err = chain_of(&steps)
        .process_close(&RequestContext::background(), Connection::new("conn-1", "ns"))
        .await
        .unwrap_err();

    assert_eq!(*log.lock(), vec!["close:a", "close:b", "close:c", "close:d"]);
    match err {
        ChainError::CloseFailed { connection_id, failures } => {
            assert_eq!(connection_id, "conn-1");
            let names: Vec<_> = failures.iter().map(|f| f.element.as_str()).collect();
            assert_eq!(names, vec!["b", "d"]);
        }
        other => panic!("expected CloseFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_chain_is_identity() {
    let chain = Chain::new("empty", Vec::new());
    let ctx = RequestContext::background();

    let conn = chain.process_request(&ctx, request()).await.unwrap();
    assert_eq!(conn.id, "conn-1");
    chain.process_close(&ctx, conn).await.unwrap();
}
