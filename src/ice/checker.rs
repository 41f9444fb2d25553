use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::transaction::TransactionTracker;
use super::{CheckError, Session};
use crate::io::StunMessage;

/// How a single check transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Binding success response.
    Success(StunMessage),
    /// Binding error response.
    Failure(StunMessage),
    /// Nothing came back within the timeout.
    NoResponse,
    /// The check was canceled, or the session is closing.
    Canceled,
}

/// Performs one connectivity check over one session.
///
/// A checker is single use: [`ConnectivityChecker::check`] may only be
/// called once. Retransmissions use a new checker with a new transaction id.
pub struct ConnectivityChecker {
    session: Arc<dyn Session>,
    tracker: Arc<TransactionTracker>,
    password: String,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl ConnectivityChecker {
    pub fn new(
        session: Arc<dyn Session>,
        tracker: Arc<TransactionTracker>,
        password: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        ConnectivityChecker {
            session,
            tracker,
            password: password.into(),
            cancel,
            started: AtomicBool::new(false),
        }
    }

    /// Cancel an ongoing check. The check reports [`CheckOutcome::Canceled`]
    /// unless a response was already delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Send the request and wait up to `rto` for the response.
    pub async fn check(
        &self,
        request: &StunMessage,
        rto: Duration,
    ) -> Result<CheckOutcome, CheckError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CheckError::Reentrant);
        }

        if self.session.is_closing() || self.cancel.is_cancelled() {
            return Ok(CheckOutcome::Canceled);
        }

        let trans_id = request.trans_id();
        let mut waiter = self.tracker.add_transaction(
            trans_id,
            self.session.local_addr(),
            self.session.remote_addr(),
        )?;

        trace!("Send STUN request: {:?}", request);
        if let Err(e) = self.session.write(request, &self.password) {
            self.tracker.remove(trans_id);
            return Err(e.into());
        }

        let outcome = tokio::select! {
            biased;

            res = &mut waiter => match res {
                Ok(response) => return Ok(Self::verdict(response)),
                // Tracker dropped the sender without a response.
                Err(_) => CheckOutcome::Canceled,
            },
            _ = self.cancel.cancelled() => CheckOutcome::Canceled,
            _ = sleep(rto) => CheckOutcome::NoResponse,
        };

        self.tracker.remove(trans_id);

        // Once unregistered nothing more can arrive. A response that got
        // through before that still wins over cancel and timeout.
        if let Ok(response) = waiter.try_recv() {
            return Ok(Self::verdict(response));
        }

        Ok(outcome)
    }

    fn verdict(response: StunMessage) -> CheckOutcome {
        if response.is_successful_binding_response() {
            CheckOutcome::Success(response)
        } else {
            CheckOutcome::Failure(response)
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use parking_lot::Mutex;

    use super::*;
    use crate::io::{NetError, TransId};

    struct Loopback {
        closing: bool,
        sent: Mutex<Vec<StunMessage>>,
        // Answer every request right from write().
        answer: Option<Arc<TransactionTracker>>,
    }

    impl Session for Loopback {
        fn local_addr(&self) -> SocketAddr {
            "10.0.0.1:5000".parse().unwrap()
        }

        fn remote_addr(&self) -> SocketAddr {
            "10.0.0.2:5000".parse().unwrap()
        }

        fn is_closing(&self) -> bool {
            self.closing
        }

        fn write(&self, message: &StunMessage, _password: &str) -> Result<(), NetError> {
            self.sent.lock().push(message.clone());
            if let Some(tracker) = &self.answer {
                let reply = StunMessage::reply(message.trans_id(), self.local_addr());
                tracker.on_response(reply, self.remote_addr());
            }
            Ok(())
        }
    }

    fn setup(closing: bool, answer: bool) -> (Arc<Loopback>, Arc<TransactionTracker>) {
        let tracker = Arc::new(TransactionTracker::new());
        let session = Arc::new(Loopback {
            closing,
            sent: Mutex::new(vec![]),
            answer: answer.then(|| tracker.clone()),
        });
        (session, tracker)
    }

    fn request() -> StunMessage {
        StunMessage::binding_request("a:b", TransId::new(), true, 1, 1, false)
    }

    #[tokio::test]
    async fn success_from_response() {
        let (session, tracker) = setup(false, true);
        let checker =
            ConnectivityChecker::new(session, tracker.clone(), "pass", CancellationToken::new());

        let outcome = checker
            .check(&request(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Success(_)));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn second_call_is_reentrant() {
        let (session, tracker) = setup(false, true);
        let checker = ConnectivityChecker::new(session, tracker, "pass", CancellationToken::new());

        checker
            .check(&request(), Duration::from_millis(100))
            .await
            .unwrap();
        let err = checker
            .check(&request(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Reentrant));
    }

    #[tokio::test(start_paused = true)]
    async fn no_response_times_out() {
        let (session, tracker) = setup(false, false);
        let checker =
            ConnectivityChecker::new(session.clone(), tracker.clone(), "pass", CancellationToken::new());

        let outcome = checker
            .check(&request(), Duration::from_millis(250))
            .await
            .unwrap();
        assert_eq!(outcome, CheckOutcome::NoResponse);
        assert_eq!(session.sent.lock().len(), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn closing_session_cancels_without_sending() {
        let (session, tracker) = setup(true, false);
        let checker =
            ConnectivityChecker::new(session.clone(), tracker, "pass", CancellationToken::new());

        let outcome = checker
            .check(&request(), Duration::from_millis(250))
            .await
            .unwrap();
        assert_eq!(outcome, CheckOutcome::Canceled);
        assert!(session.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_waiting_check() {
        let (session, tracker) = setup(false, false);
        let cancel = CancellationToken::new();
        let checker = Arc::new(ConnectivityChecker::new(
            session,
            tracker.clone(),
            "pass",
            cancel.clone(),
        ));

        let c = checker.clone();
        let task =
            tokio::spawn(async move { c.check(&request(), Duration::from_secs(60)).await });

        tokio::task::yield_now().await;
        checker.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, CheckOutcome::Canceled);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn response_racing_cancel_wins() {
        // The response is delivered and the checker canceled before it gets
        // to look at either.
        let tracker = Arc::new(TransactionTracker::new());
        let session = Arc::new(Loopback {
            closing: false,
            sent: Mutex::new(vec![]),
            answer: Some(tracker.clone()),
        });
        let cancel = CancellationToken::new();
        let checker = ConnectivityChecker::new(session, tracker, "pass", cancel.clone());
        cancel.cancel();

        // Canceled before start means no send at all.
        let outcome = checker
            .check(&request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, CheckOutcome::Canceled);

        // Canceled while in flight with the response already delivered.
        let tracker = Arc::new(TransactionTracker::new());
        let cancel = CancellationToken::new();
        let session = Arc::new(CancelOnWrite {
            inner: Loopback {
                closing: false,
                sent: Mutex::new(vec![]),
                answer: Some(tracker.clone()),
            },
            cancel: cancel.clone(),
        });
        let checker = ConnectivityChecker::new(session, tracker, "pass", cancel);
        let outcome = checker
            .check(&request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Success(_)));
    }

    struct CancelOnWrite {
        inner: Loopback,
        cancel: CancellationToken,
    }

    impl Session for CancelOnWrite {
        fn local_addr(&self) -> SocketAddr {
            self.inner.local_addr()
        }

        fn remote_addr(&self) -> SocketAddr {
            self.inner.remote_addr()
        }

        fn is_closing(&self) -> bool {
            false
        }

        fn write(&self, message: &StunMessage, password: &str) -> Result<(), NetError> {
            self.inner.write(message, password)?;
            self.cancel.cancel();
            Ok(())
        }
    }
}
