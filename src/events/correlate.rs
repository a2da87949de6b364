//! # Correlation waits: block on a future event with a bound.
//!
//! Workers regularly need to wait for an external event — "the verification
//! email for account X", "the submitted captcha for task Y" — with a
//! workflow-specific timeout. [`Bus::await_once`] is that primitive:
//!
//! ```text
//! await_once(token, timeout, predicate)
//!   ├─ first event matching predicate  → Ok(event), receiver dropped
//!   ├─ timeout elapses                 → Err(TimedOut), receiver dropped
//!   └─ token cancelled                 → Err(Aborted), receiver dropped
//! ```
//!
//! ## Rules
//! - The transient receiver is registered before the wait begins and is
//!   dropped on **every** exit path. A matching event published after the
//!   wait resolved has no effect; there is no residual listener to leak.
//! - Lagged receivers skip the missed window and keep waiting rather than
//!   failing the wait.
//! - [`Bus::request`] subscribes **before** publishing the request, so a
//!   response racing the publish cannot be missed.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CorrelateError;

use super::bus::Bus;
use super::event::Event;

impl Bus {
    /// Waits for the first event matching `pred`, up to `timeout`.
    ///
    /// Resolves with the matching event, or with a distinguishable
    /// [`CorrelateError::TimedOut`] / [`CorrelateError::Aborted`] outcome.
    /// The internal receiver is dropped on every exit path.
    pub async fn await_once<F>(
        &self,
        token: &CancellationToken,
        timeout: Duration,
        pred: F,
    ) -> Result<Event, CorrelateError>
    where
        F: FnMut(&Event) -> bool,
    {
        let rx = self.subscribe();
        self.wait_on(rx, token, timeout, pred).await
    }

    /// Publishes `request` and waits for the first event matching `pred`.
    ///
    /// The receiver is attached before the request goes out, so an answer
    /// published immediately after the request cannot slip past the wait.
    pub async fn request<F>(
        &self,
        token: &CancellationToken,
        timeout: Duration,
        request: Event,
        pred: F,
    ) -> Result<Event, CorrelateError>
    where
        F: FnMut(&Event) -> bool,
    {
        let rx = self.subscribe();
        self.publish(request);
        self.wait_on(rx, token, timeout, pred).await
    }

    async fn wait_on<F>(
        &self,
        mut rx: tokio::sync::broadcast::Receiver<Event>,
        token: &CancellationToken,
        timeout: Duration,
        mut pred: F,
    ) -> Result<Event, CorrelateError>
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Err(CorrelateError::Aborted),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CorrelateError::TimedOut { timeout });
                }
                msg = rx.recv() => match msg {
                    Ok(ev) => {
                        if pred(&ev) {
                            return Ok(ev);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "correlation receiver lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return Err(CorrelateError::Closed),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Payload;

    #[tokio::test]
    async fn test_resolves_with_first_match() {
        let bus = Bus::new(16);
        let token = CancellationToken::new();

        let waiter = {
            let bus = bus.clone();
            let token = token.clone();
            tokio::spawn(async move {
                bus.await_once(&token, Duration::from_secs(5), |ev| {
                    matches!(&ev.payload, Payload::TaskCreated { task_id, .. } if &**task_id == "t2")
                })
                .await
            })
        };

        // Give the waiter time to subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Event::new(Payload::TaskCreated {
            task_id: "t1".into(),
            phone: "0".into(),
        }));
        bus.publish(Event::new(Payload::TaskCreated {
            task_id: "t2".into(),
            phone: "1".into(),
        }));

        let ev = waiter.await.unwrap().unwrap();
        match ev.payload {
            Payload::TaskCreated { task_id, .. } => assert_eq!(&*task_id, "t2"),
            other => panic!("unexpected payload: {}", other.label()),
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_residual_listener() {
        let bus = Bus::new(16);
        let token = CancellationToken::new();

        let res = bus
            .await_once(&token, Duration::from_millis(30), |ev| {
                matches!(ev.payload, Payload::CaptchaSubmitted { .. })
            })
            .await;
        assert!(matches!(res, Err(CorrelateError::TimedOut { .. })));
        assert_eq!(bus.receiver_count(), 0);

        // A late, now-irrelevant match must have no effect.
        bus.publish(Event::new(Payload::CaptchaSubmitted {
            task_id: "t1".into(),
            captcha: "123456".into(),
        }));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_distinguishable_and_cleans_up() {
        let bus = Bus::new(16);
        let token = CancellationToken::new();

        let waiter = {
            let bus = bus.clone();
            let token = token.clone();
            tokio::spawn(async move {
                bus.await_once(&token, Duration::from_secs(30), |_| false).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.receiver_count(), 1);
        token.cancel();

        let res = waiter.await.unwrap();
        assert_eq!(res.unwrap_err(), CorrelateError::Aborted);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_request_cannot_miss_a_fast_response() {
        let bus = Bus::new(16);
        let token = CancellationToken::new();

        // Responder answers the moment it sees the request.
        let responder = {
            let bus = bus.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let req = bus
                    .await_once(&token, Duration::from_secs(5), |ev| {
                        matches!(ev.payload, Payload::AccountRequested { .. })
                    })
                    .await
                    .unwrap();
                if let Payload::AccountRequested { task_id, .. } = req.payload {
                    bus.publish(Event::new(Payload::AccountPrepared {
                        task_id,
                        account: None,
                    }));
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let res = bus
            .request(
                &token,
                Duration::from_secs(5),
                Event::new(Payload::AccountRequested {
                    task_id: "t1".into(),
                    exclude: vec![],
                }),
                |ev| matches!(&ev.payload, Payload::AccountPrepared { task_id, .. } if &**task_id == "t1"),
            )
            .await;
        assert!(res.is_ok());
        responder.await.unwrap();
    }
}
