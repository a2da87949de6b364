//! # Phone-change scheduler: bounded-concurrency admission.
//!
//! One supervised worker owning the in-memory task map. All map mutations
//! happen inside its single select loop — external requests, flow status
//! events, admission ticks, and job completions are serialized there, so no
//! partially-applied state is ever visible across a suspension point.
//!
//! ```text
//! loop {
//!   ├─ tick            → count in-flight; below the ceiling and a pending
//!   │                    task exists → promote exactly one, spawn its job
//!   ├─ bus event       → TaskCreated / CaptchaSubmitted / TaskStatus mirror
//!   ├─ job joined      → terminal outcome: publish, persist, remove task
//!   └─ token cancelled → stop (in-memory tasks are lost; accepted tradeoff)
//! }
//! ```
//!
//! Before its workflow starts, a job binds an account via the correlation
//! layer, excluding accounts bound to other in-flight tasks; if none is
//! available within the bound the task fails immediately with reason
//! "no available account".

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{CorrelateError, FlowError, WorkerError};
use crate::events::{Event, Payload};
use crate::flows::{run_phone_change, DriverFactory};
use crate::store::{Account, Store};
use crate::supervisor::{Worker, WorkerContext};

use super::task::{PhoneChangeTask, PhoneTaskStatus};

/// Supervised scheduler worker for phone-change jobs.
pub struct PhoneScheduler {
    factory: Arc<dyn DriverFactory>,
    cfg: Config,
}

impl PhoneScheduler {
    pub fn new(factory: Arc<dyn DriverFactory>, cfg: &Config) -> Self {
        Self {
            factory,
            cfg: cfg.clone(),
        }
    }

    /// Admits at most one pending task per tick, respecting the ceiling.
    fn admit(
        &self,
        ctx: &WorkerContext,
        tasks: &mut BTreeMap<String, PhoneChangeTask>,
        running: &mut JoinSet<(String, Result<(), FlowError>)>,
    ) {
        let in_flight = tasks.values().filter(|t| t.in_flight).count();
        if in_flight >= self.cfg.max_phone_tasks {
            return;
        }
        let Some(id) = tasks
            .values()
            .find(|t| t.status == PhoneTaskStatus::Pending && !t.in_flight)
            .map(|t| t.task_id.clone())
        else {
            return;
        };
        // Accounts bound to in-flight jobs are off limits for this one.
        let exclude: Vec<String> = tasks
            .values()
            .filter_map(|t| t.bound_account.clone())
            .collect();

        if let Some(task) = tasks.get_mut(&id) {
            task.in_flight = true;
            tracing::info!(task_id = %id, in_flight, "admitting phone-change task");
            let ctx = ctx.clone();
            let factory = self.factory.clone();
            let cfg = self.cfg.clone();
            let phone = task.phone.clone();
            running.spawn(async move {
                let result = std::panic::AssertUnwindSafe(run_job(
                    &ctx, factory, &cfg, &id, &phone, exclude,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(FlowError::Driver {
                        detail: "task execution panicked".to_string(),
                    })
                });
                (id, result)
            });
        }
    }

    /// Applies a job's terminal outcome and drops the task from the map.
    async fn finish(
        &self,
        ctx: &WorkerContext,
        tasks: &mut BTreeMap<String, PhoneChangeTask>,
        task_id: String,
        result: Result<(), FlowError>,
    ) {
        let (status, detail) = match result {
            Ok(()) => (PhoneTaskStatus::Succeeded, None),
            Err(FlowError::Canceled) => {
                // Shutdown mid-job: the in-memory task is simply lost.
                tasks.remove(&task_id);
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, label = e.as_label(), reason = %e, "phone-change task failed");
                (PhoneTaskStatus::Failed, Some(e.to_string()))
            }
        };

        if let Some(mut task) = tasks.remove(&task_id) {
            task.advance(status, detail.clone());
        }
        if let Err(e) = ctx
            .store
            .set_task_outcome(&task_id, status, detail.as_deref())
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "failed to persist task outcome");
        }
        ctx.bus.publish(Event::new(Payload::TaskStatus {
            task_id: Arc::from(task_id.as_str()),
            status,
            detail: detail.map(Arc::from),
        }));
    }

    /// Serialized map mutations driven by bus events.
    fn on_event(&self, tasks: &mut BTreeMap<String, PhoneChangeTask>, ev: Event) {
        match ev.payload {
            Payload::TaskCreated { task_id, phone } => {
                let id = task_id.to_string();
                if tasks.contains_key(&id) {
                    tracing::warn!(task_id = %id, "duplicate task creation, ignoring");
                    return;
                }
                tracing::info!(task_id = %id, phone = %phone, "phone-change task created");
                tasks.insert(id.clone(), PhoneChangeTask::new(id, phone.to_string()));
            }
            Payload::CaptchaSubmitted { task_id, captcha } => {
                match tasks.get_mut(&*task_id) {
                    Some(task) => {
                        task.set_captcha(&*captcha);
                    }
                    None => tracing::warn!(task_id = %task_id, "captcha for unknown task"),
                }
            }
            Payload::TaskStatus {
                task_id,
                status,
                detail,
            } => {
                // Progress published by the running flow, mirrored into the map.
                if let Some(task) = tasks.get_mut(&*task_id) {
                    if status == PhoneTaskStatus::Bound {
                        task.bound_account = detail.as_deref().map(str::to_string);
                    }
                    task.advance(status, detail.as_deref().map(str::to_string));
                }
            }
            other => {
                tracing::trace!(kind = other.label(), "event not for this worker");
            }
        }
    }
}

/// One job: bind an account, then run the workflow against it.
async fn run_job(
    ctx: &WorkerContext,
    factory: Arc<dyn DriverFactory>,
    cfg: &Config,
    task_id: &str,
    phone: &str,
    exclude: Vec<String>,
) -> Result<(), FlowError> {
    let account = bind_account(ctx, cfg, task_id, exclude).await?;
    tracing::info!(task_id, account = %account.account_id, "account bound");
    ctx.bus.publish(Event::new(Payload::TaskStatus {
        task_id: Arc::from(task_id),
        status: PhoneTaskStatus::Bound,
        detail: Some(Arc::from(account.account_id.as_str())),
    }));

    let mut driver = factory.open(&account).await?;
    run_phone_change(driver.as_mut(), ctx, cfg, task_id, &account, phone).await
}

async fn bind_account(
    ctx: &WorkerContext,
    cfg: &Config,
    task_id: &str,
    exclude: Vec<String>,
) -> Result<Account, FlowError> {
    let answer = ctx
        .bus
        .request(
            &ctx.token,
            cfg.bind_wait,
            Event::new(Payload::AccountRequested {
                task_id: Arc::from(task_id),
                exclude,
            }),
            |ev| matches!(&ev.payload, Payload::AccountPrepared { task_id: id, .. } if &**id == task_id),
        )
        .await
        .map_err(|e| match e {
            CorrelateError::TimedOut { .. } => FlowError::NoAccount,
            CorrelateError::Aborted | CorrelateError::Closed => FlowError::Canceled,
        })?;

    match answer.payload {
        Payload::AccountPrepared { account, .. } => account.ok_or(FlowError::NoAccount),
        _ => Err(FlowError::NoAccount),
    }
}

#[async_trait]
impl Worker for PhoneScheduler {
    fn name(&self) -> &str {
        "phone-scheduler"
    }

    async fn run(&self, ctx: WorkerContext) -> Result<(), WorkerError> {
        let mut tasks: BTreeMap<String, PhoneChangeTask> = BTreeMap::new();
        let mut running: JoinSet<(String, Result<(), FlowError>)> = JoinSet::new();
        let mut rx = ctx.bus.subscribe();
        let mut tick = tokio::time::interval(self.cfg.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.token.cancelled() => {
                    running.shutdown().await;
                    return Ok(());
                }
                _ = tick.tick() => {
                    self.admit(&ctx, &mut tasks, &mut running);
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok((task_id, result)) => self.finish(&ctx, &mut tasks, task_id, result).await,
                        Err(e) => tracing::error!(error = %e, "phone-change job join failed"),
                    }
                }
                msg = rx.recv() => match msg {
                    Ok(ev) => self.on_event(&mut tasks, ev),
                    Err(RecvError::Closed) => return Ok(()),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "phone scheduler lagged");
                        continue;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;
    use crate::flows::page::testdriver::{PageStep, ScriptedDriver};
    use crate::flows::page::EGRESS_PROBE_URL;
    use crate::flows::PageDriver;
    use crate::store::{AccountStatus, MemoryStore, Store};
    use crate::supervisor::spawn_account_responder;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn quick_cfg() -> Config {
        Config {
            tick_interval: Duration::from_millis(10),
            bind_wait: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
            step_timeout: Duration::from_millis(50),
            captcha_wait: Duration::from_millis(100),
            max_phone_tasks: 2,
            ..Config::default()
        }
    }

    fn test_ctx(store: Arc<MemoryStore>) -> WorkerContext {
        WorkerContext {
            token: CancellationToken::new(),
            bus: crate::events::Bus::new(256),
            store,
        }
    }

    /// Factory whose drivers immediately fail the region probe, ending each
    /// job quickly with a terminal (non-binding-related) outcome.
    struct FailFastFactory;

    #[async_trait]
    impl DriverFactory for FailFastFactory {
        async fn open(&self, _account: &Account) -> Result<Box<dyn PageDriver>, PageError> {
            Ok(Box::new(ScriptedDriver::new(
                PageStep::default(),
                vec![PageStep {
                    url: EGRESS_PROBE_URL.into(),
                    text: r#"{"ip":"203.0.113.9","country":"US"}"#.into(),
                    ..Default::default()
                }],
            )))
        }
    }

    async fn create_and_announce(ctx: &WorkerContext, store: &MemoryStore, id: &str) {
        store.create_task(id, "08011112222").await.unwrap();
        ctx.bus.publish(Event::new(Payload::TaskCreated {
            task_id: id.into(),
            phone: "08011112222".into(),
        }));
    }

    #[tokio::test]
    async fn test_binding_timeout_fails_task_with_reason() {
        // No responder is running: the binding wait must time out and the
        // task must fail with exactly "no available account".
        let store = Arc::new(MemoryStore::new());
        let ctx = test_ctx(store.clone());
        let scheduler = Arc::new(PhoneScheduler::new(Arc::new(FailFastFactory), &quick_cfg()));

        let token = ctx.token.clone();
        let handle = {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { scheduler.run(ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        create_and_announce(&ctx, &store, "t1").await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let (status, detail) = store.task_status("t1").await.unwrap();
        assert_eq!(status, PhoneTaskStatus::Failed);
        assert_eq!(detail.as_deref(), Some("no available account"));
    }

    #[tokio::test]
    async fn test_bound_account_is_excluded_from_second_task() {
        // One registered account; the first task binds it and stalls in its
        // captcha wait. A second task then finds nothing bindable.
        let store = Arc::new(MemoryStore::new());
        let mut acc = Account::new("a@x", "password123");
        acc.status = AccountStatus::Registered;
        store.upsert_accounts(vec![acc]).await.unwrap();

        let ctx = test_ctx(store.clone());
        let _responder =
            spawn_account_responder(ctx.bus.clone(), store.clone(), ctx.token.child_token());

        // Drivers stall after login's first poll, keeping the job in flight
        // long enough to hold its binding.
        struct StallFactory;
        #[async_trait]
        impl DriverFactory for StallFactory {
            async fn open(&self, _account: &Account) -> Result<Box<dyn PageDriver>, PageError> {
                Ok(Box::new(ScriptedDriver::new(
                    PageStep::default(),
                    vec![PageStep {
                        url: EGRESS_PROBE_URL.into(),
                        text: r#"{"ip":"203.0.113.9","country":"JP"}"#.into(),
                        ..Default::default()
                    }],
                )))
            }
        }

        let cfg = Config {
            // Long step timeout keeps task 1 occupying its binding while
            // task 2 goes through admission.
            step_timeout: Duration::from_secs(5),
            ..quick_cfg()
        };
        let scheduler = Arc::new(PhoneScheduler::new(Arc::new(StallFactory), &cfg));
        let token = ctx.token.clone();
        let handle = {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { scheduler.run(ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut rx = ctx.bus.subscribe();
        create_and_announce(&ctx, &store, "t1").await;
        // Wait until task 1 holds the account before creating task 2.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut bound = false;
        while !bound {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(ev)) => {
                    bound = matches!(
                        &ev.payload,
                        Payload::TaskStatus { task_id, status: PhoneTaskStatus::Bound, .. }
                            if &**task_id == "t1"
                    );
                }
                _ => break,
            }
        }
        assert!(bound);

        create_and_announce(&ctx, &store, "t2").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (status, detail) = store.task_status("t2").await.unwrap();
        assert_eq!(status, PhoneTaskStatus::Failed);
        assert_eq!(detail.as_deref(), Some("no available account"));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_creation_ignored() {
        let store = Arc::new(MemoryStore::new());
        let ctx = test_ctx(store.clone());
        let scheduler = PhoneScheduler::new(Arc::new(FailFastFactory), &quick_cfg());

        let mut tasks = BTreeMap::new();
        scheduler.on_event(
            &mut tasks,
            Event::new(Payload::TaskCreated {
                task_id: "t1".into(),
                phone: "1".into(),
            }),
        );
        scheduler.on_event(
            &mut tasks,
            Event::new(Payload::TaskCreated {
                task_id: "t1".into(),
                phone: "2".into(),
            }),
        );
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks["t1"].phone, "1");
        drop(ctx);
    }

    #[tokio::test]
    async fn test_admission_respects_ceiling_and_promotes_one_per_tick() {
        let store = Arc::new(MemoryStore::new());
        let ctx = test_ctx(store.clone());
        let cfg = Config {
            max_phone_tasks: 1,
            ..quick_cfg()
        };
        let scheduler = PhoneScheduler::new(Arc::new(FailFastFactory), &cfg);

        let mut tasks = BTreeMap::new();
        tasks.insert("t1".to_string(), PhoneChangeTask::new("t1", "1"));
        tasks.insert("t2".to_string(), PhoneChangeTask::new("t2", "2"));

        let mut running = JoinSet::new();
        scheduler.admit(&ctx, &mut tasks, &mut running);
        assert_eq!(tasks.values().filter(|t| t.in_flight).count(), 1);

        // Ceiling reached: the second tick admits nothing.
        scheduler.admit(&ctx, &mut tasks, &mut running);
        assert_eq!(tasks.values().filter(|t| t.in_flight).count(), 1);
        running.shutdown().await;
    }
}
