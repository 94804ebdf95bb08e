//! Service registration for simulated remotes.
//!
//! A [`RegistrationAgent`] advertises one service through its endpoint. The
//! first advertisement is fatal on failure; once it succeeds the agent arms a
//! periodic re-advertisement timer (when an interval is configured) and waits
//! until every exit peer of the service has connected back. Re-advertisement
//! failures are logged and the timer keeps running.
//!
//! At most one timer task is outstanding per agent. Arming replaces the
//! previous task; [`RegistrationAgent::cancel_timer`], destroying the owning
//! [`Remote`] and dropping the last agent handle all stop it. After
//! [`RegistrationAgent::shutdown`] the timer can never be armed again, even
//! by a first registration that was still in flight.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::{CallOptions, RemoteConfig},
    error::{Error, Result},
    mesh::{call_advertise, AdvertiseOp, AdvertiseRequest, AdvertiseResponse, Endpoint, Membership},
    watcher::{ConnectionWatcher, WatchReport},
};

/// Registration lifecycle of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    /// Never registered, withdrawn, or the first registration failed.
    Unregistered,
    /// First advertisement in flight.
    Registering,
    /// Advertised at least once.
    Registered,
    /// Periodic re-advertisement in flight.
    ReRegistering,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => f.write_str("unregistered"),
            RegistrationState::Registering => f.write_str("registering"),
            RegistrationState::Registered => f.write_str("registered"),
            RegistrationState::ReRegistering => f.write_str("re-registering"),
        }
    }
}

/// Handle of the running re-advertisement task.
struct RegistrationTimer {
    shutdown: async_channel::Sender<()>,
    task: JoinHandle<()>,
}

impl RegistrationTimer {
    fn stop(self) {
        self.shutdown.close();
        self.task.abort();
    }
}

struct AgentInner<E> {
    endpoint: Arc<E>,
    service_name: String,
    interval: Duration,
    call: CallOptions,
    state: Mutex<RegistrationState>,
    first: AtomicBool,
    shut_down: AtomicBool,
    timer: Mutex<Option<RegistrationTimer>>,
    registrations: AtomicU64,
}

impl<E> Drop for AgentInner<E> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.stop();
        }
    }
}

/// Advertises one service through an endpoint.
pub struct RegistrationAgent<E> {
    inner: Arc<AgentInner<E>>,
}

impl<E> Clone for RegistrationAgent<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Endpoint> RegistrationAgent<E> {
    /// Create an agent for `service_name` re-advertising every `interval`
    /// (`Duration::ZERO` advertises once).
    pub fn new(
        endpoint: Arc<E>,
        service_name: impl Into<String>,
        interval: Duration,
        call: CallOptions,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                endpoint,
                service_name: service_name.into(),
                interval,
                call,
                state: Mutex::new(RegistrationState::Unregistered),
                first: AtomicBool::new(true),
                shut_down: AtomicBool::new(false),
                timer: Mutex::new(None),
                registrations: AtomicU64::new(0),
            }),
        }
    }

    /// Service this agent advertises.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Re-advertisement interval.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Current registration state.
    pub fn state(&self) -> RegistrationState {
        *self.inner.state.lock()
    }

    /// Successful advertisements so far.
    pub fn registrations(&self) -> u64 {
        self.inner.registrations.load(Ordering::Acquire)
    }

    /// Whether a re-advertisement timer is outstanding.
    pub fn timer_armed(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.task.is_finished())
    }

    /// Whether [`RegistrationAgent::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Send one advertisement.
    pub async fn register(&self) -> Result<AdvertiseResponse> {
        register_once(&self.inner).await
    }

    /// First registration: advertise, arm the timer, then wait until every
    /// exit peer of the service has connected back to the endpoint.
    ///
    /// A failed first advertisement is returned as [`Error::Registration`].
    /// An agent shut down before or during the advertisement returns
    /// [`Error::Closed`] without arming the timer.
    pub async fn start<M: Membership>(&self, watcher: &ConnectionWatcher<M>) -> Result<WatchReport> {
        if self.is_shut_down() {
            return Err(Error::Closed);
        }
        let response = self
            .register()
            .await
            .map_err(|source| Error::Registration {
                service: self.inner.service_name.clone(),
                source: Box::new(source),
            })?;
        if self.is_shut_down() {
            debug!(service = %self.inner.service_name, "agent shut down during first registration");
            return Err(Error::Closed);
        }
        self.inner.first.store(false, Ordering::Release);
        info!(
            service = %self.inner.service_name,
            connections = response.connection_count,
            "service registered"
        );

        if !self.inner.interval.is_zero() {
            self.arm_timer();
        }

        watcher
            .until_connected(
                &self.inner.service_name,
                self.inner.endpoint.channel(),
                &BTreeSet::new(),
            )
            .await
    }

    /// Start (or restart) the re-advertisement timer. Does nothing once the
    /// agent is shut down.
    pub fn arm_timer(&self) {
        // Checked under the timer lock so a concurrent shutdown either sees
        // the new timer or prevents it.
        let mut timer = self.inner.timer.lock();
        if self.is_shut_down() {
            return;
        }
        let (shutdown, shutdown_rx) = async_channel::bounded(1);
        let task = tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            self.inner.interval,
            shutdown_rx,
        ));
        let previous = timer.replace(RegistrationTimer { shutdown, task });
        drop(timer);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Stop the timer for good. Later calls to [`RegistrationAgent::arm_timer`]
    /// and [`RegistrationAgent::start`] are no-ops or fail with
    /// [`Error::Closed`].
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.cancel_timer();
    }

    /// Stop the re-advertisement timer. Returns false if none was armed.
    pub fn cancel_timer(&self) -> bool {
        let timer = self.inner.timer.lock().take();
        match timer {
            Some(timer) => {
                timer.stop();
                true
            }
            None => false,
        }
    }

    /// Stop re-advertising and withdraw the service.
    pub async fn unregister(&self) -> Result<AdvertiseResponse> {
        self.cancel_timer();
        let response = call_advertise(
            &*self.inner.endpoint,
            AdvertiseOp::Withdraw,
            AdvertiseRequest::single(self.inner.service_name.clone()),
            self.inner.call,
        )
        .await?;
        *self.inner.state.lock() = RegistrationState::Unregistered;
        info!(service = %self.inner.service_name, "service withdrawn");
        Ok(response)
    }
}

impl<E> fmt::Debug for RegistrationAgent<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationAgent")
            .field("service_name", &self.inner.service_name)
            .field("interval", &self.inner.interval)
            .field("state", &*self.inner.state.lock())
            .field("registrations", &self.inner.registrations.load(Ordering::Relaxed))
            .finish()
    }
}

async fn register_once<E: Endpoint>(inner: &AgentInner<E>) -> Result<AdvertiseResponse> {
    let first = inner.first.load(Ordering::Acquire);
    *inner.state.lock() = if first {
        RegistrationState::Registering
    } else {
        RegistrationState::ReRegistering
    };

    let result = call_advertise(
        &*inner.endpoint,
        AdvertiseOp::Advertise,
        AdvertiseRequest::single(inner.service_name.clone()),
        inner.call,
    )
    .await;

    *inner.state.lock() = match (&result, first) {
        (Ok(_), _) | (Err(_), false) => RegistrationState::Registered,
        (Err(_), true) => RegistrationState::Unregistered,
    };
    if result.is_ok() {
        inner.registrations.fetch_add(1, Ordering::AcqRel);
    }
    result
}

async fn run_timer<E: Endpoint>(
    agent: Weak<AgentInner<E>>,
    interval: Duration,
    shutdown_rx: async_channel::Receiver<()>,
) {
    loop {
        let tick = tokio::time::sleep(interval).fuse();
        let shutdown = shutdown_rx.recv().fuse();
        futures::pin_mut!(tick, shutdown);

        futures::select! {
            _ = tick => {}
            _ = shutdown => break,
        }

        let Some(inner) = agent.upgrade() else {
            break;
        };
        if inner.shut_down.load(Ordering::SeqCst) {
            break;
        }
        match register_once(&inner).await {
            Ok(response) => debug!(
                service = %inner.service_name,
                connections = response.connection_count,
                "service re-registered"
            ),
            Err(err) => warn!(
                service = %inner.service_name,
                error = %err,
                "periodic registration failed"
            ),
        }
    }
}

/// A simulated service remote: an endpoint plus its registration agent.
pub struct Remote<E> {
    endpoint: Arc<E>,
    agent: RegistrationAgent<E>,
}

impl<E: Endpoint> Remote<E> {
    /// Wrap `endpoint` as a remote configured by `config`.
    pub fn new(endpoint: E, config: &RemoteConfig, call: CallOptions) -> Self {
        let endpoint = Arc::new(endpoint);
        let agent = RegistrationAgent::new(
            endpoint.clone(),
            config.service_name.clone(),
            config.register_every,
            call,
        );
        Self { endpoint, agent }
    }

    /// Service name this remote advertises.
    pub fn service_name(&self) -> &str {
        self.agent.service_name()
    }

    /// The remote's endpoint.
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// The remote's registration agent.
    pub fn agent(&self) -> &RegistrationAgent<E> {
        &self.agent
    }

    /// Bound host:port, once listening.
    pub fn host_port(&self) -> Option<String> {
        self.endpoint.host_port()
    }

    /// Listen, register and wait for the exit peers to connect.
    pub async fn bootstrap<M: Membership>(
        &self,
        watcher: &ConnectionWatcher<M>,
    ) -> Result<WatchReport> {
        let addr = self.endpoint.listen().await?;
        debug!(service = %self.service_name(), %addr, "remote listening");
        self.agent.start(watcher).await
    }

    /// Shut the agent down, then stop the endpoint. Safe to call more than
    /// once.
    pub async fn destroy(&self) {
        self.agent.shutdown();
        self.endpoint.destroy().await;
    }
}

impl<E> fmt::Debug for Remote<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote").field("agent", &self.agent).finish()
    }
}
