//! The running service: one pump task, two supervisors, one status reporter.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use meshwatch_link::{DeviceLink, SerialLink, ShutdownToken, available_ports};

use crate::broker::{BrokerClient, MqttBroker, WillMessage};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::monitor::{
    Activity, BrokerTarget, ConnectionHandle, ConnectionState, DeviceTarget, ReconnectPolicy,
    Supervised, next_session, stopped, supervise,
};
use crate::registry::NodeRegistry;
use crate::relay::{EventRelay, RelayStats};
use crate::status::{self, StatusReporter};
use crate::topics::TopicScheme;

/// Runtime settings derived from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub topics: TopicScheme,
    pub policy: ReconnectPolicy,
    /// `None` disables periodic status reports.
    pub status_interval: Option<Duration>,
    /// `None` disables the device staleness check.
    pub stale_after: Option<Duration>,
}

impl BridgeSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            topics: TopicScheme::new(&config.broker.topic_prefix),
            policy: config.reconnect_policy(),
            status_interval: config.status_interval(),
            stale_after: config.stale_after(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// Cloneable handle that asks a running [`Bridge`] to stop.
///
/// [`Bridge::run`] returns once a stop is requested; the caller then runs
/// [`Bridge::shutdown`], which announces the shutdown before the tasks stop.
#[derive(Clone)]
pub struct ShutdownHandle {
    request: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.request.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.request.borrow()
    }
}

/// Relays events from a [`DeviceLink`] to a [`BrokerClient`] and keeps both
/// connected.
pub struct Bridge<L, B> {
    settings: BridgeSettings,
    link: Arc<L>,
    broker: Arc<B>,
    registry: Arc<NodeRegistry>,
    stats: Arc<RelayStats>,
    device_state: ConnectionHandle,
    broker_state: ConnectionHandle,
    activity: Activity,
    nodes_changed: Arc<Notify>,
    relay: Arc<EventRelay<B>>,
    reporter: Arc<StatusReporter<B>>,
    stop_request: Arc<watch::Sender<bool>>,
    shutdown: Arc<ShutdownToken>,
    started: AtomicBool,
}

impl<L: DeviceLink, B: BrokerClient> Bridge<L, B> {
    pub fn new(settings: BridgeSettings, link: L, broker: B) -> Self {
        let link = Arc::new(link);
        let broker = Arc::new(broker);
        let registry = Arc::new(NodeRegistry::new());
        let stats = Arc::new(RelayStats::default());
        let device_state = ConnectionHandle::new(link.name());
        let broker_state = ConnectionHandle::new(broker.name());
        let nodes_changed = Arc::new(Notify::new());

        let relay = Arc::new(EventRelay::new(
            Arc::clone(&broker),
            broker_state.clone(),
            Arc::clone(&registry),
            settings.topics.clone(),
            Arc::clone(&stats),
        ));
        let reporter = Arc::new(StatusReporter::new(
            Arc::clone(&broker),
            broker_state.clone(),
            device_state.clone(),
            Arc::clone(&registry),
            Arc::clone(&stats),
            settings.topics.clone(),
            settings.status_interval,
            Arc::clone(&nodes_changed),
        ));

        Self {
            settings,
            link,
            broker,
            registry,
            stats,
            device_state,
            broker_state,
            activity: Activity::new(),
            nodes_changed,
            relay,
            reporter,
            stop_request: Arc::new(watch::channel(false).0),
            shutdown: Arc::new(ShutdownToken::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn device_state(&self) -> &ConnectionHandle {
        &self.device_state
    }

    pub fn broker_state(&self) -> &ConnectionHandle {
        &self.broker_state
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            request: Arc::clone(&self.stop_request),
        }
    }

    /// Connect to the broker and spawn the background tasks.
    ///
    /// The first broker connection must succeed; the device may still be
    /// absent and is retried by its supervisor.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }

        let broker_target = Arc::new(BrokerTarget::new(
            Arc::clone(&self.broker),
            self.settings.topics.clone(),
        ));
        self.broker_state.set(ConnectionState::Connecting);
        if let Err(e) = broker_target.connect().await {
            self.broker_state.set(ConnectionState::Disconnected);
            return Err(BridgeError::Startup(format!(
                "initial connection to {} failed: {e}",
                self.broker.name()
            )));
        }
        self.broker_state.set(ConnectionState::Connected);

        let device_target = Arc::new(DeviceTarget::new(
            Arc::clone(&self.link),
            Arc::clone(&self.registry),
            self.activity.clone(),
            self.settings.stale_after,
            Arc::clone(&self.nodes_changed),
        ));

        self.shutdown.add_task(tokio::spawn(Arc::clone(&self.reporter).run(
            self.broker.take_inbound(),
            self.shutdown.subscribe(),
        )));
        self.shutdown.add_task(tokio::spawn(pump(
            Arc::clone(&self.link),
            Arc::clone(&self.relay),
            self.device_state.clone(),
            self.activity.clone(),
            self.shutdown.subscribe(),
        )));
        self.shutdown.add_task(tokio::spawn(supervise(
            device_target,
            self.device_state.clone(),
            self.settings.policy,
            self.shutdown.subscribe(),
        )));
        self.shutdown.add_task(tokio::spawn(supervise(
            broker_target,
            self.broker_state.clone(),
            self.settings.policy,
            self.shutdown.subscribe(),
        )));

        info!(
            device = %self.link.name(),
            broker = %self.broker.name(),
            prefix = %self.settings.topics.prefix(),
            "bridge started"
        );
        Ok(())
    }

    /// Wait until a [`ShutdownHandle`] requests a stop.
    pub async fn run(&self) {
        let mut request = self.stop_request.subscribe();
        stopped(&mut request).await;
    }

    /// Announce the shutdown, stop every task, and close both connections.
    pub async fn shutdown(&self) {
        info!(tasks = self.shutdown.task_count(), "shutting down bridge");
        if let Err(e) = self
            .reporter
            .publish_status("bridge_status", "disconnecting", true)
            .await
        {
            debug!(error = %e, "could not announce shutdown");
        }

        self.shutdown.shutdown().await;

        // Supervisors close their targets on exit; this covers a bridge that
        // was never started.
        if let Err(e) = self.link.disconnect().await {
            debug!(error = %e, "device disconnect failed");
        }
        self.broker.disconnect().await;
        self.device_state.set(ConnectionState::Disconnected);
        self.broker_state.set(ConnectionState::Disconnected);

        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            published = stats.published,
            failures = stats.publish_failures,
            dropped = stats.dropped_offline,
            malformed = stats.malformed,
            nodes = self.registry.len(),
            "bridge stopped"
        );
    }
}

/// Forward device events to the relay in receipt order.
///
/// Waits for each new device session, reads until it ends, then reports the
/// failure to the device supervisor and waits for the next one.
async fn pump<L: DeviceLink, B: BrokerClient>(
    link: Arc<L>,
    relay: Arc<EventRelay<B>>,
    device: ConnectionHandle,
    activity: Activity,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state_rx = device.subscribe();
    let mut seen_epoch = 0;

    loop {
        let epoch = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            epoch = next_session(&device, &mut state_rx, seen_epoch) => epoch,
        };
        let Some(epoch) = epoch else { break };
        seen_epoch = epoch;
        debug!(link = %link.name(), session = epoch, "reading device events");

        loop {
            let result = tokio::select! {
                _ = stopped(&mut shutdown) => return,
                result = link.next_event() => result,
            };
            match result {
                Ok(event) => {
                    activity.touch();
                    relay.on_event(event).await;
                }
                Err(e) if e.is_malformed() => {
                    activity.touch();
                    relay.record_malformed(&e);
                }
                Err(e) => {
                    warn!(link = %link.name(), error = %e, "device session ended");
                    device.report_failure();
                    break;
                }
            }
        }
    }
    debug!("event pump stopped");
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT");
    }
}

/// Checks that make the process exit with an error before any connection
/// is attempted.
async fn preflight(config: &BridgeConfig) -> Result<(), BridgeError> {
    config.validate()?;

    if !Path::new(&config.serial_port).exists() {
        let ports = available_ports();
        let listed = if ports.is_empty() {
            "none found".to_string()
        } else {
            ports.join(", ")
        };
        return Err(BridgeError::Startup(format!(
            "serial device {} does not exist (available ports: {listed})",
            config.serial_port
        )));
    }

    let target = format!("{}:{}", config.broker_host, config.broker_port);
    let resolved = tokio::net::lookup_host(&target)
        .await
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false);
    if !resolved {
        return Err(BridgeError::Startup(format!(
            "broker host {} does not resolve",
            config.broker_host
        )));
    }
    Ok(())
}

/// Run the serial-to-MQTT bridge until SIGINT or SIGTERM.
pub async fn run_service(config: BridgeConfig) -> Result<(), BridgeError> {
    preflight(&config).await?;

    let settings = BridgeSettings::from_config(&config);
    let mut mqtt = config.mqtt_settings();
    mqtt.last_will = Some(WillMessage {
        topic: settings.topics.bridge_status(),
        payload: status::offline_payload(),
    });

    let link = SerialLink::new(config.serial_link_config())?;
    let bridge = Bridge::new(settings, link, MqttBroker::new(mqtt));
    bridge.start().await?;

    let handle = bridge.shutdown_handle();
    tokio::spawn(async move {
        termination_signal().await;
        handle.shutdown();
    });

    bridge.run().await;
    bridge.shutdown().await;
    Ok(())
}
