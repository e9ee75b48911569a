//! In-memory fakes shared by the unit tests.
//!
//! [`MockRuntime`] behaves like a small container daemon: networks and
//! containers get 64-hex ids, published ports get host ports from the
//! ephemeral range, and every mutating call is appended to an event log so
//! tests can assert ordering.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use crate::database::{ConnectionInfo, ConnectorError, DatabaseConnector};
use crate::error::{Result, RuntimeError, SandboxError};
use crate::fabric::{ROLE_LABEL, RUN_LABEL};
use crate::runtime::{ContainerSpec, ContainerSummary, RuntimeResult, SandboxRuntime};
use crate::sandbox::ImageRef;
use crate::schema::{MigrationReport, SchemaApplier};

pub(crate) const DATABASE_READY: &str = "LOG:  database system is ready to accept connections\n";
pub(crate) const SERVICE_READY: &str = "INFO: Server starting on port 3000\n";

#[derive(Debug, Clone)]
enum Gateway {
    Address(String),
    Empty,
    Unavailable,
}

#[derive(Debug, Clone)]
struct Script {
    lines: Vec<String>,
    exits: bool,
}

#[derive(Debug)]
struct MockNetwork {
    name: String,
    labels: HashMap<String, String>,
}

#[derive(Debug)]
struct MockContainer {
    spec: ContainerSpec,
    host_ports: HashMap<u16, u16>,
    created: i64,
    running: bool,
}

#[derive(Debug)]
struct StaleContainer {
    summary: ContainerSummary,
    logs: String,
}

#[derive(Debug)]
struct MockState {
    counter: u64,
    next_port: u16,
    gateway: Gateway,
    fail_network_creation: bool,
    network_removal_status: Option<u16>,
    fail_listing: bool,
    logs_unavailable: bool,
    hung_pulls: HashSet<String>,
    networks: HashMap<String, MockNetwork>,
    containers: HashMap<String, MockContainer>,
    stale: Vec<StaleContainer>,
    scripts: HashMap<String, Script>,
    start_failures: HashMap<String, String>,
    stop_statuses: HashMap<String, u16>,
    events: Vec<String>,
}

impl MockState {
    fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{:064x}", 0xc0ffee_u64 * 1_000 + self.counter)
    }

    fn network_by_name(&self, name: &str) -> Option<&MockNetwork> {
        self.networks.values().find(|n| n.name == name)
    }

    fn container(&self, id: &str) -> RuntimeResult<&MockContainer> {
        self.containers
            .get(id)
            .ok_or_else(|| RuntimeError::api(404, format!("No such container: {}", id)))
    }
}

/// In-memory [`SandboxRuntime`].
#[derive(Debug)]
pub(crate) struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                counter: 0,
                next_port: 49152,
                gateway: Gateway::Address("172.18.0.1".to_string()),
                fail_network_creation: false,
                network_removal_status: None,
                fail_listing: false,
                logs_unavailable: false,
                hung_pulls: HashSet::new(),
                networks: HashMap::new(),
                containers: HashMap::new(),
                stale: Vec::new(),
                scripts: HashMap::new(),
                start_failures: HashMap::new(),
                stop_statuses: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    /// A runtime where the default database and service images both come up.
    pub(crate) fn healthy() -> Self {
        let runtime = Self::new();
        runtime.script_output(
            "postgres:18-alpine",
            &[
                "initdb: syncing data to disk\n",
                DATABASE_READY,
                "LOG:  database system is shut down\n",
                DATABASE_READY,
            ],
            false,
        );
        runtime.script_output(
            "source-person-service:latest",
            &["INFO: Loading configuration\n", SERVICE_READY],
            false,
        );
        runtime
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    // Behaviour knobs.

    pub(crate) fn fail_network_creation(&self) {
        self.lock().fail_network_creation = true;
    }

    pub(crate) fn set_gateway(&self, gateway: Option<&str>) {
        self.lock().gateway = match gateway {
            Some(address) => Gateway::Address(address.to_string()),
            None => Gateway::Empty,
        };
    }

    pub(crate) fn gateway_unavailable(&self) {
        self.lock().gateway = Gateway::Unavailable;
    }

    pub(crate) fn fail_network_removal(&self, status: u16) {
        self.lock().network_removal_status = Some(status);
    }

    /// Sets what containers of `image` write. If `exits` is false the
    /// stream stays open after the scripted lines.
    pub(crate) fn script_output(&self, image: &str, lines: &[&str], exits: bool) {
        self.lock().scripts.insert(
            image.to_string(),
            Script {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                exits,
            },
        );
    }

    /// Makes pulls of `image` never finish.
    pub(crate) fn hang_pull(&self, image: &str) {
        self.lock().hung_pulls.insert(image.to_string());
    }

    pub(crate) fn fail_start(&self, image: &str, message: &str) {
        self.lock()
            .start_failures
            .insert(image.to_string(), message.to_string());
    }

    pub(crate) fn fail_stop(&self, image: &str, status: u16) {
        self.lock().stop_statuses.insert(image.to_string(), status);
    }

    pub(crate) fn logs_unavailable(&self) {
        self.lock().logs_unavailable = true;
    }

    pub(crate) fn fail_listing(&self) {
        self.lock().fail_listing = true;
    }

    /// Registers a container left over from an earlier run.
    pub(crate) fn add_stale(&self, image: &str, created: i64, logs: &str) -> String {
        self.add_stale_labelled(image, created, logs, HashMap::new())
    }

    /// Registers a leftover container carrying the run label `run_id`.
    pub(crate) fn add_stale_in_run(
        &self,
        image: &str,
        created: i64,
        logs: &str,
        run_id: &str,
    ) -> String {
        let labels = HashMap::from([(RUN_LABEL.to_string(), run_id.to_string())]);
        self.add_stale_labelled(image, created, logs, labels)
    }

    fn add_stale_labelled(
        &self,
        image: &str,
        created: i64,
        logs: &str,
        labels: HashMap<String, String>,
    ) -> String {
        let mut state = self.lock();
        let id = state.next_id();
        state.stale.push(StaleContainer {
            summary: ContainerSummary {
                id: id.clone(),
                image: image.to_string(),
                created,
                labels,
            },
            logs: logs.to_string(),
        });
        id
    }

    pub(crate) fn record(&self, event: impl Into<String>) {
        self.lock().events.push(event.into());
    }

    // Inspection.

    pub(crate) fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub(crate) fn network_count(&self) -> usize {
        self.lock().networks.len()
    }

    pub(crate) fn network_label(&self, id: &str, key: &str) -> Option<String> {
        self.lock()
            .networks
            .get(id)
            .and_then(|n| n.labels.get(key).cloned())
    }

    pub(crate) fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Returns the request a container of `role` was created with.
    pub(crate) fn spec_for_role(&self, role: &str) -> Option<ContainerSpec> {
        self.lock()
            .containers
            .values()
            .find(|c| c.spec.labels.get(ROLE_LABEL).map(String::as_str) == Some(role))
            .map(|c| c.spec.clone())
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<String> {
        let mut state = self.lock();
        if state.fail_network_creation {
            return Err(RuntimeError::api(
                500,
                "could not find an available, non-overlapping IPv4 address pool",
            ));
        }
        let id = state.next_id();
        state.networks.insert(
            id.clone(),
            MockNetwork {
                name: name.to_string(),
                labels: labels.clone(),
            },
        );
        state.events.push(format!("create network {}", name));
        Ok(id)
    }

    async fn network_gateway(&self, network_id: &str) -> RuntimeResult<Option<String>> {
        let state = self.lock();
        if !state.networks.contains_key(network_id) {
            return Err(RuntimeError::api(404, "network not found"));
        }
        match &state.gateway {
            Gateway::Address(address) => Ok(Some(address.clone())),
            Gateway::Empty => Ok(None),
            Gateway::Unavailable => Err(RuntimeError::platform("inspect not supported")),
        }
    }

    async fn remove_network(&self, network_id: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        if let Some(status) = state.network_removal_status {
            return Err(RuntimeError::api(status, "network has active endpoints"));
        }
        let network = state
            .networks
            .remove(network_id)
            .ok_or_else(|| RuntimeError::api(404, "network not found"))?;
        state.events.push(format!("remove network {}", network.name));
        Ok(())
    }

    async fn ensure_image(&self, image: &ImageRef) -> RuntimeResult<()> {
        let hangs = self.lock().hung_pulls.contains(image.reference());
        if hangs {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut state = self.lock();
        if let Some(network) = &spec.network {
            if state.network_by_name(network).is_none() {
                return Err(RuntimeError::api(404, format!("network {} not found", network)));
            }
        }

        let id = state.next_id();
        let mut host_ports = HashMap::new();
        for port in &spec.exposed_ports {
            host_ports.insert(*port, state.next_port);
            state.next_port += 1;
        }
        let created = 1_700_000_000 + state.counter as i64;
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                host_ports,
                created,
                running: false,
            },
        );
        state.events.push(format!("create container {}", spec.name));
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        let image = state.container(container_id)?.spec.image.clone();
        if let Some(message) = state.start_failures.get(&image) {
            return Err(RuntimeError::api(
                500,
                format!("container {} failed to start: {}", container_id, message),
            ));
        }
        // A container whose scripted output ends has already exited.
        let exits = state.scripts.get(&image).is_some_and(|s| s.exits);
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::api(404, "no such container"))?;
        container.running = !exits;
        let name = container.spec.name.clone();
        state.events.push(format!("start container {}", name));
        Ok(())
    }

    fn follow_logs<'a>(&'a self, container_id: &'a str) -> BoxStream<'a, RuntimeResult<String>> {
        let state = self.lock();
        let script = match state.container(container_id) {
            Ok(container) => state.scripts.get(&container.spec.image).cloned(),
            Err(e) => return stream::iter(vec![Err(e)]).boxed(),
        };
        let script = script.unwrap_or(Script {
            lines: Vec::new(),
            exits: false,
        });

        let lines = stream::iter(script.lines.into_iter().map(Ok));
        if script.exits {
            lines.boxed()
        } else {
            lines.chain(stream::pending()).boxed()
        }
    }

    async fn port_mappings(&self, container_id: &str) -> RuntimeResult<HashMap<u16, u16>> {
        Ok(self.lock().container(container_id)?.host_ports.clone())
    }

    async fn stop_container(&self, container_id: &str, _timeout: Duration) -> RuntimeResult<()> {
        let mut state = self.lock();
        let image = state.container(container_id)?.spec.image.clone();
        if let Some(status) = state.stop_statuses.get(&image) {
            return Err(RuntimeError::api(*status, "stop refused"));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::api(404, "no such container"))?;
        if !container.running {
            return Err(RuntimeError::api(304, "container already stopped"));
        }
        container.running = false;
        let name = container.spec.name.clone();
        state.events.push(format!("stop container {}", name));
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        let container = state
            .containers
            .remove(container_id)
            .ok_or_else(|| RuntimeError::api(404, format!("No such container: {}", container_id)))?;
        state
            .events
            .push(format!("remove container {}", container.spec.name));
        Ok(())
    }

    async fn container_logs(&self, container_id: &str) -> RuntimeResult<String> {
        let state = self.lock();
        if state.logs_unavailable {
            return Err(RuntimeError::platform("log driver does not support reading"));
        }
        if let Some(container) = state.containers.get(container_id) {
            return Ok(state
                .scripts
                .get(&container.spec.image)
                .map(|s| s.lines.concat())
                .unwrap_or_default());
        }
        state
            .stale
            .iter()
            .find(|s| s.summary.id == container_id)
            .map(|s| s.logs.clone())
            .ok_or_else(|| RuntimeError::api(404, format!("No such container: {}", container_id)))
    }

    async fn list_by_image(&self, image: &str) -> RuntimeResult<Vec<ContainerSummary>> {
        let state = self.lock();
        if state.fail_listing {
            return Err(RuntimeError::platform("daemon unavailable"));
        }
        let live = state
            .containers
            .iter()
            .filter(|(_, c)| c.spec.image == image)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                image: c.spec.image.clone(),
                created: c.created,
                labels: c.spec.labels.clone(),
            });
        let stale = state
            .stale
            .iter()
            .filter(|s| s.summary.image == image)
            .map(|s| s.summary.clone());
        Ok(live.chain(stale).collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    refuse: AtomicBool,
    fail_close: AtomicBool,
    connected: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

/// Connector that records what it was asked to connect to.
#[derive(Debug, Clone)]
pub(crate) struct FakeConnector {
    runtime: Arc<MockRuntime>,
    state: Arc<ConnectorState>,
}

/// Handle produced by [`FakeConnector`].
#[derive(Debug)]
pub(crate) struct FakeConnection {
    pub(crate) url: String,
}

impl FakeConnector {
    pub(crate) fn new(runtime: Arc<MockRuntime>) -> Self {
        Self {
            runtime,
            state: Arc::default(),
        }
    }

    pub(crate) fn refuse_connections(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_close(&self) {
        self.state.fail_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connected(&self) -> Vec<String> {
        self.state.connected.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseConnector for FakeConnector {
    type Handle = FakeConnection;

    async fn connect(&self, info: &ConnectionInfo) -> std::result::Result<FakeConnection, ConnectorError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        let url = info.url();
        self.state.connected.lock().unwrap().push(url.clone());
        self.runtime.record("connect database");
        Ok(FakeConnection { url })
    }

    async fn close(&self, _handle: FakeConnection) -> std::result::Result<(), ConnectorError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        self.runtime.record("close connection");
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err("connection reset by peer".into());
        }
        Ok(())
    }
}

/// Applier that records the calls it receives.
#[derive(Debug, Clone)]
pub(crate) struct FakeApplier {
    runtime: Arc<MockRuntime>,
    fail: Arc<AtomicBool>,
    applied: Arc<Mutex<Vec<String>>>,
}

impl FakeApplier {
    pub(crate) fn new(runtime: Arc<MockRuntime>) -> Self {
        Self {
            runtime,
            fail: Arc::default(),
            applied: Arc::default(),
        }
    }

    pub(crate) fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaApplier for FakeApplier {
    async fn apply(&self, connection: &ConnectionInfo, schema: &Path) -> Result<MigrationReport> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SandboxError::migration(
                schema.display().to_string(),
                "syntax error at or near \"CREAT\"",
            ));
        }
        self.applied.lock().unwrap().push(connection.url());
        self.runtime.record("apply schema");
        Ok(MigrationReport::default())
    }

    fn name(&self) -> &str {
        "fake"
    }
}
