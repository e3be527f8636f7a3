use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use tck_core::{access_nested, cast, unflatten, FieldType, HarnessError};

mod normalize;
mod oracle;

pub use normalize::{
    assert_suffix_eq, base64_str_to_bytes, bytes_to_base64_str, bytes_to_latin1_string,
    latin1_string_to_bytes, strip_debug_rendering, verify_bytes_field, NormalizeStrategy,
    Normalizer,
};
pub use oracle::{
    check_micro_serialized, check_serialized_equals, check_status_code, check_validation_message,
    check_validation_result, verify_set_fields, verify_uri_properties, verify_uuid_properties,
    FieldRow, PropertyRow,
};

/// Interval between liveness probes while an agent boots. The reference
/// harness polls at this fixed cadence.
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The fixed set of protocol implementations under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Python,
    Java,
    Rust,
    Cpp,
}

impl AgentKind {
    pub fn parse(base_name: &str) -> Result<AgentKind, HarnessError> {
        match base_name {
            "python" => Ok(AgentKind::Python),
            "java" => Ok(AgentKind::Java),
            "rust" => Ok(AgentKind::Rust),
            "cpp" => Ok(AgentKind::Cpp),
            other => Err(HarnessError::UnsupportedAgentArtifact {
                artifact: other.to_string(),
            }),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AgentKind::Python => "python",
            AgentKind::Java => "java",
            AgentKind::Rust => "rust",
            AgentKind::Cpp => "cpp",
        }
    }

    /// Default artifact location for this implementation inside the
    /// harness image layout.
    pub fn default_artifact(self) -> &'static str {
        match self {
            AgentKind::Python => tck_core::PYTHON_AGENT_PATH,
            AgentKind::Java => tck_core::JAVA_AGENT_PATH,
            AgentKind::Rust => tck_core::RUST_AGENT_PATH,
            AgentKind::Cpp => tck_core::CPP_AGENT_PATH,
        }
    }
}

/// Reduces a qualified agent name (`python_2`) to its base kind name by
/// stripping the `_<digits>` instance qualifier.
pub fn base_agent_name(qualified: &str) -> String {
    match qualified.rsplit_once('_') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            base.to_string()
        }
        _ => qualified.to_string(),
    }
}

/// Parses a scenario entity handle (`uE2`) to its 1-based ordinal.
pub fn parse_entity_ordinal(handle: &str) -> Result<usize, HarnessError> {
    handle
        .strip_prefix("uE")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| HarnessError::MalformedEntityHandle {
            handle: handle.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    pub command: Vec<String>,
}

impl InvocationSpec {
    pub fn program(&self) -> &str {
        &self.command[0]
    }

    pub fn args(&self) -> &[String] {
        &self.command[1..]
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}

/// Builds the OS-level invocation for one agent artifact. The trailing
/// `--transport`/`--sdkname` flags are uniform across every implementation,
/// which is what lets one dispatch client treat all agents identically.
pub fn build_invocation(
    artifact: &Path,
    transport: &str,
    agent_name: &str,
) -> Result<InvocationSpec, HarnessError> {
    let artifact_str = artifact.to_string_lossy().to_string();
    let mut command: Vec<String> = Vec::new();

    if artifact_str.ends_with(".jar") {
        command.push("java".to_string());
        command.push("-jar".to_string());
    } else if artifact_str.ends_with(".py") {
        if cfg!(windows) {
            command.push("python".to_string());
        } else {
            command.push("python3".to_string());
        }
    } else if is_executable(artifact) {
        // direct-exec native agent
    } else if artifact
        .file_name()
        .map(|n| n == "rust_tck")
        .unwrap_or(false)
    {
        // known native agent binary, accepted even before it is built
    } else {
        return Err(HarnessError::UnsupportedAgentArtifact {
            artifact: artifact_str,
        });
    }

    command.push(artifact_str);
    command.push(tck_core::TRANSPORT_FLAG.to_string());
    command.push(transport.to_string());
    command.push(tck_core::SDK_NAME_FLAG.to_string());
    command.push(agent_name.to_string());
    Ok(InvocationSpec { command })
}

/// Starts the agent process: shell-mediated on windows, direct exec on the
/// unix family, refused anywhere else.
pub fn launch(spec: &InvocationSpec) -> Result<Child> {
    if cfg!(windows) {
        let child = Command::new("cmd")
            .arg("/C")
            .args(&spec.command)
            .spawn()?;
        Ok(child)
    } else if cfg!(unix) {
        let child = Command::new(spec.program()).args(spec.args()).spawn()?;
        Ok(child)
    } else {
        Err(HarnessError::UnsupportedPlatform {
            platform: std::env::consts::OS.to_string(),
        }
        .into())
    }
}

/// Live agent processes, tracked per implementation kind. One qualified
/// name is launched at most once; callers gate on the dispatch liveness
/// query before asking for a launch.
#[derive(Debug, Default)]
pub struct AgentPool {
    children: HashMap<AgentKind, Vec<Child>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, kind: AgentKind, child: Child) {
        self.children.entry(kind).or_default().push(child);
    }

    pub fn live_count(&self, kind: AgentKind) -> usize {
        self.children.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Harness-shutdown teardown. Kill failures are ignored; the process
    /// may already have exited.
    pub fn shutdown(&mut self) {
        for children in self.children.values_mut() {
            for child in children.iter_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        self.children.clear();
    }
}

/// Blocks until the dispatch layer reports a live connection for `agent`,
/// probing at `poll` cadence. The wait is bounded: past `timeout` the
/// agent is declared unreachable instead of hanging the scenario run.
pub fn ensure_connected(
    dispatch: &dyn DispatchClient,
    agent: &str,
    poll: Duration,
    timeout: Duration,
) -> Result<(), HarnessError> {
    let deadline = Instant::now() + timeout;
    while !dispatch.has_connection(agent) {
        if Instant::now() >= deadline {
            return Err(HarnessError::ConnectionTimeout {
                agent: agent.to_string(),
                waited_secs: timeout.as_secs(),
            });
        }
        debug!(agent, "waiting for agent to connect");
        std::thread::sleep(poll);
    }
    Ok(())
}

/// Request body shapes accepted by the dispatch layer. Binary-protocol
/// variants travel as latin-1 strings rather than nested JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Serialized(String),
}

impl RequestBody {
    /// Builds the serialized body for a micro-serialized request: the
    /// base64 literal from the scenario (or `<empty>`) becomes latin-1
    /// text the JSON transport can carry losslessly.
    pub fn micro_serialized(expected_b64: &str) -> Result<RequestBody, HarnessError> {
        let encoded = if expected_b64 == "<empty>" {
            ""
        } else {
            expected_b64
        };
        let bytes = normalize::base64_str_to_bytes(encoded)?;
        Ok(RequestBody::Serialized(normalize::bytes_to_latin1_string(
            &bytes,
        )))
    }
}

/// The coordinator-side contract to the transport backing all agents.
/// Synchronous, strictly sequential per agent, never retried.
pub trait DispatchClient {
    fn has_connection(&self, agent: &str) -> bool;
    fn request(&self, agent: &str, command: &str, body: &RequestBody) -> Result<Value>;
    fn last_inbound(&self, agent: &str) -> Result<Value>;
}

/// One dispatched exchange. `extra_decode` is the single-shot tag set at
/// request time when the sender is the implementation whose byte framing
/// needs one more decode pass on the receiving side; it is consumed by the
/// normalization of this envelope only.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub data: Value,
    pub extra_decode: bool,
}

impl ResponseEnvelope {
    pub fn from_wire(wire: Value, extra_decode: bool) -> Result<Self, HarnessError> {
        let data = match wire.get("data") {
            Some(data) => data.clone(),
            None => {
                return Err(HarnessError::AssertionFailure {
                    expected: "a top-level \"data\" field on the response".to_string(),
                    actual: wire.to_string(),
                })
            }
        };
        Ok(Self { data, extra_decode })
    }
}

/// One simulated protocol participant, immutable once registered and
/// referenced ordinally for the rest of the scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub agent_name: String,
    pub transport: String,
    pub uri: String,
}

/// Ordinal-indexed table of scenario participants. Population happens
/// during scenario setup; only the lookup contract matters afterwards.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    records: Vec<EntityRecord>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: EntityRecord) -> usize {
        self.records.push(record);
        self.records.len()
    }

    /// Scenario ordinals are 1-based.
    pub fn resolve(&self, ordinal: usize) -> Result<&EntityRecord, HarnessError> {
        ordinal
            .checked_sub(1)
            .and_then(|idx| self.records.get(idx))
            .ok_or(HarnessError::UnknownEntity { ordinal })
    }

    pub fn resolve_handle(&self, handle: &str) -> Result<&EntityRecord, HarnessError> {
        self.resolve(parse_entity_ordinal(handle)?)
    }
}

/// Request payload under construction across scenario steps: dotted field
/// path to typed value, first write wins. Later sets on a present key are
/// no-ops, which is how scenarios layer defaults under overrides.
#[derive(Debug, Default, Clone)]
pub struct RequestPayload {
    entries: BTreeMap<String, Value>,
}

impl RequestPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(rows: &[FieldRow]) -> Result<Self, HarnessError> {
        let mut payload = Self::new();
        for row in rows {
            let value = cast(&row.value, FieldType::parse(&row.ty)?, true)?;
            payload.set(&row.name, value.to_json());
        }
        Ok(payload)
    }

    pub fn set(&mut self, path: &str, value: Value) {
        self.entries.entry(path.to_string()).or_insert(value);
    }

    pub fn set_str(&mut self, path: &str, value: &str) {
        self.set(path, Value::String(value.to_string()));
    }

    pub fn set_bytes(&mut self, path: &str, value: &str) {
        self.set(
            path,
            Value::String(format!("{}{}", tck_core::BYTES_SENTINEL, value)),
        );
    }

    pub fn set_from_previous(&mut self, path: &str, previous: &Value) {
        self.set(path, previous.clone());
    }

    pub fn set_entity_uri(
        &mut self,
        path: &str,
        registry: &EntityRegistry,
        handle: &str,
    ) -> Result<(), HarnessError> {
        let record = registry.resolve_handle(handle)?;
        self.set_str(path, &record.uri);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path)
    }

    pub fn into_nested(self) -> Result<Value, HarnessError> {
        unflatten(&self.entries, tck_core::PATH_SEPARATOR)
    }
}

/// Scenario-facing front of the orchestration core: one dispatch client,
/// one process pool, one entity registry, driven by a single coordinator
/// thread.
pub struct Harness<D: DispatchClient> {
    dispatch: D,
    pool: AgentPool,
    registry: EntityRegistry,
    connect_timeout: Duration,
}

impl<D: DispatchClient> Harness<D> {
    pub fn new(dispatch: D, connect_timeout: Duration) -> Self {
        Self {
            dispatch,
            pool: AgentPool::new(),
            registry: EntityRegistry::new(),
            connect_timeout,
        }
    }

    pub fn registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.registry
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    /// Materializes the participant behind a scenario ordinal. On first
    /// creation this launches the agent process, waits (bounded) for it to
    /// self-register, then initializes its transport with the participant's
    /// address and checks the reported status code. An already-connected
    /// agent is left untouched: the handshake runs once per connection.
    pub fn materialize_entity(&mut self, ordinal: usize) -> Result<()> {
        let record = self.registry.resolve(ordinal)?.clone();
        let launched = self.materialize_agent(&record.agent_name, &record.transport)?;
        if !launched {
            debug!(agent = %record.agent_name, "agent already connected; skipping handshake");
            return Ok(());
        }
        self.initialize_transport(&record)?;
        info!(agent = %record.agent_name, "agent connected and transport initialized");
        Ok(())
    }

    fn initialize_transport(&self, record: &EntityRecord) -> Result<()> {
        let envelope = self.request(
            &record.agent_name,
            "initialize_transport",
            &RequestBody::Serialized(record.uri.clone()),
        )?;
        let code = access_nested(&envelope.data, "code")?;
        oracle::expect_code_ok(&code)?;
        Ok(())
    }

    /// Ensures a live process + connection for a qualified agent name.
    /// Returns whether a new process was launched; when the dispatch layer
    /// already reports a connection nothing is done.
    pub fn materialize_agent(&mut self, qualified: &str, transport: &str) -> Result<bool> {
        if self.dispatch.has_connection(qualified) {
            return Ok(false);
        }
        let base = base_agent_name(qualified);
        let kind = AgentKind::parse(&base)?;
        let spec = build_invocation(
            &PathBuf::from(kind.default_artifact()),
            transport,
            qualified,
        )?;
        info!(agent = qualified, command = ?spec.command, "launching agent process");
        let child = launch(&spec)?;
        self.pool.track(kind, child);
        ensure_connected(
            &self.dispatch,
            qualified,
            LIVENESS_POLL_INTERVAL,
            self.connect_timeout,
        )?;
        Ok(true)
    }

    /// Dispatches one typed request. The envelope's single-shot
    /// `extra_decode` tag is set here, from the sender kind, for the
    /// normalization of this exchange only.
    pub fn request(
        &self,
        agent: &str,
        command: &str,
        body: &RequestBody,
    ) -> Result<ResponseEnvelope> {
        let kind = AgentKind::parse(&base_agent_name(agent))?;
        debug!(agent, command, "dispatching request");
        let wire = self.dispatch.request(agent, command, body)?;
        if wire.is_null() {
            return Err(anyhow!("response from dispatch client is null"));
        }
        let extra_decode = kind == AgentKind::Rust && command == "send";
        Ok(ResponseEnvelope::from_wire(wire, extra_decode)?)
    }

    pub fn send_payload(
        &self,
        agent: &str,
        command: &str,
        payload: RequestPayload,
    ) -> Result<ResponseEnvelope> {
        let nested = payload.into_nested()?;
        self.request(agent, command, &RequestBody::Json(nested))
    }

    /// Most recent asynchronous inbound message for an agent. The sender
    /// kind of the message determines whether the extra decode pass
    /// applies when the payload is normalized.
    pub fn fetch_inbound(&self, agent: &str, sender: AgentKind) -> Result<ResponseEnvelope> {
        debug!(agent, "fetching last inbound message");
        let wire = self.dispatch.last_inbound(agent)?;
        Ok(ResponseEnvelope::from_wire(
            wire,
            sender == AgentKind::Rust,
        )?)
    }
}
