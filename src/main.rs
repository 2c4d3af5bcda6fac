use chrono::Utc;
use clap::{Parser, Subcommand};
use dirs::home_dir;
use nix::sys::signal::{killpg, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{setsid, Pid};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

const SCRIPT_MARKER: &str = "# corral-launch";
const ENTRYPOINT_FILE: &str = "main.py";
const KEY_FILE: &str = "swarm.pem";
const API_KEY_FILE: &str = "userApiKey.json";
const USER_DATA_FILE: &str = "userData.json";
const REQUIRED_FILES: [&str; 4] = [KEY_FILE, API_KEY_FILE, USER_DATA_FILE, ENTRYPOINT_FILE];
const CREDENTIALS_DIR: &str = "credentials";
const CREDENTIAL_TEMPLATES: [&str; 3] = [KEY_FILE, API_KEY_FILE, USER_DATA_FILE];

const CANCEL_POLL_SLICE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "corral", version, about = "Corral CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Prepare,
    Status,
    Run {
        #[arg(long)]
        node: Option<u32>,
    },
    Script {
        node: u32,
        #[arg(long, default_value_t = false)]
        print: bool,
    },
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },
    Paths,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Edit,
    Validate,
}

#[derive(Subcommand, Debug)]
enum LogsCommand {
    List {
        #[arg(long)]
        node: Option<u32>,
    },
    Tail {
        node: u32,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Debug, Error)]
enum CorralError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("signal error: {0}")]
    Signal(String),
}

#[derive(Debug, Error)]
enum StartError {
    #[error("missing required artifacts: {} (provision the node or run `corral prepare`)", .0.join(", "))]
    NotReady(Vec<String>),
    #[error("node is already running")]
    AlreadyRunning,
    #[error("failed to write launch script: {0}")]
    Script(#[source] io::Error),
    #[error("failed to spawn launch script: {0}")]
    Spawn(#[source] io::Error),
}

impl StartError {
    fn kind(&self) -> &'static str {
        match self {
            StartError::NotReady(_) => "not_ready",
            StartError::AlreadyRunning => "already_running",
            StartError::Script(_) => "script",
            StartError::Spawn(_) => "spawn",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    paths: Paths,
    fleet: FleetConfig,
    timing: TimingConfig,
    gpu: GpuConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Paths {
    cluster_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct FleetConfig {
    nodes: u32,
    base_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct TimingConfig {
    stagger_secs: u64,
    grace_secs: u64,
    poll_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct GpuConfig {
    visible_devices: String,
    memory_fraction: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            fleet: FleetConfig::default(),
            timing: TimingConfig::default(),
            gpu: GpuConfig::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            cluster_root: "~/swarm-cluster".to_string(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            nodes: 10,
            base_port: 8000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stagger_secs: 3,
            grace_secs: 3,
            poll_secs: 30,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            visible_devices: "0".to_string(),
            memory_fraction: 0.1,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn main() -> Result<(), CorralError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Prepare => handle_prepare(&ctx),
        Commands::Status => handle_status(&ctx),
        Commands::Run { node } => handle_run(&ctx, node, UnixProcessBackend),
        Commands::Script { node, print } => handle_script(&ctx, node, print),
        Commands::Logs { command } => handle_logs(&ctx, command),
        Commands::Paths => handle_paths(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CORRAL_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("CORRAL_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("corral");
    base
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config_from_str(content: &str) -> Result<Config, CorralError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(CorralError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<Config, CorralError> {
    if !path.exists() {
        return Err(CorralError::Config(format!(
            "config not found at {}; run `corral config init` first",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn validate_config(cfg: &Config) -> Result<(), CorralError> {
    if env::consts::OS != "macos" && env::consts::OS != "linux" {
        return Err(CorralError::Config(format!(
            "unsupported host operating system '{}'; supported: macos, linux",
            env::consts::OS
        )));
    }
    if cfg.paths.cluster_root.trim().is_empty() {
        return Err(CorralError::Config(
            "paths.cluster_root must be non-empty".to_string(),
        ));
    }
    if cfg.fleet.nodes == 0 {
        return Err(CorralError::Config(
            "fleet.nodes must be greater than 0".to_string(),
        ));
    }
    if cfg.fleet.base_port == 0 {
        return Err(CorralError::Config(
            "fleet.base_port must be greater than 0".to_string(),
        ));
    }
    if u32::from(cfg.fleet.base_port) + cfg.fleet.nodes > u32::from(u16::MAX) {
        return Err(CorralError::Config(format!(
            "fleet.base_port + fleet.nodes exceeds the maximum port ({} + {} > {})",
            cfg.fleet.base_port,
            cfg.fleet.nodes,
            u16::MAX
        )));
    }
    if cfg.timing.poll_secs == 0 {
        return Err(CorralError::Config(
            "timing.poll_secs must be greater than 0".to_string(),
        ));
    }
    if cfg.gpu.memory_fraction <= 0.0 || cfg.gpu.memory_fraction > 1.0 {
        return Err(CorralError::Config(
            "gpu.memory_fraction must be within (0, 1]".to_string(),
        ));
    }
    Ok(())
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

#[derive(Debug, Clone)]
struct FleetSettings {
    cluster_root: PathBuf,
    nodes: u32,
    base_port: u16,
    stagger: Duration,
    grace: Duration,
    poll_interval: Duration,
    gpu: GpuConfig,
}

impl FleetSettings {
    fn from_config(cfg: &Config) -> Self {
        Self {
            cluster_root: PathBuf::from(expand_path(&cfg.paths.cluster_root)),
            nodes: cfg.fleet.nodes,
            base_port: cfg.fleet.base_port,
            stagger: Duration::from_secs(cfg.timing.stagger_secs),
            grace: Duration::from_secs(cfg.timing.grace_secs),
            poll_interval: Duration::from_secs(cfg.timing.poll_secs),
            gpu: cfg.gpu.clone(),
        }
    }

    fn descriptor(&self, node_id: u32) -> NodeDescriptor {
        NodeDescriptor {
            node_id,
            dir: self.cluster_root.join(format!("node_{node_id}")),
            port: self.base_port + node_id as u16,
        }
    }
}

fn validate_node_id(settings: &FleetSettings, node_id: u32) -> Result<(), CorralError> {
    if node_id == 0 || node_id > settings.nodes {
        return Err(CorralError::Config(format!(
            "node id must be between 1 and {}, got {}",
            settings.nodes, node_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct NodeDescriptor {
    node_id: u32,
    dir: PathBuf,
    port: u16,
}

impl NodeDescriptor {
    fn name(&self) -> String {
        format!("node_{}", self.node_id)
    }

    fn venv_name(&self) -> String {
        format!("venv_node_{}", self.node_id)
    }

    fn script_path(&self) -> PathBuf {
        self.dir.join(format!("run_node_{}.sh", self.node_id))
    }
}

#[derive(Debug, Clone)]
struct Readiness {
    missing: Vec<String>,
}

impl Readiness {
    fn is_ready(&self) -> bool {
        self.missing.is_empty()
    }
}

fn check_ready(node: &NodeDescriptor) -> Readiness {
    let mut missing = Vec::new();
    for name in REQUIRED_FILES {
        if !node.dir.join(name).is_file() {
            missing.push(name.to_string());
        }
    }
    if !node.dir.join(node.venv_name()).is_dir() {
        missing.push(node.venv_name());
    }
    Readiness { missing }
}

fn launch_script_body(node: &NodeDescriptor, gpu: &GpuConfig) -> String {
    format!(
        r#"#!/usr/bin/env bash
{marker}
set -u

NODE_ID="{name}"
PORT={port}

echo "starting ${{NODE_ID}} on port ${{PORT}}"

if [ ! -f "{venv}/bin/activate" ]; then
    echo "{name}: isolated runtime missing: {venv}" >&2
    exit 1
fi
source "{venv}/bin/activate"

for required in {key} {api} {data} {entry}; do
    if [ ! -f "${{required}}" ]; then
        echo "{name}: missing required file: ${{required}}" >&2
        exit 1
    fi
done

chmod 600 {key}

export NODE_ID="${{NODE_ID}}"
export PORT="${{PORT}}"
export CUDA_VISIBLE_DEVICES="{devices}"
export GPU_MEMORY_FRACTION="{fraction}"
export PYTORCH_CUDA_ALLOC_CONF="max_split_size_mb:8192"
export TF_MEMORY_GROWTH=true

mkdir -p logs
LOG_FILE="logs/{name}_$(date +%Y%m%d_%H%M%S).log"
echo "logging to ${{LOG_FILE}}"

python {entry} \
    --node-id "${{NODE_ID}}" \
    --port "${{PORT}}" \
    --gpu-memory-fraction "{fraction}" \
    2>&1 | tee "${{LOG_FILE}}"
EXIT_CODE=${{PIPESTATUS[0]}}

deactivate
exit ${{EXIT_CODE}}
"#,
        marker = SCRIPT_MARKER,
        name = node.name(),
        port = node.port,
        venv = node.venv_name(),
        key = KEY_FILE,
        api = API_KEY_FILE,
        data = USER_DATA_FILE,
        entry = ENTRYPOINT_FILE,
        devices = gpu.visible_devices,
        fraction = gpu.memory_fraction,
    )
}

fn write_launch_script(node: &NodeDescriptor, gpu: &GpuConfig) -> io::Result<PathBuf> {
    let path = node.script_path();
    write_atomic_text_file(&path, &launch_script_body(node, gpu), Some(0o755))?;
    Ok(path)
}

fn node_environment(node: &NodeDescriptor, gpu: &GpuConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("NODE_ID".to_string(), node.name());
    env.insert(
        "CUDA_VISIBLE_DEVICES".to_string(),
        gpu.visible_devices.clone(),
    );
    env.insert(
        "GPU_MEMORY_FRACTION".to_string(),
        gpu.memory_fraction.to_string(),
    );
    env
}

fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> io::Result<()> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "corral".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn restrict_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "exit code {code}")
        } else if let Some(signal) = self.signal {
            write!(f, "{}", signal_name(signal))
        } else {
            write!(f, "unknown exit")
        }
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        n => format!("SIG{}", n),
    }
}

trait NodeHandle {
    fn pid(&self) -> u32;
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;
    fn force_kill(&mut self) -> io::Result<()>;
}

trait ProcessBackend {
    fn spawn(
        &self,
        script: &Path,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> io::Result<Box<dyn NodeHandle>>;
    fn terminate_group(&self, pgid: u32) -> io::Result<()>;
}

struct UnixProcessBackend;

struct ChildHandle {
    child: Child,
}

impl NodeHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from_status))
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

impl ProcessBackend for UnixProcessBackend {
    fn spawn(
        &self,
        script: &Path,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> io::Result<Box<dyn NodeHandle>> {
        let mut cmd = Command::new(script);
        cmd.current_dir(cwd).stdin(Stdio::null());
        for (key, value) in env {
            cmd.env(key, value);
        }
        // The script becomes a session and process-group leader, so group
        // signals reach any grandchildren it spawns.
        unsafe {
            cmd.pre_exec(|| setsid().map(|_| ()).map_err(io::Error::from));
        }
        let child = cmd.spawn()?;
        Ok(Box::new(ChildHandle { child }))
    }

    fn terminate_group(&self, pgid: u32) -> io::Result<()> {
        killpg(Pid::from_raw(pgid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Starting,
    Running,
    Exited(ExitInfo),
    Killed,
}

struct NodeProcess {
    node_id: u32,
    pgid: u32,
    script_path: PathBuf,
    state: NodeState,
    handle: Box<dyn NodeHandle>,
}

#[derive(Debug, Default)]
struct FleetStartReport {
    started: Vec<u32>,
    failed: Vec<(u32, StartError)>,
}

struct Supervisor<B: ProcessBackend> {
    backend: B,
    settings: FleetSettings,
    table: Vec<NodeProcess>,
}

impl<B: ProcessBackend> Supervisor<B> {
    fn new(backend: B, settings: FleetSettings) -> Self {
        Self {
            backend,
            settings,
            table: Vec::new(),
        }
    }

    fn total_nodes(&self) -> u32 {
        self.settings.nodes
    }

    fn start_node(&mut self, node_id: u32) -> Result<u32, StartError> {
        if self.table.iter().any(|record| record.node_id == node_id) {
            return Err(StartError::AlreadyRunning);
        }
        let node = self.settings.descriptor(node_id);
        let readiness = check_ready(&node);
        if !readiness.is_ready() {
            return Err(StartError::NotReady(readiness.missing));
        }
        let script_path =
            write_launch_script(&node, &self.settings.gpu).map_err(StartError::Script)?;
        let env = node_environment(&node, &self.settings.gpu);
        let handle = self
            .backend
            .spawn(&script_path, &node.dir, &env)
            .map_err(StartError::Spawn)?;
        let pgid = handle.pid();
        self.table.push(NodeProcess {
            node_id,
            pgid,
            script_path,
            state: NodeState::Starting,
            handle,
        });
        Ok(pgid)
    }

    fn start_all(&mut self, cancel: &AtomicBool) -> FleetStartReport {
        let mut report = FleetStartReport::default();
        let total = self.settings.nodes;
        println!("starting {} node(s)", total);
        for node_id in 1..=total {
            if cancel.load(Ordering::SeqCst) {
                println!("shutdown requested; skipping remaining starts");
                break;
            }
            match self.start_node(node_id) {
                Ok(pid) => {
                    println!("node_{}: started (pid {})", node_id, pid);
                    report.started.push(node_id);
                    if node_id < total {
                        sleep_interruptible(self.settings.stagger, cancel);
                    }
                }
                Err(err) => {
                    println!("node_{}: start failed: {}", node_id, err);
                    report.failed.push((node_id, err));
                }
            }
        }
        println!("started {}/{} node(s)", report.started.len(), total);
        report
    }

    fn stop_node(&mut self, node_id: u32) {
        let Some(record) = self.table.iter().find(|record| record.node_id == node_id) else {
            println!("node_{}: not tracked, nothing to stop", node_id);
            return;
        };
        match self.backend.terminate_group(record.pgid) {
            Ok(()) => println!("node_{}: sent SIGTERM to group {}", node_id, record.pgid),
            Err(err) => println!("node_{}: group signal not delivered: {}", node_id, err),
        }
    }

    fn stop_all(&mut self) {
        if self.table.is_empty() {
            return;
        }
        println!("stopping {} node(s)", self.table.len());
        for record in &self.table {
            match self.backend.terminate_group(record.pgid) {
                Ok(()) => println!(
                    "node_{}: sent SIGTERM to group {}",
                    record.node_id, record.pgid
                ),
                Err(err) => println!(
                    "node_{}: group signal not delivered: {}",
                    record.node_id, err
                ),
            }
        }
        thread::sleep(self.settings.grace);
        for record in &mut self.table {
            match record.handle.try_wait() {
                Ok(Some(info)) => {
                    record.state = NodeState::Exited(info);
                    println!("node_{}: exited ({})", record.node_id, info);
                }
                Ok(None) => {
                    match record.handle.force_kill() {
                        Ok(()) => println!(
                            "node_{}: force killed pid {}",
                            record.node_id,
                            record.handle.pid()
                        ),
                        Err(err) => {
                            println!("node_{}: force kill failed: {}", record.node_id, err)
                        }
                    }
                    record.state = NodeState::Killed;
                }
                Err(err) => {
                    println!("node_{}: wait failed: {}", record.node_id, err);
                    record.state = NodeState::Killed;
                }
            }
        }
        // Tracking is dropped even for processes not confirmed dead; the
        // supervisor never blocks indefinitely on uncooperative children.
        let dropped = self.table.len();
        self.table.clear();
        println!("fleet stopped; dropped tracking for {} node(s)", dropped);
    }

    fn poll(&mut self) {
        for record in &mut self.table {
            match record.state {
                NodeState::Starting | NodeState::Running => {}
                _ => continue,
            }
            match record.handle.try_wait() {
                Ok(Some(info)) => record.state = NodeState::Exited(info),
                Ok(None) => record.state = NodeState::Running,
                Err(err) => println!("node_{}: liveness check failed: {}", record.node_id, err),
            }
        }
    }

    fn remove_exited(&mut self) -> Vec<(u32, ExitInfo)> {
        let mut finished = Vec::new();
        let mut kept = Vec::new();
        for record in std::mem::take(&mut self.table) {
            match record.state {
                NodeState::Exited(info) => finished.push((record.node_id, info)),
                _ => kept.push(record),
            }
        }
        self.table = kept;
        finished
    }

    fn active_ids(&self) -> Vec<u32> {
        self.table
            .iter()
            .filter(|record| matches!(record.state, NodeState::Starting | NodeState::Running))
            .map(|record| record.node_id)
            .collect()
    }

    #[cfg(test)]
    fn tracked_ids(&self) -> Vec<u32> {
        self.table.iter().map(|record| record.node_id).collect()
    }

    #[cfg(test)]
    fn state_of(&self, node_id: u32) -> Option<NodeState> {
        self.table
            .iter()
            .find(|record| record.node_id == node_id)
            .map(|record| record.state)
    }
}

impl<B: ProcessBackend> Drop for Supervisor<B> {
    fn drop(&mut self) {
        // Best-effort cleanup; the table is already empty on every normal path.
        for record in &mut self.table {
            let _ = record.handle.force_kill();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorOutcome {
    Drained,
    Interrupted,
}

fn monitor_fleet<B: ProcessBackend>(
    supervisor: &mut Supervisor<B>,
    cancel: &AtomicBool,
    interval: Duration,
) -> MonitorOutcome {
    println!("monitoring fleet (interrupt to stop all nodes)");
    loop {
        if cancel.load(Ordering::SeqCst) {
            println!("shutdown requested; stopping fleet");
            supervisor.stop_all();
            return MonitorOutcome::Interrupted;
        }
        supervisor.poll();
        for (node_id, info) in supervisor.remove_exited() {
            println!("node_{}: stopped ({})", node_id, info);
        }
        let active = supervisor.active_ids();
        println!(
            "[{}] active: {}/{} {:?}",
            Utc::now().format("%H:%M:%S"),
            active.len(),
            supervisor.total_nodes(),
            active
        );
        if active.is_empty() {
            println!("all nodes stopped");
            return MonitorOutcome::Drained;
        }
        sleep_interruptible(interval, cancel);
    }
}

fn sleep_interruptible(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(CANCEL_POLL_SLICE.min(deadline - now));
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: nix::libc::c_int) {
    // Only flip the token here; the monitor loop performs the actual stop.
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), CorralError> {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }.map_err(|err| {
            CorralError::Signal(format!(
                "failed to register {} handler: {}",
                signal.as_str(),
                err
            ))
        })?;
    }
    Ok(())
}

fn patched_credential(
    template: &serde_json::Value,
    node_id: u32,
    port: Option<u16>,
) -> Result<serde_json::Value, CorralError> {
    let serde_json::Value::Object(fields) = template else {
        return Err(CorralError::Config(
            "credential template must be a JSON object".to_string(),
        ));
    };
    let mut fields = fields.clone();
    fields.insert(
        "node_id".to_string(),
        serde_json::Value::String(format!("node_{node_id}")),
    );
    if let Some(port) = port {
        fields.insert("port".to_string(), serde_json::Value::Number(port.into()));
    }
    Ok(serde_json::Value::Object(fields))
}

fn node_log_files(node: &NodeDescriptor) -> io::Result<Vec<PathBuf>> {
    let logs_dir = node.dir.join("logs");
    if !logs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}_", node.name());
    let mut files = Vec::new();
    for entry in fs::read_dir(&logs_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".log") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), CorralError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Edit => {
            if !ctx.config_path.exists() {
                ensure_parent(&ctx.config_path)?;
                fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            }
            let editor = env::var("VISUAL").ok().or_else(|| env::var("EDITOR").ok());
            if let Some(editor) = editor {
                let status = Command::new(editor)
                    .arg(&ctx.config_path)
                    .status()
                    .map_err(|err| {
                        CorralError::Process(format!("failed to launch editor: {err}"))
                    })?;
                if !status.success() {
                    return Err(CorralError::Process("editor exited with error".to_string()));
                }
                output(ctx, json!({"path": ctx.config_path}))
            } else {
                Err(CorralError::Process(
                    "EDITOR is not set; please edit the config file manually".to_string(),
                ))
            }
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn handle_prepare(ctx: &Context) -> Result<(), CorralError> {
    let cfg = read_config(&ctx.config_path)?;
    let settings = FleetSettings::from_config(&cfg);
    let templates = settings.cluster_root.join(CREDENTIALS_DIR);

    let missing: Vec<&str> = CREDENTIAL_TEMPLATES
        .iter()
        .copied()
        .filter(|name| !templates.join(name).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(CorralError::Config(format!(
            "missing credential templates under {}: {}",
            templates.display(),
            missing.join(", ")
        )));
    }

    let api_key_template: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(templates.join(API_KEY_FILE))?)?;
    let user_data_template: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(templates.join(USER_DATA_FILE))?)?;

    for node_id in 1..=settings.nodes {
        let node = settings.descriptor(node_id);
        fs::create_dir_all(&node.dir)?;

        fs::copy(templates.join(KEY_FILE), node.dir.join(KEY_FILE))?;
        restrict_to_owner(&node.dir.join(KEY_FILE))?;

        let api_key = patched_credential(&api_key_template, node_id, None)?;
        write_atomic_text_file(
            &node.dir.join(API_KEY_FILE),
            &format!("{}\n", serde_json::to_string_pretty(&api_key)?),
            Some(0o600),
        )?;

        let user_data = patched_credential(&user_data_template, node_id, Some(node.port))?;
        write_atomic_text_file(
            &node.dir.join(USER_DATA_FILE),
            &format!("{}\n", serde_json::to_string_pretty(&user_data)?),
            Some(0o600),
        )?;

        if !ctx.json {
            println!("node_{}: credentials ready", node_id);
        }
    }

    if ctx.json {
        return output(
            ctx,
            json!({"nodes": settings.nodes, "cluster_root": settings.cluster_root}),
        );
    }
    println!("prepared credentials for {} node(s)", settings.nodes);
    Ok(())
}

fn handle_status(ctx: &Context) -> Result<(), CorralError> {
    let cfg = read_config(&ctx.config_path)?;
    let settings = FleetSettings::from_config(&cfg);
    let templates = settings.cluster_root.join(CREDENTIALS_DIR);
    let templates_missing: Vec<String> = CREDENTIAL_TEMPLATES
        .iter()
        .copied()
        .filter(|name| !templates.join(name).is_file())
        .map(str::to_string)
        .collect();

    let mut ready_count = 0u32;
    let mut nodes = Vec::new();
    for node_id in 1..=settings.nodes {
        let node = settings.descriptor(node_id);
        let readiness = check_ready(&node);
        if readiness.is_ready() {
            ready_count += 1;
        }
        nodes.push((node, readiness));
    }

    if ctx.json {
        let rows: Vec<serde_json::Value> = nodes
            .iter()
            .map(|(node, readiness)| {
                json!({
                    "node": node.name(),
                    "ready": readiness.is_ready(),
                    "missing": readiness.missing,
                })
            })
            .collect();
        return output(
            ctx,
            json!({
                "ready": ready_count,
                "total": settings.nodes,
                "templates_missing": templates_missing,
                "nodes": rows,
            }),
        );
    }

    for (node, readiness) in &nodes {
        if readiness.is_ready() {
            println!("{}: ready", node.name());
        } else {
            println!("{}: missing {}", node.name(), readiness.missing.join(", "));
        }
    }
    if templates_missing.is_empty() {
        println!("credential templates: ok");
    } else {
        println!(
            "credential templates: missing {}",
            templates_missing.join(", ")
        );
    }
    println!("ready: {}/{}", ready_count, settings.nodes);
    Ok(())
}

fn handle_run<B: ProcessBackend>(
    ctx: &Context,
    node: Option<u32>,
    backend: B,
) -> Result<(), CorralError> {
    let cfg = read_config(&ctx.config_path)?;
    let settings = FleetSettings::from_config(&cfg);
    if let Some(node_id) = node {
        validate_node_id(&settings, node_id)?;
    }
    install_signal_handlers()?;

    let poll_interval = settings.poll_interval;
    let mut supervisor = Supervisor::new(backend, settings);
    let report = match node {
        Some(node_id) => {
            let mut report = FleetStartReport::default();
            match supervisor.start_node(node_id) {
                Ok(pid) => {
                    println!("node_{}: started (pid {})", node_id, pid);
                    report.started.push(node_id);
                }
                Err(err) => {
                    println!("node_{}: start failed: {}", node_id, err);
                    report.failed.push((node_id, err));
                }
            }
            report
        }
        None => supervisor.start_all(&SHUTDOWN),
    };

    if report.started.is_empty() {
        return Err(CorralError::Process(
            "no nodes started; check readiness with `corral status`".to_string(),
        ));
    }

    let outcome = monitor_fleet(&mut supervisor, &SHUTDOWN, poll_interval);

    if ctx.json {
        let failed: Vec<serde_json::Value> = report
            .failed
            .iter()
            .map(|(node_id, err)| {
                json!({
                    "node": format!("node_{node_id}"),
                    "kind": err.kind(),
                    "error": err.to_string(),
                })
            })
            .collect();
        return output(
            ctx,
            json!({
                "started": report.started,
                "failed": failed,
                "outcome": match outcome {
                    MonitorOutcome::Drained => "drained",
                    MonitorOutcome::Interrupted => "interrupted",
                },
            }),
        );
    }
    Ok(())
}

fn handle_script(ctx: &Context, node_id: u32, print: bool) -> Result<(), CorralError> {
    let cfg = read_config(&ctx.config_path)?;
    let settings = FleetSettings::from_config(&cfg);
    validate_node_id(&settings, node_id)?;
    let node = settings.descriptor(node_id);
    if print {
        print!("{}", launch_script_body(&node, &settings.gpu));
        return Ok(());
    }
    let path = write_launch_script(&node, &settings.gpu)?;
    output(ctx, json!({"node": node.name(), "path": path}))
}

fn handle_logs(ctx: &Context, command: LogsCommand) -> Result<(), CorralError> {
    let cfg = read_config(&ctx.config_path)?;
    let settings = FleetSettings::from_config(&cfg);
    match command {
        LogsCommand::List { node } => {
            let node_ids: Vec<u32> = match node {
                Some(node_id) => {
                    validate_node_id(&settings, node_id)?;
                    vec![node_id]
                }
                None => (1..=settings.nodes).collect(),
            };
            let mut rows = Vec::new();
            for node_id in node_ids {
                let descriptor = settings.descriptor(node_id);
                rows.extend(node_log_files(&descriptor)?);
            }
            if ctx.json {
                return output(ctx, json!({"logs": rows}));
            }
            if rows.is_empty() {
                println!("no logs found");
            } else {
                for path in rows {
                    println!("{}", path.display());
                }
            }
            Ok(())
        }
        LogsCommand::Tail { node, lines } => {
            validate_node_id(&settings, node)?;
            let descriptor = settings.descriptor(node);
            let files = node_log_files(&descriptor)?;
            let Some(latest) = files.last() else {
                return Err(CorralError::Process(format!(
                    "no logs found for node_{}",
                    node
                )));
            };
            if ctx.json {
                return output(ctx, json!({"node": descriptor.name(), "path": latest}));
            }
            let content = fs::read_to_string(latest)?;
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            for line in &all[start..] {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<(), CorralError> {
    let cfg = read_config(&ctx.config_path)?;
    let settings = FleetSettings::from_config(&cfg);
    if ctx.json {
        return output(
            ctx,
            json!({
                "config": ctx.config_path,
                "cluster_root": settings.cluster_root,
                "cluster_root_exists": settings.cluster_root.is_dir(),
            }),
        );
    }
    println!("config: {}", ctx.config_path.display());
    println!("cluster_root: {}", settings.cluster_root.display());
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), CorralError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), CorralError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
