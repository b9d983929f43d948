use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::io::IsTerminal;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

const DEFAULT_ISOLATED_FPM_CONF: &str = include_str!("../templates/php/isolated-fpm.conf");
const DEFAULT_POOL_CONF: &str = include_str!("../templates/php/pool.conf");
const DEFAULT_SENDMAIL_SH: &str = include_str!("../templates/mailpit/sendmail.sh");

const DATA_DIR_ENV: &str = "MAGEBOX_HOME";
const PHP_FPM_BIN_ENV: &str = "MAGEBOX_PHP_FPM_BIN";
const PHP_CONF_D_ENV: &str = "MAGEBOX_PHP_CONF_D";
const DEFAULT_PHP_VERSION: &str = "8.3";
const SYSTEM_INI_LINK_NAME: &str = "99-magebox-system.ini";
const MAILPIT_SMTP_ADDR: &str = "127.0.0.1:1025";
const STOP_WAIT_POLLS: u32 = 50;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "magebox", version, about = "Local PHP development environment manager")]
struct Cli {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage dedicated php-fpm masters for individual projects
    Isolate {
        #[command(subcommand)]
        command: IsolateCommand,
    },
    /// Manage pools on the shared per-version php-fpm masters
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
    /// Manage the shared system-scope PHP settings file per PHP version
    #[command(name = "system-ini")]
    SystemIni {
        #[command(subcommand)]
        command: SystemIniCommand,
    },
    Paths,
}

#[derive(Subcommand, Debug)]
enum IsolateCommand {
    Enable {
        project: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        php: Option<String>,
        #[arg(long = "setting")]
        settings: Vec<String>,
    },
    Disable {
        project: String,
    },
    Restart {
        project: String,
    },
    Stop {
        project: String,
    },
    Status {
        project: String,
    },
    List,
    StartAll,
    StopAll,
}

#[derive(Subcommand, Debug)]
enum PoolCommand {
    Generate {
        project: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        php: Option<String>,
        #[arg(long = "setting")]
        settings: Vec<String>,
        #[arg(long = "env")]
        env: Vec<String>,
        #[arg(long)]
        mailpit: bool,
    },
    Remove {
        project: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum SystemIniCommand {
    Apply {
        project: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        php: Option<String>,
        #[arg(long = "setting")]
        settings: Vec<String>,
        #[arg(long)]
        yes: bool,
    },
    Show {
        #[arg(long)]
        php: Option<String>,
    },
    Clear {
        project: String,
        #[arg(long)]
        php: Option<String>,
    },
}

#[derive(Debug, Error)]
enum MageboxError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("project {project} is not isolated")]
    NotIsolated { project: String },
}

/// One dedicated php-fpm master, owned by exactly one project. The registry
/// record is the durable truth; the OS process is reconciled against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct IsolatedProject {
    project_name: String,
    project_path: String,
    php_version: String,
    socket_path: PathBuf,
    pid_path: PathBuf,
    config_path: PathBuf,
    settings: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

/// Which project last wrote the shared system-scope INI for a PHP version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct SystemIniOwner {
    project_name: String,
    project_path: String,
    php_version: String,
    settings: BTreeMap<String, String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct IsolationStatus {
    project_name: String,
    project_path: String,
    php_version: String,
    running: bool,
    pid: Option<u32>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    config_path: PathBuf,
    settings: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct PoolEntry {
    project_name: String,
    php_version: String,
    config_path: PathBuf,
}

/// Optional per-project manifest, read from `.magebox.yml` in the project
/// root. Command-line flags override manifest values.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProjectManifest {
    php: Option<String>,
    settings: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    mailpit: bool,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    data_dir: PathBuf,
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IsolationState {
    NotIsolated,
    Stopped,
    Running,
}

trait RegistryStore {
    fn load(&self) -> Result<BTreeMap<String, IsolatedProject>, MageboxError>;
    fn save(&self, projects: &BTreeMap<String, IsolatedProject>) -> Result<(), MageboxError>;
}

struct JsonRegistryStore {
    path: PathBuf,
}

impl JsonRegistryStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RegistryStore for JsonRegistryStore {
    fn load(&self) -> Result<BTreeMap<String, IsolatedProject>, MageboxError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(MageboxError::Process(format!(
                    "failed to read registry {}: {}",
                    self.path.display(),
                    err
                )))
            }
        };
        serde_json::from_str(&text).map_err(|err| {
            MageboxError::Config(format!(
                "malformed registry {}: {}",
                self.path.display(),
                err
            ))
        })
    }

    fn save(&self, projects: &BTreeMap<String, IsolatedProject>) -> Result<(), MageboxError> {
        ensure_parent(&self.path)?;
        let text = serde_json::to_string_pretty(projects)?;
        fs::write(&self.path, text).map_err(|err| {
            MageboxError::Process(format!(
                "failed to write registry {}: {}",
                self.path.display(),
                err
            ))
        })
    }
}

trait FpmLauncher {
    fn start_master(
        &self,
        php_version: &str,
        config_path: &Path,
        project: &str,
    ) -> Result<(), MageboxError>;
}

struct RealFpmLauncher;

impl FpmLauncher for RealFpmLauncher {
    fn start_master(
        &self,
        php_version: &str,
        config_path: &Path,
        project: &str,
    ) -> Result<(), MageboxError> {
        let binary = php_fpm_binary(php_version)?;
        let output = Command::new(&binary)
            .arg("--fpm-config")
            .arg(config_path)
            .arg("--daemonize")
            .output()
            .map_err(|err| {
                MageboxError::Process(format!(
                    "failed to launch {} for {} (php {}): {}",
                    binary.display(),
                    project,
                    php_version,
                    err
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MageboxError::Process(format!(
                "php-fpm master for {} (php {}) failed to start: {}",
                project,
                php_version,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

fn main() -> Result<(), MageboxError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Isolate { command } => handle_isolate(&ctx, command),
        Commands::Pool { command } => handle_pool(&ctx, command),
        Commands::SystemIni { command } => handle_system_ini(&ctx, command),
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
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| {
            env::var(DATA_DIR_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_data_dir);
    Context {
        data_dir,
        json: cli.json,
    }
}

fn default_data_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".magebox")
}

// ---------------------------------------------------------------------------
// Path conventions
// ---------------------------------------------------------------------------

/// All on-disk locations are derived from the data dir with fixed subpaths,
/// so two projects can never collide unless they share a name.
#[derive(Debug, Clone)]
struct DataPaths {
    data_dir: PathBuf,
}

impl DataPaths {
    fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn registry_path(&self) -> PathBuf {
        self.data_dir.join("isolated-projects.json")
    }

    fn run_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    fn php_dir(&self) -> PathBuf {
        self.data_dir.join("php")
    }

    fn isolated_config_dir(&self) -> PathBuf {
        self.php_dir().join("isolated")
    }

    fn pools_base_dir(&self) -> PathBuf {
        self.php_dir().join("pools")
    }

    fn pools_dir(&self, php_version: &str) -> PathBuf {
        self.pools_base_dir().join(php_version)
    }

    fn fpm_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("php-fpm")
    }

    fn templates_dir(&self) -> PathBuf {
        self.data_dir.join("templates")
    }

    fn bin_dir(&self) -> PathBuf {
        self.data_dir.join("bin")
    }

    fn sendmail_script(&self) -> PathBuf {
        self.bin_dir().join("magebox-sendmail")
    }

    fn isolated_socket(&self, project: &str, php_version: &str) -> PathBuf {
        self.run_dir()
            .join(format!("{}-isolated-php{}.sock", project, php_version))
    }

    fn isolated_pid(&self, project: &str, php_version: &str) -> PathBuf {
        self.run_dir()
            .join(format!("{}-isolated-php{}.pid", project, php_version))
    }

    fn isolated_config(&self, project: &str, php_version: &str) -> PathBuf {
        self.isolated_config_dir()
            .join(format!("{}-php{}.conf", project, php_version))
    }

    fn isolated_error_log(&self, project: &str) -> PathBuf {
        self.fpm_log_dir()
            .join(format!("{}-isolated-error.log", project))
    }

    fn shared_socket(&self, project: &str, php_version: &str) -> PathBuf {
        self.run_dir()
            .join(format!("{}-php{}.sock", project, php_version))
    }

    fn pool_config(&self, project: &str, php_version: &str) -> PathBuf {
        self.pools_dir(php_version).join(format!("{}.conf", project))
    }

    fn system_ini(&self, php_version: &str) -> PathBuf {
        self.php_dir()
            .join(format!("php-system-{}.ini", php_version))
    }

    fn system_ini_owner_path(&self, php_version: &str) -> PathBuf {
        self.php_dir()
            .join(format!("php-system-{}.owner.json", php_version))
    }
}

fn ensure_parent(path: &Path) -> Result<(), MageboxError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<(), MageboxError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MageboxError::Process(format!(
            "failed to remove {}: {}",
            path.display(),
            err
        ))),
    }
}

// ---------------------------------------------------------------------------
// Settings classification
// ---------------------------------------------------------------------------

/// Directives that PHP only honors at PHP_INI_SYSTEM scope. Everything else
/// can be set per pool. This table tracks PHP's own classification of the
/// OPcache/JIT/preload family and cannot be derived at runtime.
const SYSTEM_INI_KEYS: &[&str] = &[
    "opcache.blacklist_filename",
    "opcache.cache_id",
    "opcache.consistency_checks",
    "opcache.dups_fix",
    "opcache.enable",
    "opcache.enable_cli",
    "opcache.enable_file_override",
    "opcache.error_log",
    "opcache.file_cache",
    "opcache.file_cache_consistency_checks",
    "opcache.file_cache_fallback",
    "opcache.file_cache_only",
    "opcache.file_update_protection",
    "opcache.force_restart_timeout",
    "opcache.huge_code_pages",
    "opcache.interned_strings_buffer",
    "opcache.jit",
    "opcache.jit_bisect_limit",
    "opcache.jit_blacklist_root_trace",
    "opcache.jit_blacklist_side_trace",
    "opcache.jit_buffer_size",
    "opcache.jit_debug",
    "opcache.jit_hot_func",
    "opcache.jit_hot_loop",
    "opcache.jit_hot_return",
    "opcache.jit_hot_side_exit",
    "opcache.jit_max_exit_counters",
    "opcache.jit_max_polymorphic_calls",
    "opcache.jit_max_recursive_calls",
    "opcache.jit_max_recursive_returns",
    "opcache.jit_max_root_traces",
    "opcache.jit_max_side_traces",
    "opcache.jit_prof_threshold",
    "opcache.lockfile_path",
    "opcache.log_verbosity_level",
    "opcache.max_accelerated_files",
    "opcache.max_file_size",
    "opcache.max_wasted_percentage",
    "opcache.memory_consumption",
    "opcache.mmap_base",
    "opcache.opt_debug_level",
    "opcache.optimization_level",
    "opcache.preferred_memory_model",
    "opcache.preload",
    "opcache.preload_user",
    "opcache.protect_memory",
    "opcache.record_warnings",
    "opcache.restrict_api",
    "opcache.revalidate_freq",
    "opcache.revalidate_path",
    "opcache.save_comments",
    "opcache.use_cwd",
    "opcache.validate_permission",
    "opcache.validate_root",
    "opcache.validate_timestamps",
];

fn is_system_ini_key(key: &str) -> bool {
    SYSTEM_INI_KEYS.contains(&key)
}

/// Partitions PHP settings into system scope and pool scope. Pure and total:
/// every input key lands in exactly one of the two maps.
fn classify_settings(
    settings: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut system = BTreeMap::new();
    let mut pool = BTreeMap::new();
    for (key, value) in settings {
        if is_system_ini_key(key) {
            system.insert(key.clone(), value.clone());
        } else {
            pool.insert(key.clone(), value.clone());
        }
    }
    (system, pool)
}

// ---------------------------------------------------------------------------
// System-INI ownership ledger
// ---------------------------------------------------------------------------

fn system_ini_owner(
    paths: &DataPaths,
    php_version: &str,
) -> Result<Option<SystemIniOwner>, MageboxError> {
    let path = paths.system_ini_owner_path(php_version);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(MageboxError::Process(format!(
                "failed to read system INI owner {}: {}",
                path.display(),
                err
            )))
        }
    };
    let owner: SystemIniOwner = serde_json::from_str(&text).map_err(|err| {
        MageboxError::Config(format!(
            "malformed system INI owner file {}: {}",
            path.display(),
            err
        ))
    })?;
    Ok(Some(owner))
}

/// Writes the shared system-scope INI for a PHP version and records the
/// calling project as its owner. Returns the previous owner only when a
/// different project held it; a project re-writing its own settings is not a
/// takeover. Empty settings write nothing.
fn write_system_ini(
    paths: &DataPaths,
    php_version: &str,
    project_name: &str,
    project_path: &str,
    settings: &BTreeMap<String, String>,
) -> Result<Option<SystemIniOwner>, MageboxError> {
    if settings.is_empty() {
        return Ok(None);
    }
    let previous = system_ini_owner(paths, php_version)?;
    let owner = SystemIniOwner {
        project_name: project_name.to_string(),
        project_path: project_path.to_string(),
        php_version: php_version.to_string(),
        settings: settings.clone(),
        updated_at: Utc::now(),
    };
    let ini_path = paths.system_ini(php_version);
    ensure_parent(&ini_path)?;
    fs::write(&ini_path, render_system_ini(&owner)).map_err(|err| {
        MageboxError::Process(format!(
            "failed to write system INI {}: {}",
            ini_path.display(),
            err
        ))
    })?;
    let owner_path = paths.system_ini_owner_path(php_version);
    fs::write(&owner_path, serde_json::to_string_pretty(&owner)?).map_err(|err| {
        MageboxError::Process(format!(
            "failed to write system INI owner {}: {}",
            owner_path.display(),
            err
        ))
    })?;
    Ok(previous.filter(|prev| prev.project_name != project_name))
}

/// Removes the system INI and its owner record, but only when the caller is
/// the current owner. A non-owner clear is the expected outcome of a project
/// cleaning up settings another project has since taken over, so it is a
/// silent no-op. Returns whether anything was removed.
fn clear_system_ini(
    paths: &DataPaths,
    php_version: &str,
    project_name: &str,
) -> Result<bool, MageboxError> {
    match system_ini_owner(paths, php_version)? {
        Some(owner) if owner.project_name == project_name => {
            remove_file_if_exists(&paths.system_ini(php_version))?;
            remove_file_if_exists(&paths.system_ini_owner_path(php_version))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Writing the INI does not activate it; an explicit symlink into the PHP
/// config scan dir plus an FPM restart does. This reports whether that
/// symlink currently points at our file.
fn system_ini_active(paths: &DataPaths, php_version: &str, conf_d_dir: &Path) -> bool {
    let link = conf_d_dir.join(SYSTEM_INI_LINK_NAME);
    match fs::read_link(&link) {
        Ok(target) => target == paths.system_ini(php_version),
        Err(_) => false,
    }
}

fn php_conf_d_dir(php_version: &str) -> Option<PathBuf> {
    if let Ok(dir) = env::var(PHP_CONF_D_ENV) {
        if !dir.trim().is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    let candidates = [
        format!("/etc/php/{}/fpm/conf.d", php_version),
        format!("/opt/homebrew/etc/php/{}/conf.d", php_version),
        format!("/usr/local/etc/php/{}/conf.d", php_version),
    ];
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_dir())
}

fn render_system_ini(owner: &SystemIniOwner) -> String {
    let mut text = String::new();
    text.push_str("; managed by magebox - do not edit by hand\n");
    text.push_str(&format!(
        "; owner: {} ({})\n",
        owner.project_name, owner.project_path
    ));
    text.push_str(&format!("; php: {}\n", owner.php_version));
    text.push_str(&format!("; updated: {}\n\n", owner.updated_at.to_rfc3339()));
    for (key, value) in &owner.settings {
        text.push_str(&format!("{} = {}\n", key, value));
    }
    text
}

fn diff_settings(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<String> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut changes = Vec::new();
    for key in keys {
        match (old.get(key), new.get(key)) {
            (Some(before), Some(after)) if before != after => {
                changes.push(format!("{}: {} -> {}", key, before, after));
            }
            (Some(before), None) => changes.push(format!("{}: {} (removed)", key, before)),
            (None, Some(after)) => changes.push(format!("{}: {} (added)", key, after)),
            _ => {}
        }
    }
    changes
}

fn format_system_settings_info(owner: &SystemIniOwner) -> String {
    let mut text = format!(
        "system PHP settings for {} are owned by {} ({}), updated {}\n",
        owner.php_version,
        owner.project_name,
        owner.project_path,
        owner.updated_at.to_rfc3339()
    );
    for (key, value) in &owner.settings {
        text.push_str(&format!("  {} = {}\n", key, value));
    }
    text
}

fn format_owner_warning(
    owner: &SystemIniOwner,
    new_project: &str,
    new_settings: &BTreeMap<String, String>,
) -> String {
    let mut text = format!(
        "system PHP settings for {} are currently owned by {} ({}); applying them for {} will change:\n",
        owner.php_version, owner.project_name, owner.project_path, new_project
    );
    let changes = diff_settings(&owner.settings, new_settings);
    if changes.is_empty() {
        text.push_str("  (no value changes, ownership only)\n");
    } else {
        for change in changes {
            text.push_str(&format!("  {}\n", change));
        }
    }
    text
}

fn format_activation_instructions(
    ini_path: &Path,
    conf_d_dir: Option<&Path>,
    php_version: &str,
) -> String {
    match conf_d_dir {
        Some(dir) => format!(
            "system settings for php {} are written but not active; link and restart:\n  sudo ln -sf {} {}\n  then restart the php {} fpm service",
            php_version,
            ini_path.display(),
            dir.join(SYSTEM_INI_LINK_NAME).display(),
            php_version
        ),
        None => format!(
            "system settings for php {} are written but not active; symlink {} as {} into the PHP config scan dir and restart php-fpm",
            php_version,
            ini_path.display(),
            SYSTEM_INI_LINK_NAME
        ),
    }
}

// ---------------------------------------------------------------------------
// Isolated-project registry
// ---------------------------------------------------------------------------

// Every helper does a full load-mutate-save against the backing file. Two
// concurrent magebox invocations racing on the registry are last-writer-wins;
// acceptable for a single-developer tool.

fn registry_get(
    store: &dyn RegistryStore,
    project: &str,
) -> Result<Option<IsolatedProject>, MageboxError> {
    Ok(store.load()?.remove(project))
}

fn registry_add(store: &dyn RegistryStore, record: IsolatedProject) -> Result<(), MageboxError> {
    let mut projects = store.load()?;
    projects.insert(record.project_name.clone(), record);
    store.save(&projects)
}

fn registry_remove(store: &dyn RegistryStore, project: &str) -> Result<(), MageboxError> {
    let mut projects = store.load()?;
    projects.remove(project);
    store.save(&projects)
}

fn registry_list(store: &dyn RegistryStore) -> Result<Vec<IsolatedProject>, MageboxError> {
    Ok(store.load()?.into_values().collect())
}

// ---------------------------------------------------------------------------
// OS process helpers
// ---------------------------------------------------------------------------

// Signal targets must be positive and fit in an i32; 0 and negative values
// address process groups, and anything larger would wrap. A pid file that
// fails these checks is corrupt and reads as "no pid", i.e. already stopped.
fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    let pid = text.trim().parse::<i32>().ok()?;
    (pid > 0).then_some(pid as u32)
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // EPERM means the process exists but belongs to someone else.
    matches!(
        kill(Pid::from_raw(pid as i32), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM first, then a bounded wait, then SIGKILL. ESRCH anywhere counts as
/// already stopped. Only a failure of both signal paths is an error.
#[cfg(unix)]
fn terminate_process(pid: u32, project: &str) -> Result<(), MageboxError> {
    if pid == 0 {
        return Ok(());
    }
    let target = Pid::from_raw(pid as i32);
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(_) => {}
    }
    for _ in 0..STOP_WAIT_POLLS {
        if !process_is_alive(pid) {
            return Ok(());
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }
    match kill(target, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(MageboxError::Process(format!(
            "failed to stop php-fpm master for {} (pid {}): {}",
            project, pid, err
        ))),
    }
}

#[cfg(not(unix))]
fn terminate_process(_pid: u32, _project: &str) -> Result<(), MageboxError> {
    Ok(())
}

fn php_fpm_binary(php_version: &str) -> Result<PathBuf, MageboxError> {
    if let Ok(bin) = env::var(PHP_FPM_BIN_ENV) {
        if !bin.trim().is_empty() {
            return Ok(PathBuf::from(bin));
        }
    }
    let compact = php_version.replace('.', "");
    let names = [
        format!("php-fpm{}", php_version),
        format!("php-fpm{}", compact),
    ];
    for name in &names {
        if let Ok(found) = which::which(name) {
            return Ok(found);
        }
    }
    let direct = [
        format!("/usr/sbin/php-fpm{}", php_version),
        format!("/opt/homebrew/opt/php@{}/sbin/php-fpm", php_version),
        format!("/usr/local/opt/php@{}/sbin/php-fpm", php_version),
    ];
    for candidate in direct {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(MageboxError::Config(format!(
        "no php-fpm binary found for PHP {}; install it or set {}",
        php_version, PHP_FPM_BIN_ENV
    )))
}

// ---------------------------------------------------------------------------
// Isolated FPM controller
// ---------------------------------------------------------------------------

fn derive_state(record: Option<&IsolatedProject>) -> IsolationState {
    let Some(record) = record else {
        return IsolationState::NotIsolated;
    };
    match read_pid_file(&record.pid_path) {
        Some(pid) if process_is_alive(pid) => IsolationState::Running,
        _ => IsolationState::Stopped,
    }
}

struct FpmController<'a> {
    paths: &'a DataPaths,
    store: &'a dyn RegistryStore,
    launcher: &'a dyn FpmLauncher,
}

impl<'a> FpmController<'a> {
    /// Enables isolation for a project, or updates it in place when a record
    /// already exists (the old master is stopped first). The registry is only
    /// written after the new master started, so a failed enable never leaves
    /// a record pointing at a master that never ran.
    fn enable(
        &self,
        project: &str,
        project_path: &Path,
        php_version: &str,
        settings: &BTreeMap<String, String>,
    ) -> Result<IsolatedProject, MageboxError> {
        let existing = registry_get(self.store, project)?;
        if let Some(ref old) = existing {
            self.stop_record(old)?;
        }
        let (system, pool) = classify_settings(settings);
        let record = IsolatedProject {
            project_name: project.to_string(),
            project_path: project_path.to_string_lossy().to_string(),
            php_version: php_version.to_string(),
            socket_path: self.paths.isolated_socket(project, php_version),
            pid_path: self.paths.isolated_pid(project, php_version),
            config_path: self.paths.isolated_config(project, php_version),
            settings: settings.clone(),
            created_at: existing
                .as_ref()
                .map(|old| old.created_at)
                .unwrap_or_else(Utc::now),
        };
        for dir in [
            self.paths.run_dir(),
            self.paths.isolated_config_dir(),
            self.paths.fpm_log_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| {
                MageboxError::Process(format!(
                    "failed to create {} for {} (php {}): {}",
                    dir.display(),
                    project,
                    php_version,
                    err
                ))
            })?;
        }
        let template = load_template(self.paths, "php", "isolated-fpm.conf")?;
        let error_log = self.paths.isolated_error_log(project);
        let rendered = render_isolated_config(&template, &record, &system, &pool, &error_log);
        fs::write(&record.config_path, rendered).map_err(|err| {
            MageboxError::Process(format!(
                "failed to write isolated config {}: {}",
                record.config_path.display(),
                err
            ))
        })?;
        self.start_record(&record)?;
        registry_add(self.store, record.clone())?;
        Ok(record)
    }

    /// Stops the master, deletes the rendered config, then drops the record.
    /// Stop-before-delete: a slow-to-terminate master keeps its config file
    /// available through shutdown.
    fn disable(&self, project: &str) -> Result<(), MageboxError> {
        let record =
            registry_get(self.store, project)?.ok_or_else(|| MageboxError::NotIsolated {
                project: project.to_string(),
            })?;
        self.stop_record(&record)?;
        remove_file_if_exists(&record.config_path)?;
        registry_remove(self.store, project)
    }

    /// Idempotent: "already stopped" (no record, or no readable PID file) is
    /// success, not an error.
    fn stop(&self, project: &str) -> Result<(), MageboxError> {
        let Some(record) = registry_get(self.store, project)? else {
            return Ok(());
        };
        self.stop_record(&record)
    }

    fn restart(&self, project: &str) -> Result<(), MageboxError> {
        let record =
            registry_get(self.store, project)?.ok_or_else(|| MageboxError::NotIsolated {
                project: project.to_string(),
            })?;
        self.stop_record(&record)?;
        self.start_record(&record)
    }

    fn is_isolated(&self, project: &str) -> Result<bool, MageboxError> {
        Ok(registry_get(self.store, project)?.is_some())
    }

    fn is_running(&self, project: &str) -> Result<bool, MageboxError> {
        let record = registry_get(self.store, project)?;
        Ok(derive_state(record.as_ref()) == IsolationState::Running)
    }

    /// The one socket answer for consumers that do not care about isolation
    /// mode: the dedicated socket when isolated, the shared-pool socket
    /// otherwise.
    fn socket_path(&self, project: &str, php_version: &str) -> Result<PathBuf, MageboxError> {
        match registry_get(self.store, project)? {
            Some(record) => Ok(record.socket_path),
            None => Ok(self.paths.shared_socket(project, php_version)),
        }
    }

    fn status(&self, project: &str) -> Result<IsolationStatus, MageboxError> {
        let record =
            registry_get(self.store, project)?.ok_or_else(|| MageboxError::NotIsolated {
                project: project.to_string(),
            })?;
        let pid = read_pid_file(&record.pid_path);
        let running = pid.map(process_is_alive).unwrap_or(false);
        Ok(IsolationStatus {
            project_name: record.project_name,
            project_path: record.project_path,
            php_version: record.php_version,
            running,
            pid,
            socket_path: record.socket_path,
            pid_path: record.pid_path,
            config_path: record.config_path,
            settings: record.settings,
            created_at: record.created_at,
        })
    }

    /// Best-effort batch: a failing project never blocks the rest; failures
    /// are reported together at the end.
    fn start_all(&self) -> Result<usize, MageboxError> {
        let projects = registry_list(self.store)?;
        let total = projects.len();
        let mut failures = Vec::new();
        for record in &projects {
            if derive_state(Some(record)) == IsolationState::Running {
                continue;
            }
            if let Err(err) = self.start_record(record) {
                failures.push(format!(
                    "{} (php {}): {}",
                    record.project_name, record.php_version, err
                ));
            }
        }
        if failures.is_empty() {
            Ok(total)
        } else {
            Err(MageboxError::Process(format!(
                "failed to start {} of {} isolated php-fpm masters: {}",
                failures.len(),
                total,
                failures.join("; ")
            )))
        }
    }

    fn stop_all(&self) -> Result<usize, MageboxError> {
        let projects = registry_list(self.store)?;
        let total = projects.len();
        let mut failures = Vec::new();
        for record in &projects {
            if let Err(err) = self.stop_record(record) {
                failures.push(format!(
                    "{} (php {}): {}",
                    record.project_name, record.php_version, err
                ));
            }
        }
        if failures.is_empty() {
            Ok(total)
        } else {
            Err(MageboxError::Process(format!(
                "failed to stop {} of {} isolated php-fpm masters: {}",
                failures.len(),
                total,
                failures.join("; ")
            )))
        }
    }

    /// A crashed master can leave its socket behind, which would make the
    /// next bind fail, so the stale socket is removed before starting.
    fn start_record(&self, record: &IsolatedProject) -> Result<(), MageboxError> {
        remove_file_if_exists(&record.socket_path)?;
        self.launcher.start_master(
            &record.php_version,
            &record.config_path,
            &record.project_name,
        )
    }

    fn stop_record(&self, record: &IsolatedProject) -> Result<(), MageboxError> {
        let Some(pid) = read_pid_file(&record.pid_path) else {
            return Ok(());
        };
        terminate_process(pid, &record.project_name)?;
        remove_file_if_exists(&record.pid_path)?;
        remove_file_if_exists(&record.socket_path)?;
        Ok(())
    }
}

fn render_isolated_config(
    template: &str,
    record: &IsolatedProject,
    system: &BTreeMap<String, String>,
    pool: &BTreeMap<String, String>,
    error_log: &Path,
) -> String {
    let mut system_block = String::from("; system settings (PHP_INI_SYSTEM scope)\n");
    for (key, value) in system {
        system_block.push_str(&format!("php_admin_value[{}] = {}\n", key, value));
    }
    let mut pool_block = String::from("; pool settings\n");
    for (key, value) in pool {
        pool_block.push_str(&format!("php_value[{}] = {}\n", key, value));
    }
    template
        .replace("{{PROJECT_NAME}}", &record.project_name)
        .replace("{{PROJECT_PATH}}", &record.project_path)
        .replace("{{PID_PATH}}", &record.pid_path.display().to_string())
        .replace("{{ERROR_LOG}}", &error_log.display().to_string())
        .replace("{{SOCKET_PATH}}", &record.socket_path.display().to_string())
        .replace("{{SYSTEM_SETTINGS}}", system_block.trim_end())
        .replace("{{POOL_SETTINGS}}", pool_block.trim_end())
}

// ---------------------------------------------------------------------------
// Shared-mode pool generator
// ---------------------------------------------------------------------------

/// Renders one pool file into the per-version pools directory of the shared
/// php-fpm master. With mailpit enabled, outgoing mail from the pool is
/// rerouted into the local catcher via a sendmail shim.
fn generate_pool(
    paths: &DataPaths,
    project: &str,
    project_path: &Path,
    php_version: &str,
    env_vars: &BTreeMap<String, String>,
    php_ini: &BTreeMap<String, String>,
    has_mailpit: bool,
) -> Result<PathBuf, MageboxError> {
    for dir in [paths.pools_dir(php_version), paths.run_dir()] {
        fs::create_dir_all(&dir).map_err(|err| {
            MageboxError::Process(format!(
                "failed to create {} for {} (php {}): {}",
                dir.display(),
                project,
                php_version,
                err
            ))
        })?;
    }
    let mut env_vars = env_vars.clone();
    let mut sendmail_line = String::new();
    if has_mailpit {
        let script = provision_sendmail_shim(paths)?;
        env_vars.insert(
            "MAGEBOX_SMTP_ADDR".to_string(),
            MAILPIT_SMTP_ADDR.to_string(),
        );
        sendmail_line = format!("php_admin_value[sendmail_path] = {} -t\n", script.display());
    }

    let mut env_block = String::from("; environment\n");
    for (key, value) in &env_vars {
        env_block.push_str(&format!("env[{}] = {}\n", key, value));
    }
    let mut pool_block = String::from("; pool settings\n");
    for (key, value) in php_ini {
        pool_block.push_str(&format!("php_value[{}] = {}\n", key, value));
    }
    pool_block.push_str(&sendmail_line);

    let template = load_template(paths, "php", "pool.conf")?;
    let socket = paths.shared_socket(project, php_version);
    let rendered = template
        .replace("{{PROJECT_NAME}}", project)
        .replace("{{PROJECT_PATH}}", &project_path.to_string_lossy())
        .replace("{{SOCKET_PATH}}", &socket.display().to_string())
        .replace("{{ENV_VARS}}", env_block.trim_end())
        .replace("{{POOL_SETTINGS}}", pool_block.trim_end());

    let config_path = paths.pool_config(project, php_version);
    fs::write(&config_path, rendered).map_err(|err| {
        MageboxError::Process(format!(
            "failed to write pool config {}: {}",
            config_path.display(),
            err
        ))
    })?;
    Ok(config_path)
}

fn dir_entry(
    entry: io::Result<fs::DirEntry>,
    dir: &Path,
) -> Result<fs::DirEntry, MageboxError> {
    entry.map_err(|err| {
        MageboxError::Process(format!("failed to read pools dir {}: {}", dir.display(), err))
    })
}

fn dir_entry_type(entry: &fs::DirEntry, dir: &Path) -> Result<fs::FileType, MageboxError> {
    entry.file_type().map_err(|err| {
        MageboxError::Process(format!(
            "failed to inspect {} in pools dir {}: {}",
            entry.path().display(),
            dir.display(),
            err
        ))
    })
}

/// Deletes the project's pool file from every version directory. Returns how
/// many were removed; a project with no pools is a no-op.
fn remove_pool(paths: &DataPaths, project: &str) -> Result<usize, MageboxError> {
    let base = paths.pools_base_dir();
    let entries = match fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(MageboxError::Process(format!(
                "failed to read pools dir {}: {}",
                base.display(),
                err
            )))
        }
    };
    let mut removed = 0;
    for entry in entries {
        let entry = dir_entry(entry, &base)?;
        if !dir_entry_type(&entry, &base)?.is_dir() {
            continue;
        }
        let candidate = entry.path().join(format!("{}.conf", project));
        if candidate.exists() {
            fs::remove_file(&candidate).map_err(|err| {
                MageboxError::Process(format!(
                    "failed to remove pool config {}: {}",
                    candidate.display(),
                    err
                ))
            })?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn list_pools(paths: &DataPaths) -> Result<Vec<PoolEntry>, MageboxError> {
    let base = paths.pools_base_dir();
    let version_dirs = match fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(MageboxError::Process(format!(
                "failed to read pools dir {}: {}",
                base.display(),
                err
            )))
        }
    };
    let mut pools = Vec::new();
    for version_entry in version_dirs {
        let version_entry = dir_entry(version_entry, &base)?;
        if !dir_entry_type(&version_entry, &base)?.is_dir() {
            continue;
        }
        let php_version = version_entry.file_name().to_string_lossy().to_string();
        let version_dir = version_entry.path();
        let pool_entries = fs::read_dir(&version_dir).map_err(|err| {
            MageboxError::Process(format!(
                "failed to read pools dir {}: {}",
                version_dir.display(),
                err
            ))
        })?;
        for pool_entry in pool_entries {
            let pool_entry = dir_entry(pool_entry, &version_dir)?;
            let path = pool_entry.path();
            if path.extension().map(|ext| ext == "conf").unwrap_or(false) {
                let project_name = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();
                pools.push(PoolEntry {
                    project_name,
                    php_version: php_version.clone(),
                    config_path: path,
                });
            }
        }
    }
    pools.sort_by(|a, b| {
        (a.php_version.as_str(), a.project_name.as_str())
            .cmp(&(b.php_version.as_str(), b.project_name.as_str()))
    });
    Ok(pools)
}

fn provision_sendmail_shim(paths: &DataPaths) -> Result<PathBuf, MageboxError> {
    let script_path = paths.sendmail_script();
    ensure_parent(&script_path)?;
    let template = load_template(paths, "mailpit", "sendmail.sh")?;
    let rendered = template.replace("{{SMTP_ADDR}}", MAILPIT_SMTP_ADDR);
    fs::write(&script_path, rendered).map_err(|err| {
        MageboxError::Process(format!(
            "failed to write sendmail shim {}: {}",
            script_path.display(),
            err
        ))
    })?;
    #[cfg(unix)]
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    Ok(script_path)
}

// ---------------------------------------------------------------------------
// Templates and project manifest
// ---------------------------------------------------------------------------

/// A file under `{dataDir}/templates/{category}/{name}` overrides the
/// embedded default of the same name.
fn load_template(paths: &DataPaths, category: &str, name: &str) -> Result<String, MageboxError> {
    let local = paths.templates_dir().join(category).join(name);
    if local.exists() {
        return fs::read_to_string(&local).map_err(|err| {
            MageboxError::Config(format!(
                "failed to read template override {}: {}",
                local.display(),
                err
            ))
        });
    }
    match (category, name) {
        ("php", "isolated-fpm.conf") => Ok(DEFAULT_ISOLATED_FPM_CONF.to_string()),
        ("php", "pool.conf") => Ok(DEFAULT_POOL_CONF.to_string()),
        ("mailpit", "sendmail.sh") => Ok(DEFAULT_SENDMAIL_SH.to_string()),
        _ => Err(MageboxError::Config(format!(
            "unknown template {}/{}",
            category, name
        ))),
    }
}

fn load_manifest(project_path: &Path) -> Result<ProjectManifest, MageboxError> {
    let path = project_path.join(".magebox.yml");
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(ProjectManifest::default())
        }
        Err(err) => {
            return Err(MageboxError::Config(format!(
                "failed to read {}: {}",
                path.display(),
                err
            )))
        }
    };
    serde_yaml::from_str(&text)
        .map_err(|err| MageboxError::Config(format!("invalid manifest {}: {}", path.display(), err)))
}

fn parse_key_value_flags(flags: &[String]) -> Result<BTreeMap<String, String>, MageboxError> {
    let mut map = BTreeMap::new();
    for flag in flags {
        let Some((key, value)) = flag.split_once('=') else {
            return Err(MageboxError::Config(format!(
                "expected KEY=VALUE, got {}",
                flag
            )));
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn handle_isolate(ctx: &Context, command: IsolateCommand) -> Result<(), MageboxError> {
    let paths = DataPaths::new(ctx.data_dir.clone());
    let store = JsonRegistryStore::new(paths.registry_path());
    let launcher = RealFpmLauncher;
    let controller = FpmController {
        paths: &paths,
        store: &store,
        launcher: &launcher,
    };
    match command {
        IsolateCommand::Enable {
            project,
            path,
            php,
            settings,
        } => {
            let manifest = load_manifest(&path)?;
            let php_version = php
                .or(manifest.php)
                .unwrap_or_else(|| DEFAULT_PHP_VERSION.to_string());
            let mut merged = manifest.settings;
            merged.extend(parse_key_value_flags(&settings)?);
            let record = controller.enable(&project, &path, &php_version, &merged)?;
            // Settings now live in the dedicated master; release any shared
            // system INI this project still owns (no-op for non-owners).
            clear_system_ini(&paths, &php_version, &project)?;
            output(
                ctx,
                json!({
                    "project": record.project_name,
                    "php_version": record.php_version,
                    "socket_path": record.socket_path,
                    "pid_path": record.pid_path,
                    "config_path": record.config_path,
                }),
            )
        }
        IsolateCommand::Disable { project } => {
            controller.disable(&project)?;
            output(ctx, json!({ "project": project, "isolated": false }))
        }
        IsolateCommand::Restart { project } => {
            controller.restart(&project)?;
            output(ctx, json!({ "project": project, "restarted": true }))
        }
        IsolateCommand::Stop { project } => {
            controller.stop(&project)?;
            output(ctx, json!({ "project": project, "stopped": true }))
        }
        IsolateCommand::Status { project } => {
            let status = controller.status(&project)?;
            output(ctx, serde_json::to_value(status)?)
        }
        IsolateCommand::List => {
            let mut entries = Vec::new();
            for record in registry_list(&store)? {
                let running = controller.is_running(&record.project_name)?;
                entries.push(json!({
                    "project": record.project_name,
                    "php_version": record.php_version,
                    "running": running,
                    "socket_path": record.socket_path,
                }));
            }
            output(ctx, json!(entries))
        }
        IsolateCommand::StartAll => {
            let total = controller.start_all()?;
            output(ctx, json!({ "projects": total, "started": true }))
        }
        IsolateCommand::StopAll => {
            let total = controller.stop_all()?;
            output(ctx, json!({ "projects": total, "stopped": true }))
        }
    }
}

fn handle_pool(ctx: &Context, command: PoolCommand) -> Result<(), MageboxError> {
    let paths = DataPaths::new(ctx.data_dir.clone());
    match command {
        PoolCommand::Generate {
            project,
            path,
            php,
            settings,
            env,
            mailpit,
        } => {
            let manifest = load_manifest(&path)?;
            let php_version = php
                .or(manifest.php)
                .unwrap_or_else(|| DEFAULT_PHP_VERSION.to_string());
            let mut merged_settings = manifest.settings;
            merged_settings.extend(parse_key_value_flags(&settings)?);
            let mut merged_env = manifest.env;
            merged_env.extend(parse_key_value_flags(&env)?);
            let has_mailpit = mailpit || manifest.mailpit;
            let config_path = generate_pool(
                &paths,
                &project,
                &path,
                &php_version,
                &merged_env,
                &merged_settings,
                has_mailpit,
            )?;
            output(
                ctx,
                json!({
                    "project": project,
                    "php_version": php_version,
                    "config_path": config_path,
                    "socket_path": paths.shared_socket(&project, &php_version),
                    "mailpit": has_mailpit,
                }),
            )
        }
        PoolCommand::Remove { project } => {
            let removed = remove_pool(&paths, &project)?;
            output(ctx, json!({ "project": project, "removed": removed }))
        }
        PoolCommand::List => {
            let pools = list_pools(&paths)?;
            output(ctx, serde_json::to_value(pools)?)
        }
    }
}

fn handle_system_ini(ctx: &Context, command: SystemIniCommand) -> Result<(), MageboxError> {
    let paths = DataPaths::new(ctx.data_dir.clone());
    match command {
        SystemIniCommand::Apply {
            project,
            path,
            php,
            settings,
            yes,
        } => {
            let manifest = load_manifest(&path)?;
            let php_version = php
                .or(manifest.php)
                .unwrap_or_else(|| DEFAULT_PHP_VERSION.to_string());
            let mut merged = manifest.settings;
            merged.extend(parse_key_value_flags(&settings)?);
            let (system, pool) = classify_settings(&merged);
            if !pool.is_empty() {
                let ignored: Vec<&str> = pool.keys().map(String::as_str).collect();
                eprintln!(
                    "ignoring pool-scope settings (set them per pool instead): {}",
                    ignored.join(", ")
                );
            }
            if system.is_empty() {
                return Err(MageboxError::Config(format!(
                    "no system-scope PHP settings given for {} (php {})",
                    project, php_version
                )));
            }
            if !yes {
                if let Some(owner) = system_ini_owner(&paths, &php_version)? {
                    if owner.project_name != project {
                        eprintln!("{}", format_owner_warning(&owner, &project, &system));
                        if io::stderr().is_terminal() {
                            let confirmed = Confirm::new()
                                .with_prompt(format!(
                                    "overwrite system PHP settings for {} owned by {}?",
                                    php_version, owner.project_name
                                ))
                                .default(false)
                                .interact()?;
                            if !confirmed {
                                return Err(MageboxError::Config(
                                    "aborted; system settings left unchanged".to_string(),
                                ));
                            }
                        }
                    }
                }
            }
            let previous = write_system_ini(
                &paths,
                &php_version,
                &project,
                &path.to_string_lossy(),
                &system,
            )?;
            let conf_d = php_conf_d_dir(&php_version);
            let active = conf_d
                .as_deref()
                .map(|dir| system_ini_active(&paths, &php_version, dir))
                .unwrap_or(false);
            if !active {
                eprintln!(
                    "{}",
                    format_activation_instructions(
                        &paths.system_ini(&php_version),
                        conf_d.as_deref(),
                        &php_version
                    )
                );
            }
            output(
                ctx,
                json!({
                    "php_version": php_version,
                    "owner": project,
                    "previous_owner": previous.map(|owner| owner.project_name),
                    "ini_path": paths.system_ini(&php_version),
                    "active": active,
                }),
            )
        }
        SystemIniCommand::Show { php } => {
            let php_version = php.unwrap_or_else(|| DEFAULT_PHP_VERSION.to_string());
            let owner = system_ini_owner(&paths, &php_version)?;
            let conf_d = php_conf_d_dir(&php_version);
            let active = conf_d
                .as_deref()
                .map(|dir| system_ini_active(&paths, &php_version, dir))
                .unwrap_or(false);
            if !ctx.json {
                if let Some(ref owner) = owner {
                    eprintln!("{}", format_system_settings_info(owner));
                }
            }
            output(
                ctx,
                json!({
                    "php_version": php_version,
                    "owner": owner.as_ref().map(|o| o.project_name.clone()),
                    "settings": owner.as_ref().map(|o| o.settings.clone()),
                    "updated_at": owner.as_ref().map(|o| o.updated_at),
                    "active": active,
                }),
            )
        }
        SystemIniCommand::Clear { project, php } => {
            let php_version = php.unwrap_or_else(|| DEFAULT_PHP_VERSION.to_string());
            let cleared = clear_system_ini(&paths, &php_version, &project)?;
            output(
                ctx,
                json!({
                    "php_version": php_version,
                    "project": project,
                    "cleared": cleared,
                }),
            )
        }
    }
}

fn handle_paths(ctx: &Context) -> Result<(), MageboxError> {
    let paths = DataPaths::new(ctx.data_dir.clone());
    output(
        ctx,
        json!({
            "data_dir": paths.data_dir,
            "registry_path": paths.registry_path(),
            "registry_exists": paths.registry_path().exists(),
            "run_dir": paths.run_dir(),
            "php_dir": paths.php_dir(),
            "isolated_config_dir": paths.isolated_config_dir(),
            "pools_dir": paths.pools_base_dir(),
            "fpm_log_dir": paths.fpm_log_dir(),
            "templates_dir": paths.templates_dir(),
            "bin_dir": paths.bin_dir(),
        }),
    )
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), MageboxError> {
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

fn print_json<T: Serialize>(payload: &T) -> Result<(), MageboxError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
