use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vardelay_sim::command::NodeExec;
use vardelay_sim::pacing::sleep_unless_stopped;
use vardelay_sim::Namespace;

use crate::error::{Result, RunError};
use crate::flow::{FlowSpec, Role};

/// Port every scheme server listens on; each flow has its own host pair.
pub const SERVER_PORT: u16 = 50000;

const WRAPPERS_DIR: &str = "src/wrappers";
const READINESS_POLL: Duration = Duration::from_millis(50);
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Wrapper script of `scheme` inside a Pantheon checkout.
pub fn wrapper_path(pantheon: &Path, scheme: &str) -> PathBuf {
    pantheon.join(WRAPPERS_DIR).join(format!("{scheme}.py"))
}

/// Ask a scheme's wrapper which role has to be started first.
pub fn run_first(path: &Path, scheme: &str) -> Result<Role> {
    let output = Command::new(path)
        .arg("run_first")
        .stdin(Stdio::null())
        .output()
        .map_err(|source| RunError::Spawn {
            what: format!("{} run_first", path.display()),
            source,
        })?;
    let answer = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        return Err(RunError::Metadata(format!(
            "`{scheme} run_first` exited with {}",
            output.status
        )));
    }
    answer.trim().parse().map_err(|_| {
        RunError::Metadata(format!(
            "scheme `{scheme}` does not tell if receiver or sender runs first (got `{}`)",
            answer.trim()
        ))
    })
}

/// Wrapper scripts of every scheme in the run.
#[derive(Debug, Clone)]
pub struct SchemeRegistry {
    paths: BTreeMap<String, PathBuf>,
    user: Option<String>,
}

impl SchemeRegistry {
    /// Locate the wrapper of every scheme; a missing one is a configuration
    /// error.
    pub fn locate<'a>(
        pantheon: &Path,
        schemes: impl IntoIterator<Item = &'a str>,
        user: Option<String>,
    ) -> Result<Self> {
        let mut paths = BTreeMap::new();
        for scheme in schemes {
            if paths.contains_key(scheme) {
                continue;
            }
            let path = wrapper_path(pantheon, scheme);
            if !path.exists() {
                return Err(RunError::MissingScheme {
                    scheme: scheme.to_string(),
                    path,
                });
            }
            paths.insert(scheme.to_string(), path);
        }
        Ok(Self { paths, user })
    }

    pub fn path(&self, scheme: &str) -> Option<&Path> {
        self.paths.get(scheme).map(PathBuf::as_path)
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }

    /// Run every wrapper's `setup_after_reboot`. Failures are only logged:
    /// many schemes need no setup and exit non-zero.
    pub fn setup_after_reboot(&self) {
        for (scheme, path) in &self.paths {
            match Command::new(path)
                .arg("setup_after_reboot")
                .stdin(Stdio::null())
                .output()
            {
                Ok(out) if out.status.success() => debug!(%scheme, "setup_after_reboot done"),
                Ok(out) => warn!(
                    %scheme,
                    code = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "setup_after_reboot failed"
                ),
                Err(e) => warn!(%scheme, error = %e, "setup_after_reboot could not be started"),
            }
        }
    }

    /// Command line of a scheme endpoint: the wrapper and its arguments,
    /// prefixed with `sudo -u <user>` when a user is set.
    pub fn argv(&self, scheme: &str, args: Vec<String>) -> Result<Vec<String>> {
        let path = self.path(scheme).ok_or_else(|| RunError::MissingScheme {
            scheme: scheme.to_string(),
            path: PathBuf::from(WRAPPERS_DIR).join(format!("{scheme}.py")),
        })?;
        let mut argv = Vec::with_capacity(args.len() + 4);
        if let Some(user) = &self.user {
            argv.extend(["sudo".to_string(), "-u".to_string(), user.clone()]);
        }
        argv.push(path.to_string_lossy().into_owned());
        argv.extend(args);
        Ok(argv)
    }

    pub fn server_argv(&self, flow: &FlowSpec) -> Result<Vec<String>> {
        self.argv(
            &flow.scheme,
            vec![flow.runs_first.to_string(), SERVER_PORT.to_string()],
        )
    }

    pub fn client_argv(&self, flow: &FlowSpec, server_ip: Ipv4Addr) -> Result<Vec<String>> {
        self.argv(
            &flow.scheme,
            vec![
                flow.client_role().to_string(),
                server_ip.to_string(),
                SERVER_PORT.to_string(),
            ],
        )
    }
}

/// A `Command` running `argv` inside `ns`, with output discarded.
pub fn endpoint_command(ns: &Namespace, argv: &[String]) -> Command {
    let (program, args) = argv.split_first().map_or(("", &[][..]), |(p, a)| (p.as_str(), a));
    let mut cmd = ns.command(program);
    cmd.args(args).stderr(Stdio::null());
    cmd
}

/// True if `ss -Htuln` output shows a listener on `port`.
pub fn listening_on(ss_output: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    ss_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|local| local.ends_with(&suffix))
}

/// Poll `ss` in `node` until something listens on `port`.
pub fn wait_for_listener(
    node: &impl NodeExec,
    flow: usize,
    port: u16,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let output = node.exec_checked("ss", &["-Htuln"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        if listening_on(&text, port) {
            info!(flow = flow + 1, waited_ms = started.elapsed().as_millis() as u64, "server listening");
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(RunError::NotReady {
                flow: flow + 1,
                port,
                waited: started.elapsed(),
                last_output: text.into_owned(),
            });
        }
        if !sleep_unless_stopped(READINESS_POLL, stop) {
            return Err(RunError::Interrupted);
        }
    }
}
