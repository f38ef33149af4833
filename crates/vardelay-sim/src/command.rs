use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::debug;

use crate::error::CommandError;

/// Something that can run short-lived commands: a namespace, or a test fake.
///
/// Shaping and topology code only talk to nodes through this trait so the
/// exact command lines can be checked without root.
pub trait NodeExec {
    /// Name of the node, used in logs and error messages.
    fn node_name(&self) -> &str;

    /// Run `cmd args..` on the node, returning raw output.
    fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output, CommandError>;

    /// Run `cmd args..` on the node, failing if it exits non-zero.
    fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output, CommandError> {
        let output = self.exec(cmd, args)?;
        if !output.status.success() {
            return Err(CommandError::failed(
                format!("[{}] {}", self.node_name(), render(cmd, args)),
                &output,
            ));
        }
        Ok(output)
    }
}

/// Joins a command and its arguments into one printable line.
pub fn render(cmd: &str, args: &[&str]) -> String {
    let mut line = cmd.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// A `Command` that runs with root privileges: directly when we already are
/// root, through `sudo` otherwise.
pub fn privileged(program: &str) -> Command {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        Command::new(program)
    } else {
        let mut cmd = Command::new("sudo");
        cmd.arg(program);
        cmd
    }
}

/// Resolve `name` the way a privileged command would find it, or `None`
/// when it is not installed.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    lookup(privileged("sh"), name)
}

/// `command -v name` through the given shell.
fn lookup(mut shell: Command, name: &str) -> Option<PathBuf> {
    shell
        .args(["-c", &format!("command -v {name}")])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim()))
        .filter(|path| !path.as_os_str().is_empty())
}

/// Run a privileged command in the root namespace, returning raw output.
pub(crate) fn root(program: &str, args: &[&str]) -> Result<Output, CommandError> {
    debug!(cmd = %render(program, args), "exec");
    privileged(program)
        .args(args)
        .output()
        .map_err(|e| CommandError::launch(render(program, args), e))
}

/// Run a privileged command in the root namespace, failing on non-zero exit.
pub(crate) fn root_checked(program: &str, args: &[&str]) -> Result<Output, CommandError> {
    let output = root(program, args)?;
    if !output.status.success() {
        return Err(CommandError::failed(render(program, args), &output));
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    /// Records every command line and answers with canned stdout.
    pub struct RecordingNode {
        pub name: String,
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Option<String>,
    }

    impl RecordingNode {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NodeExec for RecordingNode {
        fn node_name(&self) -> &str {
            &self.name
        }

        fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output, CommandError> {
            let line = render(cmd, args);
            let failed = self
                .fail_on
                .as_deref()
                .is_some_and(|needle| line.contains(needle));
            self.calls.lock().unwrap().push(line);
            Ok(Output {
                status: ExitStatus::from_raw(if failed { 2 << 8 } else { 0 }),
                stdout: b"aa:bb:cc:dd:ee:ff\n".to_vec(),
                stderr: if failed { b"RTNETLINK answers: No such device".to_vec() } else { Vec::new() },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::RecordingNode;
    use super::*;

    #[test]
    fn render_joins_arguments() {
        assert_eq!(render("tc", &["qdisc", "show"]), "tc qdisc show");
        assert_eq!(render("ip", &[]), "ip");
    }

    #[test]
    fn lookup_resolves_installed_tools_only() {
        assert!(lookup(Command::new("sh"), "sh").is_some_and(|p| p.ends_with("sh")));
        assert!(lookup(Command::new("sh"), "vardelay-no-such-tool").is_none());
    }

    #[test]
    fn exec_checked_reports_command_and_stderr() {
        let mut node = RecordingNode::new("r1");
        node.fail_on = Some("eth9".into());

        node.exec_checked("ip", &["link", "set", "eth0", "up"])
            .expect("succeeds");
        let err = node
            .exec_checked("ip", &["link", "set", "eth9", "up"])
            .unwrap_err();

        match err {
            CommandError::Failed {
                command,
                code,
                stderr,
            } => {
                assert_eq!(command, "[r1] ip link set eth9 up");
                assert_eq!(code, Some(2));
                assert!(stderr.contains("No such device"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
