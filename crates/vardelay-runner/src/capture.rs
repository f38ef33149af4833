use std::io::Read;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};
use vardelay_sim::Namespace;

use crate::error::{Result, RunError};
use crate::flow::Role;
use crate::process::ProcessHandle;

/// Pause after starting every capture so the first packets are not missed.
pub const WARM_UP: Duration = Duration::from_millis(500);

/// One `tcpdump` recording a flow at one of its two hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub flow_id: usize,
    pub scheme: String,
    pub role: Role,
    /// Bridge of the host playing `role`.
    pub iface: String,
    pub receiver_ip: Ipv4Addr,
    pub sender_ip: Ipv4Addr,
    pub buffer_kib: u32,
    /// User tcpdump drops privileges to after opening the interface.
    pub user: Option<String>,
    pub output_dir: PathBuf,
}

impl CaptureSpec {
    /// `<n>-<scheme>-<role>.pcap`, `n` being the 1-based flow number.
    pub fn file_name(flow_id: usize, scheme: &str, role: Role) -> String {
        format!("{}-{scheme}-{role}.pcap", flow_id + 1)
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir
            .join(Self::file_name(self.flow_id, &self.scheme, self.role))
    }

    pub fn label(&self) -> String {
        format!("capture {}-{}-{}", self.flow_id + 1, self.scheme, self.role)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-tt".into(), "-nn".into(), "-i".into(), self.iface.clone()];
        if let Some(user) = &self.user {
            args.push("-Z".into());
            args.push(user.clone());
        }
        args.push("-B".into());
        args.push(self.buffer_kib.to_string());
        args.push("-w".into());
        args.push(self.path().to_string_lossy().into_owned());
        let receiver = self.receiver_ip.to_string();
        let sender = self.sender_ip.to_string();
        args.extend(
            [
                "host",
                receiver.as_str(),
                "and",
                "host",
                sender.as_str(),
                "and",
                "(tcp or udp)",
            ]
            .map(String::from),
        );
        args
    }
}

/// A running capture: the process handle used to stop it, and the thread
/// draining its stderr for the post-mortem.
#[derive(Debug)]
pub struct Capture {
    process: ProcessHandle,
    stderr: Option<JoinHandle<String>>,
}

impl Capture {
    pub fn start(ns: &Namespace, spec: &CaptureSpec) -> Result<Self> {
        let mut cmd = ns.command("tcpdump");
        cmd.args(spec.args()).stderr(Stdio::piped());

        let mut process = ProcessHandle::spawn(cmd, spec.label())?;
        let stderr = process.take_stderr().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        debug!(ns = %ns.name, iface = %spec.iface, path = %spec.path().display(), "capture started");
        Ok(Self { process, stderr })
    }

    #[cfg(test)]
    pub(crate) fn detached(label: &str, pid: u32, stderr: &str) -> Self {
        let stderr = stderr.to_string();
        Self {
            process: ProcessHandle::detached(label, pid),
            stderr: Some(std::thread::spawn(move || stderr)),
        }
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut ProcessHandle {
        &mut self.process
    }

    /// Collect what the capture wrote to stderr. Call after it was reaped,
    /// otherwise this blocks until it exits.
    pub fn finish(self) -> CaptureReport {
        let stderr = self
            .stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        CaptureReport {
            label: self.process.label().to_string(),
            stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub label: String,
    pub stderr: String,
}

/// Kernel drop count from tcpdump's exit summary
/// (`N packets dropped by kernel`).
pub fn parse_dropped(stderr: &str) -> Option<u64> {
    stderr.lines().find_map(|line| {
        let count = line.trim().strip_suffix("packets dropped by kernel")?;
        count.trim().parse().ok()
    })
}

/// Packets the kernel dropped before tcpdump could record them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropReport {
    pub per_capture: Vec<(String, u64)>,
}

impl DropReport {
    /// Fails if any capture exited without a drop summary, which means
    /// tcpdump itself failed.
    pub fn from_reports(reports: Vec<CaptureReport>) -> Result<Self> {
        let mut per_capture = Vec::with_capacity(reports.len());
        for report in reports {
            match parse_dropped(&report.stderr) {
                Some(dropped) => per_capture.push((report.label, dropped)),
                None => {
                    return Err(RunError::MissingDropCount {
                        capture: report.label,
                        stderr: report.stderr.trim().to_string(),
                    })
                }
            }
        }
        Ok(Self { per_capture })
    }

    pub fn total(&self) -> u64 {
        self.per_capture.iter().map(|(_, n)| n).sum()
    }

    pub fn warn_if_lossy(&self) {
        let total = self.total();
        if total == 0 {
            return;
        }
        for (label, dropped) in self.per_capture.iter().filter(|(_, n)| *n > 0) {
            warn!(capture = %label, dropped, "kernel dropped captured packets");
        }
        warn!(
            total,
            "captures lost packets in total; increase the capture buffer size"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(user: Option<&str>) -> CaptureSpec {
        CaptureSpec {
            flow_id: 0,
            scheme: "bbr".into(),
            role: Role::Sender,
            iface: "a1-br0".into(),
            receiver_ip: Ipv4Addr::new(11, 0, 0, 9),
            sender_ip: Ipv4Addr::new(11, 0, 0, 1),
            buffer_kib: 4096,
            user: user.map(String::from),
            output_dir: PathBuf::from("/tmp/run"),
        }
    }

    #[test]
    fn file_names_are_one_based() {
        assert_eq!(CaptureSpec::file_name(0, "bbr", Role::Sender), "1-bbr-sender.pcap");
        assert_eq!(
            CaptureSpec::file_name(41, "vegas", Role::Receiver),
            "42-vegas-receiver.pcap"
        );
    }

    #[test]
    fn args_filter_on_both_endpoints() {
        assert_eq!(
            spec(Some("alice")).args(),
            vec![
                "-tt", "-nn", "-i", "a1-br0", "-Z", "alice", "-B", "4096", "-w",
                "/tmp/run/1-bbr-sender.pcap", "host", "11.0.0.9", "and", "host", "11.0.0.1",
                "and", "(tcp or udp)",
            ]
        );
    }

    #[test]
    fn args_skip_user_when_unset() {
        let args = spec(None).args();
        assert!(!args.iter().any(|a| a == "-Z"));
        assert_eq!(&args[4..6], ["-B", "4096"]);
    }

    #[test]
    fn drop_count_is_parsed_from_summary() {
        let stderr = "tcpdump: listening on a1-br0, link-type EN10MB\n\
                      1520 packets captured\n\
                      1524 packets received by filter\n\
                      4 packets dropped by kernel\n";
        assert_eq!(parse_dropped(stderr), Some(4));
        assert_eq!(parse_dropped("tcpdump: a1-br0: No such device exists\n"), None);
    }

    #[test]
    fn missing_summary_fails_the_report() {
        let err = DropReport::from_reports(vec![
            CaptureReport {
                label: "capture 1-bbr-sender".into(),
                stderr: "0 packets dropped by kernel".into(),
            },
            CaptureReport {
                label: "capture 1-bbr-receiver".into(),
                stderr: "tcpdump: permission denied".into(),
            },
        ])
        .unwrap_err();
        match err {
            RunError::MissingDropCount { capture, stderr } => {
                assert_eq!(capture, "capture 1-bbr-receiver");
                assert_eq!(stderr, "tcpdump: permission denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drops_are_summed() {
        let report = DropReport::from_reports(vec![
            CaptureReport {
                label: "a".into(),
                stderr: "3 packets dropped by kernel".into(),
            },
            CaptureReport {
                label: "b".into(),
                stderr: "9 packets dropped by kernel\n".into(),
            },
        ])
        .unwrap();
        assert_eq!(report.total(), 12);
    }

    #[test]
    fn detached_capture_reports_its_stderr() {
        let capture = Capture::detached("capture 2-cubic-receiver", 7, "0 packets dropped by kernel");
        let report = capture.finish();
        assert_eq!(report.label, "capture 2-cubic-receiver");
        assert_eq!(parse_dropped(&report.stderr), Some(0));
    }
}
