use tracing::{debug, info};

use crate::command::NodeExec;
use crate::delay_schedule::DelayTarget;
use crate::error::{CommandError, Result};
use crate::topology::{Dumbbell, Namespace};

/// Queue size (packets) for links whose size the run does not set.
pub const DEFAULT_QUEUE_PACKETS: u32 = 1000;

/// A `tc netem` root qdisc: delay (+jitter), rate and queue limit.
///
/// A zero rate or jitter is left out of the command line; netem treats
/// both as "unset" anyway.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetemRule {
    pub delay_us: Option<u64>,
    pub jitter_us: Option<u64>,
    pub rate_mbit: Option<f64>,
    pub limit: u32,
}

impl NetemRule {
    /// A rule that only bounds the queue.
    pub fn queue_only(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn with_delay(&self, delay_us: u64) -> Self {
        Self {
            delay_us: Some(delay_us),
            ..self.clone()
        }
    }

    /// `tc` arguments installing this rule, replacing whatever root qdisc
    /// `iface` had.
    pub fn replace_args(&self, iface: &str) -> Vec<String> {
        self.args("replace", iface)
    }

    /// `tc` arguments mutating an already-installed netem root qdisc in
    /// place; its queue is kept.
    pub fn change_args(&self, iface: &str) -> Vec<String> {
        self.args("change", iface)
    }

    fn args(&self, verb: &str, iface: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "qdisc".into(),
            verb.into(),
            "dev".into(),
            iface.into(),
            "root".into(),
            "netem".into(),
        ];

        if let Some(delay) = self.delay_us {
            args.push("delay".into());
            args.push(format!("{delay}us"));
            if let Some(jitter) = self.jitter_us.filter(|j| *j > 0) {
                args.push(format!("{jitter}us"));
            }
        }

        if let Some(rate) = self.rate_mbit.filter(|r| *r > 0.0) {
            args.push("rate".into());
            args.push(format!("{rate}mbit"));
        }

        args.push("limit".into());
        args.push(self.limit.to_string());
        args
    }
}

/// Install `rule` as the root qdisc of `iface` on `node`.
pub fn apply_rule(node: &impl NodeExec, iface: &str, rule: &NetemRule) -> Result<(), CommandError> {
    run_tc(node, &rule.replace_args(iface))
}

fn run_tc(node: &impl NodeExec, args: &[String]) -> Result<(), CommandError> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    node.exec_checked("tc", &args)?;
    Ok(())
}

/// Shaping of one flow's two access links.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowShaping {
    pub left: NetemRule,
    pub right: NetemRule,
}

/// Shaping of the central link, shared by both routers except for the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CentralShaping {
    pub rate_mbit: f64,
    pub delay_us: u64,
    pub jitter_us: u64,
    pub first_queue: u32,
    pub second_queue: u32,
}

impl CentralShaping {
    fn rule(&self, limit: u32) -> NetemRule {
        NetemRule {
            delay_us: Some(self.delay_us),
            jitter_us: Some(self.jitter_us),
            rate_mbit: Some(self.rate_mbit),
            limit,
        }
    }
}

/// One router's end of the central link.
#[derive(Debug)]
pub struct CentralEnd<'a, N> {
    pub node: &'a N,
    pub iface: String,
    pub rule: NetemRule,
}

/// The central link's two netem qdiscs; its delay is changed in place
/// while the run is live.
#[derive(Debug)]
pub struct CentralLink<'a, N> {
    pub first: CentralEnd<'a, N>,
    pub second: CentralEnd<'a, N>,
}

impl<'a, N: NodeExec> CentralLink<'a, N> {
    pub fn new(
        first: (&'a N, &str),
        second: (&'a N, &str),
        shaping: &CentralShaping,
    ) -> Self {
        Self {
            first: CentralEnd {
                node: first.0,
                iface: first.1.to_string(),
                rule: shaping.rule(shaping.first_queue),
            },
            second: CentralEnd {
                node: second.0,
                iface: second.1.to_string(),
                rule: shaping.rule(shaping.second_queue),
            },
        }
    }

    /// Install both qdiscs.
    pub fn install(&self) -> Result<(), CommandError> {
        for end in [&self.first, &self.second] {
            apply_rule(end.node, &end.iface, &end.rule)?;
        }
        Ok(())
    }

    /// Change the delay of both qdiscs without reinstalling them.
    pub fn change_delay_us(&mut self, delay_us: u64) -> Result<(), CommandError> {
        for end in [&mut self.first, &mut self.second] {
            end.rule = end.rule.with_delay(delay_us);
            run_tc(end.node, &end.rule.change_args(&end.iface))?;
        }
        debug!(delay_us, "central link delay changed");
        Ok(())
    }
}

impl<N: NodeExec> DelayTarget for CentralLink<'_, N> {
    fn set_delay_us(&mut self, delay_us: u64) -> Result<()> {
        self.change_delay_us(delay_us)?;
        Ok(())
    }
}

/// Shape every interface of `dumbbell`: both access links and the host
/// bridge of each flow, then the central link on both routers.
///
/// `flows[i]` shapes the hosts of flow `i`.
pub fn configure_dumbbell<'a>(
    dumbbell: &'a Dumbbell,
    flows: &[FlowShaping],
    central: &CentralShaping,
) -> Result<CentralLink<'a, Namespace>> {
    debug_assert_eq!(flows.len(), dumbbell.flow_count());
    let bridge_rule = NetemRule::queue_only(DEFAULT_QUEUE_PACKETS);

    for (i, shaping) in flows.iter().enumerate() {
        for (half, rule) in [
            (&dumbbell.left, &shaping.left),
            (&dumbbell.right, &shaping.right),
        ] {
            let host = &half.hosts[i];
            apply_rule(&half.router, &half.router_ifaces[i], rule)?;
            apply_rule(&host.ns, &host.veth, rule)?;
            apply_rule(&host.ns, &host.bridge, &bridge_rule)?;
        }
    }

    let link = CentralLink::new(
        (&dumbbell.left.router, dumbbell.left.central_iface()),
        (&dumbbell.right.router, dumbbell.right.central_iface()),
        central,
    );
    link.install()?;

    info!(
        flows = flows.len(),
        rate_mbit = central.rate_mbit,
        delay_us = central.delay_us,
        jitter_us = central.jitter_us,
        "shaping installed"
    );
    Ok(link)
}
