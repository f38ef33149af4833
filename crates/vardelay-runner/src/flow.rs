use std::fmt;
use std::str::FromStr;

use vardelay_sim::shaping::{FlowShaping, NetemRule};

/// Which way a flow's data travels across the dumbbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `<-`: the right host sends.
    Leftward,
    /// `->`: the left host sends.
    Rightward,
}

impl Direction {
    pub fn sender_side(self) -> Side {
        match self {
            Direction::Leftward => Side::Right,
            Direction::Rightward => Side::Left,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<-" => Ok(Direction::Leftward),
            "->" => Ok(Direction::Rightward),
            other => Err(format!("unknown direction `{other}`, expected `<-` or `->`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Role a scheme endpoint plays within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    pub fn other(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(format!("unknown role `{other}`, expected `sender` or `receiver`")),
        }
    }
}

/// Rate, propagation delay and queue of one access link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkShape {
    pub rate_mbit: f64,
    pub delay_us: u64,
    pub queue_packets: u32,
}

impl LinkShape {
    pub fn rule(&self) -> NetemRule {
        NetemRule {
            delay_us: Some(self.delay_us),
            jitter_us: None,
            rate_mbit: Some(self.rate_mbit),
            limit: self.queue_packets,
        }
    }
}

/// One flow of the run, after the layout has been expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSpec {
    /// 0-based; doubles as the host index on both halves.
    pub id: usize,
    pub scheme: String,
    pub direction: Direction,
    pub left: LinkShape,
    pub right: LinkShape,
    /// Start offset from the start of the run, in whole seconds.
    pub start_secs: u64,
    /// Role launched first, as the server.
    pub runs_first: Role,
}

impl FlowSpec {
    /// Side of the dumbbell whose host plays `role`.
    pub fn side_of(&self, role: Role) -> Side {
        let sender = self.direction.sender_side();
        match role {
            Role::Sender => sender,
            Role::Receiver => sender.opposite(),
        }
    }

    /// Side of the host that runs the server.
    pub fn server_side(&self) -> Side {
        self.side_of(self.runs_first)
    }

    pub fn client_role(&self) -> Role {
        self.runs_first.other()
    }

    pub fn shaping(&self) -> FlowShaping {
        FlowShaping {
            left: self.left.rule(),
            right: self.right.rule(),
        }
    }
}
