//! Capability flags gating which built-in host functions a registry offers.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Set of host capabilities granted to a module
    pub struct Capabilities: u32 {
        /// Process exit (`proc_exit`, `harbor.exit`)
        const EXIT = 0x0001;
        /// Cooperative yield
        const SCHEDULING = 0x0002;
        /// Monotonic and wall clocks
        const CLOCK = 0x0004;
        /// Random bytes
        const RANDOM = 0x0008;
        /// Reads and writes on I/O handles
        const IO = 0x0010;
        /// Argument and environment access
        const ARGS = 0x0020;
        /// Timers and completion polling
        const TIMERS = 0x0040;
        /// Memory growth notifications
        const MEMORY = 0x0080;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::all()
    }
}

/// Single capability as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Exit,
    Scheduling,
    Clock,
    Random,
    Io,
    Args,
    Timers,
    Memory,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Exit,
        Capability::Scheduling,
        Capability::Clock,
        Capability::Random,
        Capability::Io,
        Capability::Args,
        Capability::Timers,
        Capability::Memory,
    ];

    pub fn flag(self) -> Capabilities {
        match self {
            Capability::Exit => Capabilities::EXIT,
            Capability::Scheduling => Capabilities::SCHEDULING,
            Capability::Clock => Capabilities::CLOCK,
            Capability::Random => Capabilities::RANDOM,
            Capability::Io => Capabilities::IO,
            Capability::Args => Capabilities::ARGS,
            Capability::Timers => Capabilities::TIMERS,
            Capability::Memory => Capabilities::MEMORY,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Exit => "exit",
            Capability::Scheduling => "scheduling",
            Capability::Clock => "clock",
            Capability::Random => "random",
            Capability::Io => "io",
            Capability::Args => "args",
            Capability::Timers => "timers",
            Capability::Memory => "memory",
        })
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Capabilities::empty(), |acc, c| acc | c.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_flags() {
        let caps: Capabilities = [Capability::Io, Capability::Exit].into_iter().collect();
        assert!(caps.contains(Capabilities::IO | Capabilities::EXIT));
        assert!(!caps.contains(Capabilities::TIMERS));
        assert_eq!(Capability::ALL.into_iter().collect::<Capabilities>(), Capabilities::all());
    }
}
