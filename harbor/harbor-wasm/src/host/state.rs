//! Per-instance host data.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use super::continuations::Continuations;
use super::io::{Handle, IoTable};

/// Values the module sees through the args/environment host functions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Seed for the random host functions; `None` seeds from the OS.
    pub seed: Option<u64>,
}

/// Mutable host data owned by one instance.
pub struct HostState {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub io: IoTable,
    pub rng: StdRng,
    pub clock: Box<dyn Clock>,
    pub continuations: Continuations,
    /// Exit code requested by the module, if any.
    pub exit_code: Option<i32>,
    /// Page counts reported through `memory_grown`.
    pub memory_growth: Vec<u32>,
}

impl HostState {
    /// State with process stdio handles and the system clock.
    pub fn new(config: HostConfig) -> Self {
        Self::with_io(config, IoTable::stdio())
    }

    pub fn with_io(config: HostConfig, io: IoTable) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            args: config.args,
            env: config.env,
            io,
            rng,
            clock: Box::new(SystemClock::new()),
            continuations: Continuations::new(),
            exit_code: None,
            memory_growth: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_handle(mut self, fd: u32, handle: Handle) -> Self {
        self.io.insert(fd, handle);
        self
    }

    pub fn fill_random(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    /// `KEY=VALUE` strings in declaration order.
    pub fn env_strings(&self) -> impl Iterator<Item = String> + '_ {
        self.env.iter().map(|(k, v)| format!("{k}={v}"))
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("args", &self.args)
            .field("env", &self.env)
            .field("io", &self.io)
            .field("continuations", &self.continuations)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_random_is_reproducible() {
        let config = HostConfig { seed: Some(7), ..HostConfig::default() };
        let mut a = HostState::with_io(config.clone(), IoTable::empty());
        let mut b = HostState::with_io(config, IoTable::empty());
        let (mut x, mut y) = ([0u8; 16], [0u8; 16]);
        a.fill_random(&mut x);
        b.fill_random(&mut y);
        assert_eq!(x, y);
    }
}
