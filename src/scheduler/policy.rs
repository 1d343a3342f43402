//! Delay before the next execution of a widget instance.

use std::time::Duration;

use rand::Rng;

use crate::config::SchedulerConfig;
use crate::execution::ExecutionDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    /// Dashboard load or content reload: short fixed delay.
    Immediate,
    /// A stopped widget is being resumed: random jitter to spread bursts.
    FirstAttach,
    /// Next cycle of a running widget: its own delay.
    Routine,
}

impl DelayKind {
    pub fn classify(immediate: bool, resumed: bool) -> Self {
        if immediate {
            DelayKind::Immediate
        } else if resumed {
            DelayKind::FirstAttach
        } else {
            DelayKind::Routine
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DelayPolicy {
    immediate: Duration,
    jitter_min_secs: u64,
    jitter_max_secs: u64,
}

impl DelayPolicy {
    pub fn new(config: &SchedulerConfig) -> Self {
        let min = config.first_attach_jitter_min_secs;
        let max = config.first_attach_jitter_max_secs;
        Self {
            immediate: config.immediate_delay(),
            jitter_min_secs: min.min(max),
            jitter_max_secs: min.max(max),
        }
    }

    pub fn delay(&self, kind: DelayKind, descriptor: &ExecutionDescriptor) -> Duration {
        match kind {
            DelayKind::Immediate => self.immediate,
            DelayKind::FirstAttach => Duration::from_secs(
                rand::thread_rng().gen_range(self.jitter_min_secs..=self.jitter_max_secs),
            ),
            DelayKind::Routine => Duration::from_secs(
                descriptor
                    .delay_secs
                    .and_then(|d| u64::try_from(d).ok())
                    .unwrap_or_default(),
            ),
        }
    }
}
