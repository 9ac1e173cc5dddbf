//! Pool-wide counters fed to the scaling policy.

use crate::details::{MachineDetails, MachineState};

/// Snapshot of machine counts per state for one runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachinesData {
    pub idle: usize,
    pub creating: usize,
    pub acquired: usize,
    pub used: usize,
    pub removing: usize,
    pub stuck_on_removing: usize,
}

impl MachinesData {
    /// Machines that are, or are about to become, available for jobs.
    pub fn available(&self) -> usize {
        self.idle + self.creating + self.acquired
    }

    /// Machines currently serving jobs.
    pub fn in_use(&self) -> usize {
        self.used
    }

    /// Everything the runner currently owns, wedged removals included.
    pub fn total(&self) -> usize {
        self.idle + self.creating + self.acquired + self.used + self.removing
            + self.stuck_on_removing
    }

    pub fn add(&mut self, details: &MachineDetails, remove_retry_limit: usize) {
        match details.state {
            MachineState::Idle => self.idle += 1,
            MachineState::Creating => self.creating += 1,
            MachineState::Acquired => self.acquired += 1,
            MachineState::Used => self.used += 1,
            MachineState::Removing => {
                if details.is_stuck_on_removing(remove_retry_limit) {
                    self.stuck_on_removing += 1;
                } else {
                    self.removing += 1;
                }
            }
        }
    }
}

impl std::fmt::Display for MachinesData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "idle={} creating={} acquired={} used={} removing={} stuck={}",
            self.idle, self.creating, self.acquired, self.used, self.removing,
            self.stuck_on_removing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut data = MachinesData::default();
        let mut details = MachineDetails::discovered("m1");
        data.add(&details, 3);

        details.state = MachineState::Creating;
        data.add(&details, 3);

        details.state = MachineState::Used;
        data.add(&details, 3);

        details.state = MachineState::Removing;
        details.retry_count = 5;
        data.add(&details, 3);

        assert_eq!(data.idle, 1);
        assert_eq!(data.creating, 1);
        assert_eq!(data.used, 1);
        assert_eq!(data.stuck_on_removing, 1);
        assert_eq!(data.available(), 2);
        assert_eq!(data.in_use(), 1);
        assert_eq!(data.total(), 4);
    }
}
