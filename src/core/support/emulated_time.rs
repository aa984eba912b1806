/*!
Deals with instances of time in a simulation.
*/

use super::simulation_time::SimulationTime;

/// An instant in time (analagous to std::time::Instant) in the simulation.
// Internally represented as nanoseconds since the Unix Epoch.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash)]
pub struct EmulatedTime(u64);

/// Seconds from the epoch to January 1st, 2000 at 12:00am UTC. Managed processes are told that
/// the simulation starts at this instant.
pub const SIMULATION_START_SEC: u64 = 946684800u64;

impl EmulatedTime {
    /// The start time of the simulation - 00:00:00 UTC on 1 January, 2000.
    pub const SIMULATION_START: Self = Self(SIMULATION_START_SEC * 1_000_000_000);
    /// The  Unix epoch (00:00:00 UTC on 1 January 1970)
    pub const UNIX_EPOCH: Self = Self(0);

    pub const MAX: Self = Self(u64::MAX - 1);

    /// Get the instant corresponding to `val` time units since the simulation began.
    pub fn from_abs_simtime(val: SimulationTime) -> Self {
        Self::SIMULATION_START + val
    }

    /// Convert to the SimulationTime since the simulation began.
    pub fn to_abs_simtime(self) -> SimulationTime {
        self.saturating_duration_since(&Self::SIMULATION_START)
    }

    /// Returns the duration since `earlier`, or `None` if `earlier` is after `self`.
    pub fn checked_duration_since(&self, earlier: &EmulatedTime) -> Option<SimulationTime> {
        let d = self.0.checked_sub(earlier.0)?;
        Some(SimulationTime::from_nanos(d))
    }

    /// Returns the duration since `earlier`, or 0 if `earlier` is after `self`.
    pub fn saturating_duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.checked_duration_since(earlier)
            .unwrap_or(SimulationTime::ZERO)
    }

    pub fn checked_add(&self, duration: SimulationTime) -> Option<EmulatedTime> {
        self.0
            .checked_add(duration.as_nanos())
            .filter(|x| *x <= Self::MAX.0)
            .map(Self)
    }

    pub fn saturating_add(&self, duration: SimulationTime) -> EmulatedTime {
        self.checked_add(duration).unwrap_or(EmulatedTime::MAX)
    }
}

impl std::ops::Add<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn add(self, other: SimulationTime) -> Self::Output {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for EmulatedTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<EmulatedTime> for EmulatedTime {
    type Output = SimulationTime;

    fn sub(self, other: EmulatedTime) -> Self::Output {
        self.checked_duration_since(&other).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_abs_simtime() {
        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::ZERO),
            EmulatedTime::SIMULATION_START
        );

        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::SECOND),
            EmulatedTime::SIMULATION_START + SimulationTime::SECOND
        );
    }

    #[test]
    fn test_to_abs_simtime() {
        assert_eq!(
            EmulatedTime::SIMULATION_START.to_abs_simtime(),
            SimulationTime::ZERO
        );

        assert_eq!(
            (EmulatedTime::SIMULATION_START + SimulationTime::SECOND).to_abs_simtime(),
            SimulationTime::SECOND
        );
    }

    #[test]
    fn test_overflow() {
        assert_eq!(EmulatedTime::MAX.checked_add(SimulationTime::NANOSECOND), None);
        assert_eq!(
            EmulatedTime::MAX.saturating_add(SimulationTime::SECOND),
            EmulatedTime::MAX
        );
        let later = EmulatedTime::SIMULATION_START + SimulationTime::MILLISECOND;
        assert_eq!(later - EmulatedTime::SIMULATION_START, SimulationTime::MILLISECOND);
        assert_eq!(
            EmulatedTime::SIMULATION_START.checked_duration_since(&later),
            None
        );
    }
}
