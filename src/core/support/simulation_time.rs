/*!
Values for working with a simulated duration. Use [`EmulatedTime`] to represent an instant in time,
or [`SimulationTime`] to represent a time interval.

[`EmulatedTime`]: super::emulated_time::EmulatedTime
*/

use std::time::Duration;

use crate::linux_api::time::timespec;

/// A duration of simulated time, with nanosecond granularity.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash, Default)]
pub struct SimulationTime(u64);

impl SimulationTime {
    pub const MAX: SimulationTime = SimulationTime(u64::MAX - 1);
    pub const ZERO: SimulationTime = SimulationTime(0);
    pub const SECOND: SimulationTime = SimulationTime(1_000_000_000);
    pub const MILLISECOND: SimulationTime = SimulationTime(1_000_000);
    pub const MICROSECOND: SimulationTime = SimulationTime(1_000);
    pub const NANOSECOND: SimulationTime = SimulationTime(1);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / Self::SECOND.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / Self::MILLISECOND.0
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0
            .checked_add(other.0)
            .filter(|x| *x <= Self::MAX.0)
            .map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_mul(self, other: u64) -> Option<Self> {
        self.0
            .checked_mul(other)
            .filter(|x| *x <= Self::MAX.0)
            .map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        self.checked_add(other).unwrap_or(Self::MAX)
    }

    pub fn try_from_secs(s: u64) -> Option<Self> {
        Self::SECOND.checked_mul(s)
    }

    pub fn try_from_millis(s: u64) -> Option<Self> {
        Self::MILLISECOND.checked_mul(s)
    }

    pub fn from_millis(s: u64) -> Self {
        Self::try_from_millis(s).unwrap()
    }

    pub fn from_nanos(s: u64) -> Self {
        Self::NANOSECOND.checked_mul(s).unwrap()
    }
}

impl std::ops::Add<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn add(self, other: Self) -> Self::Output {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::Sub<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn sub(self, other: Self) -> Self::Output {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::Mul<u32> for SimulationTime {
    type Output = SimulationTime;

    fn mul(self, other: u32) -> Self::Output {
        self.checked_mul(other.into()).unwrap()
    }
}

impl TryFrom<Duration> for SimulationTime {
    type Error = ();

    fn try_from(val: Duration) -> Result<Self, Self::Error> {
        let val = u64::try_from(val.as_nanos()).map_err(|_| ())?;
        if val > Self::MAX.0 {
            return Err(());
        }
        Ok(Self(val))
    }
}

impl From<SimulationTime> for Duration {
    fn from(val: SimulationTime) -> Duration {
        Duration::from_nanos(val.0)
    }
}

impl TryFrom<timespec> for SimulationTime {
    type Error = ();

    fn try_from(value: timespec) -> Result<Self, Self::Error> {
        if value.tv_sec < 0 || value.tv_nsec < 0 || value.tv_nsec > 999_999_999 {
            return Err(());
        }
        let secs = Duration::from_secs(value.tv_sec.try_into().map_err(|_| ())?);
        let nanos = Duration::from_nanos(value.tv_nsec.try_into().map_err(|_| ())?);
        Self::try_from(secs + nanos)
    }
}
