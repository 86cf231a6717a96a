use chrono::{Local, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use strum::{Display, EnumString};

/// Which half of the day the router is operating in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DayPeriod {
    Day,
    Night,
}

pub trait Clock: Send + Sync {
    fn period(&self) -> DayPeriod;

    fn is_day(&self) -> bool {
        self.period() == DayPeriod::Day
    }

    fn is_night(&self) -> bool {
        self.period() == DayPeriod::Night
    }
}

/// Wall clock with fixed day/night boundary hours.
///
/// Day covers `[day_start_hour, night_start_hour)`; the boundaries may wrap
/// midnight. Hours are taken in `timezone` when set, host local time otherwise.
#[derive(Debug, Clone)]
pub struct SystemClock {
    day_start_hour: u32,
    night_start_hour: u32,
    timezone: Option<Tz>,
}

impl SystemClock {
    pub fn new(day_start_hour: u32, night_start_hour: u32, timezone: Option<Tz>) -> Self {
        Self {
            day_start_hour,
            night_start_hour,
            timezone,
        }
    }

    pub fn period_at(&self, hour: u32) -> DayPeriod {
        let is_day = if self.day_start_hour <= self.night_start_hour {
            hour >= self.day_start_hour && hour < self.night_start_hour
        } else {
            hour >= self.day_start_hour || hour < self.night_start_hour
        };
        if is_day {
            DayPeriod::Day
        } else {
            DayPeriod::Night
        }
    }

    fn current_hour(&self) -> u32 {
        match self.timezone {
            Some(tz) => Utc::now().with_timezone(&tz).hour(),
            None => Local::now().hour(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(7, 23, None)
    }
}

impl Clock for SystemClock {
    fn period(&self) -> DayPeriod {
        self.period_at(self.current_hour())
    }
}

/// Clock pinned to a period until told otherwise
#[derive(Debug, Default)]
pub struct FixedClock {
    night: AtomicBool,
}

impl FixedClock {
    pub fn new(period: DayPeriod) -> Self {
        Self {
            night: AtomicBool::new(period == DayPeriod::Night),
        }
    }

    pub fn set_period(&self, period: DayPeriod) {
        self.night.store(period == DayPeriod::Night, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn period(&self) -> DayPeriod {
        if self.night.load(Ordering::SeqCst) {
            DayPeriod::Night
        } else {
            DayPeriod::Day
        }
    }
}
