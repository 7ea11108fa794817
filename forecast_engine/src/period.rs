//! Calendar month arithmetic

use crate::error::{ForecastError, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A calendar month, rendered `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(ForecastError::InvalidParameter(format!(
                "month must be in 1..=12, got {}",
                month
            )));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn from_datetime(timestamp: &NaiveDateTime) -> Self {
        Self::from_date(timestamp.date())
    }

    /// Months since year 0, so consecutive months differ by exactly one
    pub fn ordinal(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    pub fn from_ordinal(ordinal: i64) -> Self {
        Self {
            year: ordinal.div_euclid(12) as i32,
            month: ordinal.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn offset(&self, months: i64) -> Self {
        Self::from_ordinal(self.ordinal() + months)
    }

    pub fn succ(&self) -> Self {
        self.offset(1)
    }

    pub fn pred(&self) -> Self {
        self.offset(-1)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// Calendar month, 1 = January
    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// Short display label such as `Jan 2024`
    pub fn label(&self) -> String {
        match self.first_day() {
            Some(day) => day.format("%b %Y").to_string(),
            None => self.to_string(),
        }
    }

    /// Every month from `start` to `end`, both inclusive
    pub fn range_inclusive(start: Month, end: Month) -> impl Iterator<Item = Month> {
        (start.ordinal()..=end.ordinal()).map(Month::from_ordinal)
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| ForecastError::DataError(format!("not a YYYY-MM month: {}", s)))?;
        let year = year
            .parse::<i32>()
            .map_err(|_| ForecastError::DataError(format!("bad year in month: {}", s)))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| ForecastError::DataError(format!("bad month in month: {}", s)))?;
        Month::new(year, month)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
