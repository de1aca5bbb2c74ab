//! Stake records and validated request inputs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StakeError};

/// Store-assigned stake identifier
pub type StakeId = i64;

/// Owning user identifier
pub type OwnerId = i64;

/// Largest page size a listing may request
pub const MAX_PAGE_SIZE: u32 = 100;

/// Lock-up period of a stake, restricted to the offered terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum StakePeriod {
    OneMonth,
    ThreeMonths,
    SixMonths,
    TwelveMonths,
}

impl StakePeriod {
    pub const ALL: [Self; 4] = [
        Self::OneMonth,
        Self::ThreeMonths,
        Self::SixMonths,
        Self::TwelveMonths,
    ];

    #[must_use]
    pub fn months(self) -> i32 {
        match self {
            Self::OneMonth => 1,
            Self::ThreeMonths => 3,
            Self::SixMonths => 6,
            Self::TwelveMonths => 12,
        }
    }
}

impl TryFrom<i32> for StakePeriod {
    type Error = StakeError;

    fn try_from(months: i32) -> Result<Self> {
        match months {
            1 => Ok(Self::OneMonth),
            3 => Ok(Self::ThreeMonths),
            6 => Ok(Self::SixMonths),
            12 => Ok(Self::TwelveMonths),
            other => Err(StakeError::Validation(format!(
                "period must be one of 1, 3, 6 or 12 months, got {other}"
            ))),
        }
    }
}

impl From<StakePeriod> for i32 {
    fn from(period: StakePeriod) -> Self {
        period.months()
    }
}

impl fmt::Display for StakePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.months())
    }
}

/// A persisted stake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stake {
    pub id: StakeId,
    pub owner_id: OwnerId,
    pub amount: f64,
    pub period: StakePeriod,
    pub created_at: DateTime<Utc>,
}

/// A stake about to be inserted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewStake {
    pub owner_id: OwnerId,
    pub amount: f64,
    pub period: StakePeriod,
}

impl NewStake {
    /// Validate raw caller input
    ///
    /// # Errors
    ///
    /// [`StakeError::Validation`] when the amount is not a positive finite
    /// number or the period is not one of the offered terms.
    pub fn new(owner_id: OwnerId, amount: f64, period_months: i32) -> Result<Self> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(StakeError::Validation(format!(
                "amount must be a positive number, got {amount}"
            )));
        }
        Ok(Self {
            owner_id,
            amount,
            period: StakePeriod::try_from(period_months)?,
        })
    }
}

/// One page of an owner's stakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListQuery {
    page: u32,
    page_size: u32,
}

impl ListQuery {
    /// # Errors
    ///
    /// [`StakeError::Validation`] unless `page >= 1` and
    /// `1 <= page_size <= 100`.
    pub fn new(page: u32, page_size: u32) -> Result<Self> {
        if page == 0 {
            return Err(StakeError::Validation("page must be at least 1".into()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(StakeError::Validation(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        Ok(Self { page, page_size })
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Rows to skip in the store query
    #[must_use]
    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }

    #[must_use]
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

/// Result of a listing read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StakePage {
    pub items: Vec<Stake>,
    pub served_from_cache: bool,
}

/// Result of a single-record read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeLookup {
    pub stake: Stake,
    pub served_from_cache: bool,
    /// Served past its freshness window while a refresh runs
    pub stale: bool,
}
