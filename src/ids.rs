use thiserror::Error;

/// Every identified object in a generated container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    DomReadyTrigger,
    ThresholdTrigger,
    FormSuccessTrigger,
    ScrollPercentVariable,
    FormUrlVariable,
    CoreListenerTag,
    AnalyticsTag,
    AjaxListenerTag,
}

impl Slot {
    /// Largest offset in the table.
    pub const MAX_OFFSET: u64 = 23;

    pub const fn offset(self) -> u64 {
        match self {
            Slot::DomReadyTrigger => 1,
            Slot::ThresholdTrigger => 2,
            Slot::FormSuccessTrigger => 3,
            Slot::ScrollPercentVariable => 11,
            Slot::FormUrlVariable => 12,
            Slot::CoreListenerTag => 21,
            Slot::AnalyticsTag => 22,
            Slot::AjaxListenerTag => 23,
        }
    }
}

/// Largest base for which every slot id still fits in a `u64`.
pub const MAX_BASE: u64 = u64::MAX - Slot::MAX_OFFSET;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier base {base} is above the maximum {max}")]
    BaseOutOfRange { base: u64, max: u64 },
}

/// Per-request identifier source. The import tool assigns final ids, so
/// these only need to be consistent within one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdAllocator {
    base: u64,
}

impl IdAllocator {
    pub fn with_base(base: u64) -> Result<Self, IdError> {
        if base > MAX_BASE {
            return Err(IdError::BaseOutOfRange {
                base,
                max: MAX_BASE,
            });
        }
        Ok(Self { base })
    }

    /// Seeds from the last six digits of the current time in milliseconds.
    pub fn from_clock() -> Self {
        let millis = chrono::Utc::now().timestamp_millis().unsigned_abs();
        Self {
            base: millis % 1_000_000,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn id(&self, slot: Slot) -> String {
        (self.base + slot.offset()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_offsets_from_base() {
        let ids = IdAllocator::with_base(420000).unwrap();
        assert_eq!(ids.id(Slot::DomReadyTrigger), "420001");
        assert_eq!(ids.id(Slot::ScrollPercentVariable), "420011");
        assert_eq!(ids.id(Slot::AjaxListenerTag), "420023");
    }

    const ALL: [Slot; 8] = [
        Slot::DomReadyTrigger,
        Slot::ThresholdTrigger,
        Slot::FormSuccessTrigger,
        Slot::ScrollPercentVariable,
        Slot::FormUrlVariable,
        Slot::CoreListenerTag,
        Slot::AnalyticsTag,
        Slot::AjaxListenerTag,
    ];

    #[test]
    fn clock_seed_stays_within_six_digits() {
        let ids = IdAllocator::from_clock();
        assert!(ids.base() < 1_000_000);
        let unique: HashSet<String> = ALL.iter().map(|s| ids.id(*s)).collect();
        assert_eq!(unique.len(), ALL.len());
    }

    #[test]
    fn largest_base_still_fits_every_slot() {
        assert!(ALL.iter().all(|s| s.offset() <= Slot::MAX_OFFSET));
        let ids = IdAllocator::with_base(MAX_BASE).unwrap();
        assert_eq!(ids.id(Slot::AjaxListenerTag), u64::MAX.to_string());
        assert_eq!(
            IdAllocator::with_base(MAX_BASE + 1),
            Err(IdError::BaseOutOfRange {
                base: MAX_BASE + 1,
                max: MAX_BASE,
            })
        );
    }
}
