//! Engine session ownership and alert mask bookkeeping.
//!
//! Several independent parties need alert categories enabled: the static
//! configuration and every live subscription. Each category bit is
//! refcounted, and the mask applied to the engine is always the OR of the
//! bits with a nonzero count.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{AlertCategory, Session};

/// Per-bit holder counts for alert categories.
#[derive(Debug, Default, Clone)]
pub struct AlertMaskRefcount {
    counts: BTreeMap<u32, usize>,
}

impl AlertMaskRefcount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one holder for every bit in `mask`.
    pub fn acquire(&mut self, mask: AlertCategory) {
        for bit in mask.bits() {
            *self.counts.entry(bit.as_u32()).or_insert(0) += 1;
        }
    }

    /// Drops one holder for every bit in `mask`.
    ///
    /// A bit released more often than it was acquired is logged and
    /// skipped.
    pub fn release(&mut self, mask: AlertCategory) {
        for bit in mask.bits() {
            let Some(count) = self.counts.get_mut(&bit.as_u32()) else {
                tracing::warn!("Alert category {} released without being acquired", bit);
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&bit.as_u32());
            }
        }
    }

    /// Number of holders of a single-bit category.
    pub fn holders(&self, bit: AlertCategory) -> usize {
        self.counts.get(&bit.as_u32()).copied().unwrap_or(0)
    }

    /// OR of every bit with at least one holder.
    pub fn mask(&self) -> AlertCategory {
        self.counts
            .keys()
            .fold(AlertCategory::NONE, |mask, &bit| {
                mask | AlertCategory::from_bits(bit)
            })
    }
}

struct MaskState {
    refcount: AlertMaskRefcount,
    config_mask: AlertCategory,
    applied: AlertCategory,
}

/// Owns the engine session and keeps its alert mask in sync with demand.
pub struct SessionService {
    session: Arc<dyn Session>,
    mask: Mutex<MaskState>,
}

impl SessionService {
    /// Wraps `session`, permanently enabling `config_mask`.
    pub fn new(session: Arc<dyn Session>, config_mask: AlertCategory) -> Self {
        let mut refcount = AlertMaskRefcount::new();
        refcount.acquire(config_mask);
        let service = Self {
            session,
            mask: Mutex::new(MaskState {
                refcount,
                config_mask,
                applied: AlertCategory::NONE,
            }),
        };
        service.update_alert_mask(&mut service.mask.lock());
        service
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Mask most recently pushed to the engine.
    pub fn alert_mask(&self) -> AlertCategory {
        self.mask.lock().applied
    }

    /// Number of holders of a single-bit category.
    pub fn alert_mask_holders(&self, bit: AlertCategory) -> usize {
        self.mask.lock().refcount.holders(bit)
    }

    pub fn inc_alert_mask(&self, mask: AlertCategory) {
        let mut state = self.mask.lock();
        state.refcount.acquire(mask);
        self.update_alert_mask(&mut state);
    }

    pub fn dec_alert_mask(&self, mask: AlertCategory) {
        let mut state = self.mask.lock();
        state.refcount.release(mask);
        self.update_alert_mask(&mut state);
    }

    /// Replaces the statically configured contribution to the mask.
    pub fn stage_alert_mask(&self, config_mask: AlertCategory) {
        let mut state = self.mask.lock();
        let previous = state.config_mask;
        state.refcount.acquire(config_mask);
        state.refcount.release(previous);
        state.config_mask = config_mask;
        self.update_alert_mask(&mut state);
    }

    fn update_alert_mask(&self, state: &mut MaskState) {
        let mask = state.refcount.mask();
        let changed = AlertCategory::from_bits(mask.as_u32() ^ state.applied.as_u32());
        if changed.is_empty() {
            return;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            for bit in changed.bits() {
                if mask.contains(bit) {
                    tracing::debug!("enabling alerts: {}", bit);
                } else {
                    tracing::debug!("disabling alerts: {}", bit);
                }
            }
        }
        self.session.apply_alert_mask(mask);
        state.applied = mask;
    }
}
