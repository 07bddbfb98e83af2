//! Picking interrupt holdoff settings.
//!
//! The SGE only supports a handful of holdoff timers and packet count
//! thresholds, so a request is mapped onto the closest supported values.

use modular_bitfield_msb::{bitfield, specifiers::{B3, B4}};

/// Number of holdoff timers the SGE provides.
pub const SGE_NTIMERS: usize = 6;
/// Number of packet count thresholds the SGE provides.
pub const SGE_NCOUNTERS: usize = 4;

/// Timer index that restarts the counter without changing its value.
pub(crate) const TIMER_RESTART_COUNTER: u8 = 6;
/// Timer index that only updates the consumer index, i.e. no coalescing.
pub(crate) const TIMER_UPDATE_CIDX: u8 = 7;

/// The holdoff values the hardware was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescingTables {
    /// holdoff timers in microseconds
    pub timer_us: [u32; SGE_NTIMERS],
    /// packet count thresholds
    pub counter: [u32; SGE_NCOUNTERS],
}

impl Default for CoalescingTables {
    /// The values the firmware configuration file normally programs.
    fn default() -> Self {
        Self {
            timer_us: [1, 5, 10, 50, 100, 200],
            counter: [1, 8, 16, 32],
        }
    }
}

/// The interrupt parameters of a response queue, as written to the GTS register.
#[bitfield]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntrParams {
    #[skip] __: B4,
    pub timer_idx: B3,
    pub cnt_en: bool,
}

impl IntrParams {
    pub fn value(&self) -> u8 {
        self.into_bytes()[0]
    }
}

/// The result of mapping a requested holdoff onto the hardware tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub intr_params: IntrParams,
    /// Only set if a packet count was requested.
    pub counter_idx: Option<u8>,
}

/// Returns the index of the table entry closest to `target`.
///
/// On ties the lowest index wins.
pub fn closest(table: &[u32], target: u32) -> usize {
    let mut best = 0;
    let mut best_delta = u32::MAX;
    for (i, value) in table.iter().enumerate() {
        let delta = value.abs_diff(target);
        if delta < best_delta {
            best_delta = delta;
            best = i;
        }
    }
    best
}

/// Maps a holdoff time in microseconds and a packet count onto the tables.
///
/// `0` disables the respective mechanism. If both are disabled, the queue
/// interrupts on every completion.
pub fn select(tables: &CoalescingTables, us: u32, count: u32) -> Selection {
    let counter_idx = if count != 0 {
        Some(closest(&tables.counter, count) as u8)
    } else {
        None
    };
    let timer_idx = if us == 0 {
        TIMER_RESTART_COUNTER
    } else {
        closest(&tables.timer_us, us) as u8
    };
    let intr_params = if us == 0 && count == 0 {
        IntrParams::new().with_timer_idx(TIMER_UPDATE_CIDX)
    } else {
        IntrParams::new()
            .with_timer_idx(timer_idx)
            .with_cnt_en(count > 0)
    };
    Selection { intr_params, counter_idx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_prefers_minimal_distance() {
        let table = [1, 5, 10, 50, 100];
        assert_eq!(closest(&table, 7), 1);
        assert_eq!(closest(&table, 0), 0);
        assert_eq!(closest(&table, 60), 3);
        assert_eq!(closest(&table, 1000), 4);
    }

    #[test]
    fn closest_breaks_ties_towards_lowest_index() {
        // 3 is two away from both 1 and 5
        assert_eq!(closest(&[1, 5, 10], 3), 0);
        assert_eq!(closest(&[8, 8, 8], 8), 0);
        assert_eq!(closest(&[10, 2, 6], 4), 1);
    }

    #[test]
    fn select_without_coalescing() {
        let tables = CoalescingTables::default();
        let selection = select(&tables, 0, 0);
        assert_eq!(selection.intr_params.timer_idx(), TIMER_UPDATE_CIDX);
        assert!(!selection.intr_params.cnt_en());
        assert_eq!(selection.counter_idx, None);
        assert_eq!(selection.intr_params.value(), 7 << 1);

        let odd = CoalescingTables { timer_us: [0; SGE_NTIMERS], counter: [0; SGE_NCOUNTERS] };
        assert_eq!(select(&odd, 0, 0), selection);
    }

    #[test]
    fn select_counter_only() {
        let tables = CoalescingTables::default();
        let selection = select(&tables, 0, 10);
        assert_eq!(selection.intr_params.timer_idx(), TIMER_RESTART_COUNTER);
        assert!(selection.intr_params.cnt_en());
        assert_eq!(selection.counter_idx, Some(1));
        assert_eq!(selection.intr_params.value(), (6 << 1) | 1);
    }

    #[test]
    fn select_timer_and_counter() {
        let tables = CoalescingTables::default();
        let selection = select(&tables, 5, 32);
        assert_eq!(selection.intr_params.timer_idx(), 1);
        assert!(selection.intr_params.cnt_en());
        assert_eq!(selection.counter_idx, Some(3));

        let timer_only = select(&tables, 120, 0);
        assert_eq!(timer_only.intr_params.timer_idx(), 4);
        assert!(!timer_only.intr_params.cnt_en());
        assert_eq!(timer_only.counter_idx, None);
    }
}
