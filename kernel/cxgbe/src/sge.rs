//! The parts of the scatter-gather engine the control plane deals with.
//!
//! Queues are created and serviced elsewhere; here we only keep what is
//! needed to plan them, arm their interrupts and tune their holdoff.

use alloc::vec::Vec;

use crate::{
    cmd::{CommandError, CommandInterface, DmaqParam, Mailbox, Param},
    coalesce::{select, CoalescingTables, IntrParams, SGE_NCOUNTERS, SGE_NTIMERS},
    device::{
        egress_queues_per_page, RegisterAccess, INGPADBOUNDARY_MASK, INGPADBOUNDARY_SHIFT,
        PKTSHIFT_MASK, PKTSHIFT_SHIFT, SGE_CONTROL, SGE_FL_BUFFER_SIZE0,
        SGE_INGRESS_RX_THRESHOLD, SGE_PF_GTS, SGE_TIMER_VALUE_0_AND_1,
        SGE_TIMER_VALUE_2_AND_3, SGE_TIMER_VALUE_4_AND_5,
    },
};

const SGE_INGRESS_QUEUES_PER_PAGE_PF: u32 = 0x1014;
const SEINTARM_SHIFT: u32 = 12;
const INGRESSQID_SHIFT: u32 = 16;

/// How the SGE has been set up, either by us or by whoever initialized the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgeParams {
    pub tables: CoalescingTables,
    /// padding in front of ingress packets
    pub pktshift: u32,
    /// free list buffer alignment in bytes
    pub fl_align: u32,
    pub fl_buffer_size: u32,
    /// egress queues per doorbell page
    pub eq_qpp: u32,
    /// ingress queues per doorbell page
    pub iq_qpp: u32,
}

fn core_ticks_to_us(ticks: u32, cclk_khz: u32) -> u32 {
    ((u64::from(ticks) * 1000 + u64::from(cclk_khz) / 2) / u64::from(cclk_khz)) as u32
}

impl SgeParams {
    /// Read the SGE configuration.
    ///
    /// The holdoff timers are kept in core clock ticks by the hardware, so
    /// the clock (in kHz) has to be known already.
    pub(crate) fn read<R: RegisterAccess + ?Sized>(regs: &R, cclk_khz: u32) -> Result<Self, &'static str> {
        if cclk_khz == 0 {
            return Err("core clock is unknown");
        }
        let mut ticks = [0; SGE_NTIMERS];
        for (pair, reg) in [SGE_TIMER_VALUE_0_AND_1, SGE_TIMER_VALUE_2_AND_3, SGE_TIMER_VALUE_4_AND_5]
            .into_iter()
            .enumerate()
        {
            let v = regs.read(reg);
            ticks[2 * pair] = v >> 16;
            ticks[2 * pair + 1] = v & 0xffff;
        }
        let mut timer_us = [0; SGE_NTIMERS];
        for (us, ticks) in timer_us.iter_mut().zip(ticks) {
            *us = core_ticks_to_us(ticks, cclk_khz);
        }

        let v = regs.read(SGE_INGRESS_RX_THRESHOLD);
        let mut counter = [0; SGE_NCOUNTERS];
        for (i, count) in counter.iter_mut().enumerate() {
            *count = (v >> (24 - 8 * i)) & 0x3f;
        }

        let control = regs.read(SGE_CONTROL);
        let params = Self {
            tables: CoalescingTables { timer_us, counter },
            pktshift: (control & PKTSHIFT_MASK) >> PKTSHIFT_SHIFT,
            fl_align: 1 << (((control & INGPADBOUNDARY_MASK) >> INGPADBOUNDARY_SHIFT) + 5),
            fl_buffer_size: regs.read(SGE_FL_BUFFER_SIZE0),
            eq_qpp: 0,
            iq_qpp: 0,
        };
        trace!("SGE parameters: {params:?}");
        Ok(params)
    }

    /// Pick up the doorbell layout of our function.
    pub(crate) fn read_queues_per_page<R: RegisterAccess + ?Sized>(&mut self, regs: &R, pf: u8) {
        self.eq_qpp = egress_queues_per_page(regs, pf);
        let shift = 4 * u32::from(pf);
        self.iq_qpp = 1 << ((regs.read(SGE_INGRESS_QUEUES_PER_PAGE_PF) >> shift) & 0xf);
    }
}

/// A response queue as far as interrupt holdoff is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseQueue {
    /// The context id, once the queue has been created in hardware.
    pub(crate) cntxt_id: Option<u16>,
    /// The absolute id used in RSS tables.
    pub(crate) abs_id: u16,
    pub(crate) intr_params: IntrParams,
    pub(crate) pktcnt_idx: u8,
    pub(crate) size: u16,
    pub(crate) iqe_len: u16,
}

impl ResponseQueue {
    /// Describe a queue that has not been created yet.
    pub(crate) fn new(tables: &CoalescingTables, us: u32, count: u32, size: u16, iqe_len: u16) -> Self {
        let selection = select(tables, us, count);
        Self {
            cntxt_id: None,
            abs_id: 0,
            intr_params: selection.intr_params,
            pktcnt_idx: selection.counter_idx.unwrap_or(0),
            size,
            iqe_len,
        }
    }

    pub fn intr_params(&self) -> IntrParams {
        self.intr_params
    }

    pub fn pktcnt_idx(&self) -> u8 {
        self.pktcnt_idx
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn iqe_len(&self) -> u16 {
        self.iqe_len
    }

    pub fn cntxt_id(&self) -> Option<u16> {
        self.cntxt_id
    }

    pub fn abs_id(&self) -> u16 {
        self.abs_id
    }

    /// Change the holdoff of the queue.
    ///
    /// If the queue already exists and needs a different packet count
    /// threshold, the firmware is told first. Should that fail, the queue
    /// is left as it was.
    pub(crate) fn set_intr_params<M: Mailbox>(
        &mut self, fw: &mut CommandInterface<M>, tables: &CoalescingTables, us: u32, count: u32,
    ) -> Result<(), CommandError> {
        let selection = select(tables, us, count);
        if let Some(new_idx) = selection.counter_idx {
            if let Some(cntxt_id) = self.cntxt_id {
                if new_idx != self.pktcnt_idx {
                    fw.set_params(&[(
                        Param::Dmaq(DmaqParam::IqIntCntThresh, cntxt_id),
                        u32::from(new_idx),
                    )])?;
                }
            }
            self.pktcnt_idx = new_idx;
        }
        self.intr_params = selection.intr_params;
        Ok(())
    }

    /// Start the holdoff timer and enable interrupts for the queue.
    pub(crate) fn enable_rx<R: RegisterAccess + ?Sized>(&self, regs: &mut R) {
        let Some(cntxt_id) = self.cntxt_id else {
            warn!("not arming interrupts of a response queue that doesn't exist");
            return;
        };
        regs.write(
            SGE_PF_GTS,
            (u32::from(self.intr_params.value()) << SEINTARM_SHIFT)
                | (u32::from(cntxt_id) << INGRESSQID_SHIFT),
        );
    }
}

/// A control queue that carries messages to the hardware.
///
/// Used from the fast path, so it has to be shareable.
pub trait ControlChannel: Send + Sync {
    /// Get a zeroed message buffer of `len` bytes, if there is one.
    fn allocate(&self, len: usize) -> Option<Vec<u8>>;

    fn transmit(&self, message: Vec<u8>);
}
