//! This module consists of functions that work close to the hardware of the adapter.

use core::fmt;

use strum_macros::{Display, FromRepr};
use volatile::Volatile;

/// Access to the adapter's register BAR and its PCI configuration space.
pub trait RegisterAccess {
    fn read(&self, addr: u32) -> u32;

    fn write(&mut self, addr: u32, value: u32);

    /// Replace the bits in `mask` with `value`.
    fn set_field(&mut self, addr: u32, mask: u32, value: u32) {
        let old = self.read(addr);
        self.write(addr, (old & !mask) | value);
    }

    /// Offset of a capability in the PCI configuration space.
    fn find_capability(&self, _id: u8) -> Option<u16> {
        None
    }

    fn read_config_word(&self, _offset: u16) -> u16 {
        0xffff
    }

    fn write_config_word(&mut self, _offset: u16, _value: u16) {}

    /// Wait before polling a register again.
    fn delay_us(&self, _us: u32) {}
}

impl<R: RegisterAccess + ?Sized> RegisterAccess for &mut R {
    fn read(&self, addr: u32) -> u32 {
        (**self).read(addr)
    }

    fn write(&mut self, addr: u32, value: u32) {
        (**self).write(addr, value)
    }

    fn set_field(&mut self, addr: u32, mask: u32, value: u32) {
        (**self).set_field(addr, mask, value)
    }

    fn find_capability(&self, id: u8) -> Option<u16> {
        (**self).find_capability(id)
    }

    fn read_config_word(&self, offset: u16) -> u16 {
        (**self).read_config_word(offset)
    }

    fn write_config_word(&mut self, offset: u16, value: u16) {
        (**self).write_config_word(offset, value)
    }

    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}

/// Registers accessed through a mapped BAR.
pub struct MmioRegisters<'a> {
    regs: &'a mut [Volatile<u32>],
}

impl<'a> MmioRegisters<'a> {
    pub fn new(regs: &'a mut [Volatile<u32>]) -> Self {
        Self { regs }
    }
}

impl RegisterAccess for MmioRegisters<'_> {
    fn read(&self, addr: u32) -> u32 {
        match self.regs.get(addr as usize / 4) {
            Some(reg) => reg.read(),
            None => {
                warn!("read from register {addr:#x} outside of the BAR");
                u32::MAX
            }
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        match self.regs.get_mut(addr as usize / 4) {
            Some(reg) => reg.write(value),
            None => warn!("write to register {addr:#x} outside of the BAR"),
        }
    }
}

impl fmt::Debug for MmioRegisters<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f
            .debug_struct("MmioRegisters")
            .field("size", &(self.regs.len() * 4))
            .finish()
    }
}

/// Vendor ID for Chelsio
pub const CHELSIO_VEND: u16 = 0x1425;

/// The adapter generation.
#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Chip {
    T4 = 4,
    T5 = 5,
    T6 = 6,
}

impl Chip {
    /// The generation is encoded in the upper nibble of the PCI device id.
    pub fn from_device_id(device_id: u16) -> Option<Self> {
        Self::from_repr((device_id >> 12) as u8)
    }

    /// Which physical function the register accesses come from.
    pub(crate) fn source_pf(self, whoami: u32) -> u8 {
        match self {
            Self::T4 | Self::T5 => ((whoami >> 8) & 0x7) as u8,
            Self::T6 => ((whoami >> 9) & 0x7) as u8,
        }
    }
}

pub(crate) const PL_WHOAMI: u32 = 0x19400;
pub(crate) const PL_INT_MAP0: u32 = 0x19414;
pub(crate) const PL_RST: u32 = 0x19428;
pub(crate) const PIORST: u32 = 1 << 0;
pub(crate) const PIORSTMODE: u32 = 1 << 1;

pub(crate) const MYPF_BASE: u32 = 0x1b000;
pub(crate) const SGE_PF_GTS: u32 = MYPF_BASE + 0x4;
const PL_PF_INT_ENABLE: u32 = MYPF_BASE + 0x3c4;
const PF_INTR_MASK: u32 = (1 << 3) | (1 << 1);

pub(crate) const SGE_CONTROL: u32 = 0x1008;
pub(crate) const SGE_HOST_PAGE_SIZE: u32 = 0x100c;
pub(crate) const SGE_EGRESS_QUEUES_PER_PAGE_PF: u32 = 0x1010;
pub(crate) const SGE_FL_BUFFER_SIZE0: u32 = 0x1044;
pub(crate) const SGE_FLM_CFG: u32 = 0x1090;
pub(crate) const SGE_INGRESS_RX_THRESHOLD: u32 = 0x10a0;
pub(crate) const SGE_TIMER_VALUE_0_AND_1: u32 = 0x10b8;
pub(crate) const SGE_TIMER_VALUE_2_AND_3: u32 = 0x10bc;
pub(crate) const SGE_TIMER_VALUE_4_AND_5: u32 = 0x10c0;
pub(crate) const SGE_STAT_CFG: u32 = 0x10ec;
pub(crate) const SGE_CONTROL2: u32 = 0x1124;

pub(crate) const PKTSHIFT_SHIFT: u32 = 10;
pub(crate) const PKTSHIFT_MASK: u32 = 0x7 << PKTSHIFT_SHIFT;
pub(crate) const INGPADBOUNDARY_SHIFT: u32 = 4;
pub(crate) const INGPADBOUNDARY_MASK: u32 = 0x7 << INGPADBOUNDARY_SHIFT;

pub(crate) const PCIE_MEM_ACCESS_BASE_WIN: u32 = 0x3068;
pub(crate) const PCIE_CFG2: u32 = 0x3018;
pub(crate) const PCIE_FW: u32 = 0x30b8;
pub(crate) const PCIE_FW_ERR: u32 = 1 << 31;
pub(crate) const PCIE_FW_INIT: u32 = 1 << 30;
pub(crate) const PCIE_FW_HALT: u32 = 1 << 29;
pub(crate) const PCIE_CMD_CFG: u32 = 0x5980;

pub(crate) const CIM_BOOT_CFG: u32 = 0x7b00;
pub(crate) const UPCRST: u32 = 1 << 0;

pub(crate) const TP_MTU_TABLE: u32 = 0x7e18;
pub(crate) const TP_PIO_ADDR: u32 = 0x7e40;
pub(crate) const TP_PIO_DATA: u32 = 0x7e44;
/// indirect
pub(crate) const TP_INGRESS_CONFIG: u32 = 0x141;
/// indirect
pub(crate) const TP_VLAN_PRI_MAP: u32 = 0x148;
pub(crate) const CSUM_HAS_PSEUDO_HDR: u32 = 1 << 10;
pub(crate) const RM_OVLAN: u32 = 1 << 9;

pub(crate) const LE_DB_CONFIG: u32 = 0x19c04;
pub(crate) const LE_DB_HASHEN: u32 = 1 << 20;
pub(crate) const LE_DB_TID_HASHBASE: u32 = 0x19df8;

const MPS_PORT_BASE: u32 = 0x30000;
const MPS_PORT_STRIDE: u32 = 0x2000;
const MPS_PORT_RX_CTL: u32 = 0x100;
const MPS_PORT_RX_OVLAN: [u32; 3] = [0x104, 0x10c, 0x114];
const MPS_PORT_RX_IVLAN: u32 = 0x11c;
const OVLAN_EN: [u32; 3] = [1 << 0, 1 << 1, 1 << 2];
const IVLAN_EN: u32 = 1 << 3;
const OVLAN_MASK_FIELD: u32 = 0xffff << 16;
const ETYPE_FIELD: u32 = 0xffff;

pub(crate) fn mps_port_reg(port: u8, reg: u32) -> u32 {
    MPS_PORT_BASE + u32::from(port) * MPS_PORT_STRIDE + reg
}

/// Number of entries in the MTU table.
pub const NMTUS: usize = 16;

const MEMWIN_NIC: u32 = 0;
const MEMWIN0_BASE: u32 = 0x1b800;
const MEMWIN0_APERTURE: u32 = 2048;
const WINDOW_SHIFT: u32 = 10;
const BIR_SHIFT: u32 = 8;

/// Set up memory window 0 for accessing adapter memory.
pub(crate) fn setup_memwin<R: RegisterAccess + ?Sized>(regs: &mut R) {
    let reg = PCIE_MEM_ACCESS_BASE_WIN + 8 * MEMWIN_NIC;
    regs.write(
        reg,
        MEMWIN0_BASE | (0 << BIR_SHIFT) | (MEMWIN0_APERTURE.ilog2() - WINDOW_SHIFT),
    );
    // flush
    regs.read(reg);
}

pub(crate) fn tp_read_indirect<R: RegisterAccess + ?Sized>(regs: &mut R, addr: u32) -> u32 {
    regs.write(TP_PIO_ADDR, addr);
    regs.read(TP_PIO_DATA)
}

pub(crate) fn tp_write_bits_indirect<R: RegisterAccess + ?Sized>(
    regs: &mut R, addr: u32, mask: u32, value: u32,
) {
    regs.write(TP_PIO_ADDR, addr);
    let old = regs.read(TP_PIO_DATA);
    regs.write(TP_PIO_DATA, (old & !mask) | value);
}

const HOST_PAGE_SHIFT: u32 = 12;
const CACHE_LINE_SHIFT: u32 = 6;

/// Adjust the SGE to the host: page size, DMA offset, free list credits,
/// ingress threshold, IDMA arbitration and checksum handling.
pub(crate) fn apply_host_tweaks<R: RegisterAccess + ?Sized>(regs: &mut R) {
    // every PF gets the same host page size
    let page = HOST_PAGE_SHIFT - 10;
    let host_page_size = (0..8).fold(0, |acc, pf| acc | (page << (4 * pf)));
    regs.write(SGE_HOST_PAGE_SIZE, host_page_size);
    regs.set_field(
        SGE_CONTROL,
        INGPADBOUNDARY_MASK,
        (CACHE_LINE_SHIFT - 5) << INGPADBOUNDARY_SHIFT,
    );

    // deliver ingress packets at offset zero
    regs.set_field(SGE_CONTROL, PKTSHIFT_MASK, 0);

    const CREDITCNT_SHIFT: u32 = 4;
    const CREDITCNTPACKING_SHIFT: u32 = 2;
    regs.set_field(
        SGE_FLM_CFG,
        (0x3 << CREDITCNT_SHIFT) | (0x3 << CREDITCNTPACKING_SHIFT),
        (3 << CREDITCNT_SHIFT) | (1 << CREDITCNTPACKING_SHIFT),
    );

    regs.set_field(SGE_INGRESS_RX_THRESHOLD, 0x3f, 32);

    const IDMAARBROUNDROBIN: u32 = 1 << 19;
    regs.set_field(SGE_CONTROL2, IDMAARBROUNDROBIN, IDMAARBROUNDROBIN);

    tp_write_bits_indirect(regs, TP_INGRESS_CONFIG, CSUM_HAS_PSEUDO_HDR, 0);
}

const MTUINDEX_SHIFT: u32 = 24;
const MTUWIDTH_SHIFT: u32 = 16;
const MTUVALUE_MASK: u32 = 0x3fff;

pub(crate) fn read_mtu_table<R: RegisterAccess + ?Sized>(regs: &mut R) -> [u16; NMTUS] {
    let mut mtus = [0; NMTUS];
    for (i, mtu) in mtus.iter_mut().enumerate() {
        regs.write(TP_MTU_TABLE, (0xff << MTUINDEX_SHIFT) | i as u32);
        *mtu = (regs.read(TP_MTU_TABLE) & MTUVALUE_MASK) as u16;
    }
    mtus
}

pub(crate) fn load_mtu_table<R: RegisterAccess + ?Sized>(regs: &mut R, mtus: &[u16; NMTUS]) {
    for (i, &mtu) in mtus.iter().enumerate() {
        let width = u32::from(mtu).max(1).ilog2();
        regs.write(
            TP_MTU_TABLE,
            ((i as u32) << MTUINDEX_SHIFT) | (width << MTUWIDTH_SHIFT) | u32::from(mtu),
        );
    }
}

const PCI_CAP_ID_EXP: u8 = 0x10;
const PCI_EXP_DEVCTL: u16 = 8;
const PCI_EXP_DEVCTL_EXT_TAG: u16 = 0x100;

/// Allow 8-bit PCIe tags so more reads can be in flight.
pub(crate) fn configure_pcie_ext_tag<R: RegisterAccess + ?Sized>(regs: &mut R, chip: Chip) {
    let Some(pos) = regs.find_capability(PCI_CAP_ID_EXP) else {
        return;
    };
    let v = regs.read_config_word(pos + PCI_EXP_DEVCTL);
    regs.write_config_word(pos + PCI_EXP_DEVCTL, v | PCI_EXP_DEVCTL_EXT_TAG);
    if chip == Chip::T6 {
        regs.set_field(PCIE_CFG2, 0xf << 4, 7 << 4);
        regs.set_field(PCIE_CMD_CFG, 0xff << 24, 8 << 24);
    } else {
        regs.set_field(PCIE_CFG2, 0x3, 3);
        regs.set_field(PCIE_CMD_CFG, 0x3f << 17, 8 << 17);
    }
}

/// Classify 802.1ad, QinQ and 802.1Q tags on every port.
///
/// Unless `keep_ovlan` is set, the outer tag is stripped.
pub(crate) fn configure_vlan_types<R: RegisterAccess + ?Sized>(
    regs: &mut R, nports: u8, keep_ovlan: bool,
) {
    const OVLAN_TYPES: [u32; 3] = [0x88a8, 0x9100, 0x8100];
    for port in 0..nports {
        for (reg, etype) in MPS_PORT_RX_OVLAN.iter().zip(OVLAN_TYPES) {
            regs.set_field(
                mps_port_reg(port, *reg),
                OVLAN_MASK_FIELD | ETYPE_FIELD,
                OVLAN_MASK_FIELD | etype,
            );
        }
        regs.set_field(mps_port_reg(port, MPS_PORT_RX_IVLAN), ETYPE_FIELD, 0x8100);
        let enable = OVLAN_EN[0] | OVLAN_EN[1] | OVLAN_EN[2] | IVLAN_EN;
        regs.set_field(mps_port_reg(port, MPS_PORT_RX_CTL), enable, enable);
    }
    if keep_ovlan {
        tp_write_bits_indirect(regs, TP_INGRESS_CONFIG, RM_OVLAN, 0);
    }
}

pub(crate) fn enable_interrupts<R: RegisterAccess + ?Sized>(regs: &mut R, pf: u8) {
    regs.write(PL_PF_INT_ENABLE, PF_INTR_MASK);
    regs.set_field(PL_INT_MAP0, 0, 1 << pf);
}

pub(crate) fn disable_interrupts<R: RegisterAccess + ?Sized>(regs: &mut R, pf: u8) {
    regs.write(PL_PF_INT_ENABLE, 0);
    regs.set_field(PL_INT_MAP0, 1 << pf, 0);
}

/// The first TID of the hash region, if hashing is enabled in the lookup engine.
pub(crate) fn read_hash_base<R: RegisterAccess + ?Sized>(regs: &R) -> Option<u32> {
    if regs.read(LE_DB_CONFIG) & LE_DB_HASHEN != 0 {
        Some(regs.read(LE_DB_TID_HASHBASE) / 4)
    } else {
        None
    }
}

/// How many egress queues share one doorbell page for `pf`.
pub(crate) fn egress_queues_per_page<R: RegisterAccess + ?Sized>(regs: &R, pf: u8) -> u32 {
    let shift = 4 * u32::from(pf);
    1 << ((regs.read(SGE_EGRESS_QUEUES_PER_PAGE_PF) >> shift) & 0xf)
}

/// Count the statistics of all queues in the SGE statistics registers.
pub(crate) fn set_stat_source<R: RegisterAccess + ?Sized>(regs: &mut R) {
    const STATSOURCE_T5_SHIFT: u32 = 9;
    const STATMODE_SHIFT: u32 = 2;
    regs.write(SGE_STAT_CFG, (7 << STATSOURCE_T5_SHIFT) | (0 << STATMODE_SHIFT));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegisters;

    #[test]
    fn chip_from_device_id() {
        assert_eq!(Chip::from_device_id(0x5401), Some(Chip::T5));
        assert_eq!(Chip::from_device_id(0x6407), Some(Chip::T6));
        assert_eq!(Chip::from_device_id(0x4001), Some(Chip::T4));
        assert_eq!(Chip::from_device_id(0x7001), None);
    }

    #[test]
    fn source_pf() {
        assert_eq!(Chip::T5.source_pf(4 << 8), 4);
        assert_eq!(Chip::T6.source_pf(4 << 9), 4);
        assert_eq!(Chip::T6.source_pf(4 << 8), 2);
    }

    #[test]
    fn set_field_keeps_other_bits() {
        let mut regs = FakeRegisters::new();
        regs.write(SGE_CONTROL, 0xffff_ffff);
        regs.set_field(SGE_CONTROL, PKTSHIFT_MASK, 2 << PKTSHIFT_SHIFT);
        assert_eq!(regs.read(SGE_CONTROL), !PKTSHIFT_MASK | (2 << PKTSHIFT_SHIFT));
    }

    #[test]
    fn host_tweaks() {
        let mut regs = FakeRegisters::new();
        regs.write(SGE_CONTROL, 2 << PKTSHIFT_SHIFT);
        regs.set_tp_indirect(TP_INGRESS_CONFIG, CSUM_HAS_PSEUDO_HDR | 1);
        apply_host_tweaks(&mut regs);
        assert_eq!(regs.read(SGE_CONTROL) & PKTSHIFT_MASK, 0);
        assert_eq!(regs.read(SGE_INGRESS_RX_THRESHOLD) & 0x3f, 32);
        assert_eq!(regs.read(SGE_HOST_PAGE_SIZE), 0x2222_2222);
        assert_eq!(tp_read_indirect(&mut regs, TP_INGRESS_CONFIG), 1);
    }

    #[test]
    fn mtu_table_round_trip() {
        let mut regs = FakeRegisters::new();
        let mut mtus = read_mtu_table(&mut regs);
        assert_eq!(mtus[7], 1492);
        mtus[7] = 1488;
        load_mtu_table(&mut regs, &mtus);
        assert_eq!(read_mtu_table(&mut regs), mtus);
    }

    #[test]
    fn pcie_ext_tag() {
        let mut regs = FakeRegisters::new();
        configure_pcie_ext_tag(&mut regs, Chip::T5);
        // no capability, nothing touched
        assert_eq!(regs.read(PCIE_CFG2), 0);

        regs.set_capability(PCI_CAP_ID_EXP, 0x40);
        configure_pcie_ext_tag(&mut regs, Chip::T6);
        assert_eq!(regs.read_config_word(0x40 + PCI_EXP_DEVCTL) & PCI_EXP_DEVCTL_EXT_TAG, PCI_EXP_DEVCTL_EXT_TAG);
        assert_eq!(regs.read(PCIE_CFG2), 7 << 4);
    }

    #[test]
    fn vlan_types() {
        let mut regs = FakeRegisters::new();
        regs.set_tp_indirect(TP_INGRESS_CONFIG, RM_OVLAN);
        configure_vlan_types(&mut regs, 2, false);
        assert_eq!(regs.read(mps_port_reg(1, MPS_PORT_RX_OVLAN[0])) & ETYPE_FIELD, 0x88a8);
        assert_eq!(regs.read(mps_port_reg(0, MPS_PORT_RX_IVLAN)), 0x8100);
        assert_eq!(tp_read_indirect(&mut regs, TP_INGRESS_CONFIG), RM_OVLAN);
        configure_vlan_types(&mut regs, 2, true);
        assert_eq!(tp_read_indirect(&mut regs, TP_INGRESS_CONFIG), 0);
    }

    #[test]
    fn hash_base() {
        let mut regs = FakeRegisters::new();
        regs.write(LE_DB_TID_HASHBASE, 4 * 80);
        assert_eq!(read_hash_base(&regs), None);
        regs.write(LE_DB_CONFIG, LE_DB_HASHEN);
        assert_eq!(read_hash_base(&regs), Some(80));
    }
}
