//! Physical ports and the virtual interfaces we use to talk through them.

use alloc::{string::String, vec::Vec};
use core::fmt;

use bitflags::bitflags;
use byteorder::BigEndian;
use chelsio_ethernet::{EthDevConfig, LinkSpeeds, LinkStatus, PortHandle, RssHashFunctions};
use modular_bitfield_msb::{bitfield, specifiers::{B24, B3, B5}};
use strum_macros::{Display, EnumCount, FromRepr};
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

use crate::cmd::{len16, op_header, pfn_vfn, CmdFlags, CommandError, CommandInterface, Mailbox, Opcode};

#[repr(u8)]
#[derive(Debug, Display, FromRepr, EnumCount, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    #[strum(serialize = "Fiber_XFI")]
    FiberXfi = 0,
    #[strum(serialize = "Fiber_XAUI")]
    FiberXaui = 1,
    #[strum(serialize = "BT_SGMII")]
    BtSgmii = 2,
    #[strum(serialize = "BT_XFI")]
    BtXfi = 3,
    #[strum(serialize = "BT_XAUI")]
    BtXaui = 4,
    #[strum(serialize = "KX4")]
    Kx4 = 5,
    #[strum(serialize = "CX4")]
    Cx4 = 6,
    #[strum(serialize = "KX")]
    Kx = 7,
    #[strum(serialize = "KR")]
    Kr = 8,
    #[strum(serialize = "SFP")]
    Sfp = 9,
    #[strum(serialize = "BP_AP")]
    BpAp = 10,
    #[strum(serialize = "BP4_AP")]
    Bp4Ap = 11,
    #[strum(serialize = "QSFP_10G")]
    Qsfp10G = 12,
    #[strum(serialize = "QSA")]
    Qsa = 13,
    #[strum(serialize = "QSFP")]
    Qsfp = 14,
    #[strum(serialize = "BP40_BA")]
    Bp40Ba = 15,
    #[strum(serialize = "KR4_100G")]
    Kr4_100G = 16,
    #[strum(serialize = "CR4_QSFP")]
    Cr4Qsfp = 17,
    #[strum(serialize = "CR_QSFP")]
    CrQsfp = 18,
    #[strum(serialize = "CR2_QSFP")]
    Cr2Qsfp = 19,
    #[strum(serialize = "SFP28")]
    Sfp28 = 20,
    #[strum(serialize = "KR_SFP28")]
    KrSfp28 = 21,
    #[strum(serialize = "KR_XLAUI")]
    KrXlaui = 22,
}

/// What is plugged into a port's cage.
#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    #[strum(serialize = "n/a")]
    Na = 0,
    #[strum(serialize = "LR")]
    Lr = 1,
    #[strum(serialize = "SR")]
    Sr = 2,
    #[strum(serialize = "ER")]
    Er = 3,
    #[strum(serialize = "passive DA")]
    TwinaxPassive = 4,
    #[strum(serialize = "active DA")]
    TwinaxActive = 5,
    #[strum(serialize = "LRM")]
    Lrm = 6,
    Error = 0x1c,
    Unknown = 0x1d,
    NotSupported = 0x1e,
    #[strum(serialize = "none")]
    NotPresent = 0x1f,
}

bitflags! {
    /// Port capabilities as the firmware reports and accepts them.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCapabilities: u32 {
        const SPEED_100M = 1 << 0;
        const SPEED_1G = 1 << 1;
        const SPEED_10G = 1 << 2;
        const SPEED_25G = 1 << 3;
        const SPEED_40G = 1 << 4;
        const SPEED_50G = 1 << 5;
        const SPEED_100G = 1 << 6;
        const SPEED_200G = 1 << 7;
        const SPEED_400G = 1 << 8;
        const FC_RX = 1 << 16;
        const FC_TX = 1 << 17;
        const ANEG = 1 << 18;

        /// everything faster than 1G
        const HIGH_SPEEDS = Self::SPEED_10G.bits() | Self::SPEED_25G.bits()
            | Self::SPEED_40G.bits() | Self::SPEED_50G.bits() | Self::SPEED_100G.bits()
            | Self::SPEED_200G.bits() | Self::SPEED_400G.bits();
        const SPEEDS = Self::SPEED_100M.bits() | Self::SPEED_1G.bits() | Self::HIGH_SPEEDS.bits();
    }
}

/// How the speeds of a port type are derived from its capabilities.
struct SpeedRule {
    /// taken over if the firmware reports them
    reported: PortCapabilities,
    /// the port type always has these
    fixed: PortCapabilities,
}

const NO_SPEEDS: PortCapabilities = PortCapabilities::empty();
const SPEEDS_1G_10G: PortCapabilities = PortCapabilities::SPEED_1G.union(PortCapabilities::SPEED_10G);

impl PortType {
    fn speed_rule(self) -> SpeedRule {
        use PortCapabilities as C;
        let (reported, fixed) = match self {
            Self::BtSgmii | Self::BtXfi | Self::BtXaui => (SPEEDS_1G_10G.union(C::SPEED_100M), NO_SPEEDS),
            Self::Kx4 | Self::Kx | Self::FiberXfi | Self::FiberXaui | Self::Sfp | Self::Qsfp10G
                | Self::Qsa => (SPEEDS_1G_10G, NO_SPEEDS),
            Self::Kr => (NO_SPEEDS, C::SPEED_10G),
            Self::BpAp | Self::Bp4Ap => (NO_SPEEDS, SPEEDS_1G_10G),
            Self::Bp40Ba | Self::Qsfp => (NO_SPEEDS, C::SPEED_40G),
            Self::CrQsfp | Self::Sfp28 | Self::KrSfp28 => (SPEEDS_1G_10G.union(C::SPEED_25G), NO_SPEEDS),
            Self::Cr2Qsfp => (NO_SPEEDS, C::SPEED_50G),
            Self::Kr4_100G | Self::Cr4Qsfp => (
                C::SPEED_25G | C::SPEED_40G | C::SPEED_50G | C::SPEED_100G,
                NO_SPEEDS,
            ),
            Self::Cx4 | Self::KrXlaui => (NO_SPEEDS, NO_SPEEDS),
        };
        SpeedRule { reported, fixed }
    }
}

const CAPS_TO_SPEEDS: [(PortCapabilities, LinkSpeeds, &str); 7] = [
    (PortCapabilities::SPEED_100M, LinkSpeeds::SPEED_100M, "100M"),
    (PortCapabilities::SPEED_1G, LinkSpeeds::SPEED_1G, "1G"),
    (PortCapabilities::SPEED_10G, LinkSpeeds::SPEED_10G, "10G"),
    (PortCapabilities::SPEED_25G, LinkSpeeds::SPEED_25G, "25G"),
    (PortCapabilities::SPEED_40G, LinkSpeeds::SPEED_40G, "40G"),
    (PortCapabilities::SPEED_50G, LinkSpeeds::SPEED_50G, "50G"),
    (PortCapabilities::SPEED_100G, LinkSpeeds::SPEED_100G, "100G"),
];

/// The speeds a port of type `port_type` with capabilities `pcaps` supports.
pub fn speed_caps(port_type: Option<PortType>, pcaps: PortCapabilities) -> LinkSpeeds {
    let caps = match port_type {
        Some(port_type) => {
            let rule = port_type.speed_rule();
            (pcaps & rule.reported) | rule.fixed
        }
        None => PortCapabilities::empty(),
    };
    let mut speeds = CAPS_TO_SPEEDS
        .iter()
        .filter(|(cap, ..)| caps.contains(*cap))
        .fold(LinkSpeeds::empty(), |acc, (_, speed, _)| acc | *speed);
    if !pcaps.contains(PortCapabilities::ANEG) {
        speeds |= LinkSpeeds::FIXED;
    }
    speeds
}

/// The link side of a port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkConfig {
    /// what the port is physically capable of
    pub pcaps: PortCapabilities,
    /// what we advertise
    pub acaps: PortCapabilities,
    /// what the link partner advertises
    pub lpacaps: PortCapabilities,
    /// the raw port type, see [`LinkConfig::port_type`]
    pub port_type: u8,
    /// the raw module type, see [`LinkConfig::module_type`]
    pub mod_type: u8,
    pub link_ok: bool,
}

impl LinkConfig {
    pub fn port_type(&self) -> Option<PortType> {
        PortType::from_repr(self.port_type)
    }

    pub fn module_type(&self) -> Option<ModuleType> {
        ModuleType::from_repr(self.mod_type)
    }

    /// The capabilities to ask for when starting the link.
    ///
    /// With autonegotiation we advertise everything we can do, otherwise we
    /// force the highest speed.
    fn requested_caps(&self) -> PortCapabilities {
        let fc = self.pcaps & (PortCapabilities::FC_RX | PortCapabilities::FC_TX);
        if self.pcaps.contains(PortCapabilities::ANEG) {
            (self.acaps & PortCapabilities::SPEEDS) | PortCapabilities::ANEG | fc
        } else {
            let speeds = self.pcaps & PortCapabilities::SPEEDS;
            let top = match speeds.bits() {
                0 => PortCapabilities::empty(),
                bits => PortCapabilities::from_bits_truncate(1 << bits.ilog2()),
            };
            top | fc
        }
    }

    /// Forget about the link after the port went down.
    fn reset(&mut self) {
        self.link_ok = false;
        self.lpacaps = PortCapabilities::empty();
    }
}

/// Log what happened to the module of a port.
pub fn module_changed(port_id: u8, mod_type: u8) {
    match ModuleType::from_repr(mod_type) {
        Some(ModuleType::NotPresent) => info!("Port{port_id}: port module unplugged"),
        Some(ModuleType::NotSupported) => info!("Port{port_id}: unsupported port module inserted"),
        Some(ModuleType::Unknown) => info!("Port{port_id}: unknown port module inserted"),
        Some(ModuleType::Error) => info!("Port{port_id}: transceiver module error"),
        Some(module) if module != ModuleType::Na => info!("Port{port_id}: {module} port module inserted"),
        _ => info!("Port{port_id}: unknown module type {mod_type} inserted"),
    }
}

const ACTION_L1_CFG32: u32 = 0x8;
const ACTION_GET_PORT_INFO32: u32 = 0x9;
const ACTION_SHIFT: u32 = 16;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct PortCommand {
    pub(crate) op_to_portid: U32<BigEndian>,
    pub(crate) action_to_len16: U32<BigEndian>,
    pub(crate) info: [u8; 24],
}

impl PortCommand {
    fn new(port_id: u8, flags: CmdFlags, action: u32) -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.op_to_portid = op_header(Opcode::Port, flags, u32::from(port_id) & 0xf);
        cmd.action_to_len16 = ((action << ACTION_SHIFT) | len16::<Self>()).into();
        cmd
    }

    #[cfg(test)]
    pub(crate) fn port_id(&self) -> u8 {
        (self.op_to_portid.get() & 0xf) as u8
    }

    #[cfg(test)]
    pub(crate) fn action(&self) -> u32 {
        self.action_to_len16.get() >> ACTION_SHIFT
    }

    #[cfg(test)]
    pub(crate) fn is_get_port_info(&self) -> bool {
        self.action() == ACTION_GET_PORT_INFO32
    }

    #[cfg(test)]
    /// The requested capabilities of an L1 configuration.
    pub(crate) fn rcap(&self) -> u32 {
        u32::from_be_bytes([self.info[0], self.info[1], self.info[2], self.info[3]])
    }
}

/// The reply to GET_PORT_INFO32.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PortInfo {
    pub(crate) lstatus: bool,
    pub(crate) linkdnrc: B3,
    pub(crate) dcbxdis: bool,
    pub(crate) mdiocap: bool,
    pub(crate) mdioaddr: B5,
    pub(crate) port_type: u8,
    pub(crate) mod_type: B5,
    pub(crate) cbllen: u8,
    pub(crate) auxlinfo: u8,
    #[skip] __: B24,
    pub(crate) linkattr: u32,
    pub(crate) pcaps: u32,
    pub(crate) acaps: u32,
    pub(crate) lpacaps: u32,
}

const VI_ALLOC: u32 = 1 << 31;
const VI_FREE: u32 = 1 << 30;
const VIID_MASK: u16 = 0xfff;
const PORTID_SHIFT: u8 = 4;
const RSSSIZE_MASK: u16 = 0x7ff;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViCommand {
    pub(crate) op_to_vfn: U32<BigEndian>,
    pub(crate) alloc_to_len16: U32<BigEndian>,
    pub(crate) type_to_viid: U16<BigEndian>,
    pub(crate) mac: [u8; 6],
    pub(crate) portid_pkd: u8,
    pub(crate) nmac: u8,
    pub(crate) nmac0: [u8; 6],
    pub(crate) norss_rsssize: U16<BigEndian>,
    pub(crate) nmac1: [u8; 6],
    pub(crate) idsiiq_pkd: U16<BigEndian>,
    pub(crate) nmac2: [u8; 6],
    pub(crate) idseiq_pkd: U16<BigEndian>,
    pub(crate) nmac3: [u8; 6],
    _reserved: [U64<BigEndian>; 2],
}

impl ViCommand {
    #[cfg(test)]
    pub(crate) fn is_alloc(&self) -> bool {
        self.alloc_to_len16.get() & VI_ALLOC != 0
    }

    pub(crate) fn viid(&self) -> u16 {
        self.type_to_viid.get() & VIID_MASK
    }

    pub(crate) fn set_viid(&mut self, viid: u16) {
        self.type_to_viid = (viid & VIID_MASK).into();
    }

    #[cfg(test)]
    pub(crate) fn port_id(&self) -> u8 {
        self.portid_pkd >> PORTID_SHIFT
    }

    #[cfg(test)]
    pub(crate) fn set_rss_size(&mut self, rss_size: u16) {
        self.norss_rsssize = (rss_size & RSSSIZE_MASK).into();
    }
}

/// The header of commands addressed to a virtual interface.
pub(crate) fn vi_header(opcode: Opcode, flags: CmdFlags, viid: u16) -> U32<BigEndian> {
    op_header(opcode, flags, u32::from(viid & VIID_MASK))
}

#[cfg(test)]
/// The virtual interface a command is addressed to.
pub(crate) fn viid_of(header: U32<BigEndian>) -> u16 {
    (header.get() & u32::from(VIID_MASK)) as u16
}

/// Let the firmware pick a slot for a new exact-match MAC.
pub(crate) const MAC_ADD: u16 = 0x3ff;
const MAC_VALID: u16 = 1 << 15;
const MAC_IDX_MASK: u16 = 0x3ff;
/// entries in the MPS TCAM
const NUM_MPS_CLS_SRAM_L_INSTANCES: u16 = 336;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViMacCommand {
    pub(crate) op_to_viid: U32<BigEndian>,
    pub(crate) freemacs_to_len16: U32<BigEndian>,
    pub(crate) valid_to_idx: U16<BigEndian>,
    pub(crate) macaddr: [u8; 6],
}

impl ViMacCommand {
    pub(crate) fn idx(&self) -> u16 {
        self.valid_to_idx.get() & MAC_IDX_MASK
    }

    pub(crate) fn set_idx(&mut self, idx: u16) {
        self.valid_to_idx = (MAC_VALID | (idx & MAC_IDX_MASK)).into();
    }
}

/// A field of VI_RXMODE set to all ones is left alone by the firmware.
const RXMODE_MTU_SHIFT: u32 = 16;
const RXMODE_PROMISC_SHIFT: u32 = 14;
const RXMODE_ALLMULTI_SHIFT: u32 = 12;
const RXMODE_BROADCAST_SHIFT: u32 = 10;
const RXMODE_VLANEX_SHIFT: u32 = 8;
pub(crate) const RXMODE_MTU_UNCHANGED: u16 = 0xffff;
const RXMODE_FLAG_UNCHANGED: u32 = 0x3;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViRxmodeCommand {
    pub(crate) op_to_viid: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) mtu_to_vlanexen: U32<BigEndian>,
    _reserved: U32<BigEndian>,
}

impl ViRxmodeCommand {
    #[cfg(test)]
    pub(crate) fn mtu(&self) -> u16 {
        (self.mtu_to_vlanexen.get() >> RXMODE_MTU_SHIFT) as u16
    }

    #[cfg(test)]
    pub(crate) fn vlan_extraction(&self) -> u32 {
        (self.mtu_to_vlanexen.get() >> RXMODE_VLANEX_SHIFT) & 0x3
    }
}

const VI_IEN: u32 = 1 << 31;
const VI_EEN: u32 = 1 << 30;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ViEnableCommand {
    pub(crate) op_to_viid: U32<BigEndian>,
    pub(crate) ien_to_len16: U32<BigEndian>,
    pub(crate) blinkdur: U16<BigEndian>,
    _reserved: [u8; 6],
}

impl ViEnableCommand {
    #[cfg(test)]
    /// Whether ingress and egress are enabled.
    pub(crate) fn enables(&self) -> (bool, bool) {
        let v = self.ien_to_len16.get();
        (v & VI_IEN != 0, v & VI_EEN != 0)
    }
}

/// One port of the adapter, as seen by this function.
pub struct Port {
    /// the firmware's port number, also the TX channel
    port_id: u8,
    viid: u16,
    mac: [u8; 6],
    rss_size: u16,
    pub(crate) rss_mode: u32,
    pub(crate) link: LinkConfig,
    pub(crate) link_status: LinkStatus,
    /// our exact-match entry in the MPS TCAM
    xact_addr_filt: Option<u16>,
    pub(crate) handle: Option<PortHandle>,
    pub(crate) dev_config: EthDevConfig,
    pub(crate) rss: Vec<u16>,
    pub(crate) rss_hf: RssHashFunctions,
}

impl Port {
    /// A port that hasn't been initialized with the firmware yet.
    pub(crate) fn new(port_id: u8, handle: Option<PortHandle>) -> Self {
        Self {
            port_id,
            viid: 0,
            mac: [0; 6],
            rss_size: 0,
            rss_mode: 0,
            link: LinkConfig::default(),
            link_status: LinkStatus::Down,
            xact_addr_filt: None,
            handle,
            dev_config: EthDevConfig::default(),
            rss: Vec::new(),
            rss_hf: RssHashFunctions::empty(),
        }
    }

    /// Ask the firmware about the port and allocate a virtual interface on it.
    pub(crate) fn init<M: Mailbox>(&mut self, fw: &mut CommandInterface<M>) -> Result<(), CommandError> {
        trace!("initializing port {}...", self.port_id);
        let cmd = PortCommand::new(self.port_id, CmdFlags::READ, ACTION_GET_PORT_INFO32);
        let reply = fw.execute(Opcode::Port, &cmd)?;
        let info = PortInfo::from_bytes(reply.info);
        self.link = LinkConfig {
            pcaps: PortCapabilities::from_bits_truncate(info.pcaps()),
            acaps: PortCapabilities::from_bits_truncate(info.acaps()),
            lpacaps: PortCapabilities::from_bits_truncate(info.lpacaps()),
            port_type: info.port_type(),
            mod_type: info.mod_type(),
            link_ok: info.lstatus(),
        };

        let mut cmd = ViCommand::new_zeroed();
        cmd.op_to_vfn = op_header(Opcode::Vi, CmdFlags::WRITE | CmdFlags::EXEC, pfn_vfn(fw.pf(), 0));
        cmd.alloc_to_len16 = (VI_ALLOC | len16::<ViCommand>()).into();
        cmd.portid_pkd = self.port_id << PORTID_SHIFT;
        cmd.nmac = 0;
        let reply = fw.execute(Opcode::Vi, &cmd)?;
        self.viid = reply.viid();
        self.mac = reply.mac;
        self.rss_size = reply.norss_rsssize.get() & RSSSIZE_MASK;
        debug!(
            "port {}: viid {:#x}, rss size {}, {:?}",
            self.port_id, self.viid, self.rss_size, self.link,
        );
        Ok(())
    }

    /// Give the virtual interface back to the firmware.
    pub(crate) fn free_vi<M: Mailbox>(&mut self, fw: &mut CommandInterface<M>) -> Result<(), CommandError> {
        if self.viid == 0 {
            return Ok(());
        }
        let mut cmd = ViCommand::new_zeroed();
        cmd.op_to_vfn = op_header(Opcode::Vi, CmdFlags::EXEC, pfn_vfn(fw.pf(), 0));
        cmd.alloc_to_len16 = (VI_FREE | len16::<ViCommand>()).into();
        cmd.set_viid(self.viid);
        fw.execute(Opcode::Vi, &cmd)?;
        self.viid = 0;
        Ok(())
    }

    /// Perform the MAC and PHY actions needed to enable the port.
    ///
    /// Address filters other than the port's own MAC and promiscuity are
    /// left to the stack.
    pub(crate) fn link_start<M: Mailbox>(
        &mut self, fw: &mut CommandInterface<M>, force_link_up: bool,
    ) -> Result<(), CommandError> {
        let mtu = self.dev_config.mtu().min(u32::from(RXMODE_MTU_UNCHANGED - 1)) as u16;
        self.set_rxmode(fw, mtu, self.dev_config.vlan_strip)?;
        let idx = self.change_mac(fw)?;
        self.xact_addr_filt = Some(idx);
        self.l1_config(fw)?;
        self.enable_vi(fw, true, true)?;
        if force_link_up {
            self.link_status = LinkStatus::Up;
        }
        Ok(())
    }

    fn set_rxmode<M: Mailbox>(
        &self, fw: &mut CommandInterface<M>, mtu: u16, vlan_strip: bool,
    ) -> Result<(), CommandError> {
        let mut cmd = ViRxmodeCommand::new_zeroed();
        cmd.op_to_viid = vi_header(Opcode::ViRxmode, CmdFlags::WRITE, self.viid);
        cmd.retval_len16 = len16::<ViRxmodeCommand>().into();
        cmd.mtu_to_vlanexen = ((u32::from(mtu) << RXMODE_MTU_SHIFT)
            | (RXMODE_FLAG_UNCHANGED << RXMODE_PROMISC_SHIFT)
            | (RXMODE_FLAG_UNCHANGED << RXMODE_ALLMULTI_SHIFT)
            | (RXMODE_FLAG_UNCHANGED << RXMODE_BROADCAST_SHIFT)
            | (u32::from(vlan_strip) << RXMODE_VLANEX_SHIFT))
            .into();
        fw.execute(Opcode::ViRxmode, &cmd)?;
        Ok(())
    }

    /// Point our exact-match filter at the port's MAC and return its index.
    fn change_mac<M: Mailbox>(&self, fw: &mut CommandInterface<M>) -> Result<u16, CommandError> {
        let mut cmd = ViMacCommand::new_zeroed();
        cmd.op_to_viid = vi_header(Opcode::ViMac, CmdFlags::WRITE, self.viid);
        cmd.freemacs_to_len16 = len16::<ViMacCommand>().into();
        cmd.set_idx(self.xact_addr_filt.unwrap_or(MAC_ADD));
        cmd.macaddr = self.mac;
        let reply = fw.execute(Opcode::ViMac, &cmd)?;
        let idx = reply.idx();
        if idx >= NUM_MPS_CLS_SRAM_L_INSTANCES {
            return Err(CommandError::Rejected(crate::cmd::FwRetval::Enospc));
        }
        Ok(idx)
    }

    fn l1_config<M: Mailbox>(&self, fw: &mut CommandInterface<M>) -> Result<(), CommandError> {
        let mut cmd = PortCommand::new(self.port_id, CmdFlags::EXEC, ACTION_L1_CFG32);
        cmd.info[..4].copy_from_slice(&self.link.requested_caps().bits().to_be_bytes());
        fw.execute(Opcode::Port, &cmd)?;
        Ok(())
    }

    fn enable_vi<M: Mailbox>(
        &self, fw: &mut CommandInterface<M>, rx: bool, tx: bool,
    ) -> Result<(), CommandError> {
        let mut cmd = ViEnableCommand::new_zeroed();
        cmd.op_to_viid = vi_header(Opcode::ViEnable, CmdFlags::EXEC, self.viid);
        let mut v = len16::<ViEnableCommand>();
        if rx {
            v |= VI_IEN;
        }
        if tx {
            v |= VI_EEN;
        }
        cmd.ien_to_len16 = v.into();
        fw.execute(Opcode::ViEnable, &cmd)?;
        Ok(())
    }

    /// Enable or disable the virtual interface.
    pub(crate) fn set_link_status<M: Mailbox>(
        &mut self, fw: &mut CommandInterface<M>, up: bool,
    ) -> Result<(), CommandError> {
        if let Err(e) = self.enable_vi(fw, up, up) {
            error!("port {}: enabling/disabling the VI failed: {e}", self.port_id);
            return Err(e);
        }
        if !up {
            self.link.reset();
            self.link_status = LinkStatus::Down;
        }
        Ok(())
    }

    pub fn port_id(&self) -> u8 {
        self.port_id
    }

    pub fn viid(&self) -> u16 {
        self.viid
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn rss_size(&self) -> u16 {
        self.rss_size
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link_status
    }

    pub fn handle(&self) -> Option<PortHandle> {
        self.handle
    }

    pub fn dev_config(&self) -> &EthDevConfig {
        &self.dev_config
    }

    /// The speeds this port supports.
    pub fn speed_caps(&self) -> LinkSpeeds {
        speed_caps(self.link.port_type(), self.link.pcaps)
    }

    /// e.g. "1G/10G/25GBASE-SFP28"
    pub fn description(&self) -> String {
        let mut description = CAPS_TO_SPEEDS
            .iter()
            .filter(|(cap, ..)| self.link.pcaps.contains(*cap))
            .map(|(.., name)| *name)
            .collect::<Vec<_>>()
            .join("/");
        description.push_str("BASE-");
        match self.link.port_type() {
            Some(port_type) => description.push_str(&alloc::format!("{port_type}")),
            None => description.push_str("UNKNOWN"),
        }
        description
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("port_id", &self.port_id)
            .field("viid", &self.viid)
            .field("mac", &self.mac)
            .field("rss_size", &self.rss_size)
            .field("link", &self.link)
            .field("link_status", &self.link_status)
            .finish()
    }
}
