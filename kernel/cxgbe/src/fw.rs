//! Bringing the firmware up.
//!
//! This is a linear sequence of steps with a few branches:
//! ```text
//! Hello -> [ResetIfStale] -> FetchVersionInfo -> FetchClock
//!     -> AlreadyInitialized | ApplyConfiguration(Flash) [-> ApplyConfiguration(FirmwareDefault)]
//!     -> QueryProvisionedResources -> QueryPortVector -> InitQueueSubsystem
//!     -> QueryRanges -> QueryOptionalCapabilities -> ApplyHostTweaks
//! ```
//! If a step fails, the firmware is told that we're gone, unless the
//! failure means that it can't be talked to anymore.

use core::fmt;

use byteorder::BigEndian;
use modular_bitfield_msb::{bitfield, specifiers::{B12, B20, B3, B4}};
use strum_macros::Display;
use zerocopy::{AsBytes, FromBytes, U16, U32};

use crate::{
    cmd::{
        len16, op_header, pfn_vfn, CmdFlags, CommandError, CommandInterface, DevParam, Mailbox,
        Opcode, Param, PfvfParam, SimpleCommand,
    },
    config::DevArgs,
    device::{
        apply_host_tweaks, configure_pcie_ext_tag, configure_vlan_types, load_mtu_table,
        read_mtu_table, tp_read_indirect, Chip, RegisterAccess, CIM_BOOT_CFG, NMTUS, PCIE_FW,
        PCIE_FW_ERR, PCIE_FW_HALT, PCIE_FW_INIT, PIORST, PIORSTMODE, PL_RST, TP_VLAN_PRI_MAP,
        UPCRST,
    },
    profile::configure_max_ethqsets,
    sge::SgeParams,
    tid::MAX_ATIDS,
};

/// How often we look at a register the firmware is expected to change.
const FW_POLL_ITERATIONS: u32 = 100;
const FW_POLL_DELAY_US: u32 = 100_000;
/// How long the chip needs after a PL reset.
const PL_RST_DELAY_US: u32 = 2_000_000;

/// Where the firmware configuration file lives in flash.
pub(crate) const FLASH_CFG_START: u32 = 0x1f_0000;
const MEMTYPE_CF_FLASH: u32 = 4;

pub(crate) const NIC_HASHFILTER: u16 = 0x20;
pub(crate) const NIC_ETHOFLD: u16 = 0x40;

/// The state the firmware reported in its hello.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Uninitialized,
    Initialized,
    Error,
}

/// Where the configuration we applied came from.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    #[strum(serialize = "On Flash")]
    Flash,
    #[strum(serialize = "Firmware Default")]
    FirmwareDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupStep {
    Hello,
    ResetIfStale,
    FetchVersionInfo,
    FetchClock,
    AlreadyInitialized,
    ApplyConfiguration(ConfigSource),
    QueryProvisionedResources,
    QueryPortVector,
    InitQueueSubsystem,
    QueryRanges,
    QueryOptionalCapabilities,
    ApplyHostTweaks,
}

impl fmt::Display for BringupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => write!(f, "Hello"),
            Self::ResetIfStale => write!(f, "ResetIfStale"),
            Self::FetchVersionInfo => write!(f, "FetchVersionInfo"),
            Self::FetchClock => write!(f, "FetchClock"),
            Self::AlreadyInitialized => write!(f, "AlreadyInitialized"),
            Self::ApplyConfiguration(source) => write!(f, "ApplyConfiguration({source})"),
            Self::QueryProvisionedResources => write!(f, "QueryProvisionedResources"),
            Self::QueryPortVector => write!(f, "QueryPortVector"),
            Self::InitQueueSubsystem => write!(f, "InitQueueSubsystem"),
            Self::QueryRanges => write!(f, "QueryRanges"),
            Self::QueryOptionalCapabilities => write!(f, "QueryOptionalCapabilities"),
            Self::ApplyHostTweaks => write!(f, "ApplyHostTweaks"),
        }
    }
}

/// Why a bring-up step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupError {
    Command(CommandError),
    /// The firmware or the hardware reported something we can't work with.
    InvalidValue(&'static str),
}

impl From<CommandError> for BringupError {
    fn from(error: CommandError) -> Self {
        Self::Command(error)
    }
}

impl fmt::Display for BringupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(e) => write!(f, "{e}"),
            Self::InvalidValue(e) => write!(f, "{e}"),
        }
    }
}

/// A failed bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringupFailure {
    pub step: BringupStep,
    pub error: BringupError,
}

impl BringupFailure {
    /// Whether the firmware can't be talked to anymore.
    pub fn is_fatal(&self) -> bool {
        matches!(self.error, BringupError::Command(e) if e.is_fatal())
    }
}

impl fmt::Display for BringupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

impl From<BringupFailure> for &'static str {
    fn from(failure: BringupFailure) -> Self {
        match failure.error {
            BringupError::Command(e) => e.into(),
            BringupError::InvalidValue(e) => e,
        }
    }
}

/// What a step decided.
enum StepOutcome {
    Continue(BringupStep),
    /// Something expected went wrong, try the alternative.
    Recoverable(BringupStep),
    Fatal(BringupError),
    Done,
}

/// Resources the firmware provisioned for our function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PfResources {
    /// ingress queues with free lists and interrupts
    pub niqflint: u32,
    /// ingress queues without
    pub niq: u32,
    /// egress queues
    pub neq: u32,
    pub nethctrl: u32,
    pub nvi: u32,
    pub nexactf: u32,
    pub cmask: u8,
    pub pmask: u8,
    pub tc: u8,
    pub r_caps: u8,
    pub wx_caps: u8,
}

/// Everything we learned about the adapter while bringing it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterParams {
    pub chip: Chip,
    pub fw_rev: u32,
    pub tp_rev: u32,
    /// core clock in kHz
    pub cclk_khz: u32,
    pub pfres: PfResources,
    pub portvec: u32,
    pub nports: u8,
    pub sge: SgeParams,
    pub l2t_start: u32,
    pub l2t_end: u32,
    pub clipt_start: u32,
    pub clipt_end: u32,
    pub ftid_base: u32,
    pub nftids: u32,
    pub ntids: u32,
    pub natids: u32,
    pub hash_filter: bool,
    pub filter2_wr_support: bool,
    pub ulptx_memwrite_dsgl: bool,
    pub mtus: [u16; NMTUS],
    pub tp_vlan_pri_map: u32,
    pub max_ethqsets: u16,
}

impl AdapterParams {
    fn new(chip: Chip) -> Self {
        Self {
            chip,
            fw_rev: 0,
            tp_rev: 0,
            cclk_khz: 0,
            pfres: PfResources::default(),
            portvec: 0,
            nports: 0,
            sge: SgeParams::default(),
            l2t_start: 0,
            l2t_end: 0,
            clipt_start: 0,
            clipt_end: 0,
            ftid_base: 0,
            nftids: 0,
            ntids: 0,
            natids: 0,
            hash_filter: false,
            filter2_wr_support: false,
            ulptx_memwrite_dsgl: false,
            mtus: [0; NMTUS],
            tp_vlan_pri_map: 0,
            max_ethqsets: 0,
        }
    }

    /// The physical ports we may use, in ascending order.
    pub fn port_ids(&self) -> impl Iterator<Item = u8> + '_ {
        (0..32u8).filter(move |i| self.portvec & (1 << i) != 0)
    }

    /// Log the versions of the various parts of the adapter.
    pub fn log_versions(&self) {
        let v = self.fw_rev.to_be_bytes();
        info!("Chelsio {} adapter, firmware version {}.{}.{}.{}", self.chip, v[0], v[1], v[2], v[3]);
        let v = self.tp_rev.to_be_bytes();
        info!("TP microcode version {}.{}.{}.{}", v[0], v[1], v[2], v[3]);
    }
}

/// What bring-up found out, including how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringupState {
    /// We are the master PF.
    pub master: bool,
    pub dev_state: DevState,
    /// Set if we configured the adapter ourselves.
    pub config_source: Option<ConfigSource>,
    pub params: AdapterParams,
}

impl BringupState {
    pub fn into_params(self) -> AdapterParams {
        self.params
    }
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub(crate) struct HelloFlags {
    pub(crate) err: bool,
    pub(crate) init: bool,
    pub(crate) masterdis: bool,
    pub(crate) masterforce: bool,
    pub(crate) mbmaster: B4,
    pub(crate) mbasyncnotint: bool,
    pub(crate) mbasyncnot: B3,
    pub(crate) stage: B3,
    pub(crate) clearinit: bool,
    #[skip] __: u16,
}

/// Any mailbox may become the master.
const MBMASTER_ANY: u8 = 0xf;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct HelloCommand {
    pub(crate) op_to_write: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) err_to_clearinit: [u8; 4],
    pub(crate) fwrev: U32<BigEndian>,
}

const RESET_HALT: u32 = 1 << 31;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ResetCommand {
    pub(crate) op_to_write: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) val: U32<BigEndian>,
    pub(crate) halt_pkd: U32<BigEndian>,
}

impl ResetCommand {
    fn new(val: u32, halt: bool) -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.op_to_write = op_header(Opcode::Reset, CmdFlags::WRITE, 0);
        cmd.retval_len16 = len16::<Self>().into();
        cmd.val = val.into();
        if halt {
            cmd.halt_pkd = RESET_HALT.into();
        }
        cmd
    }

    #[cfg(test)]
    pub(crate) fn is_halt(&self) -> bool {
        self.halt_pkd.get() & RESET_HALT != 0
    }
}

const CFVALID: u32 = 1 << 27;
const MEMTYPE_CF_SHIFT: u32 = 24;
const MEMADDR64K_CF_SHIFT: u32 = 16;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct CapsConfigCommand {
    pub(crate) op_to_write: U32<BigEndian>,
    pub(crate) cfvalid_to_len16: U32<BigEndian>,
    _reserved: U32<BigEndian>,
    pub(crate) hashfilter_pkd: U32<BigEndian>,
    pub(crate) nbmcaps: U16<BigEndian>,
    pub(crate) linkcaps: U16<BigEndian>,
    pub(crate) switchcaps: U16<BigEndian>,
    _reserved2: U16<BigEndian>,
    pub(crate) niccaps: U16<BigEndian>,
    pub(crate) toecaps: U16<BigEndian>,
    pub(crate) rdmacaps: U16<BigEndian>,
    pub(crate) cryptocaps: U16<BigEndian>,
    pub(crate) iscsicaps: U16<BigEndian>,
    pub(crate) fcoecaps: U16<BigEndian>,
    pub(crate) cfcsum: U32<BigEndian>,
    pub(crate) finiver: U32<BigEndian>,
    pub(crate) finicsum: U32<BigEndian>,
}

impl CapsConfigCommand {
    fn read(source: Option<ConfigSource>) -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.op_to_write = op_header(Opcode::CapsConfig, CmdFlags::READ, 0);
        let mut v = len16::<Self>();
        if source == Some(ConfigSource::Flash) {
            v |= CFVALID
                | (MEMTYPE_CF_FLASH << MEMTYPE_CF_SHIFT)
                | ((FLASH_CFG_START >> 16) << MEMADDR64K_CF_SHIFT);
        }
        cmd.cfvalid_to_len16 = v.into();
        cmd
    }

    #[cfg(test)]
    pub(crate) fn names_config_file(&self) -> bool {
        self.cfvalid_to_len16.get() & CFVALID != 0
    }

    /// Only keep what a plain NIC needs.
    fn strip_offloads(&mut self) {
        self.niccaps = (self.niccaps.get() & !NIC_ETHOFLD).into();
        self.toecaps = 0.into();
        self.iscsicaps = 0.into();
        self.rdmacaps = 0.into();
        self.fcoecaps = 0.into();
    }
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PfvfResources {
    pub(crate) niqflint: B12,
    pub(crate) niq: B20,
    pub(crate) vf_type: bool,
    #[skip] __: B3,
    pub(crate) cmask: B4,
    pub(crate) pmask: B4,
    pub(crate) neq: B20,
    pub(crate) tc: u8,
    pub(crate) nvi: u8,
    pub(crate) nexactf: u16,
    pub(crate) r_caps: u8,
    pub(crate) wx_caps: u8,
    pub(crate) nethctrl: u16,
}

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct PfvfCommand {
    pub(crate) op_to_vfn: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) resources: [u8; 16],
    _reserved: [u8; 8],
}

/// Tell the firmware we're done with it.
pub(crate) fn say_bye<M: Mailbox>(fw: &mut CommandInterface<M>) -> Result<(), CommandError> {
    fw.execute(Opcode::Bye, &SimpleCommand::new(Opcode::Bye, CmdFlags::WRITE))?;
    Ok(())
}

/// Send a firmware reset.
fn reset<M: Mailbox>(fw: &mut CommandInterface<M>, val: u32, halt: bool) -> Result<(), CommandError> {
    fw.execute(Opcode::Reset, &ResetCommand::new(val, halt))?;
    Ok(())
}

/// Bring the firmware up.
///
/// On success, the adapter is ready for its ports to be set up.
pub(crate) fn bring_up<M: Mailbox, R: RegisterAccess + ?Sized>(
    fw: &mut CommandInterface<M>, regs: &mut R, chip: Chip, args: &DevArgs,
) -> Result<BringupState, BringupFailure> {
    let mut bringup = Bringup {
        fw,
        regs,
        args,
        state: BringupState {
            master: false,
            dev_state: DevState::Uninitialized,
            config_source: None,
            params: AdapterParams::new(chip),
        },
    };
    let mut step = BringupStep::Hello;
    loop {
        trace!("bring-up step {step}");
        match bringup.step(step) {
            StepOutcome::Continue(next) => step = next,
            StepOutcome::Recoverable(fallback) => {
                debug!("{step} failed, falling back to {fallback}");
                step = fallback;
            }
            StepOutcome::Done => return Ok(bringup.state),
            StepOutcome::Fatal(error) => {
                let failure = BringupFailure { step, error };
                bringup.finalize(&failure);
                return Err(failure);
            }
        }
    }
}

struct Bringup<'a, M, R: ?Sized> {
    fw: &'a mut CommandInterface<M>,
    regs: &'a mut R,
    args: &'a DevArgs,
    state: BringupState,
}

impl<M: Mailbox, R: RegisterAccess + ?Sized> Bringup<'_, M, R> {
    fn step(&mut self, step: BringupStep) -> StepOutcome {
        let outcome = match step {
            BringupStep::Hello => self.hello(),
            BringupStep::ResetIfStale => self.reset_stale(),
            BringupStep::FetchVersionInfo => self.fetch_version_info(),
            BringupStep::FetchClock => self.fetch_clock(),
            BringupStep::AlreadyInitialized => {
                info!(
                    "Coming up as {}: Adapter already initialized",
                    if self.state.master { "MASTER" } else { "SLAVE" },
                );
                Ok(StepOutcome::Continue(BringupStep::QueryProvisionedResources))
            }
            BringupStep::ApplyConfiguration(source) => return self.apply_configuration(source),
            BringupStep::QueryProvisionedResources => self.query_pfres(),
            BringupStep::QueryPortVector => self.query_port_vector(),
            BringupStep::InitQueueSubsystem => self.init_sge(),
            BringupStep::QueryRanges => self.query_ranges(),
            BringupStep::QueryOptionalCapabilities => self.query_optional_caps(),
            BringupStep::ApplyHostTweaks => self.apply_host_tweaks(),
        };
        outcome.unwrap_or_else(StepOutcome::Fatal)
    }

    /// Best effort cleanup after a failed step.
    fn finalize(&mut self, failure: &BringupFailure) {
        error!("firmware bring-up failed: {failure}");
        if failure.is_fatal() {
            return;
        }
        if let Err(e) = say_bye(self.fw) {
            debug!("saying bye after failed bring-up failed as well: {e}");
        }
    }

    fn hello(&mut self) -> Result<StepOutcome, BringupError> {
        let mbox = self.fw.mbox();
        let flags = HelloFlags::new()
            .with_mbmaster(MBMASTER_ANY)
            .with_mbasyncnot(mbox & 0x7)
            .with_clearinit(true);
        let mut cmd = HelloCommand::new_zeroed();
        cmd.op_to_write = op_header(Opcode::Hello, CmdFlags::WRITE, 0);
        cmd.retval_len16 = len16::<HelloCommand>().into();
        cmd.err_to_clearinit = flags.into_bytes();
        let reply = self.fw.execute(Opcode::Hello, &cmd)?;

        let flags = HelloFlags::from_bytes(reply.err_to_clearinit);
        let master_mbox = flags.mbmaster();
        self.state.master = master_mbox == mbox;
        self.state.dev_state = if flags.err() {
            DevState::Error
        } else if flags.init() {
            DevState::Initialized
        } else {
            DevState::Uninitialized
        };
        debug!("hello: master mailbox {master_mbox}, we are {mbox}, {}", self.state.dev_state);

        // someone else is initializing the adapter, wait for them
        if !self.state.master && self.state.dev_state == DevState::Uninitialized {
            self.state.dev_state = self.wait_for_master()?;
        }
        if self.state.dev_state == DevState::Error {
            warn!("firmware reports an error, initializing the adapter anyway");
        }

        Ok(StepOutcome::Continue(match self.state.dev_state {
            DevState::Initialized if self.state.master => BringupStep::ResetIfStale,
            _ => BringupStep::FetchVersionInfo,
        }))
    }

    fn wait_for_master(&mut self) -> Result<DevState, BringupError> {
        for _ in 0..FW_POLL_ITERATIONS {
            let pcie_fw = self.regs.read(PCIE_FW);
            if pcie_fw & PCIE_FW_ERR != 0 {
                return Ok(DevState::Error);
            }
            if pcie_fw & PCIE_FW_INIT != 0 {
                return Ok(DevState::Initialized);
            }
            self.regs.delay_us(FW_POLL_DELAY_US);
        }
        warn!("timed out waiting for the master PF to initialize the adapter");
        Err(CommandError::Timeout.into())
    }

    /// A previous instance of ourselves may have exited without cleaning up.
    fn reset_stale(&mut self) -> Result<StepOutcome, BringupError> {
        warn!("adapter was left initialized, restarting the firmware");
        self.halt()?;
        self.restart();
        self.state.dev_state = DevState::Uninitialized;
        Ok(StepOutcome::Continue(BringupStep::FetchVersionInfo))
    }

    fn halt(&mut self) -> Result<(), CommandError> {
        let result = reset(self.fw, PIORST | PIORSTMODE, true);
        // force the microprocessor into reset even if the firmware didn't answer
        self.regs.set_field(CIM_BOOT_CFG, UPCRST, UPCRST);
        self.regs.set_field(PCIE_FW, PCIE_FW_HALT, PCIE_FW_HALT);
        result
    }

    fn restart(&mut self) {
        self.regs.set_field(PCIE_FW, PCIE_FW_HALT, 0);
        if let Err(e) = reset(self.fw, PIORST | PIORSTMODE, false) {
            debug!("firmware reset failed ({e}), resetting the chip");
            self.regs.write(PL_RST, PIORST | PIORSTMODE);
            self.regs.delay_us(PL_RST_DELAY_US);
        }
    }

    fn fetch_version_info(&mut self) -> Result<StepOutcome, BringupError> {
        match self.fw.query_params(&[Param::Dev(DevParam::FwRev), Param::Dev(DevParam::TpRev)]) {
            Ok(v) => {
                self.state.params.fw_rev = v[0];
                self.state.params.tp_rev = v[1];
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!("couldn't read version information: {e}"),
        }
        Ok(StepOutcome::Continue(BringupStep::FetchClock))
    }

    fn fetch_clock(&mut self) -> Result<StepOutcome, BringupError> {
        let v = self.fw.query_params(&[Param::Dev(DevParam::Cclk)])?;
        if v[0] == 0 {
            return Err(BringupError::InvalidValue("core clock is zero"));
        }
        self.state.params.cclk_khz = v[0];
        Ok(StepOutcome::Continue(match self.state.dev_state {
            DevState::Initialized => BringupStep::AlreadyInitialized,
            _ => {
                info!("Coming up as MASTER: Initializing adapter");
                BringupStep::ApplyConfiguration(ConfigSource::Flash)
            }
        }))
    }

    fn apply_configuration(&mut self, source: ConfigSource) -> StepOutcome {
        match self.configure(source) {
            Ok(()) => StepOutcome::Continue(BringupStep::QueryProvisionedResources),
            Err(e) if e.is_not_found() && source == ConfigSource::Flash => {
                info!("no configuration file in flash, going for the embedded config in firmware");
                StepOutcome::Recoverable(BringupStep::ApplyConfiguration(ConfigSource::FirmwareDefault))
            }
            Err(e) => {
                if e.is_not_found() {
                    error!("No Configuration File present on adapter");
                } else {
                    warn!("\"{source}\" configuration file error: {e}");
                }
                StepOutcome::Fatal(e.into())
            }
        }
    }

    fn configure(&mut self, source: ConfigSource) -> Result<(), CommandError> {
        if source == ConfigSource::Flash {
            reset(self.fw, PIORSTMODE | PIORST, false).inspect_err(|e| {
                warn!("firmware reset failed: {e}");
            })?;
        }

        let mut caps = self.fw.execute(Opcode::CapsConfig, &CapsConfigCommand::read(Some(source)))?;
        let finiver = caps.finiver.get();
        let finicsum = caps.finicsum.get();
        let cfcsum = caps.cfcsum.get();
        if finicsum != cfcsum {
            warn!(
                "Configuration File checksum mismatch: [fini] csum={finicsum:#x}, computed csum={cfcsum:#x}",
            );
        }

        caps.strip_offloads();
        caps.op_to_write = op_header(Opcode::CapsConfig, CmdFlags::WRITE, 0);
        caps.cfvalid_to_len16 = len16::<CapsConfigCommand>().into();
        self.fw.execute(Opcode::CapsConfig, &caps).inspect_err(|e| {
            warn!("unable to finalize firmware capabilities: {e}");
        })?;

        apply_host_tweaks(self.regs);

        self.fw
            .execute(Opcode::Initialize, &SimpleCommand::new(Opcode::Initialize, CmdFlags::WRITE))
            .inspect_err(|e| warn!("initializing firmware failed: {e}"))?;

        info!(
            "Successfully configured using Firmware Configuration File \"{source}\", version {finiver:#x}, computed checksum {cfcsum:#x}",
        );
        self.state.config_source = Some(source);
        Ok(())
    }

    fn query_pfres(&mut self) -> Result<StepOutcome, BringupError> {
        let mut cmd = PfvfCommand::new_zeroed();
        cmd.op_to_vfn = op_header(Opcode::Pfvf, CmdFlags::READ, pfn_vfn(self.fw.pf(), 0));
        cmd.retval_len16 = len16::<PfvfCommand>().into();
        let reply = self.fw.execute(Opcode::Pfvf, &cmd).inspect_err(|_| {
            error!("unable to retrieve resource provisioning info");
        })?;
        let r = PfvfResources::from_bytes(reply.resources);
        self.state.params.pfres = PfResources {
            niqflint: r.niqflint().into(),
            niq: r.niq(),
            neq: r.neq(),
            nethctrl: r.nethctrl().into(),
            nvi: r.nvi().into(),
            nexactf: r.nexactf().into(),
            cmask: r.cmask(),
            pmask: r.pmask(),
            tc: r.tc(),
            r_caps: r.r_caps(),
            wx_caps: r.wx_caps(),
        };
        debug!("provisioned resources: {:?}", self.state.params.pfres);
        Ok(StepOutcome::Continue(BringupStep::QueryPortVector))
    }

    fn query_port_vector(&mut self) -> Result<StepOutcome, BringupError> {
        let v = self.fw.query_params(&[Param::Dev(DevParam::PortVec)])?;
        self.state.params.portvec = v[0];
        self.state.params.nports = v[0].count_ones() as u8;
        debug!("port vector {:#x}, {} ports", v[0], self.state.params.nports);
        Ok(StepOutcome::Continue(BringupStep::InitQueueSubsystem))
    }

    fn init_sge(&mut self) -> Result<StepOutcome, BringupError> {
        self.state.params.sge = SgeParams::read(&*self.regs, self.state.params.cclk_khz)
            .map_err(BringupError::InvalidValue)?;
        Ok(StepOutcome::Continue(BringupStep::QueryRanges))
    }

    fn query_ranges(&mut self) -> Result<StepOutcome, BringupError> {
        let params = &mut self.state.params;
        let v = self.fw.query_params(&[
            Param::Pfvf(PfvfParam::L2tStart),
            Param::Pfvf(PfvfParam::L2tEnd),
            Param::Pfvf(PfvfParam::FilterStart),
            Param::Pfvf(PfvfParam::FilterEnd),
        ])?;
        params.l2t_start = v[0];
        params.l2t_end = v[1];
        params.ftid_base = v[2];
        params.nftids = if v[3] >= v[2] { v[3] - v[2] + 1 } else { 0 };

        let v = self.fw.query_params(&[Param::Pfvf(PfvfParam::ClipStart), Param::Pfvf(PfvfParam::ClipEnd)])?;
        params.clipt_start = v[0];
        params.clipt_end = v[1];

        let v = self.fw.query_params(&[Param::Dev(DevParam::Ntid)])?;
        params.ntids = v[0];
        params.natids = (v[0] / 2).min(MAX_ATIDS);
        Ok(StepOutcome::Continue(BringupStep::QueryOptionalCapabilities))
    }

    /// A parameter that older firmware may not know about.
    ///
    /// Only a firmware that can't be talked to anymore is an error.
    fn query_flag(&mut self, param: DevParam) -> Result<bool, CommandError> {
        if self.state.params.chip == Chip::T4 {
            return Ok(false);
        }
        match self.fw.query_params(&[Param::Dev(param)]) {
            Ok(v) => Ok(v.first().is_some_and(|v| *v != 0)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!("firmware doesn't support {param}: {e}");
                Ok(false)
            }
        }
    }

    fn query_optional_caps(&mut self) -> Result<StepOutcome, BringupError> {
        let caps = self.fw.execute(Opcode::CapsConfig, &CapsConfigCommand::read(None))?;
        self.state.params.hash_filter =
            self.state.params.chip == Chip::T6 && caps.niccaps.get() & NIC_HASHFILTER != 0;

        self.state.params.filter2_wr_support = self.query_flag(DevParam::Filter2Wr)?;

        // newer firmware encapsulates CPL messages, older one doesn't know the parameter
        match self.fw.set_params(&[(Param::Pfvf(PfvfParam::CplFw4MsgEncap), 1)]) {
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => debug!("firmware doesn't encapsulate CPL messages: {e}"),
            Ok(()) => {}
        }

        self.state.params.ulptx_memwrite_dsgl = self.query_flag(DevParam::UlptxMemwriteDsgl)?;
        Ok(StepOutcome::Continue(BringupStep::ApplyHostTweaks))
    }

    fn apply_host_tweaks(&mut self) -> Result<StepOutcome, BringupError> {
        let params = &mut self.state.params;
        params.mtus = read_mtu_table(self.regs);
        if self.state.config_source.is_some() {
            // an MSS of 1488 leaves a TCP payload that is a multiple of 8
            if let Some(mtu) = params.mtus.iter_mut().find(|mtu| **mtu == 1492) {
                *mtu = 1488;
            }
            load_mtu_table(self.regs, &params.mtus);
        }
        params.sge.read_queues_per_page(&*self.regs, self.fw.pf());
        params.tp_vlan_pri_map = tp_read_indirect(self.regs, TP_VLAN_PRI_MAP);
        configure_pcie_ext_tag(self.regs, params.chip);
        configure_vlan_types(self.regs, params.nports, self.args.keep_ovlan);
        params.max_ethqsets = configure_max_ethqsets(&params.pfres);
        Ok(StepOutcome::Done)
    }
}
