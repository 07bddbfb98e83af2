//! Stand-ins for the hardware, the firmware and the framework.

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::{String, ToString},
    vec,
    vec::Vec,
};
use core::{
    cell::Cell,
    mem::size_of,
    sync::atomic::{AtomicBool, Ordering},
};

use chelsio_ethernet::{PortHandle, PortRegistrar};
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    cmd::{decode, CmdFlags, FwRetval, Mailbox, MailboxError, Opcode, Param, ParamsCommand, DevParam, PfvfParam},
    device::{RegisterAccess, TP_MTU_TABLE, TP_PIO_ADDR, TP_PIO_DATA},
    fw::{CapsConfigCommand, HelloCommand, HelloFlags, PfvfCommand, PfvfResources, ResetCommand, NIC_ETHOFLD, NIC_HASHFILTER},
    port::{viid_of, PortCommand, PortInfo, ViCommand, ViEnableCommand, ViMacCommand, ViRxmodeCommand, MAC_ADD},
    rss::{RssIndTblCommand, RssViConfigCommand},
    sge::ControlChannel,
};

/// A port as the fake firmware reports it.
#[derive(Debug, Clone)]
pub(crate) struct FakePort {
    pub(crate) port_type: u8,
    pub(crate) mod_type: u8,
    pub(crate) pcaps: u32,
    pub(crate) acaps: u32,
    pub(crate) mac: [u8; 6],
    pub(crate) rss_size: u16,
}

/// What the fake firmware knows about a virtual interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FakeVi {
    pub(crate) port_id: u8,
    pub(crate) mtu: Option<u16>,
    pub(crate) vlan_extraction: Option<u32>,
    pub(crate) mac: Option<[u8; 6]>,
    pub(crate) enabled: (bool, bool),
    /// how many exact-match filters were allocated
    pub(crate) mac_filters: usize,
    pub(crate) rss_table: Vec<u16>,
    pub(crate) rss_config: Option<u32>,
}

/// The RSS mode a fresh virtual interface reports.
pub(crate) const FAKE_RSS_MODE: u32 = 0x1f;
const FIRST_VIID: u16 = 0x40;

/// A scripted firmware that answers commands the way the real one would.
pub(crate) struct FakeFirmware {
    log: Vec<(Opcode, Vec<u8>)>,
    failures: VecDeque<(Opcode, MailboxError)>,
    nth_failures: Vec<(Opcode, usize, MailboxError)>,
    query_failures: Vec<(u32, MailboxError)>,
    params: BTreeMap<u32, u32>,
    written: BTreeMap<u32, u32>,
    master: Option<u8>,
    initialized: bool,
    flash_config: bool,
    niccaps: u16,
    cfcsum: u32,
    finicsum: u32,
    written_caps: Option<Vec<u8>>,
    caps_reads: Vec<bool>,
    halts: usize,
    pfres: (u16, u32),
    ports: Vec<FakePort>,
    vis: BTreeMap<u16, FakeVi>,
    next_viid: u16,
    next_mac_idx: u16,
    l1_configs: BTreeMap<u8, u32>,
}

impl FakeFirmware {
    pub(crate) fn new() -> Self {
        Self {
            log: Vec::new(),
            failures: VecDeque::new(),
            nth_failures: Vec::new(),
            query_failures: Vec::new(),
            params: BTreeMap::new(),
            written: BTreeMap::new(),
            master: None,
            initialized: false,
            flash_config: true,
            niccaps: NIC_HASHFILTER | NIC_ETHOFLD | 0x1,
            cfcsum: 0x1234_5678,
            finicsum: 0x1234_5678,
            written_caps: None,
            caps_reads: Vec::new(),
            halts: 0,
            pfres: (65, 256),
            ports: Vec::new(),
            vis: BTreeMap::new(),
            next_viid: FIRST_VIID,
            next_mac_idx: 0,
            l1_configs: BTreeMap::new(),
        }
    }

    /// A firmware that answers every query bring-up makes.
    pub(crate) fn provisioned() -> Self {
        let mut fw = Self::new();
        fw.set_param(Param::Dev(DevParam::FwRev), 0x0110_1a00);
        fw.set_param(Param::Dev(DevParam::TpRev), 0x0004_0100);
        fw.set_param(Param::Dev(DevParam::Cclk), 250_000);
        fw.set_param(Param::Dev(DevParam::PortVec), 0b0101);
        fw.set_param(Param::Pfvf(PfvfParam::L2tStart), 0);
        fw.set_param(Param::Pfvf(PfvfParam::L2tEnd), 2047);
        fw.set_param(Param::Pfvf(PfvfParam::FilterStart), 1000);
        fw.set_param(Param::Pfvf(PfvfParam::FilterEnd), 1495);
        fw.set_param(Param::Pfvf(PfvfParam::ClipStart), 0);
        fw.set_param(Param::Pfvf(PfvfParam::ClipEnd), 511);
        fw.set_param(Param::Dev(DevParam::Ntid), 20480);
        fw.set_param(Param::Dev(DevParam::Filter2Wr), 1);
        fw.set_param(Param::Dev(DevParam::UlptxMemwriteDsgl), 1);
        fw
    }

    /// Fail the next command with this opcode.
    pub(crate) fn fail_next(&mut self, opcode: Opcode, error: MailboxError) {
        self.failures.push_back((opcode, error));
    }

    /// Fail the `n`th command (counting from zero) with this opcode.
    pub(crate) fn fail_nth(&mut self, opcode: Opcode, n: usize, error: MailboxError) {
        self.nth_failures.push((opcode, n, error));
    }

    /// Fail every parameter command that includes `param`.
    pub(crate) fn fail_query(&mut self, param: Param, error: MailboxError) {
        self.query_failures.push((param.id(), error));
    }

    pub(crate) fn set_param(&mut self, param: Param, value: u32) {
        self.params.insert(param.id(), value);
    }

    pub(crate) fn remove_param(&mut self, param: Param) {
        self.params.remove(&param.id());
    }

    /// Let the mailbox `mbox` win the master election instead of the requester.
    pub(crate) fn set_master(&mut self, mbox: u8) {
        self.master = Some(mbox);
    }

    pub(crate) fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    pub(crate) fn set_flash_config(&mut self, present: bool) {
        self.flash_config = present;
    }

    pub(crate) fn set_pfres(&mut self, niqflint: u16, neq: u32) {
        self.pfres = (niqflint, neq);
    }

    /// Add a port; its id is the number of ports added before.
    pub(crate) fn add_port(&mut self, port: FakePort) {
        self.ports.push(port);
    }

    /// How many commands with this opcode were sent, failed ones included.
    pub(crate) fn sent(&self, opcode: Opcode) -> usize {
        self.log.iter().filter(|(op, _)| *op == opcode).count()
    }

    /// How many parameter reads asked for `param`.
    pub(crate) fn queries(&self, param: Param) -> usize {
        let id = param.id();
        self.log
            .iter()
            .filter(|(op, _)| *op == Opcode::Params)
            .filter_map(|(_, bytes)| decode::<ParamsCommand>(bytes))
            .filter(|cmd| cmd.op_to_vfn.get() & CmdFlags::READ.bits() != 0)
            .filter(|cmd| cmd.params.iter().any(|p| p.mnem.get() == id))
            .count()
    }

    pub(crate) fn written_param(&self, param: Param) -> Option<u32> {
        self.written.get(&param.id()).copied()
    }

    pub(crate) fn written_caps(&self) -> Option<CapsConfigCommand> {
        decode(self.written_caps.as_deref()?)
    }

    /// For every capability read, whether it named the configuration file.
    pub(crate) fn caps_reads(&self) -> Vec<bool> {
        self.caps_reads.clone()
    }

    pub(crate) fn halts(&self) -> usize {
        self.halts
    }

    pub(crate) fn vi(&self, viid: u16) -> Option<FakeVi> {
        self.vis.get(&viid).cloned()
    }

    pub(crate) fn vi_count(&self) -> usize {
        self.vis.len()
    }

    pub(crate) fn l1_config(&self, port_id: u8) -> Option<u32> {
        self.l1_configs.get(&port_id).copied()
    }

    pub(crate) fn rss_table(&self, viid: u16) -> Vec<u16> {
        self.vis.get(&viid).map(|vi| vi.rss_table.clone()).unwrap_or_default()
    }

    pub(crate) fn rss_config(&self, viid: u16) -> Option<u32> {
        self.vis.get(&viid)?.rss_config
    }

    fn scripted_failure(&mut self, opcode: Opcode) -> Option<MailboxError> {
        // this command has already been logged
        let n = self.sent(opcode) - 1;
        if let Some(pos) = self.nth_failures.iter().position(|(op, i, _)| *op == opcode && *i == n) {
            return Some(self.nth_failures.remove(pos).2);
        }
        let pos = self.failures.iter().position(|(op, _)| *op == opcode)?;
        self.failures.remove(pos).map(|(_, e)| e)
    }

    fn vi_mut(&mut self, viid: u16) -> Result<&mut FakeVi, MailboxError> {
        self.vis.get_mut(&viid).ok_or(MailboxError::Rejected(FwRetval::Einval))
    }

    fn hello(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: HelloCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let request = HelloFlags::from_bytes(cmd.err_to_clearinit);
        let master = self.master.unwrap_or(request.mbasyncnot());
        let reply = HelloFlags::new()
            .with_mbmaster(master)
            .with_init(self.initialized);
        cmd.err_to_clearinit = reply.into_bytes();
        Ok(cmd.as_bytes().to_vec())
    }

    fn reset(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let cmd: ResetCommand = decode(bytes).ok_or(MailboxError::Io)?;
        if cmd.is_halt() {
            self.halts += 1;
        } else {
            self.initialized = false;
        }
        Ok(bytes.to_vec())
    }

    fn caps_config(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: CapsConfigCommand = decode(bytes).ok_or(MailboxError::Io)?;
        if cmd.op_to_write.get() & CmdFlags::WRITE.bits() != 0 {
            self.written_caps = Some(bytes.to_vec());
            return Ok(bytes.to_vec());
        }
        self.caps_reads.push(cmd.names_config_file());
        if cmd.names_config_file() && !self.flash_config {
            return Err(MailboxError::Rejected(FwRetval::Enoent));
        }
        cmd.niccaps = self.niccaps.into();
        cmd.toecaps = 1.into();
        cmd.rdmacaps = 1.into();
        cmd.iscsicaps = 1.into();
        cmd.fcoecaps = 1.into();
        cmd.cfcsum = self.cfcsum.into();
        cmd.finicsum = self.finicsum.into();
        cmd.finiver = 0x0100.into();
        Ok(cmd.as_bytes().to_vec())
    }

    fn params(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: ParamsCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let read = cmd.op_to_vfn.get() & CmdFlags::READ.bits() != 0;
        for pair in cmd.params.iter().filter(|p| p.mnem.get() != 0) {
            let id = pair.mnem.get();
            if let Some((_, e)) = self.query_failures.iter().find(|(failing, _)| *failing == id) {
                return Err(*e);
            }
        }
        for pair in cmd.params.iter_mut().filter(|p| p.mnem.get() != 0) {
            let id = pair.mnem.get();
            Param::from_id(id).ok_or(MailboxError::Rejected(FwRetval::Einval))?;
            if read {
                let value = self.params.get(&id).ok_or(MailboxError::Rejected(FwRetval::Einval))?;
                pair.val = (*value).into();
            } else {
                self.written.insert(id, pair.val.get());
            }
        }
        Ok(cmd.as_bytes().to_vec())
    }

    fn pfvf(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: PfvfCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let (niqflint, neq) = self.pfres;
        cmd.resources = PfvfResources::new()
            .with_niqflint(niqflint)
            .with_neq(neq)
            .with_nvi(4)
            .with_nexactf(336)
            .into_bytes();
        Ok(cmd.as_bytes().to_vec())
    }

    fn port(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: PortCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let port = self
            .ports
            .get(usize::from(cmd.port_id()))
            .ok_or(MailboxError::Rejected(FwRetval::Einval))?;
        if cmd.is_get_port_info() {
            cmd.info = PortInfo::new()
                .with_port_type(port.port_type)
                .with_mod_type(port.mod_type)
                .with_pcaps(port.pcaps)
                .with_acaps(port.acaps)
                .into_bytes();
        } else {
            self.l1_configs.insert(cmd.port_id(), cmd.rcap());
        }
        Ok(cmd.as_bytes().to_vec())
    }

    fn vi_cmd(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: ViCommand = decode(bytes).ok_or(MailboxError::Io)?;
        if !cmd.is_alloc() {
            self.vis.remove(&cmd.viid()).ok_or(MailboxError::Rejected(FwRetval::Einval))?;
            return Ok(bytes.to_vec());
        }
        let port_id = cmd.port_id();
        let port = self
            .ports
            .get(usize::from(port_id))
            .ok_or(MailboxError::Rejected(FwRetval::Einval))?;
        let viid = self.next_viid;
        self.next_viid += 1;
        cmd.set_viid(viid);
        cmd.mac = port.mac;
        cmd.set_rss_size(port.rss_size);
        self.vis.insert(viid, FakeVi { port_id, rss_config: Some(FAKE_RSS_MODE), ..Default::default() });
        Ok(cmd.as_bytes().to_vec())
    }

    fn vi_mac(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: ViMacCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let mut idx = cmd.idx();
        if idx == MAC_ADD {
            idx = self.next_mac_idx;
            self.next_mac_idx += 1;
            self.vi_mut(viid_of(cmd.op_to_viid))?.mac_filters += 1;
        }
        let vi = self.vi_mut(viid_of(cmd.op_to_viid))?;
        vi.mac = Some(cmd.macaddr);
        cmd.set_idx(idx);
        Ok(cmd.as_bytes().to_vec())
    }

    fn rss_ind_tbl(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let cmd: RssIndTblCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let viid = viid_of(cmd.op_to_viid);
        let ids = cmd.ids();
        let start = usize::from(cmd.startidx.get());
        // tables of unknown VIs are kept as well, so they can be inspected
        let vi = self.vis.entry(viid).or_default();
        if vi.rss_table.len() < start + ids.len() {
            vi.rss_table.resize(start + ids.len(), 0);
        }
        vi.rss_table[start..start + ids.len()].copy_from_slice(&ids);
        Ok(bytes.to_vec())
    }

    fn rss_vi_config(&mut self, bytes: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut cmd: RssViConfigCommand = decode(bytes).ok_or(MailboxError::Io)?;
        let vi = self.vi_mut(viid_of(cmd.op_to_viid))?;
        if cmd.op_to_viid.get() & CmdFlags::WRITE.bits() != 0 {
            vi.rss_config = Some(cmd.defaultq_to_udpen.get());
        } else {
            cmd.defaultq_to_udpen = vi.rss_config.unwrap_or(0).into();
        }
        Ok(cmd.as_bytes().to_vec())
    }
}

impl Mailbox for FakeFirmware {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let opcode = command
            .first()
            .and_then(|op| Opcode::from_repr(*op))
            .ok_or(MailboxError::Io)?;
        self.log.push((opcode, command.to_vec()));
        if let Some(e) = self.scripted_failure(opcode) {
            return Err(e);
        }
        match opcode {
            Opcode::Hello => self.hello(command),
            Opcode::Reset => self.reset(command),
            Opcode::Bye => Ok(command.to_vec()),
            Opcode::Initialize => {
                self.initialized = true;
                Ok(command.to_vec())
            }
            Opcode::CapsConfig => self.caps_config(command),
            Opcode::Params => self.params(command),
            Opcode::Pfvf => self.pfvf(command),
            Opcode::Port => self.port(command),
            Opcode::Vi => self.vi_cmd(command),
            Opcode::ViMac => self.vi_mac(command),
            Opcode::ViRxmode => {
                let cmd: ViRxmodeCommand = decode(command).ok_or(MailboxError::Io)?;
                let vi = self.vi_mut(viid_of(cmd.op_to_viid))?;
                vi.mtu = Some(cmd.mtu());
                vi.vlan_extraction = Some(cmd.vlan_extraction());
                Ok(command.to_vec())
            }
            Opcode::ViEnable => {
                let cmd: ViEnableCommand = decode(command).ok_or(MailboxError::Io)?;
                self.vi_mut(viid_of(cmd.op_to_viid))?.enabled = cmd.enables();
                Ok(command.to_vec())
            }
            Opcode::RssIndTbl => self.rss_ind_tbl(command),
            Opcode::RssViConfig => self.rss_vi_config(command),
        }
    }
}

const DEFAULT_MTUS: [u16; 16] = [
    88, 88, 256, 512, 576, 1024, 1280, 1492, 1500, 2002, 2048, 4096, 4352, 8192, 9000, 9600,
];

/// An in-memory register file.
///
/// Unwritten registers read as zero. The TP indirect registers and the MTU
/// table behave like the hardware's.
pub(crate) struct FakeRegisters {
    regs: BTreeMap<u32, u32>,
    tp: BTreeMap<u32, u32>,
    mtus: [u16; 16],
    mtu_select: usize,
    capabilities: BTreeMap<u8, u16>,
    config: BTreeMap<u16, u16>,
    delayed_us: Cell<u64>,
}

impl FakeRegisters {
    pub(crate) fn new() -> Self {
        Self {
            regs: BTreeMap::new(),
            tp: BTreeMap::new(),
            mtus: DEFAULT_MTUS,
            mtu_select: 0,
            capabilities: BTreeMap::new(),
            config: BTreeMap::new(),
            delayed_us: Cell::new(0),
        }
    }

    pub(crate) fn set_tp_indirect(&mut self, addr: u32, value: u32) {
        self.tp.insert(addr, value);
    }

    pub(crate) fn set_capability(&mut self, id: u8, pos: u16) {
        self.capabilities.insert(id, pos);
    }

    /// How long the driver waited in total.
    pub(crate) fn delayed_us(&self) -> u64 {
        self.delayed_us.get()
    }
}

impl RegisterAccess for FakeRegisters {
    fn read(&self, addr: u32) -> u32 {
        match addr {
            TP_PIO_DATA => {
                let tp_addr = self.regs.get(&TP_PIO_ADDR).copied().unwrap_or(0);
                self.tp.get(&tp_addr).copied().unwrap_or(0)
            }
            TP_MTU_TABLE => u32::from(self.mtus[self.mtu_select]),
            _ => self.regs.get(&addr).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        match addr {
            TP_PIO_DATA => {
                let tp_addr = self.regs.get(&TP_PIO_ADDR).copied().unwrap_or(0);
                self.tp.insert(tp_addr, value);
            }
            TP_MTU_TABLE => {
                let index = (value >> 24) as usize;
                if index == 0xff {
                    self.mtu_select = (value & 0xf) as usize;
                } else if let Some(mtu) = self.mtus.get_mut(index) {
                    *mtu = (value & 0x3fff) as u16;
                }
            }
            _ => {
                self.regs.insert(addr, value);
            }
        }
    }

    fn find_capability(&self, id: u8) -> Option<u16> {
        self.capabilities.get(&id).copied()
    }

    fn read_config_word(&self, offset: u16) -> u16 {
        self.config.get(&offset).copied().unwrap_or(0)
    }

    fn write_config_word(&mut self, offset: u16, value: u16) {
        self.config.insert(offset, value);
    }

    fn delay_us(&self, us: u32) {
        self.delayed_us.set(self.delayed_us.get() + u64::from(us));
    }
}

/// A control channel that keeps what it transmits.
pub(crate) struct RecordingChannel {
    sent: Mutex<Vec<Vec<u8>>>,
    buffers_available: AtomicBool,
}

impl RecordingChannel {
    pub(crate) fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            buffers_available: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_buffers_available(&self, available: bool) {
        self.buffers_available.store(available, Ordering::Release);
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl ControlChannel for RecordingChannel {
    fn allocate(&self, len: usize) -> Option<Vec<u8>> {
        self.buffers_available.load(Ordering::Acquire).then(|| vec![0; len])
    }

    fn transmit(&self, message: Vec<u8>) {
        self.sent.lock().push(message);
    }
}

/// A port registrar with a fixed number of slots.
pub(crate) struct FakeRegistrar {
    capacity: usize,
    next: u16,
    pub(crate) allocated: Vec<(String, u8, PortHandle)>,
    pub(crate) finished: Vec<PortHandle>,
    pub(crate) released: Vec<PortHandle>,
}

impl FakeRegistrar {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next: 0,
            allocated: Vec::new(),
            finished: Vec::new(),
            released: Vec::new(),
        }
    }
}

impl PortRegistrar for FakeRegistrar {
    fn allocate(&mut self, name: &str, port_id: u8) -> Option<PortHandle> {
        if self.allocated.len() >= self.capacity {
            return None;
        }
        let handle = PortHandle(self.next);
        self.next += 1;
        self.allocated.push((name.to_string(), port_id, handle));
        Some(handle)
    }

    fn probing_finished(&mut self, handle: PortHandle) {
        self.finished.push(handle);
    }

    fn release(&mut self, handle: PortHandle) {
        self.released.push(handle);
    }
}

#[test]
fn fake_commands_fit_their_length() {
    assert_eq!(size_of::<HelloCommand>(), 16);
    assert_eq!(size_of::<ResetCommand>(), 16);
    assert_eq!(size_of::<CapsConfigCommand>(), 48);
    assert_eq!(size_of::<PfvfCommand>(), 32);
    assert_eq!(size_of::<PortCommand>(), 32);
    assert_eq!(size_of::<ViCommand>(), 64);
    assert_eq!(size_of::<RssIndTblCommand>(), 64);
    assert_eq!(size_of::<RssViConfigCommand>(), 32);
}
