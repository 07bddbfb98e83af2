//! A control-plane driver core for Chelsio T4/T5/T6 Ethernet adapters.
//!
//! This brings the firmware up, keeps track of the adapter's TIDs, plans
//! the queue sets of the ports and programs RSS. Moving packets is left to
//! the queue code of the host framework; it hands us the ids of the queues
//! it created.

#![no_std]
extern crate alloc;

#[macro_use] extern crate log;

mod bitmap;
pub mod cmd;
pub mod coalesce;
pub mod config;
pub mod device;
pub mod fw;
pub mod port;
pub mod profile;
pub mod rss;
pub mod sge;
pub mod tid;
#[cfg(test)]
mod testing;

use alloc::{format, sync::Arc, vec, vec::Vec};
use core::fmt;

use bitflags::bitflags;
use chelsio_ethernet::{EthDevConfig, LinkSpeeds, PortRegistrar, RssHashFunctions};

use crate::{
    cmd::{CommandError, CommandInterface, Mailbox},
    config::DevArgs,
    device::{
        disable_interrupts, enable_interrupts, read_hash_base, set_stat_source, setup_memwin, Chip,
        RegisterAccess, PL_WHOAMI,
    },
    fw::{bring_up, say_bye, AdapterParams, BringupFailure},
    port::Port,
    profile::{PortProfile, QueueSetPlan},
    rss::{default_spread, read_rss_mode, write_rss, write_rss_conf, RssError, RSS_HF_ALL},
    sge::ControlChannel,
    tid::{AddressFamily, TidRanges, TidTable},
};

/// Doorbell segments per host page.
const UDBS_PER_PAGE: u32 = 4096 / 128;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdapterFlags: u32 {
        /// The firmware is up and expects a BYE.
        const FW_OK = 1 << 0;
        /// We are the master PF.
        const MASTER_PF = 1 << 1;
        /// The queue sets have been planned.
        const CFG_QUEUES = 1 << 2;
        /// Interrupts are enabled and the queues may be used.
        const FULL_INIT_DONE = 1 << 3;
    }
}

/// Ways probing or running an adapter can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterError {
    /// The PCI device id doesn't belong to a known generation.
    UnknownDevice(u16),
    Bringup(BringupFailure),
    Command(CommandError),
    Rss(RssError),
    /// The framework has no room for another port.
    PortAllocation,
    NoSuchPort,
    NoSuchQueue,
    /// The control channels don't match the ports.
    ChannelCount,
    InvalidQueueCount(&'static str),
}

impl From<BringupFailure> for AdapterError {
    fn from(failure: BringupFailure) -> Self {
        Self::Bringup(failure)
    }
}

impl From<CommandError> for AdapterError {
    fn from(error: CommandError) -> Self {
        Self::Command(error)
    }
}

impl From<RssError> for AdapterError {
    fn from(error: RssError) -> Self {
        Self::Rss(error)
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDevice(id) => write!(f, "unknown device id {id:#06x}"),
            Self::Bringup(failure) => write!(f, "{failure}"),
            Self::Command(e) => write!(f, "{e}"),
            Self::Rss(e) => write!(f, "{e}"),
            Self::PortAllocation => write!(f, "could not allocate a port"),
            Self::NoSuchPort => write!(f, "no such port"),
            Self::NoSuchQueue => write!(f, "no such queue"),
            Self::ChannelCount => write!(f, "need exactly one control channel per port"),
            Self::InvalidQueueCount(e) => write!(f, "{e}"),
        }
    }
}

impl From<AdapterError> for &'static str {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::UnknownDevice(_) => "unknown device id",
            AdapterError::Bringup(failure) => failure.into(),
            AdapterError::Command(e) => e.into(),
            AdapterError::Rss(e) => e.into(),
            AdapterError::PortAllocation => "could not allocate a port",
            AdapterError::NoSuchPort => "no such port",
            AdapterError::NoSuchQueue => "no such queue",
            AdapterError::ChannelCount => "need exactly one control channel per port",
            AdapterError::InvalidQueueCount(e) => e,
        }
    }
}

/// An adapter, from probe to close.
///
/// `T` is whatever the upper layers want to remember per TID.
pub struct Adapter<M, R, T> {
    fw: CommandInterface<M>,
    regs: R,
    args: DevArgs,
    flags: AdapterFlags,
    params: AdapterParams,
    ports: Vec<Port>,
    queues: QueueSetPlan,
    tids: Option<TidTable<T>>,
    /// one per port
    channels: Vec<Arc<dyn ControlChannel>>,
}

impl<M: Mailbox, R: RegisterAccess, T> Adapter<M, R, T> {
    /// Bring up the adapter with the PCI device id `device_id` and
    /// register its ports.
    ///
    /// `cores` limits the queue sets per port.
    pub fn probe(
        device_id: u16, mailbox: M, mut regs: R, registrar: &mut dyn PortRegistrar,
        args: DevArgs, cores: u16,
    ) -> Result<Self, AdapterError> {
        let chip = Chip::from_device_id(device_id).ok_or(AdapterError::UnknownDevice(device_id))?;
        let pf = chip.source_pf(regs.read(PL_WHOAMI));
        // the mailbox we use is the one of our PF
        let mut fw = CommandInterface::new(mailbox, pf, pf);
        setup_memwin(&mut regs);

        let state = bring_up(&mut fw, &mut regs, chip, &args)?;
        let mut flags = AdapterFlags::FW_OK;
        if state.master {
            flags |= AdapterFlags::MASTER_PF;
        }
        let params = state.into_params();
        params.log_versions();

        if chip != Chip::T4 {
            if params.sge.eq_qpp > UDBS_PER_PAGE {
                warn!("Incorrect SGE EGRESS QUEUES_PER_PAGE configuration, continuing in debug mode");
            }
            set_stat_source(&mut regs);
        }

        let mut adapter = Self {
            fw,
            regs,
            args,
            flags,
            queues: QueueSetPlan::new(params.max_ethqsets),
            params,
            ports: Vec::new(),
            tids: None,
            channels: Vec::new(),
        };
        if let Err(e) = adapter.probe_ports(registrar, cores) {
            error!("probing the ports failed: {e}");
            adapter.abort_probe(registrar);
            return Err(e);
        }
        for port in &adapter.ports {
            if let Some(handle) = port.handle() {
                registrar.probing_finished(handle);
            }
        }
        Ok(adapter)
    }

    /// Everything after firmware bring-up that may fail.
    fn probe_ports(&mut self, registrar: &mut dyn PortRegistrar, cores: u16) -> Result<(), AdapterError> {
        for port_id in self.params.port_ids().collect::<Vec<_>>() {
            let name = format!("cxgbe{port_id}");
            let handle = registrar.allocate(&name, port_id).ok_or(AdapterError::PortAllocation)?;
            self.ports.push(Port::new(port_id, Some(handle)));
        }
        for port in self.ports.iter_mut() {
            port.init(&mut self.fw)?;
        }

        self.configure_queues(cores);
        self.print_adapter_info();
        self.init_tids();
        self.init_rss()?;
        Ok(())
    }

    /// Undo a partial probe.
    fn abort_probe(&mut self, registrar: &mut dyn PortRegistrar) {
        self.release_ports(registrar);
        self.say_bye();
    }

    fn release_ports(&mut self, registrar: &mut dyn PortRegistrar) {
        for port in self.ports.iter_mut() {
            if let Err(e) = port.free_vi(&mut self.fw) {
                warn!("port {}: freeing the VI failed: {e}", port.port_id());
            }
            if let Some(handle) = port.handle.take() {
                registrar.release(handle);
            }
        }
    }

    fn say_bye(&mut self) {
        if !self.flags.contains(AdapterFlags::FW_OK) {
            return;
        }
        self.flags.remove(AdapterFlags::FW_OK);
        if !self.fw.is_usable() {
            return;
        }
        if let Err(e) = say_bye(&mut self.fw) {
            warn!("saying bye to the firmware failed: {e}");
        }
    }

    fn configure_queues(&mut self, cores: u16) {
        let profiles = self
            .ports
            .iter()
            .map(|port| PortProfile { caps: port.link().pcaps, rss_size: port.rss_size() })
            .collect::<Vec<_>>();
        if self.queues.configure(&profiles, cores, &self.params.sge.tables) {
            self.flags |= AdapterFlags::CFG_QUEUES;
        }
    }

    fn print_adapter_info(&self) {
        info!(
            "Chelsio {} adapter, {} ports, {} queue sets{}",
            self.params.chip,
            self.params.nports,
            self.params.max_ethqsets,
            if self.flags.contains(AdapterFlags::MASTER_PF) { ", master PF" } else { "" },
        );
        for port in &self.ports {
            info!("Port{}: Chelsio {} {}", port.port_id(), self.params.chip, port.description());
        }
    }

    /// Set up the TID tables, without them there just are no offloads.
    fn init_tids(&mut self) {
        let mut hash_base = 0;
        if self.params.hash_filter {
            match read_hash_base(&self.regs) {
                Some(base) => hash_base = base,
                None => {
                    warn!("Maskless filter support disabled. Continuing");
                    self.params.hash_filter = false;
                }
            }
        }
        let ranges = TidRanges {
            ntids: self.params.ntids,
            natids: self.params.natids,
            nftids: self.params.nftids,
            ftid_base: self.params.ftid_base,
            hash_base,
        };
        match TidTable::init(ranges) {
            Ok(tids) => self.tids = Some(tids),
            Err(e) => warn!("could not allocate TID table ({e}), filter support disabled. Continuing"),
        }
    }

    fn init_rss(&mut self) -> Result<(), AdapterError> {
        for port in self.ports.iter_mut() {
            port.rss_mode = read_rss_mode(&mut self.fw, port.viid())?;
            port.rss = vec![0; usize::from(port.rss_size())];
            port.rss_hf = RSS_HF_ALL;
        }
        Ok(())
    }

    /// Hand over one control channel per port, for TID release messages.
    pub fn attach_control_channels(&mut self, channels: Vec<Arc<dyn ControlChannel>>) -> Result<(), AdapterError> {
        if channels.len() != self.ports.len() {
            return Err(AdapterError::ChannelCount);
        }
        self.channels = channels;
        Ok(())
    }

    /// Record the hardware ids of an Ethernet RX queue once it exists.
    pub fn bind_rx_queue(&mut self, qidx: usize, cntxt_id: u16, abs_id: u16) -> Result<(), AdapterError> {
        let rxq = self.queues.rx_queue_mut(qidx).ok_or(AdapterError::NoSuchQueue)?;
        rxq.rspq.cntxt_id = Some(cntxt_id);
        rxq.rspq.abs_id = abs_id;
        Ok(())
    }

    /// Record the hardware ids of the firmware event queue once it exists.
    pub fn bind_fw_event_queue(&mut self, cntxt_id: u16, abs_id: u16) {
        let evtq = self.queues.fw_evtq_mut();
        evtq.cntxt_id = Some(cntxt_id);
        evtq.abs_id = abs_id;
    }

    /// Enable interrupts; afterwards the queues may be used.
    pub fn up(&mut self) -> Result<(), AdapterError> {
        if self.flags.contains(AdapterFlags::FULL_INIT_DONE) {
            return Ok(());
        }
        self.queues.fw_evtq().enable_rx(&mut self.regs);
        enable_interrupts(&mut self.regs, self.fw.pf());
        self.flags |= AdapterFlags::FULL_INIT_DONE;
        Ok(())
    }

    /// Apply what the framework configured for a port.
    pub fn configure_port(&mut self, port: usize, config: EthDevConfig) -> Result<(), AdapterError> {
        let rss_size = self.ports.get(port).ok_or(AdapterError::NoSuchPort)?.rss_size();
        self.queues
            .set_queue_count(port, config.nb_rx_queues, config.nb_tx_queues, rss_size)
            .map_err(AdapterError::InvalidQueueCount)?;
        if let Some(p) = self.ports.get_mut(port) {
            p.dev_config = config;
        }
        Ok(())
    }

    /// Start a port: program its RSS table, arm its RX queues and bring up the link.
    pub fn start_port(&mut self, port: usize) -> Result<(), AdapterError> {
        if !self.flags.contains(AdapterFlags::FULL_INIT_DONE) {
            self.up()?;
        }
        self.setup_rss(port)?;
        for rxq in self.queues.port_rx_queues(port) {
            rxq.rspq.enable_rx(&mut self.regs);
        }
        let force_link_up = self.force_link_up();
        let p = self.ports.get_mut(port).ok_or(AdapterError::NoSuchPort)?;
        p.link_start(&mut self.fw, force_link_up)?;
        Ok(())
    }

    /// Whether a port's link is reported up without waiting for the firmware.
    ///
    /// Only virtual functions need that; on a physical function the
    /// `force_link_up` device argument is accepted but has no effect.
    fn force_link_up(&self) -> bool {
        if self.args.force_link_up {
            debug!("force_link_up is not needed on a physical function, ignoring it");
        }
        false
    }

    fn setup_rss(&mut self, port: usize) -> Result<(), AdapterError> {
        let full_init_done = self.flags.contains(AdapterFlags::FULL_INIT_DONE);
        let queues = self.queues.port(port).ok_or(AdapterError::NoSuchPort)?;
        if queues.rss_done || !full_init_done {
            return Ok(());
        }
        let n_rx = queues.n_rx_qsets;
        let p = self.ports.get_mut(port).ok_or(AdapterError::NoSuchPort)?;
        default_spread(&mut p.rss, n_rx);
        let rxqs = self.queues.port_rx_queues(port);
        write_rss(&mut self.fw, p, rxqs, &p.rss)?;
        write_rss_conf(&mut self.fw, full_init_done, p, rxqs, p.rss_hf)?;
        if let Some(queues) = self.queues.port_mut(port) {
            queues.rss_done = true;
        }
        Ok(())
    }

    /// Change which hash functions RSS uses on a port.
    pub fn set_rss_hash(&mut self, port: usize, rss_hf: RssHashFunctions) -> Result<(), AdapterError> {
        let full_init_done = self.flags.contains(AdapterFlags::FULL_INIT_DONE);
        let p = self.ports.get_mut(port).ok_or(AdapterError::NoSuchPort)?;
        write_rss_conf(&mut self.fw, full_init_done, p, self.queues.port_rx_queues(port), rss_hf)?;
        p.rss_hf = rss_hf;
        Ok(())
    }

    /// Change the interrupt holdoff of an Ethernet RX queue.
    pub fn set_rx_coalescing(&mut self, qidx: usize, us: u32, count: u32) -> Result<(), AdapterError> {
        let rxq = self.queues.rx_queue_mut(qidx).ok_or(AdapterError::NoSuchQueue)?;
        rxq.rspq.set_intr_params(&mut self.fw, &self.params.sge.tables, us, count)?;
        Ok(())
    }

    /// Stop a port's traffic.
    pub fn down(&mut self, port: usize) -> Result<(), AdapterError> {
        let p = self.ports.get_mut(port).ok_or(AdapterError::NoSuchPort)?;
        p.set_link_status(&mut self.fw, false)?;
        Ok(())
    }

    /// Tear the adapter down and say goodbye to the firmware.
    pub fn close(&mut self, registrar: &mut dyn PortRegistrar) {
        if self.flags.contains(AdapterFlags::FULL_INIT_DONE) {
            if let Some(tids) = self.tids.as_mut() {
                tids.teardown();
            }
            disable_interrupts(&mut self.regs, self.fw.pf());
            self.release_ports(registrar);
            self.flags.remove(AdapterFlags::FULL_INIT_DONE);
        }
        self.say_bye();
    }

    /// Forget about a TID and tell the hardware it's free again.
    pub fn remove_tid(&self, port: usize, tid: u32, family: AddressFamily) -> Option<T> {
        let tids = self.tids.as_ref()?;
        let Some(channel) = self.channels.get(port) else {
            warn!("no control channel for port {port}, not releasing TID {tid}");
            return None;
        };
        tids.remove(tid, channel.as_ref(), family)
    }

    /// The module in a port's cage changed.
    pub fn module_changed(&mut self, port: usize, mod_type: u8) {
        if let Some(p) = self.ports.get_mut(port) {
            p.link.mod_type = mod_type;
            crate::port::module_changed(p.port_id(), mod_type);
        }
    }

    pub fn speed_caps(&self, port: usize) -> Option<LinkSpeeds> {
        self.ports.get(port).map(Port::speed_caps)
    }

    pub fn tids(&self) -> Option<&TidTable<T>> {
        self.tids.as_ref()
    }

    pub fn flags(&self) -> AdapterFlags {
        self.flags
    }

    pub fn params(&self) -> &AdapterParams {
        &self.params
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn queues(&self) -> &QueueSetPlan {
        &self.queues
    }

    pub fn firmware(&self) -> &CommandInterface<M> {
        &self.fw
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }
}
