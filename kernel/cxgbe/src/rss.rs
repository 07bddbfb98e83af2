//! Receive side scaling: which RX queue a flow ends up in.

use core::fmt;

use byteorder::BigEndian;
use chelsio_ethernet::RssHashFunctions;
use zerocopy::{AsBytes, FromBytes, U16, U32, U64};

use crate::{
    cmd::{len16, CmdFlags, CommandError, CommandInterface, Mailbox, Opcode},
    port::{vi_header, Port},
    profile::EthRxQueue,
};

pub const RSS_HF_IPV4_MASK: RssHashFunctions = RssHashFunctions::IPV4
    .union(RssHashFunctions::FRAG_IPV4)
    .union(RssHashFunctions::NONFRAG_IPV4_OTHER);
pub const RSS_HF_IPV6_MASK: RssHashFunctions = RssHashFunctions::IPV6
    .union(RssHashFunctions::FRAG_IPV6)
    .union(RssHashFunctions::NONFRAG_IPV6_OTHER)
    .union(RssHashFunctions::IPV6_EX);
pub const RSS_HF_TCP_IPV6_MASK: RssHashFunctions = RssHashFunctions::NONFRAG_IPV6_TCP
    .union(RssHashFunctions::IPV6_TCP_EX);
pub const RSS_HF_UDP_IPV6_MASK: RssHashFunctions = RssHashFunctions::NONFRAG_IPV6_UDP
    .union(RssHashFunctions::IPV6_UDP_EX);
/// All hash functions the adapter supports.
pub const RSS_HF_ALL: RssHashFunctions = RSS_HF_IPV4_MASK
    .union(RssHashFunctions::NONFRAG_IPV4_TCP)
    .union(RssHashFunctions::NONFRAG_IPV4_UDP)
    .union(RSS_HF_IPV6_MASK)
    .union(RSS_HF_TCP_IPV6_MASK)
    .union(RSS_HF_UDP_IPV6_MASK);

const DEFAULTQ_SHIFT: u32 = 16;
const DEFAULTQ_MASK: u32 = 0x3ff;
pub(crate) const IP6FOURTUPEN: u32 = 1 << 4;
pub(crate) const IP6TWOTUPEN: u32 = 1 << 3;
pub(crate) const IP4FOURTUPEN: u32 = 1 << 2;
pub(crate) const IP4TWOTUPEN: u32 = 1 << 1;
pub(crate) const UDPEN: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RssError {
    /// The RX queues don't exist yet.
    NotReady,
    UnsupportedHash,
    /// The table points at a queue the port doesn't have.
    NoSuchQueue,
    Command(CommandError),
}

impl From<CommandError> for RssError {
    fn from(error: CommandError) -> Self {
        Self::Command(error)
    }
}

impl fmt::Display for RssError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "RX queues are not set up yet"),
            Self::UnsupportedHash => write!(f, "unsupported RSS hash function"),
            Self::NoSuchQueue => write!(f, "RSS table refers to a nonexistent queue"),
            Self::Command(e) => write!(f, "{e}"),
        }
    }
}

impl From<RssError> for &'static str {
    fn from(error: RssError) -> Self {
        match error {
            RssError::NotReady => "RX queues are not set up yet",
            RssError::UnsupportedHash => "unsupported RSS hash function",
            RssError::NoSuchQueue => "RSS table refers to a nonexistent queue",
            RssError::Command(e) => e.into(),
        }
    }
}

/// Translate hash functions into the VI RSS configuration flags.
fn hash_flags(rss_hf: RssHashFunctions) -> Result<u32, RssError> {
    if !RSS_HF_ALL.contains(rss_hf) {
        return Err(RssError::UnsupportedHash);
    }
    let mut flags = 0;
    if rss_hf.intersects(RSS_HF_IPV4_MASK) {
        flags |= IP4TWOTUPEN;
    }
    if rss_hf.contains(RssHashFunctions::NONFRAG_IPV4_TCP) {
        flags |= IP4FOURTUPEN;
    }
    if rss_hf.contains(RssHashFunctions::NONFRAG_IPV4_UDP) {
        flags |= IP4FOURTUPEN | UDPEN;
    }
    if rss_hf.intersects(RSS_HF_IPV6_MASK) {
        flags |= IP6TWOTUPEN;
    }
    if rss_hf.intersects(RSS_HF_TCP_IPV6_MASK) {
        flags |= IP6TWOTUPEN | IP6FOURTUPEN;
    }
    if rss_hf.intersects(RSS_HF_UDP_IPV6_MASK) {
        flags |= IP6TWOTUPEN | IP6FOURTUPEN | UDPEN;
    }
    Ok(flags)
}

/// Queue ids per RSS_IND_TBL command.
pub(crate) const RSS_CHUNK: usize = 32;
const IQ_SHIFTS: [u32; 3] = [20, 10, 0];
const IQ_MASK: u32 = 0x3ff;

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct RssIndTblCommand {
    pub(crate) op_to_viid: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) niqid: U16<BigEndian>,
    pub(crate) startidx: U16<BigEndian>,
    _reserved: U32<BigEndian>,
    pub(crate) iq: [U32<BigEndian>; 11],
    _reserved2: U32<BigEndian>,
}

impl RssIndTblCommand {
    /// The queue ids carried by this command.
    #[cfg(test)]
    pub(crate) fn ids(&self) -> alloc::vec::Vec<u16> {
        let n = usize::from(self.niqid.get());
        self.iq
            .iter()
            .flat_map(|word| IQ_SHIFTS.map(|shift| ((word.get() >> shift) & IQ_MASK) as u16))
            .take(n)
            .collect()
    }
}

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct RssViConfigCommand {
    pub(crate) op_to_viid: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) defaultq_to_udpen: U32<BigEndian>,
    _reserved: U32<BigEndian>,
    _reserved2: [U64<BigEndian>; 2],
}

impl RssViConfigCommand {
    #[cfg(test)]
    pub(crate) fn default_queue(&self) -> u16 {
        ((self.defaultq_to_udpen.get() >> DEFAULTQ_SHIFT) & DEFAULTQ_MASK) as u16
    }
}

/// Read the RSS mode the firmware set up for a virtual interface.
pub(crate) fn read_rss_mode<M: Mailbox>(fw: &mut CommandInterface<M>, viid: u16) -> Result<u32, CommandError> {
    let mut cmd = RssViConfigCommand::new_zeroed();
    cmd.op_to_viid = vi_header(Opcode::RssViConfig, CmdFlags::READ, viid);
    cmd.retval_len16 = len16::<RssViConfigCommand>().into();
    let reply = fw.execute(Opcode::RssViConfig, &cmd)?;
    Ok(reply.defaultq_to_udpen.get())
}

/// Write `ids` into the RSS table of a virtual interface, starting at entry 0.
fn write_table<M: Mailbox>(fw: &mut CommandInterface<M>, viid: u16, ids: &[u16]) -> Result<(), CommandError> {
    for (chunk_idx, chunk) in ids.chunks(RSS_CHUNK).enumerate() {
        let mut cmd = RssIndTblCommand::new_zeroed();
        cmd.op_to_viid = vi_header(Opcode::RssIndTbl, CmdFlags::WRITE, viid);
        cmd.retval_len16 = len16::<RssIndTblCommand>().into();
        cmd.niqid = (chunk.len() as u16).into();
        cmd.startidx = ((chunk_idx * RSS_CHUNK) as u16).into();
        for (word, ids) in cmd.iq.iter_mut().zip(chunk.chunks(IQ_SHIFTS.len())) {
            let v = ids
                .iter()
                .zip(IQ_SHIFTS)
                .fold(0, |acc, (id, shift)| acc | ((u32::from(*id) & IQ_MASK) << shift));
            *word = v.into();
        }
        fw.execute(Opcode::RssIndTbl, &cmd)?;
    }
    Ok(())
}

/// Fill the table so flows are spread evenly over `n_rx` queues.
pub(crate) fn default_spread(rss: &mut [u16], n_rx: u16) {
    for (j, entry) in rss.iter_mut().enumerate() {
        *entry = (j % usize::from(n_rx.max(1))) as u16;
    }
}

/// Write the RSS table of a port.
///
/// `queues` holds indices into the port's RX queues, which are mapped to
/// the queues' absolute ids.
pub(crate) fn write_rss<M: Mailbox>(
    fw: &mut CommandInterface<M>, port: &Port, rxqs: &[EthRxQueue], queues: &[u16],
) -> Result<(), RssError> {
    let ids = queues
        .iter()
        .take(usize::from(port.rss_size()))
        .map(|&q| rxqs.get(usize::from(q)).map(|rxq| rxq.rspq.abs_id()).ok_or(RssError::NoSuchQueue))
        .collect::<Result<alloc::vec::Vec<_>, _>>()?;
    write_table(fw, port.viid(), &ids)?;
    Ok(())
}

/// Tell the firmware which hash functions to use for a port.
///
/// Packets that aren't hashed go to the port's first RX queue.
pub(crate) fn write_rss_conf<M: Mailbox>(
    fw: &mut CommandInterface<M>, full_init_done: bool, port: &Port, rxqs: &[EthRxQueue],
    rss_hf: RssHashFunctions,
) -> Result<(), RssError> {
    if !full_init_done {
        error!("no RX queues available on port {}", port.port_id());
        return Err(RssError::NotReady);
    }
    let flags = hash_flags(rss_hf)?;
    let defaultq = rxqs.first().ok_or(RssError::NoSuchQueue)?.rspq.abs_id();

    let mut cmd = RssViConfigCommand::new_zeroed();
    cmd.op_to_viid = vi_header(Opcode::RssViConfig, CmdFlags::WRITE, port.viid());
    cmd.retval_len16 = len16::<RssViConfigCommand>().into();
    cmd.defaultq_to_udpen = (((u32::from(defaultq) & DEFAULTQ_MASK) << DEFAULTQ_SHIFT) | flags).into();
    fw.execute(Opcode::RssViConfig, &cmd)?;
    Ok(())
}
