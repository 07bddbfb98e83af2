//! This module consists of the mailbox interface to the firmware and
//! the encoding shared by all firmware commands.
//!
//! A command is a big-endian structure whose first word carries the opcode
//! and the request flags, and whose second word carries the length in
//! units of 16 bytes. The firmware answers in place, with the return value
//! in the second word.

use alloc::vec::Vec;
use core::{fmt, mem::size_of};

use bitflags::bitflags;
use byteorder::BigEndian;
use modular_bitfield_msb::bitfield;
use strum_macros::{Display, FromRepr};
use zerocopy::{AsBytes, FromBytes, U32};

/// The transport that carries commands to the firmware and back.
pub trait Mailbox {
    /// Post a command and wait for the reply.
    ///
    /// Implementations must bound the wait and report [`MailboxError::Timeout`]
    /// instead of blocking forever.
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, MailboxError>;
}

impl<M: Mailbox + ?Sized> Mailbox for &mut M {
    fn send(&mut self, command: &[u8]) -> Result<Vec<u8>, MailboxError> {
        (**self).send(command)
    }
}

/// Ways a mailbox round-trip can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    /// The firmware did not answer in time.
    Timeout,
    /// The transport itself failed.
    Io,
    /// The firmware answered with a non-zero return value.
    Rejected(FwRetval),
}

/// Return values of firmware commands.
#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub enum FwRetval {
    /// a return value this driver doesn't know about
    Unknown = 0,
    #[strum(serialize = "operation not permitted")]
    Eperm = 1,
    #[strum(serialize = "not found")]
    Enoent = 2,
    #[strum(serialize = "I/O error")]
    Eio = 5,
    #[strum(serialize = "exec format error")]
    Enoexec = 8,
    #[strum(serialize = "busy")]
    Ebusy = 16,
    #[strum(serialize = "already exists")]
    Eexist = 17,
    #[strum(serialize = "invalid argument")]
    Einval = 22,
    #[strum(serialize = "no space left")]
    Enospc = 28,
    #[strum(serialize = "not implemented")]
    Enosys = 38,
    #[strum(serialize = "no data")]
    Enodata = 61,
    #[strum(serialize = "protocol error")]
    Eproto = 71,
    #[strum(serialize = "address in use")]
    Eaddrinuse = 98,
    #[strum(serialize = "address not available")]
    Eaddrnotavail = 99,
    #[strum(serialize = "network unreachable")]
    Enetunreach = 101,
    #[strum(serialize = "no buffer space")]
    Enobufs = 105,
    #[strum(serialize = "timed out")]
    Etimedout = 110,
    #[strum(serialize = "in progress")]
    Einprogress = 115,
}

impl FwRetval {
    pub fn from_code(code: u8) -> Self {
        Self::from_repr(code).unwrap_or(Self::Unknown)
    }
}

/// Ways a firmware command can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    Timeout,
    Io,
    Rejected(FwRetval),
    /// A previous fatal error made us stop talking to the firmware.
    Unusable,
    /// The reply was shorter than the command.
    Malformed,
    /// More parameters than fit into one command.
    TooManyParams,
}

impl CommandError {
    /// Whether the firmware can't be trusted with further commands.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Io | Self::Unusable
                | Self::Rejected(FwRetval::Eio) | Self::Rejected(FwRetval::Etimedout)
        )
    }

    pub fn is_not_found(&self) -> bool {
        *self == Self::Rejected(FwRetval::Enoent)
    }
}

impl From<MailboxError> for CommandError {
    fn from(error: MailboxError) -> Self {
        match error {
            MailboxError::Timeout => Self::Timeout,
            MailboxError::Io => Self::Io,
            MailboxError::Rejected(retval) => Self::Rejected(retval),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "firmware command timed out"),
            Self::Io => write!(f, "mailbox I/O error"),
            Self::Rejected(retval) => write!(f, "firmware rejected command: {retval}"),
            Self::Unusable => write!(f, "firmware is unusable"),
            Self::Malformed => write!(f, "malformed firmware reply"),
            Self::TooManyParams => write!(f, "too many parameters for one command"),
        }
    }
}

impl From<CommandError> for &'static str {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::Timeout => "firmware command timed out",
            CommandError::Io => "mailbox I/O error",
            CommandError::Rejected(FwRetval::Enoent) => "firmware: not found",
            CommandError::Rejected(FwRetval::Einval) => "firmware: invalid argument",
            CommandError::Rejected(_) => "firmware rejected command",
            CommandError::Unusable => "firmware is unusable",
            CommandError::Malformed => "malformed firmware reply",
            CommandError::TooManyParams => "too many parameters for one command",
        }
    }
}

#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Reset = 0x03,
    Hello = 0x04,
    Bye = 0x05,
    Initialize = 0x06,
    CapsConfig = 0x07,
    Params = 0x08,
    Pfvf = 0x09,
    Vi = 0x14,
    ViMac = 0x15,
    ViRxmode = 0x16,
    ViEnable = 0x17,
    Port = 0x1b,
    RssIndTbl = 0x20,
    RssViConfig = 0x23,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CmdFlags: u32 {
        const REQUEST = 1 << 23;
        const READ = 1 << 22;
        const WRITE = 1 << 21;
        const EXEC = 1 << 20;
    }
}

const OP_SHIFT: u32 = 24;
const RETVAL_SHIFT: u32 = 8;

/// Builds the first word of a command.
///
/// `low` holds the opcode-specific bits below the flags.
pub(crate) fn op_header(opcode: Opcode, flags: CmdFlags, low: u32) -> U32<BigEndian> {
    ((u32::from(opcode as u8) << OP_SHIFT) | (flags | CmdFlags::REQUEST).bits() | low).into()
}

/// The length of a command in units of 16 bytes.
pub(crate) fn len16<C>() -> u32 {
    (size_of::<C>() / 16) as u32
}

/// Physical and virtual function fields of commands addressed to a function.
pub(crate) fn pfn_vfn(pf: u8, vf: u8) -> u32 {
    (u32::from(pf) << 8) | u32::from(vf)
}

/// Talks to the firmware through a [`Mailbox`].
///
/// After a timeout or an I/O error the firmware is considered unusable and
/// every further command fails with [`CommandError::Unusable`].
pub struct CommandInterface<M> {
    mailbox: M,
    mbox: u8,
    pf: u8,
    usable: bool,
}

impl<M: Mailbox> CommandInterface<M> {
    pub fn new(mailbox: M, mbox: u8, pf: u8) -> Self {
        Self { mailbox, mbox, pf, usable: true }
    }

    /// The mailbox number we talk through.
    pub fn mbox(&self) -> u8 {
        self.mbox
    }

    /// The physical function we act for.
    pub fn pf(&self) -> u8 {
        self.pf
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn mailbox(&self) -> &M {
        &self.mailbox
    }

    /// Post a command and return the firmware's reply.
    pub(crate) fn execute<C: AsBytes + FromBytes>(
        &mut self, opcode: Opcode, command: &C,
    ) -> Result<C, CommandError> {
        if !self.usable {
            return Err(CommandError::Unusable);
        }
        trace!("executing command: {opcode}");
        // a transport may hand back a reply that carries the firmware's error
        let sent = self.mailbox.send(command.as_bytes()).map_err(CommandError::from).and_then(|reply| {
            match retval_of(&reply) {
                Some(retval) => Err(CommandError::Rejected(retval)),
                None => Ok(reply),
            }
        });
        let reply = match sent {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_fatal() {
                    error!("command {opcode} failed fatally: {e}, not issuing any further commands");
                    self.usable = false;
                } else {
                    debug!("command {opcode} failed: {e}");
                }
                return Err(e);
            }
        };
        decode(&reply).ok_or(CommandError::Malformed)
    }

    /// Read up to seven parameters at once.
    pub(crate) fn query_params(&mut self, params: &[Param]) -> Result<Vec<u32>, CommandError> {
        let mut cmd = ParamsCommand::new(self.pf, CmdFlags::READ);
        if params.len() > cmd.params.len() {
            return Err(CommandError::TooManyParams);
        }
        for (pair, param) in cmd.params.iter_mut().zip(params) {
            pair.mnem = param.id().into();
        }
        let reply = self.execute(Opcode::Params, &cmd)?;
        Ok(reply.params[..params.len()].iter().map(|p| p.val.get()).collect())
    }

    /// Write up to seven parameters at once.
    pub(crate) fn set_params(&mut self, params: &[(Param, u32)]) -> Result<(), CommandError> {
        let mut cmd = ParamsCommand::new(self.pf, CmdFlags::WRITE);
        if params.len() > cmd.params.len() {
            return Err(CommandError::TooManyParams);
        }
        for (pair, (param, value)) in cmd.params.iter_mut().zip(params) {
            pair.mnem = param.id().into();
            pair.val = (*value).into();
        }
        self.execute(Opcode::Params, &cmd)?;
        Ok(())
    }
}

/// Copies a structure out of the start of `bytes`.
pub(crate) fn decode<C: AsBytes + FromBytes>(bytes: &[u8]) -> Option<C> {
    let bytes = bytes.get(..size_of::<C>())?;
    let mut output = C::new_zeroed();
    output.as_bytes_mut().copy_from_slice(bytes);
    Some(output)
}

/// Extracts the return value from the second word of a reply.
pub(crate) fn retval_of(reply: &[u8]) -> Option<FwRetval> {
    let word = reply.get(4..8)?;
    let code = ((u32::from_be_bytes([word[0], word[1], word[2], word[3]]) >> RETVAL_SHIFT) & 0xff) as u8;
    if code == 0 {
        None
    } else {
        Some(FwRetval::from_code(code))
    }
}

#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mnemonic {
    Dev = 1,
    Pfvf = 2,
    Dmaq = 4,
}

/// Device-wide parameters.
#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DevParam {
    PortVec = 0x00,
    Cclk = 0x01,
    FwRev = 0x0b,
    TpRev = 0x0c,
    Ntid = 0x14,
    UlptxMemwriteDsgl = 0x17,
    Filter2Wr = 0x1d,
}

/// Per-function parameters.
#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PfvfParam {
    ClipStart = 0x03,
    ClipEnd = 0x04,
    FilterStart = 0x05,
    FilterEnd = 0x06,
    L2tStart = 0x13,
    L2tEnd = 0x14,
    CplFw4MsgEncap = 0x31,
}

/// Per-queue parameters.
#[repr(u8)]
#[derive(Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DmaqParam {
    IqIntCntThresh = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Param {
    Dev(DevParam),
    Pfvf(PfvfParam),
    /// the parameter and the context id of the queue
    Dmaq(DmaqParam, u16),
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParamId {
    pub(crate) mnem: u8,
    pub(crate) x: u8,
    pub(crate) yz: u16,
}

impl Param {
    pub(crate) fn id(self) -> u32 {
        let (mnem, x, yz) = match self {
            Self::Dev(p) => (Mnemonic::Dev, p as u8, 0),
            Self::Pfvf(p) => (Mnemonic::Pfvf, p as u8, 0),
            Self::Dmaq(p, cntxt_id) => (Mnemonic::Dmaq, p as u8, cntxt_id),
        };
        let id = ParamId::new()
            .with_mnem(mnem as u8)
            .with_x(x)
            .with_yz(yz);
        u32::from_be_bytes(id.into_bytes())
    }

    /// The inverse of [`Param::id`].
    pub(crate) fn from_id(id: u32) -> Option<Self> {
        let id = ParamId::from_bytes(id.to_be_bytes());
        match Mnemonic::from_repr(id.mnem())? {
            Mnemonic::Dev => DevParam::from_repr(id.x()).map(Self::Dev),
            Mnemonic::Pfvf => PfvfParam::from_repr(id.x()).map(Self::Pfvf),
            Mnemonic::Dmaq => DmaqParam::from_repr(id.x()).map(|p| Self::Dmaq(p, id.yz())),
        }
    }
}

#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct ParamPair {
    pub(crate) mnem: U32<BigEndian>,
    pub(crate) val: U32<BigEndian>,
}

#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct ParamsCommand {
    pub(crate) op_to_vfn: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    pub(crate) params: [ParamPair; 7],
}

impl ParamsCommand {
    fn new(pf: u8, flags: CmdFlags) -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.op_to_vfn = op_header(Opcode::Params, flags, pfn_vfn(pf, 0));
        cmd.retval_len16 = len16::<Self>().into();
        cmd
    }
}

/// A command that consists of nothing but its header.
#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct SimpleCommand {
    pub(crate) op_to_write: U32<BigEndian>,
    pub(crate) retval_len16: U32<BigEndian>,
    _reserved: [u8; 8],
}

impl SimpleCommand {
    pub(crate) fn new(opcode: Opcode, flags: CmdFlags) -> Self {
        let mut cmd = Self::new_zeroed();
        cmd.op_to_write = op_header(opcode, flags, 0);
        cmd.retval_len16 = len16::<Self>().into();
        cmd
    }
}
