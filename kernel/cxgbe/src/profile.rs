//! Deciding how many queue sets each port gets.

use alloc::vec::Vec;

use crate::{
    coalesce::CoalescingTables,
    fw::PfResources,
    port::PortCapabilities,
    sge::ResponseQueue,
};

/// Upper limit of Ethernet queue sets per adapter.
pub const MAX_ETH_QSETS: u16 = 64;

const DEFAULT_HOLDOFF_US: u32 = 5;
const DEFAULT_HOLDOFF_COUNT: u32 = 32;
const RXQ_SIZE: u16 = 1024;
const IQE_LEN: u16 = 64;
const FL_SIZE: u16 = 1024;
const TXQ_SIZE: u16 = 1024;
const FW_EVTQ_SIZE: u16 = 1024;

/// Figure out how many queue sets the provisioned resources allow.
///
/// One ingress queue is needed for firmware events, and every queue set
/// needs two egress contexts (its free list and its TX queue).
pub(crate) fn configure_max_ethqsets(pfres: &PfResources) -> u16 {
    let mut ethqsets = pfres.niqflint.saturating_sub(1);
    if pfres.neq < ethqsets * 2 {
        ethqsets = pfres.neq / 2;
    }
    ethqsets.min(u32::from(MAX_ETH_QSETS)) as u16
}

/// What the planner needs to know about a port.
#[derive(Debug, Clone, Copy)]
pub struct PortProfile {
    pub caps: PortCapabilities,
    pub rss_size: u16,
}

impl PortProfile {
    /// Ports that can do at least 1G get more than one queue set.
    fn is_fast(&self) -> bool {
        self.caps.intersects(PortCapabilities::SPEED_1G | PortCapabilities::HIGH_SPEEDS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortQueues {
    pub first_qset: u16,
    pub n_rx_qsets: u16,
    pub n_tx_qsets: u16,
    /// The RSS table matches the queue sets.
    pub(crate) rss_done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthRxQueue {
    pub rspq: ResponseQueue,
    pub fl_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTxQueue {
    pub size: u16,
}

/// The queue layout of an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSetPlan {
    max_ethqsets: u16,
    configured: bool,
    ports: Vec<PortQueues>,
    ethrxq: Vec<EthRxQueue>,
    ethtxq: Vec<EthTxQueue>,
    fw_evtq: ResponseQueue,
}

impl QueueSetPlan {
    pub fn new(max_ethqsets: u16) -> Self {
        Self {
            max_ethqsets,
            configured: false,
            ports: Vec::new(),
            ethrxq: Vec::new(),
            ethtxq: Vec::new(),
            fw_evtq: ResponseQueue::new(&CoalescingTables::default(), 0, 0, FW_EVTQ_SIZE, IQE_LEN),
        }
    }

    /// Spread the queue sets over the ports.
    ///
    /// Only the first call does anything; returns whether it was that one.
    pub fn configure(&mut self, ports: &[PortProfile], cores: u16, tables: &CoalescingTables) -> bool {
        if self.configured {
            return false;
        }
        let nports = ports.len() as u16;
        let fast_ports = ports.iter().filter(|p| p.is_fast()).count() as u16;

        // slow ports get one queue set each, the fast ones share the rest
        let mut q_per_port = 0;
        if fast_ports > 0 {
            q_per_port = self.max_ethqsets.saturating_sub(nports - fast_ports) / fast_ports;
        }
        q_per_port = q_per_port.min(cores);

        let mut qidx = 0;
        self.ports = ports
            .iter()
            .map(|port| {
                let n = if port.is_fast() { q_per_port } else { 1 }.min(port.rss_size);
                let queues = PortQueues {
                    first_qset: qidx,
                    n_rx_qsets: n,
                    n_tx_qsets: n,
                    rss_done: false,
                };
                qidx += n;
                queues
            })
            .collect();
        debug!("queue sets per fast port: {q_per_port}, plan: {:?}", self.ports);

        let count = usize::from(self.max_ethqsets);
        self.ethrxq = (0..count)
            .map(|_| EthRxQueue {
                rspq: ResponseQueue::new(tables, DEFAULT_HOLDOFF_US, DEFAULT_HOLDOFF_COUNT, RXQ_SIZE, IQE_LEN),
                fl_size: FL_SIZE,
            })
            .collect();
        self.ethtxq = (0..count).map(|_| EthTxQueue { size: TXQ_SIZE }).collect();
        self.fw_evtq = ResponseQueue::new(tables, 0, 0, FW_EVTQ_SIZE, IQE_LEN);
        self.configured = true;
        true
    }

    /// Apply the queue counts the framework asked for.
    pub fn set_queue_count(
        &mut self, port: usize, nb_rx: u16, nb_tx: u16, rss_size: u16,
    ) -> Result<(), &'static str> {
        let nports = self.ports.len() as u16;
        let queues = self.ports.get_mut(port).ok_or("no such port")?;
        if nb_rx < 1 || nb_tx < 1 {
            return Err("at least one RX and one TX queue are needed");
        }
        let max_queues = self.max_ethqsets / nports;
        if nb_rx > max_queues || nb_tx > max_queues {
            return Err("more queues than the port's share");
        }
        if nb_rx > rss_size {
            return Err("more RX queues than RSS table entries");
        }
        // the RSS table has to follow
        queues.rss_done = false;
        queues.n_rx_qsets = nb_rx;
        queues.n_tx_qsets = nb_tx;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn max_ethqsets(&self) -> u16 {
        self.max_ethqsets
    }

    pub fn port(&self, port: usize) -> Option<&PortQueues> {
        self.ports.get(port)
    }

    pub(crate) fn port_mut(&mut self, port: usize) -> Option<&mut PortQueues> {
        self.ports.get_mut(port)
    }

    pub fn ports(&self) -> &[PortQueues] {
        &self.ports
    }

    pub fn rx_queue(&self, qidx: usize) -> Option<&EthRxQueue> {
        self.ethrxq.get(qidx)
    }

    pub(crate) fn rx_queue_mut(&mut self, qidx: usize) -> Option<&mut EthRxQueue> {
        self.ethrxq.get_mut(qidx)
    }

    /// The RX queues of a port.
    pub fn port_rx_queues(&self, port: usize) -> &[EthRxQueue] {
        let Some(queues) = self.ports.get(port) else {
            return &[];
        };
        let first = usize::from(queues.first_qset);
        let end = (first + usize::from(queues.n_rx_qsets)).min(self.ethrxq.len());
        self.ethrxq.get(first..end).unwrap_or(&[])
    }

    pub fn tx_queue(&self, qidx: usize) -> Option<&EthTxQueue> {
        self.ethtxq.get(qidx)
    }

    pub fn fw_evtq(&self) -> &ResponseQueue {
        &self.fw_evtq
    }

    pub(crate) fn fw_evtq_mut(&mut self) -> &mut ResponseQueue {
        &mut self.fw_evtq
    }
}
