//! Port block allocation.
//!
//! A block is handed out only when none of its ports is reserved in the
//! registry and none is already bound on this host. The registry watermark
//! only moves forward: ports released by `remove` are not handed out again.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::config::PortConfig;
use crate::error::FleetError;
use crate::registry::{PortBlock, Registry};

/// Answers whether a host port is currently free.
pub(crate) trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on all interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }
}

/// Find the next acceptable block, reserve nothing, and advance the
/// registry watermark past it.
///
/// The caller inserts the sandbox in the same registry mutation so the
/// reservation and the record are committed together.
pub(crate) fn allocate_block(
    registry: &mut Registry,
    policy: &PortConfig,
    probe: &dyn PortProbe,
) -> Result<PortBlock, FleetError> {
    let start = registry.next_candidate_port.max(policy.base);
    let step = policy.step.max(1);
    let exhausted = || FleetError::PortExhaustion {
        start,
        end: policy.max,
    };

    let mut candidate = start;
    loop {
        let block = PortBlock::new(candidate).ok_or_else(exhausted)?;
        if block.last() > policy.max {
            return Err(exhausted());
        }

        if let Some(port) = block.ports().find(|port| registry.is_port_reserved(*port)) {
            debug!(candidate, port, "Port block overlaps a registered sandbox");
        } else if let Some(port) = block.ports().find(|port| !probe.is_free(*port)) {
            debug!(candidate, port, "Port block has a port already bound on this host");
        } else {
            registry.next_candidate_port = candidate.saturating_add(step);
            return Ok(block);
        }

        candidate = candidate.checked_add(step).ok_or_else(exhausted)?;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticProbe;
    use super::*;
    use crate::registry::{sandbox_fixture, SandboxStatus};
    use proptest::prelude::*;

    fn take_block(registry: &mut Registry, id: &str, probe: &StaticProbe) -> PortBlock {
        let block = allocate_block(registry, &PortConfig::default(), probe).unwrap();
        registry.insert(sandbox_fixture(id, block.base, SandboxStatus::Running));
        block
    }

    #[test]
    fn test_first_blocks_follow_step() {
        let mut registry = Registry::default();
        let probe = StaticProbe::all_free();

        assert_eq!(take_block(&mut registry, "a", &probe).base, 50100);
        assert_eq!(take_block(&mut registry, "b", &probe).base, 50110);
        assert_eq!(take_block(&mut registry, "c", &probe).base, 50120);
        assert_eq!(registry.next_candidate_port, 50130);
    }

    #[test]
    fn test_skips_blocks_with_bound_ports() {
        let mut registry = Registry::default();
        let probe = StaticProbe::busy([50104, 50115]);

        let block = allocate_block(&mut registry, &PortConfig::default(), &probe).unwrap();
        assert_eq!(block.base, 50120);
        assert_eq!(registry.next_candidate_port, 50130);
    }

    #[test]
    fn test_skips_blocks_reserved_in_registry() {
        let mut registry = Registry::default();
        registry.insert(sandbox_fixture("legacy", 50110, SandboxStatus::Stopped));
        registry.next_candidate_port = 50110;

        let block = allocate_block(&mut registry, &PortConfig::default(), &StaticProbe::all_free())
            .unwrap();
        assert_eq!(block.base, 50120);
    }

    #[test]
    fn test_watermark_never_rewinds_after_removal() {
        let mut registry = Registry::default();
        let probe = StaticProbe::all_free();
        take_block(&mut registry, "a", &probe);
        registry.remove("a");

        assert_eq!(take_block(&mut registry, "b", &probe).base, 50110);
    }

    #[test]
    fn test_exhaustion_when_range_is_used_up() {
        let policy = PortConfig {
            base: 50100,
            step: 10,
            max: 50126,
        };
        let mut registry = Registry::default();
        let probe = StaticProbe::all_free();

        allocate_block(&mut registry, &policy, &probe).unwrap();
        allocate_block(&mut registry, &policy, &probe).unwrap();
        allocate_block(&mut registry, &policy, &probe).unwrap();
        let err = allocate_block(&mut registry, &policy, &probe).unwrap_err();
        assert!(matches!(err, FleetError::PortExhaustion { end: 50126, .. }));
    }

    #[test]
    fn test_exhaustion_near_top_of_port_space() {
        let policy = PortConfig {
            base: 65530,
            step: 10,
            max: u16::MAX,
        };
        let mut registry = Registry::default();
        let err = allocate_block(&mut registry, &policy, &StaticProbe::all_free()).unwrap_err();
        assert!(matches!(err, FleetError::PortExhaustion { .. }));
    }

    #[test]
    fn test_tcp_probe_sees_bound_listener() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!TcpProbe.is_free(port));
    }

    proptest! {
        #[test]
        fn prop_allocated_blocks_are_disjoint(
            count in 1usize..30,
            busy in proptest::collection::hash_set(50100u16..50500, 0..40),
        ) {
            let mut registry = Registry::default();
            let probe = StaticProbe::busy(busy.iter().copied());

            for i in 0..count {
                let block = allocate_block(&mut registry, &PortConfig::default(), &probe).unwrap();
                prop_assert!(block.ports().all(|p| probe.is_free(p)));
                registry.insert(sandbox_fixture(&format!("sbx-{i}"), block.base, SandboxStatus::Running));
            }

            prop_assert_eq!(registry.port_allocation.len(), count * 7);
            prop_assert!(registry.validate().is_ok());
        }
    }
}
