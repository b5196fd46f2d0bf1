//! Shared harness: arena + simulated remote + host transport.

#![allow(dead_code)]

use std::sync::Arc;

use vclink::{ImportTable, SimConfig, SimRemote, SlotArena, TransportConfig, TransportContext};

pub struct Stack {
    pub arena: Arc<SlotArena>,
    pub imports: Arc<ImportTable>,
    pub remote: SimRemote,
    pub transport: Arc<TransportContext>,
}

pub fn stack(transport_cfg: TransportConfig, sim_cfg: SimConfig) -> Stack {
    let arena = SlotArena::with_capacity(transport_cfg.region_bytes).unwrap();
    let imports = ImportTable::new();
    let remote = SimRemote::spawn(Arc::clone(&arena), Arc::clone(&imports), sim_cfg);
    let transport = TransportContext::start(Arc::clone(&arena), transport_cfg);
    Stack {
        arena,
        imports,
        remote,
        transport,
    }
}

/// Transport config with bounds tight enough that a hung test fails fast.
pub fn fast_transport() -> TransportConfig {
    TransportConfig {
        connect_timeout_ms: 1_000,
        open_timeout_ms: 1_000,
        rpc_timeout_ms: 2_000,
        ..TransportConfig::default()
    }
}
