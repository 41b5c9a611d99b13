use pnet::util::MacAddr;

use crate::common::{canonical_mac, parse_raw_mac};
use crate::error::ScanError;
use crate::hypervisor::InventoryProvider;

/// One VM and its adapter address, consumed straight into a registry build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub name: String,
    pub mac: MacAddr,
}

/// Lists every VM with a usable adapter MAC, in hypervisor order.
///
/// Only enumeration itself is fatal. A VM whose MAC cannot be queried or
/// parsed is left out and the scan carries on.
pub fn scan<P: InventoryProvider + ?Sized>(provider: &P) -> Result<Vec<VmRecord>, ScanError> {
    log::info!("listing virtual machines");
    let names = provider.vm_names().map_err(ScanError::Enumerate)?;
    if names.is_empty() {
        log::info!("no virtual machines found");
        return Ok(Vec::new());
    }
    log::info!("found VM names: {:?}", names);

    let mut records = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            log::debug!("skipping empty VM name");
            continue;
        }

        let raw = match provider.adapter_mac(name) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("skipping VM '{}': MAC query failed: {}", name, e);
                continue;
            }
        };
        let mac = match parse_raw_mac(&raw) {
            Ok(mac) => mac,
            Err(e) => {
                log::warn!("skipping VM '{}': {}", name, e);
                continue;
            }
        };

        log::info!("VM '{}' has MAC {}", name, canonical_mac(&mac));
        records.push(VmRecord { name: name.to_string(), mac });
    }

    log::info!("total VMs with usable MAC: {}", records.len());
    Ok(records)
}
