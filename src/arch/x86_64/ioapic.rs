//! # I/O APIC Redirection
//!
//! Drives one or more I/O APICs discovered via the MADT, routing legacy ISA
//! IRQ lines (keyboard, PIT, serial, ...) and PCI-routed GSIs to interrupt
//! vectors delivered to a chosen local APIC.
//!
//! ## Register Access
//!
//! The I/O APIC exposes only two memory-mapped registers: an index register
//! (`IOREGSEL`) and a data window (`IOWIN`). Every other register --
//! identification, version, and the 24 redirection table entries -- is
//! accessed indirectly by writing its index to `IOREGSEL` and then reading or
//! writing `IOWIN`.
//!
//! Each redirection table entry is 64 bits wide, split across two consecutive
//! indices (low dword at `0x10 + 2*n`, high dword at `0x10 + 2*n + 1`).

use core::ptr::{read_volatile, write_volatile};
use x86_64::VirtAddr;

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_REDTBL_BASE: u32 = 0x10;

/// Redirection entry delivery mode (bits 10:8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Nmi = 0b100,
    ExtInt = 0b111,
}

/// A single I/O APIC, mapped at its MADT-reported MMIO address.
pub struct IoApic {
    base: VirtAddr,
    id: u8,
    gsi_base: u32,
    redirection_entries: u8,
}

impl IoApic {
    /// # Safety
    /// `base` must be the virtual address of a valid I/O APIC's MMIO window.
    pub unsafe fn new(base: VirtAddr, id: u8, gsi_base: u32) -> Self {
        let mut ioapic = Self { base, id, gsi_base, redirection_entries: 0 };
        let version = ioapic.read_reg(REG_VERSION);
        ioapic.redirection_entries = ((version >> 16) & 0xFF) as u8 + 1;
        ioapic
    }

    unsafe fn read_reg(&self, reg: u32) -> u32 {
        write_volatile((self.base.as_u64() + IOREGSEL as u64) as *mut u32, reg);
        read_volatile((self.base.as_u64() + IOWIN as u64) as *const u32)
    }

    unsafe fn write_reg(&self, reg: u32, value: u32) {
        write_volatile((self.base.as_u64() + IOREGSEL as u64) as *mut u32, reg);
        write_volatile((self.base.as_u64() + IOWIN as u64) as *mut u32, value);
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    pub fn redirection_entries(&self) -> u8 {
        self.redirection_entries
    }

    /// Does this I/O APIC own global system interrupt `gsi`?
    pub fn owns_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.redirection_entries as u32
    }

    /// Route `gsi` to `vector` on the local APIC identified by `dest_apic_id`.
    ///
    /// `active_low` and `level_triggered` capture the MADT interrupt-source
    /// override flags for ISA IRQs; PCI GSIs are conventionally level/low.
    ///
    /// # Safety
    /// `vector` must be a free vector the local IDT has a handler installed
    /// for.
    pub unsafe fn route(
        &self,
        gsi: u32,
        vector: u8,
        dest_apic_id: u8,
        mode: DeliveryMode,
        active_low: bool,
        level_triggered: bool,
        masked: bool,
    ) {
        debug_assert!(self.owns_gsi(gsi));
        let pin = gsi - self.gsi_base;
        let reg = REG_REDTBL_BASE + pin * 2;

        let mut low = vector as u32;
        low |= (mode as u32) << 8;
        if active_low {
            low |= 1 << 13;
        }
        if level_triggered {
            low |= 1 << 15;
        }
        if masked {
            low |= 1 << 16;
        }

        let high = (dest_apic_id as u32) << 24;

        // Mask first, then program both halves, per the "write high, then low"
        // ordering required when an entry transitions unmasked -> masked -> new target.
        self.write_reg(reg, low | (1 << 16));
        self.write_reg(reg + 1, high);
        self.write_reg(reg, low);
    }

    pub unsafe fn mask(&self, gsi: u32) {
        let pin = gsi - self.gsi_base;
        let reg = REG_REDTBL_BASE + pin * 2;
        let low = self.read_reg(reg);
        self.write_reg(reg, low | (1 << 16));
    }

    pub unsafe fn unmask(&self, gsi: u32) {
        let pin = gsi - self.gsi_base;
        let reg = REG_REDTBL_BASE + pin * 2;
        let low = self.read_reg(reg);
        self.write_reg(reg, low & !(1 << 16));
    }
}

static IOAPICS: spin::Mutex<alloc::vec::Vec<IoApic>> = spin::Mutex::new(alloc::vec::Vec::new());

/// Discover I/O APICs from the ACPI MADT and bring them up. Must run after
/// `acpi::init` and after the physical linear map is available, since each
/// I/O APIC's MMIO window is reached through it rather than identity mapping.
///
/// # Safety
/// Must be called once, after `mm::init` has established the linear map.
pub unsafe fn init() -> Result<(), &'static str> {
    let entries = crate::arch::x86_64::acpi::io_apics();
    if entries.is_empty() {
        return Err("no I/O APIC entries in MADT");
    }

    let mut ioapics = IOAPICS.lock();
    for entry in entries {
        let phys = x86_64::PhysAddr::new(entry.address as u64);
        let virt = crate::mm::paging::phys_to_virt(phys);
        let ioapic = IoApic::new(virt, entry.id, entry.gsi_base);
        crate::info!("ioapic {} covers gsi {}..{}", entry.id, entry.gsi_base, entry.gsi_base as usize + ioapic.redirection_entries() as usize);
        ioapics.push(ioapic);
    }

    Ok(())
}

/// Routes ISA IRQ `irq` (0-15) to `vector` on `dest_apic_id`, honoring any
/// MADT interrupt-source override for that IRQ (some platforms rewire IRQ 0
/// or the ACPI SCI to a different GSI, or invert its polarity/trigger mode).
///
/// # Safety
/// See [`IoApic::route`].
pub unsafe fn route_isa_irq(irq: u8, vector: u8, dest_apic_id: u8, masked: bool) -> Result<(), &'static str> {
    let mut gsi = irq as u32;
    let mut active_low = false;
    let mut level_triggered = false;

    for over in crate::arch::x86_64::acpi::interrupt_overrides() {
        if over.bus_irq == irq {
            gsi = over.gsi;
            active_low = over.flags & 0b11 == 0b11;
            level_triggered = (over.flags >> 2) & 0b11 == 0b11;
            break;
        }
    }

    let ioapics = IOAPICS.lock();
    let ioapic = ioapics.iter().find(|a| a.owns_gsi(gsi)).ok_or("no I/O APIC owns this GSI")?;
    ioapic.route(gsi, vector, dest_apic_id, DeliveryMode::Fixed, active_low, level_triggered, masked);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owns_gsi_checks_range() {
        let ioapic = IoApic { base: VirtAddr::new(0), id: 0, gsi_base: 8, redirection_entries: 4 };
        assert!(!ioapic.owns_gsi(7));
        assert!(ioapic.owns_gsi(8));
        assert!(ioapic.owns_gsi(11));
        assert!(!ioapic.owns_gsi(12));
    }
}
