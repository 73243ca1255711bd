//! Hand-rolled ACPI table parsing: RSDP, RSDT/XSDT, MADT, HPET.
//!
//! Scoped to exactly what this kernel's interrupt and timer subsystems need.
//! No AML namespace walking, no SRAT/SLIT/DMAR/IVRS/BGRT/MCFG — this kernel
//! has no NUMA, IOMMU, or PCI ECAM support to feed them.

/// Errors that can occur while parsing ACPI tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The checksum of a table or the RSDP did not validate (sum != 0).
    InvalidChecksum,
    /// The table signature did not match the expected value.
    InvalidSignature,
    /// The RSDP structure was invalid (bad signature, revision, or checksum).
    InvalidRsdp,
    /// A table with the requested signature was not found in the RSDT/XSDT.
    TableNotFound,
    /// A table or structure was too short to contain the expected data.
    TruncatedData,
}

/// Maps physical memory regions so ACPI tables can be read.
///
/// An implementation must return a byte slice covering at least `size` bytes
/// starting at physical address `phys`. The kernel's implementation uses the
/// HHDM, but the trait is agnostic to the mapping strategy.
///
/// # Safety
///
/// Implementors must ensure the returned slice is valid and readable for
/// `size` bytes, and remains valid for `'static`.
pub unsafe trait AcpiHandler {
    /// Maps a physical memory region and returns a byte slice over it.
    ///
    /// # Safety
    ///
    /// The caller guarantees `phys` is a valid ACPI-related physical address.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8];
}

/// Standard ACPI System Description Table header (36 bytes), present at the
/// start of every ACPI table.
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    pub const SIZE: usize = 36;

    #[must_use]
    pub fn read_from(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: [data[0], data[1], data[2], data[3]],
            length: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            revision: data[8],
            // data[9] is the checksum byte, validated separately over the whole table.
            oem_id: [data[10], data[11], data[12], data[13], data[14], data[15]],
            oem_table_id: [
                data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
            ],
            oem_revision: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
            creator_id: u32::from_le_bytes([data[28], data[29], data[30], data[31]]),
            creator_revision: u32::from_le_bytes([data[32], data[33], data[34], data[35]]),
        })
    }
}

/// Validates that the sum of all bytes in `data` equals zero, mod 256.
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    let mut sum: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
    }
    sum == 0
}

/// Maps and validates an ACPI table: reads the header to learn the length,
/// checks the signature, remaps the full table, then checksums it.
fn load_table(
    handler: &impl AcpiHandler,
    phys: u64,
    expected_signature: &[u8; 4],
) -> Result<(SdtHeader, &'static [u8]), AcpiError> {
    // SAFETY: caller provides a valid ACPI table physical address.
    let header_data = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
    let header = SdtHeader::read_from(header_data).ok_or(AcpiError::TruncatedData)?;

    if &header.signature != expected_signature {
        return Err(AcpiError::InvalidSignature);
    }

    let total_len = header.length as usize;
    // SAFETY: phys is valid, total_len comes from the validated header.
    let data = unsafe { handler.map_physical_region(phys, total_len) };

    if !validate_checksum(data) {
        return Err(AcpiError::InvalidChecksum);
    }

    Ok((header, data))
}

/// Parses the Root System Description Pointer and returns the RSDT/XSDT
/// physical address plus whether it is an XSDT.
///
/// # Errors
///
/// Returns [`AcpiError::InvalidRsdp`] if the signature, checksum, or
/// revision don't validate.
pub fn parse_rsdp(handler: &impl AcpiHandler, rsdp_phys: u64) -> Result<(u64, bool), AcpiError> {
    // The v1 RSDP is 20 bytes; ACPI 2.0+ extends it to 36 bytes.
    // SAFETY: caller provides a valid RSDP physical address.
    let data = unsafe { handler.map_physical_region(rsdp_phys, 36) };
    if data.len() < 20 {
        return Err(AcpiError::InvalidRsdp);
    }

    if &data[0..8] != b"RSD PTR " {
        return Err(AcpiError::InvalidRsdp);
    }
    if !validate_checksum(&data[0..20]) {
        return Err(AcpiError::InvalidRsdp);
    }

    let revision = data[15];
    if revision == 0 {
        let rsdt_addr = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
        return Ok((u64::from(rsdt_addr), false));
    }

    if data.len() < 36 {
        return Err(AcpiError::InvalidRsdp);
    }
    if !validate_checksum(&data[0..36]) {
        return Err(AcpiError::InvalidRsdp);
    }
    let xsdt_addr = u64::from_le_bytes([
        data[24], data[25], data[26], data[27], data[28], data[29], data[30], data[31],
    ]);
    Ok((xsdt_addr, true))
}

/// Searches the RSDT/XSDT for a table matching `signature`, returning its
/// physical address.
pub fn find_table(
    handler: &impl AcpiHandler,
    rsdt_addr: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
) -> Option<u64> {
    // SAFETY: rsdt_addr was validated by parse_rsdp.
    let header_data = unsafe { handler.map_physical_region(rsdt_addr, SdtHeader::SIZE) };
    let header = SdtHeader::read_from(header_data)?;
    let total_len = header.length as usize;
    let entries_len = total_len.saturating_sub(SdtHeader::SIZE);
    if entries_len == 0 {
        return None;
    }

    // SAFETY: rsdt_addr is valid, total_len comes from the validated header.
    let table_data = unsafe { handler.map_physical_region(rsdt_addr, total_len) };
    let entries = table_data.get(SdtHeader::SIZE..)?;

    let entry_size = if is_xsdt { 8 } else { 4 };
    let mut offset = 0;
    while offset + entry_size <= entries.len() {
        let entry_phys = if is_xsdt {
            u64::from_le_bytes(entries[offset..offset + 8].try_into().ok()?)
        } else {
            u64::from(u32::from_le_bytes(
                entries[offset..offset + 4].try_into().ok()?,
            ))
        };
        // SAFETY: entry_phys is a physical address from the RSDT/XSDT.
        let candidate_data =
            unsafe { handler.map_physical_region(entry_phys, SdtHeader::SIZE) };
        if let Some(candidate) = SdtHeader::read_from(candidate_data) {
            if &candidate.signature == signature {
                return Some(entry_phys);
            }
        }
        offset += entry_size;
    }
    None
}

/// MADT table signature (`b"APIC"`).
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// One interrupt controller structure entry from the MADT.
#[derive(Debug, Clone, Copy)]
pub enum MadtEntry {
    /// Type 0: Processor Local APIC.
    LocalApic { acpi_processor_id: u8, apic_id: u8, flags: u32 },
    /// Type 1: I/O APIC.
    IoApic { io_apic_id: u8, io_apic_address: u32, gsi_base: u32 },
    /// Type 2: Interrupt Source Override.
    InterruptSourceOverride { bus: u8, source: u8, gsi: u32, flags: u16 },
    /// An entry type this kernel does not need (NMI sources, LAPIC NMI, x2APIC, ...).
    Unknown { entry_type: u8 },
}

/// Parsed MADT table.
pub struct Madt {
    pub local_apic_address: u32,
    pub flags: u32,
    entries_data: &'static [u8],
}

impl Madt {
    /// Size of the fixed MADT fields after the SDT header (address + flags).
    const FIELDS_SIZE: usize = 8;

    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidChecksum`] or [`AcpiError::InvalidSignature`]
    /// if the table fails validation, or [`AcpiError::TruncatedData`] if the
    /// fixed fields after the header are missing.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let (_header, data) = load_table(handler, phys, MADT_SIGNATURE)?;

        if data.len() < SdtHeader::SIZE + Self::FIELDS_SIZE {
            return Err(AcpiError::TruncatedData);
        }
        let fields = &data[SdtHeader::SIZE..];
        let local_apic_address = u32::from_le_bytes(fields[0..4].try_into().unwrap());
        let flags = u32::from_le_bytes(fields[4..8].try_into().unwrap());

        let entries_offset = SdtHeader::SIZE + Self::FIELDS_SIZE;
        let entries_data = data.get(entries_offset..).unwrap_or(&[]);

        Ok(Self {
            local_apic_address,
            flags,
            entries_data,
        })
    }

    #[must_use]
    pub fn entries(&self) -> MadtEntryIter<'_> {
        MadtEntryIter {
            data: self.entries_data,
            offset: 0,
        }
    }
}

/// Iterator over [`MadtEntry`] structures in a MADT's entry list.
pub struct MadtEntryIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Iterator for MadtEntryIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        if rest.len() < 2 {
            return None;
        }
        let entry_type = rest[0];
        let len = rest[1] as usize;
        if len < 2 || rest.len() < len {
            return None;
        }
        let entry = &rest[..len];
        self.offset += len;

        let parsed = match entry_type {
            0 if len >= 8 => MadtEntry::LocalApic {
                acpi_processor_id: entry[2],
                apic_id: entry[3],
                flags: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
            },
            1 if len >= 12 => MadtEntry::IoApic {
                io_apic_id: entry[2],
                io_apic_address: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                gsi_base: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
            },
            2 if len >= 10 => MadtEntry::InterruptSourceOverride {
                bus: entry[2],
                source: entry[3],
                gsi: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                flags: u16::from_le_bytes(entry[8..10].try_into().unwrap()),
            },
            other => MadtEntry::Unknown { entry_type: other },
        };
        Some(parsed)
    }
}

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Parsed HPET table (just the base address; this kernel doesn't need the
/// event timer block ID or minimum tick beyond what the driver reads itself
/// from the capabilities register).
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    pub base_address: u64,
}

impl HpetTable {
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidSignature`] or [`AcpiError::InvalidChecksum`]
    /// if validation fails, or [`AcpiError::TruncatedData`] if the generic
    /// address structure is missing.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let (_header, data) = load_table(handler, phys, HPET_SIGNATURE)?;

        // Fixed fields after the SDT header: event_timer_block_id (u32),
        // then a 12-byte Generic Address Structure whose last 8 bytes are
        // the address we need.
        let addr_offset = SdtHeader::SIZE + 4 + 4;
        if data.len() < addr_offset + 8 {
            return Err(AcpiError::TruncatedData);
        }
        let base_address = u64::from_le_bytes(data[addr_offset..addr_offset + 8].try_into().unwrap());
        Ok(Self { base_address })
    }
}
