use crate::ne_error::NeError;
use crate::ne_header::{imported_name_at, NeModule, SegmentFlags};
use crate::seg_addr::SegAddr;
use crate::segment_loader::LoadedSegment;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

// Address types: which bytes at the patch site are touched and how.
pub const ADDR_LOW_BYTE: u8 = 0;
pub const ADDR_SELECTOR16: u8 = 2;
pub const ADDR_POINTER32: u8 = 3;
// Patched exactly like a selector; linkers emit both codes.
pub const ADDR_SEGMENT16: u8 = 4;
pub const ADDR_OFFSET16: u8 = 5;
pub const ADDR_OFFSET32: u8 = 13;

const RELOC_KIND_MASK: u8 = 0x03;
const RELOC_ADDITIVE: u8 = 0x04;
pub const RELOCATION_RECORD_BYTES: usize = 8;

// Chain terminators for the non-additive (linked list) convention.
const CHAIN_END_NARROW: usize = 0xff;
const CHAIN_END_WIDE: usize = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
	Internal,
	ImportOrdinal,
	ImportName,
	/// Operating-system fixup; carried in the file but never patched here.
	OsFixup,
}

impl RelocationKind {
	fn from_type_byte(type_byte: u8) -> RelocationKind {
		match type_byte & RELOC_KIND_MASK {
			0 => RelocationKind::Internal,
			1 => RelocationKind::ImportOrdinal,
			2 => RelocationKind::ImportName,
			_ => RelocationKind::OsFixup,
		}
	}
}

/// One fixed 8-byte relocation record. With the additive flag clear the
/// target offset heads an in-place chain of patch sites; with it set the
/// target is a single site whose bytes the value is added to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationRecord {
	pub address_type: u8,
	pub kind: RelocationKind,
	pub additive: bool,
	pub target_offset: u16,
	pub ref1: u16,
	pub ref2: u16,
}

impl RelocationRecord {
	fn parse(record: &[u8]) -> RelocationRecord {
		RelocationRecord {
			address_type: record[0],
			kind: RelocationKind::from_type_byte(record[1]),
			additive: record[1] & RELOC_ADDITIVE != 0,
			target_offset: LittleEndian::read_u16(&record[2..]),
			ref1: LittleEndian::read_u16(&record[4..]),
			ref2: LittleEndian::read_u16(&record[6..]),
		}
	}
}

/// The relocation records belonging to one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRelocationTable {
	/// 0-based index of the segment the records patch.
	pub segment: usize,
	pub records: Vec<RelocationRecord>,
}

/// An import reference carried by a relocation record: either an ordinal in
/// the referenced module, or a byte offset into the imported-names table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportRef {
	Ordinal(u16),
	NameOffset(u16),
}

/// Resolves imports for the relocation engine. The module reference index
/// selects the target module (via the module-reference table); the engine
/// passes the imported-names table through so name offsets can be decoded.
/// None means the import could not be resolved.
///
/// Implemented for any suitable closure.
pub trait ImportResolver {
	fn resolve(&mut self, module_ref: u16, import: ImportRef, imported_names: &[u8])
		-> Option<SegAddr>;
}

impl<F> ImportResolver for F
where
	F: FnMut(u16, ImportRef, &[u8]) -> Option<SegAddr>,
{
	fn resolve(
		&mut self,
		module_ref: u16,
		import: ImportRef,
		imported_names: &[u8],
	) -> Option<SegAddr> {
		self(module_ref, import, imported_names)
	}
}

/// Read the relocation block that follows each relocatable segment's data:
/// a 2-byte record count, then the fixed 8-byte records. Segments without
/// the descriptor flag, without file data, or with a zero count get no table.
pub fn parse_relocations(
	file: &[u8],
	module: &NeModule,
) -> Result<Vec<SegmentRelocationTable>, NeError> {
	let shift = module.header.align_shift();
	let mut tables = Vec::new();

	for (index, descriptor) in module.segments.iter().enumerate() {
		if !descriptor.flags.contains(SegmentFlags::HAS_RELOCATIONS)
			|| descriptor.sector_offset == 0
		{
			continue;
		}
		let block_offset = descriptor
			.file_offset(shift)
			.checked_add(descriptor.byte_length())
			.ok_or(NeError::TruncatedRelocationBlock(file.len()))?;
		if block_offset + 2 > file.len() {
			return Err(NeError::TruncatedRelocationBlock(block_offset));
		}
		let count = LittleEndian::read_u16(&file[block_offset..]) as usize;
		if count == 0 {
			continue;
		}
		let records_start = block_offset + 2;
		let records_end = records_start
			.checked_add(count * RELOCATION_RECORD_BYTES)
			.ok_or(NeError::TruncatedRelocationBlock(records_start))?;
		if records_end > file.len() {
			return Err(NeError::TruncatedRelocationBlock(records_start));
		}

		let records = file[records_start..records_end]
			.chunks_exact(RELOCATION_RECORD_BYTES)
			.map(RelocationRecord::parse)
			.collect::<Vec<_>>();
		debug!("segment {}: {} relocation records", index + 1, records.len());
		tables.push(SegmentRelocationTable { segment: index, records });
	}
	Ok(tables)
}

/// Patch every relocation record into the loaded segment buffers. Imported
/// references go through the caller's resolver; internal references use the
/// 1-based segment number carried by the record itself. On error, patches
/// already applied stay applied; the caller aborts the whole module load.
pub fn apply_relocations(
	segments: &mut [LoadedSegment],
	tables: &[SegmentRelocationTable],
	imported_names: &[u8],
	mut resolver: Option<&mut dyn ImportResolver>,
) -> Result<(), NeError> {
	let segment_count = segments.len();

	for table in tables {
		if table.segment >= segment_count {
			return Err(NeError::BadRelocationTarget {
				segment: table.segment as u16 + 1,
				offset: 0,
			});
		}
		for record in table.records.iter() {
			let value = match record.kind {
				RelocationKind::Internal => {
					let number = record.ref1;
					if number == 0 || number as usize > segment_count {
						return Err(NeError::BadRelocationTarget {
							segment: number,
							offset: record.ref2,
						});
					}
					SegAddr::new(number - 1, record.ref2)
				}
				RelocationKind::ImportOrdinal => {
					resolve_import(
						&mut resolver,
						record.ref1,
						ImportRef::Ordinal(record.ref2),
						imported_names,
					)?
				}
				RelocationKind::ImportName => {
					resolve_import(
						&mut resolver,
						record.ref1,
						ImportRef::NameOffset(record.ref2),
						imported_names,
					)?
				}
				RelocationKind::OsFixup => continue,
			};
			trace!(
				"segment {}: type 0x{:02x} at 0x{:04x} -> {}:0x{:04x}",
				table.segment + 1,
				record.address_type,
				record.target_offset,
				value.segment_number(),
				value.offset
			);
			apply_record(table.segment, &mut segments[table.segment], record, value)?;
		}
	}
	Ok(())
}

fn resolve_import(
	resolver: &mut Option<&mut dyn ImportResolver>,
	module_ref: u16,
	import: ImportRef,
	imported_names: &[u8],
) -> Result<SegAddr, NeError> {
	let unresolved = || {
		let what = match import {
			ImportRef::Ordinal(ordinal) => {
				format!("module ref {} ordinal {}", module_ref, ordinal)
			}
			ImportRef::NameOffset(offset) => match imported_name_at(imported_names, offset) {
				Some(name) => format!(
					"module ref {} name {}",
					module_ref,
					String::from_utf8_lossy(name)
				),
				None => format!("module ref {} name offset 0x{:x}", module_ref, offset),
			},
		};
		NeError::UnresolvedImport(what)
	};
	match resolver {
		Some(resolver) => resolver
			.resolve(module_ref, import, imported_names)
			.ok_or_else(unresolved),
		None => Err(unresolved()),
	}
}

fn apply_record(
	segment_index: usize,
	segment: &mut LoadedSegment,
	record: &RelocationRecord,
	value: SegAddr,
) -> Result<(), NeError> {
	// Errors report the 1-based number of the segment being patched.
	let patched_segment = segment_index as u16 + 1;
	let buffer = &mut segment.data[..];
	let segment_word = value.segment_number();
	let offset_word = value.offset;

	match record.address_type {
		ADDR_LOW_BYTE => {
			if record.additive {
				let site = checked_site(patched_segment, buffer.len(), record.target_offset, 1)?;
				buffer[site] = buffer[site].wrapping_add(offset_word as u8);
			} else {
				walk_chain(patched_segment, buffer, record.target_offset, 1, true, |buf, site| {
					buf[site] = offset_word as u8;
				})?;
			}
		}
		ADDR_SELECTOR16 | ADDR_SEGMENT16 => {
			patch_word(patched_segment, buffer, record, segment_word)?;
		}
		ADDR_OFFSET16 => {
			patch_word(patched_segment, buffer, record, offset_word)?;
		}
		ADDR_POINTER32 => {
			if record.additive {
				let site = checked_site(patched_segment, buffer.len(), record.target_offset, 4)?;
				add_word(buffer, site, offset_word);
				add_word(buffer, site + 2, segment_word);
			} else {
				walk_chain(patched_segment, buffer, record.target_offset, 4, false, |buf, site| {
					LittleEndian::write_u16(&mut buf[site..], offset_word);
					LittleEndian::write_u16(&mut buf[site + 2..], segment_word);
				})?;
			}
		}
		ADDR_OFFSET32 => {
			if record.additive {
				// Only the low word takes part in additive application.
				let site = checked_site(patched_segment, buffer.len(), record.target_offset, 4)?;
				add_word(buffer, site, offset_word);
			} else {
				walk_chain(patched_segment, buffer, record.target_offset, 4, false, |buf, site| {
					LittleEndian::write_u16(&mut buf[site..], offset_word);
					LittleEndian::write_u16(&mut buf[site + 2..], 0);
				})?;
			}
		}
		other => return Err(NeError::UnsupportedAddressType(other)),
	}
	Ok(())
}

fn patch_word(
	patched_segment: u16,
	buffer: &mut [u8],
	record: &RelocationRecord,
	word: u16,
) -> Result<(), NeError> {
	if record.additive {
		let site = checked_site(patched_segment, buffer.len(), record.target_offset, 2)?;
		add_word(buffer, site, word);
	} else {
		walk_chain(patched_segment, buffer, record.target_offset, 2, false, |buf, site| {
			LittleEndian::write_u16(&mut buf[site..], word);
		})?;
	}
	Ok(())
}

/// Follow the in-place chain of patch sites starting at `start`. The bytes
/// at each site hold the offset of the next site (one byte for the narrow
/// low-byte encoding, the first two bytes otherwise); the next offset is
/// read before the site is overwritten. Every site is bounds-checked
/// against the segment buffer before it is touched.
fn walk_chain<F>(
	patched_segment: u16,
	buffer: &mut [u8],
	start: u16,
	span: usize,
	narrow: bool,
	mut patch: F,
) -> Result<(), NeError>
where
	F: FnMut(&mut [u8], usize),
{
	let chain_end = if narrow { CHAIN_END_NARROW } else { CHAIN_END_WIDE };
	let mut site = start as usize;
	// A well-formed chain cannot have more links than the buffer has bytes;
	// anything longer is a cycle.
	let mut remaining = buffer.len();
	loop {
		if site + span > buffer.len() || remaining == 0 {
			return Err(NeError::BadRelocationTarget {
				segment: patched_segment,
				offset: site as u16,
			});
		}
		remaining -= 1;
		let next = if narrow {
			buffer[site] as usize
		} else {
			LittleEndian::read_u16(&buffer[site..]) as usize
		};
		patch(buffer, site);
		if next == chain_end {
			break;
		}
		site = next;
	}
	Ok(())
}

fn checked_site(
	patched_segment: u16,
	buffer_len: usize,
	offset: u16,
	span: usize,
) -> Result<usize, NeError> {
	let site = offset as usize;
	if site + span > buffer_len {
		return Err(NeError::BadRelocationTarget { segment: patched_segment, offset });
	}
	Ok(site)
}

fn add_word(buffer: &mut [u8], site: usize, word: u16) {
	let current = LittleEndian::read_u16(&buffer[site..]);
	LittleEndian::write_u16(&mut buffer[site..], current.wrapping_add(word));
}
