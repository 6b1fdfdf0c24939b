use crate::ne_error::NeError;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

// https://wiki.osdev.org/NE
// http://www.fileformat.info/format/exe/corion-ne.htm

pub const MZ_SIGNATURE: u16 = 0x5a4d;
pub const NE_SIGNATURE: u16 = 0x454e;
// The MZ stub prefix and the NE header are both 64 bytes.
pub const MZ_STUB_BYTES: usize = 64;
pub const NE_HEADER_BYTES: usize = 64;
pub const SEGMENT_DESCRIPTOR_BYTES: usize = 8;
// File offset of the embedded-header pointer inside the MZ stub.
const NE_OFFSET_FIELD: usize = 0x3c;

/// The outer DOS stub header. Only the signature and the pointer to the
/// embedded NE header matter to the loader; the stub program in between is
/// never executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MzStub {
	pub signature: u16,
	pub ne_header_offset: u32,
}

impl MzStub {
	pub fn parse(data: &[u8]) -> Result<MzStub, NeError> {
		if data.len() < MZ_STUB_BYTES {
			return Err(NeError::NotMzExecutable);
		}
		let signature = LittleEndian::read_u16(&data[0..]);
		if signature != MZ_SIGNATURE {
			return Err(NeError::NotMzExecutable);
		}
		let ne_header_offset = LittleEndian::read_u32(&data[NE_OFFSET_FIELD..]);
		Ok(MzStub { signature, ne_header_offset })
	}
}

/// The embedded NE header, 64 bytes. Table offsets are relative to the start
/// of this header within the file, except for the non-resident name table
/// which is an absolute file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeHeader {
	pub signature: u16,
	pub linker_version: u8,
	pub linker_revision: u8,
	pub entry_table_offset: u16,
	pub entry_table_length: u16,
	pub file_crc: u32,
	pub program_flags: u8,
	pub application_flags: u8,
	pub auto_data_segment: u16,
	pub initial_heap_size: u16,
	pub initial_stack_size: u16,
	// Entry point as offset then 1-based segment number (IP then CS).
	pub entry_point_offset: u16,
	pub entry_point_segment: u16,
	pub initial_sp: u16,
	pub initial_ss: u16,
	pub segment_count: u16,
	pub module_reference_count: u16,
	pub non_resident_name_table_size: u16,
	pub segment_table_offset: u16,
	pub resource_table_offset: u16,
	pub resident_name_table_offset: u16,
	pub module_reference_table_offset: u16,
	pub imported_names_table_offset: u16,
	pub non_resident_name_table_offset: u32,
	pub movable_entry_count: u16,
	pub alignment_shift: u16,
	pub resource_count: u16,
	pub target_os: u8,
	pub extended_flags: u8,
	pub return_thunk_offset: u16,
	pub segment_thunk_offset: u16,
	pub minimum_code_swap: u16,
	pub expected_windows_version: u16,
}

impl NeHeader {
	/// `header` must be exactly the 64 header bytes; the caller has already
	/// bounds-checked the file.
	fn parse(header: &[u8]) -> Result<NeHeader, NeError> {
		let signature = LittleEndian::read_u16(&header[0x00..]);
		if signature != NE_SIGNATURE {
			return Err(NeError::NotNeModule);
		}
		Ok(NeHeader {
			signature,
			linker_version: header[0x02],
			linker_revision: header[0x03],
			entry_table_offset: LittleEndian::read_u16(&header[0x04..]),
			entry_table_length: LittleEndian::read_u16(&header[0x06..]),
			file_crc: LittleEndian::read_u32(&header[0x08..]),
			program_flags: header[0x0c],
			application_flags: header[0x0d],
			auto_data_segment: LittleEndian::read_u16(&header[0x0e..]),
			initial_heap_size: LittleEndian::read_u16(&header[0x10..]),
			initial_stack_size: LittleEndian::read_u16(&header[0x12..]),
			entry_point_offset: LittleEndian::read_u16(&header[0x14..]),
			entry_point_segment: LittleEndian::read_u16(&header[0x16..]),
			initial_sp: LittleEndian::read_u16(&header[0x18..]),
			initial_ss: LittleEndian::read_u16(&header[0x1a..]),
			segment_count: LittleEndian::read_u16(&header[0x1c..]),
			module_reference_count: LittleEndian::read_u16(&header[0x1e..]),
			non_resident_name_table_size: LittleEndian::read_u16(&header[0x20..]),
			segment_table_offset: LittleEndian::read_u16(&header[0x22..]),
			resource_table_offset: LittleEndian::read_u16(&header[0x24..]),
			resident_name_table_offset: LittleEndian::read_u16(&header[0x26..]),
			module_reference_table_offset: LittleEndian::read_u16(&header[0x28..]),
			imported_names_table_offset: LittleEndian::read_u16(&header[0x2a..]),
			non_resident_name_table_offset: LittleEndian::read_u32(&header[0x2c..]),
			movable_entry_count: LittleEndian::read_u16(&header[0x30..]),
			alignment_shift: LittleEndian::read_u16(&header[0x32..]),
			resource_count: LittleEndian::read_u16(&header[0x34..]),
			target_os: header[0x36],
			extended_flags: header[0x37],
			return_thunk_offset: LittleEndian::read_u16(&header[0x38..]),
			segment_thunk_offset: LittleEndian::read_u16(&header[0x3a..]),
			minimum_code_swap: LittleEndian::read_u16(&header[0x3c..]),
			expected_windows_version: LittleEndian::read_u16(&header[0x3e..]),
		})
	}

	/// Log2 of the on-disk sector size. A stored shift of 0 means 512-byte
	/// sectors; linkers have relied on that default since Windows 2.x.
	/// Shifts past 24 cannot address anything inside a real file and are
	/// clamped to keep the offset arithmetic in range.
	pub fn align_shift(&self) -> u32 {
		if self.alignment_shift == 0 {
			9
		} else {
			(self.alignment_shift as u32).min(24)
		}
	}
}

bitflags! {
	/// Segment descriptor flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SegmentFlags: u16 {
		const DATA = 0x0001;
		const ALLOCATED = 0x0002;
		const LOADED = 0x0004;
		const ITERATED = 0x0008;
		const MOVABLE = 0x0010;
		const SHARED = 0x0020;
		const PRELOAD = 0x0040;
		const READ_ONLY = 0x0080;
		const HAS_RELOCATIONS = 0x0100;
		const DISCARDABLE = 0x1000;
	}
}

/// One 8-byte segment table record. Descriptor index i corresponds to the
/// 1-based segment number i+1 used by entry points and relocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
	// On-disk sector offset; 0 means the segment has no file-backed data.
	pub sector_offset: u16,
	pub length: u16,
	pub flags: SegmentFlags,
	pub min_alloc: u16,
}

impl SegmentDescriptor {
	/// On-disk byte length. A stored length of 0 means 64KiB; the field
	/// wraps at segment size.
	pub fn byte_length(&self) -> usize {
		if self.length == 0 {
			0x10000
		} else {
			self.length as usize
		}
	}

	/// Minimum allocation in bytes, with the same 0 => 64KiB convention.
	pub fn min_alloc_size(&self) -> usize {
		if self.min_alloc == 0 {
			0x10000
		} else {
			self.min_alloc as usize
		}
	}

	/// Absolute file offset of the segment's data.
	pub fn file_offset(&self, align_shift: u32) -> usize {
		(self.sector_offset as usize) << align_shift
	}
}

/// Everything the header parser extracts from a module file. Fully owned:
/// no field borrows from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeModule {
	/// File offset of the NE header (from the MZ stub pointer).
	pub header_offset: usize,
	pub header: NeHeader,
	pub segments: Vec<SegmentDescriptor>,
	/// Raw table bytes, copied out but not interpreted here.
	pub resource_table: Vec<u8>,
	pub entry_table: Vec<u8>,
	pub imported_names: Vec<u8>,
	/// Module-reference table: one imported-names offset per referenced module.
	pub module_references: Vec<u16>,
}

impl NeModule {
	/// Smallest declared table offset after `own`, relative to the NE header.
	/// The variable-length tables carry no length fields of their own; each
	/// one extends to wherever the next declared table begins.
	fn next_table_offset(header: &NeHeader, header_offset: usize, own: u16) -> Option<usize> {
		let own = own as usize;
		let declared = [
			header.segment_table_offset,
			header.resource_table_offset,
			header.resident_name_table_offset,
			header.module_reference_table_offset,
			header.imported_names_table_offset,
			header.entry_table_offset,
		];
		let mut next: Option<usize> = None;
		let mut consider = |candidate: usize| {
			if candidate > own {
				next = Some(next.map_or(candidate, |n| n.min(candidate)));
			}
		};
		for &offset in declared.iter() {
			if offset != 0 {
				consider(offset as usize);
			}
		}
		// The non-resident table offset is absolute; make it header-relative.
		let non_resident = header.non_resident_name_table_offset as usize;
		if non_resident > header_offset {
			consider(non_resident - header_offset);
		}
		next
	}

	/// Absolute byte range of the resident name table, clamped to the file.
	pub fn resident_name_range(&self, file_len: usize) -> Option<(usize, usize)> {
		let relative = self.header.resident_name_table_offset;
		if relative == 0 {
			return None;
		}
		let start = self.header_offset + relative as usize;
		if start >= file_len {
			return None;
		}
		let end = Self::next_table_offset(&self.header, self.header_offset, relative)
			.map(|next| self.header_offset + next)
			.unwrap_or(file_len)
			.min(file_len);
		Some((start, end))
	}

	/// Absolute byte range of the non-resident name table. Same record
	/// format as the resident table, but located by absolute file offset
	/// with an explicit size.
	pub fn non_resident_name_range(&self, file_len: usize) -> Option<(usize, usize)> {
		let start = self.header.non_resident_name_table_offset as usize;
		if start == 0 || start >= file_len {
			return None;
		}
		let end = start
			.saturating_add(self.header.non_resident_name_table_size as usize)
			.min(file_len);
		Some((start, end))
	}
}

/// Decode the two-stage header, the segment table and the raw variable-length
/// tables from a module file. The returned data owns every byte it needs; the
/// input buffer is not retained.
pub fn parse_module(data: &[u8]) -> Result<NeModule, NeError> {
	let stub = MzStub::parse(data)?;

	let header_offset = stub.ne_header_offset as usize;
	if header_offset < MZ_STUB_BYTES {
		return Err(NeError::OffsetOutOfBounds { offset: header_offset, len: NE_HEADER_BYTES });
	}
	let header_end = header_offset
		.checked_add(NE_HEADER_BYTES)
		.ok_or(NeError::OffsetOutOfBounds { offset: header_offset, len: NE_HEADER_BYTES })?;
	if header_end > data.len() {
		return Err(NeError::OffsetOutOfBounds { offset: header_offset, len: NE_HEADER_BYTES });
	}
	let header = NeHeader::parse(&data[header_offset..header_end])?;

	let segments = parse_segment_table(data, header_offset, &header)?;
	let module_references = parse_module_references(data, header_offset, &header)?;

	let resource_extent =
		NeModule::next_table_offset(&header, header_offset, header.resource_table_offset)
			.map(|next| next - header.resource_table_offset as usize)
			.unwrap_or(0);
	let resource_table =
		extract_table(data, header_offset, header.resource_table_offset, resource_extent)?;

	// The entry table is normally the last of the header-relative tables, so
	// when nothing follows it the header's declared length is the extent.
	let entry_extent =
		NeModule::next_table_offset(&header, header_offset, header.entry_table_offset)
			.map(|next| next - header.entry_table_offset as usize)
			.unwrap_or(header.entry_table_length as usize);
	let entry_table = extract_table(data, header_offset, header.entry_table_offset, entry_extent)?;

	let imported_extent =
		NeModule::next_table_offset(&header, header_offset, header.imported_names_table_offset)
			.map(|next| next - header.imported_names_table_offset as usize)
			.unwrap_or(0);
	let imported_names =
		extract_table(data, header_offset, header.imported_names_table_offset, imported_extent)?;

	debug!(
		"parsed NE module: {} segments, {} module refs, entry table {} bytes, imported names {} bytes",
		segments.len(),
		module_references.len(),
		entry_table.len(),
		imported_names.len()
	);

	Ok(NeModule {
		header_offset,
		header,
		segments,
		resource_table,
		entry_table,
		imported_names,
		module_references,
	})
}

fn parse_segment_table(
	data: &[u8],
	header_offset: usize,
	header: &NeHeader,
) -> Result<Vec<SegmentDescriptor>, NeError> {
	let count = header.segment_count as usize;
	if count == 0 {
		return Ok(Vec::new());
	}
	let table_offset = header_offset + header.segment_table_offset as usize;
	let table_len = count * SEGMENT_DESCRIPTOR_BYTES;
	let table_end = table_offset
		.checked_add(table_len)
		.ok_or(NeError::OffsetOutOfBounds { offset: table_offset, len: table_len })?;
	if table_end > data.len() {
		return Err(NeError::OffsetOutOfBounds { offset: table_offset, len: table_len });
	}

	let mut segments = Vec::with_capacity(count);
	for record in data[table_offset..table_end].chunks_exact(SEGMENT_DESCRIPTOR_BYTES) {
		segments.push(SegmentDescriptor {
			sector_offset: LittleEndian::read_u16(&record[0..]),
			length: LittleEndian::read_u16(&record[2..]),
			flags: SegmentFlags::from_bits_retain(LittleEndian::read_u16(&record[4..])),
			min_alloc: LittleEndian::read_u16(&record[6..]),
		});
	}
	Ok(segments)
}

fn parse_module_references(
	data: &[u8],
	header_offset: usize,
	header: &NeHeader,
) -> Result<Vec<u16>, NeError> {
	let count = header.module_reference_count as usize;
	if count == 0 || header.module_reference_table_offset == 0 {
		return Ok(Vec::new());
	}
	let table_offset = header_offset + header.module_reference_table_offset as usize;
	let table_len = count * 2;
	let table_end = table_offset
		.checked_add(table_len)
		.ok_or(NeError::OffsetOutOfBounds { offset: table_offset, len: table_len })?;
	if table_end > data.len() {
		return Err(NeError::OffsetOutOfBounds { offset: table_offset, len: table_len });
	}

	let mut references = Vec::with_capacity(count);
	for record in data[table_offset..table_end].chunks_exact(2) {
		references.push(LittleEndian::read_u16(record));
	}
	Ok(references)
}

/// Copy a declared table out of the file. A zero offset or extent means the
/// table is absent; an offset past the file is an error; an extent running
/// past the file is clamped to the bytes that are actually there.
fn extract_table(
	data: &[u8],
	header_offset: usize,
	relative_offset: u16,
	extent: usize,
) -> Result<Vec<u8>, NeError> {
	if relative_offset == 0 || extent == 0 {
		return Ok(Vec::new());
	}
	let start = header_offset
		.checked_add(relative_offset as usize)
		.ok_or(NeError::OffsetOutOfBounds { offset: header_offset, len: extent })?;
	if start > data.len() {
		return Err(NeError::OffsetOutOfBounds { offset: start, len: extent });
	}
	let end = start.saturating_add(extent).min(data.len());
	Ok(data[start..end].to_vec())
}

/// Decode one length-prefixed name from the imported-names table. Relocation
/// records reference imported symbols by their byte offset into this table.
pub fn imported_name_at(imported_names: &[u8], offset: u16) -> Option<&[u8]> {
	let offset = offset as usize;
	let length = *imported_names.get(offset)? as usize;
	imported_names.get(offset + 1..offset + 1 + length)
}
