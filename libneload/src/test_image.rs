//! In-memory NE image builder for the unit tests. Lays the file out the way
//! the linker does: MZ stub, NE header, header-relative tables in ascending
//! order, then sector-aligned segment data with trailing relocation blocks.

use byteorder::{ByteOrder, LittleEndian};

use crate::ne_header::{MZ_STUB_BYTES, NE_HEADER_BYTES};

pub struct TestSegment {
	pub data: Vec<u8>,
	pub flags: u16,
	pub min_alloc: u16,
	/// Raw bytes written immediately after the segment data, normally a
	/// relocation block ({count:2} + 8-byte records).
	pub trailer: Vec<u8>,
}

impl TestSegment {
	pub fn code(data: Vec<u8>) -> TestSegment {
		let min_alloc = data.len() as u16;
		TestSegment { data, flags: 0x0000, min_alloc, trailer: Vec::new() }
	}

	pub fn data(data: Vec<u8>) -> TestSegment {
		let min_alloc = data.len() as u16;
		TestSegment { data, flags: 0x0001, min_alloc, trailer: Vec::new() }
	}

	/// A segment with no file-backed data at all.
	pub fn bss(min_alloc: u16) -> TestSegment {
		TestSegment { data: Vec::new(), flags: 0x0001, min_alloc, trailer: Vec::new() }
	}

	pub fn with_flags(mut self, flags: u16) -> TestSegment {
		self.flags = flags;
		self
	}

	pub fn with_min_alloc(mut self, min_alloc: u16) -> TestSegment {
		self.min_alloc = min_alloc;
		self
	}

	/// Attach a well-formed relocation block and set the descriptor flag.
	pub fn with_relocations(mut self, records: &[[u8; 8]]) -> TestSegment {
		let mut block = vec![0u8; 2];
		LittleEndian::write_u16(&mut block, records.len() as u16);
		for record in records {
			block.extend_from_slice(record);
		}
		self.trailer = block;
		self.flags |= 0x0100;
		self
	}

	/// Attach arbitrary (possibly malformed) trailer bytes and set the
	/// relocation flag anyway.
	pub fn with_raw_trailer(mut self, trailer: Vec<u8>) -> TestSegment {
		self.trailer = trailer;
		self.flags |= 0x0100;
		self
	}
}

/// Encode one 8-byte relocation record.
pub fn reloc_record(address_type: u8, reloc_type: u8, target: u16, ref1: u16, ref2: u16) -> [u8; 8] {
	let mut record = [0u8; 8];
	record[0] = address_type;
	record[1] = reloc_type;
	LittleEndian::write_u16(&mut record[2..], target);
	LittleEndian::write_u16(&mut record[4..], ref1);
	LittleEndian::write_u16(&mut record[6..], ref2);
	record
}

pub struct ImageBuilder {
	pub align_shift: u16,
	/// (1-based segment number, offset) - CS:IP in the header.
	pub entry_point: (u16, u16),
	pub segments: Vec<TestSegment>,
	pub resource_table: Vec<u8>,
	pub resident_names: Vec<u8>,
	pub imported_names: Vec<u8>,
	pub module_refs: Vec<u16>,
	pub entry_table: Vec<u8>,
	pub non_resident_names: Vec<u8>,
}

impl ImageBuilder {
	pub fn new() -> ImageBuilder {
		ImageBuilder {
			align_shift: 4,
			entry_point: (0, 0),
			segments: Vec::new(),
			resource_table: Vec::new(),
			resident_names: Vec::new(),
			imported_names: Vec::new(),
			module_refs: Vec::new(),
			entry_table: Vec::new(),
			non_resident_names: Vec::new(),
		}
	}

	pub fn build(&self) -> Vec<u8> {
		let header_offset = MZ_STUB_BYTES;
		let sector_bytes = 1usize << self.align_shift;

		// Header-relative table layout, segment table first.
		let segment_table_offset = NE_HEADER_BYTES;
		let mut cursor = segment_table_offset + self.segments.len() * 8;
		let mut place = |len: usize| {
			if len == 0 {
				0
			} else {
				let at = cursor;
				cursor += len;
				at
			}
		};
		let resource_offset = place(self.resource_table.len());
		let resident_offset = place(self.resident_names.len());
		let modref_offset = place(self.module_refs.len() * 2);
		let imported_offset = place(self.imported_names.len());
		let entry_offset = place(self.entry_table.len());
		let tables_end = cursor;

		// The non-resident name table sits after the header-relative tables
		// and before the segment data, as the linker writes it.
		let non_resident_offset =
			if self.non_resident_names.is_empty() { 0 } else { header_offset + tables_end };

		let mut image = vec![0u8; header_offset + tables_end];

		// MZ stub: signature plus the embedded-header pointer at 0x3c.
		LittleEndian::write_u16(&mut image[0..], 0x5a4d);
		LittleEndian::write_u32(&mut image[0x3c..], header_offset as u32);

		let table_data = [
			(resource_offset, &self.resource_table),
			(resident_offset, &self.resident_names),
			(imported_offset, &self.imported_names),
			(entry_offset, &self.entry_table),
		];
		for (offset, bytes) in table_data.iter() {
			if *offset != 0 {
				image[header_offset + offset..header_offset + offset + bytes.len()]
					.copy_from_slice(bytes);
			}
		}
		for (index, reference) in self.module_refs.iter().enumerate() {
			let at = header_offset + modref_offset + index * 2;
			LittleEndian::write_u16(&mut image[at..], *reference);
		}
		image.extend_from_slice(&self.non_resident_names);

		// Segment data areas, each aligned to a sector boundary.
		let mut descriptors = Vec::new();
		for segment in self.segments.iter() {
			if segment.data.is_empty() {
				descriptors.push((0u16, 0u16, segment.flags, segment.min_alloc));
				continue;
			}
			while image.len() % sector_bytes != 0 {
				image.push(0);
			}
			let sector = (image.len() >> self.align_shift) as u16;
			image.extend_from_slice(&segment.data);
			image.extend_from_slice(&segment.trailer);
			descriptors.push((sector, segment.data.len() as u16, segment.flags, segment.min_alloc));
		}

		for (index, (sector, length, flags, min_alloc)) in descriptors.iter().enumerate() {
			let at = header_offset + segment_table_offset + index * 8;
			LittleEndian::write_u16(&mut image[at..], *sector);
			LittleEndian::write_u16(&mut image[at + 2..], *length);
			LittleEndian::write_u16(&mut image[at + 4..], *flags);
			LittleEndian::write_u16(&mut image[at + 6..], *min_alloc);
		}

		// NE header fields.
		let h = header_offset;
		LittleEndian::write_u16(&mut image[h..], 0x454e);
		image[h + 0x02] = 5;
		image[h + 0x03] = 1;
		LittleEndian::write_u16(&mut image[h + 0x04..], entry_offset as u16);
		LittleEndian::write_u16(&mut image[h + 0x06..], self.entry_table.len() as u16);
		LittleEndian::write_u16(&mut image[h + 0x14..], self.entry_point.1);
		LittleEndian::write_u16(&mut image[h + 0x16..], self.entry_point.0);
		LittleEndian::write_u16(&mut image[h + 0x1c..], self.segments.len() as u16);
		LittleEndian::write_u16(&mut image[h + 0x1e..], self.module_refs.len() as u16);
		LittleEndian::write_u16(&mut image[h + 0x20..], self.non_resident_names.len() as u16);
		LittleEndian::write_u16(&mut image[h + 0x22..], segment_table_offset as u16);
		LittleEndian::write_u16(&mut image[h + 0x24..], resource_offset as u16);
		LittleEndian::write_u16(&mut image[h + 0x26..], resident_offset as u16);
		LittleEndian::write_u16(&mut image[h + 0x28..], modref_offset as u16);
		LittleEndian::write_u16(&mut image[h + 0x2a..], imported_offset as u16);
		LittleEndian::write_u32(&mut image[h + 0x2c..], non_resident_offset as u32);
		LittleEndian::write_u16(&mut image[h + 0x32..], self.align_shift);
		image[h + 0x36] = 2;

		image
	}
}
