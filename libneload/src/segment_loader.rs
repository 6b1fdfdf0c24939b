use crate::ne_error::NeError;
use crate::ne_header::{NeHeader, NeModule, SegmentFlags};

use log::debug;

/// One materialized segment: file-backed bytes up front, zero fill behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSegment {
	pub data: Vec<u8>,
	/// How many leading bytes came from the file; the rest is zero fill.
	/// 0 for segments with no file-backed data.
	pub data_size: usize,
	/// Absolute file offset the data was copied from, 0 when none.
	pub file_offset: usize,
	pub flags: SegmentFlags,
}

impl LoadedSegment {
	pub fn alloc_size(&self) -> usize {
		self.data.len()
	}
}

/// Materialize every declared segment: allocate `max(length, min_alloc)`
/// zeroed bytes, copy the file-backed part in, and validate the module's
/// entry point against the result. Partially built segments are dropped on
/// any failure.
pub fn load_segments(file: &[u8], module: &NeModule) -> Result<Vec<LoadedSegment>, NeError> {
	let shift = module.header.align_shift();
	let mut segments = Vec::with_capacity(module.segments.len());

	for (index, descriptor) in module.segments.iter().enumerate() {
		let length = descriptor.byte_length();
		let alloc_size = length.max(descriptor.min_alloc_size());

		let mut data = Vec::new();
		data.try_reserve_exact(alloc_size)
			.map_err(|_| NeError::AllocationFailed(alloc_size))?;
		data.resize(alloc_size, 0);

		let (file_offset, data_size) = if descriptor.sector_offset != 0 {
			let file_offset = descriptor.file_offset(shift);
			let end = file_offset
				.checked_add(length)
				.ok_or(NeError::OffsetOutOfBounds { offset: file_offset, len: length })?;
			if end > file.len() {
				return Err(NeError::OffsetOutOfBounds { offset: file_offset, len: length });
			}
			data[..length].copy_from_slice(&file[file_offset..end]);
			(file_offset, length)
		} else {
			// No sector offset: BSS-like, the buffer stays zero.
			(0, 0)
		};

		debug!(
			"segment {}: {} bytes from file offset 0x{:x}, {} allocated",
			index + 1,
			data_size,
			file_offset,
			alloc_size
		);
		segments.push(LoadedSegment { data, data_size, file_offset, flags: descriptor.flags });
	}

	validate_entry_point(&module.header, &segments)?;
	Ok(segments)
}

/// Check the declared entry point against the loaded segments. An entry
/// segment number of 0 means the module has no entry point (a library).
pub fn validate_entry_point(header: &NeHeader, segments: &[LoadedSegment]) -> Result<(), NeError> {
	if header.entry_point_segment == 0 {
		return Ok(());
	}
	let out_of_bounds = NeError::EntryPointOutOfBounds {
		segment: header.entry_point_segment,
		offset: header.entry_point_offset,
	};
	let index = header.entry_point_segment as usize - 1;
	let segment = segments.get(index).ok_or_else(|| out_of_bounds.clone())?;
	if header.entry_point_offset as usize >= segment.alloc_size() {
		return Err(out_of_bounds);
	}
	Ok(())
}
