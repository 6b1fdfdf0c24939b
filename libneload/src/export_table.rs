use crate::ne_error::NeError;
use crate::seg_addr::SegAddr;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

// Entry-table bundle indicators. Anything else is the 1-based segment number
// of a fixed bundle.
const BUNDLE_NULL: u8 = 0x00;
const BUNDLE_MOVABLE: u8 = 0xff;
const FIXED_ENTRY_BYTES: usize = 3;
const MOVABLE_ENTRY_BYTES: usize = 6;

/// One exported symbol. Ordinals are 1-based and unique within a module;
/// the name is empty for ordinal-only exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
	pub ordinal: u16,
	/// 0-based segment index.
	pub segment: u16,
	pub offset: u16,
	pub name: String,
}

impl ExportEntry {
	pub fn address(&self) -> SegAddr {
		SegAddr::new(self.segment, self.offset)
	}
}

/// A module's decoded entry table, built once at load time. Lookup is a
/// linear scan; export tables are small and carry no ordering invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
	entries: Vec<ExportEntry>,
}

impl ExportTable {
	/// Decode the bundle-encoded entry table. Ordinals run from 1 and
	/// advance across every entry, including the ones a null bundle
	/// consumes. A bundle whose declared span runs past the table stops
	/// decoding; whatever was built so far is the table. An absent entry
	/// table is an empty table, not an error.
	pub fn from_entry_table(entry_table: &[u8]) -> ExportTable {
		let mut entries = Vec::new();
		let mut ordinal: u16 = 1;
		let mut pos = 0usize;

		loop {
			let count = match entry_table.get(pos) {
				Some(&count) => count as usize,
				None => break,
			};
			if count == 0 {
				break;
			}
			let indicator = match entry_table.get(pos + 1) {
				Some(&indicator) => indicator,
				None => break,
			};
			pos += 2;

			match indicator {
				BUNDLE_NULL => {
					// Unused ordinals; nothing stored for them.
					ordinal = ordinal.wrapping_add(count as u16);
				}
				BUNDLE_MOVABLE => {
					let span = count * MOVABLE_ENTRY_BYTES;
					if pos + span > entry_table.len() {
						break;
					}
					for entry in entry_table[pos..pos + span].chunks_exact(MOVABLE_ENTRY_BYTES) {
						// Flag byte, int 3fh marker pair, segment number, offset.
						let segment_number = entry[3] as u16;
						let offset = LittleEndian::read_u16(&entry[4..]);
						if let Some(addr) = SegAddr::from_segment_number(segment_number, offset) {
							entries.push(ExportEntry {
								ordinal,
								segment: addr.segment,
								offset: addr.offset,
								name: String::new(),
							});
						}
						ordinal = ordinal.wrapping_add(1);
					}
					pos += span;
				}
				segment_number => {
					let span = count * FIXED_ENTRY_BYTES;
					if pos + span > entry_table.len() {
						break;
					}
					for entry in entry_table[pos..pos + span].chunks_exact(FIXED_ENTRY_BYTES) {
						// Flag byte, then the offset within the bundle's segment.
						let offset = LittleEndian::read_u16(&entry[1..]);
						entries.push(ExportEntry {
							ordinal,
							segment: segment_number as u16 - 1,
							offset,
							name: String::new(),
						});
						ordinal = ordinal.wrapping_add(1);
					}
					pos += span;
				}
			}
		}

		debug!("entry table decoded: {} exports", entries.len());
		ExportTable { entries }
	}

	/// Walk a name table (resident or non-resident; both use the same
	/// length-prefixed records) and attach names to matching ordinals.
	/// The first record is the module's own name and is skipped
	/// unconditionally; it is returned for the caller. Truncated records
	/// stop the walk without error.
	pub fn attach_names(&mut self, file: &[u8], start: usize, end: usize) -> Option<String> {
		let end = end.min(file.len());
		let mut module_name = None;
		let mut first = true;
		let mut pos = start;

		while pos < end {
			let length = file[pos] as usize;
			if length == 0 {
				break;
			}
			let record_end = pos + 1 + length + 2;
			if record_end > end {
				break;
			}
			let text = &file[pos + 1..pos + 1 + length];
			let ordinal = LittleEndian::read_u16(&file[pos + 1 + length..]);

			if first {
				// The module's own name, ordinal 0 by convention. Never
				// matched against an export, even with a bogus ordinal.
				module_name = Some(String::from_utf8_lossy(text).into_owned());
				first = false;
			} else if ordinal > 0 {
				if let Some(entry) = self.entries.iter_mut().find(|e| e.ordinal == ordinal) {
					entry.name = String::from_utf8_lossy(text).into_owned();
				}
			}
			pos = record_end;
		}
		module_name
	}

	pub fn find_by_ordinal(&self, ordinal: u16) -> Option<&ExportEntry> {
		self.entries.iter().find(|entry| entry.ordinal == ordinal)
	}

	/// Case-sensitive; the linker stores exported names uppercased.
	pub fn find_by_name(&self, name: &str) -> Option<&ExportEntry> {
		self.entries.iter().find(|entry| !entry.name.is_empty() && entry.name == name)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &ExportEntry> {
		self.entries.iter()
	}
}

/// Resolve an import against another module's export table. No table yet
/// (target module not loaded) is an unresolved import like any other.
pub fn resolve_ordinal(table: Option<&ExportTable>, ordinal: u16) -> Result<SegAddr, NeError> {
	table
		.and_then(|table| table.find_by_ordinal(ordinal))
		.map(|entry| entry.address())
		.ok_or_else(|| NeError::UnresolvedImport(format!("ordinal {}", ordinal)))
}

pub fn resolve_name(table: Option<&ExportTable>, name: &str) -> Result<SegAddr, NeError> {
	table
		.and_then(|table| table.find_by_name(name))
		.map(|entry| entry.address())
		.ok_or_else(|| NeError::UnresolvedImport(name.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixed_bundle(segment: u8, offsets: &[u16]) -> Vec<u8> {
		let mut bytes = vec![offsets.len() as u8, segment];
		for &offset in offsets {
			bytes.push(0x01);
			bytes.push(offset as u8);
			bytes.push((offset >> 8) as u8);
		}
		bytes
	}

	fn movable_bundle(entries: &[(u8, u16)]) -> Vec<u8> {
		let mut bytes = vec![entries.len() as u8, 0xff];
		for &(segment, offset) in entries {
			bytes.push(0x01);
			bytes.push(0xcd);
			bytes.push(0x3f);
			bytes.push(segment);
			bytes.push(offset as u8);
			bytes.push((offset >> 8) as u8);
		}
		bytes
	}

	fn terminated(mut bytes: Vec<u8>) -> Vec<u8> {
		bytes.push(0);
		bytes
	}

	#[test]
	fn empty_table_has_no_exports() {
		assert!(ExportTable::from_entry_table(&[]).is_empty());
		assert!(ExportTable::from_entry_table(&[0]).is_empty());
	}

	#[test]
	fn null_bundle_consumes_ordinals() {
		// Two unused ordinals, then one fixed export in segment 1 at 0x0100:
		// the export gets ordinal 3, and ordinals 1 and 2 do not exist.
		let mut bytes = vec![2, 0x00];
		bytes.extend(fixed_bundle(1, &[0x0100]));
		let table = ExportTable::from_entry_table(&terminated(bytes));

		assert_eq!(table.len(), 1);
		let entry = table.find_by_ordinal(3).unwrap();
		assert_eq!(entry.segment, 0);
		assert_eq!(entry.offset, 0x0100);
		assert!(table.find_by_ordinal(1).is_none());
		assert!(table.find_by_ordinal(2).is_none());
	}

	#[test]
	fn movable_bundle_decodes_segment_and_offset() {
		let table = ExportTable::from_entry_table(&terminated(movable_bundle(&[(2, 0x1234)])));
		let entry = table.find_by_ordinal(1).unwrap();
		assert_eq!(entry.segment, 1);
		assert_eq!(entry.offset, 0x1234);
	}

	#[test]
	fn ordinals_run_across_bundle_kinds() {
		let mut bytes = fixed_bundle(1, &[0x0010, 0x0020]);
		bytes.extend(vec![1, 0x00]);
		bytes.extend(movable_bundle(&[(3, 0x0300)]));
		let table = ExportTable::from_entry_table(&terminated(bytes));

		assert_eq!(table.len(), 3);
		assert_eq!(table.find_by_ordinal(1).unwrap().offset, 0x0010);
		assert_eq!(table.find_by_ordinal(2).unwrap().offset, 0x0020);
		assert!(table.find_by_ordinal(3).is_none());
		let movable = table.find_by_ordinal(4).unwrap();
		assert_eq!(movable.segment, 2);
		assert_eq!(movable.offset, 0x0300);
	}

	#[test]
	fn terminator_stops_the_walk() {
		let mut bytes = terminated(fixed_bundle(1, &[0x0010]));
		// Garbage after the terminator must not be decoded.
		bytes.extend_from_slice(&[5, 1, 0xde, 0xad, 0xbe]);
		let table = ExportTable::from_entry_table(&bytes);
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn truncated_bundle_keeps_earlier_entries() {
		let mut bytes = fixed_bundle(1, &[0x0010]);
		// Declares four entries but provides none of their bytes.
		bytes.extend_from_slice(&[4, 0x02]);
		let table = ExportTable::from_entry_table(&bytes);
		assert_eq!(table.len(), 1);
		assert_eq!(table.find_by_ordinal(1).unwrap().offset, 0x0010);
	}

	fn name_record(text: &[u8], ordinal: u16) -> Vec<u8> {
		let mut bytes = vec![text.len() as u8];
		bytes.extend_from_slice(text);
		bytes.push(ordinal as u8);
		bytes.push((ordinal >> 8) as u8);
		bytes
	}

	#[test]
	fn attach_names_skips_the_module_name() {
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(1, &[0x10])));
		let mut names = name_record(b"SELF", 0);
		names.extend(name_record(b"DOIT", 1));
		names.push(0);

		let module_name = table.attach_names(&names, 0, names.len());
		assert_eq!(module_name.as_deref(), Some("SELF"));
		assert_eq!(table.find_by_ordinal(1).unwrap().name, "DOIT");
		assert_eq!(table.find_by_name("DOIT").unwrap().ordinal, 1);
	}

	#[test]
	fn first_record_is_skipped_even_with_a_real_ordinal() {
		// A malformed table whose first record claims ordinal 1: it is
		// still the module name and must not be attached.
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(1, &[0x10])));
		let mut names = name_record(b"SELF", 1);
		names.push(0);

		table.attach_names(&names, 0, names.len());
		assert_eq!(table.find_by_ordinal(1).unwrap().name, "");
	}

	#[test]
	fn later_ordinal_zero_record_is_ignored() {
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(1, &[0x10])));
		let mut names = name_record(b"SELF", 0);
		names.extend(name_record(b"GHOST", 0));
		names.push(0);

		table.attach_names(&names, 0, names.len());
		assert!(table.iter().all(|entry| entry.name.is_empty()));
	}

	#[test]
	fn unmatched_ordinals_are_ignored() {
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(1, &[0x10])));
		let mut names = name_record(b"SELF", 0);
		names.extend(name_record(b"NOBODY", 9));
		names.push(0);

		table.attach_names(&names, 0, names.len());
		assert!(table.find_by_name("NOBODY").is_none());
	}

	#[test]
	fn truncated_name_record_stops_the_walk() {
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(1, &[0x10])));
		let mut names = name_record(b"SELF", 0);
		// Length byte promises more text than the table holds.
		names.extend_from_slice(&[10, b'X', b'Y']);
		table.attach_names(&names, 0, names.len());
		assert_eq!(table.find_by_ordinal(1).unwrap().name, "");
	}

	#[test]
	fn name_lookup_is_case_sensitive() {
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(1, &[0x10])));
		let mut names = name_record(b"SELF", 0);
		names.extend(name_record(b"DOIT", 1));
		names.push(0);
		table.attach_names(&names, 0, names.len());

		assert!(table.find_by_name("doit").is_none());
		assert!(table.find_by_name("DOIT").is_some());
	}

	#[test]
	fn round_trip_every_bundle_kind() {
		let mut bytes = vec![1, 0x00];
		bytes.extend(fixed_bundle(1, &[0x0040, 0x0080]));
		bytes.extend(movable_bundle(&[(2, 0x0c00)]));
		let mut table = ExportTable::from_entry_table(&terminated(bytes));

		let mut names = name_record(b"MOD", 0);
		names.extend(name_record(b"ALPHA", 2));
		names.extend(name_record(b"GAMMA", 4));
		names.push(0);
		table.attach_names(&names, 0, names.len());

		// Ordinal 1 was consumed by the null bundle.
		assert!(table.find_by_ordinal(1).is_none());
		assert_eq!(table.find_by_ordinal(2).unwrap().address(), SegAddr::new(0, 0x0040));
		assert_eq!(table.find_by_ordinal(3).unwrap().address(), SegAddr::new(0, 0x0080));
		assert_eq!(table.find_by_ordinal(4).unwrap().address(), SegAddr::new(1, 0x0c00));
		assert_eq!(table.find_by_name("ALPHA").unwrap().ordinal, 2);
		assert_eq!(table.find_by_name("GAMMA").unwrap().ordinal, 4);
	}

	#[test]
	fn resolve_against_missing_table_is_unresolved() {
		assert!(matches!(resolve_ordinal(None, 1), Err(NeError::UnresolvedImport(_))));
		assert!(matches!(resolve_name(None, "DOIT"), Err(NeError::UnresolvedImport(_))));
	}

	#[test]
	fn resolve_finds_exported_addresses() {
		let mut table = ExportTable::from_entry_table(&terminated(fixed_bundle(2, &[0x0123])));
		let mut names = name_record(b"MOD", 0);
		names.extend(name_record(b"DOIT", 1));
		names.push(0);
		table.attach_names(&names, 0, names.len());

		assert_eq!(resolve_ordinal(Some(&table), 1), Ok(SegAddr::new(1, 0x0123)));
		assert_eq!(resolve_name(Some(&table), "DOIT"), Ok(SegAddr::new(1, 0x0123)));
		assert!(matches!(
			resolve_ordinal(Some(&table), 2),
			Err(NeError::UnresolvedImport(_))
		));
	}
}
