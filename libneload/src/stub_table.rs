use crate::ne_error::NeError;

use log::debug;

pub const DEFAULT_STUB_CAPACITY: usize = 512;

/// A stand-in for an import whose target module was not loaded yet. Kept
/// around after replacement so the full history stays inspectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubEntry {
	pub module: String,
	/// May be empty for ordinal-only imports.
	pub name: String,
	pub ordinal: u16,
	/// Free text describing what the stand-in does when called.
	pub description: String,
	pub milestone: String,
	pub removed: bool,
}

impl StubEntry {
	pub fn new(
		module: &str,
		name: &str,
		ordinal: u16,
		description: &str,
		milestone: &str,
	) -> StubEntry {
		StubEntry {
			module: module.to_string(),
			name: name.to_string(),
			ordinal,
			description: description.to_string(),
			milestone: milestone.to_string(),
			removed: false,
		}
	}
}

/// Capacity-bounded record of outstanding stubs, keyed by (module, ordinal).
#[derive(Debug, Clone)]
pub struct StubTable {
	entries: Vec<StubEntry>,
	capacity: usize,
}

impl StubTable {
	pub fn new() -> StubTable {
		StubTable::with_capacity(DEFAULT_STUB_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> StubTable {
		StubTable { entries: Vec::new(), capacity }
	}

	/// Register a stub. Registering a (module, ordinal) key that already
	/// exists is a silent no-op, whatever its removed state; the table only
	/// refuses when it is full and the key is new.
	pub fn register(&mut self, entry: StubEntry) -> Result<(), NeError> {
		let exists = self
			.entries
			.iter()
			.any(|e| e.module == entry.module && e.ordinal == entry.ordinal);
		if exists {
			return Ok(());
		}
		if self.entries.len() >= self.capacity {
			return Err(NeError::StubTableFull);
		}
		debug!("stub registered: {} ordinal {}", entry.module, entry.ordinal);
		self.entries.push(entry);
		Ok(())
	}

	/// Mark the first still-active stub for (module, ordinal) as removed,
	/// once its import has been properly resolved. The record itself stays.
	pub fn replace(&mut self, module: &str, ordinal: u16) -> Result<(), NeError> {
		let entry = self
			.entries
			.iter_mut()
			.find(|e| !e.removed && e.module == module && e.ordinal == ordinal);
		match entry {
			Some(entry) => {
				entry.removed = true;
				Ok(())
			}
			None => Err(NeError::UnresolvedImport(format!(
				"no active stub for {} ordinal {}",
				module, ordinal
			))),
		}
	}

	/// First match regardless of removed state, for inspection.
	pub fn find_by_ordinal(&self, module: &str, ordinal: u16) -> Option<&StubEntry> {
		self.entries.iter().find(|e| e.module == module && e.ordinal == ordinal)
	}

	/// First match regardless of removed state, for inspection.
	pub fn find_by_name(&self, module: &str, name: &str) -> Option<&StubEntry> {
		self.entries.iter().find(|e| e.module == module && e.name == name)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &StubEntry> {
		self.entries.iter()
	}
}

impl Default for StubTable {
	fn default() -> StubTable {
		StubTable::new()
	}
}
