use libneload::export_table::ExportTable;
use libneload::ne_header::{imported_name_at, parse_module, NeModule};
use libneload::relocation::{apply_relocations, parse_relocations, ImportRef};
use libneload::seg_addr::SegAddr;
use libneload::segment_loader::{load_segments, LoadedSegment};
use libneload::stub_table::{StubEntry, StubTable};

use anyhow::{bail, Context, Result};

fn main() -> Result<()> {
	let path = match std::env::args().nth(1) {
		Some(path) => path,
		None => bail!("usage: neload <module.exe>"),
	};
	let file = std::fs::read(&path).with_context(|| format!("failed to read {}", path))?;

	let module = parse_module(&file).with_context(|| format!("{} is not loadable", path))?;
	let mut segments = load_segments(&file, &module).context("failed to load segments")?;

	let mut exports = ExportTable::from_entry_table(&module.entry_table);
	let mut module_name = None;
	if let Some((start, end)) = module.resident_name_range(file.len()) {
		module_name = exports.attach_names(&file, start, end);
	}
	if let Some((start, end)) = module.non_resident_name_range(file.len()) {
		// The first non-resident record is the module description; skipped
		// by attach_names the same way the resident module name is.
		exports.attach_names(&file, start, end);
	}

	let tables = parse_relocations(&file, &module).context("failed to read relocation blocks")?;

	// A single-module session has nothing to resolve imports against, so
	// every import gets a stub and a null patch; the embedding layer would
	// replace the stubs as the target modules come up.
	let mut stubs = StubTable::new();
	{
		let module_refs = &module.module_references;
		let stubs = &mut stubs;
		let mut resolver = |module_ref: u16, import: ImportRef, names: &[u8]| {
			let target = module_refs
				.get(module_ref as usize)
				.and_then(|&offset| imported_name_at(names, offset))
				.map(|name| String::from_utf8_lossy(name).into_owned())
				.unwrap_or_else(|| format!("#{}", module_ref));
			let (name, ordinal) = match import {
				ImportRef::Ordinal(ordinal) => (String::new(), ordinal),
				ImportRef::NameOffset(offset) => {
					let name = imported_name_at(names, offset)
						.map(|name| String::from_utf8_lossy(name).into_owned())
						.unwrap_or_default();
					(name, 0)
				}
			};
			let entry =
				StubEntry::new(&target, &name, ordinal, "patched with a null address", "load");
			stubs.register(entry).ok()?;
			Some(SegAddr::new(0, 0))
		};
		apply_relocations(&mut segments, &tables, &module.imported_names, Some(&mut resolver))
			.context("failed to apply relocations")?;
	}

	print_report(&path, module_name.as_deref(), &module, &segments, &exports, &stubs);
	Ok(())
}

fn print_report(
	path: &str,
	module_name: Option<&str>,
	module: &NeModule,
	segments: &[LoadedSegment],
	exports: &ExportTable,
	stubs: &StubTable,
) {
	match module_name {
		Some(name) => println!("{}: NE module {}", path, name),
		None => println!("{}: NE module (unnamed)", path),
	}
	println!(
		"  linker {}.{}, target os 0x{:02x}, {} byte sectors",
		module.header.linker_version,
		module.header.linker_revision,
		module.header.target_os,
		1u32 << module.header.align_shift()
	);
	if module.header.entry_point_segment != 0 {
		println!(
			"  entry point {}:0x{:04x}",
			module.header.entry_point_segment, module.header.entry_point_offset
		);
	}

	println!("  segments:");
	for (index, segment) in segments.iter().enumerate() {
		println!(
			"    {}: {} bytes from file, {} allocated, flags 0x{:04x}",
			index + 1,
			segment.data_size,
			segment.alloc_size(),
			segment.flags.bits()
		);
	}

	if !exports.is_empty() {
		println!("  exports:");
		for entry in exports.iter() {
			let name = if entry.name.is_empty() { "(no name)" } else { &entry.name };
			println!(
				"    @{}: {}:0x{:04x} {}",
				entry.ordinal,
				entry.segment + 1,
				entry.offset,
				name
			);
		}
	}

	if !stubs.is_empty() {
		println!("  stubbed imports:");
		for stub in stubs.iter() {
			if stub.name.is_empty() {
				println!("    {} ordinal {}", stub.module, stub.ordinal);
			} else {
				println!("    {} {}", stub.module, stub.name);
			}
		}
	}
}
