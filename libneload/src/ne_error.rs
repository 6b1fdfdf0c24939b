use thiserror::Error;

/// Failures surfaced by the loading pipeline. The embedding module table is
/// expected to abort the whole load on any of these; nothing here is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NeError {
	#[error("not an MZ executable")]
	NotMzExecutable,
	#[error("not an NE module")]
	NotNeModule,
	#[error("offset 0x{offset:x} + 0x{len:x} bytes runs past the end of the file")]
	OffsetOutOfBounds { offset: usize, len: usize },
	#[error("failed to allocate {0} bytes for a segment")]
	AllocationFailed(usize),
	#[error("entry point {segment}:0x{offset:04x} is outside the loaded segments")]
	EntryPointOutOfBounds { segment: u16, offset: u16 },
	#[error("relocation block truncated at file offset 0x{0:x}")]
	TruncatedRelocationBlock(usize),
	#[error("relocation target {segment}:0x{offset:04x} is out of range")]
	BadRelocationTarget { segment: u16, offset: u16 },
	#[error("unresolved import: {0}")]
	UnresolvedImport(String),
	#[error("unsupported relocation address type 0x{0:02x}")]
	UnsupportedAddressType(u8),
	#[error("stub table is full")]
	StubTableFull,
}
