pub mod export_table;
pub mod ne_error;
pub mod ne_header;
pub mod relocation;
pub mod seg_addr;
pub mod segment_loader;
pub mod stub_table;

#[cfg(test)]
mod test_image;

// https://wiki.osdev.org/NE
// http://www.fileformat.info/format/exe/corion-ne.htm
// https://jeffpar.github.io/kbarchive/kb/065/Q65122/
